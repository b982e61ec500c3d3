//! Approval request ledger.
//!
//! Each request references exactly one subject (a budget, a commitment or an
//! expense). The `subjects` index keeps, per subject, the id of its pending
//! request and the ids of every request ever opened for it. Transactions use
//! it both to refuse a second pending request and to cascade deletions,
//! since sled transactions cannot iterate a tree.
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ExpenseError, Result};
use crate::ids::{DepartmentId, RequestId, UserId};
use crate::lifecycle::{self, SubjectOutcome};
use crate::models::{ApproverRequest, Budget, RequestStatus, SubjectRef};
use crate::store::{self, Store, Tx, TxResult, abort, require, tx_read, tx_remove, tx_write};
use crate::types::TimeStamp;

#[derive(Debug, Default, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub(crate) struct SubjectRequests {
    #[n(0)]
    pub pending: Option<RequestId>,
    #[n(1)]
    pub all: Vec<RequestId>,
}

/// A decided request and what it did to its subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub request: ApproverRequest,
    pub outcome: SubjectOutcome,
}

impl Decision {
    pub fn message(&self) -> String {
        self.outcome.message(&self.request.subject)
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Opens a pending request for `subject`.
    pub fn create(
        &self,
        requestor: UserId,
        approver: UserId,
        subject: SubjectRef,
    ) -> Result<ApproverRequest> {
        let request = self
            .store
            .transaction(|tx| open_request(tx, requestor, approver, subject))?;
        info!(request = %request.id, kind = %request.kind(), %subject, "opened approval request");
        Ok(request)
    }

    /// Records the approver's decision and applies it to the subject in the
    /// same transaction.
    pub fn transition(
        &self,
        caller: UserId,
        id: RequestId,
        status: RequestStatus,
        reject_reason: Option<String>,
    ) -> Result<Decision> {
        if !status.is_terminal() {
            return Err(ExpenseError::InvalidInput(
                "a request can only move to APPROVED or REJECTED".into(),
            ));
        }

        let decision = self.store.transaction(|tx| {
            let mut request: ApproverRequest =
                require(tx_read(tx.requests, id.as_bytes())?, "approver request", id)?;
            if request.status.is_terminal() {
                return abort(ExpenseError::AlreadyDecided);
            }
            if request.approver != caller {
                return abort(ExpenseError::NotApprover);
            }

            request.status = status;
            request.approved_at = Some(TimeStamp::new());
            request.reject_reason = match status {
                RequestStatus::Rejected => Some(reject_reason.clone().unwrap_or_default()),
                _ => None,
            };

            let outcome = lifecycle::apply_decision(tx, &request)?;
            if outcome != SubjectOutcome::Discarded {
                tx_write(tx.requests, id.as_bytes(), &request)?;
                update_index(tx, request.subject, |index| {
                    if index.pending == Some(id) {
                        index.pending = None;
                    }
                })?;
            }
            Ok(Decision { request, outcome })
        });

        match &decision {
            Ok(decision) => info!(
                request = %id,
                status = ?decision.request.status,
                outcome = ?decision.outcome,
                "decided approval request"
            ),
            Err(err) => warn!(request = %id, %caller, error = %err, "approval decision refused"),
        }
        decision
    }

    /// Stamps `notified_at`; nothing else changes.
    pub fn notify(&self, id: RequestId) -> Result<ApproverRequest> {
        self.store.transaction(|tx| {
            let mut request: ApproverRequest =
                require(tx_read(tx.requests, id.as_bytes())?, "approver request", id)?;
            request.notified_at = Some(TimeStamp::<Utc>::new());
            tx_write(tx.requests, id.as_bytes(), &request)?;
            Ok(request)
        })
    }

    /// Deletes one request. The subject survives; an expense whose pending
    /// request is deleted returns to draft.
    pub fn delete(&self, id: RequestId) -> Result<()> {
        self.store.transaction(|tx| {
            let request: ApproverRequest =
                require(tx_read(tx.requests, id.as_bytes())?, "approver request", id)?;
            lifecycle::withdraw_request(tx, &request)?;
            tx_remove(tx.requests, id.as_bytes())?;
            update_index(tx, request.subject, |index| {
                index.all.retain(|other| *other != id);
                if index.pending == Some(id) {
                    index.pending = None;
                }
            })
        })?;
        info!(request = %id, "deleted approval request");
        Ok(())
    }

    /// Deletes every request referencing `subject`. Zero matches is not an error.
    pub fn delete_all_for(&self, subject: SubjectRef) -> Result<usize> {
        let removed = self.store.transaction(|tx| remove_all_for(tx, subject))?;
        info!(%subject, removed, "deleted approval requests for subject");
        Ok(removed)
    }

    pub fn all(&self) -> Result<Vec<ApproverRequest>> {
        store::scan(&self.store.requests)
    }

    pub fn get(&self, id: RequestId) -> Result<ApproverRequest> {
        store::read(&self.store.requests, id.as_bytes())?
            .ok_or_else(|| ExpenseError::not_found("approver request", id))
    }

    pub fn pending_for_approver(&self, approver: UserId) -> Result<Vec<ApproverRequest>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|request| request.status == RequestStatus::Pending && request.approver == approver)
            .collect())
    }

    /// Pending budget approval requests whose budget belongs to `department`.
    pub fn pending_for_department(&self, department: DepartmentId) -> Result<Vec<ApproverRequest>> {
        let mut pending = Vec::new();
        for request in self.all()? {
            let SubjectRef::Budget(budget) = request.subject else {
                continue;
            };
            if request.status != RequestStatus::Pending {
                continue;
            }
            let belongs = store::read::<Budget>(&self.store.budgets, budget.as_bytes())?
                .is_some_and(|budget| budget.department == department);
            if belongs {
                pending.push(request);
            }
        }
        Ok(pending)
    }

    pub fn for_subject(&self, subject: SubjectRef) -> Result<Vec<ApproverRequest>> {
        let index: SubjectRequests =
            store::read(&self.store.subjects, &subject.index_key())?.unwrap_or_default();
        let mut requests = Vec::with_capacity(index.all.len());
        for id in index.all {
            if let Some(request) = store::read(&self.store.requests, id.as_bytes())? {
                requests.push(request);
            }
        }
        Ok(requests)
    }
}

/// Writes a new pending request for `subject` and claims its pending slot.
pub(crate) fn open_request(
    tx: &Tx<'_>,
    requestor: UserId,
    approver: UserId,
    subject: SubjectRef,
) -> TxResult<ApproverRequest> {
    if tx.users.get(requestor.as_bytes())?.is_none() {
        return abort(ExpenseError::not_found("user", requestor));
    }
    if tx.users.get(approver.as_bytes())?.is_none() {
        return abort(ExpenseError::not_found("user", approver));
    }
    if !lifecycle::subject_exists(tx, subject)? {
        return abort(ExpenseError::not_found(subject.kind().subject_name(), subject));
    }

    let mut index = subject_index(tx, subject)?;
    if index.pending.is_some() {
        return abort(ExpenseError::DuplicatePending(subject.kind().subject_name()));
    }

    let request = ApproverRequest {
        id: RequestId::new(),
        requestor,
        approver,
        subject,
        status: RequestStatus::Pending,
        created_at: TimeStamp::new(),
        approved_at: None,
        notified_at: None,
        reject_reason: None,
    };
    tx_write(tx.requests, request.id.as_bytes(), &request)?;

    index.pending = Some(request.id);
    index.all.push(request.id);
    tx_write(tx.subjects, &subject.index_key(), &index)?;
    Ok(request)
}

/// Removes every request for `subject` along with its index entry.
pub(crate) fn remove_all_for(tx: &Tx<'_>, subject: SubjectRef) -> TxResult<usize> {
    let index = subject_index(tx, subject)?;
    let mut removed = 0;
    for id in &index.all {
        if tx_remove(tx.requests, id.as_bytes())? {
            removed += 1;
        }
    }
    tx_remove(tx.subjects, &subject.index_key())?;
    Ok(removed)
}

fn subject_index(tx: &Tx<'_>, subject: SubjectRef) -> TxResult<SubjectRequests> {
    Ok(tx_read(tx.subjects, &subject.index_key())?.unwrap_or_default())
}

fn update_index(
    tx: &Tx<'_>,
    subject: SubjectRef,
    change: impl FnOnce(&mut SubjectRequests),
) -> TxResult<()> {
    let mut index = subject_index(tx, subject)?;
    change(&mut index);
    tx_write(tx.subjects, &subject.index_key(), &index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::ids::BudgetId;
    use crate::types::Amount;
    use tempfile::tempdir;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        store: Store,
        ledger: Ledger,
        requestor: UserId,
        approver: UserId,
        budget: SubjectRef,
    }

    fn fixture(name: &str) -> anyhow::Result<Fixture> {
        let temp_dir = tempdir()?;
        let store = Store::open(temp_dir.path().join(name))?;
        let directory = Directory::new(store.clone());
        let requestor = directory.create_user("rae")?.id;
        let approver = directory.create_user("sol")?.id;

        let budget = Budget {
            id: BudgetId::new(),
            department: DepartmentId::new(),
            amount: Amount::from_major(500),
            approved: false,
            updated_at: TimeStamp::new(),
        };
        store::write(&store.budgets, budget.id.as_bytes(), &budget)?;

        Ok(Fixture {
            _temp_dir: temp_dir,
            ledger: Ledger::new(store.clone()),
            store,
            requestor,
            approver,
            budget: SubjectRef::Budget(budget.id),
        })
    }

    #[test]
    fn second_pending_request_is_refused() -> anyhow::Result<()> {
        let f = fixture("ledger_dup.db")?;
        f.ledger.create(f.requestor, f.approver, f.budget)?;

        assert!(matches!(
            f.ledger.create(f.requestor, f.approver, f.budget),
            Err(ExpenseError::DuplicatePending("budget"))
        ));
        Ok(())
    }

    #[test]
    fn unknown_subject_or_user_is_not_found() -> anyhow::Result<()> {
        let f = fixture("ledger_missing.db")?;

        assert!(matches!(
            f.ledger
                .create(f.requestor, f.approver, SubjectRef::Budget(BudgetId::new())),
            Err(ExpenseError::NotFound { entity: "budget", .. })
        ));
        assert!(matches!(
            f.ledger.create(f.requestor, UserId::new(), f.budget),
            Err(ExpenseError::NotFound { entity: "user", .. })
        ));
        Ok(())
    }

    #[test]
    fn only_the_approver_decides_and_only_once() -> anyhow::Result<()> {
        let f = fixture("ledger_decide.db")?;
        let request = f.ledger.create(f.requestor, f.approver, f.budget)?;

        assert!(matches!(
            f.ledger
                .transition(f.requestor, request.id, RequestStatus::Approved, None),
            Err(ExpenseError::NotApprover)
        ));
        assert!(matches!(
            f.ledger
                .transition(f.approver, request.id, RequestStatus::Pending, None),
            Err(ExpenseError::InvalidInput(_))
        ));

        let decision = f
            .ledger
            .transition(f.approver, request.id, RequestStatus::Approved, None)?;
        assert_eq!(decision.outcome, SubjectOutcome::Approved);
        assert!(decision.request.approved_at.is_some());
        assert_eq!(decision.request.reject_reason, None);

        assert!(matches!(
            f.ledger
                .transition(f.approver, request.id, RequestStatus::Rejected, None),
            Err(ExpenseError::AlreadyDecided)
        ));

        // the slot is free again once decided
        f.ledger.create(f.requestor, f.approver, f.budget)?;
        Ok(())
    }

    #[test]
    fn failed_decision_leaves_the_request_pending() -> anyhow::Result<()> {
        let f = fixture("ledger_rollback.db")?;
        let request = f.ledger.create(f.requestor, f.approver, f.budget)?;
        let SubjectRef::Budget(budget) = f.budget else {
            unreachable!()
        };
        f.store.budgets.remove(budget.as_bytes())?;

        assert!(matches!(
            f.ledger
                .transition(f.approver, request.id, RequestStatus::Approved, None),
            Err(ExpenseError::NotFound { entity: "budget", .. })
        ));
        let stored = f.ledger.get(request.id)?;
        assert_eq!(stored.status, RequestStatus::Pending);
        assert_eq!(stored.approved_at, None);
        assert_eq!(stored.reject_reason, None);
        Ok(())
    }

    #[test]
    fn delete_frees_the_pending_slot() -> anyhow::Result<()> {
        let f = fixture("ledger_delete.db")?;
        let request = f.ledger.create(f.requestor, f.approver, f.budget)?;

        f.ledger.delete(request.id)?;
        assert!(matches!(
            f.ledger.delete(request.id),
            Err(ExpenseError::NotFound { .. })
        ));
        assert!(f.ledger.for_subject(f.budget)?.is_empty());

        f.ledger.create(f.requestor, f.approver, f.budget)?;
        assert_eq!(f.ledger.delete_all_for(f.budget)?, 1);
        assert_eq!(f.ledger.delete_all_for(f.budget)?, 0);
        assert!(store::scan::<ApproverRequest>(&f.store.requests)?.is_empty());
        Ok(())
    }
}
