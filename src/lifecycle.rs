//! Consequences of a decision on the record it was about, and the deletion
//! cascade between a subject and its approval requests.
use chrono::Utc;
use serde::Serialize;

use crate::error::ExpenseError;
use crate::funds;
use crate::ledger;
use crate::models::{ApproverRequest, Budget, Commitment, ExpenseHeader, RequestStatus, SubjectRef};
use crate::store::{Tx, TxResult, abort, require, tx_read, tx_remove, tx_write};
use crate::types::TimeStamp;

/// What happened to the subject when its request was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectOutcome {
    /// The subject now carries `approved = true`.
    Approved,
    /// The subject and every request referencing it were deleted.
    Discarded,
    /// The expense went back to draft and can be edited and resubmitted.
    ReturnedForEdit,
}

impl SubjectOutcome {
    pub fn message(&self, subject: &SubjectRef) -> String {
        let name = match subject {
            SubjectRef::Budget(_) => "Budget",
            SubjectRef::Commitment(_) => "Commitment",
            SubjectRef::Expense(_) => "Expense",
        };
        match self {
            SubjectOutcome::Approved => format!("{name} request approved."),
            SubjectOutcome::Discarded => format!("{name} request rejected and deleted."),
            SubjectOutcome::ReturnedForEdit => {
                format!("{name} request rejected and returned for editing.")
            }
        }
    }
}

/// Applies the decided `request` to its subject. The request must already
/// carry its terminal status.
pub(crate) fn apply_decision(tx: &Tx<'_>, request: &ApproverRequest) -> TxResult<SubjectOutcome> {
    let now = TimeStamp::<Utc>::new();
    match (request.subject, request.status) {
        (_, RequestStatus::Pending) => abort(ExpenseError::InvalidInput(
            "a pending request carries no decision".into(),
        )),
        (SubjectRef::Budget(id), RequestStatus::Approved) => {
            let mut budget: Budget = require(tx_read(tx.budgets, id.as_bytes())?, "budget", id)?;
            budget.approved = true;
            budget.updated_at = now;
            tx_write(tx.budgets, id.as_bytes(), &budget)?;
            Ok(SubjectOutcome::Approved)
        }
        (SubjectRef::Commitment(id), RequestStatus::Approved) => {
            let mut commitment: Commitment =
                require(tx_read(tx.commitments, id.as_bytes())?, "commitment", id)?;
            commitment.approved = true;
            commitment.approved_at = Some(now);
            tx_write(tx.commitments, id.as_bytes(), &commitment)?;
            Ok(SubjectOutcome::Approved)
        }
        (SubjectRef::Expense(id), RequestStatus::Approved) => {
            let mut header: ExpenseHeader =
                require(tx_read(tx.expenses, id.as_bytes())?, "expense", id)?;
            header.approved = true;
            header.approved_at = Some(now);
            tx_write(tx.expenses, id.as_bytes(), &header)?;
            Ok(SubjectOutcome::Approved)
        }
        (subject @ (SubjectRef::Budget(_) | SubjectRef::Commitment(_)), RequestStatus::Rejected) => {
            delete_subject(tx, subject)?;
            Ok(SubjectOutcome::Discarded)
        }
        (SubjectRef::Expense(id), RequestStatus::Rejected) => {
            let header: ExpenseHeader =
                require(tx_read(tx.expenses, id.as_bytes())?, "expense", id)?;
            return_to_draft(tx, header)?;
            Ok(SubjectOutcome::ReturnedForEdit)
        }
    }
}

/// Undoes what opening `request` did to its subject before the request is
/// deleted on its own. A submitted expense whose pending request goes away
/// becomes an editable draft again.
pub(crate) fn withdraw_request(tx: &Tx<'_>, request: &ApproverRequest) -> TxResult<()> {
    let (SubjectRef::Expense(id), RequestStatus::Pending) = (request.subject, request.status) else {
        return Ok(());
    };
    match tx_read::<ExpenseHeader>(tx.expenses, id.as_bytes())? {
        Some(header) => return_to_draft(tx, header),
        None => Ok(()),
    }
}

fn return_to_draft(tx: &Tx<'_>, mut header: ExpenseHeader) -> TxResult<()> {
    header.submitted = false;
    tx_write(tx.expenses, header.id.as_bytes(), &header)
}

pub(crate) fn subject_exists(tx: &Tx<'_>, subject: SubjectRef) -> TxResult<bool> {
    let found = match subject {
        SubjectRef::Budget(id) => tx.budgets.get(id.as_bytes())?,
        SubjectRef::Commitment(id) => tx.commitments.get(id.as_bytes())?,
        SubjectRef::Expense(id) => tx.expenses.get(id.as_bytes())?,
    };
    Ok(found.is_some())
}

/// Deletes the subject together with every request that references it.
/// Returns the number of requests removed.
pub(crate) fn delete_subject(tx: &Tx<'_>, subject: SubjectRef) -> TxResult<usize> {
    match subject {
        SubjectRef::Budget(id) => {
            let budget: Budget = require(tx_read(tx.budgets, id.as_bytes())?, "budget", id)?;
            tx_remove(tx.budgets, id.as_bytes())?;
            funds::untrack_budget(tx, &budget)?;
        }
        SubjectRef::Commitment(id) => {
            let commitment: Commitment =
                require(tx_read(tx.commitments, id.as_bytes())?, "commitment", id)?;
            tx_remove(tx.commitments, id.as_bytes())?;
            funds::untrack_commitment(tx, &commitment)?;
        }
        // line items live inside the header record
        SubjectRef::Expense(id) => {
            if !tx_remove(tx.expenses, id.as_bytes())? {
                return abort(ExpenseError::not_found("expense", id));
            }
        }
    }
    ledger::remove_all_for(tx, subject)
}
