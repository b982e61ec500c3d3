//! Service layer API for the budget, commitment and expense workflows
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::directory::{Directory, non_empty};
use crate::error::{ExpenseError, Result};
use crate::funds::{self, CommittedBudget, Funds};
use crate::ids::{BudgetId, CommitmentId, DepartmentId, ExpenseId, ExpenseTypeId, LineItemId, RequestId, UserId};
use crate::ledger::{self, Decision, Ledger};
use crate::lifecycle;
use crate::matrix::ApprovalMatrix;
use crate::models::{
    ApproverRequest, Budget, Commitment, ExpenseHeader, ExpenseLineItem, ExpenseType, RequestKind,
    RequestStatus, SubjectRef,
};
use crate::store::{self, Store, Tx, TxResult, abort, require, tx_read, tx_write};
use crate::types::{Amount, TimeStamp};

/// A newly created record together with the approval request opened for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submitted<T> {
    pub record: T,
    pub request: ApproverRequest,
}

/// Changes to a commitment. Absent fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommitmentUpdate {
    pub description: Option<String>,
    pub amount: Option<Amount>,
    pub paid: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLineItem {
    pub expense_type: ExpenseTypeId,
    pub description: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemUpdate {
    pub expense_type: Option<ExpenseTypeId>,
    pub description: Option<String>,
    pub amount: Option<Amount>,
}

pub struct ExpenseService {
    store: Store,
    directory: Directory,
    matrix: ApprovalMatrix,
    ledger: Ledger,
    funds: Funds,
}

impl ExpenseService {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        let store = Store::new(instance)?;
        Ok(Self {
            directory: Directory::new(store.clone()),
            matrix: ApprovalMatrix::new(store.clone()),
            ledger: Ledger::new(store.clone()),
            funds: Funds::new(store.clone()),
            store,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn matrix(&self) -> &ApprovalMatrix {
        &self.matrix
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn funds(&self) -> &Funds {
        &self.funds
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Derives the approver for `kind` or fails before anything is written.
    fn approver_for(&self, requestor: UserId, kind: RequestKind) -> Result<UserId> {
        self.matrix
            .require_approver(requestor, kind.event_type())
            .inspect_err(|err| warn!(%requestor, %kind, error = %err, "approver derivation failed"))
    }

    fn membership_of(&self, user: UserId) -> Result<DepartmentId> {
        self.directory
            .department_of(user)?
            .ok_or_else(|| ExpenseError::not_found("department membership", user))
    }

    /// Records the approver's decision on a request.
    pub fn decide(
        &self,
        caller: UserId,
        request: RequestId,
        status: RequestStatus,
        reject_reason: Option<String>,
    ) -> Result<Decision> {
        self.ledger.transition(caller, request, status, reject_reason)
    }

    // Budgets

    /// Creates an unapproved budget and opens its Budget Approval request.
    pub fn create_budget(
        &self,
        caller: UserId,
        department: DepartmentId,
        amount: Amount,
    ) -> Result<Submitted<Budget>> {
        positive(amount)?;
        self.directory.department(department)?;
        let approver = self.approver_for(caller, RequestKind::BudgetApproval)?;

        let budget = Budget {
            id: BudgetId::new(),
            department,
            amount,
            approved: false,
            updated_at: TimeStamp::new(),
        };
        let request = self.store.transaction(|tx| {
            tx_write(tx.budgets, budget.id.as_bytes(), &budget)?;
            funds::track_budget(tx, &budget)?;
            ledger::open_request(tx, caller, approver, SubjectRef::Budget(budget.id))
        })?;

        info!(budget = %budget.id, %department, %amount, "created budget");
        Ok(Submitted {
            record: budget,
            request,
        })
    }

    /// Deletes the budget and every request referencing it.
    pub fn delete_budget(&self, id: BudgetId) -> Result<()> {
        self.delete_subject(SubjectRef::Budget(id))
    }

    pub fn budgets(&self) -> Result<Vec<Budget>> {
        store::scan(&self.store.budgets)
    }

    pub fn budget(&self, id: BudgetId) -> Result<Budget> {
        store::read(&self.store.budgets, id.as_bytes())?.ok_or_else(|| ExpenseError::not_found("budget", id))
    }

    pub fn approved_budgets(&self) -> Result<Vec<Budget>> {
        Ok(self.budgets()?.into_iter().filter(|b| b.approved).collect())
    }

    pub fn committed_budget(&self, department: DepartmentId) -> Result<CommittedBudget> {
        self.funds.committed_budget(department)
    }

    pub fn committed_budgets(&self) -> Result<Vec<CommittedBudget>> {
        self.funds.committed_budgets()
    }

    // Commitments

    /// Creates an unapproved commitment in the caller's department and opens
    /// its Commitment Approval request.
    pub fn create_commitment(
        &self,
        caller: UserId,
        description: &str,
        amount: Amount,
    ) -> Result<Submitted<Commitment>> {
        positive(amount)?;
        let description = non_empty(description, "description")?;
        let department = self.membership_of(caller)?;
        let approver = self.approver_for(caller, RequestKind::CommitmentApproval)?;

        let commitment = Commitment {
            id: CommitmentId::new(),
            requestor: caller,
            department,
            description,
            amount,
            approved: false,
            paid: false,
            created_at: TimeStamp::new(),
            approved_at: None,
        };
        let request = self.store.transaction(|tx| {
            tx_write(tx.commitments, commitment.id.as_bytes(), &commitment)?;
            funds::track_commitment(tx, &commitment)?;
            ledger::open_request(tx, caller, approver, SubjectRef::Commitment(commitment.id))
        })?;

        info!(commitment = %commitment.id, %department, %amount, "created commitment");
        Ok(Submitted {
            record: commitment,
            request,
        })
    }

    /// Edits a commitment. Description and amount can change only before
    /// approval; `paid` only after it.
    pub fn update_commitment(&self, id: CommitmentId, update: CommitmentUpdate) -> Result<Commitment> {
        if let Some(amount) = update.amount {
            positive(amount)?;
        }
        let description = update
            .description
            .as_deref()
            .map(|d| non_empty(d, "description"))
            .transpose()?;

        let commitment = self.store.transaction(|tx| {
            let mut commitment: Commitment =
                require(tx_read(tx.commitments, id.as_bytes())?, "commitment", id)?;

            if (description.is_some() || update.amount.is_some()) && commitment.approved {
                return abort(ExpenseError::InvalidInput(
                    "an approved commitment can no longer be edited".into(),
                ));
            }
            if update.paid.is_some() && !commitment.approved {
                return abort(ExpenseError::InvalidInput(
                    "only an approved commitment can be marked paid".into(),
                ));
            }

            if let Some(description) = &description {
                commitment.description = description.clone();
            }
            if let Some(amount) = update.amount {
                commitment.amount = amount;
            }
            if let Some(paid) = update.paid {
                commitment.paid = paid;
            }
            tx_write(tx.commitments, id.as_bytes(), &commitment)?;
            Ok(commitment)
        })?;

        info!(commitment = %id, paid = commitment.paid, "updated commitment");
        Ok(commitment)
    }

    /// Deletes the commitment and every request referencing it.
    pub fn delete_commitment(&self, id: CommitmentId) -> Result<()> {
        self.delete_subject(SubjectRef::Commitment(id))
    }

    pub fn commitments(&self) -> Result<Vec<Commitment>> {
        store::scan(&self.store.commitments)
    }

    pub fn commitment(&self, id: CommitmentId) -> Result<Commitment> {
        store::read(&self.store.commitments, id.as_bytes())?
            .ok_or_else(|| ExpenseError::not_found("commitment", id))
    }

    pub fn commitments_for_department(&self, department: DepartmentId) -> Result<Vec<Commitment>> {
        self.filter_commitments(|c| c.department == department)
    }

    pub fn approved_commitments(&self) -> Result<Vec<Commitment>> {
        self.filter_commitments(|c| c.approved)
    }

    pub fn unpaid_commitments(&self) -> Result<Vec<Commitment>> {
        self.filter_commitments(|c| !c.paid)
    }

    pub fn outstanding_commitments(&self, department: DepartmentId) -> Result<Amount> {
        self.funds.outstanding_commitments(department)
    }

    pub fn outstanding_by_department(&self) -> Result<BTreeMap<String, Amount>> {
        self.funds.outstanding_by_department()
    }

    fn filter_commitments(&self, keep: impl Fn(&Commitment) -> bool) -> Result<Vec<Commitment>> {
        Ok(self.commitments()?.into_iter().filter(|c| keep(c)).collect())
    }

    // Expenses

    /// Opens an empty draft expense in the caller's department.
    pub fn create_expense_header(&self, caller: UserId, description: &str) -> Result<ExpenseHeader> {
        let description = non_empty(description, "description")?;
        let department = self.membership_of(caller)?;

        let header = ExpenseHeader {
            id: ExpenseId::new(),
            requestor_id: caller,
            department,
            description,
            total_amount: Amount::ZERO,
            submitted: false,
            approved: false,
            created_at: TimeStamp::new(),
            approved_at: None,
            line_items: Vec::new(),
        };
        store::write(&self.store.expenses, header.id.as_bytes(), &header)?;
        info!(expense = %header.id, %department, "created expense header");
        Ok(header)
    }

    pub fn add_line_items(
        &self,
        caller: UserId,
        header: ExpenseId,
        items: Vec<NewLineItem>,
    ) -> Result<ExpenseHeader> {
        if items.is_empty() {
            return Err(ExpenseError::InvalidInput("no line items given".into()));
        }
        let mut prepared = Vec::with_capacity(items.len());
        for item in items {
            positive(item.amount)?;
            prepared.push(ExpenseLineItem {
                id: LineItemId::new(),
                expense_type: item.expense_type,
                description: item.description.trim().to_string(),
                amount: item.amount,
                created_at: TimeStamp::new(),
            });
        }

        self.edit_draft(caller, header, |tx, expense| {
            for item in &prepared {
                known_expense_type(tx, item.expense_type)?;
            }
            expense.line_items.extend(prepared.iter().cloned());
            Ok(())
        })
    }

    pub fn update_line_item(
        &self,
        caller: UserId,
        header: ExpenseId,
        line: LineItemId,
        update: LineItemUpdate,
    ) -> Result<ExpenseHeader> {
        if let Some(amount) = update.amount {
            positive(amount)?;
        }

        self.edit_draft(caller, header, |tx, expense| {
            if let Some(expense_type) = update.expense_type {
                known_expense_type(tx, expense_type)?;
            }
            let Some(item) = expense.line_items.iter_mut().find(|item| item.id == line) else {
                return abort(ExpenseError::not_found("line item", line));
            };
            if let Some(expense_type) = update.expense_type {
                item.expense_type = expense_type;
            }
            if let Some(description) = &update.description {
                item.description = description.trim().to_string();
            }
            if let Some(amount) = update.amount {
                item.amount = amount;
            }
            Ok(())
        })
    }

    pub fn delete_line_item(
        &self,
        caller: UserId,
        header: ExpenseId,
        line: LineItemId,
    ) -> Result<ExpenseHeader> {
        self.edit_draft(caller, header, |_, expense| {
            let before = expense.line_items.len();
            expense.line_items.retain(|item| item.id != line);
            if expense.line_items.len() == before {
                return abort(ExpenseError::not_found("line item", line));
            }
            Ok(())
        })
    }

    /// Applies `edit` to a draft owned by `caller` and recomputes its total.
    fn edit_draft<F>(&self, caller: UserId, id: ExpenseId, edit: F) -> Result<ExpenseHeader>
    where
        F: Fn(&Tx<'_>, &mut ExpenseHeader) -> TxResult<()>,
    {
        let header = self.store.transaction(|tx| {
            let mut header = owned_draft(tx, caller, id)?;
            edit(tx, &mut header)?;
            header.recompute_total().or_else(abort)?;
            tx_write(tx.expenses, id.as_bytes(), &header)?;
            Ok(header)
        })?;
        info!(expense = %id, total = %header.total_amount, items = header.line_items.len(), "edited expense");
        Ok(header)
    }

    /// Readable by the requestor and by the head of the expense's department.
    pub fn get_expense(&self, caller: UserId, id: ExpenseId) -> Result<ExpenseHeader> {
        let header: ExpenseHeader = store::read(&self.store.expenses, id.as_bytes())?
            .ok_or_else(|| ExpenseError::not_found("expense", id))?;
        if header.requestor_id == caller {
            return Ok(header);
        }
        let head = self.directory.department(header.department)?.head;
        if head == Some(caller) {
            return Ok(header);
        }
        Err(ExpenseError::Forbidden("expense"))
    }

    pub fn list_own_expenses(&self, caller: UserId) -> Result<Vec<ExpenseHeader>> {
        Ok(store::scan::<ExpenseHeader>(&self.store.expenses)?
            .into_iter()
            .filter(|header| header.requestor_id == caller)
            .collect())
    }

    /// Submits a draft for approval.
    ///
    /// The approver is derived first. The budget check, the `submitted` flag
    /// and the new request then commit together, so a refused submission
    /// leaves the draft exactly as it was.
    pub fn submit_expense(&self, caller: UserId, id: ExpenseId) -> Result<Submitted<ExpenseHeader>> {
        self.store.transaction(|tx| owned_draft(tx, caller, id).map(|_| ()))?;
        let approver = self.approver_for(caller, RequestKind::ExpenseApproval)?;

        let submitted = self.store.transaction(|tx| {
            let mut header = owned_draft(tx, caller, id)?;
            funds::ensure_within_budget(tx, &header)?;
            header.submitted = true;
            tx_write(tx.expenses, id.as_bytes(), &header)?;
            let request = ledger::open_request(tx, caller, approver, SubjectRef::Expense(id))?;
            Ok(Submitted {
                record: header,
                request,
            })
        });

        match &submitted {
            Ok(submitted) => info!(
                expense = %id,
                total = %submitted.record.total_amount,
                approver = %approver,
                "submitted expense"
            ),
            Err(err @ ExpenseError::BudgetExceeded { .. }) => {
                warn!(expense = %id, error = %err, "expense submission over budget")
            }
            Err(_) => {}
        }
        submitted
    }

    /// Deletes the expense, its line items and every request referencing it.
    pub fn delete_expense(&self, id: ExpenseId) -> Result<()> {
        self.delete_subject(SubjectRef::Expense(id))
    }

    fn delete_subject(&self, subject: SubjectRef) -> Result<()> {
        let removed = self
            .store
            .transaction(|tx| lifecycle::delete_subject(tx, subject))?;
        info!(%subject, kind = %subject.kind(), requests = removed, "deleted subject");
        Ok(())
    }
}

fn positive(amount: Amount) -> Result<()> {
    if !amount.is_positive() {
        return Err(ExpenseError::InvalidInput(format!(
            "amount must be greater than zero, got {amount}"
        )));
    }
    Ok(())
}

fn known_expense_type(tx: &Tx<'_>, id: ExpenseTypeId) -> TxResult<()> {
    require(tx_read::<ExpenseType>(tx.expense_types, id.as_bytes())?, "expense type", id).map(|_| ())
}

/// Loads an unsubmitted expense belonging to `caller`.
fn owned_draft(tx: &Tx<'_>, caller: UserId, id: ExpenseId) -> TxResult<ExpenseHeader> {
    let header: ExpenseHeader = require(tx_read(tx.expenses, id.as_bytes())?, "expense", id)?;
    if header.requestor_id != caller {
        return abort(ExpenseError::Forbidden("expense"));
    }
    if header.submitted {
        return abort(ExpenseError::AlreadySubmitted);
    }
    Ok(header)
}
