//! Committed budget calculation and the expense submission guard.
//!
//! The committable amount of a department is its latest approved budget minus
//! the commitments that are approved and still unpaid. It is never stored;
//! every caller recomputes it inside its own transaction from the rows listed
//! in the department's funds index, so a concurrent change to any of those
//! rows conflicts with the reader.
use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::error::{ExpenseError, Result};
use crate::ids::{BudgetId, CommitmentId, DepartmentId};
use crate::models::{Budget, Commitment, Department, ExpenseHeader};
use crate::store::{self, Store, Tx, TxResult, abort, tx_read, tx_write};
use crate::types::{Amount, TimeStamp};

/// Budget and commitment rows that belong to one department.
#[derive(Debug, Default, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub(crate) struct DepartmentFunds {
    #[n(0)]
    pub budgets: Vec<BudgetId>,
    #[n(1)]
    pub commitments: Vec<CommitmentId>,
}

/// A department's spendable ceiling at the time of the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedBudget {
    pub budget_id: BudgetId,
    pub department: DepartmentId,
    pub department_name: String,
    pub budget_amount: Amount,
    pub outstanding_commitments: Amount,
    pub remaining: Amount,
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Clone)]
pub struct Funds {
    store: Store,
}

impl Funds {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Latest approved budget minus approved, unpaid commitments.
    pub fn committed_remaining(&self, department: DepartmentId) -> Result<Amount> {
        let remaining = self
            .store
            .transaction(|tx| committed_remaining_in(tx, department))?;
        debug!(%department, %remaining, "computed committed budget");
        Ok(remaining)
    }

    /// Full breakdown for one department, NotFound without an approved budget.
    pub fn committed_budget(&self, department: DepartmentId) -> Result<CommittedBudget> {
        let name = store::read::<Department>(&self.store.departments, department.as_bytes())?
            .map(|d| d.name)
            .unwrap_or_default();

        self.store.transaction(|tx| {
            let funds = department_funds(tx, department)?;
            let budget = latest_approved(tx, &funds)?;
            let budget = store::require(budget, "approved budget for department", department)?;
            let outstanding = outstanding_total(tx, &funds)?;
            let remaining = subtract(budget.amount, outstanding)?;

            Ok(CommittedBudget {
                budget_id: budget.id,
                department,
                department_name: name.clone(),
                budget_amount: budget.amount,
                outstanding_commitments: outstanding,
                remaining,
                updated_at: budget.updated_at,
            })
        })
    }

    /// Committed budgets of every department that has an approved budget.
    pub fn committed_budgets(&self) -> Result<Vec<CommittedBudget>> {
        let mut all = Vec::new();
        for department in store::scan::<Department>(&self.store.departments)? {
            match self.committed_budget(department.id) {
                Ok(committed) => all.push(committed),
                Err(ExpenseError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(all)
    }

    /// The approved budget with the latest `updated_at` for the department.
    pub fn latest_approved_budget(&self, department: DepartmentId) -> Result<Budget> {
        self.store.transaction(|tx| {
            let funds = department_funds(tx, department)?;
            let budget = latest_approved(tx, &funds)?;
            store::require(budget, "approved budget for department", department)
        })
    }

    pub fn latest_approved_budgets(&self) -> Result<Vec<Budget>> {
        let mut latest = Vec::new();
        for department in store::scan::<Department>(&self.store.departments)? {
            match self.latest_approved_budget(department.id) {
                Ok(budget) => latest.push(budget),
                Err(ExpenseError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(latest)
    }

    /// Sum of approved, unpaid commitments for one department.
    pub fn outstanding_commitments(&self, department: DepartmentId) -> Result<Amount> {
        self.store.transaction(|tx| {
            let funds = department_funds(tx, department)?;
            outstanding_total(tx, &funds)
        })
    }

    /// Approved, unpaid commitment totals keyed by department name.
    pub fn outstanding_by_department(&self) -> Result<BTreeMap<String, Amount>> {
        let names: BTreeMap<DepartmentId, String> =
            store::scan::<Department>(&self.store.departments)?
                .into_iter()
                .map(|d| (d.id, d.name))
                .collect();

        let mut totals: BTreeMap<String, Amount> = BTreeMap::new();
        for commitment in store::scan::<Commitment>(&self.store.commitments)? {
            if !commitment.is_outstanding() {
                continue;
            }
            let name = names
                .get(&commitment.department)
                .cloned()
                .unwrap_or_else(|| commitment.department.to_string());
            let entry = totals.entry(name).or_default();
            *entry = Amount::total([*entry, commitment.amount])?;
        }
        Ok(totals)
    }
}

/// Fails with `BudgetExceeded` when the header total is above what the
/// department can still commit. Returns the ceiling that was checked.
pub(crate) fn ensure_within_budget(tx: &Tx<'_>, header: &ExpenseHeader) -> TxResult<Amount> {
    let available = committed_remaining_in(tx, header.department)?;
    if header.total_amount > available {
        return abort(ExpenseError::BudgetExceeded {
            requested: header.total_amount,
            available,
        });
    }
    Ok(available)
}

pub(crate) fn committed_remaining_in(tx: &Tx<'_>, department: DepartmentId) -> TxResult<Amount> {
    let funds = department_funds(tx, department)?;
    let budget = latest_approved(tx, &funds)?;
    let budget = store::require(budget, "approved budget for department", department)?;
    let outstanding = outstanding_total(tx, &funds)?;
    subtract(budget.amount, outstanding)
}

fn subtract(budget: Amount, outstanding: Amount) -> TxResult<Amount> {
    match budget.checked_sub(outstanding) {
        Some(remaining) => Ok(remaining),
        None => abort(ExpenseError::InvalidInput("amount overflow".into())),
    }
}

fn department_funds(tx: &Tx<'_>, department: DepartmentId) -> TxResult<DepartmentFunds> {
    Ok(tx_read(tx.funds, department.as_bytes())?.unwrap_or_default())
}

fn latest_approved(tx: &Tx<'_>, funds: &DepartmentFunds) -> TxResult<Option<Budget>> {
    let mut latest: Option<Budget> = None;
    for id in &funds.budgets {
        let Some(budget) = tx_read::<Budget>(tx.budgets, id.as_bytes())? else {
            continue;
        };
        if !budget.approved {
            continue;
        }
        let newer = match &latest {
            Some(current) => {
                (budget.updated_at.to_datetime_utc(), budget.id)
                    > (current.updated_at.to_datetime_utc(), current.id)
            }
            None => true,
        };
        if newer {
            latest = Some(budget);
        }
    }
    Ok(latest)
}

fn outstanding_total(tx: &Tx<'_>, funds: &DepartmentFunds) -> TxResult<Amount> {
    let mut amounts = Vec::with_capacity(funds.commitments.len());
    for id in &funds.commitments {
        if let Some(commitment) = tx_read::<Commitment>(tx.commitments, id.as_bytes())? {
            if commitment.is_outstanding() {
                amounts.push(commitment.amount);
            }
        }
    }
    Amount::total(amounts).or_else(abort)
}

fn update_funds(
    tx: &Tx<'_>,
    department: DepartmentId,
    change: impl FnOnce(&mut DepartmentFunds),
) -> TxResult<()> {
    let mut funds = department_funds(tx, department)?;
    change(&mut funds);
    tx_write(tx.funds, department.as_bytes(), &funds)
}

pub(crate) fn track_budget(tx: &Tx<'_>, budget: &Budget) -> TxResult<()> {
    update_funds(tx, budget.department, |funds| funds.budgets.push(budget.id))
}

pub(crate) fn untrack_budget(tx: &Tx<'_>, budget: &Budget) -> TxResult<()> {
    update_funds(tx, budget.department, |funds| {
        funds.budgets.retain(|id| *id != budget.id)
    })
}

pub(crate) fn track_commitment(tx: &Tx<'_>, commitment: &Commitment) -> TxResult<()> {
    update_funds(tx, commitment.department, |funds| {
        funds.commitments.push(commitment.id)
    })
}

pub(crate) fn untrack_commitment(tx: &Tx<'_>, commitment: &Commitment) -> TxResult<()> {
    update_funds(tx, commitment.department, |funds| {
        funds.commitments.retain(|id| *id != commitment.id)
    })
}
