//! sled persistence: one tree per record kind plus two index trees.
//!
//! Multi-step units run through [`Store::transaction`], which opens a sled
//! transaction over every tree a workflow can touch. sled transactions are
//! serializable over the keys they read and write, which is what the budget
//! guard and the decision path rely on.
use std::path::Path;
use std::sync::Arc;

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::{Transactional, Tree};

use crate::error::{ExpenseError, Result};

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, ExpenseError>;

#[derive(Clone)]
pub struct Store {
    db: Arc<sled::Db>,
    pub(crate) users: Tree,
    pub(crate) departments: Tree,
    pub(crate) memberships: Tree,
    pub(crate) expense_types: Tree,
    pub(crate) matrix: Tree,
    pub(crate) requests: Tree,
    pub(crate) subjects: Tree,
    pub(crate) budgets: Tree,
    pub(crate) commitments: Tree,
    pub(crate) expenses: Tree,
    pub(crate) funds: Tree,
}

/// Transactional views handed to a unit of work.
pub(crate) struct Tx<'a> {
    pub users: &'a TransactionalTree,
    pub departments: &'a TransactionalTree,
    pub memberships: &'a TransactionalTree,
    pub expense_types: &'a TransactionalTree,
    pub requests: &'a TransactionalTree,
    pub subjects: &'a TransactionalTree,
    pub budgets: &'a TransactionalTree,
    pub commitments: &'a TransactionalTree,
    pub expenses: &'a TransactionalTree,
    pub funds: &'a TransactionalTree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn new(db: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            users: db.open_tree("users")?,
            departments: db.open_tree("departments")?,
            memberships: db.open_tree("memberships")?,
            expense_types: db.open_tree("expense_types")?,
            matrix: db.open_tree("approval_matrix")?,
            requests: db.open_tree("approver_requests")?,
            subjects: db.open_tree("subjects")?,
            budgets: db.open_tree("budgets")?,
            commitments: db.open_tree("commitments")?,
            expenses: db.open_tree("expenses")?,
            funds: db.open_tree("department_funds")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Runs `unit` atomically. The closure may be re-run on conflict, so it
    /// must not have effects outside the transaction.
    pub(crate) fn transaction<T, F>(&self, unit: F) -> Result<T>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        let trees = (
            &self.users,
            &self.departments,
            &self.memberships,
            &self.expense_types,
            &self.requests,
            &self.subjects,
            &self.budgets,
            &self.commitments,
            &self.expenses,
            &self.funds,
        );

        trees
            .transaction(
                |(
                    users,
                    departments,
                    memberships,
                    expense_types,
                    requests,
                    subjects,
                    budgets,
                    commitments,
                    expenses,
                    funds,
                )| {
                    unit(&Tx {
                        users,
                        departments,
                        memberships,
                        expense_types,
                        requests,
                        subjects,
                        budgets,
                        commitments,
                        expenses,
                        funds,
                    })
                },
            )
            .map_err(ExpenseError::from)
    }
}

pub(crate) fn read<T>(tree: &Tree, key: &[u8]) -> Result<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn write<T: minicbor::Encode<()>>(tree: &Tree, key: &[u8], value: &T) -> Result<()> {
    tree.insert(key, minicbor::to_vec(value)?)?;
    Ok(())
}

/// Decodes every value of the tree in key order.
pub(crate) fn scan<T>(tree: &Tree) -> Result<Vec<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    tree.iter()
        .values()
        .map(|value| -> Result<T> { Ok(minicbor::decode(&value?)?) })
        .collect()
}

pub(crate) fn abort<T>(err: ExpenseError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

/// Unwraps a looked-up record or aborts with `NotFound`.
pub(crate) fn require<T>(found: Option<T>, entity: &'static str, id: impl ToString) -> TxResult<T> {
    found.ok_or_else(|| ConflictableTransactionError::Abort(ExpenseError::not_found(entity, id)))
}

pub(crate) fn tx_read<T>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(bytes) => minicbor::decode(&bytes)
            .map(Some)
            .map_err(|err| ConflictableTransactionError::Abort(err.into())),
        None => Ok(None),
    }
}

pub(crate) fn tx_write<T: minicbor::Encode<()>>(
    tree: &TransactionalTree,
    key: &[u8],
    value: &T,
) -> TxResult<()> {
    let bytes =
        minicbor::to_vec(value).map_err(|err| ConflictableTransactionError::Abort(err.into()))?;
    tree.insert(key, bytes)?;
    Ok(())
}

/// Removes the key, reporting whether it was present.
pub(crate) fn tx_remove(tree: &TransactionalTree, key: &[u8]) -> TxResult<bool> {
    Ok(tree.remove(key)?.is_some())
}
