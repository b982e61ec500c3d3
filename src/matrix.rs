//! Approval matrix: configuration rows mapping an event type to an approver,
//! and the resolver that picks one approver for a requestor.
use sled::Batch;
use tracing::{debug, info};

use crate::directory::{Directory, non_empty};
use crate::error::{ExpenseError, Result};
use crate::ids::{MatrixId, UserId};
use crate::models::{ApprovalMatrixRow, ApproverFunction, ApproverSpec};
use crate::store::{self, Store};

/// Input for a new or replaced matrix row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMatrixRow {
    pub event_type: String,
    pub level: i32,
    pub approver: ApproverSpec,
}

#[derive(Clone)]
pub struct ApprovalMatrix {
    store: Store,
    directory: Directory,
}

impl ApprovalMatrix {
    pub fn new(store: Store) -> Self {
        Self {
            directory: Directory::new(store.clone()),
            store,
        }
    }

    /// Resolves the approver for `event_type` on behalf of `requestor`.
    ///
    /// Rows are tried in ascending level, then in creation order. A
    /// department-head row yields nothing when the requestor has no
    /// department or the department has no head, and the next row is tried.
    pub fn derive_approver(&self, requestor: UserId, event_type: &str) -> Result<Option<UserId>> {
        for row in self.rows_for(event_type)? {
            let approver = match row.approver {
                ApproverSpec::User(user) => Some(user),
                ApproverSpec::Function(ApproverFunction::DepartmentHead) => {
                    self.directory.department_head_of(requestor)?
                }
            };
            if let Some(approver) = approver {
                debug!(%requestor, %approver, event_type, level = row.level, "derived approver");
                return Ok(Some(approver));
            }
        }
        Ok(None)
    }

    /// Like [`derive_approver`](Self::derive_approver) but fails with
    /// `DerivationFailed` when no row yields an approver.
    pub fn require_approver(&self, requestor: UserId, event_type: &str) -> Result<UserId> {
        self.derive_approver(requestor, event_type)?
            .ok_or_else(|| ExpenseError::DerivationFailed {
                event: event_type.to_string(),
            })
    }

    fn rows_for(&self, event_type: &str) -> Result<Vec<ApprovalMatrixRow>> {
        let mut rows: Vec<ApprovalMatrixRow> = self
            .list()?
            .into_iter()
            .filter(|row| row.event_type == event_type)
            .collect();
        // stable: equal levels keep key (creation) order
        rows.sort_by_key(|row| row.level);
        Ok(rows)
    }

    /// Inserts every row or none of them.
    pub fn create(&self, rows: Vec<NewMatrixRow>) -> Result<Vec<ApprovalMatrixRow>> {
        if rows.is_empty() {
            return Err(ExpenseError::InvalidInput(
                "at least one approval matrix row is required".into(),
            ));
        }

        let mut created = Vec::with_capacity(rows.len());
        let mut batch = Batch::default();
        for row in rows {
            let row = ApprovalMatrixRow {
                id: MatrixId::new(),
                event_type: non_empty(&row.event_type, "approval event type")?,
                level: row.level,
                approver: row.approver,
            };
            batch.insert(row.id.as_bytes(), minicbor::to_vec(&row)?);
            created.push(row);
        }
        self.store.matrix.apply_batch(batch)?;

        info!(rows = created.len(), "created approval matrix rows");
        Ok(created)
    }

    pub fn list(&self) -> Result<Vec<ApprovalMatrixRow>> {
        store::scan(&self.store.matrix)
    }

    pub fn get(&self, id: MatrixId) -> Result<ApprovalMatrixRow> {
        store::read(&self.store.matrix, id.as_bytes())?
            .ok_or_else(|| ExpenseError::not_found("approval matrix row", id))
    }

    pub fn by_event_and_level(&self, event_type: &str, level: i32) -> Result<Vec<ApprovalMatrixRow>> {
        let rows: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|row| row.event_type == event_type && row.level == level)
            .collect();
        if rows.is_empty() {
            return Err(ExpenseError::not_found(
                "approval matrix row",
                format!("{event_type} level {level}"),
            ));
        }
        Ok(rows)
    }

    pub fn update(&self, id: MatrixId, row: NewMatrixRow) -> Result<ApprovalMatrixRow> {
        self.get(id)?;
        let row = ApprovalMatrixRow {
            id,
            event_type: non_empty(&row.event_type, "approval event type")?,
            level: row.level,
            approver: row.approver,
        };
        store::write(&self.store.matrix, id.as_bytes(), &row)?;
        info!(row = %id, "updated approval matrix row");
        Ok(row)
    }

    pub fn delete(&self, id: MatrixId) -> Result<()> {
        if self.store.matrix.remove(id.as_bytes())?.is_none() {
            return Err(ExpenseError::not_found("approval matrix row", id));
        }
        info!(row = %id, "deleted approval matrix row");
        Ok(())
    }
}
