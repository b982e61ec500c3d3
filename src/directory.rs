//! Reference data: users, departments, memberships and expense types.
//!
//! Authentication and full CRUD for these records live outside this crate;
//! the directory offers the minimum the approval core needs to resolve
//! identities, department heads and expense types.
use tracing::info;

use crate::error::{ExpenseError, Result};
use crate::ids::{DepartmentId, ExpenseTypeId, UserId};
use crate::models::{Department, ExpenseType, User};
use crate::store::{self, Store};

#[derive(Clone)]
pub struct Directory {
    store: Store,
}

impl Directory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn create_user(&self, username: &str) -> Result<User> {
        let username = non_empty(username, "username")?;
        if self.user_by_name(&username)?.is_some() {
            return Err(ExpenseError::InvalidInput(format!(
                "username '{username}' is taken"
            )));
        }

        let user = User {
            id: UserId::new(),
            username,
        };
        store::write(&self.store.users, user.id.as_bytes(), &user)?;
        info!(user = %user.id, username = %user.username, "created user");
        Ok(user)
    }

    pub fn user(&self, id: UserId) -> Result<User> {
        store::read(&self.store.users, id.as_bytes())?.ok_or_else(|| ExpenseError::not_found("user", id))
    }

    pub fn user_by_name(&self, username: &str) -> Result<Option<User>> {
        Ok(store::scan::<User>(&self.store.users)?
            .into_iter()
            .find(|user| user.username == username))
    }

    pub fn users(&self) -> Result<Vec<User>> {
        store::scan(&self.store.users)
    }

    pub fn create_department(&self, name: &str, head: Option<UserId>) -> Result<Department> {
        let name = non_empty(name, "department name")?;
        if self.department_by_name(&name)?.is_some() {
            return Err(ExpenseError::InvalidInput(format!(
                "department '{name}' already exists"
            )));
        }
        if let Some(head) = head {
            self.user(head)?;
        }

        let department = Department {
            id: DepartmentId::new(),
            name,
            head,
        };
        store::write(&self.store.departments, department.id.as_bytes(), &department)?;
        info!(department = %department.id, name = %department.name, "created department");
        Ok(department)
    }

    pub fn set_department_head(&self, department: DepartmentId, head: UserId) -> Result<Department> {
        self.user(head)?;
        let mut record = self.department(department)?;
        record.head = Some(head);
        store::write(&self.store.departments, department.as_bytes(), &record)?;
        Ok(record)
    }

    pub fn department(&self, id: DepartmentId) -> Result<Department> {
        store::read(&self.store.departments, id.as_bytes())?
            .ok_or_else(|| ExpenseError::not_found("department", id))
    }

    pub fn department_by_name(&self, name: &str) -> Result<Option<Department>> {
        Ok(store::scan::<Department>(&self.store.departments)?
            .into_iter()
            .find(|department| department.name == name))
    }

    pub fn departments(&self) -> Result<Vec<Department>> {
        store::scan(&self.store.departments)
    }

    /// Maps a user to their (single) department, replacing any earlier mapping.
    pub fn assign_membership(&self, user: UserId, department: DepartmentId) -> Result<()> {
        self.user(user)?;
        self.department(department)?;
        store::write(&self.store.memberships, user.as_bytes(), &department)?;
        info!(%user, %department, "assigned department membership");
        Ok(())
    }

    pub fn department_of(&self, user: UserId) -> Result<Option<DepartmentId>> {
        store::read(&self.store.memberships, user.as_bytes())
    }

    /// Head of the requestor's department, if both the mapping and a head exist.
    pub fn department_head_of(&self, user: UserId) -> Result<Option<UserId>> {
        let Some(department) = self.department_of(user)? else {
            return Ok(None);
        };
        Ok(store::read::<Department>(&self.store.departments, department.as_bytes())?
            .and_then(|department| department.head))
    }

    pub fn create_expense_type(&self, name: &str, description: &str) -> Result<ExpenseType> {
        let name = non_empty(name, "expense type name")?;
        if self.expense_type_by_name(&name)?.is_some() {
            return Err(ExpenseError::InvalidInput(format!(
                "expense type '{name}' already exists"
            )));
        }

        let expense_type = ExpenseType {
            id: ExpenseTypeId::new(),
            name,
            description: description.trim().to_string(),
        };
        store::write(&self.store.expense_types, expense_type.id.as_bytes(), &expense_type)?;
        Ok(expense_type)
    }

    pub fn expense_type(&self, id: ExpenseTypeId) -> Result<ExpenseType> {
        store::read(&self.store.expense_types, id.as_bytes())?
            .ok_or_else(|| ExpenseError::not_found("expense type", id))
    }

    pub fn expense_type_by_name(&self, name: &str) -> Result<Option<ExpenseType>> {
        Ok(store::scan::<ExpenseType>(&self.store.expense_types)?
            .into_iter()
            .find(|expense_type| expense_type.name == name))
    }

    pub fn expense_types(&self) -> Result<Vec<ExpenseType>> {
        store::scan(&self.store.expense_types)
    }
}

pub(crate) fn non_empty(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ExpenseError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}
