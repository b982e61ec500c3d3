//! Service configuration loaded from `config.toml`.
//!
//! Every section is optional. The `[directory]` section seeds reference data
//! (users, departments, memberships, expense types and approval matrix rows)
//! on start-up; records that already exist by name are left alone.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::matrix::NewMatrixRow;
use crate::models::{ApproverFunction, ApproverSpec};
use crate::service::ExpenseService;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub directory: DirectorySeed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/expense-approval.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySeed {
    pub users: Vec<String>,
    pub departments: Vec<SeedDepartment>,
    pub expense_types: Vec<SeedExpenseType>,
    pub approval_matrix: Vec<SeedMatrixRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedDepartment {
    pub name: String,
    /// Username of the department head.
    pub head: Option<String>,
    /// Usernames mapped to this department.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedExpenseType {
    pub name: String,
    pub description: String,
}

/// `approver` is a username for `USER` rows and a function key for
/// `FUNCTION` rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedMatrixRow {
    pub event_type: String,
    pub level: i32,
    pub derivation_type: String,
    pub approver: String,
}

impl Config {
    /// Reads the file at `path`, or returns defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

impl DirectorySeed {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.departments.is_empty()
            && self.expense_types.is_empty()
            && self.approval_matrix.is_empty()
    }

    /// Creates whatever part of the seed is missing. Matrix rows are only
    /// written into an empty matrix.
    pub fn apply(&self, service: &ExpenseService) -> anyhow::Result<()> {
        let directory = service.directory();

        for username in &self.users {
            if directory.user_by_name(username)?.is_none() {
                directory.create_user(username)?;
            }
        }

        for seed in &self.departments {
            let head = match &seed.head {
                Some(username) => Some(seed_user(service, username)?),
                None => None,
            };
            let department = match directory.department_by_name(&seed.name)? {
                Some(existing) => existing,
                None => directory.create_department(&seed.name, head)?,
            };
            if let Some(head) = head.filter(|head| department.head != Some(*head)) {
                directory.set_department_head(department.id, head)?;
            }
            for member in &seed.members {
                let member = seed_user(service, member)?;
                if directory.department_of(member)? != Some(department.id) {
                    directory.assign_membership(member, department.id)?;
                }
            }
        }

        for seed in &self.expense_types {
            if directory.expense_type_by_name(&seed.name)?.is_none() {
                directory.create_expense_type(&seed.name, &seed.description)?;
            }
        }

        if !self.approval_matrix.is_empty() && service.matrix().list()?.is_empty() {
            let mut rows = Vec::with_capacity(self.approval_matrix.len());
            for seed in &self.approval_matrix {
                let approver = match seed.derivation_type.trim().to_ascii_uppercase().as_str() {
                    "USER" => ApproverSpec::User(seed_user(service, &seed.approver)?),
                    _ => ApproverSpec::Function(seed.approver.parse::<ApproverFunction>()?),
                };
                rows.push(NewMatrixRow {
                    event_type: seed.event_type.clone(),
                    level: seed.level,
                    approver,
                });
            }
            service.matrix().create(rows)?;
        }

        info!(
            users = self.users.len(),
            departments = self.departments.len(),
            expense_types = self.expense_types.len(),
            matrix_rows = self.approval_matrix.len(),
            "applied directory seed"
        );
        Ok(())
    }
}

fn seed_user(service: &ExpenseService, username: &str) -> anyhow::Result<crate::ids::UserId> {
    let user = service
        .directory()
        .user_by_name(username)?
        .with_context(|| format!("seed refers to unknown user '{username}'"))?;
    Ok(user.id)
}
