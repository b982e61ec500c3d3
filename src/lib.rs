//! Approval routing and budget consistency core for an expense management
//! backend.
//!
//! Budgets, commitments and expenses each pass through one approval request
//! before they take financial effect. [`matrix`] derives the approver,
//! [`ledger`] records the request and its decision, [`lifecycle`] applies
//! the decision to the subject and [`funds`] keeps submitted expenses within
//! what a department can still commit. [`service::ExpenseService`] ties the
//! workflows together and [`api`] exposes them over HTTP.

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod funds;
pub mod ids;
pub mod ledger;
pub mod lifecycle;
pub mod matrix;
pub mod models;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

pub use error::{ExpenseError, Result};
