//! Property-based tests for the committed budget calculation
//!
//! Random sequences of budgets and commitments are pushed through the real
//! approval workflow, then the committed remaining amount and the outcome of
//! an expense submission are checked against a model computed directly from
//! the generated inputs.

use proptest::prelude::*;
use tempfile::tempdir;

use expense_approval::ExpenseError;
use expense_approval::matrix::NewMatrixRow;
use expense_approval::models::{ApproverSpec, RequestStatus};
use expense_approval::service::{CommitmentUpdate, ExpenseService, NewLineItem};
use expense_approval::types::Amount;

// PROPERTY TEST STRATEGIES

/// (amount in cents, approved)
fn budgets_strategy() -> impl Strategy<Value = Vec<(i64, bool)>> {
    prop::collection::vec((1i64..=5_000_000, prop::bool::ANY), 0..4)
}

/// (amount in cents, approved, paid)
fn commitments_strategy() -> impl Strategy<Value = Vec<(i64, bool, bool)>> {
    prop::collection::vec((1i64..=1_000_000, prop::bool::ANY, prop::bool::ANY), 0..5)
}

struct Observed {
    remaining: Result<Amount, ExpenseError>,
    submitted: Result<(), ExpenseError>,
}

fn run_workflow(
    budgets: &[(i64, bool)],
    commitments: &[(i64, bool, bool)],
    expense: i64,
) -> anyhow::Result<Observed> {
    let temp_dir = tempdir()?;
    let service = ExpenseService::open(temp_dir.path().join("prop.db"))?;
    let directory = service.directory();
    let member = directory.create_user("member")?.id;
    let approver = directory.create_user("approver")?.id;
    let dept = directory.create_department("Research", None)?.id;
    directory.assign_membership(member, dept)?;
    let kind = directory.create_expense_type("Equipment", "")?.id;
    service.matrix().create(
        ["Budget", "Commitment", "Expense"]
            .into_iter()
            .map(|event_type| NewMatrixRow {
                event_type: event_type.into(),
                level: 0,
                approver: ApproverSpec::User(approver),
            })
            .collect(),
    )?;

    for &(cents, approve) in budgets {
        let budget = service.create_budget(member, dept, Amount::from_minor(cents))?;
        if approve {
            service.decide(approver, budget.request.id, RequestStatus::Approved, None)?;
        }
    }

    for &(cents, approve, paid) in commitments {
        let commitment = service.create_commitment(member, "Kit", Amount::from_minor(cents))?;
        if approve {
            service.decide(approver, commitment.request.id, RequestStatus::Approved, None)?;
            if paid {
                service.update_commitment(
                    commitment.record.id,
                    CommitmentUpdate {
                        paid: Some(true),
                        ..Default::default()
                    },
                )?;
            }
        }
    }

    let header = service.create_expense_header(member, "Purchase")?;
    service.add_line_items(
        member,
        header.id,
        vec![NewLineItem {
            expense_type: kind,
            description: "Item".into(),
            amount: Amount::from_minor(expense),
        }],
    )?;

    Ok(Observed {
        remaining: service.funds().committed_remaining(dept),
        submitted: service.submit_expense(member, header.id).map(|_| ()),
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Remaining is the latest approved budget minus approved, unpaid
    /// commitments, and a submission passes exactly when it fits.
    #[test]
    fn remaining_matches_model_and_gates_submission(
        budgets in budgets_strategy(),
        commitments in commitments_strategy(),
        expense in 1i64..=6_000_000,
    ) {
        let observed = run_workflow(&budgets, &commitments, expense).unwrap();

        // budgets are approved in creation order, so the last approved one is the latest
        let latest = budgets.iter().rev().find(|(_, approved)| *approved).map(|(cents, _)| *cents);
        let outstanding: i64 = commitments
            .iter()
            .filter(|(_, approved, paid)| *approved && !*paid)
            .map(|(cents, _, _)| *cents)
            .sum();

        match latest {
            None => {
                let no_remaining = matches!(observed.remaining, Err(ExpenseError::NotFound { .. }));
                let no_submission = matches!(observed.submitted, Err(ExpenseError::NotFound { .. }));
                prop_assert!(no_remaining);
                prop_assert!(no_submission);
            }
            Some(budget) => {
                let expected = budget - outstanding;
                prop_assert_eq!(observed.remaining.unwrap(), Amount::from_minor(expected));
                if expense <= expected {
                    prop_assert!(observed.submitted.is_ok());
                } else {
                    let refused = matches!(observed.submitted, Err(ExpenseError::BudgetExceeded { .. }));
                    prop_assert!(refused);
                }
            }
        }
    }

    /// Decimal text with at most two fraction digits parses to the exact
    /// number of cents.
    #[test]
    fn amount_text_is_exact(whole in 0i64..=1_000_000_000, cents in 0i64..100) {
        let text = format!("{whole}.{cents:02}");
        let amount: Amount = text.parse().unwrap();
        prop_assert_eq!(amount.minor_units(), whole * 100 + cents);
        prop_assert_eq!(amount.to_string(), text);
    }
}
