//! End-to-end workflow scenarios against a real sled database.

use anyhow::Context;
use sled::open;
use std::sync::Arc;

use expense_approval::ExpenseError;
use expense_approval::ids::{DepartmentId, ExpenseTypeId, UserId};
use expense_approval::lifecycle::SubjectOutcome;
use expense_approval::matrix::NewMatrixRow;
use expense_approval::models::{ApproverFunction, ApproverSpec, RequestStatus, SubjectRef};
use expense_approval::service::{CommitmentUpdate, ExpenseService, LineItemUpdate, NewLineItem};
use expense_approval::types::Amount;

use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

/// One department with a head and a member, plus an approval matrix that
/// sends every event type to the department head.
struct Org {
    _temp_dir: TempDir,
    service: ExpenseService,
    member: UserId,
    head: UserId,
    finance: DepartmentId,
    travel: ExpenseTypeId,
}

fn org(name: &str) -> anyhow::Result<Org> {
    // sled locks its directory, so every test gets its own database.
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join(name))?);
    let service = ExpenseService::new(db)?;

    let directory = service.directory();
    let member = directory.create_user("member")?.id;
    let head = directory.create_user("head")?.id;
    let finance = directory.create_department("Finance", Some(head))?.id;
    directory.assign_membership(member, finance)?;
    let travel = directory.create_expense_type("Travel", "Trains, flights and hotels")?.id;

    service.matrix().create(
        ["Budget", "Commitment", "Expense"]
            .into_iter()
            .map(|event_type| NewMatrixRow {
                event_type: event_type.into(),
                level: 1,
                approver: ApproverSpec::Function(ApproverFunction::DepartmentHead),
            })
            .collect(),
    )?;

    Ok(Org {
        _temp_dir: temp_dir,
        service,
        member,
        head,
        finance,
        travel,
    })
}

impl Org {
    fn approved_budget(&self, amount: Amount) -> anyhow::Result<()> {
        let budget = self.service.create_budget(self.member, self.finance, amount)?;
        self.service
            .decide(self.head, budget.request.id, RequestStatus::Approved, None)
            .context("Budget Failed on Approval: ")?;
        Ok(())
    }

    fn approved_commitment(&self, amount: Amount) -> anyhow::Result<expense_approval::ids::CommitmentId> {
        let commitment = self.service.create_commitment(self.member, "Annual licences", amount)?;
        self.service
            .decide(self.head, commitment.request.id, RequestStatus::Approved, None)
            .context("Commitment Failed on Approval: ")?;
        Ok(commitment.record.id)
    }

    fn line(&self, amount: Amount) -> NewLineItem {
        NewLineItem {
            expense_type: self.travel,
            description: "Conference trip".into(),
            amount,
        }
    }
}

#[test]
fn submission_is_capped_by_committed_budget() -> anyhow::Result<()> {
    let org = org("test_committed_budget.db")?;
    org.approved_budget(Amount::from_major(10_000))?;
    org.approved_commitment(Amount::from_major(3_000))?;

    assert_eq!(
        org.service.funds().committed_remaining(org.finance)?,
        Amount::from_major(7_000)
    );

    let header = org.service.create_expense_header(org.member, "Q3 travel")?;
    let header = org
        .service
        .add_line_items(org.member, header.id, vec![org.line("7000.01".parse()?)])?;
    assert_eq!(header.total_amount, Amount::from_minor(700_001));

    let refused = org.service.submit_expense(org.member, header.id);
    assert!(matches!(refused, Err(ExpenseError::BudgetExceeded { .. })));
    assert!(!org.service.get_expense(org.member, header.id)?.submitted);
    assert!(
        org.service
            .ledger()
            .for_subject(SubjectRef::Expense(header.id))?
            .is_empty()
    );

    let line = header.line_items[0].id;
    org.service.update_line_item(
        org.member,
        header.id,
        line,
        LineItemUpdate {
            amount: Some("7000.00".parse()?),
            ..Default::default()
        },
    )?;

    let submitted = org
        .service
        .submit_expense(org.member, header.id)
        .context("Expense Failed on Submit: ")?;
    assert!(submitted.record.submitted);
    assert_eq!(submitted.request.approver, org.head);

    let requests = org.service.ledger().for_subject(SubjectRef::Expense(header.id))?;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].status, RequestStatus::Pending);
    assert_eq!(requests[0].subject.kind().label(), "Expense Approval");
    Ok(())
}

#[test]
fn approving_a_budget_marks_it_approved() -> anyhow::Result<()> {
    let org = org("test_budget_approve.db")?;
    let budget = org.service.create_budget(org.member, org.finance, Amount::from_major(500))?;
    assert!(!budget.record.approved);
    assert_eq!(budget.request.status, RequestStatus::Pending);

    let decision = org
        .service
        .decide(org.head, budget.request.id, RequestStatus::Approved, None)?;
    assert_eq!(decision.outcome, SubjectOutcome::Approved);

    let stored = org.service.budget(budget.record.id)?;
    assert!(stored.approved);
    assert!(stored.updated_at.to_datetime_utc() >= budget.record.updated_at.to_datetime_utc());

    let request = org.service.ledger().get(budget.request.id)?;
    assert_eq!(request.status, RequestStatus::Approved);
    assert!(request.approved_at.is_some());
    Ok(())
}

#[test]
fn rejecting_a_budget_deletes_it_and_its_request() -> anyhow::Result<()> {
    let org = org("test_budget_reject.db")?;
    let budget = org.service.create_budget(org.member, org.finance, Amount::from_major(500))?;

    let decision = org.service.decide(
        org.head,
        budget.request.id,
        RequestStatus::Rejected,
        Some("Too early in the year".into()),
    )?;
    assert_eq!(decision.outcome, SubjectOutcome::Discarded);
    assert_eq!(decision.message(), "Budget request rejected and deleted.");
    assert_eq!(
        decision.request.reject_reason.as_deref(),
        Some("Too early in the year")
    );

    assert!(matches!(
        org.service.budget(budget.record.id),
        Err(ExpenseError::NotFound { .. })
    ));
    assert!(matches!(
        org.service.ledger().get(budget.request.id),
        Err(ExpenseError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn rejecting_a_commitment_deletes_it_and_its_request() -> anyhow::Result<()> {
    let org = org("test_commitment_reject.db")?;
    org.approved_budget(Amount::from_major(100))?;
    let commitment = org
        .service
        .create_commitment(org.member, "Standing desks", Amount::from_major(60))?;

    let decision = org
        .service
        .decide(org.head, commitment.request.id, RequestStatus::Rejected, None)?;
    assert_eq!(decision.outcome, SubjectOutcome::Discarded);
    assert_eq!(decision.message(), "Commitment request rejected and deleted.");

    assert!(matches!(
        org.service.commitment(commitment.record.id),
        Err(ExpenseError::NotFound { .. })
    ));
    assert!(matches!(
        org.service.ledger().get(commitment.request.id),
        Err(ExpenseError::NotFound { .. })
    ));
    assert!(org.service.commitments_for_department(org.finance)?.is_empty());
    assert_eq!(
        org.service.funds().committed_remaining(org.finance)?,
        Amount::from_major(100)
    );
    Ok(())
}

#[test]
fn rejected_expense_returns_to_draft_and_can_be_resubmitted() -> anyhow::Result<()> {
    let org = org("test_expense_reject.db")?;
    org.approved_budget(Amount::from_major(1_000))?;

    let header = org.service.create_expense_header(org.member, "Client dinner")?;
    org.service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(120))])?;
    let submitted = org.service.submit_expense(org.member, header.id)?;

    // a submitted expense is frozen
    assert!(matches!(
        org.service
            .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(1))]),
        Err(ExpenseError::AlreadySubmitted)
    ));

    let decision = org
        .service
        .decide(org.head, submitted.request.id, RequestStatus::Rejected, None)?;
    assert_eq!(decision.outcome, SubjectOutcome::ReturnedForEdit);
    assert_eq!(decision.request.reject_reason.as_deref(), Some(""));

    let draft = org.service.get_expense(org.member, header.id)?;
    assert!(!draft.submitted);
    assert!(!draft.approved);

    let edited = org
        .service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(30))])?;
    assert_eq!(edited.total_amount, Amount::from_major(150));

    org.service.submit_expense(org.member, header.id)?;
    let history = org.service.ledger().for_subject(SubjectRef::Expense(header.id))?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, RequestStatus::Rejected);
    assert_eq!(history[1].status, RequestStatus::Pending);
    Ok(())
}

#[test]
fn approved_expense_is_stamped() -> anyhow::Result<()> {
    let org = org("test_expense_approve.db")?;
    org.approved_budget(Amount::from_major(1_000))?;

    let header = org.service.create_expense_header(org.member, "Books")?;
    org.service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(40))])?;
    let submitted = org.service.submit_expense(org.member, header.id)?;
    org.service
        .decide(org.head, submitted.request.id, RequestStatus::Approved, None)?;

    let approved = org.service.get_expense(org.head, header.id)?;
    assert!(approved.approved);
    assert!(approved.submitted);
    assert!(approved.approved_at.is_some());
    Ok(())
}

#[test]
fn deleting_a_commitment_deletes_its_requests() -> anyhow::Result<()> {
    let org = org("test_commitment_delete.db")?;
    let commitment = org
        .service
        .create_commitment(org.member, "Office chairs", Amount::from_major(800))?;

    org.service.delete_commitment(commitment.record.id)?;

    assert!(matches!(
        org.service.ledger().get(commitment.request.id),
        Err(ExpenseError::NotFound { .. })
    ));
    assert!(matches!(
        org.service.delete_commitment(commitment.record.id),
        Err(ExpenseError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn deleting_an_expense_removes_lines_and_requests() -> anyhow::Result<()> {
    let org = org("test_expense_delete.db")?;
    org.approved_budget(Amount::from_major(100))?;
    let header = org.service.create_expense_header(org.member, "Taxi")?;
    org.service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(25))])?;
    let submitted = org.service.submit_expense(org.member, header.id)?;

    org.service.delete_expense(header.id)?;

    assert!(org.service.list_own_expenses(org.member)?.is_empty());
    assert!(org.service.ledger().get(submitted.request.id).is_err());
    Ok(())
}

#[test]
fn deleting_a_pending_expense_request_returns_the_expense_to_draft() -> anyhow::Result<()> {
    let org = org("test_expense_request_delete.db")?;
    org.approved_budget(Amount::from_major(100))?;
    let header = org.service.create_expense_header(org.member, "Parking")?;
    org.service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(15))])?;
    let submitted = org.service.submit_expense(org.member, header.id)?;

    org.service.ledger().delete(submitted.request.id)?;

    let draft = org.service.get_expense(org.member, header.id)?;
    assert!(!draft.submitted);
    let edited = org
        .service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(5))])?;
    assert_eq!(edited.total_amount, Amount::from_major(20));

    let resubmitted = org.service.submit_expense(org.member, header.id)?;
    let history = org.service.ledger().for_subject(SubjectRef::Expense(header.id))?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, resubmitted.request.id);
    Ok(())
}

#[test]
fn unknown_expense_type_leaves_the_draft_unchanged() -> anyhow::Result<()> {
    let org = org("test_unknown_expense_type.db")?;
    let header = org.service.create_expense_header(org.member, "Supplies")?;
    org.service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(10))])?;

    let unknown = NewLineItem {
        expense_type: ExpenseTypeId::new(),
        ..org.line(Amount::from_major(5))
    };
    assert!(matches!(
        org.service.add_line_items(org.member, header.id, vec![unknown]),
        Err(ExpenseError::NotFound { entity: "expense type", .. })
    ));

    let draft = org.service.get_expense(org.member, header.id)?;
    assert_eq!(draft.line_items.len(), 1);
    assert_eq!(draft.total_amount, Amount::from_major(10));
    Ok(())
}

#[test]
fn notify_only_touches_the_timestamp() -> anyhow::Result<()> {
    let org = org("test_notify.db")?;
    let budget = org.service.create_budget(org.member, org.finance, Amount::from_major(50))?;

    let first = org.service.ledger().notify(budget.request.id)?;
    let second = org.service.ledger().notify(budget.request.id)?;

    assert_eq!(second.status, RequestStatus::Pending);
    assert_eq!(second.approver, budget.request.approver);
    assert_eq!(second.created_at, budget.request.created_at);
    let (first, second) = (
        first.notified_at.context("first notify stamps")?,
        second.notified_at.context("second notify stamps")?,
    );
    assert!(second.to_datetime_utc() >= first.to_datetime_utc());
    Ok(())
}

#[test]
fn failed_derivation_leaves_no_records() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = ExpenseService::open(temp_dir.path().join("test_no_matrix.db"))?;
    let user = service.directory().create_user("solo")?.id;
    let dept = service.directory().create_department("Lab", None)?.id;
    service.directory().assign_membership(user, dept)?;

    assert!(matches!(
        service.create_budget(user, dept, Amount::from_major(10)),
        Err(ExpenseError::DerivationFailed { .. })
    ));
    assert!(matches!(
        service.create_commitment(user, "Reagents", Amount::from_major(10)),
        Err(ExpenseError::DerivationFailed { .. })
    ));
    assert!(service.budgets()?.is_empty());
    assert!(service.commitments()?.is_empty());
    assert!(service.ledger().all()?.is_empty());
    Ok(())
}

#[test]
fn submission_without_approved_budget_is_refused() -> anyhow::Result<()> {
    let org = org("test_no_budget.db")?;
    let header = org.service.create_expense_header(org.member, "Parking")?;
    org.service
        .add_line_items(org.member, header.id, vec![org.line(Amount::from_major(5))])?;

    assert!(matches!(
        org.service.submit_expense(org.member, header.id),
        Err(ExpenseError::NotFound { .. })
    ));
    assert!(!org.service.get_expense(org.member, header.id)?.submitted);
    Ok(())
}

#[test]
fn paying_a_commitment_releases_budget() -> anyhow::Result<()> {
    let org = org("test_commitment_paid.db")?;
    org.approved_budget(Amount::from_major(1_000))?;
    let commitment = org.approved_commitment(Amount::from_major(400))?;
    assert_eq!(
        org.service.funds().committed_remaining(org.finance)?,
        Amount::from_major(600)
    );

    assert!(matches!(
        org.service.update_commitment(
            commitment,
            CommitmentUpdate {
                amount: Some(Amount::from_major(1)),
                ..Default::default()
            }
        ),
        Err(ExpenseError::InvalidInput(_))
    ));

    org.service.update_commitment(
        commitment,
        CommitmentUpdate {
            paid: Some(true),
            ..Default::default()
        },
    )?;
    assert_eq!(
        org.service.funds().committed_remaining(org.finance)?,
        Amount::from_major(1_000)
    );
    assert_eq!(org.service.outstanding_commitments(org.finance)?, Amount::ZERO);
    Ok(())
}

#[test]
fn only_owner_and_department_head_read_an_expense() -> anyhow::Result<()> {
    let org = org("test_expense_read.db")?;
    let stranger = org.service.directory().create_user("stranger")?.id;
    let header = org.service.create_expense_header(org.member, "Stationery")?;

    assert!(org.service.get_expense(org.member, header.id).is_ok());
    assert!(org.service.get_expense(org.head, header.id).is_ok());
    assert!(matches!(
        org.service.get_expense(stranger, header.id),
        Err(ExpenseError::Forbidden(_))
    ));
    assert!(matches!(
        org.service.submit_expense(stranger, header.id),
        Err(ExpenseError::Forbidden(_))
    ));
    Ok(())
}

#[test]
fn pending_queries_follow_decisions() -> anyhow::Result<()> {
    let org = org("test_pending_queries.db")?;
    let first = org.service.create_budget(org.member, org.finance, Amount::from_major(10))?;
    org.service.create_budget(org.member, org.finance, Amount::from_major(20))?;
    org.service
        .create_commitment(org.member, "Cables", Amount::from_major(3))?;

    assert_eq!(org.service.ledger().pending_for_approver(org.head)?.len(), 3);
    assert_eq!(org.service.ledger().pending_for_department(org.finance)?.len(), 2);

    org.service
        .decide(org.head, first.request.id, RequestStatus::Approved, None)?;
    assert_eq!(org.service.ledger().pending_for_department(org.finance)?.len(), 1);
    assert_eq!(
        org.service.ledger().pending_for_department(DepartmentId::new())?.len(),
        0
    );
    Ok(())
}
