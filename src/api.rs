//! HTTP surface.
//!
//! JSON in and out. The upstream gateway authenticates users and forwards
//! the caller's id in the `X-User-Id` header; requests without a known
//! caller are refused with 401. Domain errors map to 400 with a
//! `{"message": ...}` body, store faults to 500.
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::ExpenseError;
use crate::funds::CommittedBudget;
use crate::ids::{
    BudgetId, CommitmentId, DepartmentId, ExpenseId, LineItemId, MatrixId, RequestId, UserId,
};
use crate::ledger::Decision;
use crate::lifecycle::SubjectOutcome;
use crate::matrix::NewMatrixRow;
use crate::models::{
    ApprovalMatrixRow, ApproverRequest, ApproverSpec, Budget, Commitment, ExpenseHeader,
    RequestStatus,
};
use crate::service::{CommitmentUpdate, ExpenseService, LineItemUpdate, NewLineItem, Submitted};
use crate::types::Amount;

pub const CALLER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExpenseService>,
}

impl AppState {
    pub fn new(service: ExpenseService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/approval-matrix", post(create_matrix_rows).get(list_matrix_rows))
        .route("/approval-matrix/event", get(matrix_rows_by_event))
        .route(
            "/approval-matrix/:id",
            get(get_matrix_row).put(update_matrix_row).delete(delete_matrix_row),
        )
        .route("/approver-requests", get(list_requests))
        .route("/approver-requests/pending", get(own_pending_requests))
        .route("/approver-requests/approver/:id/pending", get(approver_pending_requests))
        .route("/approver-requests/department/:id/pending", get(department_pending_requests))
        .route("/approver-requests/:id", get(get_request).delete(delete_request))
        .route("/approver-requests/:id/status", put(decide_request))
        .route("/approver-requests/:id/notify", put(notify_request))
        .route("/budgets", post(create_budget).get(list_budgets))
        .route("/budgets/approved", get(approved_budgets))
        .route("/budgets/department", get(latest_budgets))
        .route("/budgets/department/:id", get(latest_budget))
        .route("/budgets/committed", get(committed_budgets))
        .route("/budgets/committed/department/:id", get(committed_budget))
        .route("/budgets/:id", get(get_budget).delete(delete_budget))
        .route("/commitments", post(create_commitment).get(list_commitments))
        .route("/commitments/approved", get(approved_commitments))
        .route("/commitments/unpaid", get(unpaid_commitments))
        .route("/commitments/department/:id", get(department_commitments))
        .route(
            "/commitments/department/total-unpaid-approved/:id",
            get(department_outstanding_total),
        )
        .route(
            "/commitments/departments/total-unpaid-approved",
            get(outstanding_totals),
        )
        .route(
            "/commitments/:id",
            get(get_commitment).put(update_commitment).delete(delete_commitment),
        )
        .route("/expenses/header", post(create_expense_header))
        .route("/expenses/header/own", get(own_expenses))
        .route("/expenses/header/submit/:id", put(submit_expense))
        .route("/expenses/header/:id", get(get_expense).delete(delete_expense))
        .route("/expenses/line/:header_id", post(add_line_items))
        .route(
            "/expenses/line/:header_id/:line_id",
            put(update_line_item).delete(delete_line_item),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Errors and extractors
// =============================================================================

#[derive(Debug)]
pub struct ApiError(ExpenseError);

impl From<ExpenseError> for ApiError {
    fn from(value: ExpenseError) -> Self {
        ApiError(value)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    fn json(message: impl Into<String>) -> Json<Message> {
        Json(Message {
            message: message.into(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ExpenseError::Unauthorized => StatusCode::UNAUTHORIZED,
            err if err.is_internal() => {
                error!(error = %err, "request failed on a store fault");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Message::json(self.0.to_string())).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// The authenticated user making the request.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<UserId>().ok())
            .ok_or(ExpenseError::Unauthorized)?;

        match state.service.directory().user(id) {
            Ok(_) => Ok(Caller(id)),
            Err(ExpenseError::NotFound { .. }) => Err(ExpenseError::Unauthorized.into()),
            Err(err) => Err(err.into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        ApiError(ExpenseError::InvalidInput(value.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(value: QueryRejection) -> Self {
        ApiError(ExpenseError::InvalidInput(value.body_text()))
    }
}

/// `Json` whose rejections answer with the `{"message": ...}` body.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(JsonBody(value))
    }
}

/// `Query` whose rejections answer with the `{"message": ...}` body.
#[derive(Debug)]
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for QueryParams<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(QueryParams(value))
    }
}

fn parse<T: FromStr<Err = ExpenseError>>(raw: &str) -> Result<T, ApiError> {
    Ok(raw.parse()?)
}

async fn health_check() -> &'static str {
    "OK"
}

// =============================================================================
// Approval matrix
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixRowBody {
    pub approval_event_type: String,
    pub level: i32,
    pub derivation_type: String,
    pub approver_spec: String,
}

impl MatrixRowBody {
    fn into_row(self) -> Result<NewMatrixRow, ExpenseError> {
        Ok(NewMatrixRow {
            approver: ApproverSpec::parse(&self.derivation_type, &self.approver_spec)?,
            event_type: self.approval_event_type,
            level: self.level,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MatrixRowsBody {
    Many(Vec<MatrixRowBody>),
    One(MatrixRowBody),
}

async fn create_matrix_rows(
    State(state): State<AppState>,
    _caller: Caller,
    JsonBody(body): JsonBody<MatrixRowsBody>,
) -> ApiResult<Vec<ApprovalMatrixRow>> {
    let bodies = match body {
        MatrixRowsBody::Many(rows) => rows,
        MatrixRowsBody::One(row) => vec![row],
    };
    let rows = bodies
        .into_iter()
        .map(MatrixRowBody::into_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(state.service.matrix().create(rows)?))
}

async fn list_matrix_rows(State(state): State<AppState>) -> ApiResult<Vec<ApprovalMatrixRow>> {
    Ok(Json(state.service.matrix().list()?))
}

async fn get_matrix_row(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ApprovalMatrixRow> {
    Ok(Json(state.service.matrix().get(parse::<MatrixId>(&id)?)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    pub approval_event_type: String,
    pub level: i32,
}

async fn matrix_rows_by_event(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<EventQuery>,
) -> ApiResult<Vec<ApprovalMatrixRow>> {
    Ok(Json(
        state
            .service
            .matrix()
            .by_event_and_level(&query.approval_event_type, query.level)?,
    ))
}

async fn update_matrix_row(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<MatrixRowBody>,
) -> ApiResult<ApprovalMatrixRow> {
    let id = parse::<MatrixId>(&id)?;
    Ok(Json(state.service.matrix().update(id, body.into_row()?)?))
}

async fn delete_matrix_row(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Message> {
    state.service.matrix().delete(parse::<MatrixId>(&id)?)?;
    Ok(Message::json("Approval matrix row deleted."))
}

// =============================================================================
// Approver requests
// =============================================================================

#[derive(Debug, Serialize)]
pub struct DecisionBody {
    pub request: ApproverRequest,
    pub outcome: SubjectOutcome,
    pub message: String,
}

impl From<Decision> for DecisionBody {
    fn from(decision: Decision) -> Self {
        Self {
            message: decision.message(),
            request: decision.request,
            outcome: decision.outcome,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub status: String,
    pub reject_reason: Option<String>,
}

async fn list_requests(State(state): State<AppState>) -> ApiResult<Vec<ApproverRequest>> {
    Ok(Json(state.service.ledger().all()?))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ApproverRequest> {
    Ok(Json(state.service.ledger().get(parse::<RequestId>(&id)?)?))
}

async fn decide_request(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    QueryParams(query): QueryParams<StatusQuery>,
) -> ApiResult<DecisionBody> {
    let id = parse::<RequestId>(&id)?;
    let status = parse::<RequestStatus>(&query.status)?;
    let decision = state.service.decide(caller, id, status, query.reject_reason)?;
    Ok(Json(decision.into()))
}

async fn notify_request(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<ApproverRequest> {
    Ok(Json(state.service.ledger().notify(parse::<RequestId>(&id)?)?))
}

async fn delete_request(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Message> {
    state.service.ledger().delete(parse::<RequestId>(&id)?)?;
    Ok(Message::json("Approver request deleted."))
}

async fn own_pending_requests(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<Vec<ApproverRequest>> {
    Ok(Json(state.service.ledger().pending_for_approver(caller)?))
}

async fn approver_pending_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ApproverRequest>> {
    Ok(Json(
        state
            .service
            .ledger()
            .pending_for_approver(parse::<UserId>(&id)?)?,
    ))
}

async fn department_pending_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ApproverRequest>> {
    Ok(Json(
        state
            .service
            .ledger()
            .pending_for_department(parse::<DepartmentId>(&id)?)?,
    ))
}

// =============================================================================
// Budgets
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBudgetBody {
    pub department_id: DepartmentId,
    pub amount: Amount,
}

async fn create_budget(
    State(state): State<AppState>,
    Caller(caller): Caller,
    JsonBody(body): JsonBody<NewBudgetBody>,
) -> ApiResult<Submitted<Budget>> {
    Ok(Json(state.service.create_budget(caller, body.department_id, body.amount)?))
}

async fn list_budgets(State(state): State<AppState>) -> ApiResult<Vec<Budget>> {
    Ok(Json(state.service.budgets()?))
}

async fn get_budget(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Budget> {
    Ok(Json(state.service.budget(parse::<BudgetId>(&id)?)?))
}

async fn approved_budgets(State(state): State<AppState>) -> ApiResult<Vec<Budget>> {
    Ok(Json(state.service.approved_budgets()?))
}

async fn latest_budgets(State(state): State<AppState>) -> ApiResult<Vec<Budget>> {
    Ok(Json(state.service.funds().latest_approved_budgets()?))
}

async fn latest_budget(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Budget> {
    let department = parse::<DepartmentId>(&id)?;
    Ok(Json(state.service.funds().latest_approved_budget(department)?))
}

async fn committed_budgets(State(state): State<AppState>) -> ApiResult<Vec<CommittedBudget>> {
    Ok(Json(state.service.committed_budgets()?))
}

async fn committed_budget(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CommittedBudget> {
    Ok(Json(state.service.committed_budget(parse::<DepartmentId>(&id)?)?))
}

async fn delete_budget(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Message> {
    state.service.delete_budget(parse::<BudgetId>(&id)?)?;
    Ok(Message::json("Budget and its approval requests deleted."))
}

// =============================================================================
// Commitments
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct NewCommitmentBody {
    pub description: String,
    pub amount: Amount,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentTotal {
    pub department_id: DepartmentId,
    pub total: Amount,
}

async fn create_commitment(
    State(state): State<AppState>,
    Caller(caller): Caller,
    JsonBody(body): JsonBody<NewCommitmentBody>,
) -> ApiResult<Submitted<Commitment>> {
    Ok(Json(state.service.create_commitment(caller, &body.description, body.amount)?))
}

async fn list_commitments(State(state): State<AppState>) -> ApiResult<Vec<Commitment>> {
    Ok(Json(state.service.commitments()?))
}

async fn get_commitment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Commitment> {
    Ok(Json(state.service.commitment(parse::<CommitmentId>(&id)?)?))
}

async fn update_commitment(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
    JsonBody(update): JsonBody<CommitmentUpdate>,
) -> ApiResult<Commitment> {
    let id = parse::<CommitmentId>(&id)?;
    Ok(Json(state.service.update_commitment(id, update)?))
}

async fn delete_commitment(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Message> {
    state.service.delete_commitment(parse::<CommitmentId>(&id)?)?;
    Ok(Message::json("Commitment and its approval requests deleted."))
}

async fn department_commitments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Commitment>> {
    let department = parse::<DepartmentId>(&id)?;
    Ok(Json(state.service.commitments_for_department(department)?))
}

async fn approved_commitments(State(state): State<AppState>) -> ApiResult<Vec<Commitment>> {
    Ok(Json(state.service.approved_commitments()?))
}

async fn unpaid_commitments(State(state): State<AppState>) -> ApiResult<Vec<Commitment>> {
    Ok(Json(state.service.unpaid_commitments()?))
}

async fn department_outstanding_total(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DepartmentTotal> {
    let department_id = parse::<DepartmentId>(&id)?;
    let total = state.service.outstanding_commitments(department_id)?;
    Ok(Json(DepartmentTotal {
        department_id,
        total,
    }))
}

async fn outstanding_totals(State(state): State<AppState>) -> ApiResult<BTreeMap<String, Amount>> {
    Ok(Json(state.service.outstanding_by_department()?))
}

// =============================================================================
// Expenses
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct NewExpenseBody {
    pub description: String,
}

async fn create_expense_header(
    State(state): State<AppState>,
    Caller(caller): Caller,
    JsonBody(body): JsonBody<NewExpenseBody>,
) -> ApiResult<ExpenseHeader> {
    Ok(Json(state.service.create_expense_header(caller, &body.description)?))
}

async fn own_expenses(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<Vec<ExpenseHeader>> {
    Ok(Json(state.service.list_own_expenses(caller)?))
}

async fn get_expense(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<ExpenseHeader> {
    Ok(Json(state.service.get_expense(caller, parse::<ExpenseId>(&id)?)?))
}

async fn submit_expense(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Submitted<ExpenseHeader>> {
    Ok(Json(state.service.submit_expense(caller, parse::<ExpenseId>(&id)?)?))
}

async fn delete_expense(
    State(state): State<AppState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Message> {
    state.service.delete_expense(parse::<ExpenseId>(&id)?)?;
    Ok(Message::json(
        "Expense header, its line items and approval requests deleted.",
    ))
}

async fn add_line_items(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(header_id): Path<String>,
    JsonBody(items): JsonBody<Vec<NewLineItem>>,
) -> ApiResult<ExpenseHeader> {
    let header = parse::<ExpenseId>(&header_id)?;
    Ok(Json(state.service.add_line_items(caller, header, items)?))
}

async fn update_line_item(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((header_id, line_id)): Path<(String, String)>,
    JsonBody(update): JsonBody<LineItemUpdate>,
) -> ApiResult<ExpenseHeader> {
    let header = parse::<ExpenseId>(&header_id)?;
    let line = parse::<LineItemId>(&line_id)?;
    Ok(Json(state.service.update_line_item(caller, header, line, update)?))
}

async fn delete_line_item(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((header_id, line_id)): Path<(String, String)>,
) -> ApiResult<ExpenseHeader> {
    let header = parse::<ExpenseId>(&header_id)?;
    let line = parse::<LineItemId>(&line_id)?;
    Ok(Json(state.service.delete_line_item(caller, header, line)?))
}
