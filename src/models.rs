//! Persisted records.
//!
//! Each struct is stored as CBOR in its own sled tree. Field numbers are part
//! of the on-disk format and must not be reused.
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;

use crate::error::ExpenseError;
use crate::ids::*;
use crate::types::{Amount, TimeStamp};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
pub struct User {
    #[n(0)]
    pub id: UserId,
    #[n(1)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
pub struct Department {
    #[n(0)]
    pub id: DepartmentId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub head: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
pub struct ExpenseType {
    #[n(0)]
    pub id: ExpenseTypeId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub description: String,
}

/// Named approver lookups available to `FUNCTION` matrix rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ApproverFunction {
    #[n(0)]
    DepartmentHead,
}

impl ApproverFunction {
    pub fn key(&self) -> &'static str {
        match self {
            ApproverFunction::DepartmentHead => "DEPARTMENT_HEAD",
        }
    }
}

impl FromStr for ApproverFunction {
    type Err = ExpenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("DEPARTMENT_HEAD") {
            Ok(ApproverFunction::DepartmentHead)
        } else {
            Err(ExpenseError::Unsupported(format!(
                "derivation function '{s}'"
            )))
        }
    }
}

/// How a matrix row names its approver. Folds the `derivationType` column and
/// the `approverSpec` column into one value so the two can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ApproverSpec {
    #[n(0)]
    User(#[n(0)] UserId),
    #[n(1)]
    Function(#[n(0)] ApproverFunction),
}

impl ApproverSpec {
    /// Parses the wire pair (`"USER"` | `"FUNCTION"`, spec string).
    pub fn parse(derivation_type: &str, approver_spec: &str) -> Result<Self, ExpenseError> {
        match derivation_type.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(ApproverSpec::User(approver_spec.parse()?)),
            "FUNCTION" => Ok(ApproverSpec::Function(approver_spec.parse()?)),
            other => Err(ExpenseError::Unsupported(format!(
                "derivation type '{other}'"
            ))),
        }
    }

    pub fn derivation_type(&self) -> &'static str {
        match self {
            ApproverSpec::User(_) => "USER",
            ApproverSpec::Function(_) => "FUNCTION",
        }
    }

    pub fn spec_string(&self) -> String {
        match self {
            ApproverSpec::User(id) => id.to_string(),
            ApproverSpec::Function(function) => function.key().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalMatrixRow {
    #[n(0)]
    pub id: MatrixId,
    #[n(1)]
    pub event_type: String,
    #[n(2)]
    pub level: i32,
    #[n(3)]
    pub approver: ApproverSpec,
}

impl Serialize for ApprovalMatrixRow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut row = serializer.serialize_struct("ApprovalMatrixRow", 5)?;
        row.serialize_field("id", &self.id)?;
        row.serialize_field("approvalEventType", &self.event_type)?;
        row.serialize_field("level", &self.level)?;
        row.serialize_field("derivationType", self.approver.derivation_type())?;
        row.serialize_field("approverSpec", &self.approver.spec_string())?;
        row.end()
    }
}

/// The kind of subject an approval request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum RequestKind {
    #[n(0)]
    BudgetApproval,
    #[n(1)]
    CommitmentApproval,
    #[n(2)]
    ExpenseApproval,
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::BudgetApproval => "Budget Approval",
            RequestKind::CommitmentApproval => "Commitment Approval",
            RequestKind::ExpenseApproval => "Expense Approval",
        }
    }

    /// Approval matrix event type consulted for this kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            RequestKind::BudgetApproval => "Budget",
            RequestKind::CommitmentApproval => "Commitment",
            RequestKind::ExpenseApproval => "Expense",
        }
    }

    pub fn subject_name(&self) -> &'static str {
        match self {
            RequestKind::BudgetApproval => "budget",
            RequestKind::CommitmentApproval => "commitment",
            RequestKind::ExpenseApproval => "expense",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            RequestKind::BudgetApproval => 0,
            RequestKind::CommitmentApproval => 1,
            RequestKind::ExpenseApproval => 2,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RequestKind {
    type Err = ExpenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RequestKind::BudgetApproval,
            RequestKind::CommitmentApproval,
            RequestKind::ExpenseApproval,
        ]
        .into_iter()
        .find(|kind| kind.label().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| ExpenseError::Unsupported(format!("request type '{s}'")))
    }
}

impl Serialize for RequestKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Reference from a request to the record it decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectRef {
    Budget(BudgetId),
    Commitment(CommitmentId),
    Expense(ExpenseId),
}

impl SubjectRef {
    pub fn kind(&self) -> RequestKind {
        match self {
            SubjectRef::Budget(_) => RequestKind::BudgetApproval,
            SubjectRef::Commitment(_) => RequestKind::CommitmentApproval,
            SubjectRef::Expense(_) => RequestKind::ExpenseApproval,
        }
    }

    fn id_bytes(&self) -> &[u8] {
        match self {
            SubjectRef::Budget(id) => id.as_bytes(),
            SubjectRef::Commitment(id) => id.as_bytes(),
            SubjectRef::Expense(id) => id.as_bytes(),
        }
    }

    /// Key of this subject in the `subjects` index: kind tag then id bytes.
    pub(crate) fn index_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(17);
        key.push(self.kind().tag());
        key.extend_from_slice(self.id_bytes());
        key
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectRef::Budget(id) => fmt::Display::fmt(id, f),
            SubjectRef::Commitment(id) => fmt::Display::fmt(id, f),
            SubjectRef::Expense(id) => fmt::Display::fmt(id, f),
        }
    }
}

// Stored as `[kind, id]` so the reference survives without a separate type column.
impl<C> minicbor::Encode<C> for SubjectRef {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(2)?.u8(self.kind().tag())?.bytes(self.id_bytes())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for SubjectRef {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        d.array()?;
        let tag = d.u8()?;
        let bytes = d.bytes()?;
        let bad_id = || minicbor::decode::Error::message("subject id must be 16 bytes");
        match tag {
            0 => BudgetId::from_slice(bytes).map(SubjectRef::Budget).ok_or_else(bad_id),
            1 => CommitmentId::from_slice(bytes)
                .map(SubjectRef::Commitment)
                .ok_or_else(bad_id),
            2 => ExpenseId::from_slice(bytes).map(SubjectRef::Expense).ok_or_else(bad_id),
            _ => Err(minicbor::decode::Error::message("unknown subject kind")),
        }
    }
}

// Rendered as the `type` and `referenceId` pair of the request body.
impl Serialize for SubjectRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut subject = serializer.serialize_struct("SubjectRef", 2)?;
        subject.serialize_field("type", self.kind().label())?;
        subject.serialize_field("referenceId", &self.to_string())?;
        subject.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl FromStr for RequestStatus {
    type Err = ExpenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RequestStatus::Pending),
            "APPROVED" => Ok(RequestStatus::Approved),
            "REJECTED" => Ok(RequestStatus::Rejected),
            _ => Err(ExpenseError::InvalidInput(format!("'{s}' is not a request status"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproverRequest {
    #[n(0)]
    pub id: RequestId,
    #[n(1)]
    pub requestor: UserId,
    #[n(2)]
    pub approver: UserId,
    #[n(3)]
    #[serde(flatten)]
    pub subject: SubjectRef,
    #[n(4)]
    pub status: RequestStatus,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    // Decision time for either outcome; the name is kept from the wire contract.
    #[n(6)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub notified_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub reject_reason: Option<String>,
}

impl ApproverRequest {
    pub fn kind(&self) -> RequestKind {
        self.subject.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    #[n(0)]
    pub id: BudgetId,
    #[n(1)]
    pub department: DepartmentId,
    #[n(2)]
    pub amount: Amount,
    #[n(3)]
    pub approved: bool,
    #[n(4)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    #[n(0)]
    pub id: CommitmentId,
    #[n(1)]
    pub requestor: UserId,
    #[n(2)]
    pub department: DepartmentId,
    #[n(3)]
    pub description: String,
    #[n(4)]
    pub amount: Amount,
    #[n(5)]
    pub approved: bool,
    #[n(6)]
    pub paid: bool,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub approved_at: Option<TimeStamp<Utc>>,
}

impl Commitment {
    /// Approved but not yet paid commitments consume the department budget.
    pub fn is_outstanding(&self) -> bool {
        self.approved && !self.paid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseLineItem {
    #[n(0)]
    pub id: LineItemId,
    #[n(1)]
    pub expense_type: ExpenseTypeId,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub amount: Amount,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseHeader {
    #[n(0)]
    pub id: ExpenseId,
    #[n(1)]
    pub requestor_id: UserId,
    #[n(2)]
    pub department: DepartmentId,
    #[n(3)]
    pub description: String,
    #[n(4)]
    pub total_amount: Amount,
    #[n(5)]
    pub submitted: bool,
    #[n(6)]
    pub approved: bool,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub line_items: Vec<ExpenseLineItem>,
}

impl ExpenseHeader {
    /// Recomputes `total_amount` from the owned line items.
    pub fn recompute_total(&mut self) -> crate::error::Result<()> {
        self.total_amount = Amount::total(self.line_items.iter().map(|item| item.amount))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_kind_labels_parse_back() {
        for kind in [
            RequestKind::BudgetApproval,
            RequestKind::CommitmentApproval,
            RequestKind::ExpenseApproval,
        ] {
            assert_eq!(kind.label().parse::<RequestKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_request_kind_is_unsupported() {
        let err = "Travel Approval".parse::<RequestKind>().unwrap_err();
        assert!(matches!(err, ExpenseError::Unsupported(_)));
    }

    #[test]
    fn approver_spec_parsing() {
        let user = UserId::new();
        assert_eq!(
            ApproverSpec::parse("User", &user.to_string()).unwrap(),
            ApproverSpec::User(user)
        );
        assert_eq!(
            ApproverSpec::parse("function", "department_head").unwrap(),
            ApproverSpec::Function(ApproverFunction::DepartmentHead)
        );
        assert!(matches!(
            ApproverSpec::parse("FUNCTION", "CFO"),
            Err(ExpenseError::Unsupported(_))
        ));
        assert!(matches!(
            ApproverSpec::parse("USER", "42"),
            Err(ExpenseError::InvalidInput(_))
        ));
    }

    #[test]
    fn subject_ref_cbor_keeps_kind() {
        let subject = SubjectRef::Commitment(CommitmentId::new());

        let encoded = minicbor::to_vec(subject).unwrap();
        let decoded: SubjectRef = minicbor::decode(&encoded).unwrap();

        assert_eq!(subject, decoded);
        assert_eq!(decoded.kind(), RequestKind::CommitmentApproval);
    }

    #[test]
    fn index_keys_differ_by_kind() {
        let budget = SubjectRef::Budget(BudgetId::new());
        let key = budget.index_key();
        assert_eq!(key.len(), 17);
        assert_eq!(key[0], RequestKind::BudgetApproval.tag());
    }
}
