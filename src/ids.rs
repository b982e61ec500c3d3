//! Typed record identifiers.
//!
//! Every record is keyed by the 16 bytes of a uuid7, so sled iteration order
//! follows creation order. Externally ids travel as bech32m strings whose
//! human readable prefix names the record kind, which keeps a budget id from
//! ever being accepted where a commitment id is expected.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid7::uuid7;

use crate::error::ExpenseError;
use crate::utils;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident, $hrp:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 16]);

        impl $name {
            pub const PREFIX: &'static str = $hrp;

            pub fn new() -> Self {
                Self(*uuid7().as_bytes())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let encoded = utils::bytes_to_bech32($hrp, &self.0).map_err(|_| fmt::Error)?;
                f.write_str(&encoded)
            }
        }

        impl FromStr for $name {
            type Err = ExpenseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                utils::bech32_to_bytes($hrp, s.trim())
                    .ok()
                    .and_then(|bytes| Self::from_slice(&bytes))
                    .ok_or_else(|| {
                        ExpenseError::InvalidInput(format!(
                            "'{s}' is not a valid {} identifier",
                            $hrp.trim_end_matches('_')
                        ))
                    })
            }
        }

        impl<C> minicbor::Encode<C> for $name {
            fn encode<W: minicbor::encode::Write>(
                &self,
                e: &mut minicbor::Encoder<W>,
                _: &mut C,
            ) -> Result<(), minicbor::encode::Error<W::Error>> {
                e.bytes(&self.0)?.ok()
            }
        }

        impl<'b, C> minicbor::Decode<'b, C> for $name {
            fn decode(
                d: &mut minicbor::Decoder<'b>,
                _: &mut C,
            ) -> Result<Self, minicbor::decode::Error> {
                Self::from_slice(d.bytes()?)
                    .ok_or_else(|| minicbor::decode::Error::message("record id must be 16 bytes"))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

record_id!(UserId, "user_");
record_id!(DepartmentId, "dept_");
record_id!(ExpenseTypeId, "etype_");
record_id!(
    /// Row of the approval matrix.
    MatrixId,
    "matrix_"
);
record_id!(RequestId, "req_");
record_id!(BudgetId, "budget_");
record_id!(CommitmentId, "commit_");
record_id!(ExpenseId, "expense_");
record_id!(LineItemId, "line_");
