use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single submitted field. Values that are not one of the accepted
/// scalars land in `Other` so they can be rejected instead of failing
/// deserialization of the whole share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    /// Integers above `i64::MAX`.
    UInt(u64),
    Float(f64),
    Text(String),
    Other(Value),
}

impl FieldValue {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldValue::Other(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::UInt(u) => Some(*u as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn key_part(&self) -> String {
        match self {
            FieldValue::Text(s) => s.trim().to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::UInt(u) => u.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Other(v) => v.to_string(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

/// Share as received from a worker. Nothing about the field types is
/// trusted until the validator has looked at it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Share {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<FieldValue>,
}

impl Share {
    pub fn new(
        worker_id: impl Into<String>,
        ip: impl Into<String>,
        hash: impl Into<String>,
        nonce: i64,
        timestamp: f64,
    ) -> Self {
        Self {
            worker_id: Some(FieldValue::Text(worker_id.into())),
            ip: Some(FieldValue::Text(ip.into())),
            hash: Some(FieldValue::Text(hash.into())),
            nonce: Some(FieldValue::Int(nonce)),
            timestamp: Some(FieldValue::Float(timestamp)),
        }
    }

    /// Builds a share from an arbitrary JSON value. Only objects are
    /// accepted; unknown keys are ignored.
    pub fn from_value(value: &Value) -> std::result::Result<Self, RejectReason> {
        let Value::Object(map) = value else {
            return Err(RejectReason::NotARecord);
        };

        let field = |name: &str| -> Option<FieldValue> {
            map.get(name).and_then(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(FieldValue::Text(s.clone())),
                Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                    (Some(i), _) => Some(FieldValue::Int(i)),
                    (None, Some(u)) => Some(FieldValue::UInt(u)),
                    (None, None) => n.as_f64().map(FieldValue::Float),
                },
                other => Some(FieldValue::Other(other.clone())),
            })
        };

        Ok(Self {
            worker_id: field("worker_id"),
            ip: field("ip"),
            hash: field("hash"),
            nonce: field("nonce"),
            timestamp: field("timestamp"),
        })
    }

    pub fn hash(&self) -> Option<&str> {
        match &self.hash {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Integer nonce, if one was submitted. Widened so that the full
    /// signed and unsigned 64-bit ranges both fit.
    pub fn nonce(&self) -> Option<i128> {
        match self.nonce {
            Some(FieldValue::Int(n)) => Some(n.into()),
            Some(FieldValue::UInt(n)) => Some(n.into()),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp.as_ref().and_then(FieldValue::as_number)
    }

    /// Key that groups this share with others from the same worker and
    /// origin. `None` when the worker id is missing or blank.
    pub fn identity_key(&self) -> Option<IdentityKey> {
        let worker = self.worker_id.as_ref().map(FieldValue::key_part).unwrap_or_default();
        if worker.is_empty() {
            return None;
        }
        let ip = self.ip.as_ref().map(FieldValue::key_part).unwrap_or_default();
        Some(IdentityKey::new(&worker, &ip))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(worker_id: &str, ip: &str) -> Self {
        Self(format!("{}|{}", worker_id.trim(), ip.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a stage refused a share.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NotARecord,
    MissingOrInvalidFields,
    TimestampDrift {
        /// `None` when the timestamp was not a number at all.
        drift_secs: Option<f64>,
        max_drift_secs: u64,
    },
    InsufficientDifficulty {
        required: usize,
    },
    ExcessiveShareFrequency {
        count: usize,
        max_shares: usize,
    },
    SuspiciousNonceUniformity {
        mean: f64,
        std_dev: f64,
    },
}

impl RejectReason {
    pub fn is_fraud(&self) -> bool {
        matches!(
            self,
            RejectReason::ExcessiveShareFrequency { .. } | RejectReason::SuspiciousNonceUniformity { .. }
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotARecord => write!(f, "Expected input of type dict."),
            RejectReason::MissingOrInvalidFields => write!(f, "Missing or invalid fields."),
            RejectReason::TimestampDrift { .. } => {
                write!(f, "Timestamp is outside acceptable drift window.")
            }
            RejectReason::InsufficientDifficulty { required } => write!(
                f,
                "Hash does not meet required difficulty threshold of {}.",
                required
            ),
            RejectReason::ExcessiveShareFrequency { .. } => write!(f, "Excessive share frequency."),
            RejectReason::SuspiciousNonceUniformity { .. } => {
                write!(f, "Suspicious nonce uniformity.")
            }
        }
    }
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    /// Let through without being recorded because the fields needed for
    /// fraud tracking were unusable.
    Unrecorded,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Verdict::Rejected(_))
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Verdict::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accepted => write!(f, "Accepted."),
            Verdict::Unrecorded => write!(f, "Malformed or incomplete share."),
            Verdict::Rejected(reason) => reason.fmt(f),
        }
    }
}
