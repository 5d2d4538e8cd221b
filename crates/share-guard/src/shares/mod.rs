pub mod types;
pub mod validator;

pub use types::{FieldValue, IdentityKey, RejectReason, Share, Verdict};
pub use validator::{Clock, ShareValidator, SystemClock, DEFAULT_DIFFICULTY};
