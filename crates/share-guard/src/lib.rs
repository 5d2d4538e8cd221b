pub mod error;
pub mod fraud;
pub mod metrics;
pub mod runner;
pub mod shares;

pub use error::{Result, ShareGuardError};
pub use fraud::{FraudDetector, FraudPolicy, JsonlReportSink};
pub use runner::{DecisionRecord, DecisionStatus, PoolStages, RunnerConfig, ShareStages, ValidationRunner};
pub use shares::{Share, ShareValidator, Verdict};
