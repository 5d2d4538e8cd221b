pub mod detector;
pub mod policy;
pub mod report;

pub use detector::{FraudDetector, WindowEntry};
pub use policy::{FraudPolicy, NONCE_STD_DEV_FLOOR};
pub use report::{FraudReport, JsonlReportSink, ReportSink};
