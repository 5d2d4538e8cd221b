use crate::error::{Result, ShareGuardError};

/// Nonce standard deviation below which a window looks synthetic.
pub const NONCE_STD_DEV_FLOOR: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct FraudPolicy {
    pub name: String,
    pub window_seconds: u64,
    pub max_shares: usize,
    pub min_avg_nonce: f64,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            window_seconds: 300,
            max_shares: 200,
            min_avg_nonce: 1000.0,
        }
    }
}

impl FraudPolicy {
    pub fn check(&self) -> Result<()> {
        if self.window_seconds == 0 {
            return Err(ShareGuardError::Configuration(format!(
                "fraud policy '{}' has a zero-length window",
                self.name
            )));
        }
        if self.max_shares == 0 {
            return Err(ShareGuardError::Configuration(format!(
                "fraud policy '{}' allows no shares per window",
                self.name
            )));
        }
        if !self.min_avg_nonce.is_finite() {
            return Err(ShareGuardError::Configuration(format!(
                "fraud policy '{}' has a non-finite min_avg_nonce",
                self.name
            )));
        }
        Ok(())
    }
}
