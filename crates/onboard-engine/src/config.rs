//! Engine configuration.

use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Tunables for an onboarding run.
#[derive(Debug, Clone, Deserialize)]
pub struct OnboardConfig {
    /// Budget for waiting on a pooled license to become active.
    #[serde(default = "OnboardConfig::default_license_policy")]
    pub license_policy: RetryPolicy,

    /// Budget for waiting on the device to report ready, and on a directly
    /// installed license to show up.
    #[serde(default = "OnboardConfig::default_ready_policy")]
    pub ready_policy: RetryPolicy,

    /// Budget for polling a committed transaction until it completes.
    #[serde(default = "OnboardConfig::default_transaction_policy")]
    pub transaction_policy: RetryPolicy,

    /// Poll the transaction after the commit request until it completes.
    #[serde(default = "OnboardConfig::default_commit_poll")]
    pub commit_poll: bool,

    /// Port removed from the default-allow list when asked to.
    #[serde(default = "OnboardConfig::default_legacy_port")]
    pub legacy_port: u16,
}

impl OnboardConfig {
    const fn default_license_policy() -> RetryPolicy {
        RetryPolicy::new(40, 5_000) // ~3.3 minutes
    }

    const fn default_ready_policy() -> RetryPolicy {
        RetryPolicy::new(60, 10_000)
    }

    const fn default_transaction_policy() -> RetryPolicy {
        RetryPolicy::new(10, 1_000)
    }

    const fn default_commit_poll() -> bool {
        true
    }

    const fn default_legacy_port() -> u16 {
        443
    }

    /// Parse a configuration document, filling in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON or a field has the
    /// wrong type.
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }
}

impl Default for OnboardConfig {
    fn default() -> Self {
        Self {
            license_policy: Self::default_license_policy(),
            ready_policy: Self::default_ready_policy(),
            transaction_policy: Self::default_transaction_policy(),
            commit_poll: Self::default_commit_poll(),
            legacy_port: Self::default_legacy_port(),
        }
    }
}
