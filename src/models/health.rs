//! Watchdog verdicts exchanged between initiator and responder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Two-valued health verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The initiator wants the exchange to continue.
    #[serde(alias = "STARTED", alias = "Started")]
    Started,
    /// The initiator wants the exchange to end.
    #[serde(alias = "STOPPED", alias = "Stopped")]
    Stopped,
}

/// One observation of the initiator's health.
///
/// Produced fresh on every poll; never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthState {
    /// Verdict.
    pub state: HealthStatus,
    /// When the verdict was taken.
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl HealthState {
    /// A verdict observed now.
    #[must_use]
    pub fn now(state: HealthStatus) -> Self {
        Self {
            state,
            observed_at: Utc::now(),
        }
    }

    /// A `started` verdict observed now.
    #[must_use]
    pub fn started() -> Self {
        Self::now(HealthStatus::Started)
    }

    /// A `stopped` verdict observed now.
    #[must_use]
    pub fn stopped() -> Self {
        Self::now(HealthStatus::Stopped)
    }

    /// Whether this verdict ends the session.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state == HealthStatus::Stopped
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::started()
    }
}
