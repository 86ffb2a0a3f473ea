//! Session lifecycle status.

use serde::{Deserialize, Serialize};

/// Lifecycle status for a duplex session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Replies are flowing.
    Open,
    /// A stop signal was observed; in-flight replies are being discarded.
    Terminating,
    /// No further replies will be emitted.
    Closed,
}

impl SessionStatus {
    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `Closed` is terminal. `Open` may close directly on disconnect or
    /// natural completion.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Terminating | Self::Closed) | (Self::Terminating, Self::Closed)
        )
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Terminating => 1,
            Self::Closed => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Terminating,
            _ => Self::Closed,
        }
    }
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The watchdog reported `stopped`.
    Stopped,
    /// The reply sequence ran out.
    Completed,
    /// The reply generator failed.
    Failed,
    /// The transport went away.
    Disconnected,
    /// A consumer cancelled the session.
    Cancelled,
}
