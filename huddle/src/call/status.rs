use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Lifecycle of a call record.
///
/// `Pending` is the only state a call is created in. From there it is either
/// answered, turned down (`Declined`), left unanswered (`Missed`) or ended
/// outright by the host. An answered call can only end. Any call can still be
/// ended, and nothing leaves `Ended`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "answered")]
    Answered,
    #[display(fmt = "ended")]
    Ended,
    #[display(fmt = "declined")]
    Declined,
    #[display(fmt = "missed")]
    Missed,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Declined | CallStatus::Missed
        )
    }

    /// Whether `to` is reachable from `self` in one step. Staying in the same
    /// status is reported as valid so repeated updates are harmless.
    pub fn can_transition_to(&self, to: CallStatus) -> bool {
        use CallStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Answered) | (Pending, Declined) | (Pending, Missed) | (_, Ended)
        )
    }
}

impl std::str::FromStr for CallStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "pending" => CallStatus::Pending,
            "answered" => CallStatus::Answered,
            "ended" => CallStatus::Ended,
            "declined" | "rejected" => CallStatus::Declined,
            "missed" => CallStatus::Missed,
            other => {
                return Err(crate::error::Error::OtherWithContext(format!(
                    "unknown call status {other}"
                )))
            }
        };
        Ok(status)
    }
}
