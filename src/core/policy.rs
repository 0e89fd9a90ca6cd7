//! Retry and repeat policies for jobs.
//!
//! Budgets support a `forever` sentinel that never exhausts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A consumable budget of retries or repeats.
///
/// The sentinel [`Budget::FOREVER`] (the largest representable count) behaves
/// as "always available" and is never decremented below itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Budget(u32);

impl Budget {
    /// The never-exhausting sentinel.
    pub const FOREVER: Budget = Budget(u32::MAX);

    /// A budget of exactly `count` uses.
    pub fn count(count: u32) -> Self {
        Self(count)
    }

    /// An empty budget.
    pub fn none() -> Self {
        Self(0)
    }

    /// Whether this budget is the `forever` sentinel.
    pub fn is_forever(&self) -> bool {
        *self == Self::FOREVER
    }

    /// Whether at least one use remains.
    pub fn available(&self) -> bool {
        self.0 > 0
    }

    /// Consume one use. The `forever` sentinel is returned unchanged and an
    /// empty budget saturates at zero.
    pub fn consume(self) -> Self {
        if self.is_forever() {
            self
        } else {
            Self(self.0.saturating_sub(1))
        }
    }

    /// Add uses back, saturating into the `forever` sentinel.
    pub fn restock(self, count: u32) -> Self {
        if self.is_forever() {
            self
        } else {
            Self(self.0.saturating_add(count))
        }
    }

    /// Remaining uses as a raw count (`u32::MAX` for `forever`).
    pub fn remaining(&self) -> u32 {
        self.0
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::none()
    }
}

impl From<u32> for Budget {
    fn from(count: u32) -> Self {
        Self(count)
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_forever() {
            write!(f, "forever")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Retry policy for a job: how many failed runs may be re-queued, and how
/// long to wait before each re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry budget (0 = fail on first error).
    pub retries: Budget,

    /// Wait between a failure and the retried run becoming eligible.
    #[serde(with = "serde_millis")]
    pub wait: Duration,
}

impl RetryPolicy {
    /// Create a policy with a fixed number of retries.
    pub fn times(retries: u32, wait: Duration) -> Self {
        Self {
            retries: Budget::count(retries),
            wait,
        }
    }

    /// Create a policy that retries forever.
    pub fn forever(wait: Duration) -> Self {
        Self {
            retries: Budget::FOREVER,
            wait,
        }
    }
}

impl Default for RetryPolicy {
    /// Default policy: no retries, 5 second wait if restocked later.
    fn default() -> Self {
        Self {
            retries: Budget::none(),
            wait: Duration::from_secs(5),
        }
    }
}

/// Repeat policy for a job: how many times a completed job spawns a fresh
/// sibling, and how long the sibling waits before becoming eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatPolicy {
    /// Repeat budget (0 = run once).
    pub repeats: Budget,

    /// Wait between completion and the sibling becoming eligible.
    #[serde(with = "serde_millis")]
    pub wait: Duration,
}

impl RepeatPolicy {
    /// Create a policy with a fixed number of repeats.
    pub fn times(repeats: u32, wait: Duration) -> Self {
        Self {
            repeats: Budget::count(repeats),
            wait,
        }
    }

    /// Create a policy that repeats forever.
    pub fn forever(wait: Duration) -> Self {
        Self {
            repeats: Budget::FOREVER,
            wait,
        }
    }
}

impl Default for RepeatPolicy {
    /// Default policy: no repeats, 5 minute wait if restocked later.
    fn default() -> Self {
        Self {
            repeats: Budget::none(),
            wait: Duration::from_secs(300),
        }
    }
}

/// Serde helper for Duration as integer milliseconds.
pub(crate) mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
