//! Error taxonomy for cache operations.
//!
//! A cache miss is never an error: lookups report it through
//! [`Lookup::Miss`](crate::Lookup::Miss). Errors cover the cases where the
//! cache could not answer at all ([`CacheError::Unavailable`]), where it was
//! built wrong ([`CacheError::Configuration`]) or where a payload could not be
//! encoded or decoded ([`CacheError::Serialization`]).

use std::fmt;

use crate::outcome::Tier;

/// Why a tier could not answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Network or backend failure.
    Transport,
    /// The call ran past its deadline.
    Timeout,
    /// The caller cancelled the call.
    Cancelled,
    /// The tier is switched off by policy or was never constructed.
    Disabled,
    /// The tier has been closed.
    Closed,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Disabled => write!(f, "disabled"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The tier could not be reached or did not answer in time.
    #[error("{tier} cache unavailable ({reason}): {message}")]
    Unavailable {
        /// Tier that failed.
        tier: Tier,
        /// Failure class.
        reason: UnavailableReason,
        /// Diagnostic detail from the underlying transport.
        message: String,
    },

    /// Construction parameters are invalid. Fatal at startup.
    #[error("invalid cache configuration: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// A payload could not be encoded or a cached payload could not be decoded.
    #[error("serialization error for key '{key}': {message}")]
    Serialization {
        /// Key whose value failed to (de)serialize.
        key: String,
        /// Underlying codec error.
        message: String,
    },

    /// The local tier refused a value larger than its entry limit.
    #[error("value for key '{key}' is {size} bytes, local tier limit is {max} bytes")]
    EntryTooLarge {
        /// Rejected key.
        key: String,
        /// Size of the rejected value.
        size: usize,
        /// Configured per-entry limit.
        max: usize,
    },

    /// One or more tiers failed to shut down cleanly.
    #[error("cache shutdown failed: {message}")]
    Shutdown {
        /// Combined failure description.
        message: String,
    },
}

impl CacheError {
    /// Creates an `Unavailable` error.
    #[must_use]
    pub fn unavailable(tier: Tier, reason: UnavailableReason, message: impl Into<String>) -> Self {
        Self::Unavailable {
            tier,
            reason,
            message: message.into(),
        }
    }

    /// Creates a `Unavailable` error for a transport failure.
    #[must_use]
    pub fn transport(tier: Tier, message: impl Into<String>) -> Self {
        Self::unavailable(tier, UnavailableReason::Transport, message)
    }

    /// Creates an `Unavailable` error for a tier that is switched off.
    #[must_use]
    pub fn disabled(tier: Tier) -> Self {
        Self::unavailable(tier, UnavailableReason::Disabled, "tier is disabled")
    }

    /// Creates a `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a `Serialization` error.
    #[must_use]
    pub fn serialization(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Serialization {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Returns `true` for backend/transport failures.
    ///
    /// This is the only class of error the degradation policy may turn into a
    /// miss. Configuration and serialization errors always surface.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns `true` if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Unavailable {
                reason: UnavailableReason::Cancelled,
                ..
            }
        )
    }

    /// Returns `true` if the operation ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Unavailable {
                reason: UnavailableReason::Timeout,
                ..
            }
        )
    }

    /// The tier the error originated from, if any.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Self::Unavailable { tier, .. } => Some(*tier),
            Self::EntryTooLarge { .. } => Some(Tier::Local),
            _ => None,
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_degradable() {
        assert!(CacheError::transport(Tier::Distributed, "refused").is_unavailable());
        assert!(CacheError::disabled(Tier::Distributed).is_unavailable());
        assert!(!CacheError::configuration("shards must be > 0").is_unavailable());
        assert!(!CacheError::serialization("user:1", "eof").is_unavailable());
    }

    #[test]
    fn cancellation_is_unavailable_class() {
        let err = CacheError::unavailable(
            Tier::Distributed,
            UnavailableReason::Cancelled,
            "caller went away",
        );
        assert!(err.is_unavailable());
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
        assert_eq!(err.tier(), Some(Tier::Distributed));
    }

    #[test]
    fn display_names_tier_and_reason() {
        let err = CacheError::unavailable(Tier::Distributed, UnavailableReason::Timeout, "3s");
        assert_eq!(
            err.to_string(),
            "distributed cache unavailable (timeout): 3s"
        );
    }
}
