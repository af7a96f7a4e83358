//! Degradation and write policy.
//!
//! Every manager operation that can fail on a tier consults exactly one of the
//! decision functions here, so the degrade/propagate contract is testable
//! without any tier in place.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::metrics::record_degraded;
use crate::outcome::{Advisory, SideEffectKind, Tier};

/// Behaviour of `reserve_unique` when the distributed tier cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationOutage {
    /// Report the key as reserved. Uniqueness is not enforced during the outage.
    #[default]
    FailOpen,
    /// Surface the outage to the caller.
    FailClosed,
}

/// Which tiers a `set` writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePlan {
    pub local: bool,
    pub distributed: bool,
    /// Remove any stale local copy instead of writing it.
    pub drop_local: bool,
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub enable_local: bool,
    pub enable_distributed: bool,
    pub graceful_degradation: bool,
    pub write_through: bool,
    pub local_ttl: Duration,
    pub distributed_ttl: Duration,
    pub reservation_outage: ReservationOutage,
}

impl Default for CachePolicy {
    fn default() -> Self {
        crate::config::PolicyConfig::default().to_policy()
    }
}

impl CachePolicy {
    /// Decides whether a tier failure may be absorbed.
    ///
    /// `Ok(())` means "treat as miss / false / done". Only `Unavailable`
    /// errors qualify, and only under graceful degradation. A cancelled
    /// caller always gets the error back.
    pub fn degrade(&self, op: &'static str, key: &str, err: CacheError) -> CacheResult<()> {
        if self.absorbs(&err) {
            let tier = err.tier().unwrap_or(Tier::Distributed);
            tracing::warn!(
                tier = %tier,
                op = op,
                key = %key,
                error = %err,
                "cache tier unavailable, degrading"
            );
            record_degraded(tier, op);
            Ok(())
        } else {
            tracing::error!(op = op, key = %key, error = %err, "cache operation failed");
            Err(err)
        }
    }

    fn absorbs(&self, err: &CacheError) -> bool {
        self.graceful_degradation && err.is_unavailable() && !err.is_cancelled()
    }

    /// Combines the per-tier failures of a multi-tier write or delete.
    ///
    /// Graceful: fails only when every attempted tier failed; tolerated
    /// failures come back as advisory entries of `kind`. Strict: any failure
    /// surfaces. When several tiers failed, a cancellation is reported first,
    /// then non-transport errors, then outages.
    pub fn resolve_writes(
        &self,
        op: &'static str,
        key: &str,
        kind: SideEffectKind,
        failures: Vec<(Tier, CacheError)>,
        attempted: usize,
    ) -> CacheResult<Advisory> {
        let mut advisory = Advisory::new();
        if failures.is_empty() {
            return Ok(advisory);
        }
        let cancelled = failures.iter().any(|(_, e)| e.is_cancelled());
        if self.graceful_degradation && failures.len() < attempted && !cancelled {
            for (tier, err) in failures {
                tracing::warn!(tier = %tier, op = op, key = %key, error = %err, "cache tier write failed, tolerated");
                record_degraded(tier, op);
                advisory.record(kind, tier, Err(err));
            }
            return Ok(advisory);
        }
        let mut errors: Vec<CacheError> = failures.into_iter().map(|(_, e)| e).collect();
        errors.sort_by_key(|e| (!e.is_cancelled(), e.is_unavailable()));
        let err = errors.swap_remove(0);
        tracing::error!(op = op, key = %key, error = %err, "cache write failed");
        Err(err)
    }

    /// Outcome of a reservation whose authoritative check failed.
    pub fn reservation_fallback(&self, key: &str, err: CacheError) -> CacheResult<bool> {
        if !self.absorbs(&err) {
            return Err(err);
        }
        match self.reservation_outage {
            ReservationOutage::FailOpen => {
                tracing::warn!(
                    key = %key,
                    error = %err,
                    "distributed tier unavailable, granting reservation without uniqueness check"
                );
                record_degraded(Tier::Distributed, "reserve_unique");
                Ok(true)
            }
            ReservationOutage::FailClosed => Err(err),
        }
    }

    /// Tiers written by `set`, given which tiers exist.
    pub fn write_plan(&self, has_local: bool, has_distributed: bool) -> WritePlan {
        let local = self.enable_local && has_local;
        let distributed = self.enable_distributed && has_distributed;
        if self.write_through || !distributed {
            WritePlan {
                local,
                distributed,
                drop_local: false,
            }
        } else {
            WritePlan {
                local: false,
                distributed,
                drop_local: local,
            }
        }
    }
}
