//! Global uniqueness reservations on top of the distributed tier's
//! conditional set.
//!
//! The distributed tier is the only authority. The local tier is consulted
//! first as a fast rejection path and mirrors successful reservations, but a
//! local miss never grants anything on its own.

use std::sync::Arc;
use std::time::Duration;

use crate::context::CallContext;
use crate::error::{CacheError, CacheResult};
use crate::manager::CacheManager;
use crate::outcome::{Advisory, Reservation, SideEffectKind, Tier};

/// Key under which an email address is reserved. Addresses compare
/// case-insensitively.
pub fn email_reservation_key(address: &str) -> String {
    format!("email:{}", address.trim().to_lowercase())
}

impl CacheManager {
    /// Atomically reserves `key` for `holder` for `ttl`.
    ///
    /// Of two concurrent calls for the same key, at most one sees
    /// `reserved == true` while the distributed tier is healthy. During an
    /// outage the result follows the policy's
    /// [`ReservationOutage`](crate::ReservationOutage): fail-open grants the
    /// reservation with `assumed == true`, fail-closed returns the error.
    pub async fn reserve_unique(
        &self,
        ctx: &CallContext,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> CacheResult<Reservation> {
        let mut advisory = Advisory::new();

        if self.local_tier().is_some_and(|local| local.exists(key)) {
            tracing::debug!(key = %key, "reservation rejected by local mirror");
            return Ok(Reservation {
                reserved: false,
                assumed: false,
                advisory,
            });
        }

        let attempt = match self.distributed_tier() {
            Some(distributed) => {
                distributed
                    .set_if_absent(ctx, key, Arc::from(holder.as_bytes()), ttl)
                    .await
            }
            None => Err(CacheError::disabled(Tier::Distributed)),
        };

        let (reserved, assumed) = match attempt {
            Ok(reserved) => (reserved, false),
            Err(e) => (self.policy().reservation_fallback(key, e)?, true),
        };

        if reserved {
            if let Some(local) = self.local_tier() {
                let mirrored = local.set(key, Arc::from(holder.as_bytes()));
                if let Err(e) = &mirrored {
                    tracing::warn!(key = %key, error = %e, "failed to mirror reservation locally");
                }
                advisory.record(SideEffectKind::ReservationMirror, Tier::Local, mirrored);
            }
            tracing::debug!(key = %key, holder = %holder, assumed = assumed, "reservation granted");
        } else {
            tracing::debug!(key = %key, "reservation already held");
        }

        Ok(Reservation {
            reserved,
            assumed,
            advisory,
        })
    }

    /// Releases `key` if `holder` still owns it. Returns `true` if the
    /// distributed record was removed.
    ///
    /// Under graceful degradation an outage reads as "not released"; the
    /// record then lapses with its TTL.
    pub async fn release_reservation(
        &self,
        ctx: &CallContext,
        key: &str,
        holder: &str,
    ) -> CacheResult<bool> {
        if let Some(local) = self.local_tier() {
            local.delete_if_value(key, holder.as_bytes());
        }
        let Some(distributed) = self.distributed_tier() else {
            return Ok(false);
        };
        match distributed
            .delete_if_value(ctx, key, holder.as_bytes())
            .await
        {
            Ok(released) => {
                tracing::debug!(key = %key, holder = %holder, released = released, "reservation released");
                Ok(released)
            }
            Err(e) => {
                self.policy().degrade("release_reservation", key, e)?;
                Ok(false)
            }
        }
    }
}
