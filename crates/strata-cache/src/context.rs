//! Per-call deadline and cancellation.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult, UnavailableReason};
use crate::outcome::Tier;

/// Deadline and cancellation handle that accompanies every cache call.
///
/// Distributed-tier calls never run unbounded: when the context carries no
/// deadline, the tier applies its own default timeout.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl CallContext {
    /// A context with neither deadline nor cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A timeout too large to express as an `Instant` leaves the context
    /// without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Effective budget: the caller's remaining time capped by `default`.
    pub fn budget(&self, default: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(default),
            None => default,
        }
    }

    /// Runs `fut` under this context.
    ///
    /// Cancellation wins over completion. Expiry of the budget yields
    /// `Unavailable { reason: Timeout }`.
    pub async fn bound<T, F>(
        &self,
        tier: Tier,
        op: &'static str,
        default: Duration,
        fut: F,
    ) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        if self.is_cancelled() {
            return Err(cancelled(tier, op));
        }

        let budget = self.budget(default);
        if budget.is_zero() {
            return Err(timed_out(tier, op, budget));
        }

        let timed = tokio::time::timeout(budget, fut);
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(cancelled(tier, op)),
                    res = timed => res.map_err(|_| timed_out(tier, op, budget))?,
                }
            }
            None => timed.await.map_err(|_| timed_out(tier, op, budget))?,
        }
    }
}

fn cancelled(tier: Tier, op: &str) -> CacheError {
    CacheError::unavailable(tier, UnavailableReason::Cancelled, format!("{op} cancelled"))
}

fn timed_out(tier: Tier, op: &str, budget: Duration) -> CacheError {
    CacheError::unavailable(
        tier,
        UnavailableReason::Timeout,
        format!("{op} exceeded {}ms", budget.as_millis()),
    )
}
