//! Two-tier cache orchestration.
//!
//! [`CacheManager`] fronts an in-process [`LocalTier`] and a shared
//! [`DistributedTier`] (Redis in production, [`MemoryTier`] for single-node
//! deployments and tests), with read-through population, write-through,
//! uniqueness reservations and a policy-driven answer to tier outages.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use strata_cache::{CacheManager, CallContext, LocalTier, LocalTierConfig, MemoryTier};
//!
//! # async fn demo() -> Result<(), strata_cache::CacheError> {
//! let local = Arc::new(LocalTier::new(&LocalTierConfig::default(), Duration::from_secs(60))?);
//! let cache = CacheManager::builder()
//!     .local(local)
//!     .distributed(Arc::new(MemoryTier::new()))
//!     .build();
//!
//! let ctx = CallContext::background().with_timeout(Duration::from_millis(500));
//! cache.set(&ctx, "user:1", b"alice".to_vec()).await?;
//! let read = cache.get(&ctx, "user:1").await?;
//! assert!(read.is_hit());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod distributed;
pub mod error;
mod json;
pub mod local;
pub mod manager;
pub mod metrics;
pub mod outcome;
pub mod policy;
pub mod reservation;

pub use config::{CacheConfig, LocalTierConfig, PolicyConfig, RedisTierConfig};
pub use context::CallContext;
pub use distributed::{DistributedTier, MemoryTier, RedisTier};
pub use error::{CacheError, CacheResult, UnavailableReason};
pub use local::LocalTier;
pub use manager::{CacheManager, CacheManagerBuilder};
pub use metrics::{CacheMetricsReport, MetricsSnapshot, TierReport};
pub use outcome::{
    Advisory, CacheOutcome, CacheRead, CacheValue, Lookup, Reservation, Resolved, SideEffect,
    SideEffectKind, Source, Tier, TierHealth, ValueSource,
};
pub use policy::{CachePolicy, ReservationOutage};
pub use reservation::email_reservation_key;
