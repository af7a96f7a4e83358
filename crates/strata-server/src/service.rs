//! User operations over the cache and the source-of-truth store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strata_cache::{
    CacheError, CacheManager, CallContext, Resolved, Tier, TierHealth, ValueSource,
    email_reservation_key,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::{record_user_created, record_user_lookup};
use crate::models::{CreateUserRequest, User, user_cache_key};
use crate::store::{StoreError, UserStore};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("user {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { message } => Self::Conflict(message),
            other => Self::Store(other),
        }
    }
}

impl ServiceError {
    /// Whether the failure is a dependency being down rather than a bad request.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Cache(e) => e.is_unavailable(),
            Self::Store(StoreError::Backend { .. }) => true,
            _ => false,
        }
    }
}

/// Where a user was served from, as shown to API clients.
pub fn source_label(source: ValueSource) -> &'static str {
    match source {
        ValueSource::Local => "local",
        ValueSource::Distributed => "distributed",
        ValueSource::Origin => "database",
    }
}

/// Overall service health as reported by `/api/v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store: TierHealth,
    pub cache: BTreeMap<Tier, TierHealth>,
}

#[derive(Debug, Clone)]
pub struct UserService {
    cache: Arc<CacheManager>,
    store: Arc<dyn UserStore>,
    reservation_ttl: Duration,
    request_timeout: Duration,
}

impl UserService {
    pub fn new(
        cache: Arc<CacheManager>,
        store: Arc<dyn UserStore>,
        reservation_ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            reservation_ttl,
            request_timeout,
        }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn store(&self) -> &dyn UserStore {
        self.store.as_ref()
    }

    /// Context for cache calls made on behalf of one request.
    pub fn request_context(&self) -> CallContext {
        CallContext::background().with_timeout(self.request_timeout)
    }

    /// Looks a user up through the cache, falling back to the store.
    pub async fn get_user(&self, ctx: &CallContext, id: Uuid) -> Result<Resolved<User>, ServiceError> {
        let store = &self.store;
        let resolved = self
            .cache
            .get_or_set_json(ctx, &user_cache_key(id), || async move {
                store.find(id).await?.ok_or(ServiceError::NotFound(id))
            })
            .await?;

        for failure in resolved.advisory.failures() {
            warn!(user_id = %id, kind = ?failure.kind, tier = %failure.tier, "user cache side effect failed");
        }
        record_user_lookup(source_label(resolved.source));
        Ok(resolved)
    }

    /// Registers a user.
    ///
    /// The email is reserved in the cache before the store is touched, so
    /// concurrent registrations of one address are mostly turned away without
    /// a database round trip. The store's own unique index still decides when
    /// the reservation was assumed during a cache outage.
    pub async fn create_user(
        &self,
        ctx: &CallContext,
        req: CreateUserRequest,
    ) -> Result<User, ServiceError> {
        req.validate().map_err(ServiceError::Validation)?;

        let user = User::new(&req.username, &req.email);
        let email_key = email_reservation_key(&user.email);
        let holder = user.id.to_string();

        let reservation = self
            .cache
            .reserve_unique(ctx, &email_key, &holder, self.reservation_ttl)
            .await?;
        if !reservation.reserved {
            return Err(ServiceError::Conflict(format!(
                "email {} already registered",
                user.email
            )));
        }
        if reservation.assumed {
            warn!(email_key = %email_key, "email reservation assumed; relying on store uniqueness");
        }

        if let Err(e) = self.store.insert(&user).await {
            match self.cache.release_reservation(ctx, &email_key, &holder).await {
                Ok(released) => {
                    tracing::debug!(email_key = %email_key, released, "reservation released after failed insert")
                }
                Err(release_err) => {
                    warn!(email_key = %email_key, error = %release_err, "failed to release reservation")
                }
            }
            return Err(e.into());
        }

        match self.cache.set_json(ctx, &user.cache_key(), &user).await {
            Ok(advisory) => {
                for failure in advisory.failures() {
                    warn!(user_id = %user.id, tier = %failure.tier, "user cached with a tier failure");
                }
            }
            Err(e) => warn!(user_id = %user.id, error = %e, "failed to cache new user"),
        }

        record_user_created();
        info!(user_id = %user.id, username = %user.username, "user created");
        Ok(user)
    }

    pub async fn health(&self, ctx: &CallContext) -> HealthReport {
        let store = match self.store.health().await {
            Ok(()) => TierHealth::Healthy,
            Err(e) => TierHealth::Unhealthy(e.to_string()),
        };
        let cache = self.cache.health_check(ctx).await;

        let cache_ok = cache
            .values()
            .all(|h| !matches!(h, TierHealth::Unhealthy(_)));
        let status = match (store.is_healthy(), cache_ok) {
            (true, true) => "healthy",
            // Reads still reach the store while a cache tier is down.
            (true, false) if self.cache.policy().graceful_degradation => "degraded",
            _ => "unhealthy",
        };

        HealthReport {
            status,
            store,
            cache,
        }
    }

    /// Closes the cache tiers, then the store.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        let closed = self.cache.close().await;
        self.store.close().await;
        closed
    }
}
