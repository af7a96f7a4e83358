//! JSON encoding at the manager boundary. The tiers only ever see bytes.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::CallContext;
use crate::error::{CacheError, CacheResult};
use crate::manager::CacheManager;
use crate::outcome::{Advisory, CacheValue, Resolved, Source, ValueSource};

pub(crate) fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> CacheResult<CacheValue> {
    serde_json::to_vec(value)
        .map(Arc::from)
        .map_err(|e| CacheError::serialization(key, e))
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(bytes).map_err(|e| CacheError::serialization(key, e))
}

impl CacheManager {
    /// Reads and decodes a JSON value. `Ok(None)` on a miss.
    ///
    /// A cached value that fails to decode is a `Serialization` error, not a
    /// miss.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        key: &str,
    ) -> CacheResult<Option<Resolved<T>>> {
        let read = self.get(ctx, key).await?;
        let Some(bytes) = read.value else {
            return Ok(None);
        };
        let value = decode(key, &bytes)?;
        let source = match read.source {
            Source::Local => ValueSource::Local,
            _ => ValueSource::Distributed,
        };
        Ok(Some(Resolved {
            value,
            source,
            advisory: read.advisory,
        }))
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        key: &str,
        value: &T,
    ) -> CacheResult<Advisory> {
        let bytes = encode(key, value)?;
        self.set(ctx, key, bytes).await
    }

    /// Read-through lookup of a JSON value.
    ///
    /// Decode failures of cached bytes surface as errors. The fetched value is
    /// encoded and written back best-effort; if encoding fails the value is
    /// still returned and the failure shows up in the advisory.
    pub async fn get_or_set_json<T, F, Fut, E>(
        &self,
        ctx: &CallContext,
        key: &str,
        fetch: F,
    ) -> Result<Resolved<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        if let Some(hit) = self.get_json(ctx, key).await? {
            return Ok(hit);
        }

        let value = fetch().await?;
        let advisory = match encode(key, &value) {
            Ok(bytes) => self.backfill(ctx, key, bytes).await,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "skipping backfill of unencodable value");
                Advisory::new()
            }
        };

        Ok(Resolved {
            value,
            source: ValueSource::Origin,
            advisory,
        })
    }
}
