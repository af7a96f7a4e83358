//! Result types shared by the tiers and the manager.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::CacheError;

/// Cached payload. Cloning is a reference-count bump.
pub type CacheValue = Arc<[u8]>;

/// A layer of the cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// In-process sharded store.
    Local,
    /// Shared network-backed store.
    Distributed,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Distributed => "distributed",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single tier reports for a lookup. Failures travel as
/// [`CacheError::Unavailable`], never as a variant here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CacheValue),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_value(self) -> Option<CacheValue> {
        match self {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss => None,
        }
    }
}

/// Tagged outcome of a manager-level lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    HitLocal,
    HitDistributed,
    Miss,
    /// The distributed tier failed and the failure was not degraded.
    Unavailable,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HitLocal => write!(f, "hit_local"),
            Self::HitDistributed => write!(f, "hit_distributed"),
            Self::Miss => write!(f, "miss"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Where a `get` found its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    Distributed,
    Miss,
}

impl Source {
    pub fn outcome(self) -> CacheOutcome {
        match self {
            Source::Local => CacheOutcome::HitLocal,
            Source::Distributed => CacheOutcome::HitDistributed,
            Source::Miss => CacheOutcome::Miss,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Local => write!(f, "local"),
            Source::Distributed => write!(f, "distributed"),
            Source::Miss => write!(f, "miss"),
        }
    }
}

/// Which best-effort step was taken alongside the primary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectKind {
    /// Local copy written after a distributed hit.
    LocalWriteBack,
    /// Local copy of a successful reservation.
    ReservationMirror,
    /// Tiers populated after a fetch from the origin.
    Backfill,
    /// A tier write that failed but was tolerated by policy.
    TolerantWrite,
    /// A tier delete that failed but was tolerated by policy.
    TolerantDelete,
}

/// One best-effort step and how it went.
#[derive(Debug)]
pub struct SideEffect {
    pub kind: SideEffectKind,
    pub tier: Tier,
    pub outcome: Result<(), CacheError>,
}

impl SideEffect {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Best-effort work attached to a result. Never affects the primary outcome.
#[derive(Debug, Default)]
pub struct Advisory {
    effects: Vec<SideEffect>,
}

impl Advisory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, kind: SideEffectKind, tier: Tier, outcome: Result<(), CacheError>) {
        self.effects.push(SideEffect { kind, tier, outcome });
    }

    pub(crate) fn extend(&mut self, other: Advisory) {
        self.effects.extend(other.effects);
    }

    pub fn effects(&self) -> &[SideEffect] {
        &self.effects
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// First recorded effect of the given kind.
    pub fn find(&self, kind: SideEffectKind) -> Option<&SideEffect> {
        self.effects.iter().find(|e| e.kind == kind)
    }

    pub fn attempted(&self, kind: SideEffectKind) -> bool {
        self.find(kind).is_some()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SideEffect> {
        self.effects.iter().filter(|e| e.outcome.is_err())
    }
}

/// Result of [`CacheManager::get`](crate::CacheManager::get).
#[derive(Debug)]
pub struct CacheRead {
    pub value: Option<CacheValue>,
    pub source: Source,
    pub advisory: Advisory,
}

impl CacheRead {
    pub(crate) fn miss(advisory: Advisory) -> Self {
        Self {
            value: None,
            source: Source::Miss,
            advisory,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.value.is_some()
    }

    pub fn outcome(&self) -> CacheOutcome {
        self.source.outcome()
    }
}

/// Where a read-through value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Local,
    Distributed,
    /// Fetched from the source of truth on a full miss.
    Origin,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::Local => write!(f, "local"),
            ValueSource::Distributed => write!(f, "distributed"),
            ValueSource::Origin => write!(f, "origin"),
        }
    }
}

/// Result of a read-through call.
#[derive(Debug)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ValueSource,
    pub advisory: Advisory,
}

impl<T> Resolved<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        Resolved {
            value: f(self.value),
            source: self.source,
            advisory: self.advisory,
        }
    }
}

/// Result of a uniqueness reservation attempt.
#[derive(Debug)]
pub struct Reservation {
    /// `true` when the caller now holds the key.
    pub reserved: bool,
    /// `true` when `reserved` was granted by the fail-open policy during an
    /// outage rather than by the distributed tier.
    pub assumed: bool,
    pub advisory: Advisory,
}

/// Health of a single tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TierHealth {
    Healthy,
    Unhealthy(String),
    Disabled,
}

impl TierHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, TierHealth::Healthy)
    }
}
