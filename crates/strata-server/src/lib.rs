//! User service fronted by a two-tier cache.
//!
//! Reads go through [`strata_cache::CacheManager`] to the configured
//! [`store::UserStore`]; registrations reserve the email address in the
//! distributed tier before the store is written.

pub mod bootstrap;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod server;
pub mod service;
pub mod store;

pub use config::AppConfig;
pub use server::{AppState, ServerBuilder, StrataServer, build_app};
pub use service::{ServiceError, UserService};
