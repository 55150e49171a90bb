//! gar-proxy - An authenticating reverse proxy for Artifact Registry
//!
//! This library provides a proxy that lets Docker clients use a Google
//! Artifact Registry repository as a plain registry mirror:
//! - Requests under `/<project>/<repository>/v2/` are rewritten to the
//!   upstream layout `/v2/<project>/<repository>/`
//! - Those requests carry a Google Cloud access token as a bearer credential
//! - Everything else is forwarded to the registry host untouched
//! - Credentials come from the metadata server or default discovery

pub mod config;
pub mod credentials;
pub mod error;
pub mod proxy;
pub mod rewrite;
pub mod upstream;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
