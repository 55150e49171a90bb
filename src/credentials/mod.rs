//! Google Cloud credentials used to authenticate upstream registry calls
//!
//! A single [`Credentials`] handle is built at startup, either from the
//! metadata server alone or through application default credentials, and is
//! shared by every request handler. Token caching and refresh are left to
//! `google-cloud-auth`.

pub mod metadata;

use google_cloud_auth::credentials::{self as auth, CacheableResource};
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::http::Extensions;
use tracing::{debug, info};

/// OAuth scope granting access to all Google Cloud APIs
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("not running on GCE instance to use metadata server")]
    NotOnGce,

    #[error("unable to load credentials: {0}")]
    Build(#[from] google_cloud_auth::build_errors::Error),

    #[error("unable to fetch access token: {0}")]
    Token(#[from] google_cloud_auth::errors::CredentialsError),

    #[error("credentials produced no Authorization header")]
    MissingAuthorization,
}

/// How credentials are located at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// Use only the local metadata server
    OnlyMetadata,
    /// Application default credentials: key files, gcloud, then the metadata server
    Default,
}

impl CredentialMode {
    pub fn from_only_metadata(only_metadata: bool) -> Self {
        if only_metadata {
            CredentialMode::OnlyMetadata
        } else {
            CredentialMode::Default
        }
    }
}

impl std::fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialMode::OnlyMetadata => write!(f, "only-metadata"),
            CredentialMode::Default => write!(f, "default"),
        }
    }
}

/// Shared handle producing `Authorization` values for the upstream registry
#[derive(Clone)]
pub struct Credentials {
    inner: auth::Credentials,
}

impl Credentials {
    /// Wrap credentials built elsewhere
    pub fn new(inner: auth::Credentials) -> Self {
        install_tls_provider();
        Self { inner }
    }

    /// Locate credentials according to `mode`
    pub async fn discover(mode: CredentialMode) -> Result<Self, CredentialsError> {
        install_tls_provider();

        let inner = match mode {
            CredentialMode::OnlyMetadata => {
                if !metadata::on_gce().await {
                    return Err(CredentialsError::NotOnGce);
                }
                auth::mds::Builder::default()
                    .with_scopes([CLOUD_PLATFORM_SCOPE])
                    .build()?
            }
            CredentialMode::Default => auth::Builder::default()
                .with_scopes([CLOUD_PLATFORM_SCOPE])
                .build()?,
        };

        debug!(mode = %mode, "Credentials loaded");
        Ok(Self { inner })
    }

    /// Current `Authorization` header value, refreshed by the credentials as needed
    pub async fn authorization(&self) -> Result<HeaderValue, CredentialsError> {
        let headers = match self.inner.headers(Extensions::new()).await? {
            CacheableResource::New { data, .. } => data,
            CacheableResource::NotModified => return Err(CredentialsError::MissingAuthorization),
        };

        let mut value = headers
            .get(AUTHORIZATION)
            .cloned()
            .ok_or(CredentialsError::MissingAuthorization)?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Fetch a first token so broken credentials fail at startup
    pub async fn validate(&self) -> Result<(), CredentialsError> {
        self.authorization().await?;
        info!("Credentials validated");
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

/// Select ring as the process TLS provider when none has been installed yet
fn install_tls_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
