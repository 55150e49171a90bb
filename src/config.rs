use clap::builder::{BoolishValueParser, TypedValueParser};
use clap::parser::ValueSource;
use clap::{CommandFactory, FromArgMatches, Parser};
use hyper::http::uri::{Authority, Scheme};
use hyper::Uri;
use std::ffi::OsString;

/// Default address for the proxy to listen on
pub const DEFAULT_LISTEN: &str = "localhost:8000";

/// Hyphenated spelling of `PROXY_ONLY_METADATA`, read when that is unset
pub const ONLY_METADATA_HYPHEN_ENV: &str = "PROXY_ONLY-METADATA";

/// Errors raised while validating startup configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("registry must be set")]
    MissingRegistry,

    #[error("unable to parse registry address {registry:?}: {source}")]
    InvalidRegistry {
        registry: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },

    #[error("expected absolute registry URL, got {0:?}")]
    RelativeRegistry(String),
}

/// Command line and environment configuration
///
/// Every option can be given as a flag or as a `PROXY_`-prefixed environment
/// variable. Flags take precedence over the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "gar-proxy", version, about = "Authenticating proxy for Artifact Registry Docker repositories")]
pub struct Config {
    /// Address for the mirror to listen on.
    #[arg(long, env = "PROXY_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Only rely upon the GCE metadata server for authentication.
    /// Also read from PROXY_ONLY-METADATA.
    #[arg(long, env = "PROXY_ONLY_METADATA", value_parser = BoolishValueParser::new())]
    pub only_metadata: bool,

    /// URL of the registry to proxy requests to.
    #[arg(long, env = "PROXY_REGISTRY", default_value = "")]
    pub registry: String,
}

impl Config {
    /// Parse the process arguments and environment
    pub fn try_load() -> Result<Self, clap::Error> {
        Self::try_load_from(std::env::args_os(), |name| std::env::var_os(name))
    }

    /// Parse `args`, consulting `env` for the hyphenated metadata-only variable
    pub fn try_load_from<I, T, E>(args: I, env: E) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
        E: Fn(&str) -> Option<OsString>,
    {
        let mut command = Self::command();
        let matches = command.try_get_matches_from_mut(args)?;
        let mut config = Self::from_arg_matches(&matches)?;

        if matches.value_source("only_metadata") == Some(ValueSource::DefaultValue) {
            if let Some(value) = env(ONLY_METADATA_HYPHEN_ENV) {
                config.only_metadata = BoolishValueParser::new().parse_ref(&command, None, &value)?;
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.trim().is_empty() {
            return Err(ConfigError::MissingRegistry);
        }
        Ok(())
    }

    /// Parse the configured registry into the upstream target
    pub fn upstream(&self) -> Result<Upstream, ConfigError> {
        self.validate()?;
        Upstream::parse(&self.registry)
    }
}

/// The registry backend requests are forwarded to
///
/// Only scheme and authority are kept from the configured URL. Its path becomes
/// the [`prefix`](Upstream::prefix) that public requests are matched against,
/// generally `/<project>/<repository>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    scheme: Scheme,
    authority: Authority,
    host: String,
    prefix: String,
}

impl Upstream {
    pub fn parse(registry: &str) -> Result<Self, ConfigError> {
        let uri: Uri = registry
            .parse()
            .map_err(|source| ConfigError::InvalidRegistry {
                registry: registry.to_string(),
                source,
            })?;

        let (Some(scheme), Some(authority)) = (uri.scheme().cloned(), uri.authority().cloned()) else {
            return Err(ConfigError::RelativeRegistry(registry.to_string()));
        };

        let host = match authority.port() {
            Some(port) => format!("{}:{}", authority.host(), port),
            None => authority.host().to_string(),
        };
        let prefix = format!("{}/", uri.path().trim_end_matches('/'));

        Ok(Self {
            scheme,
            authority,
            host,
            prefix,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// `host[:port]` for the `Host` header, without any userinfo
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path prefix identifying the repository, always ending in a single `/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Base URL of the upstream, without any path
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// Build the absolute upstream URI for a rewritten path and query
    pub fn uri_for(&self, path_and_query: &str) -> Result<Uri, hyper::http::Error> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}
