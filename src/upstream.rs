//! HTTP(S) client forwarding requests to the upstream registry
//!
//! Wraps a pooled hyper client with a rustls connector. Requests and responses
//! are streamed through unchanged apart from hop-by-hop headers.

use crate::config::Upstream;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use tracing::debug;

/// Error type for upstream forwarding
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    /// Error setting up TLS
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Client for the single configured upstream
pub struct UpstreamClient {
    upstream: Upstream,
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl UpstreamClient {
    pub fn new(upstream: Upstream) -> Result<Self, UpstreamError> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new()).build(https);

        debug!(upstream = %upstream.origin(), "Upstream client initialized");

        Ok(Self { upstream, client })
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Forward a request to `path_and_query` on the upstream
    ///
    /// The `Host` header is set to the upstream host; all other headers
    /// are expected to be prepared by the caller.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let uri = self.upstream.uri_for(path_and_query)?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = hyper::Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(
            hyper::header::HOST,
            HeaderValue::from_str(self.upstream.host())
                .map_err(hyper::http::Error::from)?,
        );

        let backend_req = Request::from_parts(parts, body);
        let response = self.client.request(backend_req).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}
