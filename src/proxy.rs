use crate::credentials::Credentials;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::rewrite::{PathRewriter, Route};
use crate::upstream::UpstreamClient;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// State shared by every connection
struct Shared {
    upstream: UpstreamClient,
    credentials: Arc<Credentials>,
    rewriter: PathRewriter,
}

/// The authenticating reverse proxy server
pub struct ProxyServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener; `listen` may name a host (`localhost:8000`)
    pub async fn bind(
        listen: &str,
        upstream: UpstreamClient,
        credentials: Arc<Credentials>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| anyhow::anyhow!("Unable to listen on {}: {}", listen, e))?;
        let rewriter = PathRewriter::new(upstream.upstream().prefix());

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                upstream,
                credentials,
                rewriter,
            }),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            upstream = %self.shared.upstream.upstream().origin(),
            pattern = self.shared.rewriter.pattern(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, shared).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, shared: Arc<Shared>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(String::from);
    let route = shared.rewriter.route(&path, query.as_deref());

    debug!(method = %req.method(), uri = %req.uri(), route = ?route, "Incoming request");

    let path_and_query = match route {
        Route::Redirect { location } => return Ok(build_redirect(&location)),
        Route::PassThrough => req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        Route::Registry { upstream_path } => {
            let authorization = match shared.credentials.authorization().await {
                Ok(value) => value,
                Err(e) => {
                    error!(path, error = %e, "Unable to fetch access token");
                    return Ok(json_error_response(
                        ProxyErrorCode::TokenUnavailable,
                        "Unable to fetch access token",
                    ));
                }
            };
            req.headers_mut().insert(hyper::header::AUTHORIZATION, authorization);

            match query {
                Some(q) => format!("{upstream_path}?{q}"),
                None => upstream_path,
            }
        }
    };

    append_forwarded_for(req.headers_mut(), client_addr);

    match shared.upstream.send_request(req, &path_and_query).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(path_and_query, error = %e, "Failed to forward request to registry");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to registry",
            ))
        }
    }
}

/// Append the client IP to `X-Forwarded-For`, joining any earlier hops
fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let chain = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Build a redirect to the registry API subtree (301 Moved Permanently)
fn build_redirect(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(b"Moved Permanently"))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
