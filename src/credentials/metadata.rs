//! Detection of the GCE metadata service

use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the metadata server address
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

const METADATA_IP: &str = "169.254.169.254";
const METADATA_HOSTNAME: &str = "metadata.google.internal.";
const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";

/// Bound on how long environment detection may take
const DETECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Report whether the process runs on Google Compute infrastructure
///
/// An explicit `GCE_METADATA_HOST` is trusted as-is. Otherwise the metadata
/// server is queried over HTTP while its DNS name is resolved; the first
/// positive answer wins.
pub async fn on_gce() -> bool {
    if std::env::var_os(METADATA_HOST_ENV).is_some() {
        return true;
    }
    detect(&format!("http://{METADATA_IP}"), METADATA_HOSTNAME).await
}

async fn detect(root_url: &str, hostname: &str) -> bool {
    let http_check = Box::pin(async {
        let client = reqwest::Client::builder().timeout(DETECT_TIMEOUT).build().ok()?;
        let response = client.get(root_url).send().await.ok()?;
        let flavor = response.headers().get(METADATA_FLAVOR_HEADER)?;
        (flavor == METADATA_FLAVOR).then_some(())
    });

    let dns_check = Box::pin(async {
        let mut addrs = tokio::net::lookup_host((hostname, 80)).await.ok()?;
        addrs.next().map(|_| ())
    });

    let first_positive = async {
        match futures::future::select(http_check, dns_check).await {
            futures::future::Either::Left((Some(()), _)) => true,
            futures::future::Either::Right((Some(()), _)) => true,
            futures::future::Either::Left((None, other)) => other.await.is_some(),
            futures::future::Either::Right((None, other)) => other.await.is_some(),
        }
    };

    match tokio::time::timeout(DETECT_TIMEOUT, first_positive).await {
        Ok(found) => {
            debug!(found, "Metadata server detection finished");
            found
        }
        Err(_) => {
            debug!("Metadata server detection timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn answer_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_detects_metadata_flavor() {
        let url = answer_once(
            "HTTP/1.1 200 OK\r\nMetadata-Flavor: Google\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(detect(&url, "metadata.invalid.").await);
    }

    #[tokio::test]
    async fn test_ignores_other_servers() {
        let url =
            answer_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        assert!(!detect(&url, "metadata.invalid.").await);
    }
}
