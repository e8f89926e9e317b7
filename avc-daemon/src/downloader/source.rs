use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use avc_core::UpdateResult;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("transfer interrupted: {0}")]
    Interrupted(String),
    #[error("server answered {0}")]
    Status(u16),
    #[error("unsupported uri scheme: {0}")]
    Unsupported(String),
    #[error("failed to read CA certificate: {0}")]
    Certificate(#[from] std::io::Error),
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Interrupted(_))
    }

    pub fn update_result(&self) -> UpdateResult {
        match self {
            FetchError::Unsupported(_) => UpdateResult::Unsupported,
            _ => UpdateResult::ConnectionError,
        }
    }
}

/// Body of a package response.
pub struct PackageStream {
    /// Offset of the first byte of `chunks`. Zero when the server ignored the
    /// requested range.
    pub offset: u64,
    /// Full package size, when the server announced it.
    pub total_size: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, FetchError>>,
}

/// Where package bytes come from.
#[async_trait]
pub trait PackageSource: Send + Sync + 'static {
    /// Request the package starting at `offset`.
    async fn fetch(&self, uri: &Url, offset: u64) -> Result<PackageStream, FetchError>;
}

/// HTTP(S) package source using range requests to resume.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(connect_timeout: Duration, ca_cert: Option<&Path>) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("avc-daemon/", env!("CARGO_PKG_VERSION")));

        if let Some(path) = ca_cert {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[async_trait]
impl PackageSource for HttpSource {
    async fn fetch(&self, uri: &Url, offset: u64) -> Result<PackageStream, FetchError> {
        match uri.scheme() {
            "http" | "https" => {}
            other => return Err(FetchError::Unsupported(other.to_owned())),
        }

        let mut request = self.client.get(uri.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let start = match response.status() {
            StatusCode::PARTIAL_CONTENT => offset,
            StatusCode::OK => {
                if offset > 0 {
                    warn!(%uri, offset, "server ignored range request, restarting from zero");
                }
                0
            }
            // Asked for the bytes after the last one: nothing is missing.
            StatusCode::RANGE_NOT_SATISFIABLE
                if offset > 0 && content_range_total(response.headers()) == Some(offset) =>
            {
                debug!(%uri, offset, "package already complete");
                return Ok(PackageStream {
                    offset,
                    total_size: Some(offset),
                    chunks: futures::stream::empty::<Result<Bytes, FetchError>>().boxed(),
                });
            }
            other => return Err(FetchError::Status(other.as_u16())),
        };

        let total_size = content_range_total(response.headers())
            .or_else(|| response.content_length().map(|len| start + len));

        debug!(%uri, start, ?total_size, "package response received");

        Ok(PackageStream {
            offset: start,
            total_size,
            chunks: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(FetchError::from))
                .boxed(),
        })
    }
}
