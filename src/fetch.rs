//! The downloader seam: how the streaming core asks the host for bytes.
//!
//! All network traffic — manifests, media segments, decryption keys, clock
//! probes — goes through a [`UriDownloader`], injected when a session is
//! created. The trait is deliberately narrow: fetch a URI (optionally a byte
//! range of it), report the post-redirect URI and response headers, and
//! stream the body. Cancellation is by dropping the response; an in-flight
//! transfer must stop promptly when its stream is dropped.
//!
//! When the `fetch` cargo feature is enabled (the default) an
//! [`HttpDownloader`] backed by reqwest is available.

use std::collections::HashMap;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use url::Url;

use crate::{ByteRange, StreamError};

/// A requested byte range: first offset and optional inclusive last offset
/// (None requests everything from `start` to the end of the resource).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl RequestRange {
    pub fn new(start: u64, end: Option<u64>) -> RequestRange {
        RequestRange { start, end }
    }

    /// Value for an HTTP `Range` header.
    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl From<ByteRange> for RequestRange {
    fn from(r: ByteRange) -> RequestRange {
        RequestRange { start: r.offset, end: Some(r.end() - 1) }
    }
}

/// One download to perform.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub uri: Url,
    pub range: Option<RequestRange>,
    pub referer: Option<Url>,
    /// False when the playlist forbids caching (`EXT-X-ALLOW-CACHE:NO`).
    pub allow_cache: bool,
    /// Bypass intermediary caches and revalidate, for key-refresh retries
    /// and manifest refreshes that must see the latest version.
    pub refresh: bool,
}

impl DownloadRequest {
    pub fn new(uri: Url) -> DownloadRequest {
        DownloadRequest { uri, range: None, referer: None, allow_cache: true, refresh: false }
    }

    pub fn with_range(mut self, range: Option<RequestRange>) -> DownloadRequest {
        self.range = range;
        self
    }

    pub fn with_referer(mut self, referer: Option<Url>) -> DownloadRequest {
        self.referer = referer;
        self
    }

    pub fn with_allow_cache(mut self, allow: bool) -> DownloadRequest {
        self.allow_cache = allow;
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> DownloadRequest {
        self.refresh = refresh;
        self
    }
}

/// Response metadata available before the body has been consumed.
#[derive(Debug, Clone)]
pub struct DownloadMeta {
    /// URI after following redirects.
    pub final_uri: Url,
    /// True when the redirect chain contained a permanent (301/308)
    /// redirect, in which case the playlist's persisted base URI is updated.
    pub is_permanent_redirect: bool,
    pub headers: HashMap<String, String>,
}

/// Streaming download body.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// A started download: metadata plus the body stream. Dropping it cancels
/// the transfer.
pub struct DownloadResponse {
    pub meta: DownloadMeta,
    pub body: ByteStream,
}

/// The injected HTTP transport.
#[async_trait]
pub trait UriDownloader: Send + Sync {
    async fn fetch(&self, request: DownloadRequest) -> Result<DownloadResponse, StreamError>;
}

/// Fetch a resource and collect its whole body, for small documents such as
/// manifests and keys.
pub async fn fetch_bytes(
    downloader: &dyn UriDownloader,
    request: DownloadRequest,
) -> Result<(DownloadMeta, Bytes), StreamError> {
    use futures_util::StreamExt;

    let response = downloader.fetch(request).await?;
    let meta = response.meta;
    let mut body = response.body;
    let mut collected = bytes::BytesMut::new();
    while let Some(chunk) = body.next().await {
        collected.extend_from_slice(&chunk?);
    }
    Ok((meta, collected.freeze()))
}

#[cfg(feature = "fetch")]
pub use http::{error_is_transient, HttpClient, HttpDownloader};

#[cfg(feature = "fetch")]
mod http {
    use super::*;
    use futures_util::StreamExt;
    use tracing::{debug, trace, warn};

    /// A `Client` from the `reqwest` crate, that we use to download content
    /// over HTTP.
    pub type HttpClient = reqwest::Client;

    /// Default [`UriDownloader`] implementation on top of reqwest.
    ///
    /// Redirects are followed manually (up to a small limit) so that the
    /// permanence of the redirect chain can be reported, which decides
    /// whether relative playlist URIs are re-anchored for subsequent
    /// requests.
    pub struct HttpDownloader {
        client: HttpClient,
    }

    const MAX_REDIRECTS: usize = 10;

    impl HttpDownloader {
        pub fn new() -> HttpDownloader {
            let client = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("creating HTTP client");
            HttpDownloader { client }
        }

        /// Use a custom reqwest client (proxy, user agent, timeouts…). The
        /// client should disable automatic redirects, otherwise redirect
        /// permanence cannot be observed and is reported as false.
        pub fn with_client(client: HttpClient) -> HttpDownloader {
            HttpDownloader { client }
        }
    }

    impl Default for HttpDownloader {
        fn default() -> Self {
            HttpDownloader::new()
        }
    }

    fn is_redirect(status: reqwest::StatusCode) -> bool {
        matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
    }

    #[async_trait]
    impl UriDownloader for HttpDownloader {
        async fn fetch(
            &self,
            request: DownloadRequest,
        ) -> Result<DownloadResponse, StreamError> {
            let mut uri = request.uri.clone();
            let mut permanent = false;
            let mut response = None;
            for _hop in 0..=MAX_REDIRECTS {
                let mut req = self.client.get(uri.clone());
                if let Some(range) = &request.range {
                    req = req.header(reqwest::header::RANGE, range.to_header_value());
                }
                if let Some(referer) = &request.referer {
                    req = req.header(reqwest::header::REFERER, referer.as_str());
                }
                if request.refresh {
                    req = req.header(reqwest::header::CACHE_CONTROL, "no-cache");
                } else if !request.allow_cache {
                    req = req.header(reqwest::header::CACHE_CONTROL, "no-store");
                }
                trace!(%uri, range = ?request.range, "HTTP GET");
                let resp = req
                    .send()
                    .await
                    .map_err(|e| StreamError::Network(format!("requesting {uri}: {e}")))?;
                let status = resp.status();
                if is_redirect(status) {
                    permanent |= matches!(status.as_u16(), 301 | 308);
                    let location = resp
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|l| l.to_str().ok())
                        .ok_or_else(|| {
                            StreamError::Network(format!("redirect from {uri} without Location"))
                        })?;
                    uri = uri.join(location).map_err(|e| {
                        StreamError::Network(format!("bad redirect target {location}: {e}"))
                    })?;
                    debug!(%uri, permanent, "following redirect");
                    continue;
                }
                response = Some(resp);
                break;
            }
            let response = response.ok_or_else(|| {
                StreamError::Network(format!("too many redirects fetching {}", request.uri))
            })?;
            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND
                || status == reqwest::StatusCode::GONE
            {
                return Err(StreamError::ResourceNotFound(uri.to_string()));
            }
            if !status.is_success() {
                warn!(%uri, %status, "HTTP request failed");
                return Err(StreamError::Network(format!("{uri} returned HTTP {status}")));
            }
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))
                })
                .collect();
            let meta = DownloadMeta {
                final_uri: uri,
                is_permanent_redirect: permanent,
                headers,
            };
            let body = response
                .bytes_stream()
                .map(|chunk| {
                    chunk.map_err(|e| StreamError::Network(format!("reading body: {e}")))
                })
                .boxed();
            Ok(DownloadResponse { meta, body })
        }
    }

    /// True for errors worth an immediate in-place retry (timeouts,
    /// connection resets, 408/429/503/504) as opposed to hard failures.
    pub fn error_is_transient(e: &reqwest::Error) -> bool {
        if e.is_timeout() || e.is_connect() {
            return true;
        }
        if let Some(s) = e.status() {
            if s == reqwest::StatusCode::REQUEST_TIMEOUT
                || s == reqwest::StatusCode::TOO_MANY_REQUESTS
                || s == reqwest::StatusCode::SERVICE_UNAVAILABLE
                || s == reqwest::StatusCode::GATEWAY_TIMEOUT
            {
                return true;
            }
        }
        false
    }
}
