use crate::util::{SecurityViolation, UrlValidator};
use futures::stream::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, LOCATION};
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
pub const DEFAULT_USER_AGENT: &str = "Feed-Bower/1.0 (RSS Reader)";

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml, text/xml";

/// Longest single header value a caller may attach.
const MAX_HEADER_VALUE_LEN: usize = 1024;
/// Combined size of all caller-supplied header names and values.
const MAX_HEADER_BYTES: usize = 8192;

/// Headers that carry credentials, client identity or framing. The target
/// host is untrusted, so callers can never set these.
const FORBIDDEN_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
    "forwarded",
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Errors that can occur while fetching a feed.
///
/// All of these are fatal for the current attempt. The fetcher never retries;
/// the scheduler picks the source up again on its next run.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL, a redirect target or an outbound header was refused
    #[error("Request rejected: {0}")]
    Security(#[from] SecurityViolation),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The whole request exceeded the overall timeout
    #[error("Request timed out")]
    Timeout,
    /// A single body read stalled longer than the per-read timeout
    #[error("Body read stalled for more than {0:?}")]
    ReadTimeout(Duration),
    /// Response body exceeded the size ceiling
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// The redirect chain was longer than the policy allows
    #[error("Too many redirects (max {0})")]
    TooManyRedirects(usize),
    /// A redirect whose Location header is missing or unusable
    #[error("Invalid redirect: {0}")]
    BadRedirect(String),
}

impl FetchError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout;
        }
        // A connection refused by CheckedDns surfaces as a wrapped violation
        let mut cause = std::error::Error::source(&err);
        while let Some(e) = cause {
            if let Some(violation) = e.downcast_ref::<SecurityViolation>() {
                return FetchError::Security(violation.clone());
            }
            cause = e.source();
        }
        FetchError::Network(err)
    }
}

/// DNS for the HTTP client, answered by the validator's own resolver and
/// policy. The addresses that were checked are the only ones dialled, so a
/// host that re-resolves to a blocked network between validation and
/// connect is refused.
struct CheckedDns(UrlValidator);

impl reqwest::dns::Resolve for CheckedDns {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let validator = self.0.clone();
        Box::pin(async move {
            let ips = validator.resolve(name.as_str()).await?;
            // Port 0 is replaced with the URL's port by the connector
            let addrs: reqwest::dns::Addrs =
                Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// Time and size bounds for a fetch.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Overall request timeout, body included
    pub timeout: Duration,
    /// Deadline for each individual body read
    pub read_timeout: Duration,
    /// Hard ceiling on the response body
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_body_bytes: MAX_FEED_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// A successful (2xx) response whose body has not been read yet.
pub struct FetchResponse {
    pub status: u16,
    /// URL that produced the response, after redirects
    pub final_url: Url,
    pub body: BoundedBody,
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, FetchError>> + Send>>;

/// Response body reader enforcing a byte ceiling and a per-read deadline.
///
/// Each read races the next chunk against `read_timeout`; when the deadline
/// wins the pending read is dropped and [`FetchError::ReadTimeout`] is
/// returned. Reading stops as soon as the ceiling would be crossed, so an
/// oversized body is never buffered in full.
pub struct BoundedBody {
    chunks: ChunkStream,
    limit: usize,
    read_timeout: Duration,
    received: usize,
}

impl BoundedBody {
    fn from_response(
        response: reqwest::Response,
        limit: usize,
        read_timeout: Duration,
    ) -> Result<Self, FetchError> {
        // Fast path: check Content-Length header
        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(FetchError::ResponseTooLarge(limit));
            }
        }

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(FetchError::from_reqwest));
        Ok(Self::from_stream(chunks, limit, read_timeout))
    }

    pub(crate) fn from_stream<S>(stream: S, limit: usize, read_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, FetchError>> + Send + 'static,
    {
        Self {
            chunks: Box::pin(stream),
            limit,
            read_timeout,
            received: 0,
        }
    }

    /// Bytes accepted so far.
    pub fn bytes_read(&self) -> usize {
        self.received
    }

    /// Reads the next chunk, `Ok(None)` at end of body.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        let next = tokio::time::timeout(self.read_timeout, self.chunks.next())
            .await
            .map_err(|_| FetchError::ReadTimeout(self.read_timeout))?;

        match next {
            None => Ok(None),
            Some(chunk) => {
                let chunk = chunk?;
                if self.received.saturating_add(chunk.len()) > self.limit {
                    return Err(FetchError::ResponseTooLarge(self.limit));
                }
                self.received += chunk.len();
                Ok(Some(chunk))
            }
        }
    }

    /// Drains the body. Partial data is discarded on any error.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, FetchError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

/// Validates caller-supplied headers and builds the outbound header map.
///
/// Rejects NUL/CR/LF in names or values, oversized values, and any header
/// on the sensitive deny-list (credentials, cookies, forwarding identity).
pub fn validate_headers(headers: &[(&str, &str)]) -> Result<HeaderMap, SecurityViolation> {
    let mut map = HeaderMap::new();
    let mut total = 0usize;

    for (name, value) in headers {
        if name.is_empty() || name.contains(['\0', '\r', '\n']) || value.contains(['\0', '\r', '\n'])
        {
            return Err(SecurityViolation::InvalidHeader(name.escape_debug().to_string()));
        }
        if FORBIDDEN_HEADERS
            .iter()
            .any(|forbidden| forbidden.eq_ignore_ascii_case(name))
        {
            return Err(SecurityViolation::ForbiddenHeader((*name).to_owned()));
        }
        if value.len() > MAX_HEADER_VALUE_LEN {
            return Err(SecurityViolation::InvalidHeader((*name).to_owned()));
        }
        total = total.saturating_add(name.len() + value.len());
        if total > MAX_HEADER_BYTES {
            return Err(SecurityViolation::InvalidHeader((*name).to_owned()));
        }

        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| SecurityViolation::InvalidHeader((*name).to_owned()))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| SecurityViolation::InvalidHeader((*name).to_owned()))?;
        map.insert(header_name, header_value);
    }

    Ok(map)
}

/// HTTP client that only talks to URLs the [`UrlValidator`] accepts.
///
/// Automatic redirects are disabled: every hop is validated here before it
/// is followed, and the chain is cut off at the policy's `max_redirects`.
/// Host names are resolved for connecting through the same validator.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    validator: UrlValidator,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(validator: UrlValidator, config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .dns_resolver(CheckedDns(validator.clone()))
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            validator,
            config,
        })
    }

    pub fn validator(&self) -> &UrlValidator {
        &self.validator
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Performs a GET against an untrusted URL.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Security`] - URL, redirect target or header rejected
    /// - [`FetchError::TooManyRedirects`] - chain longer than the policy allows
    /// - [`FetchError::HttpStatus`] - final response is not 2xx
    /// - [`FetchError::Timeout`] - overall timeout exceeded
    /// - [`FetchError::ResponseTooLarge`] - declared Content-Length above the ceiling
    /// - [`FetchError::Network`] - connection or TLS failure
    pub async fn fetch(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchResponse, FetchError> {
        let headers = validate_headers(headers)?;
        tokio::time::timeout(self.config.timeout, self.send_following_redirects(url, headers))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    /// Fetches a feed document and reads its body under the configured bounds.
    pub async fn fetch_feed(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        tokio::time::timeout(self.config.timeout, async {
            let response = self.fetch(url, &[(ACCEPT.as_str(), FEED_ACCEPT)]).await?;
            response.body.read_to_end().await
        })
        .await
        .map_err(|_| FetchError::Timeout)?
    }

    async fn send_following_redirects(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchResponse, FetchError> {
        let max_redirects = self.validator.policy().max_redirects;
        let mut current = self.validator.validate(url).await?;
        let mut hops = 0usize;

        loop {
            let response = self
                .client
                .get(current.clone())
                .headers(headers.clone())
                .send()
                .await
                .map_err(FetchError::from_reqwest)?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(location) = response.headers().get(LOCATION) {
                    if hops >= max_redirects {
                        return Err(FetchError::TooManyRedirects(max_redirects));
                    }
                    let location = location
                        .to_str()
                        .map_err(|_| FetchError::BadRedirect("non-ASCII Location".to_string()))?;
                    let next = current
                        .join(location)
                        .map_err(|e| FetchError::BadRedirect(e.to_string()))?;
                    tracing::debug!(from = %current, to = %next, hop = hops + 1, "Following redirect");
                    current = self.validator.validate(next.as_str()).await?;
                    hops += 1;
                    continue;
                }
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let body = BoundedBody::from_response(
                response,
                self.config.max_body_bytes,
                self.config.read_timeout,
            )?;
            return Ok(FetchResponse {
                status: status.as_u16(),
                final_url: current,
                body,
            });
        }
    }
}
