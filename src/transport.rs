/*!
 * HTTP transport boundary
 *
 * The resilience layer never speaks HTTP itself. It drives a [`Transport`],
 * one instance per pooled checkout, and expects every failure back as a
 * precise [`ResilienceError`]. Response decompression is the transport's job.
 */

use salvo_core_resilience::{Destination, ResilienceError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Bytes of a non-2xx body kept in the error message
const ERROR_BODY_PREVIEW: usize = 512;

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            other => Err(ResilienceError::InvalidRequest(format!(
                "unsupported method '{}'",
                other
            ))),
        }
    }
}

/// Outbound request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Per-request limits handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// Deadline for the whole exchange
    pub timeout: Duration,
    /// Larger response bodies fail with `BodyTooLarge`
    pub max_body_bytes: usize,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Response as returned by the transport, body already decompressed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value matching `name`, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// One HTTP client with non-shareable state
///
/// `send` takes `&mut self`: a transport is used by one checkout at a time.
pub trait Transport: Send + 'static {
    fn send(
        &mut self,
        request: &HttpRequest,
        options: &RequestOptions,
    ) -> Result<HttpResponse, ResilienceError>;

    /// Cheap liveness check used by pool health sweeps
    fn probe(&self) -> bool {
        true
    }
}

/// Turn a non-2xx response into `ResilienceError::Http`
pub fn check_status(response: HttpResponse) -> Result<HttpResponse, ResilienceError> {
    if response.is_success() {
        return Ok(response);
    }

    let end = response.body.len().min(ERROR_BODY_PREVIEW);
    let message = String::from_utf8_lossy(&response.body[..end]).into_owned();
    Err(ResilienceError::Http {
        status: response.status,
        message,
    })
}

/// Pool destination for a URL: host plus explicit or scheme-default port
pub fn destination_of(url: &str) -> Result<Destination, ResilienceError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| ResilienceError::InvalidRequest(format!("invalid URL '{}': {}", url, e)))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| ResilienceError::InvalidRequest(format!("URL '{}' has no host", url)))?;
    let port = parsed.port_or_known_default().ok_or_else(|| {
        ResilienceError::InvalidRequest(format!("URL '{}' has no port for its scheme", url))
    })?;

    Ok(Destination::new(host, port))
}

/// Bytes to read for a body capped at `limit`: one past it, so overflow shows
#[cfg_attr(not(feature = "reqwest-transport"), allow(dead_code))]
fn body_read_cap(limit: usize) -> u64 {
    u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1)
}

#[cfg(feature = "reqwest-transport")]
pub use self::reqwest_impl::{ReqwestFactory, ReqwestTransport};

#[cfg(feature = "reqwest-transport")]
mod reqwest_impl {
    use super::{HttpMethod, HttpRequest, HttpResponse, RequestOptions, Transport};
    use salvo_core_resilience::{Destination, ResilienceError, ResourceFactory};
    use std::error::Error as StdError;
    use std::io::{self, Read};
    use std::time::Duration;

    /// Blocking reqwest client bound to one destination
    #[derive(Debug)]
    pub struct ReqwestTransport {
        client: reqwest::blocking::Client,
        destination: Destination,
        broken: bool,
    }

    impl ReqwestTransport {
        pub fn destination(&self) -> &Destination {
            &self.destination
        }
    }

    impl Transport for ReqwestTransport {
        fn send(
            &mut self,
            request: &HttpRequest,
            options: &RequestOptions,
        ) -> Result<HttpResponse, ResilienceError> {
            let mut builder = self
                .client
                .request(to_reqwest_method(request.method), &request.url)
                .timeout(options.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if !request.body.is_empty() {
                builder = builder.body(request.body.clone());
            }

            let response = builder.send().map_err(|e| self.classify(e, options))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();

            let limit = options.max_body_bytes;
            if response
                .content_length()
                .is_some_and(|length| length > limit as u64)
            {
                return Err(ResilienceError::BodyTooLarge { limit });
            }

            let mut body = Vec::new();
            response
                .take(super::body_read_cap(limit))
                .read_to_end(&mut body)
                .map_err(|e| self.classify_read(e, options))?;
            if body.len() > limit {
                return Err(ResilienceError::BodyTooLarge { limit });
            }

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }

        fn probe(&self) -> bool {
            !self.broken
        }
    }

    impl ReqwestTransport {
        fn classify(&mut self, err: reqwest::Error, options: &RequestOptions) -> ResilienceError {
            if err.is_builder() {
                return ResilienceError::InvalidRequest(err.to_string());
            }

            self.broken = true;
            if err.is_timeout() {
                return if err.is_connect() {
                    ResilienceError::ConnectionTimeout(options.timeout)
                } else {
                    ResilienceError::RequestTimeout(options.timeout)
                };
            }
            if let Some(io_err) = find_io_error(&err) {
                return ResilienceError::from(io::Error::new(io_err.kind(), err.to_string()));
            }
            if err.is_connect() {
                return ResilienceError::ConnectionRefused(err.to_string());
            }
            ResilienceError::Transport(err.to_string())
        }

        fn classify_read(&mut self, err: io::Error, options: &RequestOptions) -> ResilienceError {
            self.broken = true;
            match err.kind() {
                io::ErrorKind::TimedOut => ResilienceError::RequestTimeout(options.timeout),
                _ => ResilienceError::from(err),
            }
        }
    }

    fn find_io_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                return Some(io_err);
            }
            source = cause.source();
        }
        None
    }

    fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    /// Builds one client per pooled resource
    #[derive(Debug, Clone)]
    pub struct ReqwestFactory {
        pub connect_timeout: Duration,
        pub user_agent: String,
    }

    impl Default for ReqwestFactory {
        fn default() -> Self {
            Self {
                connect_timeout: Duration::from_secs(10),
                user_agent: format!("salvo/{}", env!("CARGO_PKG_VERSION")),
            }
        }
    }

    impl ResourceFactory<ReqwestTransport> for ReqwestFactory {
        fn create(&self, destination: &Destination) -> Result<ReqwestTransport, ResilienceError> {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(self.connect_timeout)
                .user_agent(self.user_agent.as_str())
                .gzip(true)
                .pool_max_idle_per_host(1)
                .build()
                .map_err(|e| ResilienceError::Transport(format!("failed to build client: {}", e)))?;

            tracing::debug!(destination = %destination, "created HTTP client");
            Ok(ReqwestTransport {
                client,
                destination: destination.clone(),
                broken: false,
            })
        }

        fn is_healthy(&self, transport: &ReqwestTransport) -> bool {
            transport.probe()
        }
    }
}
