//! HTTP transport for the script client.
//!
//! Runs on the worker pool; never touches the engine.
//!
//! # Security Mitigations
//!
//! - **SSRF via DNS**: host names are resolved by [`GuardedResolver`], which
//!   drops every address the URL validator rejects
//! - **Redirect bypass**: each redirect hop is re-validated, at most
//!   [`MAX_REDIRECTS`] hops
//! - **Large response DoS**: buffered bodies are capped at
//!   `max_response_bytes` (Content-Length checked up front, then while reading)
//! - **Compression bomb**: automatic decompression is disabled
//! - **Connection hang**: 10s connect timeout

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;
use reqwest::{Client, Method};

use super::prepare::{Body, PreparedRequest};
use crate::error::{Error, Result};
use crate::limits::MAX_REDIRECTS;
use crate::security::UrlValidator;

/// URL validator shared by the client functions, the resolver and the
/// redirect policy. Scripts mutate it through `addBlockedHost` and friends.
pub type SharedValidator = Arc<RwLock<UrlValidator>>;

pub(crate) fn read_validator(validator: &SharedValidator) -> RwLockReadGuard<'_, UrlValidator> {
    validator.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_validator(validator: &SharedValidator) -> RwLockWriteGuard<'_, UrlValidator> {
    validator.write().unwrap_or_else(PoisonError::into_inner)
}

/// Response as read off the wire.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    /// Code and reason, e.g. `200 OK`.
    pub status_text: String,
    /// Lowercase names; the first value wins for repeated headers.
    pub headers: BTreeMap<String, String>,
    /// Final URL after redirects.
    pub url: String,
    pub body: ResponseBody,
}

#[derive(Debug)]
pub enum ResponseBody {
    Buffered(Vec<u8>),
    /// Unread body, owned by a script stream handle.
    Stream(reqwest::Response),
}

/// DNS resolver that only hands out addresses the URL validator accepts.
struct GuardedResolver {
    validator: SharedValidator,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let validator = self.validator.clone();
        let host = name.as_str().to_string();
        Box::pin(async move {
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .collect();

            let allowed: Vec<SocketAddr> = {
                let guard = read_validator(&validator);
                resolved
                    .into_iter()
                    .filter(|addr| guard.check_ip(addr.ip()).is_ok())
                    .collect()
            };

            if allowed.is_empty() {
                return Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("{host} resolves only to blocked addresses"),
                )) as Box<dyn std::error::Error + Send + Sync>);
            }

            let addrs: Addrs = Box::new(allowed.into_iter());
            Ok(addrs)
        })
    }
}

/// Shared connection pool plus response limits.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    max_response_bytes: usize,
}

impl Transport {
    pub fn new(validator: SharedValidator, max_response_bytes: usize) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let redirect_validator = validator.clone();
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(format!("too many redirects (max {MAX_REDIRECTS})"));
            }
            let target = attempt.url().to_string();
            let verdict = read_validator(&redirect_validator).validate(&target);
            match verdict {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(format!("redirect blocked: {e}")),
            }
        });

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("swrt/", env!("CARGO_PKG_VERSION")))
            .redirect(policy)
            .dns_resolver(Arc::new(GuardedResolver { validator }))
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_response_bytes,
        })
    }

    pub fn max_response_bytes(&self) -> usize {
        self.max_response_bytes
    }

    /// Dispatch `request` and read the response (or hand back the unread
    /// body in stream mode).
    pub async fn execute(&self, request: PreparedRequest) -> Result<RawResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::validation(format!("invalid HTTP method: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((user, pass)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match request.body {
            Body::None => builder,
            Body::Bytes(bytes) => builder.body(bytes),
            Body::File(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    Error::Io(std::io::Error::new(
                        e.kind(),
                        format!("failed to open file {}: {e}", path.display()),
                    ))
                })?;
                builder.body(reqwest::Body::from(file))
            }
        };

        let response = builder.send().await.map_err(transport_error)?;

        let status = response.status();
        let status_text = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .trim_end()
        .to_string();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let url = response.url().to_string();

        let body = if request.stream {
            ResponseBody::Stream(response)
        } else {
            ResponseBody::Buffered(self.read_body_with_limit(response).await?)
        };

        Ok(RawResponse {
            status: status.as_u16(),
            status_text,
            headers,
            url,
            body,
        })
    }

    async fn read_body_with_limit(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        if let Some(length) = response.content_length() {
            if length as usize > self.max_response_bytes {
                return Err(Error::Transport(format!(
                    "response too large: {length} bytes (max: {} bytes)",
                    self.max_response_bytes
                )));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_error)?;
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(Error::Transport(format!(
                    "response too large: exceeded {} bytes limit",
                    self.max_response_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Flatten a reqwest error and its sources into one message.
pub(crate) fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Transport("operation timed out".to_string());
    }
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    Error::Transport(message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(url: String) -> PreparedRequest {
        PreparedRequest {
            method: "GET".into(),
            url,
            headers: BTreeMap::new(),
            body: Body::None,
            timeout: Some(Duration::from_secs(5)),
            basic_auth: None,
            bearer_token: None,
            stream: false,
        }
    }

    fn permissive() -> SharedValidator {
        Arc::new(RwLock::new(UrlValidator::permissive()))
    }

    /// Serve one canned response; returns the base URL and the raw request.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn buffered_response() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nX-Dup: first\r\nX-Dup: second\r\nContent-Length: 7\r\nConnection: close\r\n\r\n{\"a\":1}",
        )
        .await;
        let transport = Transport::new(permissive(), 1024).unwrap();
        let mut req = request(format!("{base}/items"));
        req.bearer_token = Some("tok".into());
        let resp = transport.execute(req).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.status_text, "200 OK");
        assert_eq!(resp.headers.get("x-dup").unwrap(), "first");
        assert_eq!(resp.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(resp.url, format!("{base}/items"));
        match resp.body {
            ResponseBody::Buffered(body) => assert_eq!(body, br#"{"a":1}"#),
            ResponseBody::Stream(_) => panic!("expected buffered body"),
        }

        let raw = server.await.unwrap();
        assert!(raw.starts_with("GET /items HTTP/1.1"));
        assert!(raw.to_lowercase().contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() {
        let (base, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 64\r\nConnection: close\r\n\r\n0123456789012345678901234567890123456789012345678901234567890123",
        )
        .await;
        let transport = Transport::new(permissive(), 16).unwrap();
        let err = transport.execute(request(base)).await.unwrap_err();
        assert!(err.to_string().contains("response too large"), "got: {err}");
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = Transport::new(permissive(), 1024).unwrap();
        let err = transport
            .execute(request(format!("http://127.0.0.1:{port}/")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn redirect_to_blocked_host_is_refused() {
        let (base, _server) = serve_once(
            "HTTP/1.1 302 Found\r\nLocation: http://169.254.169.254/latest/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let mut validator = UrlValidator::permissive();
        validator.add_blocked_cidr("169.254.0.0/16").unwrap();
        let transport = Transport::new(Arc::new(RwLock::new(validator)), 1024).unwrap();
        let err = transport.execute(request(base)).await.unwrap_err();
        assert!(err.to_string().contains("redirect blocked"), "got: {err}");
    }

    #[tokio::test]
    async fn missing_upload_file_fails_before_sending() {
        let transport = Transport::new(permissive(), 1024).unwrap();
        let mut req = request("http://127.0.0.1:9/".into());
        req.body = Body::File(PathBuf::from("/nonexistent/upload.bin"));
        let err = transport.execute(req).await.unwrap_err();
        assert!(err.to_string().contains("failed to open file"), "got: {err}");
    }
}
