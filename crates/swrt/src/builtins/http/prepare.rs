//! Final request assembly: query merge, body encoding, content-type
//! inference and timeout coercion. Runs after every request hook.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use super::config::{RequestConfig, RequestData, ResponseType};
use crate::error::{Error, Result};

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    None,
    Bytes(Vec<u8>),
    /// Streamed from disk at dispatch time.
    File(PathBuf),
}

/// A request ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
    /// `None` means no deadline.
    pub timeout: Option<Duration>,
    pub basic_auth: Option<(String, String)>,
    pub bearer_token: Option<String>,
    pub stream: bool,
}

/// Content-Type for an upload, from its file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Case-insensitive header presence.
pub fn has_header(headers: &BTreeMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

/// Append `params` to the URL's query string, keeping existing pairs.
pub fn merge_params(url: &str, params: &BTreeMap<String, String>) -> Result<String> {
    if params.is_empty() {
        return Ok(url.to_string());
    }
    let mut parsed =
        Url::parse(url).map_err(|e| Error::validation(format!("invalid URL: {e}")))?;
    parsed
        .query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    Ok(parsed.to_string())
}

/// Build the transport-level request from a fully hooked config.
pub fn prepare(config: &RequestConfig) -> Result<PreparedRequest> {
    let url = merge_params(&config.url, &config.params)?;
    let mut headers = config.headers.clone();

    let body = if let Some(path) = &config.file_path {
        if !has_header(&headers, "Content-Type") {
            headers.insert("Content-Type".into(), content_type_for(path).into());
        }
        Body::File(path.clone())
    } else {
        match &config.data {
            None => Body::None,
            Some(RequestData::Text(text)) => Body::Bytes(text.clone().into_bytes()),
            Some(RequestData::Json(json)) => {
                if !has_header(&headers, "Content-Type") {
                    headers.insert("Content-Type".into(), "application/json".into());
                }
                Body::Bytes(
                    serde_json::to_vec(json)
                        .map_err(|e| Error::Internal(format!("failed to encode body: {e}")))?,
                )
            }
        }
    };

    if !config.cookies.is_empty() && !has_header(&headers, "Cookie") {
        let cookie = config
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert("Cookie".into(), cookie);
    }

    let stream = config.response_type == ResponseType::Stream;
    // Long downloads must not hit the request deadline.
    let timeout = match config.timeout {
        _ if stream => None,
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let basic_auth = match (&config.auth.username, &config.auth.password) {
        (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
        _ => None,
    };

    Ok(PreparedRequest {
        method: config.method.to_uppercase(),
        url,
        headers,
        body,
        timeout,
        basic_auth,
        bearer_token: config.auth.token.clone(),
        stream,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::builtins::http::config::Auth;
    use pretty_assertions::assert_eq;

    fn config(url: &str) -> RequestConfig {
        RequestConfig {
            url: url.into(),
            ..RequestConfig::default()
        }
    }

    #[test]
    fn content_type_table() {
        let cases = [
            ("a.json", "application/json"),
            ("a.xml", "application/xml"),
            ("a.txt", "text/plain"),
            ("a.html", "text/html"),
            ("a.htm", "text/html"),
            ("a.css", "text/css"),
            ("a.js", "application/javascript"),
            ("a.pdf", "application/pdf"),
            ("a.zip", "application/zip"),
            ("foo.png", "image/png"),
            ("a.jpg", "image/jpeg"),
            ("a.JPEG", "image/jpeg"),
            ("a.gif", "image/gif"),
            ("seg.ts", "video/mp2t"),
            ("seg.m4s", "video/mp4"),
            ("foo.unknown", "application/octet-stream"),
            ("noext", "application/octet-stream"),
        ];
        for (file, expected) in cases {
            assert_eq!(content_type_for(Path::new(file)), expected, "{file}");
        }
    }

    #[test]
    fn upload_infers_content_type() {
        let mut cfg = config("https://example.com/up");
        cfg.file_path = Some(PathBuf::from("/data/foo.png"));
        let req = prepare(&cfg).unwrap();
        assert_eq!(req.headers.get("Content-Type").unwrap(), "image/png");
        assert_eq!(req.body, Body::File(PathBuf::from("/data/foo.png")));
    }

    #[test]
    fn explicit_content_type_wins_case_insensitively() {
        let mut cfg = config("https://example.com/up");
        cfg.file_path = Some(PathBuf::from("foo.png"));
        cfg.headers.insert("content-type".into(), "image/webp".into());
        let req = prepare(&cfg).unwrap();
        assert_eq!(req.headers.get("content-type").unwrap(), "image/webp");
        assert!(!req.headers.contains_key("Content-Type"));
    }

    #[test]
    fn json_data_sets_content_type() {
        let mut cfg = config("https://example.com/");
        cfg.data = Some(RequestData::Json(serde_json::json!({ "a": 1 })));
        let req = prepare(&cfg).unwrap();
        assert_eq!(req.headers.get("Content-Type").unwrap(), "application/json");
        assert_eq!(req.body, Body::Bytes(br#"{"a":1}"#.to_vec()));
    }

    #[test]
    fn text_data_is_verbatim_without_content_type() {
        let mut cfg = config("https://example.com/");
        cfg.data = Some(RequestData::Text("raw".into()));
        let req = prepare(&cfg).unwrap();
        assert_eq!(req.body, Body::Bytes(b"raw".to_vec()));
        assert!(!has_header(&req.headers, "content-type"));
    }

    #[test]
    fn params_are_appended() {
        let mut cfg = config("https://example.com/search?q=rust");
        cfg.params.insert("page".into(), "2".into());
        cfg.params.insert("sort".into(), "new est".into());
        let req = prepare(&cfg).unwrap();
        assert_eq!(
            req.url,
            "https://example.com/search?q=rust&page=2&sort=new+est"
        );
    }

    #[test]
    fn stream_mode_has_no_deadline() {
        let mut cfg = config("https://example.com/big");
        cfg.timeout = 5;
        cfg.response_type = ResponseType::Stream;
        let req = prepare(&cfg).unwrap();
        assert!(req.stream);
        assert_eq!(req.timeout, None);
    }

    #[test]
    fn timeouts() {
        let mut cfg = config("https://example.com/");
        assert_eq!(prepare(&cfg).unwrap().timeout, Some(Duration::from_secs(30)));
        cfg.timeout = 0;
        assert_eq!(prepare(&cfg).unwrap().timeout, None);
    }

    #[test]
    fn auth_and_cookies() {
        let mut cfg = config("https://example.com/");
        cfg.auth = Auth {
            username: Some("user".into()),
            password: Some("pw".into()),
            token: Some("tok".into()),
        };
        cfg.cookies.insert("a".into(), "1".into());
        cfg.cookies.insert("b".into(), "2".into());
        let req = prepare(&cfg).unwrap();
        assert_eq!(req.basic_auth, Some(("user".into(), "pw".into())));
        assert_eq!(req.bearer_token.as_deref(), Some("tok"));
        assert_eq!(req.headers.get("Cookie").unwrap(), "a=1; b=2");
    }

    #[test]
    fn username_without_password_is_not_basic_auth() {
        let mut cfg = config("https://example.com/");
        cfg.auth.username = Some("user".into());
        assert_eq!(prepare(&cfg).unwrap().basic_auth, None);
    }
}
