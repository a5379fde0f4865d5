//! Request configuration: parsing script arguments into a native
//! [`RequestConfig`], and the view object handed to request hooks.

use std::collections::BTreeMap;
use std::path::PathBuf;

use rquickjs::{Ctx, Function, Object, Persistent, Value};

use crate::limits::DEFAULT_HTTP_TIMEOUT;
use crate::runtime::js::to_display;

/// How the response body is surfaced to the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// `data` is the parsed JSON body, or the raw text when it is not JSON.
    #[default]
    Json,
    /// `data` is the raw text.
    Text,
    /// `data` is a stream handle; the body is not read.
    Stream,
}

impl ResponseType {
    fn parse(value: &str) -> Self {
        match value {
            "text" => Self::Text,
            "stream" => Self::Stream,
            _ => Self::Json,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Stream => "stream",
        }
    }
}

/// Request body payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    /// Sent verbatim.
    Text(String),
    /// JSON-encoded, `Content-Type: application/json` unless set.
    Json(serde_json::Value),
}

/// Credentials from the `auth` key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

/// Native request descriptor. Mutable while hooks run, final at dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    /// Uppercase verb.
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub data: Option<RequestData>,
    pub params: BTreeMap<String, String>,
    /// Seconds; 0 disables the deadline.
    pub timeout: u64,
    pub auth: Auth,
    pub cookies: BTreeMap<String, String>,
    pub response_type: ResponseType,
    /// Upload source; the body streams from this file.
    pub file_path: Option<PathBuf>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            url: String::new(),
            headers: BTreeMap::new(),
            data: None,
            params: BTreeMap::new(),
            timeout: DEFAULT_HTTP_TIMEOUT.as_secs(),
            auth: Auth::default(),
            cookies: BTreeMap::new(),
            response_type: ResponseType::default(),
            file_path: None,
        }
    }
}

/// Per-request hooks, kept alive across the worker round-trip.
#[derive(Default)]
pub(crate) struct Hooks {
    pub before_request: Option<Persistent<Function<'static>>>,
    pub after_response: Option<Persistent<Function<'static>>>,
    pub transform_request: Option<Persistent<Function<'static>>>,
    pub transform_response: Option<Persistent<Function<'static>>>,
}

/// Defaults applied before the per-request config object.
#[derive(Debug, Clone)]
pub(crate) struct RequestDefaults {
    pub timeout: u64,
    pub headers: BTreeMap<String, String>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HTTP_TIMEOUT.as_secs(),
            headers: BTreeMap::new(),
        }
    }
}

fn defined<'js>(obj: &Object<'js>, key: &str) -> rquickjs::Result<Option<Value<'js>>> {
    let value: Value = obj.get(key)?;
    Ok((!value.is_undefined() && !value.is_null()).then_some(value))
}

/// Shallow string map from an object: every own key, values stringified.
pub(crate) fn string_map(value: &Value<'_>) -> rquickjs::Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    if let Some(obj) = value.as_object() {
        for entry in obj.props::<String, Value>() {
            let (key, value) = entry?;
            map.insert(key, to_display(&value));
        }
    }
    Ok(map)
}

fn function<'js>(value: Option<Value<'js>>, ctx: &Ctx<'js>) -> Option<Persistent<Function<'static>>> {
    value
        .and_then(|v| v.into_function())
        .map(|f| Persistent::save(ctx, f))
}

/// Convert a script value into a body payload. `undefined`, `null` and values
/// `JSON.stringify` drops (functions) yield no body.
pub(crate) fn data_from_js<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> rquickjs::Result<Option<RequestData>> {
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    if let Some(s) = value.as_string() {
        return Ok(Some(RequestData::Text(s.to_string()?)));
    }
    let Some(json) = ctx.json_stringify(value)? else {
        return Ok(None);
    };
    let json: serde_json::Value = serde_json::from_str(&json.to_string()?)
        .map_err(|e| crate::runtime::js::throw(ctx, e))?;
    Ok(Some(RequestData::Json(json)))
}

/// Convert a body payload back into a script value.
pub(crate) fn data_to_js<'js>(
    ctx: &Ctx<'js>,
    data: Option<&RequestData>,
) -> rquickjs::Result<Value<'js>> {
    match data {
        None => Ok(Value::new_undefined(ctx.clone())),
        Some(RequestData::Text(text)) => {
            Ok(rquickjs::String::from_str(ctx.clone(), text)?.into_value())
        }
        Some(RequestData::Json(json)) => ctx.json_parse(json.to_string()),
    }
}

fn map_to_js<'js>(ctx: &Ctx<'js>, map: &BTreeMap<String, String>) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    for (key, value) in map {
        obj.set(key.as_str(), value.as_str())?;
    }
    Ok(obj)
}

/// Parse `(url, config?)` as passed to a verb function.
///
/// Unknown keys are ignored. `method` is left to the caller when the verb
/// fixes it.
pub(crate) fn parse_config<'js>(
    ctx: &Ctx<'js>,
    url: Option<Value<'js>>,
    options: Option<Value<'js>>,
    defaults: &RequestDefaults,
) -> rquickjs::Result<(RequestConfig, Hooks)> {
    let mut config = RequestConfig {
        timeout: defaults.timeout,
        headers: defaults.headers.clone(),
        ..RequestConfig::default()
    };
    let mut hooks = Hooks::default();

    if let Some(url) = url.filter(|u| !u.is_undefined()) {
        config.url = to_display(&url);
    }

    let Some(obj) = options.and_then(|o| o.into_object()) else {
        return Ok((config, hooks));
    };

    if let Some(method) = defined(&obj, "method")? {
        config.method = to_display(&method).to_uppercase();
    }
    if let Some(url) = defined(&obj, "url")? {
        if config.url.is_empty() {
            config.url = to_display(&url);
        }
    }
    if let Some(headers) = defined(&obj, "headers")? {
        config.headers.extend(string_map(&headers)?);
    }
    if let Some(data) = defined(&obj, "data")? {
        config.data = data_from_js(ctx, data)?;
    }
    if let Some(params) = defined(&obj, "params")? {
        config.params = string_map(&params)?;
    }
    if let Some(timeout) = defined(&obj, "timeout")? {
        let secs = timeout.as_number().unwrap_or(0.0);
        // Sub-second deadlines round up so they never turn into "no deadline".
        config.timeout = if secs.is_finite() && secs > 0.0 { secs.ceil() as u64 } else { 0 };
    }
    if let Some(auth) = defined(&obj, "auth")? {
        let mut map = string_map(&auth)?;
        config.auth = Auth {
            username: map.remove("username"),
            password: map.remove("password"),
            token: map.remove("token"),
        };
    }
    if let Some(cookies) = defined(&obj, "cookies")? {
        config.cookies = string_map(&cookies)?;
    }
    if let Some(kind) = defined(&obj, "responseType")? {
        config.response_type = ResponseType::parse(&to_display(&kind));
    }
    if let Some(path) = defined(&obj, "filePath")? {
        config.file_path = Some(PathBuf::from(to_display(&path)));
    }

    hooks.before_request = function(defined(&obj, "beforeRequest")?, ctx);
    hooks.after_response = function(defined(&obj, "afterResponse")?, ctx);
    hooks.transform_request = function(defined(&obj, "transformRequest")?, ctx);
    hooks.transform_response = function(defined(&obj, "transformResponse")?, ctx);

    Ok((config, hooks))
}

/// The object a request hook receives.
pub(crate) fn config_view<'js>(ctx: &Ctx<'js>, config: &RequestConfig) -> rquickjs::Result<Object<'js>> {
    let view = Object::new(ctx.clone())?;
    view.set("method", config.method.as_str())?;
    view.set("url", config.url.as_str())?;
    view.set("headers", map_to_js(ctx, &config.headers)?)?;
    view.set("data", data_to_js(ctx, config.data.as_ref())?)?;
    view.set("params", map_to_js(ctx, &config.params)?)?;
    view.set("timeout", config.timeout as f64)?;
    view.set("responseType", config.response_type.as_str())?;
    Ok(view)
}

/// Copy `url`, `headers`, `data` and `params` back from a hook's result.
/// Keys the hook left undefined keep their previous value.
pub(crate) fn apply_view<'js>(
    ctx: &Ctx<'js>,
    config: &mut RequestConfig,
    view: &Object<'js>,
) -> rquickjs::Result<()> {
    if let Some(url) = defined(view, "url")? {
        config.url = to_display(&url);
    }
    if let Some(headers) = defined(view, "headers")? {
        config.headers = string_map(&headers)?;
    }
    if let Some(data) = defined(view, "data")? {
        config.data = data_from_js(ctx, data)?;
    }
    if let Some(params) = defined(view, "params")? {
        config.params = string_map(&params)?;
    }
    Ok(())
}
