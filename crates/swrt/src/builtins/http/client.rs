//! `http/client` built-in module.
//!
//! Every verb function returns a promise and never throws synchronously:
//! validation failures, hook exceptions and transport errors all reject.
//!
//! Pipeline, on the engine thread unless noted:
//! 1. URL validation
//! 2. global request interceptor, re-validate
//! 3. `beforeRequest`, re-validate
//! 4. `transformRequest` (only when there is a body)
//! 5. upload path sandbox, query merge, body encoding
//! 6. network round-trip (worker pool)
//! 7. `transformResponse`, `afterResponse`, global response interceptor
//!
//! # Security Mitigations
//!
//! - **SSRF**: URL validation before dispatch and again after every hook that
//!   can rewrite the URL; DNS answers and redirects are checked by the
//!   transport
//! - **Local file exfiltration**: `filePath` uploads and `pipeToFile` targets
//!   must resolve inside the path sandbox
//! - **Credential leaks in logs**: URLs pass through [`LogConfig::redact_url`]

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::convert::Coerced;
use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Object, Persistent, Promise, Value};
use tracing::{debug, warn};

use super::config::{
    Hooks, RequestConfig, RequestDefaults, ResponseType, apply_view, config_view, data_from_js,
    data_to_js, parse_config, string_map,
};
use super::executor::{
    RawResponse, ResponseBody, SharedValidator, Transport, read_validator, write_validator,
};
use super::prepare::{PreparedRequest, prepare};
use super::stream::{StreamHandle, stream_object};
use crate::builtins::BuiltinModule;
use crate::error::{Error, Result};
use crate::logging_impl::LogConfig;
use crate::runtime::event_loop::{EventLoop, describe_exception};
use crate::runtime::js::{PromiseHandle, throw, thrown_value};
use crate::security::{PathValidator, UrlValidator};

/// Status code table exposed as `STATUS_CODES`.
pub const STATUS_CODES: &[(&str, u16)] = &[
    ("OK", 200),
    ("CREATED", 201),
    ("NO_CONTENT", 204),
    ("BAD_REQUEST", 400),
    ("UNAUTHORIZED", 401),
    ("FORBIDDEN", 403),
    ("NOT_FOUND", 404),
    ("INTERNAL_SERVER_ERROR", 500),
];

const VERBS: &[&str] = &["get", "post", "put", "delete", "patch", "head", "options"];

/// Why a request never reached the network.
enum Rejection {
    /// A hook threw; the thrown value becomes the rejection reason.
    Script(rquickjs::Error),
    Native(Error),
}

impl From<rquickjs::Error> for Rejection {
    fn from(err: rquickjs::Error) -> Self {
        Self::Script(err)
    }
}

impl From<Error> for Rejection {
    fn from(err: Error) -> Self {
        Self::Native(err)
    }
}

/// Request defaults and whether the module-wide interceptors apply.
struct Scope {
    defaults: RequestDefaults,
    interceptors: bool,
}

struct ClientState {
    event_loop: Rc<EventLoop>,
    transport: Transport,
    validator: SharedValidator,
    paths: PathValidator,
    log: LogConfig,
    request_interceptor: RefCell<Option<Persistent<Function<'static>>>>,
    response_interceptor: RefCell<Option<Persistent<Function<'static>>>>,
}

/// The script HTTP client.
pub struct HttpClient {
    state: Rc<ClientState>,
}

impl HttpClient {
    pub(crate) fn new(
        event_loop: Rc<EventLoop>,
        transport: Transport,
        validator: SharedValidator,
        paths: PathValidator,
        log: LogConfig,
    ) -> Self {
        Self {
            state: Rc::new(ClientState {
                event_loop,
                transport,
                validator,
                paths,
                log,
                request_interceptor: RefCell::new(None),
                response_interceptor: RefCell::new(None),
            }),
        }
    }
}

impl BuiltinModule for HttpClient {
    fn name(&self) -> &str {
        "client"
    }

    fn exports<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let obj = Object::new(ctx.clone())?;
        let scope = Rc::new(Scope {
            defaults: RequestDefaults::default(),
            interceptors: true,
        });
        install_request_functions(ctx, &obj, &self.state, &scope)?;

        let state = self.state.clone();
        obj.set(
            "createClient",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, options: Opt<Value<'js>>| {
                let mut defaults = RequestDefaults::default();
                if let Some(options) = options.0.and_then(|o| o.into_object()) {
                    let timeout: Value = options.get("timeout")?;
                    if let Some(secs) = timeout.as_number() {
                        defaults.timeout = if secs.is_finite() && secs > 0.0 { secs as u64 } else { 0 };
                    }
                    let headers: Value = options.get("headers")?;
                    defaults.headers = string_map(&headers)?;
                }
                let scope = Rc::new(Scope {
                    defaults,
                    interceptors: false,
                });
                let client = Object::new(ctx.clone())?;
                install_request_functions(&ctx, &client, &state, &scope)?;
                Ok::<_, rquickjs::Error>(client)
            })?,
        )?;

        let state = self.state.clone();
        obj.set(
            "setRequestInterceptor",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, f: Opt<Value<'js>>| {
                if let Some(f) = f.0.and_then(|f| f.into_function()) {
                    *state.request_interceptor.borrow_mut() = Some(Persistent::save(&ctx, f));
                }
            })?,
        )?;

        let state = self.state.clone();
        obj.set(
            "setResponseInterceptor",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, f: Opt<Value<'js>>| {
                if let Some(f) = f.0.and_then(|f| f.into_function()) {
                    *state.response_interceptor.borrow_mut() = Some(Persistent::save(&ctx, f));
                }
            })?,
        )?;

        let state = self.state.clone();
        obj.set(
            "allowPrivateNetwork",
            Function::new(ctx.clone(), move |allow: Opt<Coerced<bool>>| {
                if let Some(Coerced(allow)) = allow.0 {
                    *write_validator(&state.validator) = if allow {
                        UrlValidator::permissive()
                    } else {
                        UrlValidator::new()
                    };
                    debug!(allow, "private network access changed");
                }
            })?,
        )?;

        let state = self.state.clone();
        obj.set(
            "addBlockedHost",
            Function::new(ctx.clone(), move |host: Opt<Coerced<String>>| {
                if let Some(Coerced(host)) = host.0 {
                    write_validator(&state.validator).add_blocked_host(host);
                }
            })?,
        )?;

        let state = self.state.clone();
        obj.set(
            "addBlockedCIDR",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, cidr: Opt<Coerced<String>>| {
                if let Some(Coerced(cidr)) = cidr.0 {
                    write_validator(&state.validator)
                        .add_blocked_cidr(&cidr)
                        .map_err(|e| throw(&ctx, e))?;
                }
                Ok::<_, rquickjs::Error>(())
            })?,
        )?;

        let codes = Object::new(ctx.clone())?;
        for (name, code) in STATUS_CODES {
            codes.set(*name, *code)?;
        }
        obj.set("STATUS_CODES", codes)?;

        Ok(obj)
    }

    fn shutdown(&self) {
        self.state.request_interceptor.borrow_mut().take();
        self.state.response_interceptor.borrow_mut().take();
    }
}

/// Install the verb functions and `request` on `target`.
fn install_request_functions<'js>(
    ctx: &Ctx<'js>,
    target: &Object<'js>,
    state: &Rc<ClientState>,
    scope: &Rc<Scope>,
) -> rquickjs::Result<()> {
    for verb in VERBS {
        let state = state.clone();
        let scope = scope.clone();
        let method = verb.to_uppercase();
        target.set(
            *verb,
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, url: Opt<Value<'js>>, options: Opt<Value<'js>>| {
                    dispatch(&state, &ctx, &scope, Some(&method), url.0, options.0)
                },
            )?,
        )?;
    }

    let state = state.clone();
    let scope = scope.clone();
    target.set(
        "request",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, url: Opt<Value<'js>>, options: Opt<Value<'js>>| {
                // request({ url, method, ... })
                let (url, options) = match (url.0, options.0) {
                    (Some(first), None) if first.is_object() => (None, Some(first)),
                    (url, options) => (url, options),
                };
                dispatch(&state, &ctx, &scope, None, url, options)
            },
        )?,
    )?;
    Ok(())
}

fn dispatch<'js>(
    state: &Rc<ClientState>,
    ctx: &Ctx<'js>,
    scope: &Scope,
    method: Option<&str>,
    url: Option<Value<'js>>,
    options: Option<Value<'js>>,
) -> rquickjs::Result<Promise<'js>> {
    let (promise, settle) = PromiseHandle::new(ctx)?;

    let (request, hooks, response_type) = match run_request_pipeline(state, ctx, scope, method, url, options) {
        Ok(ready) => ready,
        Err(Rejection::Native(err)) => {
            debug!(error = %err, "request rejected before dispatch");
            settle.reject_with(ctx, err)?;
            return Ok(promise);
        }
        Err(Rejection::Script(err)) => {
            settle.settle(ctx, Err(err))?;
            return Ok(promise);
        }
    };

    debug!(
        method = %request.method,
        url = %state.log.redact_url(&request.url),
        headers = %state.log.format_headers(&request.headers),
        stream = request.stream,
        "dispatching request"
    );

    let transport = state.transport.clone();
    let continuation_state = state.clone();
    let interceptors = scope.interceptors;
    state.event_loop.spawn(
        async move { transport.execute(request).await },
        move |ctx, result: Result<RawResponse>| match result {
            Ok(raw) => {
                let response =
                    build_response(&continuation_state, &ctx, raw, response_type, hooks, interceptors);
                settle.settle(&ctx, response)
            }
            Err(err) => {
                debug!(error = %err, "request failed");
                settle.reject_with(&ctx, err)
            }
        },
    );
    Ok(promise)
}

fn run_request_pipeline<'js>(
    state: &ClientState,
    ctx: &Ctx<'js>,
    scope: &Scope,
    method: Option<&str>,
    url: Option<Value<'js>>,
    options: Option<Value<'js>>,
) -> std::result::Result<(PreparedRequest, Hooks, ResponseType), Rejection> {
    let (mut config, hooks) = parse_config(ctx, url, options, &scope.defaults)?;
    if let Some(method) = method {
        config.method = method.to_string();
    }

    validate_url(state, &config.url, "URL validation failed")?;

    if scope.interceptors {
        let interceptor = state.request_interceptor.borrow().clone();
        if let Some(interceptor) = interceptor {
            run_request_hook(ctx, &interceptor, &mut config)?;
            validate_url(state, &config.url, "URL validation failed (after interceptor)")?;
        }
    }

    if let Some(before) = &hooks.before_request {
        run_request_hook(ctx, before, &mut config)?;
        validate_url(state, &config.url, "URL validation failed (after beforeRequest)")?;
    }

    if let (Some(transform), Some(data)) = (&hooks.transform_request, config.data.as_ref()) {
        let input = data_to_js(ctx, Some(data))?;
        let output: Value = transform.clone().restore(ctx)?.call((input,))?;
        config.data = data_from_js(ctx, output)?;
    }

    if let Some(path) = &config.file_path {
        config.file_path = Some(state.paths.validate(path)?);
    }

    let request = prepare(&config)?;
    Ok((request, hooks, config.response_type))
}

fn validate_url(state: &ClientState, url: &str, context: &str) -> Result<()> {
    read_validator(&state.validator)
        .validate(url)
        .map_err(|e| Error::validation(format!("{context}: {e}")))
}

/// Call a request hook with a config view; the hook may edit the view in
/// place or return a replacement object.
fn run_request_hook<'js>(
    ctx: &Ctx<'js>,
    hook: &Persistent<Function<'static>>,
    config: &mut RequestConfig,
) -> rquickjs::Result<()> {
    let hook = hook.clone().restore(ctx)?;
    let view = config_view(ctx, config)?;
    let result: Value = hook.call((view.clone(),))?;
    let source = result.into_object().unwrap_or(view);
    apply_view(ctx, config, &source)
}

fn build_response<'js>(
    state: &Rc<ClientState>,
    ctx: &Ctx<'js>,
    raw: RawResponse,
    response_type: ResponseType,
    hooks: Hooks,
    interceptors: bool,
) -> rquickjs::Result<Value<'js>> {
    let response = Object::new(ctx.clone())?;
    let headers = Object::new(ctx.clone())?;
    for (name, value) in &raw.headers {
        headers.set(name.as_str(), value.as_str())?;
    }
    response.set("status", raw.status)?;
    response.set("statusText", raw.status_text.as_str())?;
    response.set("headers", headers.clone())?;
    response.set("url", raw.url.as_str())?;

    let bytes = match raw.body {
        ResponseBody::Stream(body) => {
            let stream = stream_object(
                ctx,
                StreamHandle::new(body),
                state.event_loop.clone(),
                state.paths.clone(),
            )?;
            stream.set("status", raw.status)?;
            stream.set("statusText", raw.status_text.as_str())?;
            stream.set("headers", headers)?;
            stream.set("url", raw.url.as_str())?;
            response.set("data", stream.clone())?;
            response.set("stream", stream)?;
            response.set("text", "")?;
            return Ok(response.into_value());
        }
        ResponseBody::Buffered(bytes) => bytes,
    };

    let text = String::from_utf8_lossy(&bytes).into_owned();
    let is_json = response_type == ResponseType::Json
        && serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).is_ok();
    let data = if is_json {
        ctx.json_parse(text.clone())?
    } else {
        rquickjs::String::from_str(ctx.clone(), &text)?.into_value()
    };
    response.set("text", text)?;
    response.set("data", data.clone())?;

    if let Some(transform) = &hooks.transform_response {
        let result = transform
            .clone()
            .restore(ctx)
            .and_then(|f| f.call::<_, Value>((data,)));
        match result {
            Ok(data) => response.set("data", data)?,
            Err(err) => log_hook_error(ctx, "transformResponse", err),
        }
    }

    if let Some(after) = &hooks.after_response {
        run_response_hook(ctx, after, &response, "afterResponse");
    }

    if interceptors {
        let interceptor = state.response_interceptor.borrow().clone();
        if let Some(interceptor) = interceptor {
            run_response_hook(ctx, &interceptor, &response, "responseInterceptor");
        }
    }

    Ok(response.into_value())
}

/// Run a response hook; a returned object may replace `data` and `headers`.
/// Failures keep the previous response.
fn run_response_hook<'js>(
    ctx: &Ctx<'js>,
    hook: &Persistent<Function<'static>>,
    response: &Object<'js>,
    name: &str,
) {
    let result = hook.clone().restore(ctx).and_then(|hook| {
        let returned: Value = hook.call((response.clone(),))?;
        if let Some(returned) = returned.into_object() {
            for key in ["data", "headers"] {
                let value: Value = returned.get(key)?;
                if !value.is_undefined() {
                    response.set(key, value)?;
                }
            }
        }
        Ok(())
    });
    if let Err(err) = result {
        log_hook_error(ctx, name, err);
    }
}

fn log_hook_error(ctx: &Ctx<'_>, hook: &str, err: rquickjs::Error) {
    let message = match thrown_value(ctx, err) {
        Ok(value) => describe_exception(&value),
        Err(e) => e.to_string(),
    };
    warn!(hook, error = %message, "response hook failed; keeping previous response");
}
