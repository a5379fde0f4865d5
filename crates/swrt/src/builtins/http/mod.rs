//! `http` built-in module
//!
//! Scripts reach the client as `require("http").client` or
//! `require("http/client")`. A host may attach a server implementation under
//! `http/server` via [`RuntimeBuilder::http_server`](crate::RuntimeBuilder::http_server).
//!
//! ```js
//! const http = require("http/client");
//! http.setRequestInterceptor(cfg => { cfg.headers["X-Trace"] = "1"; return cfg; });
//! const res = await http.get("https://api.example.com/items", { params: { page: 2 } });
//! console.log(res.status, res.data);
//! ```
//!
//! # Security Mitigations
//!
//! - **SSRF**: every URL is checked by the shared [`UrlValidator`](crate::UrlValidator)
//!   before dispatch, after each request hook, on every redirect hop and on
//!   every DNS answer
//! - **Sandbox escape**: upload sources and download targets go through the
//!   [`PathValidator`](crate::PathValidator)
//! - **Response DoS**: buffered bodies are capped; streams are read on demand

mod client;
mod config;
mod executor;
mod prepare;
mod stream;

pub use client::{HttpClient, STATUS_CODES};
pub use config::{Auth, RequestConfig, RequestData, ResponseType};
pub use executor::{RawResponse, ResponseBody, SharedValidator, Transport};
pub use prepare::{Body, PreparedRequest, content_type_for, merge_params, prepare};

use rquickjs::{Ctx, Object};

use super::BuiltinModule;

/// The `http` namespace: `client` plus an optional host-supplied `server`.
pub struct HttpNamespace {
    client: HttpClient,
    server: Option<Box<dyn BuiltinModule>>,
}

impl HttpNamespace {
    pub(crate) fn new(client: HttpClient, server: Option<Box<dyn BuiltinModule>>) -> Self {
        Self { client, server }
    }
}

impl BuiltinModule for HttpNamespace {
    fn name(&self) -> &str {
        "http"
    }

    fn exports<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let obj = Object::new(ctx.clone())?;
        obj.set("client", self.client.exports(ctx)?)?;
        if let Some(server) = &self.server {
            obj.set("server", server.exports(ctx)?)?;
        }
        Ok(obj)
    }

    fn sub_module(&self, name: &str) -> Option<&dyn BuiltinModule> {
        match name {
            "client" => Some(&self.client),
            "server" => self.server.as_deref(),
            _ => None,
        }
    }

    fn shutdown(&self) {
        self.client.shutdown();
        if let Some(server) = &self.server {
            server.shutdown();
        }
    }
}
