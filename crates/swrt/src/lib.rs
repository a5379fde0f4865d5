//! SW Runtime - script runtime and bundler with a sandboxed HTTP client
//!
//! Runs JavaScript and TypeScript on an embedded QuickJS engine with a
//! CommonJS module system, host-provided built-in modules and a promise-based
//! HTTP client; bundles multi-file projects into one (optionally encrypted)
//! script.
//!
//! # Example
//!
//! ```rust
//! use swrt::Runtime;
//!
//! let runtime = Runtime::builder().capture_output(true).build()?;
//! runtime.run_code("console.log(1 + 2)")?;
//! assert_eq!(runtime.captured_stdout(), "3\n");
//! # Ok::<(), swrt::Error>(())
//! ```
//!
//! # Security
//!
//! Every URL and file path a script hands to the host passes through
//! [`UrlValidator`] or [`PathValidator`]. The default URL policy blocks
//! private, loopback and link-local networks; scripts may relax it with
//! `allowPrivateNetwork(true)`.

mod builtins;
mod bundler;
mod error;
mod limits;
mod logging_impl;
mod resolver;
mod runtime;
mod security;
mod transpiler;

pub use builtins::http::{
    Auth, Body, PreparedRequest, RawResponse, RequestConfig, RequestData, ResponseBody,
    ResponseType, STATUS_CODES, SharedValidator, Transport, content_type_for, merge_params,
    prepare,
};
pub use builtins::{BUILTIN_MODULE_NAMES, BuiltinModule, BuiltinRegistry, is_builtin_specifier};
pub use bundler::encrypt::{
    DECRYPT_FN_GLOBAL, DECRYPT_KEY_GLOBAL, decrypt_code, encrypt_code, generate_key, validate_key,
    wrap_encrypted_code,
};
pub use bundler::{
    BuildOutput, BuildRequest, BundleOptions, BundleResult, Bundler, ESBUILD_ENV, Engine,
    EsbuildEngine, Format, OutputFile, Platform, SourceMapMode, TARGET, extract_dependencies,
};
pub use error::{Error, Result};
pub use limits::{
    DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_RESPONSE_BYTES, FILE_PERM_EXCLUSIVE, MAX_PATH_LENGTH,
    MAX_REDIRECTS, MAX_URL_LENGTH, RuntimeLimits, SMALL_BUFFER_SIZE,
};
pub use logging_impl::{LogConfig, format_script_for_log, sanitize_for_log};
pub use resolver::ModuleResolver;
pub use runtime::{InterruptHandle, Runtime, RuntimeBuilder};
pub use security::{IpNetwork, PathValidator, UrlValidator, absolutize, clean_path};
pub use transpiler::{esm_to_cjs, is_typescript, looks_like_esm, strip_types, transpile_module};

/// The script engine, for implementing [`BuiltinModule`].
pub use rquickjs;
