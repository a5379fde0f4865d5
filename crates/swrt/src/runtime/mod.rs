//! Script runtime
//!
//! A [`Runtime`] owns one QuickJS engine and context, the worker pool that
//! runs native I/O, the event loop that hands results back to the engine
//! thread, the CommonJS module loader and the built-in module registry.
//!
//! The runtime is single-threaded (`!Send`) and must not be driven from inside
//! an async context: [`Runtime::run_file`] blocks the calling thread until the
//! script and everything it scheduled has finished.
//!
//! # Example
//!
//! ```rust
//! use swrt::Runtime;
//!
//! let runtime = Runtime::builder().capture_output(true).build()?;
//! runtime.run_code("setTimeout(() => console.log('later'), 5); console.log(1 + 2)")?;
//! assert_eq!(runtime.captured_stdout(), "3\nlater\n");
//! # Ok::<(), swrt::Error>(())
//! ```

pub(crate) mod event_loop;
mod globals;
pub(crate) mod js;
mod modules;

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use rquickjs::{Context, Ctx};
use tracing::debug;

use crate::builtins::http::{HttpClient, HttpNamespace, Transport};
use crate::builtins::{BuiltinModule, BuiltinRegistry};
use crate::bundler::encrypt::validate_key;
use crate::error::{Error, Result};
use crate::limits::RuntimeLimits;
use crate::logging_impl::{LogConfig, format_script_for_log};
use crate::resolver::ModuleResolver;
use crate::security::{PathValidator, UrlValidator, absolutize};
use event_loop::{EventLoop, Interrupt, describe_exception};
use globals::Output;
use js::thrown_value;
use modules::{ModuleLoader, new_module};

/// Pseudo file name for code passed to [`Runtime::run_code`].
const EVAL_FILENAME: &str = "<eval>";

/// A script engine instance with the host built-ins installed.
pub struct Runtime {
    // Field order is drop order: the context goes before the engine.
    context: Context,
    engine: rquickjs::Runtime,
    event_loop: Rc<EventLoop>,
    loader: Rc<ModuleLoader>,
    builtins: Rc<BuiltinRegistry>,
    output: Rc<Output>,
    log: LogConfig,
    working_dir: PathBuf,
    interrupt: Arc<Interrupt>,
    #[allow(dead_code)] // owns the worker threads behind `event_loop`'s handle
    workers: tokio::runtime::Runtime,
}

impl Runtime {
    /// Runtime rooted at the current directory with default settings.
    pub fn new() -> Result<Self> {
        RuntimeBuilder::default().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Module base and path-sandbox base.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Names of the registered built-in modules.
    pub fn builtin_modules(&self) -> Vec<String> {
        self.builtins.names()
    }

    /// Handle for stopping a run from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.interrupt.clone())
    }

    /// Forget every loaded file module; the next `require` re-reads from disk.
    pub fn clear_module_cache(&self) {
        self.loader.clear_cache();
    }

    /// Execute the script at `path` (relative to the working directory) and
    /// drive the event loop to completion.
    pub fn run_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = absolutize(path.as_ref(), &self.working_dir);
        if !path.is_file() {
            return Err(Error::Resolve(path.display().to_string()));
        }
        debug!(path = %path.display(), "running script");
        let loaded = self.context.with(|ctx| {
            self.loader
                .load_file(&ctx, &path)
                .map(|_| ())
                .map_err(|e| script_error(&ctx, e))
        });
        self.finish(loaded)
    }

    /// Execute `code` as an anonymous module in the working directory.
    pub fn run_code(&self, code: &str) -> Result<()> {
        debug!(code = %format_script_for_log(code, &self.log), "evaluating code");
        let path = self.working_dir.join(EVAL_FILENAME);
        let evaluated = self.context.with(|ctx| {
            new_module(&ctx, &path)
                .and_then(|module| self.loader.execute(&ctx, &module, code, &path))
                .map_err(|e| script_error(&ctx, e))
        });
        self.finish(evaluated)
    }

    /// Output written by `console` when capture is enabled.
    pub fn captured_stdout(&self) -> String {
        self.output.stdout()
    }

    pub fn captured_stderr(&self) -> String {
        self.output.stderr()
    }

    fn finish(&self, entry: Result<()>) -> Result<()> {
        let mut result = entry.and_then(|()| self.event_loop.run(&self.engine, &self.context));
        if result.is_err() && self.interrupt.is_requested() {
            result = Err(Error::Interrupted);
        }
        if result.is_err() {
            // An uncaught error ends the script; abandon whatever it scheduled.
            self.event_loop.clear();
        }
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.event_loop.clear();
        self.loader.clear_cache();
        self.builtins.shutdown();
        debug!("runtime shut down");
    }
}

/// Stops a [`Runtime`] from any thread.
///
/// Running script code is aborted at the next engine check and a loop waiting
/// on timers or I/O wakes immediately; the run returns
/// [`Error::Interrupted`]. The runtime stays interrupted afterwards.
#[derive(Clone)]
pub struct InterruptHandle(Arc<Interrupt>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        debug!("interrupt requested");
        self.0.request();
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.is_requested()
    }
}

/// Uncaught script error with name, message and stack.
fn script_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> Error {
    match thrown_value(ctx, err) {
        Ok(value) => Error::Script(describe_exception(&value)),
        Err(e) => Error::Script(e.to_string()),
    }
}

fn engine_error(err: rquickjs::Error) -> Error {
    Error::Internal(format!("script engine: {err}"))
}

/// Builder for customized [`Runtime`] configuration.
#[derive(Default)]
pub struct RuntimeBuilder {
    working_dir: Option<PathBuf>,
    limits: RuntimeLimits,
    url_validator: Option<UrlValidator>,
    path_validator: Option<PathValidator>,
    decrypt_key: Option<String>,
    capture_output: bool,
    log_config: LogConfig,
    modules: Vec<Box<dyn BuiltinModule>>,
    http_server: Option<Box<dyn BuiltinModule>>,
}

impl RuntimeBuilder {
    /// Module base directory and path-sandbox base (default: current directory).
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn limits(mut self, limits: RuntimeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// URL policy for the HTTP client (default: [`UrlValidator::new`]).
    pub fn url_validator(mut self, validator: UrlValidator) -> Self {
        self.url_validator = Some(validator);
        self
    }

    /// Path sandbox for script file I/O (default: the working directory).
    pub fn path_validator(mut self, validator: PathValidator) -> Self {
        self.path_validator = Some(validator);
        self
    }

    /// Key for running encrypted bundles.
    pub fn decrypt_key(mut self, key: impl Into<String>) -> Self {
        self.decrypt_key = Some(key.into());
        self
    }

    /// Collect `console` output instead of writing to stdout/stderr.
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn log_config(mut self, config: LogConfig) -> Self {
        self.log_config = config;
        self
    }

    /// Register an extra built-in module.
    pub fn builtin(mut self, module: impl BuiltinModule + 'static) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    /// Attach a server implementation as `http/server`.
    pub fn http_server(mut self, server: impl BuiltinModule + 'static) -> Self {
        self.http_server = Some(Box::new(server));
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let cwd = std::env::current_dir()?;
        let working_dir = match self.working_dir {
            Some(dir) => absolutize(&dir, &cwd),
            None => cwd,
        };
        if let Some(key) = &self.decrypt_key {
            validate_key(key)?;
        }

        let engine = rquickjs::Runtime::new().map_err(engine_error)?;
        if self.limits.memory_limit > 0 {
            engine.set_memory_limit(self.limits.memory_limit);
        }
        engine.set_max_stack_size(self.limits.max_stack_size);
        let interrupt = Arc::new(Interrupt::default());
        {
            let interrupt = interrupt.clone();
            engine.set_interrupt_handler(Some(Box::new(move || interrupt.is_requested())));
        }
        let context = Context::full(&engine).map_err(engine_error)?;

        let workers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.limits.worker_threads.max(1))
            .thread_name("swrt-worker")
            .enable_all()
            .build()?;
        let event_loop = Rc::new(EventLoop::new(workers.handle().clone(), interrupt.clone()));

        let validator = Arc::new(RwLock::new(self.url_validator.unwrap_or_default()));
        let paths = self
            .path_validator
            .unwrap_or_else(|| PathValidator::new(&working_dir));
        let transport = Transport::new(validator.clone(), self.limits.max_response_bytes)?;
        let client = HttpClient::new(
            event_loop.clone(),
            transport,
            validator,
            paths,
            self.log_config.clone(),
        );

        let mut registry = BuiltinRegistry::new();
        registry.register(Box::new(HttpNamespace::new(client, self.http_server)));
        for module in self.modules {
            registry.register(module);
        }
        let builtins = Rc::new(registry);
        let loader = Rc::new(ModuleLoader::new(
            ModuleResolver::new(&working_dir),
            builtins.clone(),
        ));
        let output = Rc::new(Output::new(self.capture_output));

        context
            .with(|ctx| {
                globals::install(
                    &ctx,
                    output.clone(),
                    event_loop.clone(),
                    self.decrypt_key.as_deref(),
                )?;
                let require = loader.require_function(&ctx, working_dir.join(EVAL_FILENAME))?;
                ctx.globals().set("require", require)
            })
            .map_err(engine_error)?;

        debug!(
            working_dir = %working_dir.display(),
            modules = ?builtins.names(),
            "runtime ready"
        );

        Ok(Runtime {
            context,
            engine,
            event_loop,
            loader,
            builtins,
            output,
            log: self.log_config,
            working_dir,
            interrupt,
            workers,
        })
    }
}
