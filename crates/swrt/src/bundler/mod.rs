//! Bundler: turn a multi-file project into one CommonJS script.
//!
//! A [`Bundler`] is single-use: it walks the project's dependency graph to
//! build the module report, hands the entry to an [`Engine`] with the
//! built-in module names marked external, and optionally wraps the result in
//! a self-decrypting AES-256-GCM bootstrap.
//!
//! # Example
//!
//! ```rust,no_run
//! use swrt::{BundleOptions, Bundler};
//!
//! # fn main() -> swrt::Result<()> {
//! let options = BundleOptions::new("src/app.ts").minify(true);
//! let result = Bundler::new(options)?.bundle()?;
//! println!("{} modules, {} bytes", result.modules.len(), result.code.len());
//! # Ok(())
//! # }
//! ```

mod deps;
pub mod encrypt;
mod engine;

pub use deps::extract_dependencies;
pub use engine::{
    BuildOutput, BuildRequest, ESBUILD_ENV, Engine, EsbuildEngine, Format, OutputFile, Platform,
    SourceMapMode,
};

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::builtins::{BUILTIN_MODULE_NAMES, is_builtin_specifier};
use crate::error::{Error, Result};
use crate::resolver::ModuleResolver;
use crate::security::absolutize;
use crate::transpiler;

/// Language target handed to the engine.
pub const TARGET: &str = "es2020";

/// Options for one bundle job.
#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    pub entry: PathBuf,
    /// Output path; the CLI derives `<entry-stem>.bundle.js` when unset.
    pub output: Option<PathBuf>,
    pub minify: bool,
    pub sourcemap: bool,
    pub encrypt: bool,
    /// Base64 key; a fresh key is generated when unset.
    pub encrypt_key: Option<String>,
    /// Files left out of the module walk.
    pub exclude: Vec<PathBuf>,
}

impl BundleOptions {
    pub fn new(entry: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            ..Self::default()
        }
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn minify(mut self, enabled: bool) -> Self {
        self.minify = enabled;
        self
    }

    pub fn sourcemap(mut self, enabled: bool) -> Self {
        self.sourcemap = enabled;
        self
    }

    pub fn encrypt(mut self, enabled: bool) -> Self {
        self.encrypt = enabled;
        self
    }

    pub fn encrypt_key(mut self, key: impl Into<String>) -> Self {
        self.encrypt_key = Some(key.into());
        self
    }

    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude.push(path.into());
        self
    }

    /// Default output path: entry with its extension replaced by `.bundle.js`.
    pub fn default_output(entry: &Path) -> PathBuf {
        entry.with_extension("bundle.js")
    }
}

/// Output of a successful bundle.
#[derive(Debug, Clone)]
pub struct BundleResult {
    pub code: String,
    /// Separate map file, when the engine emitted one (inline maps live in `code`).
    pub source_map: Option<String>,
    /// Absolute module paths in first-visit order.
    pub modules: Vec<PathBuf>,
    pub encrypted: bool,
    /// Present only when the key was generated by this run.
    pub encrypt_key: Option<String>,
}

/// Single-use bundle driver.
pub struct Bundler {
    options: BundleOptions,
    entry: PathBuf,
    visited: HashSet<PathBuf>,
    order: Vec<PathBuf>,
    builtins: BTreeSet<String>,
    excluded: HashSet<PathBuf>,
    resolver: ModuleResolver,
    engine: Option<Box<dyn Engine>>,
}

impl Bundler {
    /// Create a driver; relative paths are resolved against the working directory.
    pub fn new(options: BundleOptions) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let entry = absolutize(&options.entry, &cwd);
        let base_dir = entry.parent().map(Path::to_path_buf).unwrap_or(cwd.clone());
        let excluded = options
            .exclude
            .iter()
            .map(|p| absolutize(p, &cwd))
            .collect();

        Ok(Self {
            options,
            entry,
            visited: HashSet::new(),
            order: Vec::new(),
            builtins: BUILTIN_MODULE_NAMES.iter().map(|s| s.to_string()).collect(),
            excluded,
            resolver: ModuleResolver::new(base_dir),
            engine: None,
        })
    }

    /// Use a specific engine instead of locating esbuild.
    pub fn with_engine(mut self, engine: impl Engine + 'static) -> Self {
        self.engine = Some(Box::new(engine));
        self
    }

    /// Absolute entry path.
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    /// Project base directory (the entry's parent).
    pub fn base_dir(&self) -> &Path {
        self.resolver.base_dir()
    }

    /// Run the bundle job.
    pub fn bundle(mut self) -> Result<BundleResult> {
        if self.options.encrypt {
            if let Some(key) = &self.options.encrypt_key {
                encrypt::validate_key(key)?;
            }
        }

        let entry = self.entry.clone();
        self.analyze_module(&entry)?;
        debug!(modules = self.order.len(), "dependency walk complete");

        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => Box::new(EsbuildEngine::locate(self.resolver.base_dir())?),
        };

        let request = BuildRequest {
            entry: entry.clone(),
            platform: Platform::Node,
            format: Format::CommonJs,
            target: TARGET.to_string(),
            minify: self.options.minify,
            source_map: if self.options.sourcemap {
                SourceMapMode::Inline
            } else {
                SourceMapMode::None
            },
            externals: self.builtins.iter().cloned().collect(),
            working_dir: self.resolver.base_dir().to_path_buf(),
        };
        let output = engine.build(&request)?;

        if !output.errors.is_empty() {
            return Err(Error::Bundle(output.errors));
        }
        let mut files = output.output_files.into_iter();
        let mut code = files
            .next()
            .ok_or_else(|| Error::bundle("bundler produced no output files"))?
            .contents;
        let source_map = if self.options.sourcemap {
            files.next().map(|f| f.contents)
        } else {
            None
        };

        let mut encrypt_key = None;
        if self.options.encrypt {
            let key = match &self.options.encrypt_key {
                Some(key) => key.clone(),
                None => {
                    let key = encrypt::generate_key();
                    encrypt_key = Some(key.clone());
                    key
                }
            };
            code = encrypt::wrap_encrypted_code(&encrypt::encrypt_code(&code, &key)?);
        }

        Ok(BundleResult {
            code,
            source_map,
            modules: self.order,
            encrypted: self.options.encrypt,
            encrypt_key,
        })
    }

    /// Depth-first walk recording each module once, in first-visit order.
    fn analyze_module(&mut self, path: &Path) -> Result<()> {
        if self.visited.contains(path) || self.excluded.contains(path) {
            return Ok(());
        }
        self.visited.insert(path.to_path_buf());
        self.order.push(path.to_path_buf());

        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::bundle(format!("failed to read module {}: {e}", path.display()))
        })?;
        // Type-only imports disappear after stripping; fall back to the raw
        // text and let the engine report syntax errors.
        let code = if transpiler::is_typescript(path) {
            transpiler::strip_types(&source, path).unwrap_or(source)
        } else {
            source
        };

        for specifier in extract_dependencies(&code) {
            if is_builtin_specifier(&specifier) {
                continue;
            }
            let Ok(resolved) = self.resolver.resolve(&specifier, path) else {
                debug!(%specifier, importer = %path.display(), "unresolved, left external");
                continue;
            };
            self.analyze_module(&resolved)?;
        }
        Ok(())
    }
}
