//! Bundler engine seam.
//!
//! The driver never parses JavaScript itself; it hands a [`BuildRequest`] to
//! an [`Engine`] and reads back output files and diagnostics.
//! [`EsbuildEngine`] drives the esbuild executable.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable overriding the esbuild executable path.
pub const ESBUILD_ENV: &str = "SWRT_ESBUILD";

/// Target platform of the emitted bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Server-side (`require` of host modules stays a runtime lookup).
    Node,
}

/// Module format of the emitted bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    CommonJs,
}

/// How the source map is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMapMode {
    None,
    /// `//# sourceMappingURL=data:...` appended to the code.
    Inline,
}

/// One build invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub entry: PathBuf,
    pub platform: Platform,
    pub format: Format,
    /// Language target, e.g. `es2020`.
    pub target: String,
    /// Minify whitespace, identifiers and syntax.
    pub minify: bool,
    pub source_map: SourceMapMode,
    /// Specifiers left as runtime `require` calls.
    pub externals: Vec<String>,
    pub working_dir: PathBuf,
}

/// A file emitted by the engine.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Engine result: output files in emission order, or diagnostics.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub errors: Vec<String>,
    pub output_files: Vec<OutputFile>,
}

/// A JavaScript bundler backend.
pub trait Engine {
    /// Run one build. Compile errors are reported in [`BuildOutput::errors`];
    /// `Err` is reserved for failing to run the engine at all.
    fn build(&self, request: &BuildRequest) -> Result<BuildOutput>;
}

/// Engine backed by the esbuild executable.
#[derive(Debug, Clone)]
pub struct EsbuildEngine {
    binary: PathBuf,
}

impl EsbuildEngine {
    /// Use an explicit esbuild executable.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Find esbuild: `$SWRT_ESBUILD`, then `<base>/node_modules/.bin/esbuild`,
    /// then `PATH`.
    pub fn locate(base_dir: &Path) -> Result<Self> {
        if let Some(path) = std::env::var_os(ESBUILD_ENV) {
            return Ok(Self::new(path));
        }
        let local = base_dir.join("node_modules").join(".bin").join("esbuild");
        if local.is_file() {
            return Ok(Self::new(local));
        }
        which::which("esbuild").map(Self::new).map_err(|_| {
            Error::bundle(
                "esbuild executable not found (install it with `npm i -D esbuild` or set SWRT_ESBUILD)",
            )
        })
    }

    /// Path of the executable in use.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn args(request: &BuildRequest, outfile: &Path) -> Vec<String> {
        let mut args = vec![
            request.entry.to_string_lossy().into_owned(),
            "--bundle".to_string(),
            format!(
                "--platform={}",
                match request.platform {
                    Platform::Node => "node",
                }
            ),
            format!(
                "--format={}",
                match request.format {
                    Format::CommonJs => "cjs",
                }
            ),
            format!("--target={}", request.target),
            format!("--outfile={}", outfile.display()),
            "--log-level=error".to_string(),
            "--color=false".to_string(),
        ];
        if request.minify {
            args.push("--minify-whitespace".to_string());
            args.push("--minify-identifiers".to_string());
            args.push("--minify-syntax".to_string());
        }
        if request.source_map == SourceMapMode::Inline {
            args.push("--sourcemap=inline".to_string());
        }
        args.extend(request.externals.iter().map(|e| format!("--external:{e}")));
        args
    }
}

impl Engine for EsbuildEngine {
    fn build(&self, request: &BuildRequest) -> Result<BuildOutput> {
        let out_dir = tempfile::tempdir()?;
        let outfile = out_dir.path().join("bundle.js");
        let args = Self::args(request, &outfile);
        debug!(binary = %self.binary.display(), ?args, "invoking esbuild");

        let output = Command::new(&self.binary)
            .args(&args)
            .current_dir(&request.working_dir)
            .output()
            .map_err(|e| Error::bundle(format!("failed to run esbuild: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut errors = parse_diagnostics(&stderr);
            if errors.is_empty() {
                errors.push(format!("esbuild exited with {}", output.status));
            }
            return Ok(BuildOutput {
                errors,
                output_files: Vec::new(),
            });
        }

        let mut output_files = Vec::new();
        for path in [outfile.clone(), outfile.with_extension("js.map")] {
            if path.is_file() {
                output_files.push(OutputFile {
                    contents: std::fs::read_to_string(&path)?,
                    path,
                });
            }
        }
        Ok(BuildOutput {
            errors: Vec::new(),
            output_files,
        })
    }
}

/// Pull `[ERROR]` diagnostics out of esbuild's human-readable log.
///
/// ```text
/// ✘ [ERROR] Expected ";" but found "b"
///
///     bad.ts:1:6:
///       1 │ let a b
/// ```
///
/// becomes `bad.ts:1:6: Expected ";" but found "b"`.
fn parse_diagnostics(stderr: &str) -> Vec<String> {
    let lines: Vec<&str> = stderr.lines().collect();
    let mut errors = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Some((_, message)) = line.split_once("[ERROR] ") else {
            continue;
        };
        let location = lines[i + 1..]
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .filter(|l| l.ends_with(':') && !l.contains('['));
        match location {
            Some(loc) => errors.push(format!("{loc} {}", message.trim())),
            None => errors.push(message.trim().to_string()),
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(minify: bool, source_map: SourceMapMode) -> BuildRequest {
        BuildRequest {
            entry: PathBuf::from("/p/app.js"),
            platform: Platform::Node,
            format: Format::CommonJs,
            target: "es2020".into(),
            minify,
            source_map,
            externals: vec!["fs".into(), "http".into()],
            working_dir: PathBuf::from("/p"),
        }
    }

    #[test]
    fn args_for_plain_build() {
        let args = EsbuildEngine::args(&request(false, SourceMapMode::None), Path::new("/o/b.js"));
        assert_eq!(
            args,
            vec![
                "/p/app.js",
                "--bundle",
                "--platform=node",
                "--format=cjs",
                "--target=es2020",
                "--outfile=/o/b.js",
                "--log-level=error",
                "--color=false",
                "--external:fs",
                "--external:http",
            ]
        );
    }

    #[test]
    fn args_for_minified_inline_map() {
        let args = EsbuildEngine::args(&request(true, SourceMapMode::Inline), Path::new("/o/b.js"));
        assert!(args.contains(&"--minify-whitespace".to_string()));
        assert!(args.contains(&"--minify-identifiers".to_string()));
        assert!(args.contains(&"--minify-syntax".to_string()));
        assert!(args.contains(&"--sourcemap=inline".to_string()));
    }

    #[test]
    fn diagnostics_with_location() {
        let stderr = "✘ [ERROR] Expected \";\" but found \"b\"\n\n    bad.ts:1:6:\n      1 │ let a b\n        ╵       ^\n\n1 error\n";
        assert_eq!(
            parse_diagnostics(stderr),
            vec!["bad.ts:1:6: Expected \";\" but found \"b\""]
        );
    }

    #[test]
    fn diagnostics_without_location() {
        let stderr = "✘ [ERROR] Could not resolve \"./missing\"\n✘ [ERROR] Second\n";
        assert_eq!(
            parse_diagnostics(stderr),
            vec!["Could not resolve \"./missing\"", "Second"]
        );
    }
}
