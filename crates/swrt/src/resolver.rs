//! Module specifier resolution
//!
//! Maps an import specifier plus the importing file to an absolute file path.
//! Shared by the bundler's dependency walk and the runtime's `require`.
//!
//! Lookup order:
//! 1. `./x`, `../x`: relative to the importer's directory, trying the bare
//!    path, then `.js`, `.ts`, `.tsx`, `.json`, then `x/index.{js,ts,tsx,json}`
//! 2. `/abs/x`: accepted when the file exists (same suffix rules)
//! 3. anything else: `<base>/node_modules/<x>` only; parent directories are
//!    never searched

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::security::clean_path;

/// Suffixes tried in order when resolving a file specifier.
pub const EXTENSIONS: &[&str] = &["", ".js", ".ts", ".tsx", ".json"];

const INDEX_FILES: &[&str] = &["index.js", "index.ts", "index.tsx", "index.json"];

#[derive(Deserialize)]
struct PackageManifest {
    main: Option<String>,
}

/// Resolves specifiers against a project base directory.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    base_dir: PathBuf,
}

impl ModuleResolver {
    /// Create a resolver whose `node_modules` lookup happens under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Project base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve `specifier` imported from the file `importer`.
    ///
    /// Built-in module names are the caller's concern; they are never passed here.
    pub fn resolve(&self, specifier: &str, importer: &Path) -> Result<PathBuf> {
        if is_relative(specifier) {
            let dir = importer.parent().unwrap_or(&self.base_dir);
            return resolve_file_or_dir(&dir.join(specifier))
                .ok_or_else(|| Error::Resolve(specifier.to_string()));
        }

        let path = Path::new(specifier);
        if path.is_absolute() {
            return resolve_file_or_dir(path).ok_or_else(|| Error::Resolve(specifier.to_string()));
        }

        let package = self.base_dir.join("node_modules").join(specifier);
        resolve_file_or_dir(&package)
            .or_else(|| resolve_package_main(&package))
            .ok_or_else(|| Error::Resolve(specifier.to_string()))
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == ".."
}

fn resolve_file_or_dir(path: &Path) -> Option<PathBuf> {
    let path = clean_path(path);
    for ext in EXTENSIONS {
        let mut candidate = path.clone().into_os_string();
        candidate.push(ext);
        let candidate = PathBuf::from(candidate);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    INDEX_FILES
        .iter()
        .map(|index| path.join(index))
        .find(|candidate| candidate.is_file())
}

fn resolve_package_main(package_dir: &Path) -> Option<PathBuf> {
    let manifest = std::fs::read_to_string(package_dir.join("package.json")).ok()?;
    let manifest: PackageManifest = serde_json::from_str(&manifest).ok()?;
    resolve_file_or_dir(&package_dir.join(manifest.main?))
}
