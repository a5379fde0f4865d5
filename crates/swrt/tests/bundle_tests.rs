//! Bundler tests
//!
//! The driver tests use a stand-in engine that emits a fixed CommonJS bundle.
//! Tests marked with `esbuild` need a real esbuild executable (found via
//! `SWRT_ESBUILD`, `node_modules/.bin` or `PATH`) and pass trivially when none
//! is installed.
//!
//! Run with: `cargo test --test bundle_tests`

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use swrt::{
    BuildOutput, BuildRequest, BundleOptions, Bundler, Engine, EsbuildEngine, OutputFile, Result,
    Runtime, SourceMapMode,
};

/// Engine double: records the request and returns `code` as the bundle.
#[derive(Clone)]
struct CannedEngine {
    code: &'static str,
    seen: Rc<RefCell<Vec<BuildRequest>>>,
}

impl CannedEngine {
    fn new(code: &'static str) -> Self {
        Self {
            code,
            seen: Rc::default(),
        }
    }
}

impl Engine for CannedEngine {
    fn build(&self, request: &BuildRequest) -> Result<BuildOutput> {
        self.seen.borrow_mut().push(request.clone());
        Ok(BuildOutput {
            errors: Vec::new(),
            output_files: vec![OutputFile {
                path: PathBuf::from("bundle.js"),
                contents: self.code.to_string(),
            }],
        })
    }
}

fn project(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    dir
}

fn relative(root: &Path, modules: &[PathBuf]) -> Vec<String> {
    modules
        .iter()
        .map(|m| m.strip_prefix(root).unwrap().display().to_string())
        .collect()
}

fn run_bundle(dir: &Path, file: &str, key: Option<&str>) -> swrt::Result<String> {
    let mut builder = Runtime::builder().working_dir(dir).capture_output(true);
    if let Some(key) = key {
        builder = builder.decrypt_key(key);
    }
    let rt = builder.build()?;
    rt.run_file(file)?;
    Ok(rt.captured_stdout())
}

// =============================================================================
// 1. DEPENDENCY WALK
// =============================================================================

#[test]
fn modules_are_listed_in_first_visit_order() {
    let dir = project(&[
        (
            "main.ts",
            "import { a } from './a';\nimport b from './b.js';\nimport { get } from 'http/client';\nconsole.log(a, b, get);\n",
        ),
        ("a.ts", "import type { T } from './types';\nexport const a = require('./c');\n"),
        ("b.js", "module.exports = require('./a');\n"),
        ("c.js", "module.exports = 1;\n"),
        ("types.ts", "export interface T { x: number }\n"),
    ]);
    let root = dir.path().canonicalize().unwrap();
    let engine = CannedEngine::new("console.log('bundled');");
    let result = Bundler::new(BundleOptions::new(root.join("main.ts")))
        .unwrap()
        .with_engine(engine.clone())
        .bundle()
        .unwrap();

    assert_eq!(relative(&root, &result.modules), ["main.ts", "a.ts", "c.js", "b.js"]);
    let seen = engine.seen.borrow();
    let request = &seen[0];
    assert_eq!(request.entry, root.join("main.ts"));
    assert_eq!(request.target, "es2020");
    assert_eq!(request.source_map, SourceMapMode::None);
    assert!(request.externals.iter().any(|e| e == "http"));
    assert!(request.externals.iter().any(|e| e == "child_process"));
}

#[test]
fn cyclic_imports_terminate() {
    let dir = project(&[
        ("main.js", "require('./ping');\n"),
        ("ping.js", "require('./pong');\n"),
        ("pong.js", "require('./ping');\nrequire('./main');\n"),
    ]);
    let root = dir.path().canonicalize().unwrap();
    let result = Bundler::new(BundleOptions::new(root.join("main.js")))
        .unwrap()
        .with_engine(CannedEngine::new(""))
        .bundle()
        .unwrap();
    assert_eq!(relative(&root, &result.modules), ["main.js", "ping.js", "pong.js"]);
}

#[test]
fn missing_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = Bundler::new(BundleOptions::new(dir.path().join("absent.js")))
        .unwrap()
        .with_engine(CannedEngine::new(""))
        .bundle()
        .unwrap_err();
    assert!(err.to_string().contains("failed to read module"), "{err}");
}

// =============================================================================
// 2. ENCRYPTED OUTPUT
// =============================================================================

#[test]
fn encrypted_bundle_round_trips_through_runtime() {
    let dir = project(&[("main.js", "console.log('unused source');\n")]);
    let result = Bundler::new(BundleOptions::new(dir.path().join("main.js")).encrypt(true))
        .unwrap()
        .with_engine(CannedEngine::new(
            "const c = require('http/client');\nconsole.log('bundled', typeof c.get);\n",
        ))
        .bundle()
        .unwrap();

    assert!(result.encrypted);
    assert!(!result.code.contains("bundled"));
    let key = result.encrypt_key.clone().unwrap();

    fs::write(dir.path().join("app.bundle.js"), &result.code).unwrap();
    assert_eq!(
        run_bundle(dir.path(), "app.bundle.js", Some(&key)).unwrap(),
        "bundled function\n"
    );
    assert!(run_bundle(dir.path(), "app.bundle.js", None).is_err());
}

// =============================================================================
// 3. ESBUILD END-TO-END
// =============================================================================

fn esbuild_available(base: &Path) -> bool {
    EsbuildEngine::locate(base).is_ok()
}

#[test]
fn esbuild_bundle_runs() {
    let dir = project(&[
        ("src/main.ts", "import { add } from './math';\nconsole.log(add(2, 3));\n"),
        ("src/math.ts", "export function add(a: number, b: number): number { return a + b; }\n"),
    ]);
    let entry = dir.path().join("src/main.ts");
    if !esbuild_available(dir.path()) {
        eprintln!("esbuild not found; skipping");
        return;
    }

    let result = Bundler::new(BundleOptions::new(&entry)).unwrap().bundle().unwrap();
    assert_eq!(result.modules.len(), 2);
    assert!(!result.encrypted);

    let out = BundleOptions::default_output(&entry);
    assert!(out.ends_with("src/main.bundle.js"));
    fs::write(&out, &result.code).unwrap();
    assert_eq!(run_bundle(dir.path(), "src/main.bundle.js", None).unwrap(), "5\n");
}

#[test]
fn esbuild_minified_bundle_with_inline_map() {
    let dir = project(&[("main.js", "const message = 'hello';\nconsole.log(message);\n")]);
    if !esbuild_available(dir.path()) {
        eprintln!("esbuild not found; skipping");
        return;
    }

    let result = Bundler::new(
        BundleOptions::new(dir.path().join("main.js"))
            .minify(true)
            .sourcemap(true),
    )
    .unwrap()
    .bundle()
    .unwrap();
    assert!(result.code.contains("sourceMappingURL=data:"));

    fs::write(dir.path().join("out.js"), &result.code).unwrap();
    assert_eq!(run_bundle(dir.path(), "out.js", None).unwrap(), "hello\n");
}

#[test]
fn esbuild_reports_syntax_errors() {
    let dir = project(&[("main.js", "const = ;\n")]);
    if !esbuild_available(dir.path()) {
        eprintln!("esbuild not found; skipping");
        return;
    }
    let err = Bundler::new(BundleOptions::new(dir.path().join("main.js")))
        .unwrap()
        .bundle()
        .unwrap_err();
    assert!(matches!(err, swrt::Error::Bundle(_)), "{err:?}");
}

#[test]
fn esbuild_keeps_builtin_requires() {
    let dir = project(&[
        ("a.js", "const u=require('./u.js');const fs=require('fs');console.log(u.x);"),
        ("u.js", "exports.x=42;"),
    ]);
    if !esbuild_available(dir.path()) {
        eprintln!("esbuild not found; skipping");
        return;
    }
    let root = dir.path().canonicalize().unwrap();
    let result = Bundler::new(BundleOptions::new(root.join("a.js")))
        .unwrap()
        .bundle()
        .unwrap();
    assert_eq!(relative(&root, &result.modules), ["a.js", "u.js"]);
    assert!(result.code.contains("require(\"fs\")"), "{}", result.code);
    assert!(result.code.contains("42"));
}
