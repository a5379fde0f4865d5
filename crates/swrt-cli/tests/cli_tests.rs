//! End-to-end tests for the `swrt` binary
//!
//! Bundle tests need esbuild (`SWRT_ESBUILD`, `node_modules/.bin` or `PATH`)
//! and pass trivially when it is missing.
//!
//! Run with: `cargo test -p swrt-cli --test cli_tests`

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::time::Duration;

fn swrt(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_swrt"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn esbuild_available(dir: &Path) -> bool {
    swrt::EsbuildEngine::locate(dir).is_ok()
}

#[test]
fn eval_prints_result() {
    let dir = tempfile::tempdir().unwrap();
    let out = swrt(dir.path(), &["eval", "console.log(1+2)"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert_eq!(stdout(&out), "3\n");
}

#[test]
fn eval_error_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let out = swrt(dir.path(), &["eval", "throw new Error('boom')"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("❌ 执行失败"), "{}", stderr(&out));
    assert!(stderr(&out).contains("boom"));
}

#[test]
fn run_executes_typescript() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("util.ts"), "export const twice = (n: number): number => n * 2;\n").unwrap();
    fs::write(
        dir.path().join("app.ts"),
        "import { twice } from './util';\nsetTimeout(() => console.log(twice(21)), 1);\n",
    )
    .unwrap();
    let out = swrt(dir.path(), &["run", "app.ts"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert_eq!(stdout(&out), "42\n");
}

#[test]
fn run_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = swrt(dir.path(), &["run", "nope.js"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("文件不存在"), "{}", stderr(&out));
}

#[test]
fn watch_refuses_encrypted_bundles() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("app.js"), "console.log(1);\n").unwrap();
    let out = swrt(dir.path(), &["run", "-w", "--decrypt-key", "k", "app.js"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("加密文件暂不支持监控模式"), "{}", stderr(&out));
}

#[test]
fn watch_reruns_after_source_change() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("message.json"), r#"{"text": "first"}"#).unwrap();
    fs::write(
        dir.path().join("app.js"),
        "console.log(require('./message.json').text);\n",
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_swrt"))
        .args(["run", "--watch", "app.js"])
        .current_dir(dir.path())
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let (tx, rx) = mpsc::channel();
    let stdout = child.stdout.take().unwrap();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            if tx.send(line.unwrap()).is_err() {
                break;
            }
        }
    });
    let wait_for = |expected: &str| {
        let mut seen = Vec::new();
        while let Ok(line) = rx.recv_timeout(Duration::from_secs(10)) {
            if line == expected {
                return;
            }
            seen.push(line);
        }
        panic!("never saw {expected:?}; got {seen:?}");
    };

    wait_for("first");
    fs::write(dir.path().join("message.json"), r#"{"text": "second"}"#).unwrap();
    wait_for("second");

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn bundle_missing_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = swrt(dir.path(), &["bundle", "missing.ts"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("❌ 入口文件不存在"), "{}", stderr(&out));
}

#[test]
fn version_reports_package_version() {
    let dir = tempfile::tempdir().unwrap();
    let out = swrt(dir.path(), &["version"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.starts_with(&format!("SW Runtime v{}", env!("CARGO_PKG_VERSION"))));
    assert!(text.contains(std::env::consts::OS));
}

#[test]
fn info_lists_http() {
    let dir = tempfile::tempdir().unwrap();
    let out = swrt(dir.path(), &["info"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("• http"));
}

#[test]
fn bundle_then_run() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("math.ts"), "export const add = (a: number, b: number) => a + b;\n").unwrap();
    fs::write(dir.path().join("app.ts"), "import { add } from './math';\nconsole.log(add(1, 2));\n").unwrap();
    if !esbuild_available(dir.path()) {
        eprintln!("esbuild not found; skipping");
        return;
    }

    let out = swrt(dir.path(), &["bundle", "app.ts", "-o", "dist/app.js"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stdout(&out).contains("📦 包含模块: 2 个"), "{}", stdout(&out));

    let out = swrt(dir.path(), &["run", "dist/app.js"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert_eq!(stdout(&out), "3\n");
}

#[test]
fn encrypted_bundle_needs_key_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("app.js"), "console.log('secret output');\n").unwrap();
    if !esbuild_available(dir.path()) {
        eprintln!("esbuild not found; skipping");
        return;
    }

    let out = swrt(dir.path(), &["-q", "bundle", "app.js", "--encrypt"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let bundle = fs::read_to_string(dir.path().join("app.bundle.js")).unwrap();
    assert!(!bundle.contains("secret output"));
    assert!(dir.path().join("app.bundle.js.key").is_file());

    let out = swrt(dir.path(), &["run", "app.bundle.js"]);
    assert!(!out.status.success());

    let out = swrt(
        dir.path(),
        &["run", "--decrypt-key-file=app.bundle.js.key", "app.bundle.js"],
    );
    assert!(out.status.success(), "{}", stderr(&out));
    assert_eq!(stdout(&out), "secret output\n");
}

#[test]
fn malformed_entry_reports_bundle_failure() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("broken.ts"), "export const = (;\n").unwrap();
    if !esbuild_available(dir.path()) {
        eprintln!("esbuild not found; skipping");
        return;
    }
    let out = swrt(dir.path(), &["bundle", "broken.ts"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).starts_with("❌ 打包失败:"), "{}", stderr(&out));
}
