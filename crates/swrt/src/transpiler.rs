//! TypeScript stripping and ESM → CommonJS rewriting.
//!
//! Pipeline:
//! 1. Parse with oxc (TS or JS based on the file extension)
//! 2. Strip TypeScript types via the oxc transformer
//! 3. Generate JS with oxc codegen (one import/export statement per line)
//! 4. Rewrite `import`/`export` statements to `require`/`module.exports`
//!
//! Plain scripts without ESM syntax are passed through untouched.

use std::path::Path;
use std::sync::LazyLock;

use oxc::codegen::Codegen;
use oxc::parser::Parser;
use oxc::semantic::SemanticBuilder;
use oxc::span::SourceType;
use oxc::transformer::{TransformOptions, Transformer};
use regex::Regex;

use crate::error::{Error, Result};

static ESM_SYNTAX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import(?:\s+[\w*{"']|\s*["'{*])|export\s+(?:default|const|let|var|function|async|class|\{|\*))"#)
        .expect("invalid regex")
});

/// Whether the file needs type stripping (`.ts`, `.tsx`, `.mts`, `.cts`).
pub fn is_typescript(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("ts" | "tsx" | "mts" | "cts")
    )
}

/// Whether the source contains top-level-looking `import`/`export` statements.
pub fn looks_like_esm(source: &str) -> bool {
    ESM_SYNTAX.is_match(source)
}

/// Parse, strip types and regenerate `source`; ESM statements are kept.
pub fn strip_types(source: &str, path: &Path) -> Result<String> {
    let allocator = oxc_allocator::Allocator::default();
    let source_type = SourceType::from_path(path).unwrap_or_else(|_| SourceType::mjs());

    let parsed = Parser::new(&allocator, source, source_type).parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        let errors: Vec<String> = parsed.errors.iter().map(|e| e.to_string()).collect();
        return Err(Error::Transpile(format!(
            "{}: {}",
            path.display(),
            errors.join("; ")
        )));
    }
    let mut program = parsed.program;

    let scoping = SemanticBuilder::new()
        .with_excess_capacity(2.0)
        .build(&program)
        .semantic
        .into_scoping();

    let options = TransformOptions::default();
    let transformed =
        Transformer::new(&allocator, path, &options).build_with_scoping(scoping, &mut program);
    if !transformed.errors.is_empty() {
        let errors: Vec<String> = transformed.errors.iter().map(|e| e.to_string()).collect();
        return Err(Error::Transpile(format!(
            "{}: {}",
            path.display(),
            errors.join("; ")
        )));
    }

    Ok(Codegen::new().build(&program).code)
}

/// Prepare a source file for the CommonJS loader.
pub fn transpile_module(source: &str, path: &Path) -> Result<String> {
    let typescript = is_typescript(path);
    if !typescript && !looks_like_esm(source) {
        return Ok(source.to_string());
    }
    let code = strip_types(source, path)?;
    Ok(esm_to_cjs(&code))
}

/// Default-import interop: modules flagged `__esModule` hand out `.default`,
/// anything else is its own default.
const DEFAULT_INTEROP: &str = "(m => m && m.__esModule ? m.default : m)";

const ES_MODULE_FLAG: &str = "Object.defineProperty(module.exports, \"__esModule\", { value: true });";

/// Rewrite codegen output's `import`/`export` statements into CommonJS.
///
/// A module whose only export is `export default X` becomes
/// `module.exports = X`. When a default sits next to named exports it is
/// stored as `module.exports.default` and the exports object is flagged
/// `__esModule`, so the default value itself is never mutated.
///
/// Handles:
/// - `import X from "m"`, `import * as X from "m"`, `import { a, b as c } from "m"`,
///   `import X, { a } from "m"`, `import "m"`
/// - `export default`, `export function|async function|class|const|let|var`,
///   `export { a, b as c }`, `export { a } from "m"`, `export * from "m"`,
///   `export * as ns from "m"`
pub fn esm_to_cjs(js: &str) -> String {
    let mut out = Vec::new();
    let mut deferred = Vec::new();

    let exports: Vec<&str> = js
        .lines()
        .filter_map(|l| l.trim().strip_prefix("export "))
        .collect();
    let has_default = exports
        .iter()
        .any(|e| e.starts_with("default ") || (e.starts_with('{') && e.contains(" as default")));
    let has_named = exports.iter().any(|e| !e.starts_with("default "));
    let interop = has_default && has_named;

    for line in js.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("import ") || trimmed.starts_with("import\"") {
            if let Some(converted) = convert_import(trimmed) {
                out.push(converted);
                continue;
            }
        }

        if let Some(rest) = trimmed.strip_prefix("export default ") {
            if interop {
                out.push(format!("module.exports.default = {rest}"));
            } else {
                out.push(format!("module.exports = {rest}"));
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("export ") {
            if let Some(converted) = convert_export(rest, &mut deferred) {
                out.push(converted);
                continue;
            }
        }

        out.push(line.to_string());
    }

    if interop {
        deferred.push(ES_MODULE_FLAG.to_string());
    }
    if !deferred.is_empty() {
        out.push(String::new());
        out.extend(deferred);
    }
    out.join("\n")
}

fn module_name(part: &str) -> &str {
    part.trim()
        .trim_end_matches(';')
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
}

/// `{ a, b as c }` → `{ a, b: c }`
fn destructure(bindings: &str) -> String {
    let inner = bindings.trim().trim_start_matches('{').trim_end_matches('}');
    let parts: Vec<String> = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once(" as ") {
            Some((imported, local)) => format!("{}: {}", imported.trim(), local.trim()),
            None => s.to_string(),
        })
        .collect();
    format!("{{ {} }}", parts.join(", "))
}

fn convert_import(line: &str) -> Option<String> {
    let Some((clause, module)) = line.split_once(" from ") else {
        // import "m";
        let module = module_name(line.strip_prefix("import")?);
        return Some(format!("require(\"{module}\");"));
    };
    let module = module_name(module);
    let clause = clause.strip_prefix("import ")?.trim();

    if let Some(name) = clause.strip_prefix("* as ") {
        return Some(format!("const {} = require(\"{module}\");", name.trim()));
    }
    if clause.starts_with('{') {
        return Some(format!(
            "const {} = require(\"{module}\");",
            destructure(clause)
        ));
    }
    match clause.split_once(',') {
        // import X, { a } from "m"  /  import X, * as ns from "m"
        Some((default, rest)) => {
            let default = default.trim();
            let rest = rest.trim();
            let second = match rest.strip_prefix("* as ") {
                Some(ns) => format!("const {} = require(\"{module}\");", ns.trim()),
                None => format!("const {} = require(\"{module}\");", destructure(rest)),
            };
            Some(format!(
                "const {default} = {DEFAULT_INTEROP}(require(\"{module}\")); {second}"
            ))
        }
        None => Some(format!(
            "const {clause} = {DEFAULT_INTEROP}(require(\"{module}\"));"
        )),
    }
}

fn convert_export(rest: &str, deferred: &mut Vec<String>) -> Option<String> {
    // export * from "m" / export * as ns from "m"
    if let Some(star) = rest.strip_prefix('*') {
        let (alias, module) = star.split_once(" from ")?;
        let module = module_name(module);
        return Some(match alias.trim().strip_prefix("as ") {
            Some(ns) => format!("module.exports.{} = require(\"{module}\");", ns.trim()),
            None => format!("Object.assign(module.exports, require(\"{module}\"));"),
        });
    }

    // export { a, b as c } [from "m"]
    if rest.starts_with('{') {
        let close = rest.find('}')?;
        let bindings = &rest[1..close];
        let source = rest[close + 1..]
            .trim()
            .strip_prefix("from ")
            .map(module_name);
        let mut lines = Vec::new();
        for spec in bindings.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (local, exported) = spec
                .split_once(" as ")
                .map(|(l, e)| (l.trim(), e.trim()))
                .unwrap_or((spec, spec));
            match source {
                Some(module) => lines.push(format!(
                    "module.exports.{exported} = require(\"{module}\").{local};"
                )),
                None => deferred.push(format!("module.exports.{exported} = {local};")),
            }
        }
        return Some(lines.join(" "));
    }

    for keyword in ["async function ", "function "] {
        if let Some(decl) = rest.strip_prefix(keyword) {
            let name = decl.trim_start_matches('*').split('(').next()?.trim();
            deferred.push(format!("module.exports.{name} = {name};"));
            return Some(format!("{keyword}{decl}"));
        }
    }

    if let Some(decl) = rest.strip_prefix("class ") {
        let name = decl.split([' ', '{']).next()?.trim();
        deferred.push(format!("module.exports.{name} = {name};"));
        return Some(format!("class {decl}"));
    }

    for keyword in ["const ", "let ", "var "] {
        if let Some(decl) = rest.strip_prefix(keyword) {
            // Simple `name = value` declarations only; destructuring stays as-is.
            let name = decl.split(['=', ';']).next()?.trim();
            if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
                deferred.push(format!("module.exports.{name} = {name};"));
            }
            return Some(format!("{keyword}{decl}"));
        }
    }

    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_script_passes_through() {
        let src = "const x = 1;\nconsole.log(x)";
        assert_eq!(transpile_module(src, Path::new("a.js")).unwrap(), src);
    }

    #[test]
    fn typescript_types_are_stripped() {
        let src = "interface Cfg { port: number }\nconst cfg: Cfg = { port: 8080 };\nconst f = (n: number): string => String(n);\n";
        let out = transpile_module(src, Path::new("a.ts")).unwrap();
        assert!(!out.contains("interface"));
        assert!(!out.contains(": number"));
        assert!(out.contains("const cfg"));
    }

    #[test]
    fn syntax_error_is_reported() {
        let err = transpile_module("let a b", Path::new("bad.ts")).unwrap_err();
        assert!(err.to_string().starts_with("transpile error: bad.ts"));
    }

    #[test]
    fn esm_detection() {
        assert!(looks_like_esm("import fs from 'fs'"));
        assert!(looks_like_esm("\nexport const a = 1"));
        assert!(looks_like_esm("import './side'"));
        assert!(!looks_like_esm("const m = await import('./x')"));
        assert!(!looks_like_esm("const exported = 1; // export later"));
        assert!(!looks_like_esm("importantValue = 1"));
    }

    #[test]
    fn imports_become_requires() {
        let js = [
            "import X from \"m1\";",
            "import * as ns from \"m2\";",
            "import { a, b as c } from \"m3\";",
            "import D, { e } from \"m4\";",
            "import \"m5\";",
        ]
        .join("\n");
        assert_eq!(
            esm_to_cjs(&js),
            [
                "const X = (m => m && m.__esModule ? m.default : m)(require(\"m1\"));",
                "const ns = require(\"m2\");",
                "const { a, b: c } = require(\"m3\");",
                "const D = (m => m && m.__esModule ? m.default : m)(require(\"m4\")); const { e } = require(\"m4\");",
                "require(\"m5\");",
            ]
            .join("\n")
        );
    }

    #[test]
    fn exports_become_module_exports() {
        let js = [
            "export function add(a, b) {",
            "\treturn a + b;",
            "}",
            "export const PI = 3.14;",
            "export class Point {}",
            "const hidden = 1;",
            "export { hidden as visible };",
            "export * from \"./all\";",
            "export { x as y } from \"./other\";",
        ]
        .join("\n");
        assert_eq!(
            esm_to_cjs(&js),
            [
                "function add(a, b) {",
                "\treturn a + b;",
                "}",
                "const PI = 3.14;",
                "class Point {}",
                "const hidden = 1;",
                "",
                "Object.assign(module.exports, require(\"./all\"));",
                "module.exports.y = require(\"./other\").x;",
                "",
                "module.exports.add = add;",
                "module.exports.PI = PI;",
                "module.exports.Point = Point;",
                "module.exports.visible = hidden;",
            ]
            .join("\n")
        );
    }

    #[test]
    fn default_export() {
        assert_eq!(
            esm_to_cjs("export default function main() {}"),
            "module.exports = function main() {}"
        );
    }

    #[test]
    fn default_beside_named_exports_is_kept_apart() {
        let js = ["const config = { port: 80 };", "export default config;", "export const mode = \"dev\";"].join("\n");
        assert_eq!(
            esm_to_cjs(&js),
            [
                "const config = { port: 80 };",
                "module.exports.default = config;",
                "const mode = \"dev\";",
                "",
                "module.exports.mode = mode;",
                "Object.defineProperty(module.exports, \"__esModule\", { value: true });",
            ]
            .join("\n")
        );
    }

    #[test]
    fn esm_typescript_end_to_end() {
        let src = "import { join as j } from './path';\nexport const twice = (n: number) => j(String(n * 2));\n";
        let out = transpile_module(src, Path::new("m.ts")).unwrap();
        assert!(out.contains("require(\"./path\")"), "got: {out}");
        assert!(out.contains("module.exports.twice = twice;"), "got: {out}");
    }
}
