//! Textual dependency scan.
//!
//! Not a parser: matches inside comments and string literals are reported
//! too. The resolver drops specifiers it cannot find, and the bundler engine
//! does the authoritative parse; this list only feeds the module report.

use std::sync::LazyLock;

use regex::Regex;

static REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("invalid regex")
});
static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"import\s+[^;]*?\s+from\s+['"]([^'"]+)['"]"#).expect("invalid regex")
});
static DYNAMIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"import\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("invalid regex")
});
static SIDE_EFFECT_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"import\s+['"]([^'"]+)['"]"#).expect("invalid regex"));
static EXPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"export\s+(?:\*|\{[^}]*\})(?:\s+as\s+\w+)?\s+from\s+['"]([^'"]+)['"]"#)
        .expect("invalid regex")
});

/// Extract raw import specifiers from source text.
///
/// Order: `require(...)`, `import ... from`, `import(...)`, then bare
/// `import "x"` and `export ... from` re-exports. Duplicates are kept; the
/// caller's visited set collapses them.
pub fn extract_dependencies(code: &str) -> Vec<String> {
    [
        &*REQUIRE,
        &*IMPORT_FROM,
        &*DYNAMIC_IMPORT,
        &*SIDE_EFFECT_IMPORT,
        &*EXPORT_FROM,
    ]
    .iter()
    .flat_map(|re| re.captures_iter(code))
    .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
    .collect()
}
