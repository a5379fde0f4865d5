//! Security validators for host-exposed I/O
//!
//! Every file path and URL that a script hands to the host passes through one
//! of these validators before any I/O happens.
//!
//! # Security Model
//!
//! - File paths must resolve lexically under a sandbox base directory
//! - URLs must use an allowed scheme and must not target private, loopback or
//!   link-local networks, or blocklisted host names
//! - Both checks are re-run after any script hook that may rewrite the target

mod path;
mod url;

pub use path::{PathValidator, absolutize, clean_path};
pub use url::{IpNetwork, UrlValidator};
