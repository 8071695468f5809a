//! Request-target classification for servable resources.
//!
//! A request target is servable iff the *entire* target matches one of the
//! four resource shapes.  Query strings, trailing slashes, uppercase hex and
//! anything else fall through to "not servable".

use std::sync::LazyLock;

use regex::Regex;

pub(crate) const UUID_PATTERN: &str =
    "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";
pub(crate) const HASH_PATTERN: &str = "[0-9a-f]{40}";

static SERVABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^(?:/registries|/registry/{u}/{h}|/package/{u}/{h}|/artifact/{h})$",
        u = UUID_PATTERN,
        h = HASH_PATTERN,
    ))
    .expect("servable-resource regex is valid")
});

static UUID_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{UUID_PATTERN}$")).expect("uuid regex is valid")
});

/// The kind of resource a servable request target names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// `/registries` — the consolidated registry listing, published locally.
    Listing,
    /// `/registry/{uuid}/{hash}` — a content-addressed registry snapshot.
    Registry,
    /// `/package/{uuid}/{hash}` — a content-addressed package tarball.
    Package,
    /// `/artifact/{hash}` — a content-addressed binary artifact.
    Artifact,
}

/// Classify a raw request target.
///
/// Returns `None` for anything that is not byte-for-byte one of the four
/// servable shapes.
pub fn classify(target: &str) -> Option<ResourceKind> {
    if !SERVABLE.is_match(target) {
        return None;
    }
    if target == "/registries" {
        Some(ResourceKind::Listing)
    } else if target.starts_with("/registry/") {
        Some(ResourceKind::Registry)
    } else if target.starts_with("/package/") {
        Some(ResourceKind::Package)
    } else {
        Some(ResourceKind::Artifact)
    }
}

/// Whether `s` is a well-formed lowercase registry UUID (8-4-4-4-12 hex).
pub fn is_registry_uuid(s: &str) -> bool {
    UUID_ONLY.is_match(s)
}
