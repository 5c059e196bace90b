//! Deterministic names for build pods and images.
//!
//! The same `(slug, ref)` always yields the same build name, which lets the
//! cluster's create-if-absent behaviour act as the lock between concurrent
//! runs.

use sha2::{Digest, Sha256};

/// Cluster resource names are DNS labels.
pub const BUILD_NAME_LIMIT: usize = 63;
pub const BUILD_NAME_PREFIX: &str = "build-";
const REF_LENGTH: usize = 6;
const HASH_LENGTH: usize = 6;
/// Docker repository names are capped at 255 characters.
const IMAGE_NAME_LIMIT: usize = 255;

/// Escape every byte outside `[A-Za-z0-9]` as `-XX` (uppercase hex).
/// The escape character itself is escaped, so the mapping is injective.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push_str(&format!("-{:02X}", b));
        }
    }
    out
}

fn sha256_hex(s: &str) -> String {
    Sha256::digest(s.as_bytes()).iter().map(|b| format!("{:02x}", b)).collect()
}

/// Length-bounded slug: escaped prefix plus a short content hash of the full slug,
/// so truncation never makes two repositories collide.
pub fn safe_build_slug(build_slug: &str, limit: usize) -> String {
    let hash = sha256_hex(build_slug);
    let escaped = escape(build_slug);
    let keep = limit.saturating_sub(HASH_LENGTH + 1).min(escaped.len());
    format!("{}-{}", &escaped[..keep], &hash[..HASH_LENGTH]).to_lowercase()
}

/// Build pod name: `build-<safe slug>-<first 6 escaped ref chars>`, at most 63 chars.
pub fn build_name(build_slug: &str, resolved_ref: &str) -> String {
    let slug_limit = BUILD_NAME_LIMIT - BUILD_NAME_PREFIX.len() - REF_LENGTH - 1;
    let slug = safe_build_slug(build_slug, slug_limit);
    let escaped_ref = escape(resolved_ref);
    let r = &escaped_ref[..REF_LENGTH.min(escaped_ref.len())];
    format!("{}{}-{}", BUILD_NAME_PREFIX, slug, r).to_lowercase()
}

/// Full image name `<prefix><safe slug>:<ref>`, normalized for registries.
pub fn image_name(image_prefix: &str, build_slug: &str, resolved_ref: &str) -> String {
    let slug = safe_build_slug(build_slug, IMAGE_NAME_LIMIT.saturating_sub(image_prefix.len()));
    format!("{}{}:{}", image_prefix, slug, resolved_ref).replace('_', "-").to_lowercase()
}

/// Repository and tag to look up in the registry: the last two path segments
/// of the image name, split at the tag separator.
pub fn registry_lookup(image: &str) -> (String, String) {
    let parts: Vec<&str> = image.split('/').collect();
    let tail = if parts.len() >= 2 { parts[parts.len() - 2..].join("/") } else { image.to_string() };
    match tail.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (tail, "latest".to_string()),
    }
}

/// Image name with its tag removed, as used to match running containers.
pub fn image_without_tag(image: &str) -> &str {
    match image.rsplit_once(':') {
        Some((head, tag)) if !tag.contains('/') => head,
        _ => image,
    }
}
