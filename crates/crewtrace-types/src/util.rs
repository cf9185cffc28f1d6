use sha2::{Digest, Sha256};

/// Content-based dedup hash: 16 hex chars over `actor:normalized-text`.
///
/// Deterministic over (actor, trimmed lowercase text) so the reconciler
/// can match hook-created turns against transcript entries.
pub fn content_hash(actor: &str, text: &str) -> String {
    let normalized = format!("{}:{}", actor, text.trim().to_lowercase());
    let digest = Sha256::digest(normalized.as_bytes());
    hex_prefix(&digest, 16)
}

/// The pre-migration hash format: input truncated to 200 characters before
/// normalization. Rows written before the full-content hash landed carry
/// this; the reconciler consults both during the transition period.
pub fn legacy_content_hash(actor: &str, text: &str) -> String {
    let truncated: String = text.chars().take(200).collect();
    let normalized = format!("{}:{}", actor, truncated.trim().to_lowercase());
    let digest = Sha256::digest(normalized.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// URL-safe slug from a project name: lowercase, alphanumeric runs joined
/// by single hyphens. Falls back to "project" for degenerate input.
/// Collision suffixing is the store's concern.
pub fn generate_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}
