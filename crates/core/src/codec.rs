//! Conversion between local plain text and remote markup.
//!
//! Rich-markup rules live behind [`ContentCodec`]; the engine only relies on
//! encode/decode being pure and on the hash being deterministic.

use std::sync::LazyLock;

use regex_lite::Regex;
use sha2::{Digest, Sha256};

use crate::errors::ValidationError;
use crate::models::LinkTarget;

/// Pure conversion between local text and remote markup.
pub trait ContentCodec: Send + Sync {
    /// Local text to remote markup. Fails on content the remote cannot hold.
    fn encode(&self, text: &str) -> Result<String, ValidationError>;

    /// Remote markup to local text.
    fn decode(&self, markup: &str) -> String;

    /// Deterministic hex digest of local text.
    fn hash(&self, text: &str) -> String {
        content_hash(text)
    }

    /// Links found in remote markup. Targets the codec cannot resolve on its
    /// own are returned as [`LinkTarget::Broken`] with the raw reference.
    fn extract_links(&self, markup: &str) -> Vec<LinkTarget>;
}

/// SHA-256 of the text with line endings normalised to `\n`.
pub fn content_hash(text: &str) -> String {
    let normalised = normalise_newlines(text);
    hash_bytes(normalised.as_bytes())
}

/// SHA-256 of raw bytes, hex encoded.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn normalise_newlines(text: &str) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.to_string()
    }
}

// ---------------------------------------------------------------------------
// Plain text
// ---------------------------------------------------------------------------

/// Identity codec with newline normalisation and Markdown-style links.
///
/// Item references are written `[text](item:<id>)`; `http(s)` and `mailto`
/// targets are external; anything else is left for the caller to resolve.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextCodec;

/// `[text](target "optional title")`
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[[^\]]*\]\(([^)\s]+)(?:\s+[^)]*)?\)"#).unwrap());

impl ContentCodec for PlainTextCodec {
    fn encode(&self, text: &str) -> Result<String, ValidationError> {
        if let Some(pos) = text.find('\0') {
            return Err(ValidationError {
                path: String::new(),
                detail: format!("NUL byte at offset {pos}"),
            });
        }
        Ok(normalise_newlines(text))
    }

    fn decode(&self, markup: &str) -> String {
        normalise_newlines(markup)
    }

    fn extract_links(&self, markup: &str) -> Vec<LinkTarget> {
        let mut seen = std::collections::HashSet::new();
        LINK
            .captures_iter(markup)
            .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
            .filter(|target| !target.starts_with('#'))
            .map(|target| classify_target(&target))
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }
}

fn classify_target(target: &str) -> LinkTarget {
    if let Some(id) = target.strip_prefix("item:") {
        if !id.is_empty() {
            return LinkTarget::Item(id.to_string());
        }
    }
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("mailto:")
    {
        LinkTarget::External(target.to_string())
    } else {
        LinkTarget::Broken(target.to_string())
    }
}
