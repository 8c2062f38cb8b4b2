//! Content fingerprinting: turns noisy HTML into stable, comparable identities.
//!
//! Two representations come out of one parse:
//! - the opening-tag skeleton (hashed into `structural_digest`) plus a tag-count
//!   bag, used to measure how much the structure moved;
//! - an indented element/attribute/text line stream (hashed into
//!   `semantic_hash`), used to decide whether anything changed at all.
//!
//! Script and style subtrees and comments are dropped before either is built.

use scraper::{Html, Node};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::models::{ContentFeatures, PageVersion};

/// Elements whose whole subtree is ignored.
const STRIPPED_ELEMENTS: &[&str] = &["script", "style"];

/// `approx_size` granularity in characters.
pub const SIZE_BUCKET_CHARS: usize = 256;

/// Hex SHA-256 of `parts` joined with `|`.
pub fn digest_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Identity of a page version. Same inputs always yield the same identity.
pub fn page_identity(normalized_url: &str, structural_digest: &str, version: &str) -> String {
    digest_hex(&[normalized_url, structural_digest, version])
}

/// Typed result of fingerprinting. None of the non-Ready variants has side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum FingerprintOutcome {
    Ready(PageVersion),
    /// Body was empty.
    EmptyContent,
    /// HTTP status outside [200, 300).
    IneligibleStatus(u16),
    /// Extraction blew up; carries the reason.
    ProcessFailed(String),
}

impl FingerprintOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FingerprintOutcome::Ready(_) => "READY",
            FingerprintOutcome::EmptyContent => "EMPTY_CONTENT",
            FingerprintOutcome::IneligibleStatus(_) => "INELIGIBLE_STATUS",
            FingerprintOutcome::ProcessFailed(_) => "PROCESS_FAILED",
        }
    }

    pub fn into_page(self) -> Option<PageVersion> {
        match self {
            FingerprintOutcome::Ready(page) => Some(page),
            _ => None,
        }
    }
}

/// Everything extracted from one document walk.
#[derive(Debug, Default)]
struct Extraction {
    skeleton: Vec<String>,
    features: BTreeMap<String, u32>,
    semantic_lines: Vec<String>,
    title: Option<String>,
    meta_description: Option<String>,
}

/// Stateless fingerprinter pinned to one extraction version.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    extraction_version: String,
}

impl Fingerprinter {
    pub fn new(extraction_version: impl Into<String>) -> Self {
        Self {
            extraction_version: extraction_version.into(),
        }
    }

    pub fn extraction_version(&self) -> &str {
        &self.extraction_version
    }

    /// Fingerprint a fetched page. `normalized_url` must already be canonical.
    pub fn fingerprint(&self, normalized_url: &str, status: u16, body: &[u8]) -> FingerprintOutcome {
        self.fingerprint_with(normalized_url, status, body, extract)
    }

    fn fingerprint_with<F>(&self, normalized_url: &str, status: u16, body: &[u8], extractor: F) -> FingerprintOutcome
    where
        F: FnOnce(&str) -> Extraction,
    {
        if body.is_empty() {
            return FingerprintOutcome::EmptyContent;
        }
        if !(200..300).contains(&status) {
            return FingerprintOutcome::IneligibleStatus(status);
        }

        // Lossy decoding keeps the output independent of the source encoding.
        let text = String::from_utf8_lossy(body);
        if text.trim().is_empty() {
            return FingerprintOutcome::EmptyContent;
        }

        match catch_unwind(AssertUnwindSafe(|| extractor(&text))) {
            Ok(extraction) => FingerprintOutcome::Ready(self.assemble(normalized_url, &text, extraction)),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "extraction panicked".to_string());
                tracing::error!(url = normalized_url, %reason, "fingerprint extraction failed");
                FingerprintOutcome::ProcessFailed(reason)
            }
        }
    }

    fn assemble(&self, normalized_url: &str, text: &str, extraction: Extraction) -> PageVersion {
        let structural_digest = digest_hex(&[&extraction.skeleton.join(",")]);
        let semantic_hash = digest_hex(&[&extraction.semantic_lines.join("\n")]);
        let approx_size = (text.chars().count() / SIZE_BUCKET_CHARS) * SIZE_BUCKET_CHARS;

        PageVersion {
            identity: page_identity(normalized_url, &structural_digest, &self.extraction_version),
            normalized_url: normalized_url.to_string(),
            structural_digest,
            semantic_hash,
            structural_features: extraction.features,
            content_features: ContentFeatures {
                title: extraction.title,
                meta_description: extraction.meta_description,
                approx_size,
            },
            extraction_version: self.extraction_version.clone(),
        }
    }
}

/// Walk the parsed tree in document order.
fn extract(text: &str) -> Extraction {
    let document = Html::parse_document(text);
    let mut out = Extraction::default();

    for node in document.tree.root().descendants() {
        if is_stripped(node.value()) || node.ancestors().any(|a| is_stripped(a.value())) {
            continue;
        }

        // The document node itself is an ancestor of everything, so depth starts at 1.
        let depth = node.ancestors().count().saturating_sub(1);
        let indent = "  ".repeat(depth);

        match node.value() {
            Node::Element(element) => {
                let name = element.name().to_string();

                let mut attrs: Vec<(&str, &str)> = element.attrs().collect();
                attrs.sort_unstable();
                let mut line = format!("{}<{}", indent, name);
                for (key, value) in &attrs {
                    line.push_str(&format!(" {}=\"{}\"", key, value));
                }
                line.push('>');
                out.semantic_lines.push(line);

                if name == "meta" && out.meta_description.is_none() {
                    let is_description = element
                        .attr("name")
                        .is_some_and(|n| n.eq_ignore_ascii_case("description"));
                    if is_description {
                        out.meta_description = element
                            .attr("content")
                            .map(collapse_whitespace)
                            .filter(|c| !c.is_empty());
                    }
                }

                *out.features.entry(name.clone()).or_insert(0) += 1;
                out.skeleton.push(name);
            }
            Node::Text(text_node) => {
                let collapsed = collapse_whitespace(text_node);
                if collapsed.is_empty() {
                    continue;
                }

                let in_title = node
                    .parent()
                    .and_then(|p| p.value().as_element().map(|e| e.name() == "title"))
                    .unwrap_or(false);
                if in_title && out.title.is_none() {
                    out.title = Some(collapsed.clone());
                }

                out.semantic_lines.push(format!("{}{}", indent, collapsed));
            }
            // Comments, doctype and processing instructions carry no signal.
            _ => {}
        }
    }

    out
}

fn is_stripped(node: &Node) -> bool {
    node.as_element()
        .map(|e| STRIPPED_ELEMENTS.contains(&e.name()))
        .unwrap_or(false)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
