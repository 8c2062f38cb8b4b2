//! URL canonicalization and crawl policy.

use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

const ASSET_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".css", ".js", ".xml",
    ".json", ".zip", ".mp4", ".avi", ".mov", ".mp3", ".wav", ".woff", ".woff2", ".ttf", ".doc",
    ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".tar", ".gz", ".tgz", ".bz2", ".7z", ".rar",
    ".exe", ".msi", ".dmg", ".iso", ".apk",
];

pub fn extract_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_ascii_lowercase()))
}

pub fn is_same_domain(url_domain: &str, base_domain: &str) -> bool {
    url_domain == base_domain
        || url_domain.ends_with(&format!(".{}", base_domain))
        || base_domain.ends_with(&format!(".{}", url_domain))
}

pub fn convert_to_absolute_url(link: &str, base_url: &str) -> Result<String, String> {
    let base = Url::parse(base_url).map_err(|e| e.to_string())?;
    let absolute_url = base.join(link).map_err(|e| e.to_string())?;
    Ok(absolute_url.to_string())
}

/// Add https:// prefix for bare domains (CLI convenience).
pub fn normalize_url_for_cli(url: &str) -> String {
    let trimmed = url.trim();

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }

    format!("https://{}", trimmed)
}

pub fn is_html_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("text/html") || lower.starts_with("application/xhtml+xml")
}

/// Canonical form used as the task key and fingerprint URL.
///
/// Lower-cases scheme and host (the `url` crate does both), drops the fragment
/// and default ports, sorts query pairs and strips a trailing slash except on
/// the root path. Returns None for anything that is not absolute http(s).
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.host_str()?;

    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if pairs.is_empty() {
            parsed.set_query(None);
        } else {
            pairs.sort();
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    Some(parsed.to_string())
}

/// Why a URL was turned away by [`UrlPolicy::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Malformed,
    Scheme,
    FragmentOnly,
    Asset,
    BlockedPath,
    OffSite,
    TooDeep,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyStats {
    pub accepted: u64,
    pub malformed: u64,
    pub scheme: u64,
    pub fragment_only: u64,
    pub asset: u64,
    pub blocked_path: u64,
    pub off_site: u64,
    pub too_deep: u64,
}

/// Filters and canonicalizes discovered URLs for one monitored site.
#[derive(Debug)]
pub struct UrlPolicy {
    site_host: String,
    blocked_paths: Vec<String>,
    max_depth: u32,
    accepted: AtomicU64,
    malformed: AtomicU64,
    scheme: AtomicU64,
    fragment_only: AtomicU64,
    asset: AtomicU64,
    blocked_path: AtomicU64,
    off_site: AtomicU64,
    too_deep: AtomicU64,
}

impl UrlPolicy {
    pub fn new(site_host: &str, blocked_paths: Vec<String>, max_depth: u32) -> Self {
        Self {
            site_host: site_host.to_ascii_lowercase(),
            blocked_paths: blocked_paths
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            max_depth,
            accepted: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            scheme: AtomicU64::new(0),
            fragment_only: AtomicU64::new(0),
            asset: AtomicU64::new(0),
            blocked_path: AtomicU64::new(0),
            off_site: AtomicU64::new(0),
            too_deep: AtomicU64::new(0),
        }
    }

    pub fn site_host(&self) -> &str {
        &self.site_host
    }

    /// Normalized URL if the policy lets it into the frontier.
    pub fn admit(&self, raw: &str, depth: u32) -> Result<String, Rejection> {
        let verdict = self.evaluate(raw, depth);
        let counter = match verdict {
            Ok(_) => &self.accepted,
            Err(Rejection::Malformed) => &self.malformed,
            Err(Rejection::Scheme) => &self.scheme,
            Err(Rejection::FragmentOnly) => &self.fragment_only,
            Err(Rejection::Asset) => &self.asset,
            Err(Rejection::BlockedPath) => &self.blocked_path,
            Err(Rejection::OffSite) => &self.off_site,
            Err(Rejection::TooDeep) => &self.too_deep,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        verdict
    }

    fn evaluate(&self, raw: &str, depth: u32) -> Result<String, Rejection> {
        let trimmed = raw.trim();
        if trimmed.starts_with('#') {
            return Err(Rejection::FragmentOnly);
        }

        let parsed = Url::parse(trimmed).map_err(|_| Rejection::Malformed)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Rejection::Scheme);
        }

        if depth > self.max_depth {
            return Err(Rejection::TooDeep);
        }

        let host = parsed.host_str().ok_or(Rejection::Malformed)?.to_ascii_lowercase();
        if !is_same_domain(&host, &self.site_host) {
            return Err(Rejection::OffSite);
        }

        let path = parsed.path().to_ascii_lowercase();
        if ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            return Err(Rejection::Asset);
        }
        if let Some(query) = parsed.query() {
            let query = query.to_ascii_lowercase();
            if query.contains("download") || query.contains("attachment") {
                return Err(Rejection::Asset);
            }
        }

        if self.blocked_paths.iter().any(|blocked| path.starts_with(blocked.as_str())) {
            return Err(Rejection::BlockedPath);
        }

        normalize_url(trimmed).ok_or(Rejection::Malformed)
    }

    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            scheme: self.scheme.load(Ordering::Relaxed),
            fragment_only: self.fragment_only.load(Ordering::Relaxed),
            asset: self.asset.load(Ordering::Relaxed),
            blocked_path: self.blocked_path.load(Ordering::Relaxed),
            off_site: self.off_site.load(Ordering::Relaxed),
            too_deep: self.too_deep.load(Ordering::Relaxed),
        }
    }
}
