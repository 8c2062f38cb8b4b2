//! Script-execution boundary.
//!
//! Some pages ship an empty shell and build their DOM client side. Those are
//! sent to a `RenderBackend` before fingerprinting. The backend is external;
//! this module bounds each call in time and caches results by input hash.

use async_trait::async_trait;
use dashmap::DashMap;
use scraper::{Html, Node};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MonitorConfig;

/// Shells with less visible body text than this are considered unrendered.
const MIN_VISIBLE_TEXT_CHARS: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("render timed out after {0:?}")]
    Timeout(Duration),

    #[error("script execution failed: {0}")]
    Execution(String),

    #[error("navigation away from {0} was blocked")]
    NavigationBlocked(String),
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub timeout: Duration,
}

/// A headless browser or similar. Implementations enforce `options.timeout`
/// themselves, never leave the initial URL, and report failures with the typed
/// variants above.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn render(&self, html: &str, url: &str, options: &RenderOptions) -> Result<String, RenderError>;
}

/// Rendered DOMs keyed by the SHA-256 of the input HTML, expiring after `ttl`.
pub struct RenderCache {
    entries: DashMap<String, (Instant, Arc<String>)>,
    ttl: Duration,
}

impl RenderCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn key_for(html: &str) -> String {
        hex::encode(Sha256::digest(html.as_bytes()))
    }

    pub fn get(&self, key: &str) -> Option<Arc<String>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.0.elapsed() < self.ttl => return Some(entry.1.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: String, rendered: Arc<String>) {
        self.entries.insert(key, (Instant::now(), rendered));
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, (stored, _)| stored.elapsed() < ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Applies a hard deadline to every backend call.
///
/// On timeout the backend future is dropped and the caller gets
/// `RenderError::Timeout`; a backend that spawned its own work may keep it
/// running after that.
pub struct BoundedRenderer {
    backend: Arc<dyn RenderBackend>,
    timeout: Duration,
    cache: RenderCache,
}

impl BoundedRenderer {
    pub fn new(backend: Arc<dyn RenderBackend>, timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            backend,
            timeout,
            cache: RenderCache::new(cache_ttl),
        }
    }

    /// Timeout and cache TTL taken from `render_timeout_secs` and `render_cache_ttl_secs`.
    pub fn from_config(backend: Arc<dyn RenderBackend>, config: &MonitorConfig) -> Self {
        Self::new(
            backend,
            Duration::from_secs(config.render_timeout_secs),
            Duration::from_secs(config.render_cache_ttl_secs),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache.ttl
    }

    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    pub async fn render(&self, html: &str, url: &str) -> Result<Arc<String>, RenderError> {
        let key = RenderCache::key_for(html);
        if let Some(hit) = self.cache.get(&key) {
            debug!(url, "render cache hit");
            return Ok(hit);
        }

        let options = RenderOptions { timeout: self.timeout };
        let rendered = match tokio::time::timeout(self.timeout, self.backend.render(html, url, &options)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(url, timeout_ms = self.timeout.as_millis() as u64, "render timed out");
                return Err(RenderError::Timeout(self.timeout));
            }
        };

        let rendered = Arc::new(rendered);
        self.cache.insert(key, rendered.clone());
        Ok(rendered)
    }
}

/// True when the page looks like a client-side shell: it has scripts but
/// almost no visible body text.
pub fn needs_render(html: &str) -> bool {
    let document = Html::parse_document(html);
    let mut has_script = false;
    let mut visible_chars = 0usize;

    for node in document.tree.root().descendants() {
        match node.value() {
            Node::Element(element) if element.name() == "script" => has_script = true,
            Node::Text(text) => {
                let hidden = node.ancestors().any(|ancestor| {
                    ancestor.value().as_element().is_some_and(|e| {
                        matches!(e.name(), "script" | "style" | "noscript" | "head" | "template")
                    })
                });
                if !hidden {
                    visible_chars += text.trim().chars().count();
                }
            }
            _ => {}
        }
    }

    has_script && visible_chars < MIN_VISIBLE_TEXT_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoBackend {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl RenderBackend for EchoBackend {
        async fn render(&self, html: &str, _url: &str, _options: &RenderOptions) -> Result<String, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("{html}<p>rendered</p>"))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl RenderBackend for FailingBackend {
        async fn render(&self, _html: &str, url: &str, _options: &RenderOptions) -> Result<String, RenderError> {
            Err(RenderError::NavigationBlocked(url.to_string()))
        }
    }

    fn echo(delay: Duration) -> Arc<EchoBackend> {
        Arc::new(EchoBackend {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[tokio::test]
    async fn test_render_result_is_cached() {
        let backend = echo(Duration::ZERO);
        let renderer = BoundedRenderer::new(backend.clone(), Duration::from_secs(1), Duration::from_secs(60));

        let first = renderer.render("<div id=root></div>", "https://a.test/").await.unwrap();
        let second = renderer.render("<div id=root></div>", "https://a.test/").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(renderer.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let backend = echo(Duration::from_secs(5));
        let renderer = BoundedRenderer::new(backend, Duration::from_millis(20), Duration::from_secs(60));
        let result = renderer.render("<div></div>", "https://a.test/").await;
        assert_eq!(result, Err(RenderError::Timeout(Duration::from_millis(20))));
        assert!(renderer.cache().is_empty());
    }

    #[tokio::test]
    async fn test_backend_errors_pass_through_typed() {
        let renderer = BoundedRenderer::new(Arc::new(FailingBackend), Duration::from_secs(1), Duration::from_secs(60));
        assert!(matches!(
            renderer.render("<div></div>", "https://a.test/").await,
            Err(RenderError::NavigationBlocked(_))
        ));
    }

    #[test]
    fn test_cache_entries_expire() {
        let cache = RenderCache::new(Duration::ZERO);
        let key = RenderCache::key_for("<p>x</p>");
        cache.insert(key.clone(), Arc::new("x".to_string()));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_needs_render_detects_shells() {
        assert!(needs_render(
            "<html><head><title>App</title></head><body><div id=\"root\"></div><script src=\"/app.js\"></script></body></html>"
        ));

        let article = format!(
            "<html><body><p>{}</p><script>track()</script></body></html>",
            "Plenty of server rendered text. ".repeat(5)
        );
        assert!(!needs_render(&article));
        assert!(!needs_render("<html><body><p>short</p></body></html>"));
    }

    #[test]
    fn test_purge_drops_expired_entries_only() {
        let expired = RenderCache::new(Duration::ZERO);
        for i in 0..1000 {
            expired.insert(RenderCache::key_for(&format!("<p>{i}</p>")), Arc::new(String::new()));
        }
        assert_eq!(expired.len(), 1000);
        assert_eq!(expired.purge_expired(), 1000);
        assert!(expired.is_empty());

        let live = RenderCache::new(Duration::from_secs(600));
        live.insert(RenderCache::key_for("<p>kept</p>"), Arc::new("kept".to_string()));
        assert_eq!(live.purge_expired(), 0);
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_renderer_settings_come_from_config() {
        let config = MonitorConfig {
            render_timeout_secs: 7,
            render_cache_ttl_secs: 90,
            ..MonitorConfig::default()
        };
        let renderer = BoundedRenderer::from_config(echo(Duration::ZERO), &config);
        assert_eq!(renderer.timeout(), Duration::from_secs(7));
        assert_eq!(renderer.cache_ttl(), Duration::from_secs(90));
    }
}
