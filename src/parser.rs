use scraper::{Html, Selector};

use crate::url_utils::convert_to_absolute_url;

const SKIPPED_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "data:", "file:"];

/// Extract all hyperlink URLs from HTML content
///
/// Returns the raw `href` of every `<a>` tag, trimmed, in document order.
/// Links that can never be fetched (`javascript:`, `mailto:` and friends) are
/// dropped here; everything else is left to the crawl policy.
///
/// # Examples
/// ```
/// use site_sentinel::parser::extract_links;
///
/// let html = r#"<html><body><a href="https://example.com">Link</a></body></html>"#;
/// let links = extract_links(html);
/// assert_eq!(links, vec!["https://example.com"]);
/// ```
pub fn extract_links(html_body: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(html_body);

    let mut links = Vec::new();
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            let cleaned_href = href.trim();
            let lower = cleaned_href.to_ascii_lowercase();
            if !cleaned_href.is_empty() && !SKIPPED_SCHEMES.iter().any(|s| lower.starts_with(s)) {
                links.push(cleaned_href.to_string());
            }
        }
    }

    links
}

/// Links from `html_body` made absolute against `base_url`. Unresolvable hrefs are skipped.
pub fn resolve_links(html_body: &str, base_url: &str) -> Vec<String> {
    extract_links(html_body)
        .into_iter()
        .filter(|href| !href.starts_with('#'))
        .filter_map(|href| convert_to_absolute_url(&href, base_url).ok())
        .collect()
}
