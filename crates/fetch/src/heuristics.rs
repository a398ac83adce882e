use once_cell::sync::Lazy;
use regex::Regex;

/// Bodies shorter than this suggest a JS shell rather than content.
const MIN_BODY_BYTES: usize = 500;

/// Pages discovering fewer outbound links than this are suspects.
const MIN_OUTBOUND_LINKS: usize = 2;

static SPA_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"(?i)__NEXT_DATA__|data-reactroot|data-reactid|ng-version|ng-app|"#,
        r#"window\.__NUXT__|data-v-app|id=["']root["']\s*>\s*</|id=["']app["']\s*>\s*</"#,
    ))
    .unwrap()
});

/// Post-fetch heuristic: should this page be re-fetched through the
/// browser? Site rules are consulted before ever calling this; the
/// heuristic only catches what static HTTP plainly failed to render.
pub fn needs_browser_fallback(html: &str, link_count: usize) -> bool {
    html.len() < MIN_BODY_BYTES || link_count < MIN_OUTBOUND_LINKS || looks_like_spa(html)
}

pub fn looks_like_spa(html: &str) -> bool {
    SPA_MARKERS.is_match(html)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_body_triggers_fallback() {
        assert!(needs_browser_fallback("<html></html>", 10));
    }

    #[test]
    fn test_link_poor_page_triggers_fallback() {
        let html = format!("<html><body>{}</body></html>", "content ".repeat(200));
        assert!(needs_browser_fallback(&html, 0));
        assert!(!needs_browser_fallback(&html, 5));
    }

    #[test]
    fn test_spa_markers_detected() {
        assert!(looks_like_spa(r#"<script id="__NEXT_DATA__" type="application/json">"#));
        assert!(looks_like_spa(r#"<div data-reactroot="">"#));
        assert!(looks_like_spa(r#"<div id="root"> </div><script src="bundle.js">"#));
        assert!(!looks_like_spa("<html><body><p>plain page</p></body></html>"));
    }

    #[test]
    fn test_content_rich_page_passes() {
        let html = format!(
            "<html><body><article>{}</article></body></html>",
            "long form text ".repeat(100)
        );
        assert!(!needs_browser_fallback(&html, 8));
    }
}
