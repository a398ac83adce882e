use scraper::{Html, Selector};
use url::Url;

use deepharvest_core::ExtractedLink;

pub struct HtmlResult {
    pub title: Option<String>,
    pub body_text: String,
    pub links: Vec<ExtractedLink>,
    pub meta_description: Option<String>,
    pub language: Option<String>,
    pub canonical: Option<String>,
}

pub fn parse_html(html_str: &str, base_url: &Url) -> HtmlResult {
    let document = Html::parse_document(html_str);
    let base_host = base_url.host_str().unwrap_or("");

    // Title
    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    // Body text - all visible text, whitespace collapsed
    let body_text = selector("body")
        .and_then(|s| document.select(&s).next())
        .map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let links = extract_links(&document, base_url, base_host);

    let meta_description = extract_meta_content(&document, "description");

    let language = selector("html")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("lang").map(|s| s.to_string()));

    let canonical = selector("link[rel='canonical']")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("href").map(|s| s.to_string()));

    HtmlResult {
        title,
        body_text,
        links,
        meta_description,
        language,
        canonical,
    }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn extract_links(document: &Html, base_url: &Url, base_host: &str) -> Vec<ExtractedLink> {
    let Some(sel) = selector("a[href]") else {
        return vec![];
    };

    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;

            // Skip non-crawlable URL schemes
            if href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("data:")
                || href.starts_with('#')
            {
                return None;
            }

            let resolved = base_url.join(href).ok()?;
            if resolved.scheme() != "http" && resolved.scheme() != "https" {
                return None;
            }
            let host = resolved.host_str().unwrap_or("");

            Some(ExtractedLink {
                url: resolved.to_string(),
                anchor_text: {
                    let t = el.text().collect::<String>().trim().to_string();
                    if t.is_empty() {
                        None
                    } else {
                        Some(t)
                    }
                },
                is_external: host != base_host,
            })
        })
        .collect()
}

fn extract_meta_content(document: &Html, name: &str) -> Option<String> {
    let sel_str = format!("meta[name='{}']", name);
    selector(&sel_str)
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("content").map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://h/dir/page.html").unwrap()
    }

    #[test]
    fn test_links_resolved_against_base() {
        let html = r#"<html><body>
            <a href="/abs">abs</a>
            <a href="rel">rel</a>
            <a href="http://other.example/x">ext</a>
        </body></html>"#;
        let result = parse_html(html, &base());
        let urls: Vec<&str> = result.links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["http://h/abs", "http://h/dir/rel", "http://other.example/x"]
        );
        assert!(!result.links[0].is_external);
        assert!(result.links[2].is_external);
    }

    #[test]
    fn test_non_crawlable_schemes_skipped() {
        let html = r##"<body>
            <a href="mailto:x@y.z">m</a>
            <a href="javascript:void(0)">j</a>
            <a href="#frag">f</a>
            <a href="ftp://files.example/pub">ftp</a>
            <a href="/ok">ok</a>
        </body>"##;
        let result = parse_html(html, &base());
        assert_eq!(result.links.len(), 1);
        assert_eq!(result.links[0].url, "http://h/ok");
    }

    #[test]
    fn test_title_and_text_extraction() {
        let html = "<html><head><title> Hello </title></head>\
                    <body><p>one\n  two</p><p>three</p></body></html>";
        let result = parse_html(html, &base());
        assert_eq!(result.title.as_deref(), Some("Hello"));
        assert_eq!(result.body_text, "one two three");
    }

    #[test]
    fn test_anchor_text_captured() {
        let html = r#"<body><a href="/a">Click here</a><a href="/b"><img src="i.png"></a></body>"#;
        let result = parse_html(html, &base());
        assert_eq!(result.links[0].anchor_text.as_deref(), Some("Click here"));
        assert_eq!(result.links[1].anchor_text, None);
    }
}
