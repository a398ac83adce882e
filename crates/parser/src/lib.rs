pub mod html;
pub mod tokens;

use url::Url;

use deepharvest_core::ExtractedLink;

/// Max bytes to parse (5 MB). Larger pages are truncated before parsing.
const MAX_PARSE_SIZE: usize = 5 * 1024 * 1024;

/// Everything the crawl core needs from one HTML page.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub text: String,
    pub links: Vec<ExtractedLink>,
    pub meta_description: Option<String>,
    pub language: Option<String>,
    pub canonical: Option<String>,
}

pub fn parse_page(html_str: &str, base_url: &Url) -> ExtractedPage {
    let truncated = if html_str.len() > MAX_PARSE_SIZE {
        let mut end = MAX_PARSE_SIZE;
        while end > 0 && !html_str.is_char_boundary(end) {
            end -= 1;
        }
        &html_str[..end]
    } else {
        html_str
    };

    let result = html::parse_html(truncated, base_url);
    ExtractedPage {
        title: result.title,
        text: result.body_text,
        links: result.links,
        meta_description: result.meta_description,
        language: result.language,
        canonical: result.canonical,
    }
}
