use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

static HEADER_CHARSET: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r#"(?i)charset\s*=\s*"?([a-zA-Z0-9_\-]+)"#).unwrap());

static META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)<meta[^>]+charset\s*=\s*["']?([a-zA-Z0-9_\-]+)"#).unwrap()
});

/// How far into the body the meta-tag sniff looks.
const META_SNIFF_WINDOW: usize = 2048;

/// Decode a response body to UTF-8 text.
///
/// Detection order: byte-order mark, `charset` from the Content-Type header,
/// `<meta charset>` tag, then statistical detection. Returns the text and
/// the name of the encoding used.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> (String, &'static str) {
    let encoding = sniff_bom(bytes)
        .or_else(|| header_charset(content_type))
        .or_else(|| meta_charset(bytes))
        .unwrap_or_else(|| detect_statistically(bytes));

    let (text, _, _) = encoding.decode(bytes);
    (text.into_owned(), encoding.name())
}

fn sniff_bom(bytes: &[u8]) -> Option<&'static Encoding> {
    Encoding::for_bom(bytes).map(|(encoding, _)| encoding)
}

fn header_charset(content_type: Option<&str>) -> Option<&'static Encoding> {
    let header = content_type?;
    let caps = HEADER_CHARSET.captures(header)?;
    Encoding::for_label(caps.get(1)?.as_str().as_bytes())
}

fn meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let window = &bytes[..bytes.len().min(META_SNIFF_WINDOW)];
    let caps = META_CHARSET.captures(window)?;
    Encoding::for_label(caps.get(1)?.as_bytes())
}

fn detect_statistically(bytes: &[u8]) -> &'static Encoding {
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_bom_wins() {
        let mut body = vec![0xEF, 0xBB, 0xBF];
        body.extend_from_slice("héllo".as_bytes());
        let (text, name) = decode_body(&body, Some("text/html; charset=latin1"));
        assert_eq!(name, "UTF-8");
        assert_eq!(text, "héllo");
    }

    #[test]
    fn test_header_charset_used() {
        // "café" in ISO-8859-1.
        let body = [0x63, 0x61, 0x66, 0xE9];
        let (text, name) = decode_body(&body, Some("text/html; charset=ISO-8859-1"));
        assert_eq!(name, "windows-1252");
        assert_eq!(text, "café");
    }

    #[test]
    fn test_meta_tag_charset() {
        let body = b"<html><head><meta charset=\"windows-1251\"></head>\xcf\xf0\xe8</html>";
        let (text, name) = decode_body(body.as_slice(), None);
        assert_eq!(name, "windows-1251");
        assert!(text.contains("При"));
    }

    #[test]
    fn test_statistical_fallback_on_plain_utf8() {
        let body = "これは日本語のテキストです。".as_bytes();
        let (text, _) = decode_body(body, None);
        assert!(text.contains("日本語"));
    }
}
