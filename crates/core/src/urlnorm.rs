use std::collections::HashSet;

use url::form_urlencoded;
use url::Url;

use crate::error::CrawlError;

/// Canonicalizes URLs into the unique form used as the dedup key.
///
/// Normalization: lowercase scheme/host (the `url` crate guarantees both on
/// parse), drop default ports and fragments, sort query parameters with a
/// stable sort, strip configured tracking parameters, re-encode the query
/// consistently, collapse `.`/`..` segments (done by the parser), and strip a
/// single trailing slash from non-root paths. The result is idempotent:
/// `normalize(normalize(u)) == normalize(u)`.
#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    tracking_params: HashSet<String>,
}

impl UrlNormalizer {
    pub fn new<I, S>(tracking_params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tracking_params: tracking_params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse and canonicalize `raw`, resolving it against `base` when relative.
    pub fn normalize(&self, raw: &str, base: Option<&Url>) -> Result<Url, CrawlError> {
        let mut url = match base {
            Some(base) => base
                .join(raw)
                .map_err(|e| CrawlError::InvalidUrl(format!("{raw}: {e}")))?,
            None => Url::parse(raw).map_err(|e| CrawlError::InvalidUrl(format!("{raw}: {e}")))?,
        };

        url.set_fragment(None);

        // The url crate keeps explicitly-written default ports out of the
        // serialized form, but make the intent unambiguous.
        if url.port() == url.port_or_known_default() {
            let _ = url.set_port(None);
        }

        self.canonicalize_query(&mut url);

        let path = url.path().to_string();
        if path.len() > 1 && path.ends_with('/') {
            url.set_path(&path[..path.len() - 1]);
        }

        Ok(url)
    }

    fn canonicalize_query(&self, url: &mut Url) {
        if url.query().is_none() {
            return;
        }

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !self.tracking_params.contains(k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if pairs.is_empty() {
            url.set_query(None);
            return;
        }

        // Stable sort by key: repeated keys keep their original order.
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        url.set_query(Some(&query));
    }
}

impl Default for UrlNormalizer {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm() -> UrlNormalizer {
        UrlNormalizer::new(vec!["utm_source", "fbclid"])
    }

    #[test]
    fn test_fragment_and_default_port_dropped() {
        let u = norm().normalize("HTTP://Example.COM:80/a#section", None).unwrap();
        assert_eq!(u.as_str(), "http://example.com/a");
    }

    #[test]
    fn test_query_sorted_and_tracking_stripped() {
        let u = norm()
            .normalize("http://h/p?b=2&utm_source=x&a=1", None)
            .unwrap();
        assert_eq!(u.as_str(), "http://h/p?a=1&b=2");
    }

    #[test]
    fn test_tracking_only_query_removed_entirely() {
        let u = norm().normalize("http://h/p?fbclid=abc", None).unwrap();
        assert_eq!(u.as_str(), "http://h/p");
    }

    #[test]
    fn test_dot_segments_collapsed() {
        let u = norm().normalize("http://h/a/b/../c/./d", None).unwrap();
        assert_eq!(u.path(), "/a/c/d");
    }

    #[test]
    fn test_trailing_slash_stripped_except_root() {
        let n = norm();
        assert_eq!(n.normalize("http://h/a/", None).unwrap().as_str(), "http://h/a");
        assert_eq!(n.normalize("http://h/", None).unwrap().as_str(), "http://h/");
    }

    #[test]
    fn test_relative_resolution() {
        let base = Url::parse("http://h/dir/page").unwrap();
        let u = norm().normalize("../other", Some(&base)).unwrap();
        assert_eq!(u.as_str(), "http://h/other");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let n = norm();
        let inputs = [
            "http://Example.com:80/a/b/../c?z=1&a=2&a=1#f",
            "https://h/p?x=a%20b",
            "http://h/p/?utm_source=t&q=1",
            "http://h/%7Euser/",
        ];
        for raw in inputs {
            let once = n.normalize(raw, None).unwrap();
            let twice = n.normalize(once.as_str(), None).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn test_repeated_keys_keep_relative_order() {
        let u = norm().normalize("http://h/p?a=2&b=1&a=1", None).unwrap();
        assert_eq!(u.query(), Some("a=2&a=1&b=1"));
    }
}
