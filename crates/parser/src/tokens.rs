/// Tokenization feeding the content fingerprints. Lowercased alphanumeric
/// runs; everything else is a separator. Must stay stable — changing it
/// silently changes every SimHash/MinHash in an existing corpus.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases_and_splits_on_punctuation() {
        assert_eq!(
            tokenize("Hello, World! x86_64"),
            vec!["hello", "world", "x86", "64"]
        );
    }

    #[test]
    fn test_empty_and_symbol_only_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("--- !!! ---").is_empty());
    }

    #[test]
    fn test_unicode_words_kept() {
        assert_eq!(tokenize("Grüße aus Köln"), vec!["grüße", "aus", "köln"]);
    }
}
