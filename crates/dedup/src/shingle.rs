/// Token shingling shared by both fingerprint families.
///
/// Tokens come in already lowercased; each window of `w` consecutive tokens
/// is hashed to a stable 64-bit value. FNV-1a keeps the hashes identical
/// across runs and architectures, which the fingerprint invariant requires.
pub const SHINGLE_WIDTH: usize = 5;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn shingle_hashes(tokens: &[String], width: usize) -> Vec<u64> {
    if tokens.is_empty() {
        return Vec::new();
    }
    if tokens.len() <= width {
        let mut buf = Vec::new();
        join_window(&mut buf, tokens);
        return vec![fnv1a64(&buf)];
    }
    let mut hashes = Vec::with_capacity(tokens.len() - width + 1);
    let mut buf = Vec::new();
    for window in tokens.windows(width) {
        buf.clear();
        join_window(&mut buf, window);
        hashes.push(fnv1a64(&buf));
    }
    hashes
}

fn join_window(buf: &mut Vec<u8>, tokens: &[String]) {
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            buf.push(b' ');
        }
        buf.extend_from_slice(token.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_shingles_are_deterministic() {
        let tokens = toks("the quick brown fox jumps over the lazy dog");
        assert_eq!(
            shingle_hashes(&tokens, SHINGLE_WIDTH),
            shingle_hashes(&tokens, SHINGLE_WIDTH)
        );
    }

    #[test]
    fn test_short_input_yields_one_shingle() {
        let tokens = toks("tiny page");
        assert_eq!(shingle_hashes(&tokens, SHINGLE_WIDTH).len(), 1);
    }

    #[test]
    fn test_window_count() {
        let tokens = toks("a b c d e f g");
        assert_eq!(shingle_hashes(&tokens, 5).len(), 3);
    }

    #[test]
    fn test_empty_input() {
        assert!(shingle_hashes(&[], SHINGLE_WIDTH).is_empty());
    }
}
