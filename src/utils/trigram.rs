use crate::index::types::{bytes_to_trigram, Trigram};

/// Extract unique trigrams from a basename.
///
/// Bytes 'A'..='Z' are folded to lowercase; all other bytes pass through
/// unchanged, so non-ASCII names still index byte-for-byte. Basenames are
/// short, so sort+dedup beats a seen-bitset here. The returned trigrams are
/// unique and sorted.
pub fn extract_trigrams(name: &[u8]) -> Vec<Trigram> {
    if name.len() < 3 {
        return Vec::new();
    }

    let mut trigrams: Vec<Trigram> = name
        .windows(3)
        .map(|w| {
            bytes_to_trigram(
                w[0].to_ascii_lowercase(),
                w[1].to_ascii_lowercase(),
                w[2].to_ascii_lowercase(),
            )
        })
        .collect();
    trigrams.sort_unstable();
    trigrams.dedup();
    trigrams
}

/// Extract trigrams from a query string for searching.
///
/// Must stay byte-identical to the index side: any divergence between the
/// two breaks recall.
pub fn query_trigrams(query: &str) -> Vec<Trigram> {
    extract_trigrams(query.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_trigrams() {
        let trigrams = extract_trigrams(b"hello");
        assert_eq!(trigrams.len(), 3); // "hel", "ell", "llo"
    }

    #[test]
    fn test_extract_trigrams_small() {
        // Edge cases
        assert_eq!(extract_trigrams(b"").len(), 0);
        assert_eq!(extract_trigrams(b"a").len(), 0);
        assert_eq!(extract_trigrams(b"ab").len(), 0);
        assert_eq!(extract_trigrams(b"abc").len(), 1);
    }

    #[test]
    fn test_extract_trigrams_case_folds() {
        assert_eq!(extract_trigrams(b"README"), extract_trigrams(b"readme"));
        assert_eq!(extract_trigrams(b"ReadMe.TXT"), extract_trigrams(b"readme.txt"));
    }

    #[test]
    fn test_extract_trigrams_dedup() {
        // "aaaa" has a single distinct window
        assert_eq!(extract_trigrams(b"aaaa").len(), 1);
    }

    #[test]
    fn test_extract_trigrams_non_ascii_passthrough() {
        // Only 'A'..='Z' fold; multi-byte UTF-8 passes through raw
        assert_eq!(
            extract_trigrams("Ä.TXT".as_bytes()),
            extract_trigrams("Ä.txt".as_bytes())
        );
        assert!(!extract_trigrams("наука.md".as_bytes()).is_empty());
    }

    #[test]
    fn test_query_matches_index_side() {
        assert_eq!(query_trigrams("ReadMe"), extract_trigrams(b"readme"));
    }
}
