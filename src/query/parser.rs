//! Daemon-side query syntax.
//!
//! Three layers, each optional, in this order:
//!
//! 1. `NAME:REST` - when NAME is a registered bookmark name, narrow the
//!    search to that bookmark's root.
//! 2. `*.EXT TOKENS` - extension filter; `*.EXT` alone is also accepted.
//! 3. The remainder is the case-insensitive substring needle; empty means
//!    "enumerate under the active filters".

/// Parse result. `bookmark_path` is the resolved root, not the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    pub bookmark_path: Option<String>,
    pub extension: Option<String>,
    pub needle: String,
}

/// Parse a raw query. `resolve_bookmark` maps a candidate name prefix to a
/// bookmark root path; returning `None` leaves the colon in the needle
/// (plain filenames may contain colons).
pub fn parse_query(
    raw: &str,
    resolve_bookmark: impl Fn(&str) -> Option<String>,
) -> ParsedQuery {
    let mut rest = raw.trim();
    let mut parsed = ParsedQuery::default();

    if let Some((prefix, remainder)) = rest.split_once(':') {
        if let Some(root) = resolve_bookmark(prefix) {
            parsed.bookmark_path = Some(root);
            rest = remainder.trim_start();
        }
    }

    if let Some(after) = rest.strip_prefix("*.") {
        let ext_end = after.find(char::is_whitespace).unwrap_or(after.len());
        let ext = &after[..ext_end];
        if !ext.is_empty() {
            parsed.extension = Some(ext.to_ascii_lowercase());
            rest = after[ext_end..].trim_start();
        }
    }

    parsed.needle = rest.trim().to_string();
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(name: &str) -> Option<String> {
        match name {
            "home" => Some("/tmp/h".to_string()),
            "work" => Some("/tmp/w".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_plain_query() {
        let q = parse_query("notes", resolver);
        assert_eq!(q, ParsedQuery {
            bookmark_path: None,
            extension: None,
            needle: "notes".to_string(),
        });
    }

    #[test]
    fn test_bookmark_prefix() {
        let q = parse_query("home:notes", resolver);
        assert_eq!(q.bookmark_path.as_deref(), Some("/tmp/h"));
        assert_eq!(q.needle, "notes");
    }

    #[test]
    fn test_unknown_prefix_stays_in_needle() {
        let q = parse_query("c:notes", resolver);
        assert_eq!(q.bookmark_path, None);
        assert_eq!(q.needle, "c:notes");
    }

    #[test]
    fn test_extension_filter() {
        let q = parse_query("*.py a", resolver);
        assert_eq!(q.extension.as_deref(), Some("py"));
        assert_eq!(q.needle, "a");
    }

    #[test]
    fn test_extension_filter_alone() {
        let q = parse_query("*.RS", resolver);
        assert_eq!(q.extension.as_deref(), Some("rs"));
        assert_eq!(q.needle, "");
    }

    #[test]
    fn test_bookmark_then_extension() {
        let q = parse_query("work:*.md readme", resolver);
        assert_eq!(q.bookmark_path.as_deref(), Some("/tmp/w"));
        assert_eq!(q.extension.as_deref(), Some("md"));
        assert_eq!(q.needle, "readme");
    }

    #[test]
    fn test_empty_query_enumerates() {
        let q = parse_query("", resolver);
        assert_eq!(q.needle, "");
        assert_eq!(q.bookmark_path, None);
        assert_eq!(q.extension, None);
    }

    #[test]
    fn test_bare_star_dot_is_needle() {
        // "*." with no extension is just a literal needle
        let q = parse_query("*.", resolver);
        assert_eq!(q.extension, None);
        assert_eq!(q.needle, "*.");
    }
}
