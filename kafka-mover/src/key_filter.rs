//! Key filter expressions.
//!
//! A filter is one of three wildcard shapes or an exact key:
//! - `*part*` matches keys containing `part`
//! - `*suffix` matches keys ending with `suffix`
//! - `prefix*` matches keys starting with `prefix`
//! - anything else matches the key byte for byte
//!
//! Wildcards that appear only between other characters (`a*b`, `a*b*c`) are not
//! general globs: such patterns are compared literally. Records without a key
//! (or with an empty key) only match the empty pattern, `<null>` or `<empty>`.

const NULL_KEY_PATTERNS: [&str; 3] = ["", "<null>", "<empty>"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Any,
    Contains(Vec<u8>),
    Suffix(Vec<u8>),
    Prefix(Vec<u8>),
    Exact(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    shape: Shape,
    matches_absent: bool,
}

impl KeyFilter {
    pub fn parse(pattern: &str) -> Self {
        let matches_absent = NULL_KEY_PATTERNS.contains(&pattern);

        let shape = if pattern.is_empty() {
            Shape::Any
        } else if pattern.starts_with('*') && pattern.ends_with('*') {
            Shape::Contains(pattern.trim_matches('*').as_bytes().to_vec())
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            Shape::Suffix(suffix.as_bytes().to_vec())
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Shape::Prefix(prefix.as_bytes().to_vec())
        } else {
            Shape::Exact(pattern.as_bytes().to_vec())
        };

        Self {
            shape,
            matches_absent,
        }
    }

    pub fn matches(&self, key: Option<&[u8]>) -> bool {
        if self.shape == Shape::Any {
            return true;
        }

        let key = match key {
            Some(k) if !k.is_empty() => k,
            _ => return self.matches_absent,
        };

        match &self.shape {
            Shape::Any => true,
            Shape::Contains(part) => contains(key, part),
            Shape::Suffix(suffix) => key.ends_with(suffix),
            Shape::Prefix(prefix) => key.starts_with(prefix),
            Shape::Exact(exact) => key == exact.as_slice(),
        }
    }
}

/// Evaluate `pattern` against a key in one go.
pub fn matches_key_filter(key: Option<&[u8]>, pattern: &str) -> bool {
    KeyFilter::parse(pattern).matches(key)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Option<&[u8]> {
        Some(s.as_bytes())
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        assert!(matches_key_filter(None, ""));
        assert!(matches_key_filter(key(""), ""));
        assert!(matches_key_filter(key("anything"), ""));
    }

    #[test]
    fn test_absent_keys() {
        assert!(matches_key_filter(key(""), "<null>"));
        assert!(matches_key_filter(None, "<null>"));
        assert!(matches_key_filter(None, "<empty>"));
        assert!(!matches_key_filter(None, "orders-*"));
        assert!(!matches_key_filter(None, "*"));
    }

    #[test]
    fn test_wildcard_shapes() {
        assert!(matches_key_filter(key("orders-123"), "orders-*"));
        assert!(!matches_key_filter(key("refunds-123"), "orders-*"));
        assert!(matches_key_filter(key("orders-123"), "*-123"));
        assert!(!matches_key_filter(key("orders-124"), "*-123"));
        assert!(matches_key_filter(key("a-123-b"), "*123*"));
        assert!(!matches_key_filter(key("x"), "*123*"));
        assert!(matches_key_filter(key("x"), "*"));
        assert!(matches_key_filter(key("x"), "**"));
    }

    #[test]
    fn test_exact_match() {
        assert!(matches_key_filter(key("abc"), "abc"));
        assert!(!matches_key_filter(key("abcd"), "abc"));
        assert!(!matches_key_filter(key("ABC"), "abc"));
    }

    #[test]
    fn test_interior_wildcards_are_literal() {
        assert!(!matches_key_filter(key("aXbYc"), "a*b*c"));
        assert!(matches_key_filter(key("a*b*c"), "a*b*c"));
        // leading and trailing wildcards keep the interior one literal
        assert!(matches_key_filter(key("xa*by"), "*a*b*"));
        assert!(!matches_key_filter(key("xaQby"), "*a*b*"));
    }

    #[test]
    fn test_non_utf8_keys_compare_bytewise() {
        let raw = [0xffu8, 0x00, 0x41];
        assert!(KeyFilter::parse("*A").matches(Some(&raw)));
        assert!(!KeyFilter::parse("A*").matches(Some(&raw)));
    }
}
