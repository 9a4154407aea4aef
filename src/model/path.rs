//! Canonical hierarchical keys with reversible escaping.
//!
//! A [`Path`] is an ordered sequence of non-empty segments. Segments are
//! escaped when they contain the separator, the alternate separator, or the
//! escape character itself, so that [`Path::parse`] and [`Path::format`] are
//! inverses of one another for every sequence of non-empty segments.
//!
//! # Examples
//!
//! ```
//! use pathkeeper::model::path::Path;
//!
//! let p = Path::parse("/a/b-Xc").unwrap();
//! assert_eq!(p.segments(), &["a".to_string(), "b/c".to_string()]);
//! assert_eq!(p.format(), "/a/b-Xc");
//! ```

use std::fmt;

use thiserror::Error;

const SEP: char = '/';
const ALT_SEP: char = '\\';
const ESCAPE: char = '-';

/// Errors produced while parsing a path string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A segment was empty or contained only whitespace.
    #[error("path segment at index {index} is empty or whitespace-only")]
    EmptySegment { index: usize },
    /// An escape character was followed by an unrecognized character.
    #[error("invalid escape sequence `-{follow}` in segment at index {index}")]
    InvalidEscape { index: usize, follow: char },
    /// An escape character appeared at the end of a segment with nothing following it.
    #[error("dangling escape character at end of segment at index {index}")]
    DanglingEscape { index: usize },
}

/// A single path component, stored in its unescaped (logical) form.
pub type PathSegment = String;

/// An ordered sequence of non-empty segments identifying an entry.
///
/// The root path has zero segments and formats to `"/"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    /// The root path (zero segments).
    #[must_use]
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Build a path from already-unescaped segments.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::EmptySegment`] if any segment is empty or
    /// whitespace-only.
    pub fn from_segments(segments: Vec<PathSegment>) -> Result<Self, PathError> {
        for (index, segment) in segments.iter().enumerate() {
            if segment.trim().is_empty() {
                return Err(PathError::EmptySegment { index });
            }
        }
        Ok(Self { segments })
    }

    /// Parse an escaped path string. Accepts either `/` or `\` as the
    /// separator; always escapes on the canonical `-` escape character.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if a segment is empty/whitespace, or an escape
    /// sequence is malformed.
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let trimmed = input.trim_start_matches(SEP).trim_start_matches(ALT_SEP);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let raw_segments: Vec<&str> = split_on_separators(trimmed);
        let mut segments = Vec::with_capacity(raw_segments.len());
        for (index, raw) in raw_segments.iter().enumerate() {
            let decoded = decode_segment(raw, index)?;
            if decoded.trim().is_empty() {
                return Err(PathError::EmptySegment { index });
            }
            segments.push(decoded);
        }
        Ok(Self { segments })
    }

    /// Format this path as a canonical `/`-separated, escaped string.
    #[must_use]
    pub fn format(&self) -> String {
        if self.segments.is_empty() {
            return SEP.to_string();
        }
        let mut out = String::new();
        for segment in &self.segments {
            out.push(SEP);
            out.push_str(&encode_segment(segment));
        }
        out
    }

    /// Borrow the unescaped segments making up this path.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// `true` for the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The final segment's name, or `None` for the root path.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path. The root path is its own parent.
    #[must_use]
    pub fn parent(&self) -> Path {
        if self.segments.is_empty() {
            return self.clone();
        }
        Path {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    /// Build the child path obtained by appending `segment` to `self`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::EmptySegment`] if `segment` is empty or
    /// whitespace-only.
    pub fn child(&self, segment: impl Into<String>) -> Result<Path, PathError> {
        let segment = segment.into();
        if segment.trim().is_empty() {
            return Err(PathError::EmptySegment {
                index: self.segments.len(),
            });
        }
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Path { segments })
    }

    /// `true` if `self` is `other` or a descendant of `other`.
    #[must_use]
    pub fn starts_with(&self, other: &Path) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl std::str::FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

fn split_on_separators(input: &str) -> Vec<&str> {
    // Split on either separator, but not on an escaped separator (`-X`, `-Y`).
    // We scan char-by-char so an escape sequence never contributes a split point.
    let mut parts = Vec::new();
    let mut start = 0;
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == ESCAPE && i + 1 < bytes.len() {
            i += 2;
            continue;
        }
        if c == SEP || c == ALT_SEP {
            parts.push(&input[char_byte_offset(input, start)..char_byte_offset(input, i)]);
            start = i + 1;
        }
        i += 1;
    }
    parts.push(&input[char_byte_offset(input, start)..]);
    parts
}

fn char_byte_offset(input: &str, char_index: usize) -> usize {
    input
        .char_indices()
        .nth(char_index)
        .map_or(input.len(), |(byte_index, _)| byte_index)
}

fn decode_segment(raw: &str, index: usize) -> Result<String, PathError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('X') => out.push(SEP),
            Some('Y') => out.push(ALT_SEP),
            Some(ESCAPE) => out.push(ESCAPE),
            Some(other) => return Err(PathError::InvalidEscape { index, follow: other }),
            None => return Err(PathError::DanglingEscape { index }),
        }
    }
    Ok(out)
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            SEP => {
                out.push(ESCAPE);
                out.push('X');
            }
            ALT_SEP => {
                out.push(ESCAPE);
                out.push('Y');
            }
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPE);
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_round_trips() {
        let root = Path::root();
        assert_eq!(root.format(), "/");
        assert_eq!(Path::parse("/").unwrap(), root);
        assert_eq!(Path::parse("").unwrap(), root);
    }

    #[test]
    fn simple_segments_round_trip() {
        let p = Path::parse("/a/b/c").unwrap();
        assert_eq!(p.segments(), &["a", "b", "c"]);
        assert_eq!(p.format(), "/a/b/c");
    }

    #[test]
    fn escaped_separator_round_trips() {
        let p = Path::from_segments(vec!["a/b".to_string(), "c".to_string()]).unwrap();
        let formatted = p.format();
        assert_eq!(formatted, "/a-Xb/c");
        assert_eq!(Path::parse(&formatted).unwrap(), p);
    }

    #[test]
    fn escaped_backslash_and_dash_round_trip() {
        let p = Path::from_segments(vec!["a\\b".to_string(), "c-d".to_string()]).unwrap();
        let formatted = p.format();
        assert_eq!(Path::parse(&formatted).unwrap(), p);
        assert!(formatted.contains("-Y"));
        assert!(formatted.contains("--"));
    }

    #[test]
    fn backslash_separator_accepted_on_parse() {
        let p = Path::parse(r"\a\b").unwrap();
        assert_eq!(p.segments(), &["a", "b"]);
    }

    #[test]
    fn rejects_empty_segment() {
        assert!(matches!(
            Path::parse("/a//b"),
            Err(PathError::EmptySegment { .. })
        ));
    }

    #[test]
    fn rejects_whitespace_only_segment() {
        assert!(matches!(
            Path::parse("/a/   /b"),
            Err(PathError::EmptySegment { .. })
        ));
    }

    #[test]
    fn rejects_unknown_escape_follow_char() {
        assert!(matches!(
            Path::parse("/a-Zb"),
            Err(PathError::InvalidEscape { .. })
        ));
    }

    #[test]
    fn rejects_dangling_escape() {
        assert!(matches!(
            Path::parse("/a-"),
            Err(PathError::DanglingEscape { .. })
        ));
    }

    #[test]
    fn parent_and_child() {
        let root = Path::root();
        let a = root.child("a").unwrap();
        let ab = a.child("b").unwrap();
        assert_eq!(ab.parent(), a);
        assert_eq!(a.parent(), root);
        assert_eq!(root.parent(), root);
        assert_eq!(ab.name(), Some("b"));
        assert_eq!(root.name(), None);
    }

    #[test]
    fn starts_with_detects_descendants() {
        let a = Path::parse("/a").unwrap();
        let ab = Path::parse("/a/b").unwrap();
        assert!(ab.starts_with(&a));
        assert!(ab.starts_with(&ab));
        assert!(!a.starts_with(&ab));
    }

    proptest::proptest! {
        #[test]
        fn parse_format_round_trip(segments in proptest::collection::vec("[a-zA-Z0-9_]{1,12}", 0..8)) {
            let path = Path::from_segments(segments).unwrap();
            let formatted = path.format();
            let parsed = Path::parse(&formatted).unwrap();
            proptest::prop_assert_eq!(parsed, path);
        }
    }
}
