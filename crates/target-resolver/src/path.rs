//! Path rewriting helpers used by the resolver.
//!
//! Paths are handled as sequences of segments: empty segments produced by
//! leading, trailing or doubled slashes are dropped before matching, so
//! stripping `a/b` from `/x/a/b/y` yields `/x/y` regardless of how the strip
//! segment was written.

use std::borrow::Cow;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Segment the relay inserts in front of the connection name on
/// hybrid-connection URIs. Never forwarded to a local target.
pub const RELAY_SEGMENT_MARKER: &str = "$hc";

/// Characters percent-encoded inside a single path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A path segment of an inbound URI. Segments whose escapes do not decode
/// to UTF-8 are kept exactly as received.
enum Segment<'a> {
    Decoded(Cow<'a, str>),
    Raw(&'a str),
}

impl<'a> Segment<'a> {
    fn parse(raw: &'a str) -> Self {
        match percent_decode_str(raw).decode_utf8() {
            Ok(decoded) => Segment::Decoded(decoded),
            Err(_) => Segment::Raw(raw),
        }
    }

    fn encode(&self) -> String {
        match self {
            Segment::Decoded(s) => utf8_percent_encode(s, PATH_SEGMENT).to_string(),
            Segment::Raw(s) => (*s).to_string(),
        }
    }
}

impl AsRef<str> for Segment<'_> {
    fn as_ref(&self) -> &str {
        match self {
            Segment::Decoded(s) => s,
            Segment::Raw(s) => s,
        }
    }
}

/// Remove the first contiguous occurrence of `strip`'s segments from
/// `segs`. Returns `true` if something was removed.
fn remove_sequence<T: AsRef<str>>(segs: &mut Vec<T>, strip: &[&str]) -> bool {
    if strip.is_empty() || strip.len() > segs.len() {
        return false;
    }

    let found = (0..=segs.len() - strip.len()).find(|&start| {
        segs[start..start + strip.len()]
            .iter()
            .zip(strip)
            .all(|(a, b)| a.as_ref() == *b)
    });

    match found {
        Some(start) => {
            segs.drain(start..start + strip.len());
            true
        }
        None => false,
    }
}

/// Strip `strip` (a slash-separated segment sequence) from `path` and return
/// the slash-normalized remainder. The result always starts with `/`; a
/// trailing slash on the input is kept when any segment remains.
pub fn strip_segments(path: &str, strip: &str) -> String {
    let mut segs = segments(path);
    remove_sequence(&mut segs, &segments(strip));
    join(&segs, path.ends_with('/'), |s| s.to_string())
}

/// Build the path forwarded to the local target.
///
/// `raw_path` is the (already percent-encoded) path of the inbound URI. The
/// relay marker segment is dropped, `strip` is removed as a contiguous
/// segment sequence, and every remaining segment is re-encoded.
pub fn build_target_path(raw_path: &str, strip: &str) -> String {
    let mut segs: Vec<Segment<'_>> = segments(raw_path).into_iter().map(Segment::parse).collect();

    if let Some(pos) = segs.iter().position(|s| s.as_ref() == RELAY_SEGMENT_MARKER) {
        segs.remove(pos);
    }
    remove_sequence(&mut segs, &segments(strip));

    join(&segs, raw_path.ends_with('/'), Segment::encode)
}

fn join<T, F>(segs: &[T], trailing_slash: bool, encode: F) -> String
where
    F: Fn(&T) -> String,
{
    if segs.is_empty() {
        return "/".to_string();
    }

    let mut out = String::new();
    for seg in segs {
        out.push('/');
        out.push_str(&encode(seg));
    }
    if trailing_slash {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_is_slash_insensitive() {
        for strip in ["a/b", "/a/b", "a/b/", "/a/b/", "//a//b//"] {
            assert_eq!(strip_segments("/x/a/b/y", strip), "/x/y", "strip = {strip:?}");
        }
    }

    #[test]
    fn strip_matches_whole_segments_only() {
        assert_eq!(strip_segments("/x/ab/y", "a"), "/x/ab/y");
        assert_eq!(strip_segments("/xa/b/y", "a/b"), "/xa/b/y");
    }

    #[test]
    fn strip_requires_contiguous_sequence() {
        assert_eq!(strip_segments("/a/x/b", "a/b"), "/a/x/b");
    }

    #[test]
    fn strip_removes_first_occurrence_only() {
        assert_eq!(strip_segments("/a/x/a/y", "a"), "/x/a/y");
    }

    #[test]
    fn strip_everything_yields_root() {
        assert_eq!(strip_segments("/a/b", "a/b"), "/");
        assert_eq!(strip_segments("/a/b/", "/a/b/"), "/");
    }

    #[test]
    fn empty_strip_only_normalizes() {
        assert_eq!(strip_segments("//x///y", ""), "/x/y");
        assert_eq!(strip_segments("", ""), "/");
    }

    #[test]
    fn trailing_slash_is_preserved() {
        assert_eq!(strip_segments("/conn/app/", "conn"), "/app/");
    }

    #[test]
    fn target_path_drops_relay_marker() {
        assert_eq!(build_target_path("/$hc/conn/foo", ""), "/conn/foo");
        assert_eq!(build_target_path("/$hc/conn/foo", "conn"), "/foo");
    }

    #[test]
    fn target_path_reencodes_segments() {
        assert_eq!(build_target_path("/conn/a%20b/c", "conn"), "/a%20b/c");
        assert_eq!(build_target_path("/conn/a%2Fb", "conn"), "/a%2Fb");
    }

    #[test]
    fn target_path_matches_decoded_segments() {
        assert_eq!(build_target_path("/my%20conn/x", "my conn"), "/x");
    }

    #[test]
    fn undecodable_escapes_pass_through_unchanged() {
        assert_eq!(build_target_path("/conn/%FF/x", "conn"), "/%FF/x");
        assert_eq!(build_target_path("/conn/a%C3b", "conn"), "/a%C3b");
    }
}
