//! Encodings used to name combined resources.

use std::fmt::Write;

/// The separator between pieces of a multipart segment.
const MULTIPART_SEPARATOR: char = '+';

/// The escape character of a multipart segment.
const MULTIPART_ESCAPE: char = '=';

/// The escape character of URL-safe segments.
const URL_ESCAPE: u8 = b',';

/// Encodes arbitrary URL text into a single URL path segment and back.
///
/// Letters, digits and `.-_+=` are kept as is. Common URL punctuation gets a
/// short two-character escape and any other byte becomes `,XX` in hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlEscaper;

impl UrlEscaper {
    /// Escapes text into a segment containing no `/`, `?` or `&`.
    pub fn encode(text: &str) -> String {
        let mut escaped = String::with_capacity(text.len());
        for &b in text.as_bytes() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b'+' | b'=' => {
                    escaped.push(char::from(b))
                }
                b',' => escaped.push_str(",,"),
                b'/' => escaped.push_str(",_"),
                b'?' => escaped.push_str(",q"),
                b'&' => escaped.push_str(",a"),
                _ => {
                    let _ = write!(escaped, ",{b:02X}");
                }
            }
        }
        escaped
    }

    /// Reverses [`UrlEscaper::encode`].
    ///
    /// Returns `None` for a malformed escape.
    pub fn decode(segment: &str) -> Option<String> {
        let bytes = segment.as_bytes();
        let mut decoded = Vec::with_capacity(bytes.len());
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != URL_ESCAPE {
                decoded.push(bytes[i]);
                i += 1;
                continue;
            }

            match *bytes.get(i + 1)? {
                b',' => decoded.push(b','),
                b'_' => decoded.push(b'/'),
                b'q' => decoded.push(b'?'),
                b'a' => decoded.push(b'&'),
                _ => {
                    let hex = segment.get(i + 1..i + 3)?;
                    decoded.push(u8::from_str_radix(hex, 16).ok()?);
                    i += 3;
                    continue;
                }
            }
            i += 2;
        }

        String::from_utf8(decoded).ok()
    }
}

/// Joins pieces with `+`, escaping any `+` or `=` inside a piece with `=`.
///
/// An empty last piece is kept: `["a", "b", ""]` encodes as `a+b+`. An empty
/// list and a list holding one empty piece both encode as the empty string.
pub fn encode_multipart<S: AsRef<str>>(pieces: &[S]) -> String {
    let mut encoded = String::new();
    for (i, piece) in pieces.iter().enumerate() {
        if i > 0 {
            encoded.push(MULTIPART_SEPARATOR);
        }

        for c in piece.as_ref().chars() {
            if c == MULTIPART_SEPARATOR || c == MULTIPART_ESCAPE {
                encoded.push(MULTIPART_ESCAPE);
            }
            encoded.push(c);
        }
    }
    encoded
}

/// Splits a multipart segment back into its pieces.
///
/// The empty string decodes to an empty list. Returns `None` if the segment
/// ends in a dangling escape.
pub fn decode_multipart(encoded: &str) -> Option<Vec<String>> {
    if encoded.is_empty() {
        return Some(Vec::new());
    }

    let mut pieces = Vec::new();
    let mut piece = String::new();
    let mut chars = encoded.chars();

    while let Some(c) = chars.next() {
        match c {
            MULTIPART_ESCAPE => piece.push(chars.next()?),
            MULTIPART_SEPARATOR => pieces.push(std::mem::take(&mut piece)),
            c => piece.push(c),
        }
    }

    pieces.push(piece);
    Some(pieces)
}

/// Gets the length a single piece occupies in a multipart segment.
pub(crate) fn multipart_piece_len(piece: &str) -> usize {
    piece.len()
        + piece
            .chars()
            .filter(|&c| c == MULTIPART_SEPARATOR || c == MULTIPART_ESCAPE)
            .count()
}
