//! Sentence boundary detection across scripts.
//!
//! Offsets are byte offsets into the accumulated text and always land on char
//! boundaries.

/// Sentence terminators: Latin, CJK full-width, Arabic, Urdu and Devanagari.
pub const SENTENCE_TERMINATORS: [char; 10] =
    ['.', '!', '?', '。', '！', '？', '؟', '۔', '।', '॥'];

pub fn is_terminator(c: char) -> bool {
    SENTENCE_TERMINATORS.contains(&c)
}

/// End offset of the next sentence after `scanned`, if one is complete.
///
/// The whitespace-trimmed text ending in a terminator counts as a boundary at
/// its end. Otherwise the earliest terminator past `scanned` that is followed by
/// whitespace ends a sentence.
pub fn find_sentence_boundary(text: &str, scanned: usize) -> Option<usize> {
    let trimmed = text.trim_end();
    if trimmed.len() > scanned && trimmed.ends_with(is_terminator) {
        return Some(trimmed.len());
    }

    let suffix = text.get(scanned..)?;
    let mut chars = suffix.char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        if !is_terminator(c) {
            continue;
        }
        if let Some((_, next)) = chars.peek() {
            if next.is_whitespace() {
                return Some(scanned + offset + c.len_utf8());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_terminator_ends_a_sentence() {
        for t in SENTENCE_TERMINATORS {
            let text = format!("word{}", t);
            assert_eq!(find_sentence_boundary(&text, 0), Some(text.len()), "terminator {:?}", t);

            let text = format!("word{} more", t);
            assert_eq!(
                find_sentence_boundary(&text, 0),
                Some(4 + t.len_utf8()),
                "terminator {:?} mid-text",
                t
            );
        }
    }

    #[test]
    fn test_trailing_whitespace_is_ignored() {
        assert_eq!(find_sentence_boundary("Hello world. ", 0), Some(12));
    }

    #[test]
    fn test_no_boundary_without_terminator() {
        assert_eq!(find_sentence_boundary("Hello world", 0), None);
        assert_eq!(find_sentence_boundary("", 0), None);
        // a dot inside a number is not followed by whitespace
        assert_eq!(find_sentence_boundary("pi is 3.14 and", 0), None);
    }

    #[test]
    fn test_already_scanned_text_is_skipped() {
        let text = "One. Two";
        assert_eq!(find_sentence_boundary(text, 0), Some(4));
        assert_eq!(find_sentence_boundary(text, 4), None);
        assert_eq!(find_sentence_boundary("One. Two. ", 4), Some(9));
        assert_eq!(find_sentence_boundary("One.", 4), None);
    }

    #[test]
    fn test_multibyte_offsets() {
        let text = "你好。世界";
        assert_eq!(find_sentence_boundary(text, 0), None);

        let text = "你好。 世界";
        let end = find_sentence_boundary(text, 0).unwrap();
        assert_eq!(&text[..end], "你好。");

        let text = "你好。世界！";
        assert_eq!(find_sentence_boundary(text, 0), Some(text.len()));
    }

    #[test]
    fn test_scanned_past_end() {
        assert_eq!(find_sentence_boundary("abc", 10), None);
    }
}
