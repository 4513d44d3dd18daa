//! Character-indexed text helpers.
//!
//! Offsets throughout the crate count Unicode scalar values, not bytes, so
//! chunk boundaries line up with what a reader sees in CJK text.

/// Number of characters in `text`.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Characters `[start, end)` of `text`, clamped to its length.
pub fn slice_chars(text: &str, start: usize, end: usize) -> &str {
    let begin = byte_offset(text, start);
    let finish = byte_offset(text, end.max(start));
    &text[begin..finish]
}

/// Byte offset of the character at index `char_idx`, or `text.len()` past the end.
pub fn byte_offset(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// First `max_chars` characters, with `...` appended when something was cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    if char_len(text) <= max_chars {
        return text.to_string();
    }
    format!("{}...", slice_chars(text, 0, max_chars))
}

/// First `max_chars` characters without an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    slice_chars(text, 0, max_chars).to_string()
}

/// Maps byte offsets of a fixed string to character offsets in O(1).
pub struct CharIndex {
    char_at_byte: Vec<usize>,
}

impl CharIndex {
    pub fn new(text: &str) -> Self {
        let mut char_at_byte = vec![0; text.len() + 1];
        let mut count = 0;
        for (byte, ch) in text.char_indices() {
            for slot in &mut char_at_byte[byte..byte + ch.len_utf8()] {
                *slot = count;
            }
            count += 1;
        }
        char_at_byte[text.len()] = count;
        Self { char_at_byte }
    }

    /// Character index of the char starting at (or containing) `byte`.
    pub fn char_of(&self, byte: usize) -> usize {
        self.char_at_byte[byte.min(self.char_at_byte.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_chars_cjk() {
        let text = "第1條 旅程延誤";
        assert_eq!(slice_chars(text, 0, 3), "第1條");
        assert_eq!(slice_chars(text, 4, 100), "旅程延誤");
        assert_eq!(slice_chars(text, 50, 60), "");
    }

    #[test]
    fn test_preview_adds_ellipsis_only_when_cut() {
        assert_eq!(preview("保險金額", 10), "保險金額");
        assert_eq!(preview("保險金額", 2), "保險...");
    }

    #[test]
    fn test_char_index() {
        let text = "a第b";
        let index = CharIndex::new(text);
        assert_eq!(index.char_of(0), 0);
        assert_eq!(index.char_of(1), 1);
        assert_eq!(index.char_of(4), 2);
        assert_eq!(index.char_of(text.len()), 3);
    }
}
