//! Token counting seam.
//!
//! The budget algorithm treats token counts as opaque integers; whatever
//! tokenizer the deployment uses sits behind [`TokenCounter`]. The bundled
//! [`CharHeuristic`] uses ~4 bytes per token, which is within ~10% for BPE
//! tokenizers on English text.

/// Counts and truncates text in tokens.
pub trait TokenCounter: Send + Sync {
    /// Token cost of `text`.
    fn count(&self, text: &str) -> u32;

    /// The longest prefix of `text` costing at most `max_tokens`.
    fn truncate(&self, text: &str, max_tokens: u32) -> String;
}

/// 1 token ≈ 4 bytes, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharHeuristic;

const BYTES_PER_TOKEN: usize = 4;

impl TokenCounter for CharHeuristic {
    fn count(&self, text: &str) -> u32 {
        text.len().div_ceil(BYTES_PER_TOKEN) as u32
    }

    fn truncate(&self, text: &str, max_tokens: u32) -> String {
        let limit = (max_tokens as usize).saturating_mul(BYTES_PER_TOKEN);
        if text.len() <= limit {
            return text.to_string();
        }
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(CharHeuristic.count(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(CharHeuristic.count("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(CharHeuristic.count("hello"), 2);
    }

    #[test]
    fn truncate_fits_budget() {
        let text = "a".repeat(100);
        let cut = CharHeuristic.truncate(&text, 10);
        assert_eq!(cut.len(), 40);
        assert!(CharHeuristic.count(&cut) <= 10);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // 'é' is two bytes; a 1-token (4 byte) cut must not split it.
        let text = "aaaé€€";
        let cut = CharHeuristic.truncate(text, 1);
        assert_eq!(cut, "aaa");
    }

    #[test]
    fn truncate_to_zero_is_empty() {
        assert_eq!(CharHeuristic.truncate("anything", 0), "");
    }
}
