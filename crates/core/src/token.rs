//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token.
//! Close enough to BPE tokenizers on chat text to enforce a context budget.

/// Fixed per-message cost for role names and wire delimiters.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Flat cost charged for any image component, whatever its resolution.
pub const IMAGE_TOKENS: usize = 250;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 bytes. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn hundred_chars() {
        let text = "a".repeat(100);
        assert_eq!(estimate_tokens(&text), 25);
    }
}
