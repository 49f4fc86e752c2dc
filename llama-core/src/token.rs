/// A vocabulary entry identifier.
pub type TokenId = llama_sys::TokenId;

/// A position within a context's sequence.
pub type Pos = llama_sys::Pos;

/// A sequence identifier in the native KV cache. The core hard-codes this to
/// `1` for every context (see [`SEQ_ID`]).
pub type SeqId = llama_sys::SeqId;

/// The sequence id used for every batch and KV-cache operation.
///
/// The native library this wraps never assigns meaning to sequence id `0`
/// beyond "first slot"; using `1` throughout avoids relying on that
/// coincidence. There is exactly one sequence per context in this design, so
/// the value is otherwise arbitrary — it is fixed rather than configurable so
/// that KV-pruning on edit and batch population never have to agree on it
/// out of band.
pub const SEQ_ID: SeqId = 1;

/// The native glyph used to render a leading space in sub-word tokens.
const SPACE_GLYPH: char = '\u{2581}';

/// A decoded token: its vocabulary id and UTF-8 text rendering.
///
/// Cheap to copy, not reference-counted — every consumer that needs a token's
/// text gets its own owned `String`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: TokenId,
    pub text: String,
}

impl Token {
    pub fn new(id: TokenId, raw_text: &str) -> Self {
        Self {
            id,
            text: normalize_piece(raw_text),
        }
    }
}

/// Rewrites the native space-substitution glyph to an ASCII space. No other
/// normalization is performed.
pub fn normalize_piece(raw: &str) -> String {
    raw.replace(SPACE_GLYPH, " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_space_glyph() {
        assert_eq!(normalize_piece("\u{2581}hello"), " hello");
    }

    #[test]
    fn leaves_plain_text_untouched() {
        assert_eq!(normalize_piece("hello"), "hello");
    }

    #[test]
    fn token_new_normalizes_text() {
        let t = Token::new(42, "\u{2581}world");
        assert_eq!(t.id, 42);
        assert_eq!(t.text, " world");
    }
}
