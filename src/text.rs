//! Character vocabulary built from the `symbol` configuration block.

use crate::config::SymbolConfig;
use crate::error::TrainError;
use std::collections::HashMap;

/// Maps phoneme characters to token ids.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    index: HashMap<char, i64>,
}

impl Vocabulary {
    /// Build the vocabulary from the five symbol groups.
    ///
    /// Characters are indexed by their position in
    /// `pad + punctuation + letters + letters_ipa + extend`; a character that
    /// appears twice keeps its last position.
    pub fn from_config(symbol: &SymbolConfig) -> anyhow::Result<Self> {
        let groups = [
            ("symbol.pad", &symbol.pad),
            ("symbol.punctuation", &symbol.punctuation),
            ("symbol.letters", &symbol.letters),
            ("symbol.letters_ipa", &symbol.letters_ipa),
            ("symbol.extend", &symbol.extend),
        ];
        let mut index = HashMap::new();
        let mut position = 0i64;
        for (field, group) in groups {
            let group = group.as_ref().ok_or_else(|| TrainError::missing(field))?;
            for ch in group.chars() {
                index.insert(ch, position);
                position += 1;
            }
        }
        Ok(Self { index })
    }

    /// Number of embedding rows, one more than the distinct symbols.
    pub fn n_token(&self) -> usize {
        self.index.len() + 1
    }

    /// Token id for a single character.
    pub fn get(&self, ch: char) -> Option<i64> {
        self.index.get(&ch).copied()
    }

    /// Encode a phoneme string, framed by pad tokens.
    ///
    /// Characters outside the vocabulary are dropped.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let mut tokens = Vec::with_capacity(text.chars().count() + 2);
        tokens.push(0);
        for ch in text.chars() {
            match self.get(ch) {
                Some(id) => tokens.push(id),
                None => tracing::debug!(character = %ch, "dropping unknown symbol"),
            }
        }
        tokens.push(0);
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> SymbolConfig {
        SymbolConfig {
            pad: Some("$".to_string()),
            punctuation: Some(";:,.".to_string()),
            letters: Some("abc".to_string()),
            letters_ipa: Some("əa".to_string()),
            extend: Some(String::new()),
        }
    }

    #[test]
    fn duplicate_symbols_keep_last_index() {
        let vocab = Vocabulary::from_config(&symbols()).expect("vocab");
        // "a" appears in letters (5) and again in letters_ipa (9).
        assert_eq!(vocab.get('a'), Some(9));
        assert_eq!(vocab.get('$'), Some(0));
        // 10 characters, 9 distinct, plus the reserved id.
        assert_eq!(vocab.n_token(), 10);
    }

    #[test]
    fn encode_frames_with_pad_and_skips_unknown() {
        let vocab = Vocabulary::from_config(&symbols()).expect("vocab");
        assert_eq!(vocab.encode("ab?c"), vec![0, 9, 6, 7, 0]);
        assert_eq!(vocab.encode(""), vec![0, 0]);
    }

    #[test]
    fn missing_group_names_the_key() {
        let mut config = symbols();
        config.letters_ipa = None;
        let err = Vocabulary::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("symbol.letters_ipa"));
    }
}
