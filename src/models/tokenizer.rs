//! Vocabulary-driven tokenizer producing CLIP-style token ids.
//!
//! Words are lower-cased and split on whitespace and punctuation, then
//! broken into the longest vocabulary pieces left to right. The final piece
//! of a word carries the `</w>` end-of-word marker, matching CLIP's
//! `vocab.json` convention.

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use std::collections::HashMap;
use std::path::Path;

/// CLIP text context length
pub const CONTEXT_LENGTH: usize = 77;

const START_TOKEN: &str = "<|startoftext|>";
const END_TOKEN: &str = "<|endoftext|>";
const END_OF_WORD: &str = "</w>";

pub struct ClipTokenizer {
    vocab: HashMap<String, i64>,
    start_id: i64,
    end_id: i64,
    unknown_id: i64,
}

impl ClipTokenizer {
    /// Load a `vocab.json` mapping token -> id
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary: {}", path.display()))?;
        let vocab: HashMap<String, i64> =
            serde_json::from_str(&raw).context("Failed to parse vocabulary JSON")?;
        Self::from_vocab(vocab)
    }

    pub fn from_vocab(vocab: HashMap<String, i64>) -> Result<Self> {
        let Some(&start_id) = vocab.get(START_TOKEN) else {
            bail!("vocabulary has no {START_TOKEN} entry");
        };
        let Some(&end_id) = vocab.get(END_TOKEN) else {
            bail!("vocabulary has no {END_TOKEN} entry");
        };
        // CLIP has no dedicated unknown token; the end token stands in.
        Ok(Self {
            vocab,
            start_id,
            end_id,
            unknown_id: end_id,
        })
    }

    /// Token ids without start/end markers
    pub fn tokenize(&self, text: &str) -> Vec<i64> {
        let lowered = text.to_lowercase();
        let mut ids = Vec::new();
        for word in split_words(&lowered) {
            self.encode_word(word, &mut ids);
        }
        ids
    }

    /// `[1, 77]` ids: start, tokens (truncated), end, zero padding
    pub fn encode(&self, text: &str) -> Array2<i64> {
        let mut ids = Vec::with_capacity(CONTEXT_LENGTH);
        ids.push(self.start_id);
        let body = self.tokenize(text);
        ids.extend(body.into_iter().take(CONTEXT_LENGTH - 2));
        ids.push(self.end_id);
        ids.resize(CONTEXT_LENGTH, 0);
        Array2::from_shape_vec((1, CONTEXT_LENGTH), ids)
            .unwrap_or_else(|_| Array2::zeros((1, CONTEXT_LENGTH)))
    }

    fn encode_word(&self, word: &str, out: &mut Vec<i64>) {
        let chars: Vec<char> = word.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let mut matched = None;
            for end in (start + 1..=chars.len()).rev() {
                let piece: String = chars[start..end].iter().collect();
                let key = if end == chars.len() {
                    format!("{piece}{END_OF_WORD}")
                } else {
                    piece
                };
                if let Some(&id) = self.vocab.get(&key) {
                    matched = Some((id, end));
                    break;
                }
            }
            match matched {
                Some((id, end)) => {
                    out.push(id);
                    start = end;
                }
                None => {
                    out.push(self.unknown_id);
                    start += 1;
                }
            }
        }
    }
}

fn split_words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || (c.is_ascii_punctuation() && c != '\''))
        .filter(|w| !w.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> ClipTokenizer {
        let vocab: HashMap<String, i64> = [
            ("<|startoftext|>", 49406),
            ("<|endoftext|>", 49407),
            ("a</w>", 320),
            ("photo</w>", 1125),
            ("of</w>", 539),
            ("apple</w>", 3055),
            ("ban", 2190),
            ("ana</w>", 8659),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        ClipTokenizer::from_vocab(vocab).unwrap()
    }

    #[test]
    fn test_tokenize_whole_words() {
        assert_eq!(
            tokenizer().tokenize("A photo of apple"),
            vec![320, 1125, 539, 3055]
        );
    }

    #[test]
    fn test_tokenize_subwords() {
        assert_eq!(tokenizer().tokenize("banana."), vec![2190, 8659]);
    }

    #[test]
    fn test_encode_pads_to_context() {
        let ids = tokenizer().encode("apple");
        assert_eq!(ids.shape(), &[1, CONTEXT_LENGTH]);
        assert_eq!(ids[[0, 0]], 49406);
        assert_eq!(ids[[0, 1]], 3055);
        assert_eq!(ids[[0, 2]], 49407);
        assert_eq!(ids[[0, 3]], 0);
    }

    #[test]
    fn test_missing_special_tokens_rejected() {
        let vocab = HashMap::from([("a</w>".to_string(), 320)]);
        assert!(ClipTokenizer::from_vocab(vocab).is_err());
    }
}
