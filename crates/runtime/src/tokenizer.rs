use halo_common::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

pub type TokenId = u32;

/// End-of-sequence token of tensor-graph vocabularies
pub const EOS_TOKEN: &str = "<|end|>";

/// Closed-vocabulary tokenizer for tensor-graph models.
///
/// Segmentation is greedy longest-match over the vocabulary keys. Characters
/// that start no known token are skipped, and unknown ids are dropped on
/// decode, so `decode(encode(s))` is best-effort rather than exact.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: HashMap<String, TokenId>,
    reverse: HashMap<TokenId, String>,
    /// Longest key, in chars; bounds the candidate scan
    max_token_chars: usize,
    eos_token_id: Option<TokenId>,
}

impl Tokenizer {
    /// Load a `{"token": id}` JSON vocabulary
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::VocabLoad(format!("Cannot read vocabulary {}: {}", path.display(), e))
        })?;
        let vocab: HashMap<String, TokenId> = serde_json::from_str(&content).map_err(|e| {
            Error::VocabLoad(format!("Cannot parse vocabulary {}: {}", path.display(), e))
        })?;

        let tokenizer = Self::from_vocab(vocab)?;
        tracing::debug!(
            path = %path.display(),
            size = tokenizer.vocab_size(),
            "Loaded vocabulary"
        );
        Ok(tokenizer)
    }

    /// Build from an in-memory vocabulary; ids must be unique
    pub fn from_vocab(vocab: HashMap<String, TokenId>) -> Result<Self> {
        let mut reverse = HashMap::with_capacity(vocab.len());
        for (token, &id) in &vocab {
            if let Some(existing) = reverse.insert(id, token.clone()) {
                return Err(Error::Configuration(format!(
                    "Vocabulary id {} is used by both {:?} and {:?}",
                    id, existing, token
                )));
            }
        }

        let max_token_chars = vocab.keys().map(|k| k.chars().count()).max().unwrap_or(0);
        let eos_token_id = vocab.get(EOS_TOKEN).copied();

        Ok(Self {
            vocab,
            reverse,
            max_token_chars,
            eos_token_id,
        })
    }

    pub fn eos_token_id(&self) -> Option<TokenId> {
        self.eos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        let mut rest = text;

        while let Some(first) = rest.chars().next() {
            let mut best: Option<(usize, TokenId)> = None;

            for (taken, (start, ch)) in rest.char_indices().enumerate() {
                if taken >= self.max_token_chars {
                    break;
                }
                let end = start + ch.len_utf8();
                match self.vocab.get(&rest[..end]) {
                    Some(&id) => best = Some((end, id)),
                    // The match cannot be extended any further
                    None if best.is_some() => break,
                    None => {}
                }
            }

            match best {
                Some((end, id)) => {
                    tokens.push(id);
                    rest = &rest[end..];
                }
                None => rest = &rest[first.len_utf8()..],
            }
        }

        tokens
    }

    pub fn decode(&self, ids: &[TokenId]) -> String {
        ids.iter()
            .filter_map(|id| self.reverse.get(id))
            .map(String::as_str)
            .collect()
    }
}
