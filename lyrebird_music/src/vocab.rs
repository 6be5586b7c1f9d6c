// Bidirectional token <-> index mapping.
//
// Indices are assigned by sorting the distinct tokens of a corpus in byte
// order, so the same corpus always yields the same vocabulary. The forward
// map is a `BTreeMap` (serializes in sorted order, matching the index order);
// the backward map is the sorted token list itself.

use std::collections::BTreeMap;

use crate::corpus::Corpus;
use crate::error::{MusicError, MusicResult};

/// Sorted set of distinct tokens with contiguous indices `0..len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    note_to_int: BTreeMap<String, usize>,
    int_to_note: Vec<String>,
}

impl Vocabulary {
    /// Build a vocabulary from a corpus.
    pub fn build(corpus: &Corpus) -> MusicResult<Self> {
        let mut tokens: Vec<String> = corpus.tokens().to_vec();
        tokens.sort_unstable();
        tokens.dedup();
        if tokens.is_empty() {
            return Err(MusicError::EmptyVocabulary);
        }
        let note_to_int = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Ok(Self {
            note_to_int,
            int_to_note: tokens,
        })
    }

    /// Rebuild a vocabulary from stored forward and backward maps.
    ///
    /// The maps must cover exactly `0..n_vocab` and be inverses of each other.
    pub fn from_maps(
        note_to_int: &BTreeMap<String, usize>,
        int_to_note: &BTreeMap<usize, String>,
        n_vocab: usize,
    ) -> MusicResult<Self> {
        if n_vocab == 0 {
            return Err(MusicError::EmptyVocabulary);
        }
        if note_to_int.len() != n_vocab || int_to_note.len() != n_vocab {
            return Err(MusicError::persistence(format!(
                "n_vocab is {n_vocab} but note_to_int has {} entries and int_to_note has {}",
                note_to_int.len(),
                int_to_note.len()
            )));
        }

        let mut backward = Vec::with_capacity(n_vocab);
        for (expected, (&index, token)) in int_to_note.iter().enumerate() {
            if index != expected {
                return Err(MusicError::persistence(format!(
                    "int_to_note is not contiguous: missing index {expected}"
                )));
            }
            if note_to_int.get(token) != Some(&index) {
                return Err(MusicError::persistence(format!(
                    "note_to_int and int_to_note disagree on token {token:?}"
                )));
            }
            backward.push(token.clone());
        }

        Ok(Self {
            note_to_int: note_to_int.clone(),
            int_to_note: backward,
        })
    }

    /// Number of distinct tokens (`n_vocab`).
    pub fn len(&self) -> usize {
        self.int_to_note.len()
    }

    pub fn is_empty(&self) -> bool {
        self.int_to_note.is_empty()
    }

    pub fn encode(&self, token: &str) -> Option<usize> {
        self.note_to_int.get(token).copied()
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.int_to_note.get(index).map(String::as_str)
    }

    /// Tokens in index order.
    pub fn tokens(&self) -> &[String] {
        &self.int_to_note
    }

    pub fn note_to_int(&self) -> &BTreeMap<String, usize> {
        &self.note_to_int
    }

    /// The backward map in the keyed form used by saved bundles.
    pub fn int_to_note(&self) -> BTreeMap<usize, String> {
        self.int_to_note.iter().cloned().enumerate().collect()
    }

    /// Encode every corpus token, failing on the first unknown one.
    pub fn encode_corpus(&self, corpus: &Corpus) -> MusicResult<Vec<usize>> {
        corpus
            .tokens()
            .iter()
            .map(|t| {
                self.encode(t)
                    .ok_or_else(|| MusicError::InvalidToken(t.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_unique_indices() {
        let corpus = Corpus::from_tokens(["C4", "E4", "G4", "C4"]);
        let vocab = Vocabulary::build(&corpus).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.tokens(), ["C4", "E4", "G4"]);
        assert_eq!(vocab.encode("C4"), Some(0));
        assert_eq!(vocab.encode("E4"), Some(1));
        assert_eq!(vocab.encode("G4"), Some(2));
        assert_eq!(vocab.encode("A4"), None);
        assert_eq!(vocab.decode(3), None);
    }

    #[test]
    fn byte_order_puts_chords_before_notes() {
        let corpus = Corpus::from_tokens(["C4", "0.4.7", "B3", "11.2.5"]);
        let vocab = Vocabulary::build(&corpus).unwrap();
        assert_eq!(vocab.tokens(), ["0.4.7", "11.2.5", "B3", "C4"]);
    }

    #[test]
    fn encode_decode_roundtrip_over_corpus() {
        let corpus = Corpus::fallback();
        let vocab = Vocabulary::build(&corpus).unwrap();
        for token in corpus.tokens() {
            let index = vocab.encode(token).unwrap();
            assert_eq!(vocab.decode(index), Some(token.as_str()));
        }
    }

    #[test]
    fn empty_corpus_is_rejected() {
        assert!(matches!(
            Vocabulary::build(&Corpus::default()),
            Err(MusicError::EmptyVocabulary)
        ));
    }

    #[test]
    fn from_maps_roundtrip() {
        let vocab = Vocabulary::build(&Corpus::fallback()).unwrap();
        let rebuilt =
            Vocabulary::from_maps(vocab.note_to_int(), &vocab.int_to_note(), vocab.len()).unwrap();
        assert_eq!(rebuilt, vocab);
    }

    #[test]
    fn from_maps_rejects_disagreement() {
        let vocab = Vocabulary::build(&Corpus::from_tokens(["A4", "B4"])).unwrap();
        let mut backward = vocab.int_to_note();
        backward.insert(0, "B4".into());
        backward.insert(1, "A4".into());
        let err = Vocabulary::from_maps(vocab.note_to_int(), &backward, 2).unwrap_err();
        assert!(matches!(err, MusicError::Persistence { .. }));

        let err = Vocabulary::from_maps(vocab.note_to_int(), &vocab.int_to_note(), 3).unwrap_err();
        assert!(err.to_string().contains("n_vocab"));
    }
}
