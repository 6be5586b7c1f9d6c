// Token corpus: the ordered training sequence.
//
// Order is musical time order and is preserved everywhere downstream. A corpus
// comes from MIDI extraction (`midi::extract_corpus`), from a literal token
// list, or from the built-in fallback library below, which repeats a handful
// of C-major scale and triad patterns so the pipeline has something to learn
// when no MIDI data is available.

use serde::{Deserialize, Serialize};

/// Number of times the fallback library is repeated.
const FALLBACK_REPEATS: usize = 20;

/// Scale and arpeggio patterns used by the fallback corpus.
const FALLBACK_PATTERNS: [&[&str]; 6] = [
    // Ascending C major scale
    &["C4", "D4", "E4", "F4", "G4", "A4", "B4", "C5"],
    // Descending C major scale
    &["C5", "B4", "A4", "G4", "F4", "E4", "D4", "C4"],
    // C major arpeggio
    &["C4", "E4", "G4", "C5"],
    // G major arpeggio
    &["G4", "B4", "D5", "G5"],
    // F major arpeggio
    &["F4", "A4", "C5", "F5"],
    // A minor arpeggio
    &["A4", "C5", "E5", "A5"],
];

/// An ordered sequence of tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Corpus {
    tokens: Vec<String>,
}

impl Corpus {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Build a corpus from anything that yields string-like tokens.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// The deterministic demo corpus: six patterns, repeated 20 times.
    pub fn fallback() -> Self {
        let mut tokens = Vec::with_capacity(
            FALLBACK_REPEATS * FALLBACK_PATTERNS.iter().map(|p| p.len()).sum::<usize>(),
        );
        for _ in 0..FALLBACK_REPEATS {
            for pattern in FALLBACK_PATTERNS {
                tokens.extend(pattern.iter().map(|t| t.to_string()));
            }
        }
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of distinct tokens.
    pub fn distinct_count(&self) -> usize {
        let mut seen: Vec<&str> = self.tokens.iter().map(String::as_str).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    pub fn extend<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.extend(tokens.into_iter().map(Into::into));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_deterministic_and_sized() {
        let a = Corpus::fallback();
        let b = Corpus::fallback();
        assert_eq!(a, b);
        // (8 + 8 + 4 + 4 + 4 + 4) tokens per pass, 20 passes.
        assert_eq!(a.len(), 32 * 20);
        assert_eq!(&a.tokens()[..3], ["C4", "D4", "E4"]);
    }

    #[test]
    fn fallback_vocabulary_size() {
        // C4..C5 scale, plus D5, E5, F5, G5, A5 from the arpeggios.
        assert_eq!(Corpus::fallback().distinct_count(), 13);
    }

    #[test]
    fn serializes_as_plain_list() {
        let corpus = Corpus::from_tokens(["C4", "0.4.7"]);
        let json = serde_json::to_string(&corpus).unwrap();
        assert_eq!(json, r#"["C4","0.4.7"]"#);
    }
}
