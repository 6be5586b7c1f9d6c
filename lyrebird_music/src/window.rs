// Sliding-window training set.
//
// A window of `L` consecutive corpus indices is paired with the index of the
// token that follows it. Windows slide with stride 1, so a corpus of `M`
// tokens yields `M - L` pairs, in corpus order.
//
// The dataset stores raw vocabulary indices. Predictors consume the
// normalized form (each index divided by `n_vocab`, so every entry lies in
// [0, 1)) and one-hot labels; both are derived on demand rather than stored
// a second time.

use crate::corpus::Corpus;
use crate::error::{MusicError, MusicResult};
use crate::vocab::Vocabulary;

/// Ordered `(window, label)` pairs over a corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    windows: Vec<Vec<usize>>,
    labels: Vec<usize>,
    n_vocab: usize,
    window_len: usize,
}

impl Dataset {
    /// Slide a window of `window_len` tokens across the corpus.
    pub fn build(corpus: &Corpus, vocab: &Vocabulary, window_len: usize) -> MusicResult<Self> {
        if window_len == 0 {
            return Err(MusicError::invalid_config("window length must be positive"));
        }
        if corpus.len() <= window_len {
            return Err(MusicError::InsufficientData {
                actual: corpus.len(),
                required: window_len,
            });
        }

        let encoded = vocab.encode_corpus(corpus)?;
        let pairs = encoded.len() - window_len;
        let mut windows = Vec::with_capacity(pairs);
        let mut labels = Vec::with_capacity(pairs);
        for i in 0..pairs {
            windows.push(encoded[i..i + window_len].to_vec());
            labels.push(encoded[i + window_len]);
        }

        if windows.is_empty() {
            return Err(MusicError::EmptyDataset);
        }

        Ok(Self {
            windows,
            labels,
            n_vocab: vocab.len(),
            window_len,
        })
    }

    /// Number of training pairs.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Raw vocabulary indices of window `i`.
    pub fn window(&self, i: usize) -> &[usize] {
        &self.windows[i]
    }

    /// Label index of pair `i`.
    pub fn label(&self, i: usize) -> usize {
        self.labels[i]
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Window `i` divided by `n_vocab`.
    pub fn normalized_window(&self, i: usize) -> Vec<f32> {
        normalize(&self.windows[i], self.n_vocab)
    }

    /// Label `i` as a one-hot vector of width `n_vocab`.
    pub fn one_hot_label(&self, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; self.n_vocab];
        v[self.labels[i]] = 1.0;
        v
    }

    /// Check the invariants a trainer relies on.
    pub fn check_trainable(&self) -> MusicResult<()> {
        if self.windows.is_empty() {
            return Err(MusicError::EmptyDataset);
        }
        if self.labels.is_empty() {
            return Err(MusicError::EmptyLabels);
        }
        Ok(())
    }
}

/// Divide each index by `n_vocab`.
pub fn normalize(indices: &[usize], n_vocab: usize) -> Vec<f32> {
    let n = n_vocab as f32;
    indices.iter().map(|&i| i as f32 / n).collect()
}
