// The sequence predictor contract.
//
// The pipeline only needs something that can be sized for a vocabulary and a
// window length, trained on a `Dataset`, and asked for a probability
// distribution over the next token. `SequencePredictor` captures that; the
// trainer, generator, session and persistence layers are all generic over it.
//
// Implementations in this crate:
// - `lstm::LstmPredictor`: stacked LSTM with dropout and a softmax head.
// - `markov::MarkovPredictor`: transition counts with backoff; cheap, used by
//   tests and as a quick CLI option.
//
// Inputs to `predict` are normalized windows (indices divided by the
// vocabulary size). Outputs are non-negative and sum to 1, indexed in
// vocabulary order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MusicError, MusicResult};
use crate::window::Dataset;

/// Hyperparameters shared by predictor implementations. Each implementation
/// reads the fields it understands and ignores the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Cells per recurrent layer.
    pub hidden_units: usize,
    /// Number of stacked recurrent layers.
    pub num_layers: usize,
    /// Dropout rate applied after each recurrent layer during training.
    pub dropout: f32,
    /// Optimizer step size.
    pub learning_rate: f32,
    /// Seed for weight initialization, dropout and shuffling.
    pub seed: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            hidden_units: 256,
            num_layers: 3,
            dropout: 0.3,
            learning_rate: 0.001,
            seed: 42,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> MusicResult<()> {
        if self.hidden_units == 0 {
            return Err(MusicError::invalid_config("hidden_units must be positive"));
        }
        if self.num_layers == 0 {
            return Err(MusicError::invalid_config("num_layers must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(MusicError::invalid_config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MusicError::invalid_config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Output width and input length a predictor was initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorShape {
    pub vocab_size: usize,
    pub window_len: usize,
}

impl PredictorShape {
    /// Reject a dataset built for a different vocabulary or window length.
    pub fn check_dataset(&self, dataset: &Dataset) -> MusicResult<()> {
        dataset.check_trainable()?;
        if dataset.window_len() != self.window_len {
            return Err(MusicError::WindowLengthMismatch {
                expected: self.window_len,
                actual: dataset.window_len(),
            });
        }
        if dataset.n_vocab() != self.vocab_size {
            return Err(MusicError::invalid_config(format!(
                "dataset vocabulary has {} tokens but the predictor was sized for {}",
                dataset.n_vocab(),
                self.vocab_size
            )));
        }
        Ok(())
    }

    pub fn check_window(&self, window: &[f32]) -> MusicResult<()> {
        if window.len() != self.window_len {
            return Err(MusicError::WindowLengthMismatch {
                expected: self.window_len,
                actual: window.len(),
            });
        }
        Ok(())
    }
}

/// A trainable next-token model.
pub trait SequencePredictor: Send + Sized {
    /// Serializable parameter set, stored inside saved bundles.
    type Params: Serialize + DeserializeOwned + Send;

    /// Short name for logs and CLI output.
    const NAME: &'static str;

    /// Create an uninitialized predictor.
    fn new(config: &PredictorConfig) -> Self;

    /// Size the predictor for `vocab_size` classes and `window_len` inputs,
    /// discarding anything learned before.
    fn initialize(&mut self, vocab_size: usize, window_len: usize) -> MusicResult<()>;

    /// `None` until `initialize` (or `from_params`) has run.
    fn shape(&self) -> Option<PredictorShape>;

    fn is_initialized(&self) -> bool {
        self.shape().is_some()
    }

    /// One pass over the dataset in mini-batches. Returns the mean loss.
    fn fit_epoch(&mut self, dataset: &Dataset, batch_size: usize) -> MusicResult<f32>;

    /// Run `epochs` passes, returning the loss of each.
    fn fit(
        &mut self,
        dataset: &Dataset,
        epochs: usize,
        batch_size: usize,
    ) -> MusicResult<Vec<f32>> {
        (0..epochs)
            .map(|_| self.fit_epoch(dataset, batch_size))
            .collect()
    }

    /// Distribution over the vocabulary for one normalized window.
    fn predict(&self, window: &[f32]) -> MusicResult<Vec<f32>>;

    fn export_params(&self) -> MusicResult<Self::Params>;

    /// Rebuild a ready-to-use predictor from exported parameters.
    fn from_params(config: &PredictorConfig, params: Self::Params) -> MusicResult<Self>;
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_is_a_distribution() {
        let p = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p.iter().all(|&x| x >= 0.0));
        assert!(p[3] > 0.99);
    }

    #[test]
    fn default_config_matches_reference_architecture() {
        let config = PredictorConfig::default();
        assert_eq!(config.hidden_units, 256);
        assert_eq!(config.num_layers, 3);
        assert!((config.dropout - 0.3).abs() < f32::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            PredictorConfig {
                hidden_units: 0,
                ..Default::default()
            },
            PredictorConfig {
                num_layers: 0,
                ..Default::default()
            },
            PredictorConfig {
                dropout: 1.0,
                ..Default::default()
            },
            PredictorConfig {
                learning_rate: 0.0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(MusicError::InvalidConfig(_))));
        }
    }

    #[test]
    fn shape_rejects_wrong_window() {
        let shape = PredictorShape { vocab_size: 4, window_len: 3 };
        shape.check_window(&[0.0, 0.25, 0.5]).unwrap();
        assert!(matches!(
            shape.check_window(&[0.0]),
            Err(MusicError::WindowLengthMismatch { expected: 3, actual: 1 })
        ));
    }
}
