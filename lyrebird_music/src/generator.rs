// Autoregressive generation.
//
// A `Generation` is a small state machine: `Seeded -> Sampling(k) -> Done`.
//
// - Seeding copies the raw (un-normalized) indices of one training window
//   into the working buffer. The window is chosen uniformly from
//   `[0, len - 1)`, i.e. the last window is never a seed unless it is the
//   only one. This is the only random step under greedy decoding.
// - Each sampling step divides every buffer entry by `n_vocab`, asks the
//   predictor for a distribution, picks an index with the decoding policy,
//   emits the decoded token, then pushes `index / n_vocab` onto the buffer and
//   drops the oldest entry so the buffer stays `window_len` long.
// - After `length` steps the state is `Done` and the tokens are returned in
//   the order they were produced.
//
// Entries pushed during generation are therefore scaled by `1 / n_vocab`
// twice by the time the predictor sees them, while seed entries are scaled
// once. That is the buffer protocol the saved models were trained against;
// keep it unless retraining every model.
//
// Decoding policies live in `DecodingPolicy`, separate from the buffer
// mechanics, so greedy decoding stays exactly reproducible and stochastic
// policies can be tested on their own.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use lyrebird_prng::MusicRng;

use crate::error::{MusicError, MusicResult};
use crate::predictor::{SequencePredictor, softmax};
use crate::trainer::CancelToken;
use crate::vocab::Vocabulary;
use crate::window::Dataset;

// ---------------------------------------------------------------------------
// Decoding policy
// ---------------------------------------------------------------------------

/// How to turn a predicted distribution into one index.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodingPolicy {
    /// Highest probability; ties go to the lowest index.
    #[default]
    Greedy,
    /// Sample from the distribution sharpened (`t < 1`) or flattened
    /// (`t > 1`) by temperature.
    Temperature { temperature: f32 },
    /// Sample among the `k` most likely indices after temperature scaling.
    TopK { k: usize, temperature: f32 },
}

impl DecodingPolicy {
    pub fn validate(&self) -> MusicResult<()> {
        let check_t = |t: f32| {
            if t.is_finite() && t > 0.0 {
                Ok(())
            } else {
                Err(MusicError::invalid_config(format!(
                    "temperature must be positive, got {t}"
                )))
            }
        };
        match *self {
            DecodingPolicy::Greedy => Ok(()),
            DecodingPolicy::Temperature { temperature } => check_t(temperature),
            DecodingPolicy::TopK { k, temperature } => {
                if k == 0 {
                    return Err(MusicError::invalid_config("top-k needs k >= 1"));
                }
                check_t(temperature)
            }
        }
    }

    /// Choose an index from `probs`. Only the stochastic policies draw from
    /// `rng`.
    pub fn select(&self, probs: &[f32], rng: &mut MusicRng) -> usize {
        match *self {
            DecodingPolicy::Greedy => argmax(probs),
            DecodingPolicy::Temperature { temperature } => {
                let scaled = apply_temperature(probs, temperature);
                rng.choose_weighted(&scaled).unwrap_or_else(|| argmax(probs))
            }
            DecodingPolicy::TopK { k, temperature } => {
                let mut ranked: Vec<usize> = (0..probs.len()).collect();
                ranked.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
                ranked.truncate(k.max(1));
                let kept: Vec<f32> = ranked.iter().map(|&i| probs[i]).collect();
                let scaled = apply_temperature(&kept, temperature);
                rng.choose_weighted(&scaled)
                    .map(|j| ranked[j])
                    .unwrap_or_else(|| argmax(probs))
            }
        }
    }
}

/// Index of the first maximum.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Re-weight a distribution by `p^(1/t)`, renormalized.
fn apply_temperature(probs: &[f32], temperature: f32) -> Vec<f32> {
    let logits: Vec<f32> = probs
        .iter()
        .map(|&p| p.max(1e-12).ln() / temperature)
        .collect();
    softmax(&logits)
}

// ---------------------------------------------------------------------------
// Generation state machine
// ---------------------------------------------------------------------------

/// Where a `Generation` is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Seeded,
    /// `k` tokens produced so far.
    Sampling(usize),
    Done,
}

/// One in-progress generation run.
pub struct Generation<'a, P: SequencePredictor> {
    predictor: &'a P,
    vocab: &'a Vocabulary,
    policy: DecodingPolicy,
    rng: &'a mut MusicRng,
    buffer: VecDeque<f32>,
    length: usize,
    output: Vec<String>,
    state: GenerationState,
}

impl<'a, P: SequencePredictor> Generation<'a, P> {
    /// Seed from a random window of `dataset`.
    pub fn seed_random(
        predictor: &'a P,
        vocab: &'a Vocabulary,
        dataset: &Dataset,
        length: usize,
        policy: DecodingPolicy,
        rng: &'a mut MusicRng,
    ) -> MusicResult<Self> {
        if dataset.is_empty() {
            return Err(MusicError::EmptyDataset);
        }
        let upper = (dataset.len() - 1).max(1);
        let seed_index = rng.range_usize(0, upper);
        Self::seed_at(predictor, vocab, dataset, seed_index, length, policy, rng)
    }

    /// Seed from window `seed_index` of `dataset`.
    pub fn seed_at(
        predictor: &'a P,
        vocab: &'a Vocabulary,
        dataset: &Dataset,
        seed_index: usize,
        length: usize,
        policy: DecodingPolicy,
        rng: &'a mut MusicRng,
    ) -> MusicResult<Self> {
        let shape = predictor.shape().ok_or(MusicError::ModelNotReady)?;
        if dataset.is_empty() {
            return Err(MusicError::EmptyDataset);
        }
        if seed_index >= dataset.len() {
            return Err(MusicError::invalid_config(format!(
                "seed window {seed_index} out of range for {} windows",
                dataset.len()
            )));
        }
        if length == 0 {
            return Err(MusicError::invalid_config("generation length must be positive"));
        }
        policy.validate()?;
        if dataset.window_len() != shape.window_len {
            return Err(MusicError::WindowLengthMismatch {
                expected: shape.window_len,
                actual: dataset.window_len(),
            });
        }
        if vocab.len() != shape.vocab_size {
            return Err(MusicError::invalid_config(format!(
                "vocabulary has {} tokens but the predictor was trained on {}",
                vocab.len(),
                shape.vocab_size
            )));
        }

        let buffer = dataset.window(seed_index).iter().map(|&i| i as f32).collect();
        Ok(Self {
            predictor,
            vocab,
            policy,
            rng,
            buffer,
            length,
            output: Vec::with_capacity(length),
            state: GenerationState::Seeded,
        })
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Tokens produced so far.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Produce one token. Returns `None` once the run is done.
    pub fn step(&mut self) -> MusicResult<Option<&str>> {
        if self.state == GenerationState::Done {
            return Ok(None);
        }

        let n = self.vocab.len() as f32;
        let input: Vec<f32> = self.buffer.iter().map(|&v| v / n).collect();
        let probs = self.predictor.predict(&input)?;
        let index = self.policy.select(&probs, self.rng);
        let token = self
            .vocab
            .decode(index)
            .ok_or_else(|| {
                MusicError::invalid_config(format!(
                    "predictor returned index {index} outside a vocabulary of {}",
                    self.vocab.len()
                ))
            })?
            .to_string();

        self.buffer.push_back(index as f32 / n);
        self.buffer.pop_front();
        self.output.push(token);

        let produced = self.output.len();
        self.state = if produced >= self.length {
            GenerationState::Done
        } else {
            GenerationState::Sampling(produced)
        };
        Ok(self.output.last().map(String::as_str))
    }

    /// Step until done, checking `cancel` between steps.
    pub fn run(mut self, cancel: Option<&CancelToken>) -> MusicResult<Vec<String>> {
        while self.state != GenerationState::Done {
            if let Some(token) = cancel {
                token.check()?;
            }
            self.step()?;
        }
        Ok(self.output)
    }
}
