// Data-driven pipeline configuration.
//
// `Config` groups every tunable of the pipeline: model hyperparameters,
// training schedule, generation settings and file locations. It is loaded
// from JSON; any field left out of the file takes its default, and a missing
// file means "all defaults". CLI flags override individual fields after
// loading (see `main.rs`).
//
// Defaults: window length 100, 256 LSTM units, 3 layers, dropout 0.3,
// learning rate 0.001, 20 epochs, batch size 64, 100 generated tokens.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MusicError, MusicResult};
use crate::generator::DecodingPolicy;
use crate::predictor::PredictorConfig;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Network shape and optimizer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Window length `L`: how many tokens the predictor sees.
    pub sequence_length: usize,
    pub lstm_units: usize,
    pub num_layers: usize,
    pub dropout: f32,
    pub learning_rate: f32,
    /// Seed for weight init, dropout masks and shuffling.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sequence_length: 100,
            lstm_units: 256,
            num_layers: 3,
            dropout: 0.3,
            learning_rate: 0.001,
            seed: 42,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Tokens to produce per request.
    pub length: usize,
    pub decoding: DecodingPolicy,
    /// Seed for seed-window choice and sampling. `None` draws one from the
    /// clock.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            length: 100,
            decoding: DecodingPolicy::Greedy,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Folder scanned for `.mid` files.
    pub midi_folder: PathBuf,
    pub bundle_path: PathBuf,
    pub output_midi: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            midi_folder: PathBuf::from("output"),
            bundle_path: PathBuf::from("models/music_model.json"),
            output_midi: PathBuf::from("output/ai_generated_music.mid"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub generation: GenerationConfig,
    pub paths: PathsConfig,
}

impl Config {
    /// Load from a JSON file. A missing file yields the defaults; a present
    /// but unreadable or malformed file is an error.
    pub fn load(path: &Path) -> MusicResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MusicResult<()> {
        if self.model.sequence_length == 0 {
            return Err(MusicError::invalid_config("sequence_length must be positive"));
        }
        if self.training.epochs == 0 {
            return Err(MusicError::invalid_config("epochs must be positive"));
        }
        if self.training.batch_size == 0 {
            return Err(MusicError::invalid_config("batch_size must be positive"));
        }
        if self.generation.length == 0 {
            return Err(MusicError::invalid_config("generation length must be positive"));
        }
        self.generation.decoding.validate()?;
        self.predictor_config().validate()
    }

    /// Hyperparameters in the form predictors take.
    pub fn predictor_config(&self) -> PredictorConfig {
        PredictorConfig {
            hidden_units: self.model.lstm_units,
            num_layers: self.model.num_layers,
            dropout: self.model.dropout,
            learning_rate: self.model.learning_rate,
            seed: self.model.seed,
        }
    }
}
