// Error taxonomy for the whole pipeline.
//
// Every fallible operation in the crate returns `MusicResult<T>`. Variants
// carry enough context (actual vs. required lengths, the offending token, the
// bundle field that failed validation) for a front-end to show the message
// as-is.

/// Errors raised by the vocabulary, windowing, predictor, generation,
/// persistence and MIDI layers.
#[derive(Debug, thiserror::Error)]
pub enum MusicError {
    /// The corpus produced no distinct tokens.
    #[error("vocabulary is empty: the corpus contains no tokens")]
    EmptyVocabulary,

    /// The corpus is not longer than the window length.
    #[error(
        "not enough tokens ({actual}) for window length {required}; \
         reduce the window length or add more MIDI data"
    )]
    InsufficientData { actual: usize, required: usize },

    /// No training windows exist.
    #[error("dataset is empty: no training windows were produced")]
    EmptyDataset,

    /// Training windows exist but carry no labels.
    #[error("dataset has no labels")]
    EmptyLabels,

    /// `fit` or `predict` was called on a predictor that was never sized.
    #[error("predictor is not initialized; call initialize() first")]
    ModelNotInitialized,

    /// Generation was requested before a predictor was trained or loaded.
    #[error("no trained model; train or load a model first")]
    ModelNotReady,

    /// A window does not match the length the predictor was built for.
    #[error("window length mismatch: predictor expects {expected}, got {actual}")]
    WindowLengthMismatch { expected: usize, actual: usize },

    /// A saved bundle is missing, corrupt, or internally inconsistent.
    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    /// A configuration value or request parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A token string is neither a note name nor a chord.
    #[error("invalid token {0:?}")]
    InvalidToken(String),

    /// A MIDI file could not be read or written.
    #[error("MIDI error: {0}")]
    Midi(String),

    /// Another long-running operation holds the session.
    #[error("session is busy with another operation")]
    Busy,

    /// A cooperative cancellation request stopped the operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type MusicResult<T> = Result<T, MusicError>;

impl MusicError {
    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
