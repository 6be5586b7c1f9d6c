// Lyrebird: next-token music model.
//
// Learns a statistical model over sequences of symbolic music tokens (single
// notes such as `C4`, chords such as `0.4.7`) and uses it to synthesize new
// token sequences autoregressively.
//
// Data flow: corpus -> vocabulary -> sliding windows -> trainer(predictor)
// -> trained predictor -> generator -> tokens -> MIDI.
//
// Architecture:
// - error.rs: `MusicError` taxonomy and `MusicResult`
// - token.rs: Note/chord token codec (names, pitch classes, normal order)
// - corpus.rs: Ordered token sequences and the built-in fallback patterns
// - vocab.rs: Sorted token <-> index vocabulary
// - window.rs: Sliding-window dataset with normalized inputs
// - predictor.rs: `SequencePredictor` contract, shapes, hyperparameters
// - optim.rs: Adam optimizer and gradient clipping
// - lstm.rs: Stacked LSTM predictor with dropout and softmax head
// - markov.rs: Transition-count predictor with backoff
// - trainer.rs: Epoch loop, progress observers, cooperative cancellation
// - generator.rs: Seed/sample/done generation state machine, decoding policies
// - persist.rs: Versioned JSON model bundles
// - config.rs: JSON configuration with defaults
// - midi.rs: Token <-> SMF conversion, MIDI folder extraction, demo files
// - session.rs: Single-owner pipeline state and the busy-guarded shared session
//
// Given a seed, training and generation are deterministic.

pub mod config;
pub mod corpus;
pub mod error;
pub mod generator;
pub mod lstm;
pub mod markov;
pub mod midi;
pub mod optim;
pub mod persist;
pub mod predictor;
pub mod session;
pub mod token;
pub mod trainer;
pub mod vocab;
pub mod window;

pub use error::{MusicError, MusicResult};
