// Training driver.
//
// `Trainer` runs a predictor over a dataset for a fixed number of epochs,
// one `fit_epoch` call at a time, so it can report loss after every pass and
// honour a cancellation request between passes. Loss goes to a
// `TrainingObserver` (the session forwards it over a channel to whoever
// started the job) and to the `tracing` log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{MusicError, MusicResult};
use crate::predictor::SequencePredictor;
use crate::window::Dataset;

/// Cooperative cancellation flag shared between a controller and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once `cancel` has been called.
    pub fn check(&self) -> MusicResult<()> {
        if self.is_cancelled() {
            Err(MusicError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives per-epoch progress from a `Trainer`.
pub trait TrainingObserver {
    fn on_epoch(&mut self, epoch: usize, epochs: usize, loss: f32);
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl TrainingObserver for NoopObserver {
    fn on_epoch(&mut self, _epoch: usize, _epochs: usize, _loss: f32) {}
}

impl<F: FnMut(usize, usize, f32)> TrainingObserver for F {
    fn on_epoch(&mut self, epoch: usize, epochs: usize, loss: f32) {
        self(epoch, epochs, loss)
    }
}

/// Outcome of a completed training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Mean loss of each epoch, in order.
    pub losses: Vec<f32>,
    pub elapsed_secs: f64,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

/// Epoch/batch settings for one training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trainer {
    pub epochs: usize,
    pub batch_size: usize,
}

impl Trainer {
    pub fn new(epochs: usize, batch_size: usize) -> MusicResult<Self> {
        if epochs == 0 {
            return Err(MusicError::invalid_config("epochs must be positive"));
        }
        if batch_size == 0 {
            return Err(MusicError::invalid_config("batch size must be positive"));
        }
        Ok(Self { epochs, batch_size })
    }

    /// Train `predictor` in place. Stops with `Cancelled` if `cancel` fires;
    /// epochs already run are kept in the predictor.
    pub fn train<P: SequencePredictor>(
        &self,
        predictor: &mut P,
        dataset: &Dataset,
        observer: &mut dyn TrainingObserver,
        cancel: Option<&CancelToken>,
    ) -> MusicResult<TrainingReport> {
        if !predictor.is_initialized() {
            return Err(MusicError::ModelNotInitialized);
        }
        dataset.check_trainable()?;

        let start = Instant::now();
        let mut losses = Vec::with_capacity(self.epochs);
        tracing::info!(
            predictor = P::NAME,
            epochs = self.epochs,
            batch_size = self.batch_size,
            windows = dataset.len(),
            "training started"
        );

        for epoch in 1..=self.epochs {
            if let Some(token) = cancel {
                token.check()?;
            }
            let loss = predictor.fit_epoch(dataset, self.batch_size)?;
            tracing::info!(epoch, epochs = self.epochs, loss, "epoch finished");
            observer.on_epoch(epoch, self.epochs, loss);
            losses.push(loss);
        }

        let elapsed_secs = start.elapsed().as_secs_f64();
        tracing::info!(elapsed_secs, "training finished");
        Ok(TrainingReport {
            losses,
            elapsed_secs,
        })
    }
}
