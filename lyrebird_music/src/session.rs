// Pipeline session: the single owner of corpus, vocabulary, dataset and
// trained predictor.
//
// `Session<P>` is the synchronous API. Training is split in three so it can
// run without holding the session:
//
// - `plan_training` snapshots the corpus and builds a fresh vocabulary,
//   dataset and initialized predictor (all-or-nothing);
// - `TrainingPlan::run` fits the predictor, touching nothing shared;
// - `install` swaps the finished model in.
//
// A failed or cancelled run never reaches `install`, so the previously
// trained model (if any) stays usable. Replacing the corpus drops it.
//
// `SharedSession<P>` puts a session behind `Arc<Mutex<_>>` for front-ends
// that train on a worker thread. A busy flag admits one long-running
// operation (training, generation, save, load) at a time; the others fail
// fast with `MusicError::Busy`. The flag is held by a `BusyGuard`, so it is
// released on success, error and panic alike.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use lyrebird_prng::MusicRng;

use crate::config::Config;
use crate::corpus::Corpus;
use crate::error::{MusicError, MusicResult};
use crate::generator::Generation;
use crate::midi;
use crate::persist::{self, TrainedModel};
use crate::predictor::SequencePredictor;
use crate::trainer::{CancelToken, Trainer, TrainingObserver, TrainingReport};
use crate::vocab::Vocabulary;
use crate::window::Dataset;

/// What the caller wants generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRequest {
    pub length: usize,
    /// Must equal the window length the predictor was trained with.
    pub window_length: usize,
}

/// Vocabulary and dataset built from the current corpus by `prepare`.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub vocab: Vocabulary,
    pub dataset: Dataset,
}

// ---------------------------------------------------------------------------
// Training plan
// ---------------------------------------------------------------------------

/// A self-contained training job, detached from the session that planned it.
pub struct TrainingPlan<P: SequencePredictor> {
    corpus: Corpus,
    vocab: Vocabulary,
    dataset: Dataset,
    predictor: P,
    trainer: Trainer,
}

impl<P: SequencePredictor> TrainingPlan<P> {
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Fit the predictor. On success returns the finished model, ready for
    /// `Session::install`.
    pub fn run(
        mut self,
        observer: &mut dyn TrainingObserver,
        cancel: Option<&CancelToken>,
    ) -> MusicResult<(TrainedModel<P>, TrainingReport)> {
        let report = self
            .trainer
            .train(&mut self.predictor, &self.dataset, observer, cancel)?;
        let model = TrainedModel {
            corpus: self.corpus,
            vocab: self.vocab,
            dataset: self.dataset,
            predictor: self.predictor,
        };
        Ok((model, report))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session<P: SequencePredictor> {
    config: Config,
    corpus: Corpus,
    prepared: Option<Prepared>,
    model: Option<TrainedModel<P>>,
    rng: MusicRng,
}

impl<P: SequencePredictor> Session<P> {
    pub fn new(config: Config) -> MusicResult<Self> {
        config.validate()?;
        let seed = config.generation.seed.unwrap_or_else(clock_seed);
        Ok(Self {
            config,
            corpus: Corpus::default(),
            prepared: None,
            model: None,
            rng: MusicRng::new(seed),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn prepared(&self) -> Option<&Prepared> {
        self.prepared.as_ref()
    }

    pub fn model(&self) -> Option<&TrainedModel<P>> {
        self.model.as_ref()
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    /// Replace the working corpus. Prepared data and any trained model
    /// belong to the old corpus and are dropped.
    pub fn set_corpus(&mut self, corpus: Corpus) {
        self.corpus = corpus;
        self.prepared = None;
        self.model = None;
    }

    pub fn use_fallback_corpus(&mut self) {
        self.set_corpus(Corpus::fallback());
    }

    /// Load the corpus from the configured MIDI folder (or the fallback
    /// patterns). Returns the token count.
    pub fn extract_corpus(&mut self) -> usize {
        let corpus = midi::extract_corpus(&self.config.paths.midi_folder);
        let len = corpus.len();
        self.set_corpus(corpus);
        len
    }

    /// Build vocabulary and dataset from the current corpus.
    pub fn prepare(&mut self) -> MusicResult<&Prepared> {
        let (vocab, dataset) = self.build_dataset()?;
        Ok(&*self.prepared.insert(Prepared { vocab, dataset }))
    }

    fn build_dataset(&self) -> MusicResult<(Vocabulary, Dataset)> {
        let vocab = Vocabulary::build(&self.corpus)?;
        let dataset = Dataset::build(&self.corpus, &vocab, self.config.model.sequence_length)?;
        Ok((vocab, dataset))
    }

    /// Snapshot everything a training run needs.
    pub fn plan_training(&self) -> MusicResult<TrainingPlan<P>> {
        let trainer = Trainer::new(self.config.training.epochs, self.config.training.batch_size)?;
        let (vocab, dataset) = self.build_dataset()?;
        let mut predictor = P::new(&self.config.predictor_config());
        predictor.initialize(vocab.len(), dataset.window_len())?;
        Ok(TrainingPlan {
            corpus: self.corpus.clone(),
            vocab,
            dataset,
            predictor,
            trainer,
        })
    }

    /// Make `model` the current model; its corpus becomes the working corpus.
    pub fn install(&mut self, model: TrainedModel<P>) {
        self.corpus = model.corpus.clone();
        self.prepared = Some(Prepared {
            vocab: model.vocab.clone(),
            dataset: model.dataset.clone(),
        });
        self.model = Some(model);
    }

    /// Plan, run and install a training job in one call.
    pub fn train(
        &mut self,
        observer: &mut dyn TrainingObserver,
        cancel: Option<&CancelToken>,
    ) -> MusicResult<TrainingReport> {
        let (model, report) = self.plan_training()?.run(observer, cancel)?;
        self.install(model);
        Ok(report)
    }

    /// Generate from a randomly chosen training window.
    pub fn generate(
        &mut self,
        request: GenerationRequest,
        cancel: Option<&CancelToken>,
    ) -> MusicResult<Vec<String>> {
        let model = ready_model(self.model.as_ref(), request)?;
        Generation::seed_random(
            &model.predictor,
            &model.vocab,
            &model.dataset,
            request.length,
            self.config.generation.decoding,
            &mut self.rng,
        )?
        .run(cancel)
    }

    /// Generate from training window `seed_index`.
    pub fn generate_from_seed(
        &mut self,
        seed_index: usize,
        request: GenerationRequest,
        cancel: Option<&CancelToken>,
    ) -> MusicResult<Vec<String>> {
        let model = ready_model(self.model.as_ref(), request)?;
        Generation::seed_at(
            &model.predictor,
            &model.vocab,
            &model.dataset,
            seed_index,
            request.length,
            self.config.generation.decoding,
            &mut self.rng,
        )?
        .run(cancel)
    }

    /// Save the current model. `None` uses the configured bundle path.
    pub fn save(&self, path: Option<&Path>) -> MusicResult<PathBuf> {
        let model = self.model.as_ref().ok_or(MusicError::ModelNotReady)?;
        let path = path.map_or_else(|| self.config.paths.bundle_path.clone(), Path::to_path_buf);
        persist::save_bundle(&path, &model.corpus, &model.vocab, &model.predictor)?;
        Ok(path)
    }

    /// Load a model. On any failure the session is left as it was.
    pub fn load(&mut self, path: Option<&Path>) -> MusicResult<PathBuf> {
        let path = path.map_or_else(|| self.config.paths.bundle_path.clone(), Path::to_path_buf);
        let model = persist::load_bundle(&path, &self.config.predictor_config())?;
        self.install(model);
        Ok(path)
    }

    /// Render tokens to MIDI. `None` uses the configured output path.
    pub fn write_midi(&self, tokens: &[String], path: Option<&Path>) -> MusicResult<PathBuf> {
        let path = path.map_or_else(|| self.config.paths.output_midi.clone(), Path::to_path_buf);
        midi::write_tokens_midi(tokens, &path)?;
        Ok(path)
    }
}

/// The trained model, if it accepts `request`'s window length.
fn ready_model<P>(
    model: Option<&TrainedModel<P>>,
    request: GenerationRequest,
) -> MusicResult<&TrainedModel<P>> {
    let model = model.ok_or(MusicError::ModelNotReady)?;
    if request.window_length != model.dataset.window_len() {
        return Err(MusicError::WindowLengthMismatch {
            expected: model.dataset.window_len(),
            actual: request.window_length,
        });
    }
    Ok(model)
}

/// Seed derived from the wall clock, for runs without a configured seed.
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Shared session
// ---------------------------------------------------------------------------

/// Holds the busy flag until dropped.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> MusicResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| MusicError::Busy)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Progress reported by a background training job.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    Epoch {
        epoch: usize,
        epochs: usize,
        loss: f32,
    },
    Finished(TrainingReport),
    /// The job stopped with this error message; the previous model is kept.
    Failed(String),
}

/// Handle to a training job running on a worker thread.
pub struct TrainingHandle {
    events: Receiver<TrainingEvent>,
    cancel: CancelToken,
    thread: Option<thread::JoinHandle<MusicResult<TrainingReport>>>,
}

impl TrainingHandle {
    /// Progress events, ending with `Finished` or `Failed`.
    pub fn events(&self) -> &Receiver<TrainingEvent> {
        &self.events
    }

    /// Ask the job to stop before its next epoch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job to end.
    pub fn join(mut self) -> MusicResult<TrainingReport> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("training worker panicked").into())),
            None => Err(MusicError::Cancelled),
        }
    }
}

/// A session shared between a control thread and a training worker.
pub struct SharedSession<P: SequencePredictor> {
    inner: Arc<Mutex<Session<P>>>,
    busy: Arc<AtomicBool>,
}

impl<P: SequencePredictor> Clone for SharedSession<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            busy: self.busy.clone(),
        }
    }
}

impl<P: SequencePredictor + 'static> SharedSession<P> {
    pub fn new(session: Session<P>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Session<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a quick operation (corpus edits, queries) on the session. Does
    /// not take the busy flag.
    pub fn with<R>(&self, f: impl FnOnce(&mut Session<P>) -> R) -> R {
        f(&mut self.lock())
    }

    /// Start training on a worker thread. Fails with `Busy` if another
    /// long-running operation is active; planning errors are returned here.
    pub fn spawn_training(&self) -> MusicResult<TrainingHandle> {
        let guard = BusyGuard::acquire(&self.busy)?;
        let plan = self.lock().plan_training()?;

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let inner = self.inner.clone();

        let thread = thread::spawn(move || {
            let progress = tx.clone();
            let mut observer = move |epoch: usize, epochs: usize, loss: f32| {
                let _ = progress.send(TrainingEvent::Epoch {
                    epoch,
                    epochs,
                    loss,
                });
            };
            let result = plan.run(&mut observer, Some(&worker_cancel)).map(|(model, report)| {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .install(model);
                report
            });
            drop(guard);

            let event = match &result {
                Ok(report) => TrainingEvent::Finished(report.clone()),
                Err(e) => {
                    tracing::warn!(error = %e, "training job stopped");
                    TrainingEvent::Failed(e.to_string())
                }
            };
            let _ = tx.send(event);
            result
        });

        Ok(TrainingHandle {
            events: rx,
            cancel,
            thread: Some(thread),
        })
    }

    pub fn generate(
        &self,
        request: GenerationRequest,
        cancel: Option<&CancelToken>,
    ) -> MusicResult<Vec<String>> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        self.lock().generate(request, cancel)
    }

    pub fn save(&self, path: Option<&Path>) -> MusicResult<PathBuf> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        self.lock().save(path)
    }

    pub fn load(&self, path: Option<&Path>) -> MusicResult<PathBuf> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        self.lock().load(path)
    }
}
