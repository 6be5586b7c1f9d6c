// Background training through `SharedSession`.
//
// `GatedPredictor` wraps the Markov predictor and blocks inside `fit_epoch`
// until its gate opens, which pins a training job in the "running" state so
// the tests can check the busy flag and cancellation without timing races.
// Each test uses its own gate index because tests run concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use lyrebird_music::MusicError;
use lyrebird_music::MusicResult;
use lyrebird_music::config::Config;
use lyrebird_music::corpus::Corpus;
use lyrebird_music::markov::{MarkovParams, MarkovPredictor};
use lyrebird_music::predictor::{PredictorConfig, PredictorShape, SequencePredictor};
use lyrebird_music::session::{GenerationRequest, Session, SharedSession, TrainingEvent};
use lyrebird_music::window::Dataset;

static GATES: [AtomicBool; 3] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

struct GatedPredictor<const GATE: usize>(MarkovPredictor);

impl<const GATE: usize> SequencePredictor for GatedPredictor<GATE> {
    type Params = MarkovParams;
    const NAME: &'static str = "markov";

    fn new(config: &PredictorConfig) -> Self {
        Self(MarkovPredictor::new(config))
    }
    fn initialize(&mut self, vocab_size: usize, window_len: usize) -> MusicResult<()> {
        self.0.initialize(vocab_size, window_len)
    }
    fn shape(&self) -> Option<PredictorShape> {
        self.0.shape()
    }
    fn fit_epoch(&mut self, dataset: &Dataset, batch_size: usize) -> MusicResult<f32> {
        while !GATES[GATE].load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        self.0.fit_epoch(dataset, batch_size)
    }
    fn predict(&self, window: &[f32]) -> MusicResult<Vec<f32>> {
        self.0.predict(window)
    }
    fn export_params(&self) -> MusicResult<MarkovParams> {
        self.0.export_params()
    }
    fn from_params(config: &PredictorConfig, params: MarkovParams) -> MusicResult<Self> {
        MarkovPredictor::from_params(config, params).map(Self)
    }
}

/// A predictor whose training always fails.
struct BrokenPredictor(MarkovPredictor);

impl SequencePredictor for BrokenPredictor {
    type Params = MarkovParams;
    const NAME: &'static str = "broken";

    fn new(config: &PredictorConfig) -> Self {
        Self(MarkovPredictor::new(config))
    }
    fn initialize(&mut self, vocab_size: usize, window_len: usize) -> MusicResult<()> {
        self.0.initialize(vocab_size, window_len)
    }
    fn shape(&self) -> Option<PredictorShape> {
        self.0.shape()
    }
    fn fit_epoch(&mut self, _dataset: &Dataset, _batch_size: usize) -> MusicResult<f32> {
        Err(MusicError::EmptyLabels)
    }
    fn predict(&self, window: &[f32]) -> MusicResult<Vec<f32>> {
        self.0.predict(window)
    }
    fn export_params(&self) -> MusicResult<MarkovParams> {
        self.0.export_params()
    }
    fn from_params(config: &PredictorConfig, params: MarkovParams) -> MusicResult<Self> {
        MarkovPredictor::from_params(config, params).map(Self)
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.model.sequence_length = 4;
    config.training.epochs = 3;
    config.training.batch_size = 16;
    config.generation.seed = Some(1);
    config
}

fn shared<P: SequencePredictor + 'static>() -> SharedSession<P> {
    let mut session = Session::new(config()).unwrap();
    session.use_fallback_corpus();
    SharedSession::new(session)
}

const REQUEST: GenerationRequest = GenerationRequest {
    length: 8,
    window_length: 4,
};

#[test]
fn second_operation_while_training_is_busy() {
    let session = shared::<GatedPredictor<0>>();
    let handle = session.spawn_training().unwrap();
    assert!(session.is_busy());

    assert!(matches!(session.spawn_training(), Err(MusicError::Busy)));
    assert!(matches!(session.generate(REQUEST, None), Err(MusicError::Busy)));
    assert!(matches!(session.save(None), Err(MusicError::Busy)));

    GATES[0].store(true, Ordering::SeqCst);
    let report = handle.join().unwrap();
    assert_eq!(report.losses.len(), 3);
    assert!(!session.is_busy());

    let tokens = session.generate(REQUEST, None).unwrap();
    assert_eq!(tokens.len(), 8);
}

#[test]
fn progress_events_end_with_finished() {
    GATES[1].store(true, Ordering::SeqCst);
    let session = shared::<GatedPredictor<1>>();
    let handle = session.spawn_training().unwrap();
    let events: Vec<TrainingEvent> = handle.events().iter().collect();
    handle.join().unwrap();

    let epochs: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            TrainingEvent::Epoch { epoch, .. } => Some(*epoch),
            _ => None,
        })
        .collect();
    assert_eq!(epochs, vec![1, 2, 3]);
    assert!(matches!(events.last(), Some(TrainingEvent::Finished(_))));
    assert!(session.with(|s| s.is_trained()));
}

#[test]
fn cancellation_stops_the_job_and_keeps_no_model() {
    let session = shared::<GatedPredictor<2>>();
    let handle = session.spawn_training().unwrap();
    handle.cancel();
    GATES[2].store(true, Ordering::SeqCst);

    let events: Vec<TrainingEvent> = handle.events().iter().collect();
    assert!(matches!(handle.join(), Err(MusicError::Cancelled)));
    assert!(matches!(events.last(), Some(TrainingEvent::Failed(_))));
    assert!(!session.is_busy());
    assert!(!session.with(|s| s.is_trained()));
}

#[test]
fn failing_job_releases_the_busy_flag() {
    let session = shared::<BrokenPredictor>();
    let handle = session.spawn_training().unwrap();
    assert!(matches!(handle.join(), Err(MusicError::EmptyLabels)));
    assert!(!session.is_busy());
    assert!(matches!(
        session.generate(REQUEST, None),
        Err(MusicError::ModelNotReady)
    ));
}

#[test]
fn planning_errors_are_returned_immediately() {
    let session = shared::<MarkovPredictor>();
    session.with(|s| s.set_corpus(Corpus::from_tokens(["C4", "E4"])));
    assert!(matches!(
        session.spawn_training(),
        Err(MusicError::InsufficientData { .. })
    ));
    assert!(!session.is_busy());

    session.with(|s| s.use_fallback_corpus());
    let handle = session.spawn_training().unwrap();
    handle.join().unwrap();
    assert!(session.with(|s| s.is_trained()));
}
