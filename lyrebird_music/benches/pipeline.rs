// Benchmarks for the hot paths: windowing a corpus, one LSTM training epoch,
// and greedy generation.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use lyrebird_music::corpus::Corpus;
use lyrebird_music::generator::{DecodingPolicy, Generation};
use lyrebird_music::lstm::LstmPredictor;
use lyrebird_music::predictor::{PredictorConfig, SequencePredictor};
use lyrebird_music::vocab::Vocabulary;
use lyrebird_music::window::Dataset;
use lyrebird_prng::MusicRng;

fn small_lstm() -> PredictorConfig {
    PredictorConfig {
        hidden_units: 32,
        num_layers: 2,
        ..PredictorConfig::default()
    }
}

fn bench_windowing(c: &mut Criterion) {
    let corpus = Corpus::fallback();
    let vocab = Vocabulary::build(&corpus).unwrap();
    c.bench_function("window_fallback_corpus_l100", |b| {
        b.iter(|| Dataset::build(black_box(&corpus), &vocab, 100).unwrap())
    });
}

fn bench_training(c: &mut Criterion) {
    let corpus = Corpus::fallback();
    let vocab = Vocabulary::build(&corpus).unwrap();
    let ds = Dataset::build(&corpus, &vocab, 16).unwrap();
    let mut predictor = LstmPredictor::new(&small_lstm());
    predictor.initialize(vocab.len(), 16).unwrap();
    c.bench_function("lstm_epoch_h32_l16", |b| {
        b.iter(|| predictor.fit_epoch(&ds, 64).unwrap())
    });
}

fn bench_generation(c: &mut Criterion) {
    let corpus = Corpus::fallback();
    let vocab = Vocabulary::build(&corpus).unwrap();
    let ds = Dataset::build(&corpus, &vocab, 16).unwrap();
    let mut predictor = LstmPredictor::new(&small_lstm());
    predictor.initialize(vocab.len(), 16).unwrap();
    c.bench_function("generate_100_greedy", |b| {
        b.iter(|| {
            let mut rng = MusicRng::new(7);
            Generation::seed_at(&predictor, &vocab, &ds, 0, 100, DecodingPolicy::Greedy, &mut rng)
                .unwrap()
                .run(None)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_windowing, bench_training, bench_generation);
criterion_main!(benches);
