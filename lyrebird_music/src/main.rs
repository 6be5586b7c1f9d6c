// Lyrebird CLI entry point.
//
// Subcommands map onto the session pipeline: write demo MIDI files, extract a
// corpus, train and save a model, or load a model and render new music to
// MIDI. Settings come from an optional JSON config; flags override it.
//
// Usage:
//   lyrebird sample   [--folder DIR]
//   lyrebird extract  [--folder DIR]
//   lyrebird train    [--config F] [--epochs N] [--batch-size N]
//                     [--sequence-length N] [--predictor lstm|markov] [--bundle F]
//   lyrebird generate [--config F] [--length N] [--bundle F] [--out F] [--seed N]
//                     [--temperature T] [--top-k K] [--predictor lstm|markov]
//
// `--predictor markov` trains in milliseconds but loses its context after the
// seed window (see markov.rs), so it only smoke-tests the pipeline.
//
// Log verbosity follows RUST_LOG (default: info).

use std::path::{Path, PathBuf};

use lyrebird_music::MusicResult;
use lyrebird_music::config::Config;
use lyrebird_music::generator::DecodingPolicy;
use lyrebird_music::lstm::LstmPredictor;
use lyrebird_music::markov::MarkovPredictor;
use lyrebird_music::midi::{extract_corpus, write_sample_files};
use lyrebird_music::predictor::SequencePredictor;
use lyrebird_music::session::{GenerationRequest, Session};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_CONFIG: &str = "lyrebird.json";

fn main() {
    init_logging();
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    let result = match command {
        "sample" => sample(&args),
        "extract" => extract(&args),
        "train" | "generate" => match load_config(&args) {
            Ok(config) => match flag_value(&args, "--predictor").unwrap_or("lstm") {
                "lstm" => run::<LstmPredictor>(command, &args, config),
                "markov" => run::<MarkovPredictor>(command, &args, config),
                other => {
                    eprintln!("Unknown predictor '{other}'. Use lstm or markov.");
                    std::process::exit(2);
                }
            },
            Err(e) => Err(e),
        },
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

fn print_usage() {
    println!("Usage:");
    println!("  lyrebird sample   [--folder DIR]");
    println!("  lyrebird extract  [--folder DIR]");
    println!("  lyrebird train    [--config F] [--epochs N] [--batch-size N]");
    println!("                    [--sequence-length N] [--predictor lstm|markov] [--bundle F]");
    println!("  lyrebird generate [--config F] [--length N] [--bundle F] [--out F] [--seed N]");
    println!("                    [--temperature T] [--top-k K] [--predictor lstm|markov]");
    println!();
    println!("  --predictor markov is a fast smoke test: after the seed window its");
    println!("  context collapses to the first vocabulary tokens.");
}

fn sample(args: &[String]) -> MusicResult<()> {
    let folder = flag_value(args, "--folder").unwrap_or("output");
    let written = write_sample_files(Path::new(folder))?;
    println!("Created {} sample MIDI files in '{folder}':", written.len());
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

fn extract(args: &[String]) -> MusicResult<()> {
    let folder = flag_value(args, "--folder").unwrap_or("output");
    let corpus = extract_corpus(Path::new(folder));
    println!(
        "Corpus: {} tokens, {} distinct",
        corpus.len(),
        corpus.distinct_count()
    );
    let preview: Vec<&str> = corpus.tokens().iter().take(20).map(String::as_str).collect();
    println!("First tokens: {}", preview.join(" "));
    Ok(())
}

/// Read the config file and apply flag overrides.
fn load_config(args: &[String]) -> MusicResult<Config> {
    let path = flag_value(args, "--config").unwrap_or(DEFAULT_CONFIG);
    let mut config = Config::load(Path::new(path))?;

    if let Some(n) = parse_flag(args, "--epochs") {
        config.training.epochs = n;
    }
    if let Some(n) = parse_flag(args, "--batch-size") {
        config.training.batch_size = n;
    }
    if let Some(n) = parse_flag(args, "--sequence-length") {
        config.model.sequence_length = n;
    }
    if let Some(n) = parse_flag(args, "--length") {
        config.generation.length = n;
    }
    if let Some(seed) = parse_flag(args, "--seed") {
        config.generation.seed = Some(seed);
    }
    if let Some(folder) = flag_value(args, "--folder") {
        config.paths.midi_folder = PathBuf::from(folder);
    }
    if let Some(bundle) = flag_value(args, "--bundle") {
        config.paths.bundle_path = PathBuf::from(bundle);
    }
    if let Some(out) = flag_value(args, "--out") {
        config.paths.output_midi = PathBuf::from(out);
    }

    let temperature: Option<f32> = parse_flag(args, "--temperature");
    let top_k: Option<usize> = parse_flag(args, "--top-k");
    match (top_k, temperature) {
        (Some(k), t) => {
            config.generation.decoding = DecodingPolicy::TopK {
                k,
                temperature: t.unwrap_or(1.0),
            }
        }
        (None, Some(temperature)) => {
            config.generation.decoding = DecodingPolicy::Temperature { temperature }
        }
        (None, None) => {}
    }

    config.validate()?;
    Ok(config)
}

fn run<P: SequencePredictor + 'static>(
    command: &str,
    args: &[String],
    config: Config,
) -> MusicResult<()> {
    let mut session: Session<P> = Session::new(config)?;
    if command == "train" {
        train(&mut session)
    } else {
        generate(&mut session, args)
    }
}

fn train<P: SequencePredictor>(session: &mut Session<P>) -> MusicResult<()> {
    println!("=== Lyrebird: training ({}) ===", P::NAME);
    println!(
        "[1/3] Extracting notes from {}...",
        session.config().paths.midi_folder.display()
    );
    let tokens = session.extract_corpus();
    println!(
        "  {tokens} tokens, {} distinct.",
        session.corpus().distinct_count()
    );

    println!("[2/3] Training...");
    let mut progress = |epoch: usize, epochs: usize, loss: f32| {
        println!("  Epoch {epoch}/{epochs}: loss {loss:.4}");
    };
    let report = session.train(&mut progress, None)?;
    if let Some(loss) = report.final_loss() {
        println!(
            "  Done in {:.1}s, final loss {loss:.4}.",
            report.elapsed_secs
        );
    }

    println!("[3/3] Saving model...");
    let path = session.save(None)?;
    println!("  Saved to {}.", path.display());
    Ok(())
}

fn generate<P: SequencePredictor>(session: &mut Session<P>, args: &[String]) -> MusicResult<()> {
    println!("=== Lyrebird: generation ({}) ===", P::NAME);
    println!(
        "[1/3] Loading model from {}...",
        session.config().paths.bundle_path.display()
    );
    session.load(None)?;
    let window_length = match session.model() {
        Some(model) => model.dataset.window_len(),
        None => return Err(lyrebird_music::MusicError::ModelNotReady),
    };
    // An explicit --sequence-length is checked against the model.
    let window_length = parse_flag(args, "--sequence-length").unwrap_or(window_length);

    let length = session.config().generation.length;
    println!("[2/3] Generating {length} tokens...");
    let tokens = session.generate(
        GenerationRequest {
            length,
            window_length,
        },
        None,
    )?;
    let preview: Vec<&str> = tokens.iter().take(16).map(String::as_str).collect();
    println!("  {} ...", preview.join(" "));

    println!("[3/3] Writing MIDI...");
    let path = session.write_midi(&tokens, None)?;
    println!("  Wrote {}.", path.display());
    println!();
    println!("Play with: timidity {} (or any MIDI player)", path.display());
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    flag_value(args, flag).and_then(|v| v.parse().ok())
}
