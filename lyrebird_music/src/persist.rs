// Model bundle persistence.
//
// A trained model is saved as one JSON document holding everything needed to
// resume generation: the corpus, both vocabulary maps, the window length and
// the predictor's parameters. Saving goes through a sibling temp file and a
// rename so a crash never leaves a half-written bundle behind.
//
// Loading is all-or-nothing: the bundle is parsed and cross-checked (version,
// map consistency, corpus coverage, predictor shape) and the dataset is
// rebuilt before anything is handed back. Every failure is reported as
// `MusicError::Persistence` with a reason.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::corpus::Corpus;
use crate::error::{MusicError, MusicResult};
use crate::predictor::{PredictorConfig, PredictorShape, SequencePredictor};
use crate::vocab::Vocabulary;
use crate::window::Dataset;

/// Current bundle layout version.
pub const FORMAT_VERSION: u32 = 1;

/// On-disk bundle. `T` is the predictor's parameter type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle<T> {
    pub format_version: u32,
    /// Which predictor produced `predictor`; absent in hand-written bundles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictor_kind: Option<String>,
    pub window_length: usize,
    pub corpus: Vec<String>,
    pub note_to_int: BTreeMap<String, usize>,
    pub int_to_note: BTreeMap<usize, String>,
    pub n_vocab: usize,
    pub predictor: T,
}

/// A predictor together with the vocabulary and dataset it was trained on.
#[derive(Debug)]
pub struct TrainedModel<P> {
    pub corpus: Corpus,
    pub vocab: Vocabulary,
    pub dataset: Dataset,
    pub predictor: P,
}

/// Write a bundle for a trained predictor.
pub fn save_bundle<P: SequencePredictor>(
    path: &Path,
    corpus: &Corpus,
    vocab: &Vocabulary,
    predictor: &P,
) -> MusicResult<()> {
    let shape = predictor.shape().ok_or(MusicError::ModelNotReady)?;
    let bundle = Bundle {
        format_version: FORMAT_VERSION,
        predictor_kind: Some(P::NAME.to_string()),
        window_length: shape.window_len,
        corpus: corpus.tokens().to_vec(),
        note_to_int: vocab.note_to_int().clone(),
        int_to_note: vocab.int_to_note(),
        n_vocab: vocab.len(),
        predictor: predictor.export_params()?,
    };
    let json = serde_json::to_string(&bundle)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| MusicError::persistence(format!("create {}: {e}", parent.display())))?;
    }
    let tmp = temp_path(path);
    fs::write(&tmp, json)
        .map_err(|e| MusicError::persistence(format!("write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        MusicError::persistence(format!("rename onto {}: {e}", path.display()))
    })?;
    tracing::info!(path = %path.display(), n_vocab = vocab.len(), "model saved");
    Ok(())
}

/// Read and validate a bundle.
pub fn load_bundle<P: SequencePredictor>(
    path: &Path,
    config: &PredictorConfig,
) -> MusicResult<TrainedModel<P>> {
    let text = fs::read_to_string(path)
        .map_err(|e| MusicError::persistence(format!("read {}: {e}", path.display())))?;
    let model = parse_bundle(&text, config)?;
    tracing::info!(
        path = %path.display(),
        n_vocab = model.vocab.len(),
        tokens = model.corpus.len(),
        "model loaded"
    );
    Ok(model)
}

/// Validate a bundle held in memory.
pub fn parse_bundle<P: SequencePredictor>(
    text: &str,
    config: &PredictorConfig,
) -> MusicResult<TrainedModel<P>> {
    let bundle: Bundle<P::Params> = serde_json::from_str(text)
        .map_err(|e| MusicError::persistence(format!("malformed bundle: {e}")))?;

    if bundle.format_version != FORMAT_VERSION {
        return Err(MusicError::persistence(format!(
            "unsupported format_version {} (expected {FORMAT_VERSION})",
            bundle.format_version
        )));
    }
    if let Some(kind) = bundle.predictor_kind.as_deref().filter(|k| *k != P::NAME) {
        return Err(MusicError::persistence(format!(
            "bundle holds a {kind} predictor, not {}",
            P::NAME
        )));
    }

    let vocab = Vocabulary::from_maps(&bundle.note_to_int, &bundle.int_to_note, bundle.n_vocab)
        .map_err(as_persistence)?;
    let corpus = Corpus::new(bundle.corpus);
    if let Some(unknown) = corpus.tokens().iter().find(|t| vocab.encode(t).is_none()) {
        return Err(MusicError::persistence(format!(
            "corpus token {unknown:?} is not in the vocabulary"
        )));
    }

    let predictor = P::from_params(config, bundle.predictor).map_err(as_persistence)?;
    let expected = PredictorShape {
        vocab_size: bundle.n_vocab,
        window_len: bundle.window_length,
    };
    if predictor.shape() != Some(expected) {
        return Err(MusicError::persistence(format!(
            "predictor shape {:?} does not match n_vocab {} and window_length {}",
            predictor.shape(),
            bundle.n_vocab,
            bundle.window_length
        )));
    }

    let dataset =
        Dataset::build(&corpus, &vocab, bundle.window_length).map_err(as_persistence)?;
    Ok(TrainedModel {
        corpus,
        vocab,
        dataset,
        predictor,
    })
}

fn as_persistence(err: MusicError) -> MusicError {
    match err {
        MusicError::Persistence { .. } => err,
        other => MusicError::persistence(other.to_string()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markov::MarkovPredictor;

    fn trained() -> (Corpus, Vocabulary, MarkovPredictor) {
        let corpus = Corpus::from_tokens(["C4", "E4", "G4", "0.4.7"].repeat(4));
        let vocab = Vocabulary::build(&corpus).unwrap();
        let ds = Dataset::build(&corpus, &vocab, 3).unwrap();
        let mut p = MarkovPredictor::new(&PredictorConfig::default());
        p.initialize(vocab.len(), 3).unwrap();
        p.fit(&ds, 1, 4).unwrap();
        (corpus, vocab, p)
    }

    fn bundle_json() -> serde_json::Value {
        let (corpus, vocab, p) = trained();
        serde_json::to_value(Bundle {
            format_version: FORMAT_VERSION,
            predictor_kind: Some("markov".into()),
            window_length: 3,
            corpus: corpus.tokens().to_vec(),
            note_to_int: vocab.note_to_int().clone(),
            int_to_note: vocab.int_to_note(),
            n_vocab: vocab.len(),
            predictor: p.export_params().unwrap(),
        })
        .unwrap()
    }

    fn load(value: &serde_json::Value) -> MusicResult<TrainedModel<MarkovPredictor>> {
        parse_bundle(&value.to_string(), &PredictorConfig::default())
    }

    #[test]
    fn in_memory_round_trip() {
        let value = bundle_json();
        let model = load(&value).unwrap();
        let (corpus, vocab, p) = trained();
        assert_eq!(model.corpus, corpus);
        assert_eq!(model.vocab, vocab);
        assert_eq!(model.dataset.len(), corpus.len() - 3);
        assert_eq!(
            model.predictor.export_params().unwrap(),
            p.export_params().unwrap()
        );
    }

    #[test]
    fn int_to_note_keys_are_strings_in_json() {
        let value = bundle_json();
        assert_eq!(value["int_to_note"]["0"], "0.4.7");
        assert_eq!(value["note_to_int"]["C4"], 1);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut value = bundle_json();
        value["format_version"] = 2.into();
        assert!(matches!(load(&value), Err(MusicError::Persistence { .. })));
    }

    #[test]
    fn rejects_inconsistent_maps() {
        let mut value = bundle_json();
        value["n_vocab"] = 5.into();
        assert!(matches!(load(&value), Err(MusicError::Persistence { .. })));

        let mut value = bundle_json();
        value["note_to_int"]["C4"] = 2.into();
        assert!(matches!(load(&value), Err(MusicError::Persistence { .. })));
    }

    #[test]
    fn rejects_unknown_corpus_token() {
        let mut value = bundle_json();
        value["corpus"][0] = "F#4".into();
        let err = load(&value).unwrap_err();
        assert!(err.to_string().contains("F#4"), "{err}");
    }

    #[test]
    fn rejects_mismatched_predictor() {
        let mut value = bundle_json();
        value["window_length"] = 4.into();
        assert!(matches!(load(&value), Err(MusicError::Persistence { .. })));

        let mut value = bundle_json();
        value["predictor_kind"] = "lstm".into();
        assert!(matches!(load(&value), Err(MusicError::Persistence { .. })));
    }

    #[test]
    fn rejects_truncated_text() {
        let text = bundle_json().to_string();
        let result: MusicResult<TrainedModel<MarkovPredictor>> =
            parse_bundle(&text[..text.len() / 2], &PredictorConfig::default());
        assert!(matches!(result, Err(MusicError::Persistence { .. })));
    }

    #[test]
    fn temp_path_is_a_sibling() {
        assert_eq!(
            temp_path(Path::new("models/m.json")),
            PathBuf::from("models/m.json.tmp")
        );
    }
}
