// Stacked LSTM reference predictor.
//
// Architecture: `num_layers` LSTM layers of `hidden_units` cells, fed one
// scalar per time step (the normalized token index). Every layer's output
// sequence goes through inverted dropout during training. The top layer's
// last hidden state feeds a dense softmax head of width `vocab_size`.
//
// Training is plain backpropagation through time with categorical
// cross-entropy, global-norm gradient clipping, and Adam. Within a
// mini-batch, per-sample gradients are computed in parallel with rayon and
// then summed sequentially in batch order, so a run is reproducible for a
// given seed regardless of thread count. Dropout masks come from per-sample
// generators forked from the predictor's own `MusicRng` before the parallel
// section starts.
//
// Weight layout: each layer has one `Array2` `w` of shape `(4H, D + H)`
// acting on the concatenation `[x_t; h_{t-1}]`, and a bias of length `4H`.
// Gate rows are ordered input, forget, candidate, output. The forget-gate
// bias starts at 1.0. The head is `(V, H)` plus a bias of length `V`.

use ndarray::{Array1, Array2, ArrayViewMutD, Axis, Ix1, Ix2, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use lyrebird_prng::MusicRng;

use crate::error::{MusicError, MusicResult};
use crate::optim::{Adam, clip_global_norm};
use crate::predictor::{PredictorConfig, PredictorShape, SequencePredictor, softmax};
use crate::window::Dataset;

/// Maximum global gradient norm per optimizer step.
const MAX_GRAD_NORM: f32 = 5.0;

/// Floor applied to the label probability before taking its log.
const MIN_PROB: f32 = 1e-12;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// One LSTM layer's weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmLayer {
    pub input_dim: usize,
    pub hidden: usize,
    pub w: Array2<f32>,
    pub b: Array1<f32>,
}

/// Full parameter set of an initialized network. This is what gets saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmParams {
    pub shape: PredictorShape,
    pub layers: Vec<LstmLayer>,
    pub head_w: Array2<f32>,
    pub head_b: Array1<f32>,
}

/// Per-step values kept from the forward pass for backpropagation.
struct StepCache {
    xh: Array1<f32>,
    i: Array1<f32>,
    f: Array1<f32>,
    g: Array1<f32>,
    o: Array1<f32>,
    c_prev: Array1<f32>,
    tanh_c: Array1<f32>,
}

/// Forward-pass record for one training window.
struct Trace {
    caches: Vec<Vec<StepCache>>,
    /// Dropout mask per layer, per step (empty when dropout is off).
    masks: Vec<Vec<Array1<f32>>>,
    /// Head input: last output of the top layer, after dropout.
    top: Array1<f32>,
    probs: Vec<f32>,
}

/// Gradients with the same shapes as `LstmParams`.
struct Grads {
    layers: Vec<(Array2<f32>, Array1<f32>)>,
    head_w: Array2<f32>,
    head_b: Array1<f32>,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Outer product `a ⊗ b` as an `(a.len(), b.len())` matrix.
fn outer(a: &Array1<f32>, b: &Array1<f32>) -> Array2<f32> {
    let col = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    col.dot(&row)
}

fn uniform_matrix(rows: usize, cols: usize, bound: f32, rng: &mut MusicRng) -> Array2<f32> {
    Array2::from_shape_simple_fn((rows, cols), || rng.range_f32(-bound, bound))
}

impl LstmLayer {
    fn new(input_dim: usize, hidden: usize, rng: &mut MusicRng) -> Self {
        let bound = 1.0 / (hidden as f32).sqrt();
        let w = uniform_matrix(4 * hidden, input_dim + hidden, bound, rng);
        let mut b: Array1<f32> = Array1::zeros(4 * hidden);
        b.slice_mut(s![hidden..2 * hidden]).fill(1.0);
        Self {
            input_dim,
            hidden,
            w,
            b,
        }
    }

    fn cols(&self) -> usize {
        self.input_dim + self.hidden
    }

    /// Run the layer over `inputs`, returning the hidden state at every step.
    fn forward(&self, inputs: &[Array1<f32>]) -> (Vec<Array1<f32>>, Vec<StepCache>) {
        let h = self.hidden;
        let mut h_prev: Array1<f32> = Array1::zeros(h);
        let mut c_prev: Array1<f32> = Array1::zeros(h);
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut caches = Vec::with_capacity(inputs.len());

        for x in inputs {
            let xh: Array1<f32> = x.iter().chain(h_prev.iter()).copied().collect();
            let z = self.w.dot(&xh) + &self.b;

            let i = z.slice(s![..h]).mapv(sigmoid);
            let f = z.slice(s![h..2 * h]).mapv(sigmoid);
            let g = z.slice(s![2 * h..3 * h]).mapv(f32::tanh);
            let o = z.slice(s![3 * h..]).mapv(sigmoid);

            let c = &f * &c_prev + &i * &g;
            let tanh_c = c.mapv(f32::tanh);
            let h_new = &o * &tanh_c;

            caches.push(StepCache {
                xh,
                i,
                f,
                g,
                o,
                c_prev,
                tanh_c,
            });
            outputs.push(h_new.clone());
            h_prev = h_new;
            c_prev = c;
        }

        (outputs, caches)
    }

    /// Backpropagate through time. `d_outputs[t]` is the loss gradient with
    /// respect to this layer's output at step `t`. Accumulates weight
    /// gradients into `dw`/`db` and returns the gradient for each input.
    fn backward(
        &self,
        caches: &[StepCache],
        d_outputs: &[Array1<f32>],
        dw: &mut Array2<f32>,
        db: &mut Array1<f32>,
    ) -> Vec<Array1<f32>> {
        let h = self.hidden;
        let d = self.input_dim;
        let mut dh_next: Array1<f32> = Array1::zeros(h);
        let mut dc_next: Array1<f32> = Array1::zeros(h);
        let mut d_inputs = vec![Array1::zeros(d); caches.len()];

        for t in (0..caches.len()).rev() {
            let cache = &caches[t];
            let dh = &d_outputs[t] + &dh_next;
            let d_o = &dh * &cache.tanh_c;
            let dc = &dh * &cache.o * &cache.tanh_c.mapv(|v| 1.0 - v * v) + &dc_next;

            let mut dz: Array1<f32> = Array1::zeros(4 * h);
            dz.slice_mut(s![..h])
                .assign(&(&dc * &cache.g * &cache.i.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![h..2 * h])
                .assign(&(&dc * &cache.c_prev * &cache.f.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![2 * h..3 * h])
                .assign(&(&dc * &cache.i * &cache.g.mapv(|v| 1.0 - v * v)));
            dz.slice_mut(s![3 * h..])
                .assign(&(&d_o * &cache.o.mapv(|v| v * (1.0 - v))));
            dc_next = &dc * &cache.f;

            *dw += &outer(&dz, &cache.xh);
            *db += &dz;

            let dxh = self.w.t().dot(&dz);
            dh_next = dxh.slice(s![d..]).to_owned();
            d_inputs[t] = dxh.slice(s![..d]).to_owned();
        }

        d_inputs
    }
}

impl LstmParams {
    fn new(shape: PredictorShape, config: &PredictorConfig, rng: &mut MusicRng) -> Self {
        let hidden = config.hidden_units;
        let layers = (0..config.num_layers)
            .map(|l| LstmLayer::new(if l == 0 { 1 } else { hidden }, hidden, rng))
            .collect();
        let bound = 1.0 / (hidden as f32).sqrt();
        Self {
            shape,
            layers,
            head_w: uniform_matrix(shape.vocab_size, hidden, bound, rng),
            head_b: Array1::zeros(shape.vocab_size),
        }
    }

    fn top_hidden(&self) -> usize {
        self.layers.last().map_or(0, |l| l.hidden)
    }

    /// Check that every tensor has the size its neighbours imply.
    fn validate(&self) -> MusicResult<()> {
        let bad = |what: String| Err(MusicError::persistence(format!("LSTM parameters: {what}")));
        if self.shape.vocab_size == 0 || self.shape.window_len == 0 {
            return bad("zero vocab_size or window_len".into());
        }
        if self.layers.is_empty() {
            return bad("no layers".into());
        }
        let mut expected_input = 1;
        for (l, layer) in self.layers.iter().enumerate() {
            if layer.hidden == 0 || layer.input_dim != expected_input {
                return bad(format!(
                    "layer {l} has input_dim {}, expected {expected_input}",
                    layer.input_dim
                ));
            }
            let rows = 4 * layer.hidden;
            if layer.w.dim() != (rows, layer.cols()) || layer.b.len() != rows {
                return bad(format!(
                    "layer {l} weight shapes do not match hidden {}",
                    layer.hidden
                ));
            }
            expected_input = layer.hidden;
        }
        if self.head_w.dim() != (self.shape.vocab_size, self.top_hidden())
            || self.head_b.len() != self.shape.vocab_size
        {
            return bad("head shape does not match vocab_size".into());
        }
        Ok(())
    }

    fn zero_grads(&self) -> Grads {
        Grads {
            layers: self
                .layers
                .iter()
                .map(|l| (Array2::zeros(l.w.raw_dim()), Array1::zeros(l.b.len())))
                .collect(),
            head_w: Array2::zeros(self.head_w.raw_dim()),
            head_b: Array1::zeros(self.head_b.len()),
        }
    }

    /// Forward pass. Dropout is applied only when `rng` is given and
    /// `dropout > 0`.
    fn forward(&self, window: &[f32], dropout: f32, mut rng: Option<&mut MusicRng>) -> Trace {
        let keep = 1.0 - dropout;
        let mut seq: Vec<Array1<f32>> = window.iter().map(|&x| Array1::from_elem(1, x)).collect();
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut masks = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let (mut outputs, layer_caches) = layer.forward(&seq);
            let mask: Vec<Array1<f32>> = match rng.as_deref_mut() {
                Some(r) if dropout > 0.0 => outputs
                    .iter()
                    .map(|out| {
                        Array1::from_shape_simple_fn(out.len(), || {
                            if r.random_bool(keep as f64) { 1.0 / keep } else { 0.0 }
                        })
                    })
                    .collect(),
                _ => Vec::new(),
            };
            for (out, m) in outputs.iter_mut().zip(&mask) {
                *out *= m;
            }
            caches.push(layer_caches);
            masks.push(mask);
            seq = outputs;
        }

        let top = seq.pop().unwrap_or_else(|| Array1::zeros(0));
        let logits = self.head_w.dot(&top) + &self.head_b;

        Trace {
            caches,
            masks,
            top,
            probs: softmax(&logits.to_vec()),
        }
    }

    /// Cross-entropy loss and parameter gradients for one traced window.
    fn backward(&self, trace: &Trace, label: usize) -> (Grads, f32) {
        let mut grads = self.zero_grads();
        let loss = -trace.probs[label].max(MIN_PROB).ln();

        let mut d_logits = Array1::from(trace.probs.clone());
        d_logits[label] -= 1.0;

        grads.head_w = outer(&d_logits, &trace.top);
        let d_top = self.head_w.t().dot(&d_logits);
        grads.head_b = d_logits;

        // Only the top layer's last step feeds the head.
        let steps = self.shape.window_len;
        let mut d_outputs = vec![Array1::zeros(trace.top.len()); steps];
        d_outputs[steps - 1] = d_top;

        for l in (0..self.layers.len()).rev() {
            for (d, m) in d_outputs.iter_mut().zip(&trace.masks[l]) {
                *d *= m;
            }
            let (dw, db) = &mut grads.layers[l];
            d_outputs = self.layers[l].backward(&trace.caches[l], &d_outputs, dw, db);
        }

        (grads, loss)
    }
}

impl Grads {
    fn add(&mut self, other: &Grads) {
        for ((w, b), (ow, ob)) in self.layers.iter_mut().zip(&other.layers) {
            *w += ow;
            *b += ob;
        }
        self.head_w += &other.head_w;
        self.head_b += &other.head_b;
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = Vec::with_capacity(self.layers.len() * 2 + 2);
        for (w, b) in &mut self.layers {
            out.push(w.view_mut().into_dyn());
            out.push(b.view_mut().into_dyn());
        }
        out.push(self.head_w.view_mut().into_dyn());
        out.push(self.head_b.view_mut().into_dyn());
        out
    }
}

/// Adam state for every tensor of an `LstmParams`.
struct Optimizer {
    layers: Vec<(Adam<Ix2>, Adam<Ix1>)>,
    head_w: Adam<Ix2>,
    head_b: Adam<Ix1>,
}

impl Optimizer {
    fn for_params(params: &LstmParams) -> Self {
        Self {
            layers: params
                .layers
                .iter()
                .map(|l| (Adam::new(&l.w), Adam::new(&l.b)))
                .collect(),
            head_w: Adam::new(&params.head_w),
            head_b: Adam::new(&params.head_b),
        }
    }

    fn step(&mut self, params: &mut LstmParams, grads: &Grads, lr: f32) -> MusicResult<()> {
        for ((layer, (gw, gb)), (aw, ab)) in params
            .layers
            .iter_mut()
            .zip(&grads.layers)
            .zip(self.layers.iter_mut())
        {
            aw.step(&mut layer.w, gw, lr)?;
            ab.step(&mut layer.b, gb, lr)?;
        }
        self.head_w.step(&mut params.head_w, &grads.head_w, lr)?;
        self.head_b.step(&mut params.head_b, &grads.head_b, lr)
    }
}

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

/// The stacked-LSTM `SequencePredictor`.
pub struct LstmPredictor {
    config: PredictorConfig,
    rng: MusicRng,
    params: Option<LstmParams>,
    optimizer: Option<Optimizer>,
}

impl LstmPredictor {
    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn params(&self) -> Option<&LstmParams> {
        self.params.as_ref()
    }
}

impl SequencePredictor for LstmPredictor {
    type Params = LstmParams;

    const NAME: &'static str = "lstm";

    fn new(config: &PredictorConfig) -> Self {
        Self {
            config: config.clone(),
            rng: MusicRng::new(config.seed),
            params: None,
            optimizer: None,
        }
    }

    fn initialize(&mut self, vocab_size: usize, window_len: usize) -> MusicResult<()> {
        self.config.validate()?;
        if vocab_size == 0 {
            return Err(MusicError::EmptyVocabulary);
        }
        if window_len == 0 {
            return Err(MusicError::invalid_config("window length must be positive"));
        }
        let shape = PredictorShape {
            vocab_size,
            window_len,
        };
        self.rng = MusicRng::new(self.config.seed);
        self.params = Some(LstmParams::new(shape, &self.config, &mut self.rng));
        self.optimizer = None;
        Ok(())
    }

    fn shape(&self) -> Option<PredictorShape> {
        self.params.as_ref().map(|p| p.shape)
    }

    fn fit_epoch(&mut self, dataset: &Dataset, batch_size: usize) -> MusicResult<f32> {
        let Self {
            config,
            rng,
            params,
            optimizer,
        } = self;
        let params = params.as_mut().ok_or(MusicError::ModelNotInitialized)?;
        if batch_size == 0 {
            return Err(MusicError::invalid_config("batch size must be positive"));
        }
        params.shape.check_dataset(dataset)?;
        let optimizer = optimizer.get_or_insert_with(|| Optimizer::for_params(params));

        let mut order: Vec<usize> = (0..dataset.len()).collect();
        rng.shuffle(&mut order);

        let dropout = config.dropout;
        let mut total_loss = 0.0f64;
        for batch in order.chunks(batch_size) {
            let sample_rngs: Vec<MusicRng> = batch.iter().map(|_| rng.fork()).collect();
            let net: &LstmParams = params;
            let results: Vec<(Grads, f32)> = batch
                .par_iter()
                .zip(sample_rngs.into_par_iter())
                .map(|(&i, mut sample_rng)| {
                    let window = dataset.normalized_window(i);
                    let trace = net.forward(&window, dropout, Some(&mut sample_rng));
                    net.backward(&trace, dataset.label(i))
                })
                .collect();

            let mut sum = net.zero_grads();
            for (grads, loss) in &results {
                sum.add(grads);
                total_loss += *loss as f64;
            }
            let scale = 1.0 / batch.len() as f32;
            let mut tensors = sum.tensors_mut();
            for t in tensors.iter_mut() {
                t.mapv_inplace(|v| v * scale);
            }
            clip_global_norm(&mut tensors, MAX_GRAD_NORM);
            optimizer.step(params, &sum, config.learning_rate)?;
        }

        Ok((total_loss / dataset.len() as f64) as f32)
    }

    fn predict(&self, window: &[f32]) -> MusicResult<Vec<f32>> {
        let params = self.params.as_ref().ok_or(MusicError::ModelNotInitialized)?;
        params.shape.check_window(window)?;
        Ok(params.forward(window, 0.0, None).probs)
    }

    fn export_params(&self) -> MusicResult<LstmParams> {
        self.params.clone().ok_or(MusicError::ModelNotInitialized)
    }

    fn from_params(config: &PredictorConfig, params: LstmParams) -> MusicResult<Self> {
        params.validate()?;
        let mut config = config.clone();
        config.hidden_units = params.top_hidden();
        config.num_layers = params.layers.len();
        Ok(Self {
            rng: MusicRng::new(config.seed),
            config,
            params: Some(params),
            optimizer: None,
        })
    }
}
