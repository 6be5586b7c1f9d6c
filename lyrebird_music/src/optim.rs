// Adam optimizer and gradient clipping over `ndarray` tensors.
//
// One `Adam` instance per parameter tensor; each keeps first/second moment
// arrays shaped like its tensor plus a step counter. The dimension is generic
// so the same type serves weight matrices and bias vectors.

use ndarray::{Array, ArrayViewMutD, Dimension, Zip};

use crate::error::{MusicError, MusicResult};

/// Adam state for one parameter tensor.
#[derive(Debug, Clone)]
pub struct Adam<D: Dimension> {
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: u32,
    m: Array<f32, D>,
    v: Array<f32, D>,
}

impl<D: Dimension> Adam<D> {
    /// Zeroed moments shaped like `params`.
    pub fn new(params: &Array<f32, D>) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Array::zeros(params.raw_dim()),
            v: Array::zeros(params.raw_dim()),
        }
    }

    /// Apply one update to `params`.
    ///
    /// A non-positive learning rate or a gradient whose shape differs from
    /// the parameters is an `InvalidConfig` error; nothing is changed.
    pub fn step(
        &mut self,
        params: &mut Array<f32, D>,
        grads: &Array<f32, D>,
        lr: f32,
    ) -> MusicResult<()> {
        if !lr.is_finite() || lr <= 0.0 {
            return Err(MusicError::invalid_config(format!(
                "learning rate must be positive, got {lr}"
            )));
        }
        if params.shape() != grads.shape() || params.shape() != self.m.shape() {
            return Err(MusicError::invalid_config(format!(
                "gradient shape {:?} does not match parameter shape {:?}",
                grads.shape(),
                params.shape()
            )));
        }

        self.t = self.t.saturating_add(1);
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);
        let bias1 = (1.0 - beta1.powi(self.t as i32)).max(1e-12);
        let bias2 = (1.0 - beta2.powi(self.t as i32)).max(1e-12);

        Zip::from(params)
            .and(grads)
            .and(&mut self.m)
            .and(&mut self.v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= lr * (*m / bias1) / ((*v / bias2).sqrt() + eps);
            });
        Ok(())
    }
}

/// Scale `grads` in place so their combined L2 norm is at most `max_norm`.
pub fn clip_global_norm(grads: &mut [ArrayViewMutD<'_, f32>], max_norm: f32) {
    let norm = grads
        .iter()
        .map(|g| g.iter().map(|x| x * x).sum::<f32>())
        .sum::<f32>()
        .sqrt();
    if norm.is_finite() && norm > max_norm {
        let scale = max_norm / norm;
        for g in grads.iter_mut() {
            g.mapv_inplace(|x| x * scale);
        }
    }
}
