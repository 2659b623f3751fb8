//! Dense feed-forward network with softmax output, trained with Adam on
//! categorical cross-entropy.
//!
//! Layout is `input → [dense + ReLU]* → dense + softmax`.  Kernels are stored
//! as `(fan_in, fan_out)` so a batch `X` of shape `(n, fan_in)` maps to
//! `X · W + b`.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::ModelError;

// ════════════════════════════════════════════════════════════════════════════
// Activation / Dense
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Softmax,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dense {
    pub kernel:     Array2<f32>,
    pub bias:       Array1<f32>,
    pub activation: Activation,
}

impl Dense {
    /// Glorot-uniform kernel, zero bias.
    fn init(fan_in: usize, fan_out: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        let kernel = Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit));
        Dense { kernel, bias: Array1::zeros(fan_out), activation }
    }

    pub fn units(&self) -> usize { self.bias.len() }

    fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let z = x.dot(&self.kernel) + &self.bias;
        match self.activation {
            Activation::Relu    => z.mapv(|v| v.max(0.0)),
            Activation::Softmax => softmax_rows(z),
        }
    }
}

fn softmax_rows(mut z: Array2<f32>) -> Array2<f32> {
    for mut row in z.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    z
}

// ════════════════════════════════════════════════════════════════════════════
// TrainConfig / TrainProgress
// ════════════════════════════════════════════════════════════════════════════

/// Hyperparameters for one training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub hidden_units:  Vec<usize>,
    pub epochs:        usize,
    pub batch_size:    usize,
    pub learning_rate: f32,
    /// Seed for weight init and shuffling.
    pub seed:          u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            hidden_units:  vec![64],
            epochs:        50,
            batch_size:    16,
            learning_rate: 0.001,
            seed:          42,
        }
    }
}

/// Reported once per epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainProgress {
    /// Zero-based epoch index.
    pub epoch:    usize,
    pub epochs:   usize,
    pub loss:     f32,
    pub accuracy: f32,
}

// ════════════════════════════════════════════════════════════════════════════
// Network
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    pub input_dim: usize,
    pub layers:    Vec<Dense>,
}

impl Network {
    /// Fresh randomly initialised network.
    pub fn new(input_dim: usize, hidden: &[usize], num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut fan_in = input_dim;
        for &units in hidden {
            layers.push(Dense::init(fan_in, units, Activation::Relu, &mut rng));
            fan_in = units;
        }
        layers.push(Dense::init(fan_in, num_classes, Activation::Softmax, &mut rng));
        Network { input_dim, layers }
    }

    pub fn num_classes(&self) -> usize {
        self.layers.last().map(Dense::units).unwrap_or(0)
    }

    /// Class probabilities for each row of `x`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut a = x.to_owned();
        for layer in &self.layers {
            a = layer.forward(a.view());
        }
        a
    }

    /// Probabilities for a single input row.
    pub fn predict_one(&self, input: &[f32]) -> Result<Vec<f32>, ModelError> {
        if input.len() != self.input_dim {
            return Err(ModelError::FeatureSize { expected: self.input_dim, actual: input.len() });
        }
        let x = ArrayView2::from_shape((1, input.len()), input)
            .map_err(|e| ModelError::InvalidArtifacts(e.to_string()))?;
        Ok(self.forward(x).row(0).to_vec())
    }

    /// Mini-batch Adam over `x` / `labels`, calling `on_epoch` after each
    /// epoch.  Fails if the loss becomes non-finite.
    pub fn fit<F>(
        &mut self,
        x:        &Array2<f32>,
        labels:   &[usize],
        cfg:      &TrainConfig,
        mut on_epoch: F,
    ) -> Result<TrainProgress, ModelError>
    where
        F: FnMut(&TrainProgress),
    {
        let n = x.nrows();
        let classes = self.num_classes();
        let batch = cfg.batch_size.max(1);
        let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1));
        let mut adam = Adam::new(&self.layers, cfg.learning_rate);
        let mut order: Vec<usize> = (0..n).collect();
        let mut last = TrainProgress { epoch: 0, epochs: cfg.epochs, loss: 0.0, accuracy: 0.0 };

        for epoch in 0..cfg.epochs {
            order.shuffle(&mut rng);
            for chunk in order.chunks(batch) {
                let xb = x.select(Axis(0), chunk);
                let yb = one_hot(chunk.iter().map(|&i| labels[i]), classes);
                self.step(&xb, &yb, &mut adam);
            }

            let probs = self.forward(x.view());
            let (loss, accuracy) = loss_and_accuracy(&probs, labels);
            if !loss.is_finite() {
                return Err(ModelError::Diverged(epoch));
            }
            last = TrainProgress { epoch, epochs: cfg.epochs, loss, accuracy };
            on_epoch(&last);
        }
        Ok(last)
    }

    /// One forward/backward pass and Adam update.
    fn step(&mut self, xb: &Array2<f32>, yb: &Array2<f32>, adam: &mut Adam) {
        // keep every layer's input for the backward pass
        let mut inputs: Vec<Array2<f32>> = Vec::with_capacity(self.layers.len());
        let mut a = xb.clone();
        for layer in &self.layers {
            let next = layer.forward(a.view());
            inputs.push(a);
            a = next;
        }

        // softmax + cross-entropy: dL/dz = (p - y) / n
        let n = xb.nrows().max(1) as f32;
        let mut delta = (&a - yb) / n;

        for i in (0..self.layers.len()).rev() {
            let grad_w = inputs[i].t().dot(&delta);
            let grad_b = delta.sum_axis(Axis(0));
            if i > 0 {
                let back = delta.dot(&self.layers[i].kernel.t());
                // ReLU derivative on the previous layer's output (= inputs[i])
                delta = back * inputs[i].mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
            }
            adam.update(i, &mut self.layers[i], &grad_w, &grad_b);
        }
    }
}

fn one_hot(labels: impl Iterator<Item = usize>, classes: usize) -> Array2<f32> {
    let labels: Vec<usize> = labels.collect();
    let mut y = Array2::zeros((labels.len(), classes));
    for (r, &l) in labels.iter().enumerate() {
        if l < classes {
            y[[r, l]] = 1.0;
        }
    }
    y
}

fn loss_and_accuracy(probs: &Array2<f32>, labels: &[usize]) -> (f32, f32) {
    let n = labels.len().max(1) as f32;
    let mut loss = 0.0f32;
    let mut correct = 0usize;
    for (row, &label) in probs.rows().into_iter().zip(labels) {
        loss -= (row[label] + 1e-7).ln();
        if argmax(row.iter().copied()) == Some(label) {
            correct += 1;
        }
    }
    (loss / n, correct as f32 / n)
}

/// Index of the strictly largest value; the first one wins ties.
pub fn argmax(values: impl Iterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

// ════════════════════════════════════════════════════════════════════════════
// Adam
// ════════════════════════════════════════════════════════════════════════════

struct Moments {
    m_w: Array2<f32>,
    v_w: Array2<f32>,
    m_b: Array1<f32>,
    v_b: Array1<f32>,
}

struct Adam {
    lr:      f32,
    beta1:   f32,
    beta2:   f32,
    eps:     f32,
    t:       i32,
    moments: Vec<Moments>,
}

impl Adam {
    fn new(layers: &[Dense], lr: f32) -> Self {
        let moments = layers.iter().map(|l| Moments {
            m_w: Array2::zeros(l.kernel.raw_dim()),
            v_w: Array2::zeros(l.kernel.raw_dim()),
            m_b: Array1::zeros(l.bias.raw_dim()),
            v_b: Array1::zeros(l.bias.raw_dim()),
        }).collect();
        Adam { lr, beta1: 0.9, beta2: 0.999, eps: 1e-7, t: 0, moments }
    }

    fn update(&mut self, idx: usize, layer: &mut Dense, grad_w: &Array2<f32>, grad_b: &Array1<f32>) {
        // the last layer is updated first in the backward pass; advance the
        // step counter once per batch
        if idx + 1 == self.moments.len() {
            self.t += 1;
        }
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        let lr_t = self.lr * (1.0 - b2.powi(self.t)).sqrt() / (1.0 - b1.powi(self.t));
        let m = &mut self.moments[idx];

        m.m_w = &m.m_w * b1 + grad_w * (1.0 - b1);
        m.v_w = &m.v_w * b2 + &grad_w.mapv(|g| g * g) * (1.0 - b2);
        layer.kernel.scaled_add(-lr_t, &(&m.m_w / &m.v_w.mapv(|v| v.sqrt() + eps)));

        m.m_b = &m.m_b * b1 + grad_b * (1.0 - b1);
        m.v_b = &m.v_b * b2 + &grad_b.mapv(|g| g * g) * (1.0 - b2);
        layer.bias.scaled_add(-lr_t, &(&m.m_b / &m.v_b.mapv(|v| v.sqrt() + eps)));
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_first_wins_ties() {
        assert_eq!(argmax([0.2, 0.5, 0.5].into_iter()), Some(1));
        assert_eq!(argmax(std::iter::empty()), None);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let z = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, -50.0, 0.0, 50.0]).unwrap();
        let p = softmax_rows(z);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn forward_shape() {
        let net = Network::new(4, &[8, 6], 3, 7);
        let x = Array2::zeros((5, 4));
        assert_eq!(net.forward(x.view()).dim(), (5, 3));
        assert_eq!(net.num_classes(), 3);
    }

    #[test]
    fn predict_one_checks_length() {
        let net = Network::new(4, &[8], 2, 7);
        assert!(matches!(
            net.predict_one(&[0.0; 3]),
            Err(ModelError::FeatureSize { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn fit_separates_two_clusters() {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..10 {
            let jitter = i as f32 * 0.005;
            rows.extend(std::iter::repeat(0.2 + jitter).take(4));
            labels.push(0);
            rows.extend(std::iter::repeat(0.8 - jitter).take(4));
            labels.push(1);
        }
        let x = Array2::from_shape_vec((20, 4), rows).unwrap();
        let mut net = Network::new(4, &[8], 2, 1);
        let cfg = TrainConfig { epochs: 150, batch_size: 4, learning_rate: 0.01, ..TrainConfig::default() };
        let mut epochs_seen = 0;
        let last = net.fit(&x, &labels, &cfg, |_| epochs_seen += 1).unwrap();
        assert_eq!(epochs_seen, 150);
        assert_eq!(last.accuracy, 1.0);
        let p = net.predict_one(&[0.8; 4]).unwrap();
        assert!(p[1] > p[0]);
    }
}
