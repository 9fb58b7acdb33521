//! Stacked LSTM regressor with full backpropagation through time.
//!
//! Small, dependency-light network used by the sequence model: a stack of
//! LSTM layers of decreasing width, locked dropout between layers, and a
//! linear head on the final hidden state. Optimised with Adam under a Huber
//! loss. Every intermediate (gate activations, tapes, gradients) is an owned
//! buffer scoped to the call that created it.

use ndarray::{s, Array1, Array2, Axis, Dimension, Zip};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

/// Huber loss for a single residual.
pub fn huber(residual: f64, delta: f64) -> f64 {
    let a = residual.abs();
    if a <= delta {
        0.5 * residual * residual
    } else {
        delta * (a - 0.5 * delta)
    }
}

/// Derivative of [`huber`] with respect to the residual.
pub fn huber_grad(residual: f64, delta: f64) -> f64 {
    if residual.abs() <= delta {
        residual
    } else {
        delta * residual.signum()
    }
}

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// One LSTM layer. Gate order in the stacked weights is [input, forget, cell, output].
#[derive(Debug, Clone)]
struct LstmLayer {
    w_ih: Array2<f64>,
    w_hh: Array2<f64>,
    b: Array1<f64>,
    hidden: usize,
}

/// Activations of one timestep, kept for the backward pass.
struct StepTape {
    x: Array1<f64>,
    h_prev: Array1<f64>,
    c_prev: Array1<f64>,
    i: Array1<f64>,
    f: Array1<f64>,
    g: Array1<f64>,
    o: Array1<f64>,
    tanh_c: Array1<f64>,
}

impl LstmLayer {
    fn new<R: Rng>(input_dim: usize, hidden: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (hidden as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let w_ih = Array2::from_shape_fn((4 * hidden, input_dim), |_| dist.sample(rng));
        let w_hh = Array2::from_shape_fn((4 * hidden, hidden), |_| dist.sample(rng));
        let mut b = Array1::zeros(4 * hidden);
        // Forget gate starts open.
        b.slice_mut(s![hidden..2 * hidden]).fill(1.0);
        Self { w_ih, w_hh, b, hidden }
    }

    fn forward(&self, xs: &[Array1<f64>]) -> (Vec<Array1<f64>>, Vec<StepTape>) {
        let hsz = self.hidden;
        let mut h = Array1::<f64>::zeros(hsz);
        let mut c = Array1::<f64>::zeros(hsz);
        let mut outputs = Vec::with_capacity(xs.len());
        let mut tape = Vec::with_capacity(xs.len());

        for x in xs {
            let gates = self.w_ih.dot(x) + self.w_hh.dot(&h) + &self.b;
            let i = gates.slice(s![0..hsz]).mapv(sigmoid);
            let f = gates.slice(s![hsz..2 * hsz]).mapv(sigmoid);
            let g = gates.slice(s![2 * hsz..3 * hsz]).mapv(f64::tanh);
            let o = gates.slice(s![3 * hsz..4 * hsz]).mapv(sigmoid);

            let c_next = &f * &c + &i * &g;
            let tanh_c = c_next.mapv(f64::tanh);
            let h_next = &o * &tanh_c;

            tape.push(StepTape {
                x: x.clone(),
                h_prev: h,
                c_prev: c,
                i,
                f,
                g,
                o,
                tanh_c,
            });
            outputs.push(h_next.clone());
            h = h_next;
            c = c_next;
        }

        (outputs, tape)
    }

    /// Backpropagate through the whole sequence. `dhs[t]` is the gradient
    /// flowing into h_t from above. Returns the gradient for each input x_t.
    fn backward(
        &self,
        tape: &[StepTape],
        dhs: &[Array1<f64>],
        grads: &mut LayerGrads,
    ) -> Vec<Array1<f64>> {
        let hsz = self.hidden;
        let mut dh_next = Array1::<f64>::zeros(hsz);
        let mut dc_next = Array1::<f64>::zeros(hsz);
        let mut dxs = vec![Array1::<f64>::zeros(0); tape.len()];

        for t in (0..tape.len()).rev() {
            let st = &tape[t];
            let dh = &dhs[t] + &dh_next;

            let d_o = &dh * &st.tanh_c * &st.o.mapv(|v| v * (1.0 - v));
            let dc = &dh * &st.o * &st.tanh_c.mapv(|v| 1.0 - v * v) + &dc_next;
            let d_i = &dc * &st.g * &st.i.mapv(|v| v * (1.0 - v));
            let d_f = &dc * &st.c_prev * &st.f.mapv(|v| v * (1.0 - v));
            let d_g = &dc * &st.i * &st.g.mapv(|v| 1.0 - v * v);

            let mut dgates = Array1::<f64>::zeros(4 * hsz);
            dgates.slice_mut(s![0..hsz]).assign(&d_i);
            dgates.slice_mut(s![hsz..2 * hsz]).assign(&d_f);
            dgates.slice_mut(s![2 * hsz..3 * hsz]).assign(&d_g);
            dgates.slice_mut(s![3 * hsz..4 * hsz]).assign(&d_o);

            let dg_col = dgates.view().insert_axis(Axis(1));
            grads.w_ih += &dg_col.dot(&st.x.view().insert_axis(Axis(0)));
            grads.w_hh += &dg_col.dot(&st.h_prev.view().insert_axis(Axis(0)));
            grads.b += &dgates;

            dxs[t] = self.w_ih.t().dot(&dgates);
            dh_next = self.w_hh.t().dot(&dgates);
            dc_next = &dc * &st.f;
        }

        dxs
    }
}

// ---------------------------------------------------------------------------
// Gradients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LayerGrads {
    w_ih: Array2<f64>,
    w_hh: Array2<f64>,
    b: Array1<f64>,
}

impl LayerGrads {
    fn zeros_like(layer: &LstmLayer) -> Self {
        Self {
            w_ih: Array2::zeros(layer.w_ih.raw_dim()),
            w_hh: Array2::zeros(layer.w_hh.raw_dim()),
            b: Array1::zeros(layer.b.raw_dim()),
        }
    }
}

/// Gradient (or Adam moment) buffers shaped like a [`RecurrentRegressor`].
#[derive(Debug, Clone)]
pub struct Gradients {
    layers: Vec<LayerGrads>,
    w_out: Array1<f64>,
    b_out: f64,
}

impl Gradients {
    pub fn zeros_like(model: &RecurrentRegressor) -> Self {
        Self {
            layers: model.layers.iter().map(LayerGrads::zeros_like).collect(),
            w_out: Array1::zeros(model.w_out.raw_dim()),
            b_out: 0.0,
        }
    }

    pub fn accumulate(&mut self, other: &Gradients) {
        for (a, b) in self.layers.iter_mut().zip(&other.layers) {
            a.w_ih += &b.w_ih;
            a.w_hh += &b.w_hh;
            a.b += &b.b;
        }
        self.w_out += &other.w_out;
        self.b_out += other.b_out;
    }

    pub fn scale(&mut self, factor: f64) {
        for l in &mut self.layers {
            l.w_ih *= factor;
            l.w_hh *= factor;
            l.b *= factor;
        }
        self.w_out *= factor;
        self.b_out *= factor;
    }

    pub fn global_norm(&self) -> f64 {
        let mut sq = self.b_out * self.b_out + self.w_out.mapv(|v| v * v).sum();
        for l in &self.layers {
            sq += l.w_ih.mapv(|v| v * v).sum();
            sq += l.w_hh.mapv(|v| v * v).sum();
            sq += l.b.mapv(|v| v * v).sum();
        }
        sq.sqrt()
    }

    /// Rescale so the global L2 norm does not exceed `max_norm`.
    pub fn clip(&mut self, max_norm: f64) {
        let norm = self.global_norm();
        if norm > max_norm && norm.is_finite() {
            self.scale(max_norm / norm);
        }
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Stacked LSTM with a scalar linear head.
#[derive(Debug, Clone)]
pub struct RecurrentRegressor {
    layers: Vec<LstmLayer>,
    w_out: Array1<f64>,
    b_out: f64,
    dropout: f64,
}

impl RecurrentRegressor {
    pub fn new<R: Rng>(
        input_dim: usize,
        hidden_sizes: &[usize],
        dropout: f64,
        rng: &mut R,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden_sizes.len());
        let mut in_dim = input_dim;
        for &hidden in hidden_sizes {
            layers.push(LstmLayer::new(in_dim, hidden, rng));
            in_dim = hidden;
        }
        let bound = 1.0 / (in_dim as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let w_out = Array1::from_shape_fn(in_dim, |_| dist.sample(rng));
        Self {
            layers,
            w_out,
            b_out: 0.0,
            dropout: dropout.clamp(0.0, 0.9),
        }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn widths(&self) -> Vec<usize> {
        self.layers.iter().map(|l| l.hidden).collect()
    }

    fn to_inputs(window: &[f64]) -> Vec<Array1<f64>> {
        window.iter().map(|&v| Array1::from_elem(1, v)).collect()
    }

    /// Inference forward pass (no dropout).
    pub fn predict(&self, window: &[f64]) -> f64 {
        let mut seq = Self::to_inputs(window);
        for layer in &self.layers {
            seq = layer.forward(&seq).0;
        }
        match seq.last() {
            Some(h) => self.w_out.dot(h) + self.b_out,
            None => self.b_out,
        }
    }

    /// Huber loss for one (window, target) pair together with its gradients.
    /// Locked dropout masks are drawn once per sequence between layers.
    pub fn loss_and_grads<R: Rng>(
        &self,
        window: &[f64],
        target: f64,
        delta: f64,
        rng: &mut R,
    ) -> (f64, Gradients) {
        let keep = 1.0 - self.dropout;
        let n_layers = self.layers.len();
        let mut grads = Gradients::zeros_like(self);

        let mut seq = Self::to_inputs(window);
        let mut tapes = Vec::with_capacity(n_layers);
        let mut masks: Vec<Option<Array1<f64>>> = Vec::with_capacity(n_layers);

        for (idx, layer) in self.layers.iter().enumerate() {
            let (mut outputs, tape) = layer.forward(&seq);
            tapes.push(tape);
            let mask = if idx + 1 < n_layers && self.dropout > 0.0 {
                let m = Array1::from_shape_fn(layer.hidden, |_| {
                    if rng.gen::<f64>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                });
                for h in &mut outputs {
                    *h *= &m;
                }
                Some(m)
            } else {
                None
            };
            masks.push(mask);
            seq = outputs;
        }

        let h_last = match seq.last() {
            Some(h) => h.clone(),
            None => return (0.0, grads),
        };
        let pred = self.w_out.dot(&h_last) + self.b_out;
        let residual = pred - target;
        let loss = huber(residual, delta);
        let dpred = huber_grad(residual, delta);

        grads.w_out = &h_last * dpred;
        grads.b_out = dpred;

        let steps = window.len();
        let mut dhs = vec![Array1::<f64>::zeros(self.w_out.len()); steps];
        dhs[steps - 1] = &self.w_out * dpred;

        for idx in (0..n_layers).rev() {
            let layer = &self.layers[idx];
            let dxs = layer.backward(&tapes[idx], &dhs, &mut grads.layers[idx]);
            if idx == 0 {
                break;
            }
            dhs = match &masks[idx - 1] {
                Some(m) => dxs.into_iter().map(|dx| dx * m).collect(),
                None => dxs,
            };
        }

        (loss, grads)
    }
}

// ---------------------------------------------------------------------------
// Optimiser
// ---------------------------------------------------------------------------

fn adam_update<D: Dimension>(
    w: &mut ndarray::Array<f64, D>,
    m: &mut ndarray::Array<f64, D>,
    v: &mut ndarray::Array<f64, D>,
    g: &ndarray::Array<f64, D>,
    lr_t: f64,
) {
    Zip::from(w).and(m).and(v).and(g).for_each(|w, m, v, &g| {
        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
        *w -= lr_t * *m / (v.sqrt() + ADAM_EPS);
    });
}

/// Adam with bias-corrected step size.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    step: i32,
    m: Gradients,
    v: Gradients,
}

impl Adam {
    pub fn new(model: &RecurrentRegressor, lr: f64) -> Self {
        Self {
            lr,
            step: 0,
            m: Gradients::zeros_like(model),
            v: Gradients::zeros_like(model),
        }
    }

    pub fn step(&mut self, model: &mut RecurrentRegressor, grads: &Gradients) {
        self.step += 1;
        let lr_t = self.lr * (1.0 - ADAM_BETA2.powi(self.step)).sqrt()
            / (1.0 - ADAM_BETA1.powi(self.step));

        for (idx, layer) in model.layers.iter_mut().enumerate() {
            let (m, v, g) = (&mut self.m.layers[idx], &mut self.v.layers[idx], &grads.layers[idx]);
            adam_update(&mut layer.w_ih, &mut m.w_ih, &mut v.w_ih, &g.w_ih, lr_t);
            adam_update(&mut layer.w_hh, &mut m.w_hh, &mut v.w_hh, &g.w_hh, lr_t);
            adam_update(&mut layer.b, &mut m.b, &mut v.b, &g.b, lr_t);
        }
        adam_update(&mut model.w_out, &mut self.m.w_out, &mut self.v.w_out, &grads.w_out, lr_t);

        let g = grads.b_out;
        self.m.b_out = ADAM_BETA1 * self.m.b_out + (1.0 - ADAM_BETA1) * g;
        self.v.b_out = ADAM_BETA2 * self.v.b_out + (1.0 - ADAM_BETA2) * g * g;
        model.b_out -= lr_t * self.m.b_out / (self.v.b_out.sqrt() + ADAM_EPS);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
