//! Dense value network (CPU-only).
//!
//! Small MLPs serialized as JSON, with the single-output regression
//! backprop the TD learner needs. Shapes are validated on load so a bad
//! policy file fails fast instead of producing garbage Q-values.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
        }
    }

    /// Derivative expressed through the activation output
    fn derivative(self, y: f64) -> f64 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// Weights shape: [out_dim][in_dim]
    pub weights: Vec<Vec<f64>>,
    /// Bias shape: [out_dim]
    pub bias: Vec<f64>,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseLayer {
    fn in_dim(&self) -> usize {
        self.weights.first().map(|r| r.len()).unwrap_or(0)
    }

    fn out_dim(&self) -> usize {
        self.weights.len()
    }

    fn zeroed(in_dim: usize, out_dim: usize, activation: Activation) -> Self {
        Self {
            weights: vec![vec![0.0; in_dim]; out_dim],
            bias: vec![0.0; out_dim],
            activation,
        }
    }

    fn random<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        // Uniform with variance 1/in_dim
        let limit = (3.0 / in_dim.max(1) as f64).sqrt();
        let bias = if activation == Activation::Relu { 0.1 } else { 0.0 };
        Self {
            weights: (0..out_dim)
                .map(|_| (0..in_dim).map(|_| rng.gen_range(-limit..=limit)).collect())
                .collect(),
            bias: vec![bias; out_dim],
            activation,
        }
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| {
                let sum = row.iter().zip(x).fold(*b, |acc, (w, xi)| acc + w * xi);
                self.activation.apply(sum)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseNetwork {
    /// Expected input dimension.
    pub input_dim: usize,
    pub layers: Vec<DenseLayer>,
}

/// Accumulated gradients, shaped like the network layers
#[derive(Debug, Clone)]
pub struct Gradients {
    weights: Vec<Vec<Vec<f64>>>,
    bias: Vec<Vec<f64>>,
    samples: usize,
}

impl Gradients {
    pub fn samples(&self) -> usize {
        self.samples
    }
}

impl DenseNetwork {
    /// ReLU MLP with a linear regression head
    pub fn mlp<R: Rng + ?Sized>(
        input_dim: usize,
        hidden: &[usize],
        output_dim: usize,
        rng: &mut R,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut in_dim = input_dim;
        for &width in hidden {
            layers.push(DenseLayer::random(in_dim, width, Activation::Relu, rng));
            in_dim = width;
        }
        layers.push(DenseLayer::random(in_dim, output_dim, Activation::Linear, rng));
        Self { input_dim, layers }
    }

    /// Same shape as [`DenseNetwork::mlp`] with every parameter at zero
    pub fn zeroed(input_dim: usize, hidden: &[usize], output_dim: usize) -> Self {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut in_dim = input_dim;
        for &width in hidden {
            layers.push(DenseLayer::zeroed(in_dim, width, Activation::Relu));
            in_dim = width;
        }
        layers.push(DenseLayer::zeroed(in_dim, output_dim, Activation::Linear));
        Self { input_dim, layers }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.input_dim == 0 {
            return Err("input_dim must be > 0".to_string());
        }
        if self.layers.is_empty() {
            return Err("layers must not be empty".to_string());
        }

        let mut expected_in = self.input_dim;
        for (idx, layer) in self.layers.iter().enumerate() {
            if layer.out_dim() == 0 {
                return Err(format!("layer[{idx}] out_dim must be > 0"));
            }
            if layer.bias.len() != layer.out_dim() {
                return Err(format!(
                    "layer[{idx}] bias len {} != out_dim {}",
                    layer.bias.len(),
                    layer.out_dim()
                ));
            }
            for (r, row) in layer.weights.iter().enumerate() {
                if row.len() != expected_in {
                    return Err(format!(
                        "layer[{idx}] weights row {r} len {} != expected in_dim {expected_in}",
                        row.len()
                    ));
                }
                if row.iter().any(|v| !v.is_finite()) {
                    return Err(format!("layer[{idx}] weights contain non-finite values"));
                }
            }
            if layer.bias.iter().any(|v| !v.is_finite()) {
                return Err(format!("layer[{idx}] bias contain non-finite values"));
            }
            expected_in = layer.out_dim();
        }
        Ok(())
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map(|l| l.out_dim()).unwrap_or(0)
    }

    pub fn forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.check_input(input)?;
        let mut x = input.to_vec();
        for layer in &self.layers {
            x = layer.forward(&x);
        }
        Ok(x)
    }

    pub fn zero_gradients(&self) -> Gradients {
        Gradients {
            weights: self
                .layers
                .iter()
                .map(|l| vec![vec![0.0; l.in_dim()]; l.out_dim()])
                .collect(),
            bias: self.layers.iter().map(|l| vec![0.0; l.out_dim()]).collect(),
            samples: 0,
        }
    }

    /// Backprop `0.5 * (y[dim] - target)^2` into `grads`, returning the loss.
    /// Outputs other than `dim` receive no gradient.
    pub fn accumulate_gradient(
        &self,
        input: &[f64],
        dim: usize,
        target: f64,
        grads: &mut Gradients,
    ) -> Result<f64> {
        self.check_input(input)?;
        if dim >= self.output_dim() {
            return Err(ParleyError::Brain(format!(
                "regression dim {dim} out of range for output_dim {}",
                self.output_dim()
            )));
        }

        // activations[0] is the input, activations[i + 1] the output of layer i
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.to_vec());
        for layer in &self.layers {
            let next = layer.forward(activations.last().map(Vec::as_slice).unwrap_or(&[]));
            activations.push(next);
        }

        let output = &activations[self.layers.len()];
        let dy = output[dim] - target;
        let mut upstream = vec![0.0; output.len()];
        upstream[dim] = dy;

        for (idx, layer) in self.layers.iter().enumerate().rev() {
            let out = &activations[idx + 1];
            let x_in = &activations[idx];
            let delta: Vec<f64> = upstream
                .iter()
                .zip(out)
                .map(|(g, y)| g * layer.activation.derivative(*y))
                .collect();

            let mut downstream = vec![0.0; layer.in_dim()];
            for (o, d) in delta.iter().enumerate() {
                if *d == 0.0 {
                    continue;
                }
                grads.bias[idx][o] += d;
                let row = &layer.weights[o];
                let grow = &mut grads.weights[idx][o];
                for i in 0..x_in.len() {
                    grow[i] += d * x_in[i];
                    downstream[i] += d * row[i];
                }
            }
            upstream = downstream;
        }

        grads.samples += 1;
        Ok(0.5 * dy * dy)
    }

    /// SGD step averaged over the accumulated samples; L2 decay on weights only
    pub fn apply_gradients(&mut self, grads: &Gradients, learning_rate: f64, l2_decay: f64) {
        if grads.samples == 0 {
            return;
        }
        let n = grads.samples as f64;
        for (idx, layer) in self.layers.iter_mut().enumerate() {
            for (o, row) in layer.weights.iter_mut().enumerate() {
                for (i, w) in row.iter_mut().enumerate() {
                    let g = (grads.weights[idx][o][i] + l2_decay * *w) / n;
                    *w -= learning_rate * g;
                }
            }
            for (o, b) in layer.bias.iter_mut().enumerate() {
                *b -= learning_rate * grads.bias[idx][o] / n;
            }
        }
    }

    fn check_input(&self, input: &[f64]) -> Result<()> {
        if input.len() != self.input_dim {
            return Err(ParleyError::Brain(format!(
                "DenseNetwork input dim mismatch: got {}, expected {}",
                input.len(),
                self.input_dim
            )));
        }
        Ok(())
    }
}
