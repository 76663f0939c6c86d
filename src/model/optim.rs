use serde::{Deserialize, Serialize};
use tracing::debug;

use super::params::Parameter;
use crate::types::{KgError, Result};

/// First-order update rule settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    /// Step size.
    pub lr: f32,
    /// Adam when true, plain gradient descent otherwise.
    pub use_adam: bool,
    /// First-moment decay.
    pub beta1: f32,
    /// Second-moment decay.
    pub beta2: f32,
    /// Denominator floor.
    pub eps: f32,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 0.001,
            use_adam: true,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// SGD or Adam over a flattened parameter list.
///
/// The optimizer does not hold the parameters; every call receives them in
/// the same order the moments were sized for.
#[derive(Clone, Debug)]
pub struct Optimizer {
    config: OptimConfig,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
    step: u64,
}

impl Optimizer {
    /// Sizes Adam moments after `params`; SGD keeps no state.
    pub fn new(config: OptimConfig, params: &[&Parameter]) -> Self {
        let (m, v) = if config.use_adam {
            let zeros: Vec<Vec<f32>> = params.iter().map(|p| vec![0.0; p.len()]).collect();
            (zeros.clone(), zeros)
        } else {
            (Vec::new(), Vec::new())
        };
        Self {
            config,
            m,
            v,
            step: 0,
        }
    }

    /// Clears every gradient accumulator.
    pub fn zero_grad(params: &mut [&mut Parameter]) {
        for p in params.iter_mut() {
            p.zero_grad();
        }
    }

    /// Applies one update and increments the step counter.
    ///
    /// # Errors
    ///
    /// [`KgError::StateMismatch`] if Adam moments were sized for a different
    /// parameter list. Nothing is updated in that case.
    pub fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        let c = self.config;
        if !c.use_adam {
            self.step += 1;
            for p in params.iter_mut() {
                let p = &mut **p;
                for (x, g) in p.data.iter_mut().zip(&p.grad) {
                    *x -= c.lr * g;
                }
            }
            return Ok(());
        }

        self.check_shapes(params.iter().map(|p| p.len()))?;
        self.step += 1;
        let beta1t = c.beta1.powf(self.step as f32);
        let beta2t = c.beta2.powf(self.step as f32);
        for ((p, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            let p = &mut **p;
            for i in 0..p.data.len() {
                let g = p.grad[i];
                m[i] = c.beta1 * m[i] + (1.0 - c.beta1) * g;
                v[i] = c.beta2 * v[i] + (1.0 - c.beta2) * g * g;
                let m_hat = m[i] / (1.0 - beta1t);
                let v_hat = v[i] / (1.0 - beta2t);
                p.data[i] -= c.lr * m_hat / (v_hat.sqrt() + c.eps);
            }
        }
        Ok(())
    }

    fn check_shapes(&self, lens: impl ExactSizeIterator<Item = usize>) -> Result<()> {
        if lens.len() != self.m.len() {
            return Err(KgError::StateMismatch {
                expected: self.m.len(),
                found: lens.len(),
            });
        }
        for (len, m) in lens.zip(&self.m) {
            if len != m.len() {
                return Err(KgError::StateMismatch {
                    expected: m.len(),
                    found: len,
                });
            }
        }
        Ok(())
    }

    /// Restores Adam moments and the step counter.
    ///
    /// # Errors
    ///
    /// [`KgError::StateMismatch`] if the buffer count or any buffer length
    /// differs from the live moments; the optimizer is left unchanged. Under
    /// SGD the call only restores the step counter.
    pub fn set_state(&mut self, m: Vec<Vec<f32>>, v: Vec<Vec<f32>>, step: u64) -> Result<()> {
        if !self.config.use_adam {
            debug!(step, "sgd optimizer: ignoring moment state");
            self.step = step;
            return Ok(());
        }
        for buffers in [&m, &v] {
            self.check_shapes(buffers.iter().map(Vec::len))?;
        }
        self.m = m;
        self.v = v;
        self.step = step;
        Ok(())
    }

    /// First moments, one buffer per parameter.
    pub fn m(&self) -> &[Vec<f32>] {
        &self.m
    }

    /// Second moments, one buffer per parameter.
    pub fn v(&self) -> &[Vec<f32>] {
        &self.v
    }

    /// Number of `step` calls so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Whether moment buffers are kept.
    pub fn uses_adam(&self) -> bool {
        self.config.use_adam
    }

    /// Active settings.
    pub fn config(&self) -> &OptimConfig {
        &self.config
    }
}
