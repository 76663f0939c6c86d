use crate::primitives::XorShift128Plus;

/// A named float buffer and its same-length gradient accumulator.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    name: String,
    /// Current values.
    pub data: Vec<f32>,
    /// Accumulated gradient; reset only by [`Parameter::zero_grad`].
    pub grad: Vec<f32>,
}

impl Parameter {
    /// Zero-filled parameter of `len` elements.
    pub fn zeros(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            data: vec![0.0; len],
            grad: vec![0.0; len],
        }
    }

    /// Parameter with every element drawn as `(uniform - 0.5) * scale`, in
    /// index order from `rng`.
    pub fn uniform(
        name: impl Into<String>,
        len: usize,
        scale: f32,
        rng: &mut XorShift128Plus,
    ) -> Self {
        let mut p = Self::zeros(name, len);
        for x in &mut p.data {
            *x = (rng.uniform() - 0.5) * scale;
        }
        p
    }

    /// Name used in logs and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clears the gradient accumulator.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Replaces the values if `values` has the same length, clearing the
    /// gradient. Returns false and leaves the parameter untouched otherwise.
    pub fn assign(&mut self, values: &[f32]) -> bool {
        if values.len() != self.data.len() {
            return false;
        }
        self.data.copy_from_slice(values);
        self.zero_grad();
        true
    }
}
