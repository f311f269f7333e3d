use ndarray::ArrayD;

use crate::{
    MlErr, Result,
    model::{ParamId, ParamStore},
};

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Updates the tensors of `store` using their accumulated gradients.
    ///
    /// # Arguments
    /// * `store` - The model's tensors.
    /// * `grads` - The gradient of every tensor in `store`.
    ///
    /// # Returns
    /// An error if a gradient doesn't match the shape of its tensor.
    fn step(&mut self, store: &mut ParamStore, grads: &Gradients) -> Result<()>;

    /// Sets the learning rate of every parameter group.
    fn set_lr(&mut self, lr: f32);
}

/// One gradient buffer per tensor of a `ParamStore`, same order and shapes.
#[derive(Debug, Clone)]
pub struct Gradients {
    grads: Vec<ArrayD<f32>>,
}

impl Gradients {
    pub fn zeros_like(store: &ParamStore) -> Self {
        Self {
            grads: store
                .iter()
                .map(|(_, p)| ArrayD::zeros(p.value().raw_dim()))
                .collect(),
        }
    }

    #[inline]
    pub fn get(&self, id: ParamId) -> Option<&ArrayD<f32>> {
        self.grads.get(id.index())
    }

    pub fn get_mut(&mut self, id: ParamId) -> Result<&mut ArrayD<f32>> {
        self.grads
            .get_mut(id.index())
            .ok_or(MlErr::UnknownParam { id: id.index() })
    }

    pub fn zero(&mut self) {
        for grad in &mut self.grads {
            grad.fill(0.0);
        }
    }
}
