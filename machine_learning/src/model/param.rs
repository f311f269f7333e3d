use ndarray::ArrayD;

use crate::{MlErr, Result};

/// What a tensor is for, declared by the layer that creates it.
///
/// Optimizer grouping is driven by this tag alone, never by the tensor's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    /// Scale of a normalization layer, trained without weight decay.
    NormWeight,
    /// Any other multiplicative weight, trained with weight decay.
    Weight,
    /// Additive offsets, including those of normalization layers.
    Bias,
    /// Non-trainable state such as batch norm running statistics.
    Buffer,
}

impl ParamRole {
    #[inline]
    pub fn is_trainable(self) -> bool {
        !matches!(self, ParamRole::Buffer)
    }
}

/// An opaque handle to a tensor in a `ParamStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

impl ParamId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A named tensor together with its declared role.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    role: ParamRole,
    value: ArrayD<f32>,
}

impl Param {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> ParamRole {
        self.role
    }

    #[inline]
    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    #[inline]
    pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.value
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

/// Owns every tensor of a model in registration order.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<Param>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new tensor.
    ///
    /// # Arguments
    /// * `name` - A dotted path identifying the tensor within the model.
    /// * `role` - What the tensor is used for.
    /// * `value` - The initial value.
    ///
    /// # Returns
    /// The handle of the new tensor.
    pub fn register(&mut self, name: impl Into<String>, role: ParamRole, value: ArrayD<f32>) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(Param {
            name: name.into(),
            role,
            value,
        });
        id
    }

    pub fn get(&self, id: ParamId) -> Result<&Param> {
        self.params
            .get(id.0)
            .ok_or(MlErr::UnknownParam { id: id.0 })
    }

    pub fn get_mut(&mut self, id: ParamId) -> Result<&mut Param> {
        self.params
            .get_mut(id.0)
            .ok_or(MlErr::UnknownParam { id: id.0 })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Param)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamId, &mut Param)> {
        self.params
            .iter_mut()
            .enumerate()
            .map(|(i, p)| (ParamId(i), p))
    }

    /// Iterates over the tensors an optimizer should update.
    pub fn trainable(&self) -> impl Iterator<Item = (ParamId, &Param)> {
        self.iter().filter(|(_, p)| p.role.is_trainable())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Returns the amount of trainable scalars.
    pub fn numel(&self) -> usize {
        self.trainable().map(|(_, p)| p.numel()).sum()
    }
}
