use std::{fmt, str::FromStr};

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use super::{ParamId, ParamRole, ParamStore};
use crate::{MlErr, Result};

/// The non-linearity applied after each convolution block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Silu,
    Relu,
    Lrelu,
}

impl FromStr for Activation {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "silu" => Ok(Self::Silu),
            "relu" => Ok(Self::Relu),
            "lrelu" => Ok(Self::Lrelu),
            other => Err(MlErr::UnknownActivation(other.to_string())),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Silu => "silu",
            Self::Relu => "relu",
            Self::Lrelu => "lrelu",
        };
        f.write_str(name)
    }
}

/// Index of a batch norm inside a model's norm registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormId(usize);

impl NormId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A 2D batch normalization: its tensors plus the running-statistics settings.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub weight: ParamId,
    pub bias: ParamId,
    pub running_mean: ParamId,
    pub running_var: ParamId,
    pub eps: f32,
    pub momentum: f32,
}

/// A 2D convolution.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: ParamId,
    pub bias: Option<ParamId>,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
}

/// Convolution, batch norm and activation.
#[derive(Debug, Clone)]
pub struct BaseConv {
    pub conv: Conv2d,
    pub bn: NormId,
    pub act: Activation,
}

/// Registers layer tensors into a store while keeping track of every batch norm created.
pub struct LayerBuilder<'a, R: Rng> {
    store: &'a mut ParamStore,
    norms: &'a mut Vec<BatchNorm>,
    rng: &'a mut R,
}

impl<'a, R: Rng> LayerBuilder<'a, R> {
    /// Creates a new `LayerBuilder`.
    ///
    /// # Arguments
    /// * `store` - Where the tensors get registered.
    /// * `norms` - Where the batch norms get registered.
    /// * `rng` - The random source for weight initialization.
    pub fn new(store: &'a mut ParamStore, norms: &'a mut Vec<BatchNorm>, rng: &'a mut R) -> Self {
        Self { store, norms, rng }
    }

    /// Registers a convolution whose weights are drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    ///
    /// # Arguments
    /// * `prefix` - The name of the layer.
    /// * `in_channels`, `out_channels`, `kernel`, `stride` - The convolution's geometry.
    /// * `bias` - Whether the convolution has an additive bias.
    ///
    /// # Returns
    /// The new layer or an error if any of the channel counts is zero.
    pub fn conv2d(
        &mut self,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        bias: bool,
    ) -> Result<Conv2d> {
        if in_channels == 0 || out_channels == 0 {
            return Err(MlErr::InvalidConfig(format!(
                "{prefix}: a convolution needs non-zero channels, got {in_channels} -> {out_channels}"
            )));
        }

        let fan_in = in_channels * kernel * kernel;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound)
            .map_err(|e| MlErr::InvalidConfig(format!("{prefix}: {e}")))?;

        let shape = [out_channels, in_channels, kernel, kernel];
        let values = (0..shape.iter().product::<usize>())
            .map(|_| dist.sample(&mut *self.rng))
            .collect();
        let weight = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| {
            MlErr::InvalidConfig(format!("{prefix}: invalid weight shape {shape:?}"))
        })?;

        let weight = self
            .store
            .register(format!("{prefix}.weight"), ParamRole::Weight, weight);

        let bias = if bias {
            let values = (0..out_channels)
                .map(|_| dist.sample(&mut *self.rng))
                .collect();
            let value = ArrayD::from_shape_vec(IxDyn(&[out_channels]), values).map_err(|_| {
                MlErr::InvalidConfig(format!("{prefix}: invalid bias shape [{out_channels}]"))
            })?;
            Some(
                self.store
                    .register(format!("{prefix}.bias"), ParamRole::Bias, value),
            )
        } else {
            None
        };

        Ok(Conv2d {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel,
            stride,
        })
    }

    /// Registers a batch norm with the usual defaults (`eps = 1e-5`, `momentum = 0.1`).
    pub fn batch_norm(&mut self, prefix: &str, channels: usize) -> NormId {
        let ones = || ArrayD::ones(IxDyn(&[channels]));
        let zeros = || ArrayD::zeros(IxDyn(&[channels]));

        let norm = BatchNorm {
            weight: self
                .store
                .register(format!("{prefix}.weight"), ParamRole::NormWeight, ones()),
            bias: self
                .store
                .register(format!("{prefix}.bias"), ParamRole::Bias, zeros()),
            running_mean: self
                .store
                .register(format!("{prefix}.running_mean"), ParamRole::Buffer, zeros()),
            running_var: self
                .store
                .register(format!("{prefix}.running_var"), ParamRole::Buffer, ones()),
            eps: 1e-5,
            momentum: 0.1,
        };

        self.norms.push(norm);
        NormId(self.norms.len() - 1)
    }

    /// Registers a bias-free convolution followed by a batch norm.
    pub fn base_conv(
        &mut self,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        act: Activation,
    ) -> Result<BaseConv> {
        let conv = self.conv2d(
            &format!("{prefix}.conv"),
            in_channels,
            out_channels,
            kernel,
            stride,
            false,
        )?;
        let bn = self.batch_norm(&format!("{prefix}.bn"), out_channels);
        Ok(BaseConv { conv, bn, act })
    }
}
