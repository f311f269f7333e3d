use std::collections::{HashMap, HashSet};

use ndarray::ArrayD;

use super::{Gradients, Optimizer};
use crate::{
    MlErr, Result,
    model::{ParamId, ParamStore},
};

/// The hyperparameters a group falls back to when it doesn't override them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub lr: f32,
    pub momentum: f32,
    pub nesterov: bool,
    pub weight_decay: f32,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            nesterov: false,
            weight_decay: 0.0,
        }
    }
}

/// Per-group overrides of the optimizer defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParamGroupOptions {
    pub lr: Option<f32>,
    pub momentum: Option<f32>,
    pub nesterov: Option<bool>,
    pub weight_decay: Option<f32>,
}

impl ParamGroupOptions {
    pub fn weight_decay(weight_decay: f32) -> Self {
        Self {
            weight_decay: Some(weight_decay),
            ..Default::default()
        }
    }
}

/// A set of tensors sharing the same update hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub params: Vec<ParamId>,
    pub lr: f32,
    pub momentum: f32,
    pub nesterov: bool,
    pub weight_decay: f32,
}

/// Stochastic gradient descent with optional (Nesterov) momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    defaults: SgdConfig,
    groups: Vec<ParamGroup>,
    velocity: HashMap<ParamId, ArrayD<f32>>,
    seen: HashSet<ParamId>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer with a first group made of `params`.
    ///
    /// # Arguments
    /// * `store` - The tensors the optimizer will update.
    /// * `params` - The tensors of the first group.
    /// * `defaults` - The hyperparameters of the first group and the fallback for the rest.
    ///
    /// # Returns
    /// A new `Sgd` instance, or an error if the hyperparameters are invalid.
    pub fn new(store: &ParamStore, params: Vec<ParamId>, defaults: SgdConfig) -> Result<Self> {
        let mut sgd = Self {
            defaults,
            groups: Vec::new(),
            velocity: HashMap::new(),
            seen: HashSet::new(),
        };

        sgd.add_param_group(store, params, ParamGroupOptions::default())?;
        Ok(sgd)
    }

    /// Adds a new group of tensors, unset options fall back to the optimizer defaults.
    ///
    /// # Returns
    /// An error if a tensor is unknown, not trainable or already part of another group, or
    /// if Nesterov momentum is requested without momentum.
    pub fn add_param_group(
        &mut self,
        store: &ParamStore,
        params: Vec<ParamId>,
        options: ParamGroupOptions,
    ) -> Result<()> {
        let group = ParamGroup {
            lr: options.lr.unwrap_or(self.defaults.lr),
            momentum: options.momentum.unwrap_or(self.defaults.momentum),
            nesterov: options.nesterov.unwrap_or(self.defaults.nesterov),
            weight_decay: options.weight_decay.unwrap_or(self.defaults.weight_decay),
            params,
        };

        if group.lr < 0.0 || group.momentum < 0.0 || group.weight_decay < 0.0 {
            return Err(MlErr::InvalidConfig(format!(
                "sgd hyperparameters must be non-negative, got lr {}, momentum {}, weight decay {}",
                group.lr, group.momentum, group.weight_decay
            )));
        }

        if group.nesterov && group.momentum == 0.0 {
            return Err(MlErr::InvalidConfig(
                "nesterov momentum requires a non-zero momentum".into(),
            ));
        }

        let mut ids = HashSet::with_capacity(group.params.len());
        for &id in &group.params {
            let param = store.get(id)?;

            if !param.role().is_trainable() {
                return Err(MlErr::InvalidConfig(format!(
                    "'{}' is not a trainable tensor",
                    param.name()
                )));
            }

            if self.seen.contains(&id) || !ids.insert(id) {
                return Err(MlErr::ParamInSeveralGroups {
                    name: param.name().to_string(),
                });
            }
        }

        self.seen.extend(ids);
        self.groups.push(group);
        Ok(())
    }

    #[inline]
    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    #[inline]
    pub fn defaults(&self) -> SgdConfig {
        self.defaults
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, store: &mut ParamStore, grads: &Gradients) -> Result<()> {
        for group in &self.groups {
            let &ParamGroup {
                lr,
                momentum: mu,
                nesterov,
                weight_decay: wd,
                ..
            } = group;

            for &id in &group.params {
                let Some(grad) = grads.get(id) else {
                    continue;
                };

                let p = store.get_mut(id)?.value_mut();
                if grad.shape() != p.shape() {
                    return Err(MlErr::ShapeMismatch {
                        what: "gradient",
                        got: grad.shape().to_vec(),
                        expected: p.shape().to_vec(),
                    });
                }

                let mut d_p = grad.clone();
                if wd != 0.0 {
                    d_p.scaled_add(wd, &*p);
                }

                if mu != 0.0 {
                    let buf = self
                        .velocity
                        .entry(id)
                        .and_modify(|buf| {
                            buf.mapv_inplace(|v| mu * v);
                            *buf += &d_p;
                        })
                        .or_insert_with(|| d_p.clone());

                    if nesterov {
                        d_p.scaled_add(mu, &*buf);
                    } else {
                        d_p.assign(&*buf);
                    }
                }

                p.scaled_add(-lr, &d_p);
            }
        }

        Ok(())
    }

    fn set_lr(&mut self, lr: f32) {
        for group in &mut self.groups {
            group.lr = lr;
        }
    }
}
