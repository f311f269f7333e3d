use ndarray::{ArrayD, Zip};

use super::ParamStore;
use crate::{MlErr, Result};

/// Exponential moving average of every tensor of a model, buffers included.
///
/// The effective decay ramps up from zero as `decay * (1 - exp(-updates / 2000))` so early
/// updates follow the live weights closely.
#[derive(Debug, Clone)]
pub struct ModelEma {
    shadow: Vec<ArrayD<f32>>,
    decay: f32,
    updates: u64,
}

impl ModelEma {
    pub const DEFAULT_DECAY: f32 = 0.9998;
    const RAMP: f32 = 2000.0;

    /// Creates a new `ModelEma` starting from the current values of `store`.
    ///
    /// # Arguments
    /// * `store` - The tensors to follow.
    /// * `decay` - The asymptotic decay.
    /// * `updates` - The amount of updates already performed, for resumed runs.
    pub fn new(store: &ParamStore, decay: f32, updates: u64) -> Self {
        Self {
            shadow: store.iter().map(|(_, p)| p.value().clone()).collect(),
            decay,
            updates,
        }
    }

    #[inline]
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Returns the decay the next update will use.
    pub fn current_decay(&self) -> f32 {
        let x = (self.updates + 1) as f32;
        self.decay * (1.0 - (-x / Self::RAMP).exp())
    }

    /// Blends the live values of `store` into the average.
    ///
    /// # Returns
    /// An error if `store` doesn't have the layout this average was created from.
    pub fn update(&mut self, store: &ParamStore) -> Result<()> {
        if store.len() != self.shadow.len() {
            return Err(MlErr::SizeMismatch {
                what: "ema tensors",
                got: store.len(),
                expected: self.shadow.len(),
            });
        }

        let d = self.current_decay();
        self.updates += 1;

        for (shadow, (_, param)) in self.shadow.iter_mut().zip(store.iter()) {
            if shadow.shape() != param.value().shape() {
                return Err(MlErr::ShapeMismatch {
                    what: "ema tensor",
                    got: param.value().shape().to_vec(),
                    expected: shadow.shape().to_vec(),
                });
            }

            Zip::from(shadow)
                .and(param.value())
                .for_each(|s, &p| *s = d * *s + (1.0 - d) * p);
        }

        Ok(())
    }

    /// Writes the averaged values into `store`, typically a copy used for evaluation.
    pub fn copy_to(&self, store: &mut ParamStore) -> Result<()> {
        if store.len() != self.shadow.len() {
            return Err(MlErr::SizeMismatch {
                what: "ema tensors",
                got: store.len(),
                expected: self.shadow.len(),
            });
        }

        for (shadow, (_, param)) in self.shadow.iter().zip(store.iter_mut()) {
            param.value_mut().assign(shadow);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::IxDyn;

    use super::*;
    use crate::model::ParamRole;

    fn store(value: f32) -> ParamStore {
        let mut store = ParamStore::new();
        store.register("w", ParamRole::Weight, ArrayD::from_elem(IxDyn(&[2]), value));
        store
    }

    #[test]
    fn first_updates_track_the_live_weights() {
        let mut ema = ModelEma::new(&store(0.0), ModelEma::DEFAULT_DECAY, 0);
        ema.update(&store(1.0)).unwrap();

        let mut out = store(5.0);
        ema.copy_to(&mut out).unwrap();

        let v = out.iter().next().unwrap().1.value()[[0]];
        assert!(v > 0.99, "got {v}");
        assert_eq!(ema.updates(), 1);
    }

    #[test]
    fn decay_ramps_up_towards_its_limit() {
        let early = ModelEma::new(&store(0.0), 0.9998, 0).current_decay();
        let late = ModelEma::new(&store(0.0), 0.9998, 100_000).current_decay();
        assert!(early < 0.01);
        assert!((late - 0.9998).abs() < 1e-4);
    }

    #[test]
    fn layout_changes_are_rejected() {
        let mut ema = ModelEma::new(&store(0.0), 0.9, 0);
        assert!(ema.update(&ParamStore::new()).is_err());
    }
}
