use std::{f32::consts::PI, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// The shape of the learning rate curve over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrMode {
    Cos,
    WarmCos,
    YoloxWarmCos,
    MultiStep,
}

impl FromStr for LrMode {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cos" => Ok(Self::Cos),
            "warmcos" => Ok(Self::WarmCos),
            "yoloxwarmcos" => Ok(Self::YoloxWarmCos),
            "multistep" => Ok(Self::MultiStep),
            other => Err(MlErr::UnknownScheduler(other.to_string())),
        }
    }
}

impl fmt::Display for LrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cos => "cos",
            Self::WarmCos => "warmcos",
            Self::YoloxWarmCos => "yoloxwarmcos",
            Self::MultiStep => "multistep",
        };
        f.write_str(name)
    }
}

/// Extra knobs, each mode reads only the ones it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct LrOptions {
    pub warmup_epochs: usize,
    pub warmup_lr_start: f32,
    pub no_aug_epochs: usize,
    pub min_lr_ratio: f32,
    /// Epochs at which `multistep` decays the learning rate.
    pub milestones: Vec<usize>,
    pub gamma: f32,
}

impl Default for LrOptions {
    fn default() -> Self {
        Self {
            warmup_epochs: 5,
            warmup_lr_start: 1e-6,
            no_aug_epochs: 15,
            min_lr_ratio: 0.2,
            milestones: Vec::new(),
            gamma: 0.1,
        }
    }
}

/// Maps a global iteration number to a learning rate.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    mode: LrMode,
    lr: f32,
    total_iters: usize,
    warmup_iters: usize,
    no_aug_iters: usize,
    warmup_lr_start: f32,
    min_lr_ratio: f32,
    milestones: Vec<usize>,
    gamma: f32,
}

impl LrScheduler {
    /// Creates a new `LrScheduler`.
    ///
    /// # Arguments
    /// * `mode` - The curve to follow.
    /// * `lr` - The peak learning rate.
    /// * `iters_per_epoch` - The amount of iterations in an epoch.
    /// * `total_epochs` - The length of the run.
    /// * `options` - Mode specific knobs.
    ///
    /// # Returns
    /// A new scheduler or an error if the warmup and no-augmentation phases leave no room
    /// for the main schedule.
    pub fn new(
        mode: LrMode,
        lr: f32,
        iters_per_epoch: usize,
        total_epochs: usize,
        options: LrOptions,
    ) -> Result<Self> {
        if iters_per_epoch == 0 || total_epochs == 0 {
            return Err(MlErr::InvalidConfig(
                "a schedule needs at least one epoch of one iteration".into(),
            ));
        }

        let total_iters = iters_per_epoch * total_epochs;
        let warmup_iters = iters_per_epoch * options.warmup_epochs;
        let no_aug_iters = iters_per_epoch * options.no_aug_epochs;

        let main_iters = match mode {
            LrMode::Cos | LrMode::MultiStep => total_iters,
            LrMode::WarmCos => total_iters.saturating_sub(warmup_iters),
            LrMode::YoloxWarmCos => total_iters.saturating_sub(warmup_iters + no_aug_iters),
        };

        if main_iters == 0 {
            return Err(MlErr::InvalidConfig(format!(
                "{mode}: warmup ({}) and no-aug ({}) epochs cover the whole run ({total_epochs})",
                options.warmup_epochs, options.no_aug_epochs
            )));
        }

        let milestones = options
            .milestones
            .iter()
            .map(|&epoch| epoch * iters_per_epoch)
            .collect();

        Ok(Self {
            mode,
            lr,
            total_iters,
            warmup_iters,
            no_aug_iters,
            warmup_lr_start: options.warmup_lr_start,
            min_lr_ratio: options.min_lr_ratio,
            milestones,
            gamma: options.gamma,
        })
    }

    #[inline]
    pub fn mode(&self) -> LrMode {
        self.mode
    }

    #[inline]
    pub fn total_iters(&self) -> usize {
        self.total_iters
    }

    /// Returns the learning rate for the `iters`-th iteration of the run.
    pub fn update_lr(&self, iters: usize) -> f32 {
        match self.mode {
            LrMode::Cos => self.cos(iters),
            LrMode::WarmCos => self.warm_cos(iters),
            LrMode::YoloxWarmCos => self.yolox_warm_cos(iters),
            LrMode::MultiStep => self.multistep(iters),
        }
    }

    fn cos(&self, iters: usize) -> f32 {
        let progress = iters as f32 / self.total_iters as f32;
        self.lr * 0.5 * (1.0 + (PI * progress).cos())
    }

    fn warm_cos(&self, iters: usize) -> f32 {
        if iters <= self.warmup_iters && self.warmup_iters > 0 {
            let progress = iters as f32 / self.warmup_iters as f32;
            return (self.lr - self.warmup_lr_start) * progress + self.warmup_lr_start;
        }

        let progress = (iters - self.warmup_iters) as f32
            / (self.total_iters - self.warmup_iters) as f32;
        self.lr * 0.5 * (1.0 + (PI * progress).cos())
    }

    fn yolox_warm_cos(&self, iters: usize) -> f32 {
        let min_lr = self.lr * self.min_lr_ratio;

        if iters <= self.warmup_iters && self.warmup_iters > 0 {
            let progress = iters as f32 / self.warmup_iters as f32;
            return (self.lr - self.warmup_lr_start) * progress.powi(2) + self.warmup_lr_start;
        }

        if iters >= self.total_iters - self.no_aug_iters {
            return min_lr;
        }

        let progress = (iters - self.warmup_iters) as f32
            / (self.total_iters - self.warmup_iters - self.no_aug_iters) as f32;
        min_lr + 0.5 * (self.lr - min_lr) * (1.0 + (PI * progress).cos())
    }

    fn multistep(&self, iters: usize) -> f32 {
        let passed = self.milestones.iter().filter(|&&m| iters >= m).count();
        self.lr * self.gamma.powi(passed as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.0)
    }

    fn yolox(lr: f32) -> LrScheduler {
        let options = LrOptions {
            warmup_epochs: 2,
            warmup_lr_start: 0.0,
            no_aug_epochs: 3,
            min_lr_ratio: 0.05,
            ..Default::default()
        };
        LrScheduler::new(LrMode::YoloxWarmCos, lr, 10, 20, options).unwrap()
    }

    #[test]
    fn yolox_warmup_is_quadratic() {
        let s = yolox(1.0);
        assert!(close(s.update_lr(0), 0.0));
        assert!(close(s.update_lr(10), 0.25));
        assert!(close(s.update_lr(20), 1.0));
    }

    #[test]
    fn yolox_ends_on_a_min_lr_plateau() {
        let s = yolox(1.0);
        assert!(close(s.update_lr(170), 0.05));
        assert!(close(s.update_lr(199), 0.05));

        // Half way through the cosine part.
        let mid = 20 + (170 - 20) / 2;
        assert!(close(s.update_lr(mid), 0.05 + 0.5 * 0.95));
    }

    #[test]
    fn warm_cos_warms_up_linearly() {
        let options = LrOptions {
            warmup_epochs: 1,
            warmup_lr_start: 0.1,
            ..Default::default()
        };
        let s = LrScheduler::new(LrMode::WarmCos, 1.0, 10, 10, options).unwrap();
        assert!(close(s.update_lr(5), 0.55));
        assert!(close(s.update_lr(10), 1.0));
        assert!(close(s.update_lr(100), 0.0));
    }

    #[test]
    fn cos_halves_at_midpoint() {
        let s = LrScheduler::new(LrMode::Cos, 2.0, 10, 10, LrOptions::default()).unwrap();
        assert!(close(s.update_lr(0), 2.0));
        assert!(close(s.update_lr(50), 1.0));
    }

    #[test]
    fn multistep_decays_at_milestones() {
        let options = LrOptions {
            milestones: vec![2, 4],
            gamma: 0.5,
            ..Default::default()
        };
        let s = LrScheduler::new(LrMode::MultiStep, 1.0, 10, 6, options).unwrap();
        assert!(close(s.update_lr(19), 1.0));
        assert!(close(s.update_lr(20), 0.5));
        assert!(close(s.update_lr(45), 0.25));
    }

    #[test]
    fn names_parse() {
        assert_eq!("yoloxwarmcos".parse::<LrMode>().unwrap(), LrMode::YoloxWarmCos);
        assert!(matches!(
            "linear".parse::<LrMode>(),
            Err(MlErr::UnknownScheduler(_))
        ));
    }

    #[test]
    fn phases_covering_the_run_are_rejected() {
        let options = LrOptions {
            warmup_epochs: 5,
            no_aug_epochs: 5,
            ..Default::default()
        };
        assert!(LrScheduler::new(LrMode::YoloxWarmCos, 1.0, 10, 10, options).is_err());
    }
}
