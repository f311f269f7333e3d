use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use log::debug;
use machine_learning::{model::Activation, schedule::LrMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ExpErr, Result};

/// Every hyperparameter of an experiment.
///
/// Built from the defaults, optionally loaded from a JSON file, adjusted with `merge` and
/// then validated. The run only reads it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExpConfig {
    // model
    pub num_classes: usize,
    pub num_colors: usize,
    pub depth: f32,
    pub width: f32,
    pub act: Activation,

    // dataloader
    pub data_num_workers: usize,
    /// `(height, width)`.
    pub input_size: (usize, usize),
    /// Half width of the multiscale range, in multiples of 32.
    pub multiscale_range: usize,
    /// Explicit multiscale range in multiples of 32, wins over `multiscale_range`.
    pub random_size: Option<(usize, usize)>,
    pub data_dir: Option<PathBuf>,
    pub train_ann: String,
    pub val_ann: String,
    pub test_ann: String,

    // transform
    pub mosaic_prob: f32,
    pub mixup_prob: f32,
    pub hsv_prob: f32,
    pub gaussian_prob: f32,
    pub flip_prob: f32,
    pub degrees: f32,
    pub translate: f32,
    pub mosaic_scale: (f32, f32),
    pub enable_mixup: bool,
    pub mixup_scale: (f32, f32),
    pub shear: f32,
    pub perspective: f32,

    // training
    pub warmup_epochs: usize,
    pub max_epoch: usize,
    pub warmup_lr: f32,
    pub min_lr_ratio: f32,
    pub basic_lr_per_img: f32,
    pub scheduler: String,
    /// Epochs at which a `multistep` schedule decays.
    pub milestones: Vec<usize>,
    pub no_aug_epochs: usize,
    pub ema: bool,
    pub weight_decay: f32,
    pub momentum: f32,
    pub print_interval: usize,
    pub eval_interval: usize,
    pub seed: Option<u64>,
    pub exp_name: String,
    pub output_dir: PathBuf,

    // testing
    /// `(height, width)`.
    pub test_size: (usize, usize),
    pub test_conf: f32,
    pub nmsthre: f32,
}

impl Default for ExpConfig {
    fn default() -> Self {
        Self {
            num_classes: 8,
            num_colors: 3,
            depth: 1.0,
            width: 1.0,
            act: Activation::Silu,

            data_num_workers: 4,
            input_size: (512, 640),
            multiscale_range: 5,
            random_size: None,
            data_dir: None,
            train_ann: "instances_train2017.json".into(),
            val_ann: "instances_val2017.json".into(),
            test_ann: "image_info_test-dev2017.json".into(),

            mosaic_prob: 1.0,
            mixup_prob: 0.0,
            hsv_prob: 1.0,
            gaussian_prob: 0.3,
            flip_prob: 0.0,
            degrees: 15.0,
            translate: 1.0,
            mosaic_scale: (0.1, 2.0),
            enable_mixup: false,
            mixup_scale: (0.5, 1.5),
            shear: 1.0,
            perspective: 0.1,

            warmup_epochs: 15,
            max_epoch: 2000,
            warmup_lr: 5e-7,
            min_lr_ratio: 0.06,
            basic_lr_per_img: 5e-6,
            scheduler: "yoloxwarmcos".into(),
            milestones: Vec::new(),
            no_aug_epochs: 20,
            ema: true,
            weight_decay: 2e-4,
            momentum: 0.9,
            print_interval: 6,
            eval_interval: 5,
            seed: None,
            exp_name: "yolox_base".into(),
            output_dir: PathBuf::from("./YOLOX_outputs"),

            test_size: (512, 640),
            test_conf: 0.2,
            nmsthre: 0.3,
        }
    }
}

/// Turns a command line value into JSON shaped like the value it replaces.
fn coerce(current: &Value, raw: &str) -> Value {
    let trimmed = raw.trim();

    if trimmed.eq_ignore_ascii_case("none") || trimmed == "null" {
        return Value::Null;
    }

    match current {
        Value::Bool(_) => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        Value::String(_) => Value::String(raw.to_string()),
        Value::Array(_) => sequence(trimmed),
        Value::Null if trimmed.contains(',') => sequence(trimmed),
        _ => serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

/// Parses `a,b`, `(a, b)` or `[a, b]` into a JSON array.
fn sequence(raw: &str) -> Value {
    let inner = raw.trim_matches(|c| matches!(c, '(' | ')' | '[' | ']'));
    if inner.trim().is_empty() {
        return Value::Array(Vec::new());
    }

    Value::Array(
        inner
            .split(',')
            .map(str::trim)
            .map(|item| {
                serde_json::from_str(item).unwrap_or_else(|_| Value::String(item.to_string()))
            })
            .collect(),
    )
}

impl ExpConfig {
    /// Loads a config from a JSON file, missing keys keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(ExpErr::InvalidConfig(format!(
                "config serialized to {other} instead of an object"
            ))),
        }
    }

    /// Overrides keys from a flat `[key, value, key, value, ...]` list.
    ///
    /// Values are coerced to the type of the key they replace, so `input_size 416,416`,
    /// `seed 7` and `enable_mixup true` all work.
    ///
    /// # Returns
    /// An error on an odd list, an unknown key or a value that doesn't fit its key. Keys
    /// before the failing one stay applied.
    pub fn merge<S: AsRef<str>>(&mut self, opts: &[S]) -> Result<()> {
        if opts.len() % 2 != 0 {
            return Err(ExpErr::InvalidConfig(format!(
                "overrides come in key value pairs, got {} items",
                opts.len()
            )));
        }

        for pair in opts.chunks_exact(2) {
            let (key, raw) = (pair[0].as_ref(), pair[1].as_ref());

            let mut map = self.to_map()?;
            let current = map
                .get(key)
                .ok_or_else(|| ExpErr::UnknownKey(key.to_string()))?;

            let value = coerce(current, raw);
            map.insert(key.to_string(), value);

            *self = serde_json::from_value(Value::Object(map)).map_err(|e| ExpErr::Parse {
                key: key.to_string(),
                value: raw.to_string(),
                msg: e.to_string(),
            })?;

            debug!("config override {key} = {raw}");
        }

        Ok(())
    }

    /// Checks the invariants the run relies on.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ExpErr::InvalidConfig(msg));

        if self.num_classes == 0 {
            return invalid("num_classes must be positive".into());
        }
        if self.depth <= 0.0 || self.width <= 0.0 {
            return invalid(format!(
                "depth and width must be positive, got {} and {}",
                self.depth, self.width
            ));
        }

        for (name, (h, w)) in [("input_size", self.input_size), ("test_size", self.test_size)] {
            if h == 0 || w == 0 {
                return invalid(format!("{name} must be non-zero, got ({h}, {w})"));
            }
        }

        if let Some((lo, hi)) = self.random_size {
            if lo == 0 || lo > hi {
                return invalid(format!("random_size must be an ordered positive range, got ({lo}, {hi})"));
            }
        }

        for (name, p) in [
            ("mosaic_prob", self.mosaic_prob),
            ("mixup_prob", self.mixup_prob),
            ("hsv_prob", self.hsv_prob),
            ("gaussian_prob", self.gaussian_prob),
            ("flip_prob", self.flip_prob),
            ("test_conf", self.test_conf),
            ("nmsthre", self.nmsthre),
            ("min_lr_ratio", self.min_lr_ratio),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("{name} must be in [0, 1], got {p}"));
            }
        }

        for (name, (lo, hi)) in [
            ("mosaic_scale", self.mosaic_scale),
            ("mixup_scale", self.mixup_scale),
        ] {
            if lo <= 0.0 || lo > hi {
                return invalid(format!("{name} must be an ordered positive range, got ({lo}, {hi})"));
            }
        }

        if self.max_epoch == 0 {
            return invalid("max_epoch must be positive".into());
        }
        if self.warmup_epochs + self.no_aug_epochs > self.max_epoch {
            return invalid(format!(
                "warmup_epochs ({}) + no_aug_epochs ({}) exceed max_epoch ({})",
                self.warmup_epochs, self.no_aug_epochs, self.max_epoch
            ));
        }

        for (name, v) in [
            ("warmup_lr", self.warmup_lr),
            ("basic_lr_per_img", self.basic_lr_per_img),
            ("weight_decay", self.weight_decay),
            ("momentum", self.momentum),
        ] {
            if v < 0.0 {
                return invalid(format!("{name} must be non-negative, got {v}"));
            }
        }

        if self.print_interval == 0 || self.eval_interval == 0 {
            return invalid("print_interval and eval_interval must be positive".into());
        }

        self.scheduler.parse::<LrMode>()?;
        Ok(())
    }
}

impl fmt::Display for ExpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.to_map().map_err(|_| fmt::Error)?;
        let width = map.keys().map(String::len).max().unwrap_or(0).max(4);

        writeln!(f, "{:<width$} | values", "keys")?;
        writeln!(f, "{}-+-{}", "-".repeat(width), "-".repeat(24))?;
        for (key, value) in &map {
            writeln!(f, "{key:<width$} | {value}")?;
        }
        Ok(())
    }
}
