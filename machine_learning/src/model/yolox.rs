use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    ParamStore,
    layers::{Activation, BaseConv, BatchNorm, Conv2d, LayerBuilder},
};
use crate::{MlErr, Result};

/// Scales a channel count by a width multiplier, truncating like an integer cast.
fn scaled(channels: usize, width: f32) -> usize {
    (channels as f32 * width) as usize
}

/// Scales a block repetition count by a depth multiplier.
fn repeats(n: usize, depth: f32) -> usize {
    (n as f32 * depth).round() as usize
}

/// The knobs that define the size and output layout of a YOLOX detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YoloxConfig {
    pub num_classes: usize,
    pub num_colors: usize,
    pub depth: f32,
    pub width: f32,
    pub act: Activation,
    pub in_channels: [usize; 3],
}

impl Default for YoloxConfig {
    fn default() -> Self {
        Self {
            num_classes: 8,
            num_colors: 3,
            depth: 1.0,
            width: 1.0,
            act: Activation::Silu,
            in_channels: [256, 512, 1024],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bottleneck {
    pub conv1: BaseConv,
    pub conv2: BaseConv,
    pub use_add: bool,
}

/// Cross stage partial block: two 1x1 branches, one of them through `n` bottlenecks.
#[derive(Debug, Clone)]
pub struct CspLayer {
    pub conv1: BaseConv,
    pub conv2: BaseConv,
    pub conv3: BaseConv,
    pub m: Vec<Bottleneck>,
}

/// Spatial pyramid pooling over kernels 5, 9 and 13.
#[derive(Debug, Clone)]
pub struct SppBottleneck {
    pub conv1: BaseConv,
    pub conv2: BaseConv,
}

/// Space-to-depth followed by a convolution.
#[derive(Debug, Clone)]
pub struct Focus {
    pub conv: BaseConv,
}

#[derive(Debug, Clone)]
pub struct CspDarknet {
    pub stem: Focus,
    pub dark2: (BaseConv, CspLayer),
    pub dark3: (BaseConv, CspLayer),
    pub dark4: (BaseConv, CspLayer),
    pub dark5: (BaseConv, SppBottleneck, CspLayer),
}

/// CSPDarknet backbone with a path aggregation neck.
#[derive(Debug, Clone)]
pub struct YoloPafpn {
    pub backbone: CspDarknet,
    pub lateral_conv0: BaseConv,
    pub c3_p4: CspLayer,
    pub reduce_conv1: BaseConv,
    pub c3_p3: CspLayer,
    pub bu_conv2: BaseConv,
    pub c3_n3: CspLayer,
    pub bu_conv1: BaseConv,
    pub c3_n4: CspLayer,
}

/// The decoupled detection head, one branch per feature level.
#[derive(Debug, Clone)]
pub struct YoloxHead {
    pub stems: Vec<BaseConv>,
    pub cls_convs: Vec<[BaseConv; 2]>,
    pub reg_convs: Vec<[BaseConv; 2]>,
    pub cls_preds: Vec<Conv2d>,
    pub reg_preds: Vec<Conv2d>,
    pub obj_preds: Vec<Conv2d>,
    pub color_preds: Vec<Conv2d>,
}

/// A YOLOX detector: the parameter layout of its backbone and head plus the registry of
/// its batch norms.
///
/// The forward pass belongs to the compute backend, this type only owns the tensors.
#[derive(Debug, Clone)]
pub struct Yolox {
    pub backbone: YoloPafpn,
    pub head: YoloxHead,
    config: YoloxConfig,
    store: ParamStore,
    norms: Vec<BatchNorm>,
}

impl Yolox {
    /// Builds a new detector and initializes its weights.
    ///
    /// # Arguments
    /// * `config` - The size and layout of the detector.
    /// * `rng` - The random source for weight initialization.
    ///
    /// # Returns
    /// A new `Yolox` or an error if the multipliers produce an empty layer.
    pub fn new<R: Rng>(config: &YoloxConfig, rng: &mut R) -> Result<Self> {
        if config.depth <= 0.0 || config.width <= 0.0 {
            return Err(MlErr::InvalidConfig(format!(
                "depth and width must be positive, got {} and {}",
                config.depth, config.width
            )));
        }

        let mut store = ParamStore::new();
        let mut norms = Vec::new();
        let mut b = LayerBuilder::new(&mut store, &mut norms, rng);

        let backbone = YoloPafpn::build(&mut b, config)?;
        let head = YoloxHead::build(&mut b, config)?;

        log::debug!(
            "built yolox with {} tensors and {} batch norms",
            store.len(),
            norms.len()
        );

        Ok(Self {
            backbone,
            head,
            config: config.clone(),
            store,
            norms,
        })
    }

    #[inline]
    pub fn config(&self) -> &YoloxConfig {
        &self.config
    }

    #[inline]
    pub fn params(&self) -> &ParamStore {
        &self.store
    }

    #[inline]
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    #[inline]
    pub fn norms(&self) -> &[BatchNorm] {
        &self.norms
    }

    /// Sets the running-statistics settings of every batch norm in the model.
    pub fn init_norms(&mut self, eps: f32, momentum: f32) {
        for norm in &mut self.norms {
            norm.eps = eps;
            norm.momentum = momentum;
        }
    }

    /// Sets the prediction biases so that the initial scores equal `prior_prob`.
    pub fn initialize_biases(&mut self, prior_prob: f32) -> Result<()> {
        self.head.initialize_biases(&mut self.store, prior_prob)
    }
}

impl Bottleneck {
    fn build<R: Rng>(
        b: &mut LayerBuilder<'_, R>,
        prefix: &str,
        in_ch: usize,
        out_ch: usize,
        shortcut: bool,
        act: Activation,
    ) -> Result<Self> {
        let hidden = out_ch;
        Ok(Self {
            conv1: b.base_conv(&format!("{prefix}.conv1"), in_ch, hidden, 1, 1, act)?,
            conv2: b.base_conv(&format!("{prefix}.conv2"), hidden, out_ch, 3, 1, act)?,
            use_add: shortcut && in_ch == out_ch,
        })
    }
}

impl CspLayer {
    fn build<R: Rng>(
        b: &mut LayerBuilder<'_, R>,
        prefix: &str,
        in_ch: usize,
        out_ch: usize,
        n: usize,
        shortcut: bool,
        act: Activation,
    ) -> Result<Self> {
        let hidden = out_ch / 2;
        let conv1 = b.base_conv(&format!("{prefix}.conv1"), in_ch, hidden, 1, 1, act)?;
        let conv2 = b.base_conv(&format!("{prefix}.conv2"), in_ch, hidden, 1, 1, act)?;
        let conv3 = b.base_conv(&format!("{prefix}.conv3"), 2 * hidden, out_ch, 1, 1, act)?;

        let m = (0..n)
            .map(|i| Bottleneck::build(b, &format!("{prefix}.m.{i}"), hidden, hidden, shortcut, act))
            .collect::<Result<_>>()?;

        Ok(Self {
            conv1,
            conv2,
            conv3,
            m,
        })
    }
}

impl SppBottleneck {
    const KERNELS: usize = 3;

    fn build<R: Rng>(
        b: &mut LayerBuilder<'_, R>,
        prefix: &str,
        in_ch: usize,
        out_ch: usize,
        act: Activation,
    ) -> Result<Self> {
        let hidden = in_ch / 2;
        Ok(Self {
            conv1: b.base_conv(&format!("{prefix}.conv1"), in_ch, hidden, 1, 1, act)?,
            conv2: b.base_conv(
                &format!("{prefix}.conv2"),
                hidden * (Self::KERNELS + 1),
                out_ch,
                1,
                1,
                act,
            )?,
        })
    }
}

impl CspDarknet {
    fn build<R: Rng>(
        b: &mut LayerBuilder<'_, R>,
        prefix: &str,
        depth: f32,
        width: f32,
        act: Activation,
    ) -> Result<Self> {
        let base = scaled(64, width);
        let base_depth = repeats(3, depth).max(1);

        let stem = Focus {
            conv: b.base_conv(&format!("{prefix}.stem.conv"), 3 * 4, base, 3, 1, act)?,
        };

        let mut stage = |name: &str, in_ch: usize, out_ch: usize, n: usize| -> Result<_> {
            let down = b.base_conv(&format!("{prefix}.{name}.0"), in_ch, out_ch, 3, 2, act)?;
            let csp = CspLayer::build(b, &format!("{prefix}.{name}.1"), out_ch, out_ch, n, true, act)?;
            Ok((down, csp))
        };

        let dark2 = stage("dark2", base, base * 2, base_depth)?;
        let dark3 = stage("dark3", base * 2, base * 4, base_depth * 3)?;
        let dark4 = stage("dark4", base * 4, base * 8, base_depth * 3)?;

        let down = b.base_conv(&format!("{prefix}.dark5.0"), base * 8, base * 16, 3, 2, act)?;
        let spp = SppBottleneck::build(b, &format!("{prefix}.dark5.1"), base * 16, base * 16, act)?;
        let csp = CspLayer::build(
            b,
            &format!("{prefix}.dark5.2"),
            base * 16,
            base * 16,
            base_depth,
            false,
            act,
        )?;

        Ok(Self {
            stem,
            dark2,
            dark3,
            dark4,
            dark5: (down, spp, csp),
        })
    }
}

impl YoloPafpn {
    fn build<R: Rng>(b: &mut LayerBuilder<'_, R>, config: &YoloxConfig) -> Result<Self> {
        let &YoloxConfig {
            depth,
            width,
            act,
            in_channels: [c3, c4, c5],
            ..
        } = config;
        let n = repeats(3, depth);

        Ok(Self {
            backbone: CspDarknet::build(b, "backbone.backbone", depth, width, act)?,
            lateral_conv0: b.base_conv(
                "backbone.lateral_conv0",
                scaled(c5, width),
                scaled(c4, width),
                1,
                1,
                act,
            )?,
            c3_p4: CspLayer::build(
                b,
                "backbone.C3_p4",
                scaled(2 * c4, width),
                scaled(c4, width),
                n,
                false,
                act,
            )?,
            reduce_conv1: b.base_conv(
                "backbone.reduce_conv1",
                scaled(c4, width),
                scaled(c3, width),
                1,
                1,
                act,
            )?,
            c3_p3: CspLayer::build(
                b,
                "backbone.C3_p3",
                scaled(2 * c3, width),
                scaled(c3, width),
                n,
                false,
                act,
            )?,
            bu_conv2: b.base_conv(
                "backbone.bu_conv2",
                scaled(c3, width),
                scaled(c3, width),
                3,
                2,
                act,
            )?,
            c3_n3: CspLayer::build(
                b,
                "backbone.C3_n3",
                scaled(2 * c3, width),
                scaled(c4, width),
                n,
                false,
                act,
            )?,
            bu_conv1: b.base_conv(
                "backbone.bu_conv1",
                scaled(c4, width),
                scaled(c4, width),
                3,
                2,
                act,
            )?,
            c3_n4: CspLayer::build(
                b,
                "backbone.C3_n4",
                scaled(2 * c4, width),
                scaled(c5, width),
                n,
                false,
                act,
            )?,
        })
    }
}

impl YoloxHead {
    fn build<R: Rng>(b: &mut LayerBuilder<'_, R>, config: &YoloxConfig) -> Result<Self> {
        let hidden = scaled(256, config.width);
        let act = config.act;
        let mut head = Self {
            stems: Vec::new(),
            cls_convs: Vec::new(),
            reg_convs: Vec::new(),
            cls_preds: Vec::new(),
            reg_preds: Vec::new(),
            obj_preds: Vec::new(),
            color_preds: Vec::new(),
        };

        for (i, &channels) in config.in_channels.iter().enumerate() {
            let in_ch = scaled(channels, config.width);
            head.stems
                .push(b.base_conv(&format!("head.stems.{i}"), in_ch, hidden, 1, 1, act)?);

            let mut branch = |name: &str| -> Result<[BaseConv; 2]> {
                Ok([
                    b.base_conv(&format!("head.{name}.{i}.0"), hidden, hidden, 3, 1, act)?,
                    b.base_conv(&format!("head.{name}.{i}.1"), hidden, hidden, 3, 1, act)?,
                ])
            };
            head.cls_convs.push(branch("cls_convs")?);
            head.reg_convs.push(branch("reg_convs")?);

            let mut pred = |name: &str, out_ch: usize| {
                b.conv2d(&format!("head.{name}.{i}"), hidden, out_ch, 1, 1, true)
            };
            head.cls_preds.push(pred("cls_preds", config.num_classes)?);
            head.reg_preds.push(pred("reg_preds", 4)?);
            head.obj_preds.push(pred("obj_preds", 1)?);
            head.color_preds.push(pred("color_preds", config.num_colors)?);
        }

        Ok(head)
    }

    /// Fills the classification, objectness and color biases with `-ln((1 - p) / p)`.
    ///
    /// # Arguments
    /// * `store` - The tensors of the model this head belongs to.
    /// * `prior_prob` - The probability every prediction should start from.
    ///
    /// # Returns
    /// An error if `prior_prob` is not in `(0, 1)` or a bias is missing from `store`.
    pub fn initialize_biases(&self, store: &mut ParamStore, prior_prob: f32) -> Result<()> {
        if !(prior_prob > 0.0 && prior_prob < 1.0) {
            return Err(MlErr::InvalidConfig(format!(
                "prior probability must be in (0, 1), got {prior_prob}"
            )));
        }

        let value = -((1.0 - prior_prob) / prior_prob).ln();
        let preds = self
            .cls_preds
            .iter()
            .chain(&self.obj_preds)
            .chain(&self.color_preds);

        for bias in preds.filter_map(|conv| conv.bias) {
            store.get_mut(bias)?.value_mut().fill(value);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::model::ParamRole;

    fn tiny() -> YoloxConfig {
        YoloxConfig {
            depth: 0.33,
            width: 0.125,
            ..Default::default()
        }
    }

    #[test]
    fn head_has_one_branch_per_level() {
        let model = Yolox::new(&tiny(), &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(model.head.stems.len(), 3);
        assert_eq!(model.head.color_preds.len(), 3);

        let color = model.params().get(model.head.color_preds[0].weight).unwrap();
        assert_eq!(color.value().shape(), &[3, 32, 1, 1]);
        assert_eq!(color.name(), "head.color_preds.0.weight");
    }

    #[test]
    fn every_norm_tensor_is_tagged() {
        let model = Yolox::new(&tiny(), &mut StdRng::seed_from_u64(0)).unwrap();
        let store = model.params();

        for norm in model.norms() {
            assert_eq!(store.get(norm.weight).unwrap().role(), ParamRole::NormWeight);
            assert_eq!(store.get(norm.bias).unwrap().role(), ParamRole::Bias);
            assert_eq!(store.get(norm.running_mean).unwrap().role(), ParamRole::Buffer);
        }
    }

    #[test]
    fn depth_controls_bottleneck_repeats() {
        let shallow = Yolox::new(&tiny(), &mut StdRng::seed_from_u64(0)).unwrap();
        let deep = Yolox::new(
            &YoloxConfig {
                depth: 1.0,
                ..tiny()
            },
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

        assert_eq!(shallow.backbone.backbone.dark3.1.m.len(), 3);
        assert_eq!(deep.backbone.backbone.dark3.1.m.len(), 9);
        assert!(deep.params().numel() > shallow.params().numel());
    }

    #[test]
    fn biases_start_at_the_prior() {
        let mut model = Yolox::new(&tiny(), &mut StdRng::seed_from_u64(0)).unwrap();
        model.initialize_biases(1e-2).unwrap();

        let expected = -(0.99f32 / 0.01).ln();
        let obj = model.head.obj_preds[2].bias.unwrap();
        let value = model.params().get(obj).unwrap().value()[[0]];
        assert!((value - expected).abs() < 1e-5);

        assert!(model.initialize_biases(1.0).is_err());
    }

    #[test]
    fn init_norms_touches_every_norm() {
        let mut model = Yolox::new(&tiny(), &mut StdRng::seed_from_u64(0)).unwrap();
        model.init_norms(1e-3, 0.03);
        assert!(model.norms().iter().all(|n| n.eps == 1e-3 && n.momentum == 0.03));
    }

    #[test]
    fn vanishing_width_is_rejected() {
        let config = YoloxConfig {
            width: 0.001,
            ..tiny()
        };
        assert!(Yolox::new(&config, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
