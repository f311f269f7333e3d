mod ema;
pub mod layers;
mod param;
mod yolox;

pub use ema::ModelEma;
pub use layers::{Activation, BaseConv, BatchNorm, Conv2d, NormId};
pub use param::{Param, ParamId, ParamRole, ParamStore};
pub use yolox::{
    Bottleneck, CspDarknet, CspLayer, Focus, SppBottleneck, YoloPafpn, Yolox, YoloxConfig,
    YoloxHead,
};
