use crate::model::{ParamId, ParamRole, ParamStore};

/// The trainable tensors of a model split by how they should be regularized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGroups {
    /// Normalization scales, no weight decay.
    pub norm: Vec<ParamId>,
    /// Every other weight, with weight decay.
    pub decay: Vec<ParamId>,
    /// Every bias, no weight decay.
    pub bias: Vec<ParamId>,
}

impl ParamGroups {
    pub fn len(&self) -> usize {
        self.norm.len() + self.decay.len() + self.bias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits the trainable tensors of `store` into the norm, decay and bias buckets.
///
/// The bucket comes from the role each layer declared when registering the tensor, so
/// every trainable tensor ends up in exactly one bucket whatever it is named.
pub fn partition_params(store: &ParamStore) -> ParamGroups {
    let mut groups = ParamGroups::default();

    for (id, param) in store.trainable() {
        match param.role() {
            ParamRole::NormWeight => groups.norm.push(id),
            ParamRole::Weight => groups.decay.push(id),
            ParamRole::Bias => groups.bias.push(id),
            ParamRole::Buffer => {}
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    #[test]
    fn names_do_not_influence_the_bucket() {
        let mut store = ParamStore::new();
        let t = || ArrayD::zeros(IxDyn(&[1]));

        // Misleading names on purpose.
        let w = store.register("bn_like_conv.weight", ParamRole::Weight, t());
        let n = store.register("norm.gamma", ParamRole::NormWeight, t());
        let b = store.register("weight", ParamRole::Bias, t());
        store.register("bn.running_var", ParamRole::Buffer, t());

        let groups = partition_params(&store);
        assert_eq!(groups.decay, vec![w]);
        assert_eq!(groups.norm, vec![n]);
        assert_eq!(groups.bias, vec![b]);
        assert_eq!(groups.len(), 3);
    }
}
