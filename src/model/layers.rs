//! The dynamic module tree.
//!
//! A declarative architecture is compiled into a tree of [`DynLayer`] values:
//! Burn leaf modules plus a small set of composite blocks. Activations flow
//! through the tree as rank-tagged [`Feature`] values so one tree type covers
//! both the 4-D convolutional trunk and the 2-D classifier head; feeding a
//! layer the wrong rank is a typed error, which the builder's probe and the
//! shape-inference fallback paths rely on.

use burn::{
    module::Module,
    nn::{
        conv::Conv2d,
        pool::{AdaptiveAvgPool2d, MaxPool2d},
        BatchNorm, Gelu, LeakyRelu, Linear, Relu, Sigmoid, Tanh,
    },
    tensor::{activation, backend::Backend, Tensor},
};
use thiserror::Error;

/// Error raised when a layer receives an activation it cannot consume.
///
/// The width checks exist because the underlying tensor ops abort on
/// dimension mismatches; probing arbitrary subtrees with approximate shapes
/// must surface a recoverable error instead.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("{layer} expects a {expected} input, got a {got} input")]
    Rank {
        layer: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("{layer} expects {expected} input channels/features, got {got}")]
    Width {
        layer: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("cannot build a probe tensor for shape {shape:?}")]
    UnsupportedShape { shape: Vec<usize> },
}

/// A rank-tagged activation value flowing through the tree.
#[derive(Debug, Clone)]
pub enum Feature<B: Backend> {
    /// 4-D feature map `[batch, channels, height, width]`.
    Map(Tensor<B, 4>),
    /// 2-D flat features `[batch, features]`.
    Flat(Tensor<B, 2>),
}

impl<B: Backend> Feature<B> {
    /// Build a zero-valued single-sample feature for a per-sample shape
    /// (`[c, h, w]` or `[n]`).
    pub fn zeros(shape: &[usize], device: &B::Device) -> Result<Self, ForwardError> {
        match shape {
            [c, h, w] => Ok(Self::Map(Tensor::zeros([1, *c, *h, *w], device))),
            [n] => Ok(Self::Flat(Tensor::zeros([1, *n], device))),
            other => Err(ForwardError::UnsupportedShape {
                shape: other.to_vec(),
            }),
        }
    }

    /// The shape with the batch dimension stripped.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Map(t) => t.dims()[1..].to_vec(),
            Self::Flat(t) => t.dims()[1..].to_vec(),
        }
    }

    fn rank_name(&self) -> &'static str {
        match self {
            Self::Map(_) => "4-D",
            Self::Flat(_) => "2-D",
        }
    }

    fn into_map(self, layer: &'static str) -> Result<Tensor<B, 4>, ForwardError> {
        match self {
            Self::Map(t) => Ok(t),
            other => Err(ForwardError::Rank {
                layer,
                expected: "4-D",
                got: other.rank_name(),
            }),
        }
    }

    fn into_flat(self, layer: &'static str) -> Result<Tensor<B, 2>, ForwardError> {
        match self {
            Self::Flat(t) => Ok(t),
            other => Err(ForwardError::Rank {
                layer,
                expected: "2-D",
                got: other.rank_name(),
            }),
        }
    }
}

/// A node of the dynamic module tree.
#[derive(Module, Debug)]
pub enum DynLayer<B: Backend> {
    Conv(Conv2d<B>),
    Norm(BatchNorm<B, 2>),
    Relu(Relu),
    LeakyRelu(LeakyRelu),
    Gelu(Gelu),
    Sigmoid(Sigmoid),
    Tanh(Tanh),
    Pool(MaxPool2d),
    GlobalPool(AdaptiveAvgPool2d),
    Linear(Linear<B>),
    Stage(Stage<B>),
    Residual(ResidualBlock<B>),
    Dense(DenseBlock<B>),
    Attention(SqueezeExcite<B>),
    /// Reshapes a 4-D map into 2-D flat features; identity on flat input.
    Flatten(Stage<B>),
}

impl<B: Backend> DynLayer<B> {
    /// An empty stage used as the (state-free) flatten marker.
    pub fn flatten() -> Self {
        Self::Flatten(Stage::new())
    }

    /// Run the layer on a rank-tagged input.
    pub fn forward(&self, input: Feature<B>) -> Result<Feature<B>, ForwardError> {
        match self {
            Self::Conv(conv) => {
                let x = input.into_map("Conv2d")?;
                let expected = conv.weight.val().dims()[1];
                check_width("Conv2d", expected, x.dims()[1])?;
                Ok(Feature::Map(conv.forward(x)))
            }
            Self::Norm(norm) => {
                let x = input.into_map("BatchNorm2d")?;
                let expected = norm.gamma.val().dims()[0];
                check_width("BatchNorm2d", expected, x.dims()[1])?;
                Ok(Feature::Map(norm.forward(x)))
            }
            Self::Relu(act) => Ok(match input {
                Feature::Map(t) => Feature::Map(act.forward(t)),
                Feature::Flat(t) => Feature::Flat(act.forward(t)),
            }),
            Self::LeakyRelu(act) => Ok(match input {
                Feature::Map(t) => Feature::Map(act.forward(t)),
                Feature::Flat(t) => Feature::Flat(act.forward(t)),
            }),
            Self::Gelu(act) => Ok(match input {
                Feature::Map(t) => Feature::Map(act.forward(t)),
                Feature::Flat(t) => Feature::Flat(act.forward(t)),
            }),
            Self::Sigmoid(act) => Ok(match input {
                Feature::Map(t) => Feature::Map(act.forward(t)),
                Feature::Flat(t) => Feature::Flat(act.forward(t)),
            }),
            Self::Tanh(act) => Ok(match input {
                Feature::Map(t) => Feature::Map(act.forward(t)),
                Feature::Flat(t) => Feature::Flat(act.forward(t)),
            }),
            Self::Pool(pool) => Ok(Feature::Map(pool.forward(input.into_map("MaxPool2d")?))),
            Self::GlobalPool(pool) => Ok(Feature::Map(
                pool.forward(input.into_map("AdaptiveAvgPool2d")?),
            )),
            Self::Linear(linear) => {
                let x = input.into_flat("Linear")?;
                let expected = linear.weight.val().dims()[0];
                check_width("Linear", expected, x.dims()[1])?;
                Ok(Feature::Flat(linear.forward(x)))
            }
            Self::Stage(stage) => stage.forward(input),
            Self::Residual(block) => block.forward(input),
            Self::Dense(block) => block.forward(input),
            Self::Attention(block) => block.forward(input),
            Self::Flatten(_) => match input {
                Feature::Map(t) => {
                    let [b, c, h, w] = t.dims();
                    Ok(Feature::Flat(t.reshape([b, c * h * w])))
                }
                flat => Ok(flat),
            },
        }
    }

    /// Module type tag shown in the graph and the text summary.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Conv(_) => "Conv2d",
            Self::Norm(_) => "BatchNorm2d",
            Self::Relu(_) => "ReLU",
            Self::LeakyRelu(_) => "LeakyReLU",
            Self::Gelu(_) => "GELU",
            Self::Sigmoid(_) => "Sigmoid",
            Self::Tanh(_) => "Tanh",
            Self::Pool(_) => "MaxPool2d",
            Self::GlobalPool(_) => "AdaptiveAvgPool2d",
            Self::Linear(_) => "Linear",
            Self::Stage(_) => "Sequential",
            Self::Residual(_) => "ResidualBlock",
            Self::Dense(_) => "DenseBlock",
            Self::Attention(_) => "SqueezeExcite",
            Self::Flatten(_) => "Flatten",
        }
    }

    /// Named child modules, in declaration order. Leaves return an empty
    /// list. Sequential containers name children by position index;
    /// residual blocks use role names.
    pub fn children(&self) -> Vec<(String, &DynLayer<B>)> {
        match self {
            Self::Stage(stage) => stage
                .children
                .iter()
                .enumerate()
                .map(|(i, child)| (i.to_string(), child))
                .collect(),
            Self::Residual(block) => {
                let roles = ["body", "shortcut"];
                block
                    .paths
                    .iter()
                    .enumerate()
                    .map(|(i, child)| (roles.get(i).unwrap_or(&"path").to_string(), child))
                    .collect()
            }
            Self::Dense(block) => block
                .layers
                .iter()
                .enumerate()
                .map(|(i, child)| (i.to_string(), child))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Look up a direct child by name.
    pub fn child(&self, name: &str) -> Option<&DynLayer<B>> {
        self.children()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, child)| child)
    }

    /// Whether this node has renderable children in the graph view.
    pub fn has_children(&self) -> bool {
        !self.children().is_empty()
    }

    /// Element count of this module's own (non-recursive) learnable
    /// parameters. Containers report 0; their parameters belong to children.
    pub fn own_param_count(&self) -> usize {
        match self {
            Self::Conv(conv) => conv.num_params(),
            Self::Norm(norm) => norm.num_params(),
            Self::Linear(linear) => linear.num_params(),
            Self::Attention(se) => se.fc1.num_params() + se.fc2.num_params(),
            _ => 0,
        }
    }

    /// The underlying convolution, if this is a conv leaf.
    pub fn as_conv(&self) -> Option<&Conv2d<B>> {
        match self {
            Self::Conv(conv) => Some(conv),
            _ => None,
        }
    }
}

fn check_width(layer: &'static str, expected: usize, got: usize) -> Result<(), ForwardError> {
    if expected == got {
        Ok(())
    } else {
        Err(ForwardError::Width {
            layer,
            expected,
            got,
        })
    }
}

/// An ordered sequential container.
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    pub children: Vec<DynLayer<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
        }
    }

    pub fn with_children(children: Vec<DynLayer<B>>) -> Self {
        Self { children }
    }

    pub fn push(&mut self, child: DynLayer<B>) {
        self.children.push(child);
    }

    pub fn forward(&self, input: Feature<B>) -> Result<Feature<B>, ForwardError> {
        let mut current = input;
        for child in &self.children {
            current = child.forward(current)?;
        }
        Ok(current)
    }
}

/// A residual block: `paths[0]` is the main body, `paths[1]` (optional) the
/// projection shortcut. Output is `relu(body(x) + shortcut(x))`, with an
/// identity shortcut when no projection is present.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub paths: Vec<DynLayer<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(body: DynLayer<B>, shortcut: Option<DynLayer<B>>) -> Self {
        let mut paths = vec![body];
        if let Some(shortcut) = shortcut {
            paths.push(shortcut);
        }
        Self { paths }
    }

    fn forward(&self, input: Feature<B>) -> Result<Feature<B>, ForwardError> {
        let x = input.into_map("ResidualBlock")?;
        let body = self.paths[0]
            .forward(Feature::Map(x.clone()))?
            .into_map("ResidualBlock")?;
        let skip = match self.paths.get(1) {
            Some(shortcut) => shortcut
                .forward(Feature::Map(x))?
                .into_map("ResidualBlock")?,
            None => x,
        };
        Ok(Feature::Map(activation::relu(body + skip)))
    }
}

/// A densely-connected block: each layer consumes the channel-concatenation
/// of the block input and all previous layer outputs; the block emits the
/// final concatenation.
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub layers: Vec<DynLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn new(layers: Vec<DynLayer<B>>) -> Self {
        Self { layers }
    }

    fn forward(&self, input: Feature<B>) -> Result<Feature<B>, ForwardError> {
        let x = input.into_map("DenseBlock")?;
        let mut features = vec![x];
        for layer in &self.layers {
            let stacked = Tensor::cat(features.clone(), 1);
            let out = layer
                .forward(Feature::Map(stacked))?
                .into_map("DenseBlock")?;
            features.push(out);
        }
        Ok(Feature::Map(Tensor::cat(features, 1)))
    }
}

/// A squeeze-excitation attention block: global-pools the map to a channel
/// descriptor, passes it through a two-layer bottleneck, and rescales the
/// input channels by the resulting sigmoid gate.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pub pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn forward(&self, input: Feature<B>) -> Result<Feature<B>, ForwardError> {
        let x = input.into_map("SqueezeExcite")?;
        let [batch, channels, _, _] = x.dims();

        let squeezed = self.pool.forward(x.clone()).reshape([batch, channels]);
        let gate = self.fc2.forward(activation::relu(self.fc1.forward(squeezed)));
        let gate = activation::sigmoid(gate).reshape([batch, channels, 1, 1]);

        Ok(Feature::Map(x * gate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;
    use burn::nn::{
        conv::Conv2dConfig,
        pool::{AdaptiveAvgPool2dConfig, MaxPool2dConfig},
        LinearConfig, PaddingConfig2d,
    };

    type B = InferenceBackend;

    fn conv(in_ch: usize, out_ch: usize) -> DynLayer<B> {
        let device = Default::default();
        DynLayer::Conv(
            Conv2dConfig::new([in_ch, out_ch], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(&device),
        )
    }

    #[test]
    fn test_stage_forward_shapes() {
        let device = Default::default();
        let stage = DynLayer::Stage(Stage::with_children(vec![
            conv(1, 8),
            DynLayer::Relu(Relu::new()),
            DynLayer::Pool(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
        ]));

        let input = Tensor::<B, 4>::zeros([2, 1, 28, 28], &device);
        let out = stage.forward(Feature::Map(input)).unwrap();
        assert_eq!(out.shape(), vec![8, 14, 14]);
    }

    #[test]
    fn test_flatten_then_linear() {
        let device = Default::default();
        let head = DynLayer::Stage(Stage::with_children(vec![
            DynLayer::flatten(),
            DynLayer::Linear(LinearConfig::new(8 * 14 * 14, 10).init(&device)),
        ]));

        let input = Tensor::<B, 4>::zeros([3, 8, 14, 14], &device);
        let out = head.forward(Feature::Map(input)).unwrap();
        assert_eq!(out.shape(), vec![10]);
    }

    #[test]
    fn test_rank_mismatch_is_an_error() {
        let layer = conv(1, 8);
        let device = Default::default();
        let flat = Tensor::<B, 2>::zeros([1, 16], &device);
        let result = layer.forward(Feature::Flat(flat));
        assert!(matches!(result, Err(ForwardError::Rank { .. })));
    }

    #[test]
    fn test_squeeze_excite_preserves_shape() {
        let device = Default::default();
        let se = DynLayer::Attention(SqueezeExcite {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(8, 2).init(&device),
            fc2: LinearConfig::new(2, 8).init(&device),
        });

        let input = Tensor::<B, 4>::zeros([2, 8, 7, 7], &device);
        let out = se.forward(Feature::Map(input)).unwrap();
        assert_eq!(out.shape(), vec![8, 7, 7]);
        assert!(!se.has_children());
        assert!(se.own_param_count() > 0);
    }

    #[test]
    fn test_residual_block_shape() {
        let device = Default::default();
        let body = DynLayer::Stage(Stage::with_children(vec![
            conv(8, 8),
            DynLayer::Relu(Relu::new()),
            conv(8, 8),
        ]));
        let block = DynLayer::Residual(ResidualBlock::new(body, None));

        let input = Tensor::<B, 4>::zeros([1, 8, 14, 14], &device);
        let out = block.forward(Feature::Map(input)).unwrap();
        assert_eq!(out.shape(), vec![8, 14, 14]);

        let children = block.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, "body");
    }

    #[test]
    fn test_dense_block_grows_channels() {
        let device = Default::default();
        let layer = |in_ch: usize| {
            DynLayer::Stage(Stage::with_children(vec![
                conv(in_ch, 4),
                DynLayer::Relu(Relu::new()),
            ]))
        };
        let block = DynLayer::Dense(DenseBlock::new(vec![layer(8), layer(12)]));

        let input = Tensor::<B, 4>::zeros([1, 8, 7, 7], &device);
        let out = block.forward(Feature::Map(input)).unwrap();
        // 8 input channels + 4 per layer.
        assert_eq!(out.shape(), vec![16, 7, 7]);
    }

    #[test]
    fn test_container_param_count_is_zero() {
        let stage = DynLayer::Stage(Stage::with_children(vec![conv(1, 8)]));
        assert_eq!(stage.own_param_count(), 0);
        assert!(stage.has_children());
        assert!(stage.child("0").is_some());
        assert!(stage.child("1").is_none());
    }
}
