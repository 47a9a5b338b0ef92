//! Architecture builder: declarative config to executable module tree.
//!
//! Geometry problems degrade instead of failing: a layer that would produce
//! a non-positive spatial size truncates the trunk, pooling is skipped once
//! the map is too small, and a failed feature-width probe falls back to a
//! fixed width. A minimal model is always preferable to no model — the only
//! fatal condition is an unknown architecture family.

use burn::{
    module::{Ignored, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2dConfig, MaxPool2dConfig},
        BatchNormConfig, Gelu, LeakyReluConfig, LinearConfig, PaddingConfig2d, Relu, Sigmoid,
        Tanh,
    },
    tensor::{backend::Backend, Tensor},
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{IMAGE_SIZE, NUM_CHANNELS, NUM_CLASSES};

use super::config::{ActivationKind, ArchitectureConfig, ArchitectureFamily};
use super::layers::{DenseBlock, DynLayer, Feature, ForwardError, ResidualBlock, SqueezeExcite, Stage};

/// Pooling is only appended while the post-convolution spatial dimension is
/// at least this large; below it the pooling stage is skipped with a warning.
pub const MIN_POOL_DIM: usize = 2;

/// Flattened feature width assumed when the synthetic probe of the feature
/// stack fails. The classifier head must be constructible regardless.
pub const FALLBACK_FEATURE_WIDTH: usize = 256;

/// Channel widths of the small residual backbone.
const RESNET_WIDTHS: [usize; 3] = [16, 32, 64];

/// Stem width, per-layer growth, and layers-per-block of the small
/// densely-connected backbone.
const DENSENET_STEM: usize = 16;
const DENSENET_GROWTH: usize = 8;
const DENSENET_BLOCK_LAYERS: usize = 2;

/// Fatal build failures. Geometry problems never appear here.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown architecture family '{0}'")]
    UnknownFamily(String),
}

/// An executable model built from a declarative config.
///
/// `features` maps `[batch, 1, 28, 28]` to a feature representation and
/// `classifier` maps that to `[batch, 10]` logits. The family tag selects
/// the structure-specific accessors (first convolution, graph roots) chosen
/// once at build time.
#[derive(Module, Debug)]
pub struct DynamicCnn<B: Backend> {
    pub features: DynLayer<B>,
    pub classifier: DynLayer<B>,
    pub family: Ignored<ArchitectureFamily>,
}

impl<B: Backend> DynamicCnn<B> {
    /// Full forward pass to class logits.
    pub fn forward(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>, ForwardError> {
        let features = self.features.forward(Feature::Map(input))?;
        match self.classifier.forward(features)? {
            Feature::Flat(logits) => Ok(logits),
            other => Err(ForwardError::Rank {
                layer: "classifier",
                expected: "2-D",
                got: match other {
                    Feature::Map(_) => "4-D",
                    Feature::Flat(_) => "2-D",
                },
            }),
        }
    }

    pub fn family(&self) -> ArchitectureFamily {
        self.family.0
    }

    /// The model's top-level children for graph traversal, per family: the
    /// layered families expose their feature stack and classifier stack in
    /// that order; backbones expose the backbone's direct children followed
    /// by the classifier head.
    pub fn graph_roots(&self) -> Vec<(String, &DynLayer<B>)> {
        match self.family.0 {
            ArchitectureFamily::Plain | ArchitectureFamily::Attention => vec![
                ("features".to_string(), &self.features),
                ("classifier".to_string(), &self.classifier),
            ],
            ArchitectureFamily::ResNet | ArchitectureFamily::DenseNet => {
                let mut roots: Vec<(String, &DynLayer<B>)> = self
                    .features
                    .children()
                    .into_iter()
                    .map(|(name, child)| (format!("features.{name}"), child))
                    .collect();
                roots.push(("classifier".to_string(), &self.classifier));
                roots
            }
        }
    }

    /// The first spatial convolution, located per family. Used for kernel
    /// visualization; `None` only for a degenerate layered model whose trunk
    /// was truncated to zero stages.
    pub fn first_conv(&self) -> Option<&Conv2d<B>> {
        match self.family.0 {
            // Layered trunk: first stage, first entry.
            ArchitectureFamily::Plain | ArchitectureFamily::Attention => {
                self.features.child("0")?.child("0")?.as_conv()
            }
            // Backbones: stem stage, first entry.
            ArchitectureFamily::ResNet | ArchitectureFamily::DenseNet => {
                self.features.child("0")?.child("0")?.as_conv()
            }
        }
    }

    /// The weight tensor of the first spatial convolution.
    pub fn first_conv_weight(&self) -> Option<Tensor<B, 4>> {
        self.first_conv().map(|conv| conv.weight.val())
    }
}

/// Build an executable model for the given config.
///
/// An unrecognized architecture family is the only fatal error; everything
/// else degrades with a warning.
pub fn build_model<B: Backend>(
    config: &ArchitectureConfig,
    device: &B::Device,
) -> Result<DynamicCnn<B>, BuildError> {
    let family = ArchitectureFamily::parse(&config.architecture)
        .ok_or_else(|| BuildError::UnknownFamily(config.architecture.clone()))?;

    let model = match family {
        ArchitectureFamily::Plain => build_layered(config, family, device),
        ArchitectureFamily::Attention => build_layered(config, family, device),
        ArchitectureFamily::ResNet => build_resnet(config, device),
        ArchitectureFamily::DenseNet => build_densenet(config, device),
    };

    debug!(
        family = family.name(),
        params = model.num_params(),
        "Model built"
    );
    Ok(model)
}

/// Build the plain or attention-augmented layered CNN.
fn build_layered<B: Backend>(
    config: &ArchitectureConfig,
    family: ArchitectureFamily,
    device: &B::Device,
) -> DynamicCnn<B> {
    let with_attention = family == ArchitectureFamily::Attention;
    let mut channels = NUM_CHANNELS;
    let mut dim = IMAGE_SIZE;
    let mut stages: Vec<DynLayer<B>> = Vec::new();

    for (index, spec) in config.conv_layers.iter().enumerate() {
        if spec.num_filters == 0 || spec.kernel_size == 0 {
            warn!(
                layer = index,
                "Layer has zero filters or kernel size; dropping it and all following layers"
            );
            break;
        }

        let stride = spec.stride.max(1);
        let padding = spec.effective_padding();
        let out_dim = conv_output_dim(dim, spec.kernel_size, stride, padding);

        let Some(out_dim) = out_dim else {
            warn!(
                layer = index,
                input_dim = dim,
                kernel = spec.kernel_size,
                stride,
                padding,
                "Layer would produce a non-positive spatial size; dropping it and all following layers"
            );
            break;
        };

        let mut stage = Stage::new();
        stage.push(DynLayer::Conv(
            Conv2dConfig::new([channels, spec.num_filters], [spec.kernel_size, spec.kernel_size])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .init(device),
        ));
        if spec.batch_norm {
            stage.push(DynLayer::Norm(
                BatchNormConfig::new(spec.num_filters).init(device),
            ));
        }
        stage.push(activation_layer(ActivationKind::parse_or_default(
            &spec.activation,
        )));
        if with_attention {
            stage.push(DynLayer::Attention(squeeze_excite(
                spec.num_filters,
                config.reduction_ratio,
                device,
            )));
        }

        if out_dim >= MIN_POOL_DIM {
            stage.push(DynLayer::Pool(
                MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            ));
            dim = out_dim / 2;
        } else {
            warn!(
                layer = index,
                dim = out_dim,
                "Feature map too small to pool; skipping the pooling stage"
            );
            dim = out_dim;
        }

        channels = spec.num_filters;
        stages.push(DynLayer::Stage(stage));
    }

    let features = DynLayer::Stage(Stage::with_children(stages));
    let width = probed_feature_width(&features, device);
    let classifier = classifier_head(width, config.fc_layer.num_neurons, device);

    DynamicCnn {
        features,
        classifier,
        family: Ignored(family),
    }
}

/// Build the small residual backbone: single-channel stem, three residual
/// stages, global average pooling, then the configured head.
fn build_resnet<B: Backend>(config: &ArchitectureConfig, device: &B::Device) -> DynamicCnn<B> {
    let [w1, w2, w3] = RESNET_WIDTHS;

    let features = DynLayer::Stage(Stage::with_children(vec![
        conv_norm_act(NUM_CHANNELS, w1, 3, 1, 1, device),
        DynLayer::Residual(residual_block(w1, w1, 1, device)),
        DynLayer::Residual(residual_block(w1, w2, 2, device)),
        DynLayer::Residual(residual_block(w2, w3, 2, device)),
        DynLayer::GlobalPool(AdaptiveAvgPool2dConfig::new([1, 1]).init()),
    ]));

    let width = probed_feature_width(&features, device);
    let classifier = classifier_head(width, config.fc_layer.num_neurons, device);

    DynamicCnn {
        features,
        classifier,
        family: Ignored(ArchitectureFamily::ResNet),
    }
}

/// Build the small densely-connected backbone: single-channel stem, two
/// dense blocks separated by a 1x1 transition, global pooling, then the
/// configured head.
fn build_densenet<B: Backend>(config: &ArchitectureConfig, device: &B::Device) -> DynamicCnn<B> {
    let block = |in_channels: usize, device: &B::Device| {
        let mut layers = Vec::new();
        let mut channels = in_channels;
        for _ in 0..DENSENET_BLOCK_LAYERS {
            layers.push(dense_layer(channels, DENSENET_GROWTH, device));
            channels += DENSENET_GROWTH;
        }
        (DynLayer::Dense(DenseBlock::new(layers)), channels)
    };

    let (block1, after_block1) = block(DENSENET_STEM, device);
    let (block2, _) = block(DENSENET_STEM, device);

    let transition = DynLayer::Stage(Stage::with_children(vec![
        DynLayer::Conv(
            Conv2dConfig::new([after_block1, DENSENET_STEM], [1, 1]).init(device),
        ),
        DynLayer::Norm(BatchNormConfig::new(DENSENET_STEM).init(device)),
        DynLayer::Relu(Relu::new()),
        DynLayer::Pool(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
    ]));

    let features = DynLayer::Stage(Stage::with_children(vec![
        conv_norm_act(NUM_CHANNELS, DENSENET_STEM, 3, 1, 1, device),
        block1,
        transition,
        block2,
        DynLayer::GlobalPool(AdaptiveAvgPool2dConfig::new([1, 1]).init()),
    ]));

    let width = probed_feature_width(&features, device);
    let classifier = classifier_head(width, config.fc_layer.num_neurons, device);

    DynamicCnn {
        features,
        classifier,
        family: Ignored(ArchitectureFamily::DenseNet),
    }
}

/// Spatial size after a convolution, or `None` when non-positive.
fn conv_output_dim(dim: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let out = (dim as isize - kernel as isize + 2 * padding as isize)
        .div_euclid(stride as isize)
        + 1;
    (out > 0).then_some(out as usize)
}

/// Run a single zero sample through the feature stack to measure the
/// flattened width. Falls back to [`FALLBACK_FEATURE_WIDTH`] on any probe
/// failure so the head stays constructible.
fn probed_feature_width<B: Backend>(features: &DynLayer<B>, device: &B::Device) -> usize {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        feature_probe(features, device)
    }));
    match result {
        Ok(Ok(width)) => width,
        Ok(Err(err)) => {
            warn!(
                error = %err,
                fallback = FALLBACK_FEATURE_WIDTH,
                "Feature-width probe failed; using the fallback width"
            );
            FALLBACK_FEATURE_WIDTH
        }
        Err(_) => {
            warn!(
                fallback = FALLBACK_FEATURE_WIDTH,
                "Feature-width probe aborted; using the fallback width"
            );
            FALLBACK_FEATURE_WIDTH
        }
    }
}

fn feature_probe<B: Backend>(
    features: &DynLayer<B>,
    device: &B::Device,
) -> Result<usize, ForwardError> {
    let probe = Feature::zeros(&[NUM_CHANNELS, IMAGE_SIZE, IMAGE_SIZE], device)?;
    let out = features.forward(probe)?;
    Ok(out.shape().iter().product::<usize>().max(1))
}

/// The classifier head: flatten, hidden linear, ReLU, output linear.
fn classifier_head<B: Backend>(
    input_width: usize,
    neurons: usize,
    device: &B::Device,
) -> DynLayer<B> {
    let neurons = neurons.max(1);
    DynLayer::Stage(Stage::with_children(vec![
        DynLayer::flatten(),
        DynLayer::Linear(LinearConfig::new(input_width, neurons).init(device)),
        DynLayer::Relu(Relu::new()),
        DynLayer::Linear(LinearConfig::new(neurons, NUM_CLASSES).init(device)),
    ]))
}

fn activation_layer<B: Backend>(kind: ActivationKind) -> DynLayer<B> {
    match kind {
        ActivationKind::Relu => DynLayer::Relu(Relu::new()),
        ActivationKind::LeakyRelu => DynLayer::LeakyRelu(LeakyReluConfig::new().init()),
        ActivationKind::Gelu => DynLayer::Gelu(Gelu::new()),
        ActivationKind::Sigmoid => DynLayer::Sigmoid(Sigmoid::new()),
        ActivationKind::Tanh => DynLayer::Tanh(Tanh::new()),
    }
}

/// A conv / norm / ReLU stem stage.
fn conv_norm_act<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> DynLayer<B> {
    DynLayer::Stage(Stage::with_children(vec![
        DynLayer::Conv(
            Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .init(device),
        ),
        DynLayer::Norm(BatchNormConfig::new(out_channels).init(device)),
        DynLayer::Relu(Relu::new()),
    ]))
}

/// A two-conv residual block with an optional projection shortcut.
fn residual_block<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> ResidualBlock<B> {
    let body = DynLayer::Stage(Stage::with_children(vec![
        DynLayer::Conv(
            Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
        ),
        DynLayer::Norm(BatchNormConfig::new(out_channels).init(device)),
        DynLayer::Relu(Relu::new()),
        DynLayer::Conv(
            Conv2dConfig::new([out_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
        ),
        DynLayer::Norm(BatchNormConfig::new(out_channels).init(device)),
    ]));

    let shortcut = (stride != 1 || in_channels != out_channels).then(|| {
        DynLayer::Stage(Stage::with_children(vec![
            DynLayer::Conv(
                Conv2dConfig::new([in_channels, out_channels], [1, 1])
                    .with_stride([stride, stride])
                    .init(device),
            ),
            DynLayer::Norm(BatchNormConfig::new(out_channels).init(device)),
        ]))
    });

    ResidualBlock::new(body, shortcut)
}

/// A norm / ReLU / conv dense layer producing `growth` channels.
fn dense_layer<B: Backend>(in_channels: usize, growth: usize, device: &B::Device) -> DynLayer<B> {
    DynLayer::Stage(Stage::with_children(vec![
        DynLayer::Norm(BatchNormConfig::new(in_channels).init(device)),
        DynLayer::Relu(Relu::new()),
        DynLayer::Conv(
            Conv2dConfig::new([in_channels, growth], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
        ),
    ]))
}

/// A squeeze-excitation block for `channels` with the given reduction ratio.
fn squeeze_excite<B: Backend>(
    channels: usize,
    reduction: usize,
    device: &B::Device,
) -> SqueezeExcite<B> {
    let hidden = (channels / reduction.max(1)).max(1);
    SqueezeExcite {
        pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        fc1: LinearConfig::new(channels, hidden).init(device),
        fc2: LinearConfig::new(hidden, channels).init(device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;
    use crate::model::config::{ConvLayerSpec, FcLayerSpec};

    type B = InferenceBackend;

    fn layered_config(filters: &[usize]) -> ArchitectureConfig {
        ArchitectureConfig {
            architecture: "plain".to_string(),
            conv_layers: filters.iter().map(|&f| ConvLayerSpec::new(f, 3)).collect(),
            fc_layer: FcLayerSpec { num_neurons: 64 },
            reduction_ratio: 8,
        }
    }

    fn forward_batch(model: &DynamicCnn<B>, batch: usize) -> Vec<usize> {
        let device = Default::default();
        let input = Tensor::<B, 4>::zeros([batch, 1, 28, 28], &device);
        model.forward(input).unwrap().dims().to_vec()
    }

    #[test]
    fn test_plain_two_layer_output_shape() {
        let device = Default::default();
        let model = build_model::<B>(&layered_config(&[8, 16]), &device).unwrap();
        assert_eq!(forward_batch(&model, 4), vec![4, 10]);
    }

    #[test]
    fn test_empty_trunk_still_classifies() {
        let device = Default::default();
        let model = build_model::<B>(&layered_config(&[]), &device).unwrap();
        assert_eq!(forward_batch(&model, 2), vec![2, 10]);
    }

    #[test]
    fn test_invalid_geometry_truncates_but_builds() {
        // First layer shrinks 28 -> 6 -> pool -> 3; the second would produce
        // 3 - 5 + 1 = -1, so it and the third are dropped.
        let mut config = layered_config(&[4, 8, 16]);
        config.conv_layers[0] = ConvLayerSpec {
            num_filters: 4,
            kernel_size: 7,
            stride: 4,
            padding: Some(0),
            activation: "relu".to_string(),
            batch_norm: true,
        };
        config.conv_layers[1] = ConvLayerSpec {
            num_filters: 8,
            kernel_size: 5,
            stride: 1,
            padding: Some(0),
            activation: "relu".to_string(),
            batch_norm: true,
        };

        let device = Default::default();
        let model = build_model::<B>(&config, &device).unwrap();
        assert_eq!(model.features.children().len(), 1);
        assert_eq!(forward_batch(&model, 2), vec![2, 10]);
    }

    #[test]
    fn test_pooling_skipped_when_map_too_small() {
        // Dims with pooling: 28 -> 14 -> 7 -> 3 -> 1; the fifth stage keeps
        // the 1x1 map and must skip its pooling stage.
        let device = Default::default();
        let model = build_model::<B>(&layered_config(&[4, 4, 4, 4, 4]), &device).unwrap();

        let stages = model.features.children();
        assert_eq!(stages.len(), 5);
        // conv + norm + act + pool
        assert_eq!(stages[3].1.children().len(), 4);
        // conv + norm + act, no pool
        assert_eq!(stages[4].1.children().len(), 3);
        assert_eq!(forward_batch(&model, 1), vec![1, 10]);
    }

    #[test]
    fn test_unknown_family_is_fatal() {
        let mut config = layered_config(&[8]);
        config.architecture = "transformer".to_string();
        let device: <B as burn::tensor::backend::Backend>::Device = Default::default();
        let result = build_model::<B>(&config, &device);
        assert!(matches!(result, Err(BuildError::UnknownFamily(_))));
    }

    #[test]
    fn test_attention_family_inserts_squeeze_excite() {
        let mut config = layered_config(&[8, 16]);
        config.architecture = "attention".to_string();
        let device = Default::default();
        let model = build_model::<B>(&config, &device).unwrap();

        let first_stage = model.features.child("0").unwrap();
        let tags: Vec<_> = first_stage
            .children()
            .iter()
            .map(|(_, c)| c.type_tag())
            .collect();
        assert!(tags.contains(&"SqueezeExcite"));
        assert_eq!(forward_batch(&model, 2), vec![2, 10]);
    }

    #[test]
    fn test_backbones_build_and_classify() {
        let device = Default::default();
        for family in ["resnet", "densenet"] {
            let mut config = layered_config(&[]);
            config.architecture = family.to_string();
            let model = build_model::<B>(&config, &device).unwrap();
            assert_eq!(forward_batch(&model, 2), vec![2, 10], "family {family}");

            let weight = model.first_conv_weight().expect("backbone stem conv");
            // Single-channel stem.
            assert_eq!(weight.dims()[1], 1);
        }
    }

    #[test]
    fn test_first_conv_weight_layered() {
        let device = Default::default();
        let model = build_model::<B>(&layered_config(&[8, 16]), &device).unwrap();
        let weight = model.first_conv_weight().unwrap();
        assert_eq!(weight.dims(), [8, 1, 3, 3]);
    }

    #[test]
    fn test_probe_failure_reports_error() {
        let device: <B as burn::tensor::backend::Backend>::Device = Default::default();
        // A linear layer cannot consume the 4-D probe directly.
        let broken: DynLayer<B> = DynLayer::Stage(Stage::with_children(vec![DynLayer::Linear(
            LinearConfig::new(10, 10).init(&device),
        )]));
        assert!(feature_probe(&broken, &device).is_err());
        assert_eq!(probed_feature_width(&broken, &device), FALLBACK_FEATURE_WIDTH);
    }

    #[test]
    fn test_conv_output_dim() {
        // floor((dim - kernel + 2 * padding) / stride) + 1
        assert_eq!(conv_output_dim(28, 3, 1, 1), Some(28));
        assert_eq!(conv_output_dim(28, 5, 2, 0), Some(12));
        assert_eq!(conv_output_dim(3, 5, 1, 0), None);
        assert_eq!(conv_output_dim(1, 3, 1, 1), Some(1));
    }
}
