//! Declarative model and training configuration.
//!
//! These are the wire-facing types a client submits with a `start_training`
//! request. Field names follow the client protocol (camelCase); defaults
//! match the values the frontend assumes when a field is omitted.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Declarative description of a network architecture.
///
/// Immutable once a run starts: the coordinator clones it into the worker
/// and never looks at it again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureConfig {
    /// Architecture family selector: "plain", "attention", "resnet" or
    /// "densenet". Unknown names are a fatal build error.
    #[serde(default = "default_family")]
    pub architecture: String,

    /// Ordered convolutional layer specs (plain/attention families).
    #[serde(default)]
    pub conv_layers: Vec<ConvLayerSpec>,

    /// Terminal fully-connected stage.
    #[serde(default)]
    pub fc_layer: FcLayerSpec,

    /// Channel reduction ratio for the attention family's
    /// squeeze-excitation blocks.
    #[serde(default = "default_reduction")]
    pub reduction_ratio: usize,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            architecture: default_family(),
            conv_layers: vec![ConvLayerSpec::new(8, 3), ConvLayerSpec::new(16, 3)],
            fc_layer: FcLayerSpec::default(),
            reduction_ratio: default_reduction(),
        }
    }
}

fn default_family() -> String {
    "plain".to_string()
}

fn default_reduction() -> usize {
    8
}

/// One convolutional stage of the plain/attention families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvLayerSpec {
    /// Number of output filters.
    pub num_filters: usize,

    /// Square kernel side length.
    pub kernel_size: usize,

    /// Convolution stride.
    #[serde(default = "default_stride")]
    pub stride: usize,

    /// Explicit padding. When omitted, defaults to `kernel_size / 2`
    /// ("same"-style padding for odd kernels), as the client assumes.
    #[serde(default)]
    pub padding: Option<usize>,

    /// Activation name ("relu", "leakyrelu", "gelu", "sigmoid", "tanh").
    /// Unrecognized names degrade to ReLU with a warning.
    #[serde(default = "default_activation")]
    pub activation: String,

    /// Whether to insert batch normalization after the convolution.
    #[serde(default = "default_true")]
    pub batch_norm: bool,
}

impl ConvLayerSpec {
    /// A spec with default stride, padding, activation and normalization.
    pub fn new(num_filters: usize, kernel_size: usize) -> Self {
        Self {
            num_filters,
            kernel_size,
            stride: default_stride(),
            padding: None,
            activation: default_activation(),
            batch_norm: true,
        }
    }

    /// Effective padding: the explicit value, or `kernel_size / 2`.
    pub fn effective_padding(&self) -> usize {
        self.padding.unwrap_or(self.kernel_size / 2)
    }
}

fn default_stride() -> usize {
    1
}

fn default_activation() -> String {
    "relu".to_string()
}

fn default_true() -> bool {
    true
}

/// The terminal fully-connected stage of the classifier head.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcLayerSpec {
    /// Width of the hidden linear layer.
    #[serde(default = "default_neurons")]
    pub num_neurons: usize,
}

impl Default for FcLayerSpec {
    fn default() -> Self {
        Self {
            num_neurons: default_neurons(),
        }
    }
}

fn default_neurons() -> usize {
    64
}

/// Training hyperparameters. Immutable once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingParams {
    /// Mini-batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Optimizer selection.
    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// Learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            optimizer: OptimizerKind::default(),
            learning_rate: default_learning_rate(),
        }
    }
}

fn default_batch_size() -> usize {
    128
}

fn default_epochs() -> usize {
    5
}

fn default_learning_rate() -> f64 {
    0.001
}

/// The closed set of supported optimizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
    RmsProp,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Adam
    }
}

/// The closed set of architecture families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureFamily {
    /// Plain layered CNN: conv/norm/activation/pool stages from the spec
    /// list, then the classifier head.
    Plain,
    /// The plain trunk with a squeeze-excitation block per stage.
    Attention,
    /// Small residual backbone with a single-channel stem.
    ResNet,
    /// Small densely-connected backbone with a single-channel stem.
    DenseNet,
}

impl ArchitectureFamily {
    /// Parse a family selector. `None` for unrecognized names; the builder
    /// turns that into a fatal error.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "plain" | "custom" => Some(Self::Plain),
            "attention" | "se" => Some(Self::Attention),
            "resnet" => Some(Self::ResNet),
            "densenet" => Some(Self::DenseNet),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Attention => "attention",
            Self::ResNet => "resnet",
            Self::DenseNet => "densenet",
        }
    }
}

/// Supported activation functions for layer specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Relu,
    LeakyRelu,
    Gelu,
    Sigmoid,
    Tanh,
}

impl ActivationKind {
    /// Parse an activation name, degrading to ReLU on anything
    /// unrecognized. A misspelled activation should not cost the client
    /// their whole model.
    pub fn parse_or_default(name: &str) -> Self {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "relu" => Self::Relu,
            "leakyrelu" => Self::LeakyRelu,
            "gelu" => Self::Gelu,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            other => {
                warn!("Unknown activation '{}', falling back to ReLU", other);
                Self::Relu
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_config_defaults() {
        let config: ArchitectureConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.architecture, "plain");
        assert_eq!(config.fc_layer.num_neurons, 64);
        assert_eq!(config.reduction_ratio, 8);
        assert!(config.conv_layers.is_empty());
    }

    #[test]
    fn test_wire_format_parsing() {
        // The exact shape the frontend sends.
        let json = r#"{
            "architecture": "plain",
            "convLayers": [
                {"numFilters": 8, "kernelSize": 3},
                {"numFilters": 16, "kernelSize": 5, "stride": 2, "padding": 0, "activation": "gelu", "batchNorm": false}
            ],
            "fcLayer": {"numNeurons": 128}
        }"#;
        let config: ArchitectureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.conv_layers.len(), 2);
        assert_eq!(config.conv_layers[0].num_filters, 8);
        assert_eq!(config.conv_layers[0].stride, 1);
        assert_eq!(config.conv_layers[0].effective_padding(), 1);
        assert_eq!(config.conv_layers[1].effective_padding(), 0);
        assert!(!config.conv_layers[1].batch_norm);
        assert_eq!(config.fc_layer.num_neurons, 128);
    }

    #[test]
    fn test_training_params_defaults() {
        let params: TrainingParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.batch_size, 128);
        assert_eq!(params.epochs, 5);
        assert_eq!(params.optimizer, OptimizerKind::Adam);
        assert!((params.learning_rate - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_optimizer_kind_wire_names() {
        let params: TrainingParams =
            serde_json::from_str(r#"{"optimizer": "rmsprop"}"#).unwrap();
        assert_eq!(params.optimizer, OptimizerKind::RmsProp);
        let params: TrainingParams =
            serde_json::from_str(r#"{"optimizer": "adamw"}"#).unwrap();
        assert_eq!(params.optimizer, OptimizerKind::AdamW);
    }

    #[test]
    fn test_family_parsing() {
        assert_eq!(ArchitectureFamily::parse("plain"), Some(ArchitectureFamily::Plain));
        assert_eq!(ArchitectureFamily::parse("ResNet"), Some(ArchitectureFamily::ResNet));
        assert_eq!(ArchitectureFamily::parse("densenet"), Some(ArchitectureFamily::DenseNet));
        assert_eq!(ArchitectureFamily::parse("vgg"), None);
    }

    #[test]
    fn test_activation_fallback() {
        assert_eq!(ActivationKind::parse_or_default("GELU"), ActivationKind::Gelu);
        assert_eq!(ActivationKind::parse_or_default("leaky_relu"), ActivationKind::LeakyRelu);
        assert_eq!(ActivationKind::parse_or_default("swish"), ActivationKind::Relu);
    }
}
