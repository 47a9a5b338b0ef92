//! Digit dataset items, sources, and batching.

use anyhow::Result;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::vision::MnistDataset;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{IMAGE_SIZE, NUM_CHANNELS, NUM_CLASSES};

/// A single digit sample: raw grayscale pixels in `[0, 255]`, row-major.
#[derive(Clone, Debug)]
pub struct DigitItem {
    pub image: Vec<f32>,
    pub label: usize,
}

/// An in-memory digit dataset, either a bounded MNIST subset or synthetic.
#[derive(Clone, Debug)]
pub struct DigitDataset {
    items: Vec<DigitItem>,
}

impl DigitDataset {
    /// Load up to `limit` samples of the MNIST training split. The split is
    /// downloaded and cached by Burn on first use.
    pub fn mnist_train(limit: usize) -> Result<Self> {
        let source = MnistDataset::train();
        let take = limit.min(source.len());

        let items = (0..take)
            .filter_map(|index| source.get(index))
            .map(|item| DigitItem {
                image: item.image.iter().flat_map(|row| row.iter().copied()).collect(),
                label: item.label as usize,
            })
            .collect();

        Ok(Self { items })
    }

    /// A deterministic synthetic dataset of random noise images, for tests
    /// and offline runs where the real data is unavailable.
    pub fn synthetic(samples: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pixels = NUM_CHANNELS * IMAGE_SIZE * IMAGE_SIZE;

        let items = (0..samples)
            .map(|_| DigitItem {
                image: (0..pixels).map(|_| rng.gen_range(0.0..=255.0)).collect(),
                label: rng.gen_range(0..NUM_CLASSES),
            })
            .collect();

        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Dataset<DigitItem> for DigitDataset {
    fn get(&self, index: usize) -> Option<DigitItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A training batch of digit images.
#[derive(Clone, Debug)]
pub struct DigitBatch<B: Backend> {
    /// `[batch, 1, 28, 28]`, normalized to roughly `[-1, 1]`.
    pub images: Tensor<B, 4>,
    /// `[batch]` class labels.
    pub targets: Tensor<B, 1, Int>,
}

/// Batcher turning digit items into normalized tensors.
#[derive(Clone, Debug, Default)]
pub struct DigitBatcher;

impl<B: Backend> Batcher<B, DigitItem, DigitBatch<B>> for DigitBatcher {
    fn batch(&self, items: Vec<DigitItem>, device: &B::Device) -> DigitBatch<B> {
        let batch_size = items.len();

        // Scale to [0, 1] then normalize with mean 0.5 / std 0.5, matching
        // what the client-side preview assumes.
        let images_data: Vec<f32> = items
            .iter()
            .flat_map(|item| item.image.iter().map(|&p| (p / 255.0 - 0.5) / 0.5))
            .collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(
                images_data,
                [batch_size, NUM_CHANNELS, IMAGE_SIZE, IMAGE_SIZE],
            ),
            device,
        );

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        DigitBatch { images, targets }
    }
}
