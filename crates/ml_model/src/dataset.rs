//! Dataset and batching for Burn training.

use burn::prelude::*;
use features::SequenceSet;

/// A single window with its target.
#[derive(Debug, Clone)]
pub struct SequenceItem {
    /// Flattened `[window][feature]` values.
    pub window: Vec<f32>,
    /// Next value of the target column.
    pub target: f32,
}

/// Dataset view over a [`SequenceSet`].
#[derive(Debug, Clone, Copy)]
pub struct SequenceDataset<'a> {
    sequences: &'a SequenceSet,
}

impl<'a> SequenceDataset<'a> {
    /// Wraps a set of sequences.
    #[must_use]
    pub const fn new(sequences: &'a SequenceSet) -> Self {
        Self { sequences }
    }
}

impl burn::data::dataset::Dataset<SequenceItem> for SequenceDataset<'_> {
    fn get(&self, index: usize) -> Option<SequenceItem> {
        let window = self.sequences.window(index)?;
        let target = *self.sequences.targets.get(index)?;
        Some(SequenceItem {
            window: window.to_vec(),
            target,
        })
    }

    fn len(&self) -> usize {
        self.sequences.len()
    }
}

/// A batch of training data.
#[derive(Debug, Clone)]
pub struct SequenceBatch<B: Backend> {
    /// Input tensor of shape `[batch_size, window, features]`.
    pub inputs: Tensor<B, 3>,
    /// Target tensor of shape `[batch_size, 1]`.
    pub targets: Tensor<B, 2>,
}

/// Batcher for creating training batches.
#[derive(Debug, Clone)]
pub struct SequenceBatcher<B: Backend> {
    device: B::Device,
    window_size: usize,
    feature_count: usize,
}

impl<B: Backend> SequenceBatcher<B> {
    /// Creates a new batcher for windows of the given shape.
    #[must_use]
    pub const fn new(device: B::Device, window_size: usize, feature_count: usize) -> Self {
        Self {
            device,
            window_size,
            feature_count,
        }
    }

    /// Creates a batch from a vector of items.
    pub fn batch(&self, items: Vec<SequenceItem>) -> SequenceBatch<B> {
        let batch_size = items.len();

        let mut inputs_data = Vec::with_capacity(batch_size * self.window_size * self.feature_count);
        let mut targets_data = Vec::with_capacity(batch_size);

        for item in items {
            inputs_data.extend_from_slice(&item.window);
            targets_data.push(item.target);
        }

        let inputs = Tensor::<B, 1>::from_floats(inputs_data.as_slice(), &self.device).reshape([
            batch_size,
            self.window_size,
            self.feature_count,
        ]);

        let targets = Tensor::<B, 1>::from_floats(targets_data.as_slice(), &self.device)
            .reshape([batch_size, 1]);

        SequenceBatch { inputs, targets }
    }

    /// Builds an input-only tensor from raw windows, for inference.
    pub fn inputs(&self, windows: &[f32]) -> Tensor<B, 3> {
        let stride = (self.window_size * self.feature_count).max(1);
        let batch_size = windows.len() / stride;
        Tensor::<B, 1>::from_floats(windows, &self.device).reshape([
            batch_size,
            self.window_size,
            self.feature_count,
        ])
    }
}
