use crate::{loss_value, DartsStrategy, OneShotModule, PairedBatch, TrainingModule};
use anyhow::{anyhow, Result};
use log::info;

/// Pairs every training batch with a validation batch. The shorter list is cycled so
/// that one pass covers the longer list once.
#[derive(Clone, Debug)]
pub struct InterleavedTrainVal<B> {
    train: Vec<B>,
    val: Vec<B>,
}

impl<B: Clone> InterleavedTrainVal<B> {
    pub fn new(train: Vec<B>, val: Vec<B>) -> Result<Self> {
        if train.is_empty() || val.is_empty() {
            return Err(anyhow!(
                "Need at least one training and one validation batch, got {} and {}",
                train.len(),
                val.len()
            ));
        }
        Ok(Self { train, val })
    }

    pub fn len(&self) -> usize {
        self.train.len().max(self.val.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PairedBatch<B>> + '_ {
        (0..self.len()).map(move |i| PairedBatch {
            train: self.train[i % self.train.len()].clone(),
            val: self.val[i % self.val.len()].clone(),
        })
    }
}

/// Runs `max_epochs` passes over `data`. Returns the mean weight-phase loss of every
/// epoch.
pub fn training_loop<M, S>(
    module: &mut OneShotModule<M, S>,
    data: &InterleavedTrainVal<M::Batch>,
    max_epochs: usize,
) -> Result<Vec<f32>>
where
    M: TrainingModule,
    S: DartsStrategy,
{
    let mut epoch_losses = Vec::with_capacity(max_epochs);
    for epoch in 0..max_epochs {
        module.on_epoch_start(epoch, max_epochs)?;

        let mut loss_sum = 0.0;
        for (batch_idx, batch) in data.iter().enumerate() {
            let output = module.training_step(&batch, batch_idx)?;
            loss_sum += loss_value(&output.loss)?;
        }
        let mean_loss = loss_sum / data.len() as f32;
        info!("Epoch {}: mean training loss {:.4e}", epoch, mean_loss);
        epoch_losses.push(mean_loss);

        module.on_epoch_end(epoch)?;
    }
    Ok(epoch_losses)
}
