use corpus::Batch;

use crate::error::Result;

/// Flat f32 state blobs keyed by tensor name: model parameters plus
/// whatever the optimizer needs to resume (moments, step counts).
#[derive(Debug, Clone, Default)]
pub struct ModelState {
    pub tensors: Vec<(String, Vec<f32>)>,
}

impl ModelState {
    pub fn tensor(&self, name: &str) -> Option<&[f32]> {
        self.tensors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// The opaque model capability the training loop drives.
///
/// Internals are never inspected by the core: the loop only runs
/// forward/backward, synchronizes the flat gradient buffer across ranks,
/// applies optimizer updates and moves state blobs in and out for
/// checkpointing.
///
/// `backward` accumulates into the gradient buffer; the buffer is owned by
/// the capability and cleared by `optimizer_step`.
pub trait ModelCapability: Send + Sync {
    /// Runs the forward pass and returns the scalar loss.
    fn forward(&mut self, batch: &Batch) -> f32;

    /// Accumulates this pass's gradient into the running buffer.
    fn backward(&mut self, loss: f32);

    /// The flat accumulated gradient, exposed for cross-rank aggregation.
    fn grad_mut(&mut self) -> &mut [f32];

    /// Applies one optimizer update from the accumulated gradient and
    /// clears the buffer.
    fn optimizer_step(&mut self);

    /// Serializes model and optimizer state for checkpointing.
    fn state(&self) -> ModelState;

    /// Restores state captured by [`ModelCapability::state`].
    fn load_state(&mut self, state: &ModelState) -> Result<()>;
}
