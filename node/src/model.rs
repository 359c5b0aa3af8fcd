use controller::{ModelCapability, ModelState, TrainErr};
use corpus::{Batch, collate::VOCAB_SIZE};

/// Tiny byte-unigram capability for exercising the pipeline end to end.
///
/// One logit per vocabulary id, pushed toward 1.0 for every real token it
/// sees, trained with SGD plus momentum. Stands in for the real
/// sequence-to-sequence model behind the same opaque interface.
pub struct UnigramModel {
    params: Vec<f32>,
    momentum: Vec<f32>,
    grad: Vec<f32>,
    batch_grad: Vec<f32>,
    updates: u64,
    lr: f32,
    mu: f32,
}

impl UnigramModel {
    pub fn new(lr: f32, mu: f32) -> Self {
        Self {
            params: vec![0.0; VOCAB_SIZE],
            momentum: vec![0.0; VOCAB_SIZE],
            grad: vec![0.0; VOCAB_SIZE],
            batch_grad: vec![0.0; VOCAB_SIZE],
            updates: 0,
            lr,
            mu,
        }
    }
}

impl ModelCapability for UnigramModel {
    fn forward(&mut self, batch: &Batch) -> f32 {
        self.batch_grad.fill(0.0);
        let mut loss = 0.0;
        let mut count = 0usize;

        for (row, mask) in batch.rows.iter().zip(batch.mask.iter()) {
            for (&token, &real) in row.iter().zip(mask.iter()) {
                if !real {
                    continue;
                }
                let p = self.params[token as usize];
                loss += (p - 1.0) * (p - 1.0);
                self.batch_grad[token as usize] += 2.0 * (p - 1.0);
                count += 1;
            }
        }

        let denom = count.max(1) as f32;
        for g in &mut self.batch_grad {
            *g /= denom;
        }
        loss / denom
    }

    fn backward(&mut self, _loss: f32) {
        for (acc, g) in self.grad.iter_mut().zip(self.batch_grad.iter()) {
            *acc += *g;
        }
    }

    fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    fn optimizer_step(&mut self) {
        for ((p, v), g) in self
            .params
            .iter_mut()
            .zip(self.momentum.iter_mut())
            .zip(self.grad.iter())
        {
            *v = self.mu * *v + *g;
            *p -= self.lr * *v;
        }
        self.grad.fill(0.0);
        self.updates += 1;
    }

    fn state(&self) -> ModelState {
        ModelState {
            tensors: vec![
                ("model.logits".to_string(), self.params.clone()),
                ("opt.momentum".to_string(), self.momentum.clone()),
                ("opt.updates".to_string(), vec![self.updates as f32]),
            ],
        }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), TrainErr> {
        for (name, target) in [
            ("model.logits", &mut self.params),
            ("opt.momentum", &mut self.momentum),
        ] {
            let source = state.tensor(name).ok_or_else(|| TrainErr::StateMismatch {
                tensor: name.to_string(),
                got: 0,
                expected: VOCAB_SIZE,
            })?;
            if source.len() != target.len() {
                return Err(TrainErr::StateMismatch {
                    tensor: name.to_string(),
                    got: source.len(),
                    expected: target.len(),
                });
            }
            target.copy_from_slice(source);
        }

        self.updates = state
            .tensor("opt.updates")
            .and_then(|v| v.first())
            .copied()
            .unwrap_or(0.0) as u64;
        Ok(())
    }
}
