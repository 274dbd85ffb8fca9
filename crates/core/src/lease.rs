//! Scoped ownership of an expensive model: loaded on first lease, unloaded when the last lease drops.

use crate::error::CollaboratorError;
use crate::traits::ModelLoader;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

struct Slot<M> {
    model: Option<Arc<M>>,
    leases: usize,
    loads: usize,
}

struct Shared<L: ModelLoader> {
    loader: L,
    load_gate: tokio::sync::Mutex<()>,
    slot: Mutex<Slot<L::Model>>,
}

impl<L: ModelLoader> Shared<L> {
    fn slot(&self) -> MutexGuard<'_, Slot<L::Model>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ScopedModel<L: ModelLoader> {
    shared: Arc<Shared<L>>,
}

impl<L: ModelLoader> Clone for ScopedModel<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: ModelLoader> ScopedModel<L> {
    pub fn new(loader: L) -> Self {
        Self {
            shared: Arc::new(Shared {
                loader,
                load_gate: tokio::sync::Mutex::new(()),
                slot: Mutex::new(Slot {
                    model: None,
                    leases: 0,
                    loads: 0,
                }),
            }),
        }
    }

    /// Returns a lease on the model, loading it first if nobody holds one.
    pub async fn acquire(&self) -> Result<ModelLease<L>, CollaboratorError> {
        let _gate = self.shared.load_gate.lock().await;

        {
            let mut slot = self.shared.slot();
            if let Some(model) = &slot.model {
                let model = Arc::clone(model);
                slot.leases += 1;
                return Ok(self.lease(model));
            }
        }

        let model = Arc::new(self.shared.loader.load().await?);
        let mut slot = self.shared.slot();
        slot.model = Some(Arc::clone(&model));
        slot.leases += 1;
        slot.loads += 1;
        info!(loads = slot.loads, "model loaded");
        Ok(self.lease(model))
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.slot().model.is_some()
    }

    pub fn active_leases(&self) -> usize {
        self.shared.slot().leases
    }

    pub fn load_count(&self) -> usize {
        self.shared.slot().loads
    }

    fn lease(&self, model: Arc<L::Model>) -> ModelLease<L> {
        ModelLease {
            model: Some(model),
            shared: Arc::clone(&self.shared),
        }
    }
}

pub struct ModelLease<L: ModelLoader> {
    model: Option<Arc<L::Model>>,
    shared: Arc<Shared<L>>,
}

impl<L: ModelLoader> Deref for ModelLease<L> {
    type Target = L::Model;

    fn deref(&self) -> &Self::Target {
        match &self.model {
            Some(model) => model,
            None => unreachable!("lease model is only taken in drop"),
        }
    }
}

impl<L: ModelLoader> Drop for ModelLease<L> {
    fn drop(&mut self) {
        drop(self.model.take());

        let released = {
            let mut slot = self.shared.slot();
            slot.leases = slot.leases.saturating_sub(1);
            if slot.leases == 0 {
                slot.model.take()
            } else {
                None
            }
        };

        if let Some(model) = released {
            match Arc::try_unwrap(model) {
                Ok(model) => {
                    self.shared.loader.unload(model);
                    info!("model unloaded");
                }
                Err(_) => debug!("model still referenced, skipping unload"),
            }
        }
    }
}
