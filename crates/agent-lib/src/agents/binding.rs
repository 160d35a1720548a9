//! Which artifact an ML or hybrid agent scores with

use super::{AgentContext, ModelRef};
use crate::error::ConfigError;
use crate::model::{LoadedModel, ModelLifecycleManager, DEFAULT_SLOT};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

pub(crate) enum ModelBinding {
    /// A path or a pinned registry version, loaded once at start
    Fixed {
        source: ModelRef,
        manager: Arc<ModelLifecycleManager>,
        loaded: RwLock<Option<Arc<LoadedModel>>>,
    },
    /// Whatever the slot currently has deployed
    Slot {
        slot: String,
        rx: watch::Receiver<Option<Arc<LoadedModel>>>,
    },
}

impl ModelBinding {
    pub(crate) fn new(model: ModelRef, ctx: &AgentContext) -> Result<Self, ConfigError> {
        let manager = ctx.models.clone().ok_or_else(|| {
            ConfigError::invalid("agentType", "model-backed agents need a model manager")
        })?;
        Ok(match model {
            ModelRef::Slot(slot) => ModelBinding::Slot {
                rx: manager.subscribe(&slot),
                slot,
            },
            source => ModelBinding::Fixed {
                source,
                manager,
                loaded: RwLock::new(None),
            },
        })
    }

    /// Make an artifact available; `Err` carries why none is
    pub(crate) async fn load(&self) -> Result<(), String> {
        match self {
            ModelBinding::Fixed {
                source,
                manager,
                loaded,
            } => {
                let result = match source {
                    ModelRef::Path(path) => manager.load_bundle(path, DEFAULT_SLOT).await,
                    ModelRef::Version(version) => manager.load_version(version).await,
                    ModelRef::Slot(slot) => {
                        return Err(format!("slot `{}` is not a fixed model", slot))
                    }
                };
                let model = result.map_err(|e| e.to_string())?;
                *loaded.write().unwrap_or_else(PoisonError::into_inner) = Some(model);
                Ok(())
            }
            ModelBinding::Slot { slot, rx } => {
                if rx.borrow().is_some() {
                    Ok(())
                } else {
                    Err(format!("slot `{}` has no deployed version", slot))
                }
            }
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<LoadedModel>> {
        match self {
            ModelBinding::Fixed { loaded, .. } => {
                loaded.read().unwrap_or_else(PoisonError::into_inner).clone()
            }
            ModelBinding::Slot { rx, .. } => rx.borrow().clone(),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            ModelBinding::Fixed { source, .. } => source.to_string(),
            ModelBinding::Slot { slot, .. } => format!("slot:{}", slot),
        }
    }
}
