//! Global Service Registry (component H): a process-wide, weak-referencing
//! table of well-known components, keyed by stable string identifier.
//!
//! The registry is a late-binding lookup for wiring components together, not
//! an ownership root — it never stores strong references, so a component
//! that drops its last strong handle disappears from the registry too.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

/// Well-known identifiers used by the host process at composition time.
pub mod ids {
    pub const EVENT_LOOP: &str = "event-loop";
    pub const MESSAGE_BUS: &str = "message-bus";
    pub const COMMAND_DISPATCHER: &str = "command-dispatcher";
    pub const CONFIG_MANAGER: &str = "config-manager";
    pub const SCRIPT_MANAGER: &str = "script-manager";
    pub const SCRIPT_ANALYZER: &str = "script-analyzer";
    pub const DEVICE_MANAGER: &str = "device-manager";
    pub const GUIDER_CLIENT: &str = "guider-client";
    pub const SEQUENCER: &str = "sequencer";
}

#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, Weak<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Publish a handle under `id`. Replaces any existing entry for `id`.
    /// The registry does not retain `handle` past this call.
    pub fn add<T: Any + Send + Sync + 'static>(&self, id: impl Into<String>, handle: &Arc<T>) {
        let id = id.into();
        debug!(%id, "ServiceRegistry::add: called");
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(handle) as Weak<dyn Any + Send + Sync>;
        self.entries.write().expect("registry lock poisoned").insert(id, weak);
    }

    /// Look up `id` and upgrade to a strong handle of type `T`. Returns
    /// `None` if the entry is missing, expired, or holds a different type.
    pub fn get<T: Any + Send + Sync + 'static>(&self, id: &str) -> Option<Arc<T>> {
        let weak = self.entries.read().expect("registry lock poisoned").get(id).cloned()?;
        let strong = weak.upgrade()?;
        match strong.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                debug!(id, "ServiceRegistry::get: entry present but type mismatch");
                None
            }
        }
    }

    /// Remove a stale or explicit entry for `id`.
    pub fn remove(&self, id: &str) {
        self.entries.write().expect("registry lock poisoned").remove(id);
    }

    /// Drop entries whose last strong handle has already gone away.
    pub fn prune_expired(&self) {
        self.entries.write().expect("registry lock poisoned").retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
