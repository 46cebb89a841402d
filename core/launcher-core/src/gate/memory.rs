//! In-memory registry for tests and embedding.
//!
//! Registries created with [`MemoryRegistry::with_owner`] share one table, so
//! several of them behave like independent launcher processes on one machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ActivationRequest, HolderRole, InstanceHolder, InstanceRegistry, Registration};
use crate::error::Result;

#[derive(Debug)]
struct Entry {
    pid: u32,
    role: HolderRole,
    activations: Vec<ActivationRequest>,
}

#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    owner: u32,
    role: HolderRole,
    table: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryRegistry {
    pub fn new(owner: u32) -> Self {
        Self {
            owner,
            role: HolderRole::Launcher,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Another "process" sharing this registry's table.
    pub fn with_owner(&self, owner: u32) -> Self {
        Self {
            owner,
            role: HolderRole::Launcher,
            table: Arc::clone(&self.table),
        }
    }

    pub fn with_role(mut self, role: HolderRole) -> Self {
        self.role = role;
        self
    }

    pub fn holder(&self, key: &str) -> Option<u32> {
        self.table().get(key).map(|entry| entry.pid)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstanceRegistry for MemoryRegistry {
    fn owner(&self) -> u32 {
        self.owner
    }

    fn role(&self) -> HolderRole {
        self.role
    }

    fn register_if_absent(&self, key: &str) -> Result<Registration> {
        let mut table = self.table();
        if let Some(entry) = table.get(key) {
            return Ok(Registration::Existing(InstanceHolder {
                key: key.to_string(),
                pid: entry.pid,
                role: entry.role,
            }));
        }
        table.insert(
            key.to_string(),
            Entry {
                pid: self.owner,
                role: self.role,
                activations: Vec::new(),
            },
        );
        Ok(Registration::Registered)
    }

    fn redirect_to(&self, holder: &InstanceHolder, request: &ActivationRequest) -> Result<()> {
        if let Some(entry) = self.table().get_mut(&holder.key) {
            entry.activations.push(request.clone());
        }
        Ok(())
    }

    fn unregister(&self, key: &str) -> Result<()> {
        let mut table = self.table();
        if table.get(key).is_some_and(|entry| entry.pid == self.owner) {
            table.remove(key);
        }
        Ok(())
    }

    fn take_activations(&self, key: &str) -> Result<Vec<ActivationRequest>> {
        Ok(self
            .table()
            .get_mut(key)
            .map(|entry| std::mem::take(&mut entry.activations))
            .unwrap_or_default())
    }
}
