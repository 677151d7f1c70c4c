//! Per-process client records

use dashmap::DashMap;
use std::sync::{Arc, Weak};

use crate::audio::heap::SharedHeap;
use crate::protocol::Pid;

/// pid → live client
pub type ClientRegistry = Arc<DashMap<Pid, Weak<Client>>>;

/// A client process. Created on its first track request and kept alive by
/// its tracks; unregisters itself when the last one goes.
pub struct Client {
    pid: Pid,
    heap: SharedHeap,
    registry: ClientRegistry,
}

impl Client {
    /// Existing client for `pid`, or a fresh one with its own heap
    pub fn get_or_create(registry: &ClientRegistry, pid: Pid, heap_size: usize) -> Arc<Client> {
        let mut entry = registry.entry(pid).or_insert_with(Weak::new);
        if let Some(client) = entry.upgrade() {
            return client;
        }
        let client = Arc::new(Client {
            pid,
            heap: SharedHeap::new(format!("client {pid}"), heap_size),
            registry: Arc::clone(registry),
        });
        *entry = Arc::downgrade(&client);
        tracing::debug!("Registered client {}", pid);
        client
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn heap(&self) -> &SharedHeap {
        &self.heap
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // A newer client for the same pid may already be registered
        self.registry
            .remove_if(&self.pid, |_, weak| weak.strong_count() == 0);
        tracing::debug!("Client {} gone", self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_and_unregister() {
        let registry: ClientRegistry = Arc::new(DashMap::new());
        let a = Client::get_or_create(&registry, 7, 1024);
        let b = Client::get_or_create(&registry, 7, 1024);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_heap_per_client() {
        let registry: ClientRegistry = Arc::new(DashMap::new());
        let a = Client::get_or_create(&registry, 1, 100);
        let b = Client::get_or_create(&registry, 2, 100);
        let _block = a.heap().allocate(100).unwrap();
        assert!(a.heap().allocate(1).is_err());
        assert!(b.heap().allocate(100).is_ok());
    }
}
