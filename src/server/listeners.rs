//! Config-change listener registry

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::protocol::IoConfigNotification;

/// Receiver of io open/close/reconfigure notifications
pub trait ConfigListener: Send {
    /// Deliver one notification. `false` means the listener is gone and
    /// should be dropped.
    fn io_config_changed(&self, notification: &IoConfigNotification) -> bool;
}

impl ConfigListener for Sender<IoConfigNotification> {
    fn io_config_changed(&self, notification: &IoConfigNotification) -> bool {
        self.send(notification.clone()).is_ok()
    }
}

/// Registered listeners, pruned on disconnect
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<(Uuid, Box<dyn ConfigListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Box<dyn ConfigListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.lock().push((id, listener));
        tracing::debug!("Listener {} registered", id);
        id
    }

    /// `false` if `id` was not registered
    pub fn unregister(&self, id: Uuid) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        before != listeners.len()
    }

    pub fn notify(&self, notification: &IoConfigNotification) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|(id, listener)| {
            let alive = listener.io_config_changed(notification);
            if !alive {
                tracing::debug!("Listener {} disconnected", id);
            }
            alive
        });
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
