//! In-process service directory
//!
//! Every [`LocalDirectory`] created from the same [`LocalHub`] sees the
//! others' advertisements. Useful for running a presenter and a companion in
//! one process and for tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{DirectoryEvent, Origin, ServiceDirectory, ServiceRecord};

#[derive(Default)]
struct HubState {
    /// (service type, device id) -> record
    records: HashMap<(String, String), ServiceRecord>,
    subscribers: Vec<(String, mpsc::UnboundedSender<DirectoryEvent>)>,
}

impl HubState {
    fn broadcast(&mut self, service_type: &str, event: DirectoryEvent) {
        self.subscribers
            .retain(|(kind, tx)| kind != service_type || tx.send(event.clone()).is_ok());
    }
}

/// Shared registry of advertisements
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory browsing `service_type`. Records already published
    /// are replayed to the new receiver.
    pub fn directory(&self, service_type: &str) -> (LocalDirectory, mpsc::UnboundedReceiver<DirectoryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for ((kind, _), record) in state.records.iter() {
            if kind == service_type {
                let _ = tx.send(DirectoryEvent::Up {
                    txt: record.to_txt(),
                    origin: Origin::Advertisement,
                });
            }
        }
        state.subscribers.push((service_type.to_string(), tx));

        let directory = LocalDirectory {
            hub: self.clone(),
            service_type: service_type.to_string(),
            published: None,
        };
        (directory, rx)
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().records.len()
    }
}

/// One participant's handle on a [`LocalHub`]
pub struct LocalDirectory {
    hub: LocalHub,
    service_type: String,
    published: Option<String>,
}

impl ServiceDirectory for LocalDirectory {
    fn publish(&mut self, record: &ServiceRecord) {
        let mut state = self.hub.state.lock();
        if let Some(previous) = self.published.take() {
            if previous != record.device_id {
                state.records.remove(&(self.service_type.clone(), previous.clone()));
                state.broadcast(&self.service_type, DirectoryEvent::Down { device_id: previous });
            }
        }
        state
            .records
            .insert((self.service_type.clone(), record.device_id.clone()), record.clone());
        state.broadcast(
            &self.service_type,
            DirectoryEvent::Up {
                txt: record.to_txt(),
                origin: Origin::Advertisement,
            },
        );
        self.published = Some(record.device_id.clone());
    }

    fn unpublish(&mut self) {
        if let Some(device_id) = self.published.take() {
            let mut state = self.hub.state.lock();
            state.records.remove(&(self.service_type.clone(), device_id.clone()));
            state.broadcast(&self.service_type, DirectoryEvent::Down { device_id });
        }
    }
}

impl Drop for LocalDirectory {
    fn drop(&mut self) {
        self.unpublish();
    }
}
