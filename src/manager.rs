//! Per-process asynchronous producer manager: a background thread that
//! batches outbound posts across every bus the process owns, so `post()`
//! callers never block on the cross-process write lock.
//!
//! Grounded on `original_source/CCshm/CCshm_py.cxx`'s `_bus_manager`
//! (`add_bus`/`remove_bus`/`post` dispatching into a shared manager object
//! owned by the host-language binding). Its manual `retain`/`release`
//! reference counting (`CCObject`) is expressed here as `Arc<EventBus>`
//! clones held for the lifetime of a batch.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::bus::EventBus;

struct PendingEntry {
    bus: Arc<EventBus>,
    messages: Vec<Vec<u8>>,
}

#[derive(Default)]
struct ManagerState {
    entries: HashMap<usize, PendingEntry>,
    pending_count: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<ManagerState>,
    cond: Condvar,
}

/// A background thread that coalesces bursts of `post()` calls into batched
/// `post_many()` calls, one per bus per wakeup.
pub struct EventBusManager {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventBusManager {
    pub fn new() -> EventBusManager {
        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState::default()),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("eventbus-manager".into())
            .spawn(move || Self::run(worker))
            .expect("failed to spawn event bus manager thread");
        EventBusManager { shared, thread: Some(thread) }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let snapshot = {
                let mut state = shared.state.lock().unwrap();
                while state.pending_count == 0 && !state.shutdown {
                    state = shared.cond.wait(state).unwrap();
                }
                if state.shutdown && state.pending_count == 0 {
                    break;
                }
                let mut snapshot = Vec::with_capacity(state.entries.len());
                for entry in state.entries.values_mut() {
                    if !entry.messages.is_empty() {
                        let messages = std::mem::take(&mut entry.messages);
                        snapshot.push((Arc::clone(&entry.bus), messages));
                    }
                }
                state.pending_count = 0;
                snapshot
            };

            for (bus, messages) in snapshot {
                let refs: Vec<&[u8]> = messages.iter().map(Vec::as_slice).collect();
                let batch_len = refs.len();
                if !bus.post_many(&refs) && batch_len > 0 {
                    tracing::warn!(batch_len, "manager batch entirely rejected by post_many");
                } else if batch_len > 1 {
                    tracing::debug!(batch_len, "manager flushed a coalesced batch");
                }
                // `bus` (an `Arc<EventBus>` clone) is dropped here, after the
                // post has returned — the load-bearing retain/release
                // discipline from the original binding's manager.
            }
        }
    }

    /// Start tracking `bus`: future `post()` calls for it are queued here
    /// instead of going straight to the bus.
    pub fn add_bus(&self, bus: Arc<EventBus>) {
        let mut state = self.shared.state.lock().unwrap();
        let key = Arc::as_ptr(&bus) as usize;
        state.entries.insert(key, PendingEntry { bus, messages: Vec::new() });
    }

    /// Stop tracking `bus`, dropping any payloads that never made it out.
    pub fn remove_bus(&self, bus: &Arc<EventBus>) {
        let mut state = self.shared.state.lock().unwrap();
        let key = Arc::as_ptr(bus) as usize;
        state.entries.remove(&key);
    }

    /// Queue `payload` for `bus` and return immediately; the background
    /// thread will deliver it (possibly coalesced with other pending
    /// payloads for the same bus) on its next wakeup.
    pub fn post(&self, bus: &Arc<EventBus>, payload: Vec<u8>) {
        let mut state = self.shared.state.lock().unwrap();
        let key = Arc::as_ptr(bus) as usize;
        match state.entries.get_mut(&key) {
            Some(entry) => {
                entry.messages.push(payload);
                state.pending_count += 1;
                self.shared.cond.notify_one();
            }
            None => tracing::warn!("post() called for a bus not registered with this manager"),
        }
    }
}

impl Default for EventBusManager {
    fn default() -> EventBusManager {
        EventBusManager::new()
    }
}

impl Drop for EventBusManager {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
