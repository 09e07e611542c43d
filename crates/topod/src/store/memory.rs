//! In-process versioned store.
//!
//! Keys form an implicit tree: a key is a directory when other keys live
//! beneath it. Every mutation bumps a global index; blocked watchers are woken
//! and re-check their prefix.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use super::{is_under, join_key, StoreClient, StoreError};

/// Deleted keys remembered individually. Older ones fold into
/// `State::compacted`.
const MAX_TOMBSTONES: usize = 1024;

#[derive(Debug, Default)]
struct State {
    index: u64,
    entries: BTreeMap<String, Entry>,
    /// Index at which each deleted key disappeared.
    tombstones: BTreeMap<String, u64>,
    /// Newest index among forgotten tombstones. Counts as a change under every
    /// prefix, so a watcher older than it re-reads.
    compacted: u64,
    subscribers: Vec<Sender<()>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    modified: u64,
}

impl State {
    /// Latest change index under `prefix`, including deletions.
    fn last_change(&self, prefix: &str) -> u64 {
        let live = self
            .entries
            .iter()
            .filter(|(k, _)| is_under(k, prefix))
            .map(|(_, e)| e.modified);
        let gone = self
            .tombstones
            .iter()
            .filter(|(k, _)| is_under(k, prefix))
            .map(|(_, i)| *i);
        live.chain(gone).max().unwrap_or(0).max(self.compacted)
    }

    fn compact(&mut self) {
        let excess = self.tombstones.len().saturating_sub(MAX_TOMBSTONES);
        if excess == 0 {
            return;
        }
        let mut oldest: Vec<(String, u64)> = self
            .tombstones
            .iter()
            .map(|(k, i)| (k.clone(), *i))
            .collect();
        oldest.sort_by_key(|(_, i)| *i);
        for (key, index) in oldest.into_iter().take(excess) {
            self.tombstones.remove(&key);
            self.compacted = self.compacted.max(index);
        }
    }

    fn notify(&mut self) {
        for subscriber in self.subscribers.drain(..) {
            let _ = subscriber.try_send(());
        }
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store. The index starts at 1 so a baseline read is never
    /// mistaken for "no baseline yet".
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                index: 1,
                ..State::default()
            }),
        }
    }

    /// Stores `value` at `key` and returns the new store index.
    pub fn set(&self, key: &str, value: impl Into<String>) -> u64 {
        let key = join_key("/", key);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.index += 1;
        let index = state.index;
        state.tombstones.remove(&key);
        state.entries.insert(
            key,
            Entry {
                value: value.into(),
                modified: index,
            },
        );
        state.notify();
        index
    }

    /// Removes `key` and everything beneath it. Returns the new store index,
    /// or `None` if nothing was removed.
    pub fn delete(&self, key: &str) -> Option<u64> {
        let key = join_key("/", key);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<String> = state
            .entries
            .keys()
            .filter(|k| is_under(k, &key))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return None;
        }
        state.index += 1;
        let index = state.index;
        for k in doomed {
            state.entries.remove(&k);
            state.tombstones.insert(k, index);
        }
        state.compact();
        state.notify();
        Some(index)
    }

    pub fn index(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .index
    }
}

impl StoreClient for MemoryStore {
    fn get_values(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = HashMap::new();
        for key in keys {
            let key = join_key("/", key);
            for (k, entry) in state.entries.iter().filter(|(k, _)| is_under(k, &key)) {
                values.insert(k.clone(), entry.value.clone());
            }
        }
        Ok(values)
    }

    fn watch_prefix(
        &self,
        prefix: &str,
        wait_index: u64,
        stop: &Receiver<()>,
    ) -> Result<u64, StoreError> {
        let prefix = join_key("/", prefix);
        loop {
            let wakeup = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if wait_index == 0 {
                    return Ok(state.index);
                }
                let changed = state.last_change(&prefix);
                if changed > wait_index {
                    return Ok(changed);
                }
                let (tx, rx) = bounded(1);
                state.subscribers.push(tx);
                rx
            };

            select! {
                recv(wakeup) -> _ => continue,
                recv(stop) -> _ => return Err(StoreError::Stopped),
            }
        }
    }
}
