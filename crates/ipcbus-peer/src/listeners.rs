//! Local listener table.
//!
//! Several listeners in one process may watch the same channel. The broker
//! only needs to hear about the first subscription and the last
//! unsubscription, so the table reports both transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::event::BusEvent;

/// Callback invoked for every event on a subscribed channel.
pub type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Default)]
pub(crate) struct ListenerTable {
    next_id: u64,
    channels: HashMap<String, Vec<(ListenerId, Listener)>>,
}

impl ListenerTable {
    /// Registers a listener. The flag is true when it is the channel's first.
    pub(crate) fn add(&mut self, channel: &str, listener: Listener) -> (ListenerId, bool) {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        let listeners = self.channels.entry(channel.to_string()).or_default();
        let first = listeners.is_empty();
        listeners.push((id, listener));
        (id, first)
    }

    /// Removes one listener. `Some(true)` when it was the channel's last,
    /// `None` when it was not registered.
    pub(crate) fn remove(&mut self, channel: &str, id: ListenerId) -> Option<bool> {
        let listeners = self.channels.get_mut(channel)?;
        let position = listeners.iter().position(|(existing, _)| *existing == id)?;
        listeners.remove(position);
        let last = listeners.is_empty();
        if last {
            self.channels.remove(channel);
        }
        Some(last)
    }

    /// Removes every listener of `channel`, returning how many there were.
    pub(crate) fn remove_all(&mut self, channel: &str) -> usize {
        self.channels.remove(channel).map(|l| l.len()).unwrap_or(0)
    }

    /// Listeners of `channel`, cloned so they can run without the table lock.
    pub(crate) fn snapshot(&self, channel: &str) -> Vec<Listener> {
        self.channels
            .get(channel)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Listener {
        Arc::new(|_: &BusEvent| {})
    }

    #[test]
    fn test_first_and_last_transitions() {
        let mut table = ListenerTable::default();
        let (a, first) = table.add("x", noop());
        assert!(first);
        let (b, first) = table.add("x", noop());
        assert!(!first);
        assert_ne!(a, b);

        assert_eq!(table.remove("x", a), Some(false));
        assert_eq!(table.remove("x", a), None);
        assert_eq!(table.remove("x", b), Some(true));
        assert!(table.channels().is_empty());
    }

    #[test]
    fn test_remove_all_and_snapshot() {
        let mut table = ListenerTable::default();
        table.add("x", noop());
        table.add("x", noop());
        table.add("y", noop());
        assert_eq!(table.snapshot("x").len(), 2);
        assert_eq!(table.remove_all("x"), 2);
        assert_eq!(table.remove_all("x"), 0);
        assert!(table.snapshot("x").is_empty());
        assert_eq!(table.channels(), vec!["y".to_string()]);
    }
}
