//! Reference-counted channel subscriptions.
//!
//! Three levels, each entry removed as soon as it becomes empty:
//!
//! ```text
//! channel ──► connection key ──► peer id ──► subscription count
//!                  │
//!                  └── connection handle (used for fan-out)
//! ```
//!
//! A reverse index (connection key → channels) lets a closing connection be
//! released in one pass over only the channels it touched.
//!
//! The registry is generic over the handle type: the broker stores frame
//! senders, tests store whatever is convenient.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ipcbus_core::{PeerDescriptor, PeerId, StateRecord};

/// Identifies one accepted connection for its whole lifetime.
pub type ConnKey = u64;

#[derive(Debug)]
struct PeerEntry {
    descriptor: PeerDescriptor,
    count: u32,
}

#[derive(Debug)]
struct ConnEntry<H> {
    handle: H,
    peers: BTreeMap<PeerId, PeerEntry>,
}

/// Channel → connection → peer → count.
///
/// Invariant: no entry at any level is ever empty or zero-counted.
#[derive(Debug)]
pub struct ChannelRegistry<H> {
    channels: BTreeMap<String, BTreeMap<ConnKey, ConnEntry<H>>>,
    by_connection: HashMap<ConnKey, BTreeSet<String>>,
}

impl<H> Default for ChannelRegistry<H> {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            by_connection: HashMap::new(),
        }
    }
}

impl<H: Clone> ChannelRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one subscription of `peer` on `channel` through connection `conn`.
    ///
    /// Returns the peer's new count on that channel/connection.
    pub fn add_ref(&mut self, channel: &str, conn: ConnKey, handle: &H, peer: &PeerDescriptor) -> u32 {
        let connections = self.channels.entry(channel.to_string()).or_default();
        let entry = connections.entry(conn).or_insert_with(|| ConnEntry {
            handle: handle.clone(),
            peers: BTreeMap::new(),
        });
        let peer_entry = entry
            .peers
            .entry(peer.id.clone())
            .or_insert_with(|| PeerEntry {
                descriptor: peer.clone(),
                count: 0,
            });
        peer_entry.count = peer_entry.count.saturating_add(1);
        let count = peer_entry.count;

        self.by_connection
            .entry(conn)
            .or_default()
            .insert(channel.to_string());
        count
    }

    /// Removes one subscription of `peer` on `channel` through `conn`.
    ///
    /// Returns the remaining count, or `None` if no such entry existed.
    pub fn release(&mut self, channel: &str, conn: ConnKey, peer: &PeerId) -> Option<u32> {
        let connections = self.channels.get_mut(channel)?;
        let entry = connections.get_mut(&conn)?;
        let peer_entry = entry.peers.get_mut(peer)?;

        peer_entry.count = peer_entry.count.saturating_sub(1);
        let remaining = peer_entry.count;
        if remaining == 0 {
            entry.peers.remove(peer);
        }
        self.prune(channel, conn);
        Some(remaining)
    }

    /// Removes every peer of `conn` from `channel`.
    ///
    /// Returns how many peer entries were dropped.
    pub fn release_all(&mut self, channel: &str, conn: ConnKey) -> usize {
        let Some(connections) = self.channels.get_mut(channel) else {
            return 0;
        };
        let removed = connections
            .remove(&conn)
            .map(|entry| entry.peers.len())
            .unwrap_or(0);
        self.prune(channel, conn);
        removed
    }

    /// Removes every subscription made through `conn`.
    ///
    /// Returns the channels that were touched.
    pub fn release_connection(&mut self, conn: ConnKey) -> Vec<String> {
        let Some(channels) = self.by_connection.remove(&conn) else {
            return Vec::new();
        };
        for channel in &channels {
            if let Some(connections) = self.channels.get_mut(channel) {
                connections.remove(&conn);
                if connections.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }
        channels.into_iter().collect()
    }

    /// Removes every subscription of one peer made through `conn`, leaving the
    /// connection's other peers in place.
    ///
    /// Returns how many channels the peer was dropped from.
    pub fn release_peer(&mut self, conn: ConnKey, peer: &PeerId) -> usize {
        let channels: Vec<String> = match self.by_connection.get(&conn) {
            Some(channels) => channels.iter().cloned().collect(),
            None => return 0,
        };
        let mut released = 0;
        for channel in channels {
            let removed = self
                .channels
                .get_mut(&channel)
                .and_then(|connections| connections.get_mut(&conn))
                .and_then(|entry| entry.peers.remove(peer))
                .is_some();
            if removed {
                released += 1;
            }
            self.prune(&channel, conn);
        }
        released
    }

    /// Calls `f` for every connection subscribed to `channel`.
    ///
    /// Iterates over a snapshot, so `f` never observes a half-updated entry.
    pub fn for_each_channel<F>(&self, channel: &str, mut f: F)
    where
        F: FnMut(ConnKey, &H),
    {
        for (conn, handle) in self.subscribers(channel) {
            f(conn, &handle);
        }
    }

    /// Snapshot of the connections subscribed to `channel`, ordered by key.
    pub fn subscribers(&self, channel: &str) -> Vec<(ConnKey, H)> {
        self.channels
            .get(channel)
            .map(|connections| {
                connections
                    .iter()
                    .map(|(conn, entry)| (*conn, entry.handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Every live subscription, ordered by channel, connection, then peer.
    pub fn dump(&self) -> Vec<StateRecord> {
        self.channels
            .iter()
            .flat_map(|(channel, connections)| records(channel, connections))
            .collect()
    }

    /// Live subscriptions of a single channel.
    pub fn dump_channel(&self, channel: &str) -> Vec<StateRecord> {
        self.channels
            .get(channel)
            .map(|connections| records(channel, connections).collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channels `conn` currently holds subscriptions on.
    pub fn connection_channels(&self, conn: ConnKey) -> Vec<String> {
        self.by_connection
            .get(&conn)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops empty levels left behind for (`channel`, `conn`).
    fn prune(&mut self, channel: &str, conn: ConnKey) {
        let connection_gone = match self.channels.get_mut(channel) {
            Some(connections) => {
                if connections.get(&conn).is_some_and(|entry| entry.peers.is_empty()) {
                    connections.remove(&conn);
                }
                let gone = !connections.contains_key(&conn);
                if connections.is_empty() {
                    self.channels.remove(channel);
                }
                gone
            }
            None => true,
        };

        if connection_gone {
            if let Some(channels) = self.by_connection.get_mut(&conn) {
                channels.remove(channel);
                if channels.is_empty() {
                    self.by_connection.remove(&conn);
                }
            }
        }
    }
}

fn records<'a, H>(
    channel: &'a str,
    connections: &'a BTreeMap<ConnKey, ConnEntry<H>>,
) -> impl Iterator<Item = StateRecord> + 'a {
    connections.values().flat_map(move |entry| {
        entry
            .peers
            .values()
            .map(move |peer| StateRecord::new(channel, peer.descriptor.clone(), peer.count))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcbus_core::{ProcessDescriptor, ProcessKind};

    fn peer(id: &str) -> PeerDescriptor {
        PeerDescriptor::new(
            PeerId::new(id),
            format!("peer-{id}"),
            ProcessDescriptor {
                kind: ProcessKind::Node,
                pid: 1,
            },
        )
    }

    #[test]
    fn test_n_add_ref_then_n_release_leaves_nothing() {
        let mut reg = ChannelRegistry::new();
        let a = peer("a");
        for i in 1..=5 {
            assert_eq!(reg.add_ref("x", 1, &"h1", &a), i);
        }
        for remaining in (0..5).rev() {
            assert_eq!(reg.release("x", 1, &a.id), Some(remaining));
        }
        assert!(!reg.has_channel("x"));
        assert!(reg.dump().is_empty());
        assert!(reg.connection_channels(1).is_empty());
        assert_eq!(reg.release("x", 1, &a.id), None);
    }

    #[test]
    fn test_release_connection_removes_everything() {
        let mut reg = ChannelRegistry::new();
        let (a, b) = (peer("a"), peer("b"));
        reg.add_ref("x", 1, &"h1", &a);
        reg.add_ref("y", 1, &"h1", &a);
        reg.add_ref("y", 1, &"h1", &b);
        reg.add_ref("z", 1, &"h1", &b);
        reg.add_ref("y", 2, &"h2", &peer("c"));

        let mut touched = reg.release_connection(1);
        touched.sort();
        assert_eq!(touched, vec!["x", "y", "z"]);
        assert!(!reg.has_channel("x"));
        assert!(!reg.has_channel("z"));
        assert_eq!(reg.subscribers("y"), vec![(2, "h2")]);
        assert!(reg.dump().iter().all(|r| r.peer.id.as_str() == "c"));
        assert!(reg.release_connection(1).is_empty());
    }

    #[test]
    fn test_release_all_keeps_other_connections() {
        let mut reg = ChannelRegistry::new();
        reg.add_ref("x", 1, &"h1", &peer("a"));
        reg.add_ref("x", 1, &"h1", &peer("b"));
        reg.add_ref("x", 2, &"h2", &peer("c"));
        reg.add_ref("w", 1, &"h1", &peer("a"));

        assert_eq!(reg.release_all("x", 1), 2);
        assert_eq!(reg.subscribers("x"), vec![(2, "h2")]);
        assert_eq!(reg.connection_channels(1), vec!["w".to_string()]);
        assert_eq!(reg.release_all("x", 1), 0);
        assert_eq!(reg.release_all("nope", 1), 0);
    }

    #[test]
    fn test_release_peer_keeps_sibling_peers() {
        let mut reg = ChannelRegistry::new();
        let (a, b) = (peer("a"), peer("b"));
        reg.add_ref("x", 1, &"h1", &a);
        reg.add_ref("x", 1, &"h1", &a);
        reg.add_ref("y", 1, &"h1", &a);
        reg.add_ref("y", 1, &"h1", &b);

        assert_eq!(reg.release_peer(1, &a.id), 2);
        assert!(!reg.has_channel("x"));
        let records = reg.dump();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].peer.id, b.id);
        assert_eq!(reg.connection_channels(1), vec!["y".to_string()]);
    }

    #[test]
    fn test_dump_is_ordered_and_counted() {
        let mut reg = ChannelRegistry::new();
        reg.add_ref("b", 2, &"h2", &peer("q"));
        reg.add_ref("a", 2, &"h2", &peer("q"));
        reg.add_ref("a", 1, &"h1", &peer("p"));
        reg.add_ref("a", 1, &"h1", &peer("p"));

        let records: Vec<(String, String, u32)> = reg
            .dump()
            .into_iter()
            .map(|r| (r.channel, r.peer.id.to_string(), r.count))
            .collect();
        assert_eq!(
            records,
            vec![
                ("a".to_string(), "p".to_string(), 2),
                ("a".to_string(), "q".to_string(), 1),
                ("b".to_string(), "q".to_string(), 1),
            ]
        );
        assert_eq!(reg.dump_channel("b").len(), 1);
        assert_eq!(reg.channel_count(), 2);
    }

    #[test]
    fn test_for_each_channel_visits_each_connection_once() {
        let mut reg = ChannelRegistry::new();
        reg.add_ref("x", 1, &"h1", &peer("a"));
        reg.add_ref("x", 1, &"h1", &peer("b"));
        reg.add_ref("x", 2, &"h2", &peer("c"));
        reg.add_ref("y", 3, &"h3", &peer("d"));

        let mut seen = Vec::new();
        reg.for_each_channel("x", |conn, handle| seen.push((conn, *handle)));
        assert_eq!(seen, vec![(1, "h1"), (2, "h2")]);

        let mut none = 0;
        reg.for_each_channel("missing", |_, _| none += 1);
        assert_eq!(none, 0);
    }
}
