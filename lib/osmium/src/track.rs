use crate::packet::{Envelope, AUTHENTICATOR_SIZE};
use hashbrown::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stored in evicted entries' start-time cells so that any message still referencing the old
/// entry fails its freshness check at the worker.
const START_TIME_DEAD: u64 = u64::max_value();

/// Outcome of offering a packet to the tracker.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrackingStatus {
    /// First sight of this key; a fresh in-flight entry was created.
    New,
    /// Same key and authenticator as a request that already has a cached reply; the caller
    /// should resend that reply verbatim.
    SameAsLast,
    /// Same key and authenticator as a request still in flight; suppress the duplicate.
    DuplicateInFlight,
    /// Same key but a different authenticator: the client gave up and reused the id. The old
    /// entry (and its cached reply) has been purged and replaced; treat as new.
    DifferentWithSameId,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EntryState {
    InFlight,
    Replied,
}

/// The key a tracker uses within one id slot. Client listeners key on the packet source,
/// proxy listeners on the destination; either way it is an (address, port) pair.
pub type PeerKey = (IpAddr, u16);

/// Full identity of a tracked packet on one listener.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TrackingKey {
    pub id: u8,
    pub peer: PeerKey,
}

impl TrackingKey {
    #[inline]
    pub fn client(envelope: &Envelope) -> TrackingKey {
        TrackingKey {
            id: envelope.id,
            peer: (envelope.src.ip(), envelope.src.port()),
        }
    }

    #[inline]
    pub fn proxy(dst: SocketAddr, id: u8) -> TrackingKey {
        TrackingKey {
            id,
            peer: (dst.ip(), dst.port()),
        }
    }
}

/// One tracked request. The start-time cell is shared into every message dispatched for this
/// key; storing a new timestamp (or poisoning it on eviction) invalidates older messages
/// without any cross-thread table access.
pub struct TrackingEntry {
    pub timestamp: u64,
    pub state: EntryState,
    pub authenticator: [u8; AUTHENTICATOR_SIZE],
    pub reply: Option<Vec<u8>>,
    pub start_time: Arc<AtomicU64>,
    /// Proxy retransmission deadline; unused (zero) in client tables.
    pub next_try: u64,
    pub retries_left: u32,
}

impl TrackingEntry {
    fn new(authenticator: [u8; AUTHENTICATOR_SIZE], now: u64) -> TrackingEntry {
        TrackingEntry {
            timestamp: now,
            state: EntryState::InFlight,
            authenticator,
            reply: None,
            start_time: Arc::new(AtomicU64::new(now)),
            next_try: 0,
            retries_left: 0,
        }
    }

    fn evict(&self) {
        self.start_time.store(START_TIME_DEAD, Ordering::Release);
    }
}

/// Per-listener table correlating `(peer, id)` with the authenticator and the cached reply.
/// Owned and mutated exclusively by the listener's network thread; the low byte of the id
/// gives constant time dispatch, then a small map per slot resolves the peer.
pub struct TrackingTable {
    slots: Vec<HashMap<PeerKey, TrackingEntry>>,
    num_entries: usize,
}

impl TrackingTable {
    pub fn new() -> TrackingTable {
        TrackingTable {
            slots: (0..256).map(|_| HashMap::new()).collect(),
            num_entries: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_entries
    }

    /// Offers a packet to the table. Replied entries older than `cleanup_delay` in the
    /// touched id slot are lazily evicted first.
    pub fn insert(&mut self, key: TrackingKey, authenticator: [u8; AUTHENTICATOR_SIZE],
                  now: u64, cleanup_delay: u64) -> TrackingStatus {
        self.cleanup_slot(key.id, now, cleanup_delay);

        let slot = &mut self.slots[key.id as usize];

        match slot.get_mut(&key.peer) {
            None => {
                slot.insert(key.peer, TrackingEntry::new(authenticator, now));
                self.num_entries += 1;
                TrackingStatus::New
            }
            Some(entry) if entry.authenticator == authenticator => match entry.state {
                EntryState::InFlight => TrackingStatus::DuplicateInFlight,
                EntryState::Replied => TrackingStatus::SameAsLast,
            },
            Some(entry) => {
                // Id reuse: drop the stale reply, poison the old start-time cell and start
                // over in place.
                entry.evict();
                *entry = TrackingEntry::new(authenticator, now);
                TrackingStatus::DifferentWithSameId
            }
        }
    }

    #[inline]
    pub fn entry(&self, key: &TrackingKey) -> Option<&TrackingEntry> {
        self.slots[key.id as usize].get(&key.peer)
    }

    #[inline]
    pub fn entry_mut(&mut self, key: &TrackingKey) -> Option<&mut TrackingEntry> {
        self.slots[key.id as usize].get_mut(&key.peer)
    }

    /// Caches the encoded reply for a key and moves the entry to `Replied`.
    pub fn reply(&mut self, key: &TrackingKey, reply: Vec<u8>, now: u64) -> bool {
        match self.entry_mut(key) {
            Some(entry) => {
                entry.reply = Some(reply);
                entry.state = EntryState::Replied;
                entry.timestamp = now;
                true
            }
            None => false,
        }
    }

    /// The cached reply for a key, if one exists.
    #[inline]
    pub fn cached_reply(&self, key: &TrackingKey) -> Option<&[u8]> {
        self.entry(key).and_then(|entry| entry.reply.as_deref())
    }

    /// Removes an entry outright, poisoning its start-time cell.
    pub fn delete(&mut self, key: &TrackingKey) -> bool {
        match self.slots[key.id as usize].remove(&key.peer) {
            Some(entry) => {
                entry.evict();
                self.num_entries -= 1;
                true
            }
            None => false,
        }
    }

    /// Entries across all slots whose proxy retransmission deadline has passed.
    pub fn due_retries(&self, now: u64) -> Vec<TrackingKey> {
        let mut due = Vec::new();

        for (id, slot) in self.slots.iter().enumerate() {
            for (peer, entry) in slot.iter() {
                if entry.state == EntryState::InFlight && entry.next_try != 0 && entry.next_try <= now {
                    due.push(TrackingKey {
                        id: id as u8,
                        peer: *peer,
                    });
                }
            }
        }

        due
    }

    fn cleanup_slot(&mut self, id: u8, now: u64, cleanup_delay: u64) {
        let slot = &mut self.slots[id as usize];
        let before = slot.len();

        slot.retain(|_, entry| {
            let expired =
                entry.state == EntryState::Replied && now.saturating_sub(entry.timestamp) > cleanup_delay;
            if expired {
                entry.evict();
            }
            !expired
        });

        self.num_entries -= before - slot.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketCode;
    use quartz::time::NANOS_PER_SEC;

    const CLEANUP: u64 = 5 * NANOS_PER_SEC;

    fn envelope(id: u8, auth: u8) -> Envelope {
        Envelope {
            code: PacketCode::AccessRequest,
            id,
            authenticator: [auth; AUTHENTICATOR_SIZE],
            src: "10.0.0.1:50000".parse().unwrap(),
            dst: "10.0.0.2:1812".parse().unwrap(),
        }
    }

    #[test]
    fn test_new_then_duplicate_in_flight() {
        let mut table = TrackingTable::new();
        let env = envelope(7, 0xaa);
        let key = TrackingKey::client(&env);

        assert_eq!(table.insert(key, env.authenticator, 100, CLEANUP), TrackingStatus::New);
        assert_eq!(
            table.insert(key, env.authenticator, 200, CLEANUP),
            TrackingStatus::DuplicateInFlight
        );
    }

    #[test]
    fn test_replied_retransmit_returns_same_as_last() {
        let mut table = TrackingTable::new();
        let env = envelope(7, 0xaa);
        let key = TrackingKey::client(&env);

        table.insert(key, env.authenticator, 100, CLEANUP);
        assert!(table.reply(&key, vec![2, 7, 0, 20], 150));

        assert_eq!(
            table.insert(key, env.authenticator, 200, CLEANUP),
            TrackingStatus::SameAsLast
        );
        assert_eq!(table.cached_reply(&key).unwrap(), &[2, 7, 0, 20]);
    }

    #[test]
    fn test_id_reuse_purges_old_entry() {
        let mut table = TrackingTable::new();
        let env_a = envelope(7, 0xaa);
        let key = TrackingKey::client(&env_a);

        table.insert(key, env_a.authenticator, 100, CLEANUP);
        table.reply(&key, vec![2, 7, 0, 20], 150);

        let old_start = table.entry(&key).unwrap().start_time.clone();

        let env_b = envelope(7, 0xbb);
        assert_eq!(
            table.insert(key, env_b.authenticator, 200, CLEANUP),
            TrackingStatus::DifferentWithSameId
        );

        let entry = table.entry(&key).unwrap();
        assert_eq!(entry.state, EntryState::InFlight);
        assert!(entry.reply.is_none());
        assert_eq!(entry.authenticator, env_b.authenticator);

        // Messages holding the old cell must fail their freshness check.
        assert_eq!(old_start.load(Ordering::Acquire), START_TIME_DEAD);
    }

    #[test]
    fn test_same_id_different_peer_is_independent() {
        let mut table = TrackingTable::new();
        let env = envelope(7, 0xaa);
        let key_a = TrackingKey::client(&env);
        let key_b = TrackingKey {
            id: 7,
            peer: ("10.0.0.9".parse().unwrap(), 50000),
        };

        assert_eq!(table.insert(key_a, env.authenticator, 100, CLEANUP), TrackingStatus::New);
        assert_eq!(table.insert(key_b, env.authenticator, 100, CLEANUP), TrackingStatus::New);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lazy_cleanup_evicts_stale_replied() {
        let mut table = TrackingTable::new();
        let env = envelope(7, 0xaa);
        let key = TrackingKey::client(&env);

        table.insert(key, env.authenticator, 100, CLEANUP);
        table.reply(&key, vec![1], 100);

        // Way past the cleanup delay, the same id slot is swept on the next insert and the
        // retransmit is treated as brand new.
        let later = 100 + CLEANUP + 1;
        assert_eq!(table.insert(key, env.authenticator, later, CLEANUP), TrackingStatus::New);
        assert_eq!(table.len(), 1);
        assert!(table.cached_reply(&key).is_none());
    }

    #[test]
    fn test_delete_poisons_start_time() {
        let mut table = TrackingTable::new();
        let env = envelope(3, 0xcc);
        let key = TrackingKey::client(&env);

        table.insert(key, env.authenticator, 100, CLEANUP);
        let start = table.entry(&key).unwrap().start_time.clone();

        assert!(table.delete(&key));
        assert!(!table.delete(&key));
        assert_eq!(start.load(Ordering::Acquire), START_TIME_DEAD);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_due_retries() {
        let mut table = TrackingTable::new();
        let key = TrackingKey::proxy("192.168.0.5:1812".parse().unwrap(), 9);

        table.insert(key, [0x11; AUTHENTICATOR_SIZE], 100, CLEANUP);
        {
            let entry = table.entry_mut(&key).unwrap();
            entry.next_try = 500;
            entry.retries_left = 3;
        }

        assert!(table.due_retries(400).is_empty());
        assert_eq!(table.due_retries(500), vec![key]);
    }
}
