//! Bounded pseudo-session table for the UDP relay
//!
//! A pseudo-session is the connectionless protocol's synthetic notion of a
//! flow: a client address paired with the broker-obtained outbound socket
//! that carries its datagrams. The table holds at most [`TABLE_CAPACITY`]
//! sessions; admission of a new client under capacity pressure evicts the
//! least recently touched entry. There is no idle timeout - eviction is the
//! only way a session ends.
//!
//! Recency comes from a table-local monotonic counter, never from wall
//! time; values are compared only relatively. The table is owned by the
//! single-threaded relay loop and needs no locking.

use std::net::SocketAddrV4;

use tokio::net::UdpSocket;

/// Fixed capacity of the pseudo-session table
pub const TABLE_CAPACITY: usize = 8;

/// One pseudo-session: a client address bound to an outbound socket
#[derive(Debug)]
pub struct UdpSession {
    /// The redirected client this session belongs to
    pub client: SocketAddrV4,
    /// Broker-obtained outbound datagram socket
    pub socket: UdpSocket,
    last_access: u64,
}

/// Fixed-capacity session table with least-recently-used eviction
#[derive(Debug)]
pub struct SessionTable {
    slots: [Option<UdpSession>; TABLE_CAPACITY],
    clock: u64,
}

impl SessionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            clock: 0,
        }
    }

    /// Find the slot holding `client`'s session. Linear scan; the table is
    /// small enough that this is not a performance concern.
    #[must_use]
    pub fn lookup(&self, client: SocketAddrV4) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.client == client))
    }

    /// Stamp slot `idx` with the next value of the recency counter.
    pub fn touch(&mut self, idx: usize) {
        if let Some(session) = self.slots.get_mut(idx).and_then(Option::as_mut) {
            self.clock += 1;
            session.last_access = self.clock;
        }
    }

    /// Admit a session for `client`, evicting the least recently touched
    /// entry if the table is full.
    ///
    /// Returns the slot index and the evicted session, if any. The caller
    /// drops the evicted session, which closes its outbound descriptor.
    pub fn insert(&mut self, client: SocketAddrV4, socket: UdpSocket) -> (usize, Option<UdpSession>) {
        let idx = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => self.least_recently_used(),
        };

        let evicted = self.slots[idx].take();
        self.clock += 1;
        self.slots[idx] = Some(UdpSession {
            client,
            socket,
            last_access: self.clock,
        });

        (idx, evicted)
    }

    /// The session in slot `idx`, if the slot is occupied.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&UdpSession> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Iterate over occupied slots as `(index, session)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &UdpSession)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|s| (idx, s)))
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when no session is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Index of the entry with the smallest `last_access`. Strict `<` keeps
    /// the lowest index on equal stamps. Only called on a full table.
    fn least_recently_used(&self) -> usize {
        let mut min_idx = 0;
        let mut min_access = u64::MAX;
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(session) = slot {
                if session.last_access < min_access {
                    min_access = session.last_access;
                    min_idx = idx;
                }
            }
        }
        min_idx
    }

    #[cfg(test)]
    fn last_access(&self, idx: usize) -> Option<u64> {
        self.get(idx).map(|s| s.last_access)
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
