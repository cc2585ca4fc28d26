//! Pending-slot table
//!
//! External connections accepted on an outer port wait here until the
//! client's side-channel arrives to claim them. Slot indices name the
//! pending connection in `NEWSOCKET`/`NEWCONN` frames and stay stable for
//! the lifetime of one slot; the mutex couples ids to slot lifetimes, so
//! a side-channel arriving late for a reclaimed slot can never bind to an
//! unrelated connection.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Maximum outstanding external connections per outer port
pub const WAIT_MAX: usize = 10;

/// How long a pending connection may wait for its side-channel
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingSlot<C> {
    conn: C,
    expires_at: Instant,
}

/// Fixed-size table of pending external connections for one outer port
pub struct SlotTable<C> {
    timeout: Duration,
    slots: Mutex<[Option<PendingSlot<C>>; WAIT_MAX]>,
}

impl<C> SlotTable<C> {
    pub fn new() -> Self {
        Self::with_timeout(WAIT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    /// Store a newly accepted external connection.
    ///
    /// The connection lands in the first vacant slot, or failing that the
    /// first expired one (whose stale connection is dropped). Returns the
    /// assigned slot id; when every slot holds a live pending connection
    /// the new one is dropped and `None` is returned.
    pub fn insert(&self, conn: C) -> Option<u8> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        for (i, slot) in slots.iter_mut().enumerate() {
            let vacant = match slot {
                None => true,
                Some(pending) => now > pending.expires_at,
            };
            if vacant {
                *slot = Some(PendingSlot {
                    conn,
                    expires_at: now + self.timeout,
                });
                return Some(i as u8);
            }
        }
        None
    }

    /// Remove and return the pending connection at `id`.
    ///
    /// Out-of-range ids, vacant slots, and expired slots yield `None`; an
    /// expired slot's connection is dropped and the slot cleared.
    pub fn take(&self, id: u8) -> Option<C> {
        let mut slots = self.slots.lock().unwrap();
        let pending = slots.get_mut(id as usize)?.take()?;
        if Instant::now() > pending.expires_at {
            return None;
        }
        Some(pending.conn)
    }

    /// Drop every pending connection. Session teardown.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }
}

impl<C> Default for SlotTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_in_index_order() {
        let table: SlotTable<u32> = SlotTable::new();
        for expected in 0..WAIT_MAX as u8 {
            assert_eq!(table.insert(expected as u32), Some(expected));
        }
        assert_eq!(table.insert(99), None);
    }

    #[test]
    fn take_validates_the_id() {
        let table: SlotTable<u32> = SlotTable::new();
        assert_eq!(table.insert(7), Some(0));

        assert_eq!(table.take(3), None, "vacant slot");
        assert_eq!(table.take(200), None, "out of range");
        assert_eq!(table.take(0), Some(7));
        assert_eq!(table.take(0), None, "already consumed");
    }

    #[test]
    fn taking_frees_the_slot_for_reuse() {
        let table: SlotTable<u32> = SlotTable::new();
        for i in 0..WAIT_MAX as u32 {
            table.insert(i);
        }
        assert_eq!(table.take(4), Some(4));
        assert_eq!(table.insert(42), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_slots_are_reclaimed_by_insert() {
        let table: SlotTable<u32> = SlotTable::new();
        for i in 0..WAIT_MAX as u32 {
            table.insert(i);
        }
        assert_eq!(table.insert(99), None);

        tokio::time::advance(WAIT_TIMEOUT + Duration::from_secs(1)).await;

        // All slots expired; allocation reclaims from index zero.
        assert_eq!(table.insert(100), Some(0));
        assert_eq!(table.insert(101), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn take_refuses_expired_slots() {
        let table: SlotTable<u32> = SlotTable::new();
        assert_eq!(table.insert(7), Some(0));

        tokio::time::advance(WAIT_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(table.take(0), None);
        // The expired entry was cleared, not left behind.
        assert_eq!(table.insert(8), Some(0));
        assert_eq!(table.take(0), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn live_slots_survive_partial_expiry() {
        let table: SlotTable<u32> = SlotTable::with_timeout(Duration::from_secs(30));
        assert_eq!(table.insert(1), Some(0));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(table.insert(2), Some(1));

        tokio::time::advance(Duration::from_secs(15)).await;

        // Slot 0 is now expired, slot 1 still has 15 s left.
        assert_eq!(table.insert(3), Some(0));
        assert_eq!(table.take(1), Some(2));
        assert_eq!(table.take(0), Some(3));
    }

    #[test]
    fn clear_empties_every_slot() {
        let table: SlotTable<u32> = SlotTable::new();
        for i in 0..5 {
            table.insert(i);
        }
        table.clear();
        for id in 0..WAIT_MAX as u8 {
            assert_eq!(table.take(id), None);
        }
        assert_eq!(table.insert(9), Some(0));
    }
}
