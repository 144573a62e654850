// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Transport adapter
//!
//! Bridges descriptor chains to/from the shared-ring transport that
//! connects the VMM to driver domains: TX/RX avail and used rings over
//! a shared DMA buffer pool. One [`BackendConnection`] per direction
//! per device. Buffers carry origin metadata so a buffer returned via
//! the wrong side is detected (spec §4.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::external::CrossDomainChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
    Tx,
    Rx,
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub cookie: u32,
    pub origin: SlotOrigin,
    pub data: Vec<u8>,
}

impl Slot {
    fn fresh(cookie: u32, origin: SlotOrigin, capacity: usize) -> Self {
        Slot {
            cookie,
            origin,
            data: Vec::with_capacity(capacity),
        }
    }
}

/// One `(avail_ring, used_ring, pool)` triple, per the data model in
/// spec §3. `avail` holds buffers free for the VMM to fill and hand to
/// the backend; `used` holds buffers the backend has filled and handed
/// back. Notifications to the backend are coalesced: a prior notify
/// that hasn't been acknowledged suppresses the next one.
pub struct BackendConnection {
    name: &'static str,
    channel: u32,
    origin: SlotOrigin,
    avail: VecDeque<Slot>,
    used: VecDeque<Slot>,
    notify_outstanding: AtomicBool,
    backpressure_drops: u64,
    next_cookie: u32,
}

impl BackendConnection {
    pub fn new(name: &'static str, channel: u32, origin: SlotOrigin, capacity: usize, slot_size: usize) -> Self {
        let mut avail = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            avail.push_back(Slot::fresh(i as u32, origin, slot_size));
        }
        BackendConnection {
            name,
            channel,
            origin,
            avail,
            used: VecDeque::new(),
            notify_outstanding: AtomicBool::new(false),
            backpressure_drops: 0,
            next_cookie: capacity as u32,
        }
    }

    /// Dequeue a free buffer; `None` when the pool is exhausted (spec
    /// §7 bucket 2: backend transport full).
    pub fn acquire_tx(&mut self) -> Option<Slot> {
        self.avail.pop_front()
    }

    /// Enqueue a filled buffer to `used` and notify the backend,
    /// coalescing with any outstanding, unacknowledged notify.
    pub fn publish_tx(&mut self, mut slot: Slot, len: usize, channel: &dyn CrossDomainChannel) {
        debug_assert_eq!(slot.origin, self.origin, "{}: buffer returned via wrong side", self.name);
        slot.data.truncate(len);
        self.used.push_back(slot);
        if !self.notify_outstanding.swap(true, Ordering::AcqRel) {
            channel.notify(self.channel);
        }
    }

    /// Acknowledge a backend notification, re-arming coalescing.
    pub fn ack_notify(&self) {
        self.notify_outstanding.store(false, Ordering::Release);
    }

    /// While `used` is non-empty, dequeue, call `f(&data)`, return the
    /// buffer to `avail`. `f` may not reorder or retain buffers past
    /// return — it only ever sees a borrow.
    pub fn drain_rx<F: FnMut(&[u8])>(&mut self, mut f: F) {
        while let Some(mut slot) = self.used.pop_front() {
            f(&slot.data);
            slot.data.clear();
            self.avail.push_back(slot);
        }
    }

    pub fn ring_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn bump_backpressure(&mut self) {
        self.backpressure_drops += 1;
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.backpressure_drops
    }

    /// Test/simulation hook standing in for a peer backend domain
    /// pushing a frame onto its side of the ring: as far as this
    /// connection is concerned, a new filled buffer just arrived.
    #[cfg(any(test, feature = "sim-backend"))]
    pub fn simulate_backend_enqueue(&mut self, data: Vec<u8>) {
        let cookie = self.next_cookie;
        self.next_cookie = self.next_cookie.wrapping_add(1);
        let mut slot = Slot::fresh(cookie, self.origin, data.len());
        slot.data = data;
        self.used.push_back(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullChannel;
    impl CrossDomainChannel for NullChannel {
        fn notify(&self, _channel: u32) {}
        fn ppcall(&self, _channel: u32, _msg: &[u64]) -> Vec<u64> {
            Vec::new()
        }
        fn irq_ack(&self, _channel: u32) {}
    }

    #[test]
    fn acquire_and_publish_round_trip() {
        let mut conn = BackendConnection::new("test-tx", 7, SlotOrigin::Tx, 4, 64);
        let slot = conn.acquire_tx().expect("pool should have free slots");
        conn.publish_tx(slot, 0, &NullChannel);
        assert!(!conn.ring_empty());
    }

    #[test]
    fn pool_exhaustion_reports_none() {
        let mut conn = BackendConnection::new("test-tx", 7, SlotOrigin::Tx, 1, 64);
        assert!(conn.acquire_tx().is_some());
        assert!(conn.acquire_tx().is_none());
    }

    #[test]
    fn drain_rx_recycles_buffer_to_avail() {
        let mut conn = BackendConnection::new("test-rx", 9, SlotOrigin::Rx, 1, 64);
        conn.simulate_backend_enqueue(vec![1, 2, 3]);
        let mut seen = Vec::new();
        conn.drain_rx(|data| seen.push(data.to_vec()));
        assert_eq!(seen, vec![vec![1, 2, 3]]);
        assert!(conn.acquire_tx().is_some());
    }

    #[test]
    fn notify_coalesces_while_outstanding() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc;

        struct CountingChannel(Arc<AtomicUsize>);
        impl CrossDomainChannel for CountingChannel {
            fn notify(&self, _channel: u32) {
                self.0.fetch_add(1, O::SeqCst);
            }
            fn ppcall(&self, _channel: u32, _msg: &[u64]) -> Vec<u64> {
                Vec::new()
            }
            fn irq_ack(&self, _channel: u32) {}
        }

        let count = Arc::new(AtomicUsize::new(0));
        let chan = CountingChannel(count.clone());
        let mut conn = BackendConnection::new("test-tx", 1, SlotOrigin::Tx, 4, 64);

        let s1 = conn.acquire_tx().unwrap();
        conn.publish_tx(s1, 0, &chan);
        let s2 = conn.acquire_tx().unwrap();
        conn.publish_tx(s2, 0, &chan);
        assert_eq!(count.load(O::SeqCst), 1);

        conn.ack_notify();
        let s3 = conn.acquire_tx().unwrap();
        conn.publish_tx(s3, 0, &chan);
        assert_eq!(count.load(O::SeqCst), 2);
    }
}
