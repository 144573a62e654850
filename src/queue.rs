// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Virtqueue walker
//!
//! Given a guest-physical descriptor table, available ring, and used
//! ring, this module produces a lazy sequence of descriptor chains for
//! a device personality to consume, and accepts per-chain completion
//! records for publication to the used ring. No locks: a queue is
//! owned by exactly one device personality.

use std::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use thiserror::Error;

use crate::address_space::{GuestAddress, GuestMemory};

bitflags! {
    /// Per-descriptor flags, refer to Virtio Spec §2.7.5.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the `next` field.
        const NEXT = 0x1;
        /// Buffer is device write-only (otherwise device read-only).
        const WRITE = 0x2;
    }
}

const DESC_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4; // flags(u16) + idx(u16)
const USED_RING_HEADER: u64 = 4; // flags(u16) + idx(u16)
const USED_ELEM_SIZE: u64 = 8; // id(u32) + len(u32)

/// Queue is taken out of service and requires renegotiation after this
/// many consecutive malformed chains (spec §4.1).
const MALFORMED_CHAIN_THRESHOLD: u32 = 3;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("descriptor index {0} out of bounds for queue of size {1}")]
    IndexOutOfBounds(u16, u16),
    #[error("descriptor chain revisited index {0}")]
    CycleDetected(u16),
    #[error("descriptor chain length exceeded queue size {0}")]
    ChainTooLong(u16),
    #[error("descriptor had zero length with WRITE flag clear")]
    ZeroLengthRead,
    #[error("guest memory access out of bounds")]
    GuestMemoryOutOfBounds,
}

impl From<crate::error::VirtioError> for QueueError {
    fn from(_: crate::error::VirtioError) -> Self {
        QueueError::GuestMemoryOutOfBounds
    }
}

/// One entry of a walked descriptor chain, already copied out of guest
/// memory (TOCTOU defence — the guest may mutate the descriptor table
/// at any instant).
#[derive(Debug, Clone, Copy)]
pub struct DescEntry {
    pub addr: GuestAddress,
    pub len: u32,
    pub write: bool,
}

/// A linked walk of descriptors starting at `avail->ring[last_idx % num]`.
#[derive(Debug, Clone)]
pub struct DescriptorChain {
    pub head_index: u16,
    pub entries: Vec<DescEntry>,
}

impl DescriptorChain {
    pub fn readable_len(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| !e.write)
            .map(|e| e.len)
            .sum()
    }

    pub fn writeable_len(&self) -> u32 {
        self.entries.iter().filter(|e| e.write).map(|e| e.len).sum()
    }

    /// Read every readable entry into one contiguous buffer.
    pub fn read_readable(&self, mem: &dyn GuestMemory) -> crate::error::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.readable_len() as usize);
        for e in self.entries.iter().filter(|e| !e.write) {
            let mut buf = vec![0u8; e.len as usize];
            mem.read(e.addr, &mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    /// Split the readable portion of the chain at an exact byte
    /// boundary, splitting a descriptor in two if the boundary falls in
    /// its middle. This replaces the running skip-counter the original
    /// implementation used, which miscounts when a descriptor contains
    /// both header tail and payload head (see design notes).
    pub fn split_readable_at(&self, boundary: u32) -> (Vec<DescEntry>, Vec<DescEntry>) {
        let mut head = Vec::new();
        let mut tail = Vec::new();
        let mut remaining = boundary;
        for e in self.entries.iter().filter(|e| !e.write) {
            if remaining == 0 {
                tail.push(*e);
            } else if e.len as u32 <= remaining {
                remaining -= e.len;
                head.push(*e);
            } else {
                let split_len = remaining;
                head.push(DescEntry {
                    addr: e.addr,
                    len: split_len,
                    write: false,
                });
                tail.push(DescEntry {
                    addr: e.addr.checked_add(split_len as u64).unwrap(),
                    len: e.len - split_len,
                    write: false,
                });
                remaining = 0;
            }
        }
        (head, tail)
    }

    /// Writeable entries only, in chain order.
    pub fn writeable_entries(&self) -> impl Iterator<Item = &DescEntry> {
        self.entries.iter().filter(|e| e.write)
    }
}

/// Outcome of a single `advance` call.
pub enum AdvanceOutcome {
    Chain(DescriptorChain),
    Empty,
}

/// Per-queue configuration snapshot plus walker state.
pub struct Queue {
    pub name: &'static str,
    pub num: u16,
    pub ready: bool,
    pub last_idx: u16,
    pub desc_addr: GuestAddress,
    pub avail_addr: GuestAddress,
    pub used_addr: GuestAddress,
    pub used_idx_shadow: u16,
    malformed_streak: u32,
    pub needs_reset: bool,
}

impl Queue {
    pub fn new(name: &'static str, max_num: u16) -> Self {
        Queue {
            name,
            num: max_num,
            ready: false,
            last_idx: 0,
            desc_addr: GuestAddress(0),
            avail_addr: GuestAddress(0),
            used_addr: GuestAddress(0),
            used_idx_shadow: 0,
            malformed_streak: 0,
            needs_reset: false,
        }
    }

    /// Clear all queue state. Resolves the Open Question in spec §9:
    /// `last_idx` is always reinitialized to 0, never 1.
    pub fn reset(&mut self) {
        self.ready = false;
        self.last_idx = 0;
        self.used_idx_shadow = 0;
        self.desc_addr = GuestAddress(0);
        self.avail_addr = GuestAddress(0);
        self.used_addr = GuestAddress(0);
        self.malformed_streak = 0;
        self.needs_reset = false;
    }

    /// Add a guest-controlled offset to a guest-controlled base address.
    /// Both operands come from unvalidated MMIO writes, so overflow is a
    /// guest-triggerable condition, not a host bug — it must return an
    /// error, never panic.
    fn safe_offset(addr: GuestAddress, off: u64) -> Result<GuestAddress, QueueError> {
        addr.checked_add(off).ok_or(QueueError::GuestMemoryOutOfBounds)
    }

    fn desc_ptr(&self, index: u16) -> Result<GuestAddress, QueueError> {
        Self::safe_offset(self.desc_addr, index as u64 * DESC_SIZE)
    }

    fn avail_idx(&self, mem: &dyn GuestMemory) -> Result<u16, QueueError> {
        // Acquire: the guest publishes the descriptor body before
        // bumping `avail->idx`; we must observe that ordering.
        fence(Ordering::Acquire);
        let ptr = Self::safe_offset(self.avail_addr, 2)?;
        mem.read_u16(ptr).map_err(|_| QueueError::GuestMemoryOutOfBounds)
    }

    fn avail_ring_entry(&self, mem: &dyn GuestMemory, slot: u16) -> Result<u16, QueueError> {
        let off = AVAIL_RING_HEADER + slot as u64 * 2;
        let ptr = Self::safe_offset(self.avail_addr, off)?;
        mem.read_u16(ptr).map_err(|_| QueueError::GuestMemoryOutOfBounds)
    }

    /// `avail->idx - last_idx` (mod 2^16), used for fairness.
    pub fn peek_available(&self, mem: &dyn GuestMemory) -> Result<u16, QueueError> {
        let avail_idx = self.avail_idx(mem)?;
        Ok(avail_idx.wrapping_sub(self.last_idx))
    }

    fn read_descriptor(
        &self,
        mem: &dyn GuestMemory,
        index: u16,
    ) -> Result<(GuestAddress, u32, DescFlags, u16), QueueError> {
        if index >= self.num {
            return Err(QueueError::IndexOutOfBounds(index, self.num));
        }
        let ptr = self.desc_ptr(index)?;
        let addr = mem
            .read_u64(ptr)
            .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;
        let len = mem
            .read_u32(Self::safe_offset(ptr, 8)?)
            .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;
        let flags = mem
            .read_u16(Self::safe_offset(ptr, 12)?)
            .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;
        let next = mem
            .read_u16(Self::safe_offset(ptr, 14)?)
            .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;
        Ok((GuestAddress(addr), len, DescFlags::from_bits_truncate(flags), next))
    }

    fn walk_chain(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
    ) -> Result<DescriptorChain, QueueError> {
        let mut entries = Vec::new();
        let mut seen = vec![false; self.num as usize];
        let mut index = head;
        loop {
            if index >= self.num {
                return Err(QueueError::IndexOutOfBounds(index, self.num));
            }
            if seen[index as usize] {
                return Err(QueueError::CycleDetected(index));
            }
            seen[index as usize] = true;
            if entries.len() as u16 >= self.num {
                return Err(QueueError::ChainTooLong(self.num));
            }

            let (addr, len, flags, next) = self.read_descriptor(mem, index)?;
            let write = flags.contains(DescFlags::WRITE);
            if len == 0 && !write {
                return Err(QueueError::ZeroLengthRead);
            }
            // Bounds check every descriptor's buffer now, while we still
            // have it, rather than trusting it later.
            mem.checked_offset(addr, len as u64)
                .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;
            entries.push(DescEntry { addr, len, write });

            if !flags.contains(DescFlags::NEXT) {
                break;
            }
            index = next;
        }
        Ok(DescriptorChain {
            head_index: head,
            entries,
        })
    }

    /// Report the next available chain or that none remain. Does not
    /// block; caller's suspension policy is external. Malformed chains
    /// are consumed transparently: `last_idx` advances, a `(head, 0)`
    /// used entry is published so the guest does not stall, and after
    /// three consecutive malformed chains `needs_reset` is latched.
    pub fn advance(&mut self, mem: &dyn GuestMemory) -> Result<AdvanceOutcome, QueueError> {
        if !self.ready {
            return Ok(AdvanceOutcome::Empty);
        }
        loop {
            let avail_idx = self.avail_idx(mem)?;
            if avail_idx == self.last_idx {
                return Ok(AdvanceOutcome::Empty);
            }
            let pending = avail_idx.wrapping_sub(self.last_idx);
            if pending > self.num {
                // Guest overran the ring; treat as malformed and resync.
                warn!(
                    "{}: avail ring overrun ({} pending > num {})",
                    self.name, pending, self.num
                );
                self.last_idx = avail_idx;
                self.bump_malformed();
                continue;
            }

            let slot = self.last_idx % self.num;
            let head = self.avail_ring_entry(mem, slot)?;
            self.last_idx = self.last_idx.wrapping_add(1);

            match self.walk_chain(mem, head) {
                Ok(chain) => {
                    self.malformed_streak = 0;
                    return Ok(AdvanceOutcome::Chain(chain));
                }
                Err(e) => {
                    warn!("{}: malformed descriptor chain at head {}: {}", self.name, head, e);
                    self.complete(mem, head, 0)?;
                    self.bump_malformed();
                }
            }
        }
    }

    fn bump_malformed(&mut self) {
        self.malformed_streak += 1;
        if self.malformed_streak >= MALFORMED_CHAIN_THRESHOLD {
            self.needs_reset = true;
        }
    }

    /// Publish a used entry and advance `used->idx`. The sole writer of
    /// `used->idx`; release semantics so the guest observes the
    /// completed body before the index bump.
    pub fn complete(
        &mut self,
        mem: &dyn GuestMemory,
        head: u16,
        bytes_written: u32,
    ) -> Result<(), QueueError> {
        let slot = self.used_idx_shadow % self.num;
        let elem_off = USED_RING_HEADER + slot as u64 * USED_ELEM_SIZE;
        let elem_addr = Self::safe_offset(self.used_addr, elem_off)?;
        mem.write_u32(elem_addr, head as u32)
            .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;
        mem.write_u32(Self::safe_offset(elem_addr, 4)?, bytes_written)
            .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;

        self.used_idx_shadow = self.used_idx_shadow.wrapping_add(1);
        fence(Ordering::Release);
        let idx_addr = Self::safe_offset(self.used_addr, 2)?;
        mem.write_u16(idx_addr, self.used_idx_shadow)
            .map_err(|_| QueueError::GuestMemoryOutOfBounds)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::FlatGuestMemory;

    const DESC_BASE: u64 = 0x1000;
    const AVAIL_BASE: u64 = 0x2000;
    const USED_BASE: u64 = 0x3000;

    fn setup(num: u16) -> (FlatGuestMemory, Queue) {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x10000);
        let mut q = Queue::new("test", num);
        q.desc_addr = GuestAddress(DESC_BASE);
        q.avail_addr = GuestAddress(AVAIL_BASE);
        q.used_addr = GuestAddress(USED_BASE);
        q.ready = true;
        (mem, q)
    }

    fn write_desc(mem: &FlatGuestMemory, index: u16, addr: u64, len: u32, flags: DescFlags, next: u16) {
        let base = GuestAddress(DESC_BASE + index as u64 * DESC_SIZE);
        mem.write(base, &addr.to_le_bytes()).unwrap();
        mem.write_u32(base.checked_add(8).unwrap(), len).unwrap();
        mem.write_u16(base.checked_add(12).unwrap(), flags.bits()).unwrap();
        mem.write_u16(base.checked_add(14).unwrap(), next).unwrap();
    }

    fn push_avail(mem: &FlatGuestMemory, slot: u16, head: u16, new_idx: u16) {
        let off = AVAIL_RING_HEADER + slot as u64 * 2;
        mem.write_u16(GuestAddress(AVAIL_BASE).checked_add(off).unwrap(), head)
            .unwrap();
        mem.write_u16(GuestAddress(AVAIL_BASE).checked_add(2).unwrap(), new_idx)
            .unwrap();
    }

    #[test]
    fn walks_simple_chain() {
        let (mem, mut q) = setup(8);
        write_desc(&mem, 0, 0x5000, 13, DescFlags::empty(), 0);
        push_avail(&mem, 0, 0, 1);

        match q.advance(&mem).unwrap() {
            AdvanceOutcome::Chain(chain) => {
                assert_eq!(chain.head_index, 0);
                assert_eq!(chain.entries.len(), 1);
                assert_eq!(chain.readable_len(), 13);
            }
            AdvanceOutcome::Empty => panic!("expected a chain"),
        }
        assert!(matches!(q.advance(&mem).unwrap(), AdvanceOutcome::Empty));
    }

    #[test]
    fn detects_cycle_and_publishes_zero_used_entry() {
        let (mem, mut q) = setup(8);
        write_desc(&mem, 0, 0x5000, 4, DescFlags::NEXT, 0);
        push_avail(&mem, 0, 0, 1);

        assert!(matches!(q.advance(&mem).unwrap(), AdvanceOutcome::Empty));
        assert_eq!(q.used_idx_shadow, 1);
        let used_idx = mem.read_u16(GuestAddress(USED_BASE).checked_add(2).unwrap()).unwrap();
        assert_eq!(used_idx, 1);
    }

    #[test]
    fn needs_reset_after_three_malformed_chains() {
        let (mem, mut q) = setup(8);
        for i in 0..3u16 {
            write_desc(&mem, i, 0x5000, 4, DescFlags::NEXT, i);
            push_avail(&mem, i, i, i + 1);
        }
        for _ in 0..3 {
            q.advance(&mem).unwrap();
        }
        assert!(q.needs_reset);
    }

    #[test]
    fn overflowing_avail_addr_reports_error_instead_of_panicking() {
        let (mem, mut q) = setup(8);
        // A guest can point QueueAvail at the very top of the address
        // space via QueueAvailHigh/Low; every offset computed from it
        // must fail gracefully rather than overflow-panic.
        q.avail_addr = GuestAddress(u64::MAX - 1);
        let err = q.advance(&mem).unwrap_err();
        assert_eq!(err, QueueError::GuestMemoryOutOfBounds);
    }

    #[test]
    fn reset_reinitializes_last_idx_to_zero() {
        let (mem, mut q) = setup(8);
        write_desc(&mem, 0, 0x5000, 13, DescFlags::empty(), 0);
        push_avail(&mem, 0, 0, 1);
        q.advance(&mem).unwrap();
        assert_eq!(q.last_idx, 1);
        q.reset();
        assert_eq!(q.last_idx, 0);
        assert!(!q.ready);
    }

    #[test]
    fn split_readable_at_splits_boundary_descriptor() {
        let (mem, _q) = setup(8);
        let chain = DescriptorChain {
            head_index: 0,
            entries: vec![
                DescEntry { addr: GuestAddress(0x100), len: 8, write: false },
                DescEntry { addr: GuestAddress(0x200), len: 8, write: false },
            ],
        };
        let (head, tail) = chain.split_readable_at(12);
        assert_eq!(head.len(), 2);
        assert_eq!(head[1].len, 4);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].addr, GuestAddress(0x204));
        assert_eq!(tail[0].len, 4);
        let _ = mem;
    }
}
