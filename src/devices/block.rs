// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Block device personality
//!
//! One request queue. A chain is `[readable header][readable-or-
//! writeable data...][writeable status byte]`. The header selects IN
//! (device writes data), OUT (device reads data), FLUSH, or GET_ID.
//! FLUSH and GET_ID complete synchronously; IN/OUT are forwarded to the
//! backend over the shared-ring transport and complete when the
//! backend publishes a used entry.

use std::collections::VecDeque;

use anyhow::Result;

use crate::address_space::GuestMemory;
use crate::devices::{virtio_has_feature, VirtioDevice, VIRTIO_TYPE_BLOCK};
use crate::external::CrossDomainChannel;
use crate::queue::{AdvanceOutcome, DescriptorChain, Queue};
use crate::transport::{BackendConnection, SlotOrigin};

pub const VIRTIO_BLK_F_FLUSH: u32 = 9;
pub const VIRTIO_F_VERSION_1: u32 = 32;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;
pub const VIRTIO_BLK_ID_BYTES: usize = 20;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;

const REQUEST_QUEUE: usize = 0;
const HEADER_LEN: u32 = 16; // type(u32) reserved(u32) sector(u64)

struct PendingRequest {
    head: u16,
    data_entries: Vec<crate::queue::DescEntry>,
    status_addr: crate::address_space::GuestAddress,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockConfig {
    /// Disk capacity in 512-byte sectors.
    pub capacity: u64,
}

pub struct BlockState {
    pub config: BlockConfig,
    features_page0_ok: bool,
    features_page1_ok: bool,
    backend: BackendConnection,
    /// FIFO of requests forwarded to the backend, matched to
    /// completions in issue order (the shared ring is a single SPSC
    /// channel, so completions cannot arrive out of order).
    pending: VecDeque<PendingRequest>,
    device_id: [u8; VIRTIO_BLK_ID_BYTES],
    backpressure_drops: u64,
}

pub struct Block {
    state: BlockState,
    channel: Box<dyn CrossDomainChannel>,
}

impl Block {
    pub fn new(config: BlockConfig, pool_capacity: usize, channel: Box<dyn CrossDomainChannel>) -> Self {
        Block {
            state: BlockState {
                config,
                features_page0_ok: false,
                features_page1_ok: false,
                backend: BackendConnection::new("blk-backend", 0, SlotOrigin::Tx, pool_capacity, 4096),
                pending: VecDeque::new(),
                device_id: [0u8; VIRTIO_BLK_ID_BYTES],
                backpressure_drops: 0,
            },
            channel,
        }
    }

    /// Called by the VMM's backend-notification handler when the
    /// backend publishes completions. `status_for` decides OK vs
    /// IOERR per completed cookie (backend permitting, per spec §8).
    pub fn process_backend_completions<F>(
        &mut self,
        mem: &dyn GuestMemory,
        queue: &mut Queue,
        mut status_ok: F,
    ) -> Result<bool>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let mut irq_needed = false;
        let mut completed = Vec::new();
        self.state.backend.drain_rx(|data| {
            completed.push(data.to_vec());
        });
        for payload in completed {
            let Some(req) = self.state.pending.pop_front() else {
                warn!("virtio-blk: backend completion with no pending request");
                break;
            };
            let ok = status_ok(&payload);
            let mut offset = 0usize;
            if ok {
                for entry in req.data_entries.iter().filter(|e| e.write) {
                    let take = (entry.len as usize).min(payload.len().saturating_sub(offset));
                    mem.write(entry.addr, &payload[offset..offset + take])?;
                    offset += take;
                }
            }
            let status = if ok { VIRTIO_BLK_S_OK } else { VIRTIO_BLK_S_IOERR };
            mem.write(req.status_addr, &[status])?;
            let bytes_written: u32 =
                req.data_entries.iter().filter(|e| e.write).map(|e| e.len).sum::<u32>() + 1;
            queue.complete(mem, req.head, bytes_written)?;
            irq_needed = true;
        }
        Ok(irq_needed)
    }

    fn handle_chain(&mut self, mem: &dyn GuestMemory, queue: &mut Queue, chain: DescriptorChain) -> Result<bool> {
        if chain.entries.is_empty() || chain.entries[0].write || chain.entries[0].len < HEADER_LEN {
            queue.complete(mem, chain.head_index, 0)?;
            return Ok(true);
        }
        let header_entry = chain.entries[0];
        let mut hdr = [0u8; HEADER_LEN as usize];
        mem.read(header_entry.addr, &mut hdr)?;
        let req_type = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);

        let rest = &chain.entries[1..];
        let Some((status_entry, data_entries)) = rest.split_last() else {
            queue.complete(mem, chain.head_index, 0)?;
            return Ok(true);
        };
        if !status_entry.write || status_entry.len != 1 {
            queue.complete(mem, chain.head_index, 0)?;
            return Ok(true);
        }

        match req_type {
            VIRTIO_BLK_T_FLUSH => {
                mem.write(status_entry.addr, &[VIRTIO_BLK_S_OK])?;
                queue.complete(mem, chain.head_index, 1)?;
                Ok(true)
            }
            VIRTIO_BLK_T_GET_ID => {
                let mut written = 0u32;
                let mut remaining = &self.state.device_id[..];
                for e in data_entries.iter().filter(|e| e.write) {
                    let take = (e.len as usize).min(remaining.len());
                    mem.write(e.addr, &remaining[..take])?;
                    remaining = &remaining[take..];
                    written += take as u32;
                }
                mem.write(status_entry.addr, &[VIRTIO_BLK_S_OK])?;
                queue.complete(mem, chain.head_index, written + 1)?;
                Ok(true)
            }
            VIRTIO_BLK_T_IN | VIRTIO_BLK_T_OUT => {
                let payload = if req_type == VIRTIO_BLK_T_OUT {
                    let mut buf = Vec::new();
                    for e in data_entries.iter().filter(|e| !e.write) {
                        let mut tmp = vec![0u8; e.len as usize];
                        mem.read(e.addr, &mut tmp)?;
                        buf.extend_from_slice(&tmp);
                    }
                    buf
                } else {
                    let len: u32 = data_entries.iter().filter(|e| e.write).map(|e| e.len).sum();
                    vec![0u8; len as usize]
                };

                match self.state.backend.acquire_tx() {
                    Some(mut slot) => {
                        slot.data = payload;
                        let len = slot.data.len();
                        self.state.pending.push_back(PendingRequest {
                            head: chain.head_index,
                            data_entries: data_entries.to_vec(),
                            status_addr: status_entry.addr,
                        });
                        self.state.backend.publish_tx(slot, len, self.channel.as_ref());
                        Ok(false)
                    }
                    None => {
                        self.state.backpressure_drops += 1;
                        mem.write(status_entry.addr, &[VIRTIO_BLK_S_IOERR])?;
                        queue.complete(mem, chain.head_index, 1)?;
                        Ok(true)
                    }
                }
            }
            other => {
                warn!("virtio-blk: unknown request type {:x}", other);
                mem.write(status_entry.addr, &[VIRTIO_BLK_S_IOERR])?;
                queue.complete(mem, chain.head_index, 1)?;
                Ok(true)
            }
        }
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.state.backpressure_drops
    }
}

impl VirtioDevice for Block {
    fn device_type(&self) -> u32 {
        VIRTIO_TYPE_BLOCK
    }

    fn queue_num(&self) -> usize {
        1
    }

    fn reset(&mut self) {
        self.state.features_page0_ok = false;
        self.state.features_page1_ok = false;
        self.state.pending.clear();
    }

    fn get_device_features(&self, features_sel: u32) -> u32 {
        match features_sel {
            0 => 1 << VIRTIO_BLK_F_FLUSH,
            1 => 1 << (VIRTIO_F_VERSION_1 - 32),
            _ => 0,
        }
    }

    fn set_driver_features(&mut self, features_sel: u32, value: u32) -> bool {
        let ok = match features_sel {
            0 => value & !(1 << VIRTIO_BLK_F_FLUSH) == 0,
            1 => virtio_has_feature((value as u64) << 32, VIRTIO_F_VERSION_1),
            _ => false,
        };
        match features_sel {
            0 => self.state.features_page0_ok = ok,
            1 => self.state.features_page1_ok = ok,
            _ => {}
        }
        ok
    }

    /// Both feature pages must have been negotiated okay, in particular
    /// page 1 carrying `VIRTIO_F_VERSION_1`, before the device is
    /// willing to accept `FEATURES_OK`.
    fn features_happy(&self) -> bool {
        self.state.features_page0_ok && self.state.features_page1_ok
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        let capacity = self.state.config.capacity.to_le_bytes();
        let offset = offset as usize;
        for (i, b) in data.iter_mut().enumerate() {
            *b = capacity.get(offset + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_config(&mut self, _offset: u64, _data: &[u8]) -> Result<()> {
        // Block config space is read-only from the guest's perspective.
        Ok(())
    }

    fn queue_notify(&mut self, queue_index: usize, mem: &dyn GuestMemory, queues: &mut [Queue]) -> Result<bool> {
        if queue_index != REQUEST_QUEUE {
            return Ok(false);
        }
        let queue = &mut queues[REQUEST_QUEUE];
        let mut irq_needed = false;
        loop {
            match queue.advance(mem)? {
                AdvanceOutcome::Chain(chain) => {
                    if self.handle_chain(mem, queue, chain)? {
                        irq_needed = true;
                    }
                }
                AdvanceOutcome::Empty => break,
            }
        }
        Ok(irq_needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::{FlatGuestMemory, GuestAddress};
    use crate::queue::DescFlags;

    struct NullChannel;
    impl CrossDomainChannel for NullChannel {
        fn notify(&self, _channel: u32) {}
        fn ppcall(&self, _channel: u32, _msg: &[u64]) -> Vec<u64> {
            Vec::new()
        }
        fn irq_ack(&self, _channel: u32) {}
    }

    fn setup() -> (FlatGuestMemory, Queue, Block) {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x10000);
        let mut q = Queue::new("blk-req", 8);
        q.desc_addr = GuestAddress(0x1000);
        q.avail_addr = GuestAddress(0x2000);
        q.used_addr = GuestAddress(0x3000);
        q.ready = true;
        let blk = Block::new(BlockConfig { capacity: 2048 }, 4, Box::new(NullChannel));
        (mem, q, blk)
    }

    fn write_desc(mem: &FlatGuestMemory, index: u16, addr: u64, len: u32, flags: DescFlags, next: u16) {
        let base = GuestAddress(0x1000 + index as u64 * 16);
        mem.write(base, &addr.to_le_bytes()).unwrap();
        mem.write_u32(base.checked_add(8).unwrap(), len).unwrap();
        mem.write_u16(base.checked_add(12).unwrap(), flags.bits()).unwrap();
        mem.write_u16(base.checked_add(14).unwrap(), next).unwrap();
    }

    fn push_avail(mem: &FlatGuestMemory, slot: u16, head: u16, new_idx: u16) {
        mem.write_u16(GuestAddress(0x2000 + 4 + slot as u64 * 2), head).unwrap();
        mem.write_u16(GuestAddress(0x2002), new_idx).unwrap();
    }

    #[test]
    fn flush_completes_synchronously_with_ok_status() {
        let (mem, mut q, mut blk) = setup();
        write_desc(&mem, 0, 0x5000, 16, DescFlags::NEXT, 1);
        mem.write_u32(GuestAddress(0x5000), VIRTIO_BLK_T_FLUSH).unwrap();
        write_desc(&mem, 1, 0x5100, 1, DescFlags::WRITE, 0);
        push_avail(&mem, 0, 0, 1);

        let irq = blk.queue_notify(0, &mem, std::slice::from_mut(&mut q)).unwrap();
        assert!(irq);
        let mut status = [0u8; 1];
        mem.read(GuestAddress(0x5100), &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_OK);
    }

    #[test]
    fn features_happy_requires_both_pages_negotiated() {
        let (_mem, _q, mut blk) = setup();
        assert!(!blk.features_happy());
        // Page 0 alone, even a trivially valid empty write, must not be
        // enough: VERSION_1 lives in page 1.
        assert!(blk.set_driver_features(0, 0));
        assert!(!blk.features_happy());
        assert!(blk.set_driver_features(1, 1 << (VIRTIO_F_VERSION_1 - 32)));
        assert!(blk.features_happy());
    }

    #[test]
    fn out_request_without_backend_capacity_reports_ioerr() {
        let (mem, mut q, mut blk) = setup();
        // Drain the tiny pool so the OUT request sees backpressure.
        for _ in 0..4 {
            blk.state.backend.acquire_tx();
        }

        write_desc(&mem, 0, 0x5000, 16, DescFlags::NEXT, 1);
        mem.write_u32(GuestAddress(0x5000), VIRTIO_BLK_T_OUT).unwrap();
        write_desc(&mem, 1, 0x5100, 512, DescFlags::NEXT, 2);
        write_desc(&mem, 2, 0x5400, 1, DescFlags::WRITE, 0);
        push_avail(&mem, 0, 0, 1);

        let irq = blk.queue_notify(0, &mem, std::slice::from_mut(&mut q)).unwrap();
        assert!(irq);
        let mut status = [0u8; 1];
        mem.read(GuestAddress(0x5400), &mut status).unwrap();
        assert_eq!(status[0], VIRTIO_BLK_S_IOERR);
        assert_eq!(blk.backpressure_drops(), 1);
    }
}
