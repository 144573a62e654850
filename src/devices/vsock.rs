// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Vsock device personality
//!
//! Three queues: RX=0, TX=1, event=2. States per connection: CLOSED ->
//! REQUEST -> ESTABLISHED -> CLOSING -> CLOSED. This module defines
//! only the framing and lifecycle named in spec §4.3; the full
//! transport-layer credit model (buf_alloc/fwd_cnt enforcement) follows
//! the virtio-vsock 1.2 specification and is left to the backend — the
//! header fields are tracked here for bookkeeping, not enforced.
//!
//! The original implementation's `virtio_vsock_handle_tx` /
//! `virtio_vsock_handle_rx` are unimplemented stubs
//! (`original_source/src/virtio/vsock.c`); this is a from-scratch
//! implementation grounded in the virtio-vsock 1.2 op codes spec.md
//! names.

use std::collections::HashMap;

use anyhow::Result;

use crate::address_space::GuestMemory;
use crate::devices::{virtio_has_feature, VirtioDevice, VIRTIO_TYPE_VSOCK};
use crate::external::CrossDomainChannel;
use crate::queue::{AdvanceOutcome, Queue};
use crate::transport::{BackendConnection, SlotOrigin};

pub const VIRTIO_F_VERSION_1: u32 = 32;

const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;
const EVENT_QUEUE: usize = 2;

/// `virtio_vsock_hdr`: src_cid, dst_cid (u64 each), src_port, dst_port,
/// len, type, op, buf_alloc, fwd_cnt.
const HDR_LEN: usize = 44;

pub const VIRTIO_VSOCK_OP_REQUEST: u16 = 1;
pub const VIRTIO_VSOCK_OP_RESPONSE: u16 = 2;
pub const VIRTIO_VSOCK_OP_RST: u16 = 3;
pub const VIRTIO_VSOCK_OP_SHUTDOWN: u16 = 4;
pub const VIRTIO_VSOCK_OP_RW: u16 = 5;
pub const VIRTIO_VSOCK_OP_CREDIT_UPDATE: u16 = 6;
pub const VIRTIO_VSOCK_OP_CREDIT_REQUEST: u16 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsockState {
    Closed,
    Request,
    Established,
    Closing,
}

#[derive(Debug, Clone, Copy)]
struct VsockConnection {
    state: VsockState,
    peer_buf_alloc: u32,
    peer_fwd_cnt: u32,
}

#[derive(Debug, Clone, Copy)]
struct VsockHeader {
    src_cid: u64,
    dst_cid: u64,
    src_port: u32,
    dst_port: u32,
    len: u32,
    ty: u16,
    op: u16,
    buf_alloc: u32,
    fwd_cnt: u32,
}

impl VsockHeader {
    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HDR_LEN {
            return None;
        }
        Some(VsockHeader {
            src_cid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            dst_cid: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            src_port: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            dst_port: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            len: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            ty: u16::from_le_bytes(buf[28..30].try_into().unwrap()),
            op: u16::from_le_bytes(buf[30..32].try_into().unwrap()),
            buf_alloc: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            fwd_cnt: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct VsockConfig {
    pub cid: u64,
}

pub struct Vsock {
    pub cid: u64,
    connections: HashMap<(u32, u32), VsockConnection>,
    features_page0_ok: bool,
    features_page1_ok: bool,
    tx: BackendConnection,
    rx: BackendConnection,
    event: BackendConnection,
    channel: Box<dyn CrossDomainChannel>,
    backpressure_drops: u64,
}

impl Vsock {
    pub fn new(config: VsockConfig, pool_capacity: usize, channel: Box<dyn CrossDomainChannel>) -> Self {
        Vsock {
            cid: config.cid,
            connections: HashMap::new(),
            features_page0_ok: false,
            features_page1_ok: false,
            tx: BackendConnection::new("vsock-tx", 4, SlotOrigin::Tx, pool_capacity, 4096),
            rx: BackendConnection::new("vsock-rx", 5, SlotOrigin::Rx, pool_capacity, 4096),
            event: BackendConnection::new("vsock-event", 6, SlotOrigin::Rx, pool_capacity, 16),
            channel,
            backpressure_drops: 0,
        }
    }

    pub fn connection_state(&self, src_port: u32, dst_port: u32) -> VsockState {
        self.connections
            .get(&(src_port, dst_port))
            .map(|c| c.state)
            .unwrap_or(VsockState::Closed)
    }

    fn apply_local_transition(&mut self, hdr: &VsockHeader) {
        let key = (hdr.src_port, hdr.dst_port);
        match hdr.op {
            VIRTIO_VSOCK_OP_REQUEST => {
                self.connections.insert(
                    key,
                    VsockConnection {
                        state: VsockState::Request,
                        peer_buf_alloc: hdr.buf_alloc,
                        peer_fwd_cnt: hdr.fwd_cnt,
                    },
                );
            }
            VIRTIO_VSOCK_OP_RST => {
                self.connections.remove(&key);
            }
            VIRTIO_VSOCK_OP_SHUTDOWN => {
                if let Some(c) = self.connections.get_mut(&key) {
                    c.state = VsockState::Closing;
                }
            }
            _ => {
                if let Some(c) = self.connections.get_mut(&key) {
                    c.peer_buf_alloc = hdr.buf_alloc;
                    c.peer_fwd_cnt = hdr.fwd_cnt;
                }
            }
        }
    }

    /// Apply a state transition driven by a frame arriving *from* the
    /// backend (the remote peer's response).
    fn apply_remote_transition(&mut self, hdr: &VsockHeader) {
        // From the guest's point of view the keys are (src_port,
        // dst_port); an inbound frame swaps the roles.
        let key = (hdr.dst_port, hdr.src_port);
        match hdr.op {
            VIRTIO_VSOCK_OP_RESPONSE => {
                if let Some(c) = self.connections.get_mut(&key) {
                    c.state = VsockState::Established;
                }
            }
            VIRTIO_VSOCK_OP_RST => {
                self.connections.remove(&key);
            }
            VIRTIO_VSOCK_OP_SHUTDOWN => {
                if let Some(c) = self.connections.get_mut(&key) {
                    c.state = VsockState::Closing;
                }
            }
            _ => {}
        }
    }

    fn handle_tx(&mut self, mem: &dyn GuestMemory, queue: &mut Queue) -> Result<bool> {
        let mut irq_needed = false;
        loop {
            match queue.advance(mem)? {
                AdvanceOutcome::Chain(chain) => {
                    let payload = chain.read_readable(mem)?;
                    if let Some(hdr) = VsockHeader::parse(&payload) {
                        self.apply_local_transition(&hdr);
                    } else {
                        warn!("virtio-vsock: tx chain shorter than header, dropping");
                        queue.complete(mem, chain.head_index, 0)?;
                        irq_needed = true;
                        continue;
                    }

                    match self.tx.acquire_tx() {
                        Some(mut slot) => {
                            slot.data = payload;
                            let len = slot.data.len();
                            self.tx.publish_tx(slot, len, self.channel.as_ref());
                        }
                        None => {
                            self.backpressure_drops += 1;
                            self.tx.bump_backpressure();
                        }
                    }
                    queue.complete(mem, chain.head_index, 0)?;
                    irq_needed = true;
                }
                AdvanceOutcome::Empty => break,
            }
        }
        Ok(irq_needed)
    }

    pub fn deliver_rx(&mut self, mem: &dyn GuestMemory, rx_queue: &mut Queue) -> Result<bool> {
        let mut frames = Vec::new();
        self.rx.drain_rx(|data| frames.push(data.to_vec()));

        let mut irq_needed = false;
        for frame in frames {
            if let Some(hdr) = VsockHeader::parse(&frame) {
                self.apply_remote_transition(&hdr);
            }
            match rx_queue.advance(mem)? {
                AdvanceOutcome::Chain(chain) => {
                    let mut offset = 0usize;
                    let mut written = 0u32;
                    for e in chain.writeable_entries() {
                        if offset >= frame.len() {
                            break;
                        }
                        let take = (e.len as usize).min(frame.len() - offset);
                        mem.write(e.addr, &frame[offset..offset + take])?;
                        offset += take;
                        written += take as u32;
                    }
                    rx_queue.complete(mem, chain.head_index, written)?;
                    irq_needed = true;
                }
                AdvanceOutcome::Empty => {
                    self.rx.bump_backpressure();
                    break;
                }
            }
        }
        Ok(irq_needed)
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.backpressure_drops
    }
}

impl VirtioDevice for Vsock {
    fn device_type(&self) -> u32 {
        VIRTIO_TYPE_VSOCK
    }

    fn queue_num(&self) -> usize {
        3
    }

    fn reset(&mut self) {
        self.features_page0_ok = false;
        self.features_page1_ok = false;
        self.connections.clear();
    }

    fn get_device_features(&self, features_sel: u32) -> u32 {
        match features_sel {
            0 => 0,
            1 => 1 << (VIRTIO_F_VERSION_1 - 32),
            _ => 0,
        }
    }

    fn set_driver_features(&mut self, features_sel: u32, value: u32) -> bool {
        let ok = match features_sel {
            0 => value == 0,
            1 => virtio_has_feature((value as u64) << 32, VIRTIO_F_VERSION_1),
            _ => false,
        };
        match features_sel {
            0 => self.features_page0_ok = ok,
            1 => self.features_page1_ok = ok,
            _ => {}
        }
        ok
    }

    fn features_happy(&self) -> bool {
        self.features_page0_ok && self.features_page1_ok
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        let cid = self.cid.to_le_bytes();
        let offset = offset as usize;
        for (i, b) in data.iter_mut().enumerate() {
            *b = cid.get(offset + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_config(&mut self, _offset: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn queue_notify(&mut self, queue_index: usize, mem: &dyn GuestMemory, queues: &mut [Queue]) -> Result<bool> {
        match queue_index {
            TX_QUEUE => self.handle_tx(mem, &mut queues[queue_index]),
            RX_QUEUE | EVENT_QUEUE => Ok(false),
            _ => Ok(false),
        }
    }
}
