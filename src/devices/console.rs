// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Console device personality
//!
//! Two queues per port: RX=0, TX=1. This implementation covers port 0
//! only (multiport control is out of scope, spec §4.3 names only
//! "two queues per port"). TX payloads are copied into the backend
//! serial shared ring; RX bytes are gathered into available RX chains,
//! and a partially full chain is completed on the first backend
//! notification to preserve latency rather than waiting to fill it.

use anyhow::Result;

use crate::address_space::GuestMemory;
use crate::devices::{virtio_has_feature, VirtioDevice, VIRTIO_TYPE_CONSOLE};
use crate::external::CrossDomainChannel;
use crate::queue::{AdvanceOutcome, Queue};
use crate::transport::{BackendConnection, SlotOrigin};

pub const VIRTIO_CONSOLE_F_SIZE: u64 = 0;
pub const VIRTIO_F_VERSION_1: u32 = 32;

const RX_QUEUE: usize = 0;
const TX_QUEUE: usize = 1;

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ConsoleConfig {
    pub cols: u16,
    pub rows: u16,
}

pub struct VirtioConsoleState {
    features_page0_ok: bool,
    features_page1_ok: bool,
    backpressure_drops: u64,
}

pub struct Console {
    pub config: ConsoleConfig,
    state: VirtioConsoleState,
    tx: BackendConnection,
    rx: BackendConnection,
    channel: Box<dyn CrossDomainChannel>,
}

impl Console {
    pub fn new(config: ConsoleConfig, pool_capacity: usize, channel: Box<dyn CrossDomainChannel>) -> Self {
        Console {
            config,
            state: VirtioConsoleState {
                features_page0_ok: false,
                features_page1_ok: false,
                backpressure_drops: 0,
            },
            tx: BackendConnection::new("console-tx", 2, SlotOrigin::Tx, pool_capacity, 256),
            rx: BackendConnection::new("console-rx", 3, SlotOrigin::Rx, pool_capacity, 256),
            channel,
        }
    }

    fn handle_tx(&mut self, mem: &dyn GuestMemory, queue: &mut Queue) -> Result<bool> {
        let mut irq_needed = false;
        loop {
            match queue.advance(mem)? {
                AdvanceOutcome::Chain(chain) => {
                    let payload = chain.read_readable(mem)?;
                    match self.tx.acquire_tx() {
                        Some(mut slot) => {
                            slot.data = payload;
                            let len = slot.data.len();
                            self.tx.publish_tx(slot, len, self.channel.as_ref());
                        }
                        None => {
                            self.state.backpressure_drops += 1;
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

    /// Gather whatever backend bytes are pending into available RX
    /// chains, completing each as soon as it has *any* bytes rather
    /// than waiting for it to fill, to preserve latency.
    pub fn deliver_rx(&mut self, mem: &dyn GuestMemory, rx_queue: &mut Queue) -> Result<bool> {
        let mut pending = Vec::new();
        self.rx.drain_rx(|chunk| pending.extend_from_slice(chunk));

        let mut irq_needed = false;
        let mut offset = 0usize;
        while offset < pending.len() {
            match rx_queue.advance(mem)? {
                AdvanceOutcome::Chain(chain) => {
                    let mut written = 0u32;
                    for e in chain.writeable_entries() {
                        if offset >= pending.len() {
                            break;
                        }
                        let take = (e.len as usize).min(pending.len() - offset);
                        mem.write(e.addr, &pending[offset..offset + take])?;
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
}

impl VirtioDevice for Console {
    fn device_type(&self) -> u32 {
        VIRTIO_TYPE_CONSOLE
    }

    fn queue_num(&self) -> usize {
        2
    }

    fn reset(&mut self) {
        self.state.features_page0_ok = false;
        self.state.features_page1_ok = false;
    }

    fn get_device_features(&self, features_sel: u32) -> u32 {
        match features_sel {
            0 => 1 << VIRTIO_CONSOLE_F_SIZE,
            1 => 1 << (VIRTIO_F_VERSION_1 - 32),
            _ => 0,
        }
    }

    fn set_driver_features(&mut self, features_sel: u32, value: u32) -> bool {
        let ok = match features_sel {
            0 => value & !(1 << VIRTIO_CONSOLE_F_SIZE) == 0,
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

    fn features_happy(&self) -> bool {
        self.state.features_page0_ok && self.state.features_page1_ok
    }

    fn read_config(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        let bytes = [
            self.config.cols.to_le_bytes()[0],
            self.config.cols.to_le_bytes()[1],
            self.config.rows.to_le_bytes()[0],
            self.config.rows.to_le_bytes()[1],
        ];
        let offset = offset as usize;
        for (i, b) in data.iter_mut().enumerate() {
            *b = bytes.get(offset + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_config(&mut self, _offset: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn queue_notify(&mut self, queue_index: usize, mem: &dyn GuestMemory, queues: &mut [Queue]) -> Result<bool> {
        match queue_index {
            TX_QUEUE => self.handle_tx(mem, &mut queues[queue_index]),
            RX_QUEUE => Ok(false),
            _ => Ok(false),
        }
    }
}
