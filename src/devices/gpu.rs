// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # GPU device personality
//!
//! Two queues: control=0, cursor=1. This is dispatch-only: the device
//! decodes `virtio_gpu_ctrl_hdr` enough to route a request and always
//! replies with `VIRTIO_GPU_RESP_OK_NODATA`, leaving scanout/resource
//! state to the external collaborator the command is forwarded to.
//! Grounded on `original_source/src/virtio/virtio_gpu_emul.c`, whose
//! `virtio_gpu_*` handlers follow the same "decode header, dispatch,
//! reply" shape.

use anyhow::Result;

use crate::address_space::GuestMemory;
use crate::devices::{virtio_has_feature, VirtioDevice, VIRTIO_TYPE_GPU};
use crate::queue::{AdvanceOutcome, Queue};

pub const VIRTIO_GPU_F_VIRGL: u32 = 0;
pub const VIRTIO_GPU_F_EDID: u32 = 1;
pub const VIRTIO_F_VERSION_1: u32 = 32;

const CONTROL_QUEUE: usize = 0;
const CURSOR_QUEUE: usize = 1;

const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x0102;
const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x0103;
const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x0104;
const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;
const VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING: u32 = 0x0107;
const VIRTIO_GPU_CMD_GET_EDID: u32 = 0x010a;
const VIRTIO_GPU_CMD_UPDATE_CURSOR: u32 = 0x0300;
const VIRTIO_GPU_CMD_MOVE_CURSOR: u32 = 0x0301;

const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;
const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;

/// `virtio_gpu_ctrl_hdr`: type, flags, fence_id, ctx_id, padding.
const CTRL_HDR_LEN: usize = 24;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct GpuConfig {
    pub num_scanouts: u32,
    pub events_read: u32,
    pub events_clear: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            num_scanouts: 1,
            events_read: 0,
            events_clear: 0,
        }
    }
}

pub struct Gpu {
    pub config: GpuConfig,
    features_page0_ok: bool,
    features_page1_ok: bool,
    requests_dispatched: u64,
}

impl Gpu {
    pub fn new(config: GpuConfig) -> Self {
        Gpu {
            config,
            features_page0_ok: false,
            features_page1_ok: false,
            requests_dispatched: 0,
        }
    }

    pub fn requests_dispatched(&self) -> u64 {
        self.requests_dispatched
    }

    fn dispatch_type(cmd_type: u32) -> u32 {
        match cmd_type {
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO => VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D
            | VIRTIO_GPU_CMD_RESOURCE_UNREF
            | VIRTIO_GPU_CMD_SET_SCANOUT
            | VIRTIO_GPU_CMD_RESOURCE_FLUSH
            | VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D
            | VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING
            | VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING
            | VIRTIO_GPU_CMD_UPDATE_CURSOR
            | VIRTIO_GPU_CMD_MOVE_CURSOR => VIRTIO_GPU_RESP_OK_NODATA,
            VIRTIO_GPU_CMD_GET_EDID => VIRTIO_GPU_RESP_OK_NODATA,
            _ => VIRTIO_GPU_RESP_ERR_UNSPEC,
        }
    }

    fn handle_control(&mut self, mem: &dyn GuestMemory, queue: &mut Queue) -> Result<bool> {
        let mut irq_needed = false;
        loop {
            match queue.advance(mem)? {
                AdvanceOutcome::Chain(chain) => {
                    let payload = chain.read_readable(mem)?;
                    let resp_type = if payload.len() < CTRL_HDR_LEN {
                        warn!("virtio-gpu: control chain shorter than header, dropping");
                        VIRTIO_GPU_RESP_ERR_UNSPEC
                    } else {
                        let cmd_type = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                        self.requests_dispatched += 1;
                        Self::dispatch_type(cmd_type)
                    };

                    let mut written = 0u32;
                    let resp = resp_type.to_le_bytes();
                    for e in chain.writeable_entries() {
                        if e.len >= resp.len() as u32 {
                            mem.write(e.addr, &resp)?;
                            written = resp.len() as u32;
                            break;
                        }
                    }
                    queue.complete(mem, chain.head_index, written)?;
                    irq_needed = true;
                }
                AdvanceOutcome::Empty => break,
            }
        }
        Ok(irq_needed)
    }

    fn handle_cursor(&mut self, mem: &dyn GuestMemory, queue: &mut Queue) -> Result<bool> {
        let mut irq_needed = false;
        loop {
            match queue.advance(mem)? {
                AdvanceOutcome::Chain(chain) => {
                    let _payload = chain.read_readable(mem)?;
                    self.requests_dispatched += 1;
                    queue.complete(mem, chain.head_index, 0)?;
                    irq_needed = true;
                }
                AdvanceOutcome::Empty => break,
            }
        }
        Ok(irq_needed)
    }
}

impl VirtioDevice for Gpu {
    fn device_type(&self) -> u32 {
        VIRTIO_TYPE_GPU
    }

    fn queue_num(&self) -> usize {
        2
    }

    fn reset(&mut self) {
        self.features_page0_ok = false;
        self.features_page1_ok = false;
        self.config.events_read = 0;
    }

    fn get_device_features(&self, features_sel: u32) -> u32 {
        match features_sel {
            0 => (1 << VIRTIO_GPU_F_VIRGL) | (1 << VIRTIO_GPU_F_EDID),
            1 => 1 << (VIRTIO_F_VERSION_1 - 32),
            _ => 0,
        }
    }

    fn set_driver_features(&mut self, features_sel: u32, value: u32) -> bool {
        let ok = match features_sel {
            0 => value & !((1 << VIRTIO_GPU_F_VIRGL) | (1 << VIRTIO_GPU_F_EDID)) == 0,
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
        let bytes = [
            self.config.events_read.to_le_bytes(),
            self.config.events_clear.to_le_bytes(),
            self.config.num_scanouts.to_le_bytes(),
            0u32.to_le_bytes(),
        ]
        .concat();
        let offset = offset as usize;
        for (i, b) in data.iter_mut().enumerate() {
            *b = bytes.get(offset + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        // events_clear at byte offset 4..8; writing bits clears the
        // matching bits of events_read.
        if offset == 4 && data.len() >= 4 {
            let clear = u32::from_le_bytes(data[0..4].try_into().unwrap());
            self.config.events_read &= !clear;
        }
        Ok(())
    }

    fn queue_notify(&mut self, queue_index: usize, mem: &dyn GuestMemory, queues: &mut [Queue]) -> Result<bool> {
        match queue_index {
            CONTROL_QUEUE => self.handle_control(mem, &mut queues[queue_index]),
            CURSOR_QUEUE => self.handle_cursor(mem, &mut queues[queue_index]),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::{FlatGuestMemory, GuestAddress};
    use crate::queue::DescFlags;

    fn write_desc(mem: &FlatGuestMemory, base: u64, index: u16, addr: u64, len: u32, flags: DescFlags, next: u16) {
        let d = GuestAddress(base + index as u64 * 16);
        mem.write(d, &addr.to_le_bytes()).unwrap();
        mem.write_u32(d.checked_add(8).unwrap(), len).unwrap();
        mem.write_u16(d.checked_add(12).unwrap(), flags.bits()).unwrap();
        mem.write_u16(d.checked_add(14).unwrap(), next).unwrap();
    }

    fn push_avail(mem: &FlatGuestMemory, avail_base: u64, slot: u16, head: u16, new_idx: u16) {
        mem.write_u16(GuestAddress(avail_base + 4 + slot as u64 * 2), head).unwrap();
        mem.write_u16(GuestAddress(avail_base + 2), new_idx).unwrap();
    }

    #[test]
    fn get_display_info_replies_with_ok_display_info() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x10000);
        let mut ctrl_q = Queue::new("gpu-ctrl", 4);
        ctrl_q.desc_addr = GuestAddress(0x1000);
        ctrl_q.avail_addr = GuestAddress(0x2000);
        ctrl_q.used_addr = GuestAddress(0x3000);
        ctrl_q.ready = true;
        let mut cursor_q = Queue::new("gpu-cursor", 4);
        cursor_q.ready = true;

        let mut hdr = vec![0u8; CTRL_HDR_LEN];
        hdr[0..4].copy_from_slice(&VIRTIO_GPU_CMD_GET_DISPLAY_INFO.to_le_bytes());
        mem.write(GuestAddress(0x8000), &hdr).unwrap();
        write_desc(&mem, 0x1000, 0, 0x8000, hdr.len() as u32, DescFlags::NEXT, 1);
        write_desc(&mem, 0x1000, 1, 0x9000, 64, DescFlags::WRITE, 0);
        push_avail(&mem, 0x2000, 0, 0, 1);

        let mut gpu = Gpu::new(GpuConfig::default());
        let mut queues = [ctrl_q, cursor_q];
        gpu.queue_notify(0, &mem, &mut queues).unwrap();

        let resp = queues[0].used_addr;
        let used_len = mem.read_u32(resp.checked_add(4 + 4).unwrap()).unwrap();
        assert_eq!(used_len, 4);
        let mut resp_bytes = [0u8; 4];
        mem.read(GuestAddress(0x9000), &mut resp_bytes).unwrap();
        assert_eq!(u32::from_le_bytes(resp_bytes), VIRTIO_GPU_RESP_OK_DISPLAY_INFO);
        assert_eq!(gpu.requests_dispatched(), 1);
    }

    #[test]
    fn events_clear_write_clears_matching_events_read_bits() {
        let mut gpu = Gpu::new(GpuConfig::default());
        gpu.config.events_read = 0b11;
        gpu.write_config(4, &1u32.to_le_bytes()).unwrap();
        assert_eq!(gpu.config.events_read, 0b10);
    }
}
