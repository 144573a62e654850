// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # MMIO dispatcher
//!
//! Decodes faulted MMIO accesses over a virtio-mmio register window
//! into operations on a device instance: feature negotiation, queue
//! arming, notification, and the `Status` state machine. One
//! [`VirtioMmioDevice`] per device instance; a [`DeviceRegistry`] maps
//! guest-physical apertures to instances, replacing the original's
//! process-wide per-class statics (spec's redesign flag).

use std::collections::BTreeMap;

use thiserror::Error;

use crate::address_space::{GuestAddress, GuestMemory};
use crate::devices::VirtioDevice;
use crate::interrupt::InterruptInjector;
use crate::queue::Queue;

const MAGIC_VALUE: u32 = 0x7472_6976; // 'virt'
const VERSION: u32 = 2;

const REG_MAGIC_VALUE: u64 = 0x000;
const REG_VERSION: u64 = 0x004;
const REG_DEVICE_ID: u64 = 0x008;
const REG_VENDOR_ID: u64 = 0x00C;
const REG_DEVICE_FEATURES: u64 = 0x010;
const REG_DEVICE_FEATURES_SEL: u64 = 0x014;
const REG_DRIVER_FEATURES: u64 = 0x020;
const REG_DRIVER_FEATURES_SEL: u64 = 0x024;
const REG_QUEUE_SEL: u64 = 0x030;
const REG_QUEUE_NUM_MAX: u64 = 0x034;
const REG_QUEUE_NUM: u64 = 0x038;
const REG_QUEUE_READY: u64 = 0x044;
const REG_QUEUE_NOTIFY: u64 = 0x050;
const REG_INTERRUPT_STATUS: u64 = 0x060;
const REG_INTERRUPT_ACK: u64 = 0x064;
const REG_STATUS: u64 = 0x070;
const REG_QUEUE_DESC_LOW: u64 = 0x080;
const REG_QUEUE_DESC_HIGH: u64 = 0x084;
const REG_QUEUE_AVAIL_LOW: u64 = 0x090;
const REG_QUEUE_AVAIL_HIGH: u64 = 0x094;
const REG_QUEUE_USED_LOW: u64 = 0x0A0;
const REG_QUEUE_USED_HIGH: u64 = 0x0A4;
const REG_CONFIG_START: u64 = 0x100;

bitflags::bitflags! {
    /// `Status` register bits, refer to Virtio Spec §2.1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const ACKNOWLEDGE = 0x1;
        const DRIVER = 0x2;
        const DRIVER_OK = 0x4;
        const FEATURES_OK = 0x8;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioError {
    #[error("access width {0} unsupported at offset 0x{1:x}")]
    UnsupportedWidth(u8, u64),
    #[error("write to read-only register at offset 0x{0:x}")]
    WriteToReadOnly(u64),
    #[error("read from write-only register at offset 0x{0:x}")]
    ReadFromWriteOnly(u64),
    #[error("queue base registers are locked while QueueReady is set (offset 0x{0:x})")]
    QueueBaseLocked(u64),
    #[error("no queue selected via QueueSel")]
    NoQueueSelected,
    #[error("queue selector {0} out of range")]
    QueueSelOutOfRange(u32),
}

/// Outcome of a single [`VirtioMmioDevice::handle_mmio`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioOutcome {
    /// A read returns its value; a write carries no payload.
    Handled(Option<u32>),
    /// Access was well-formed but not permitted right now (e.g. a queue
    /// base write while `QueueReady` is set). Reported to the caller,
    /// never panics, and has no observable effect — matching the
    /// "idempotent" requirement for illegal register writes.
    Fault,
}

/// One device instance wired to its MMIO aperture: register state,
/// queues, personality, and interrupt injector.
pub struct VirtioMmioDevice {
    pub device: Box<dyn VirtioDevice>,
    pub queues: Vec<Queue>,
    pub injector: InterruptInjector,
    status: Status,
    device_features_sel: u32,
    driver_features_sel: u32,
    queue_sel: u32,
    interrupt_status: u8,
    queue_num_staging: Vec<u16>,
}

impl VirtioMmioDevice {
    pub fn new(device: Box<dyn VirtioDevice>, injector: InterruptInjector) -> Self {
        let queue_num = device.queue_num();
        let max = device.queue_size_max();
        let queues = (0..queue_num).map(|_| Queue::new("virtqueue", max)).collect();
        VirtioMmioDevice {
            device,
            queues,
            injector,
            status: Status::empty(),
            device_features_sel: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            interrupt_status: 0,
            queue_num_staging: vec![max; queue_num],
        }
    }

    pub fn interrupt_status(&self) -> u8 {
        self.interrupt_status
    }

    pub fn status(&self) -> u32 {
        self.status.bits()
    }

    fn selected_queue_mut(&mut self) -> Option<&mut Queue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn reset(&mut self) {
        self.device.reset();
        for q in &mut self.queues {
            q.reset();
        }
        self.status = Status::empty();
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.queue_sel = 0;
        self.interrupt_status = 0;
        for (i, n) in self.queue_num_staging.iter_mut().enumerate() {
            *n = self.queues.get(i).map(|q| q.num).unwrap_or(*n);
        }
    }

    /// Apply a guest write to `Status`. A write of zero resets the
    /// device. Otherwise the new bits are OR'd onto the register
    /// (matching real virtio-mmio hosts, which never let a driver
    /// retract a status bit except via reset); `FEATURES_OK` is
    /// dropped silently unless the personality accepted the offered
    /// features, and any bit outside the legal forward sequence sets
    /// `FAILED` instead of being applied.
    fn write_status(&mut self, value: u32) {
        if value == 0 {
            self.reset();
            return;
        }
        let requested = Status::from_bits_truncate(value);
        let mut next = self.status;

        let legal_order = [
            Status::ACKNOWLEDGE,
            Status::DRIVER,
            Status::FEATURES_OK,
            Status::DRIVER_OK,
        ];
        let mut highest_legal = Status::empty();
        for bit in legal_order {
            if requested.contains(bit) {
                highest_legal |= bit;
            }
        }
        let illegal_bits = requested & !highest_legal & !Status::FAILED;

        for bit in legal_order {
            if !requested.contains(bit) || next.contains(bit) {
                continue;
            }
            if bit == Status::FEATURES_OK && !self.device.features_happy() {
                warn!("{}: FEATURES_OK rejected, features not accepted", self.device.device_type());
                continue;
            }
            next |= bit;
        }

        if !illegal_bits.is_empty() {
            next |= Status::FAILED;
        }
        self.status = next;
    }

    fn read_config_reg(&mut self, offset: u64, width: u8) -> Result<u32, MmioError> {
        let config_off = offset - REG_CONFIG_START;
        let mut buf = [0u8; 4];
        self.device
            .read_config(config_off, &mut buf[..width as usize])
            .map_err(|_| MmioError::UnsupportedWidth(width, offset))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_config_reg(&mut self, offset: u64, width: u8, value: u32) -> Result<(), MmioError> {
        let config_off = offset - REG_CONFIG_START;
        let bytes = value.to_le_bytes();
        self.device
            .write_config(config_off, &bytes[..width as usize])
            .map_err(|_| MmioError::UnsupportedWidth(width, offset))
    }

    /// Decode and apply one guest MMIO access. `value` is ignored for
    /// reads and required for writes.
    pub fn handle_mmio(
        &mut self,
        mem: &dyn GuestMemory,
        offset: u64,
        is_write: bool,
        width: u8,
        value: u32,
    ) -> Result<MmioOutcome, MmioError> {
        if ![1u8, 2, 4].contains(&width) {
            return Err(MmioError::UnsupportedWidth(width, offset));
        }

        if offset >= REG_CONFIG_START {
            return if is_write {
                self.write_config_reg(offset, width, value)?;
                Ok(MmioOutcome::Handled(None))
            } else {
                Ok(MmioOutcome::Handled(Some(self.read_config_reg(offset, width)?)))
            };
        }

        if is_write {
            self.handle_write(mem, offset, value)
        } else {
            self.handle_read(offset)
        }
    }

    fn handle_read(&mut self, offset: u64) -> Result<MmioOutcome, MmioError> {
        let v = match offset {
            REG_MAGIC_VALUE => MAGIC_VALUE,
            REG_VERSION => VERSION,
            REG_DEVICE_ID => self.device.device_type(),
            REG_VENDOR_ID => crate::devices::VENDOR_ID,
            REG_DEVICE_FEATURES => self.device.get_device_features(self.device_features_sel),
            REG_QUEUE_NUM_MAX => self.device.queue_size_max() as u32,
            REG_INTERRUPT_STATUS => self.interrupt_status as u32,
            REG_STATUS => self.status.bits(),
            REG_QUEUE_SEL => self.queue_sel,
            REG_QUEUE_NUM => self
                .queues
                .get(self.queue_sel as usize)
                .map(|q| q.num as u32)
                .unwrap_or(0),
            REG_QUEUE_READY => self
                .queues
                .get(self.queue_sel as usize)
                .map(|q| q.ready as u32)
                .unwrap_or(0),
            REG_DEVICE_FEATURES_SEL
            | REG_DRIVER_FEATURES
            | REG_DRIVER_FEATURES_SEL
            | REG_QUEUE_NOTIFY
            | REG_INTERRUPT_ACK
            | REG_QUEUE_DESC_LOW
            | REG_QUEUE_DESC_HIGH
            | REG_QUEUE_AVAIL_LOW
            | REG_QUEUE_AVAIL_HIGH
            | REG_QUEUE_USED_LOW
            | REG_QUEUE_USED_HIGH => return Err(MmioError::ReadFromWriteOnly(offset)),
            _ => return Ok(MmioOutcome::Fault),
        };
        Ok(MmioOutcome::Handled(Some(v)))
    }

    fn handle_write(&mut self, mem: &dyn GuestMemory, offset: u64, value: u32) -> Result<MmioOutcome, MmioError> {
        match offset {
            REG_DEVICE_FEATURES_SEL => {
                self.device_features_sel = value;
            }
            REG_DRIVER_FEATURES_SEL => {
                self.driver_features_sel = value;
            }
            REG_DRIVER_FEATURES => {
                self.device.set_driver_features(self.driver_features_sel, value);
            }
            REG_QUEUE_SEL => {
                self.queue_sel = value;
            }
            REG_QUEUE_NUM => {
                let idx = self.queue_sel as usize;
                if idx >= self.queues.len() {
                    return Err(MmioError::QueueSelOutOfRange(self.queue_sel));
                }
                if self.queues[idx].ready {
                    return Ok(MmioOutcome::Fault);
                }
                self.queue_num_staging[idx] = value as u16;
                self.queues[idx].num = value as u16;
            }
            REG_QUEUE_READY => {
                let idx = self.queue_sel as usize;
                let q = self
                    .queues
                    .get_mut(idx)
                    .ok_or(MmioError::QueueSelOutOfRange(self.queue_sel))?;
                if value == 0 {
                    q.ready = false;
                } else {
                    q.ready = true;
                }
            }
            REG_QUEUE_NOTIFY => {
                let idx = value as usize;
                if idx >= self.queues.len() {
                    return Ok(MmioOutcome::Fault);
                }
                let irq_needed = self
                    .device
                    .queue_notify(idx, mem, &mut self.queues)
                    .map_err(|_| MmioError::QueueSelOutOfRange(value))?;
                if irq_needed {
                    self.injector.raise_vring(&mut self.interrupt_status);
                }
            }
            REG_INTERRUPT_ACK => {
                self.injector.ack(&mut self.interrupt_status, value as u8);
            }
            REG_STATUS => {
                self.write_status(value);
            }
            REG_QUEUE_DESC_LOW | REG_QUEUE_DESC_HIGH | REG_QUEUE_AVAIL_LOW | REG_QUEUE_AVAIL_HIGH
            | REG_QUEUE_USED_LOW | REG_QUEUE_USED_HIGH => {
                let idx = self.queue_sel as usize;
                let q = self
                    .queues
                    .get_mut(idx)
                    .ok_or(MmioError::QueueSelOutOfRange(self.queue_sel))?;
                if q.ready {
                    return Err(MmioError::QueueBaseLocked(offset));
                }
                apply_base_write(q, offset, value);
            }
            REG_MAGIC_VALUE | REG_VERSION | REG_DEVICE_ID | REG_VENDOR_ID | REG_DEVICE_FEATURES
            | REG_QUEUE_NUM_MAX | REG_INTERRUPT_STATUS => {
                return Err(MmioError::WriteToReadOnly(offset));
            }
            _ => return Ok(MmioOutcome::Fault),
        }
        Ok(MmioOutcome::Handled(None))
    }
}

fn apply_base_write(q: &mut Queue, offset: u64, value: u32) {
    let (field, is_high) = match offset {
        REG_QUEUE_DESC_LOW => (0, false),
        REG_QUEUE_DESC_HIGH => (0, true),
        REG_QUEUE_AVAIL_LOW => (1, false),
        REG_QUEUE_AVAIL_HIGH => (1, true),
        REG_QUEUE_USED_LOW => (2, false),
        REG_QUEUE_USED_HIGH => (2, true),
        _ => unreachable!(),
    };
    let current = match field {
        0 => &mut q.desc_addr,
        1 => &mut q.avail_addr,
        _ => &mut q.used_addr,
    };
    let lo = (current.0 & 0xFFFF_FFFF) as u32;
    let hi = (current.0 >> 32) as u32;
    let (new_lo, new_hi) = if is_high { (lo, value) } else { (value, hi) };
    *current = GuestAddress(((new_hi as u64) << 32) | new_lo as u64);
}

/// Maps guest-physical apertures to device instances. Replaces the
/// per-class process-wide statics the original used.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u64, (u64, VirtioMmioDevice)>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            devices: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, base: u64, size: u64, device: VirtioMmioDevice) {
        self.devices.insert(base, (size, device));
    }

    fn locate_mut(&mut self, addr: u64) -> Option<(u64, &mut VirtioMmioDevice)> {
        let (&base, (size, _)) = self.devices.range(..=addr).next_back()?;
        if addr < base + *size {
            let (_, dev) = self.devices.get_mut(&base).unwrap();
            Some((base, dev))
        } else {
            None
        }
    }

    pub fn dispatch(
        &mut self,
        mem: &dyn GuestMemory,
        addr: u64,
        is_write: bool,
        width: u8,
        value: u32,
    ) -> Result<MmioOutcome, crate::error::VirtioError> {
        let (base, dev) = self
            .locate_mut(addr)
            .ok_or(crate::error::VirtioError::NoDeviceAtAddress(addr))?;
        let offset = addr - base;
        dev.handle_mmio(mem, offset, is_write, width, value)
            .map_err(crate::error::VirtioError::Mmio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::FlatGuestMemory;
    use crate::devices::block::{Block, BlockConfig};
    use crate::external::{CrossDomainChannel, VgicController};
    use std::sync::Arc;

    struct FakeGic;
    impl VgicController for FakeGic {
        fn controller_init(&self, _vcpu: u32) -> bool {
            true
        }
        fn register(&self, _vcpu: u32, _irq: u32, _ack_fn: Box<dyn Fn(u32) + Send + Sync>, _cookie: u64) -> bool {
            true
        }
        fn inject(&self, _vcpu: u32, _irq: u32) -> bool {
            true
        }
    }

    struct NullChannel;
    impl CrossDomainChannel for NullChannel {
        fn notify(&self, _channel: u32) {}
        fn ppcall(&self, _channel: u32, _msg: &[u64]) -> Vec<u64> {
            Vec::new()
        }
        fn irq_ack(&self, _channel: u32) {}
    }

    fn make_block_device() -> VirtioMmioDevice {
        let block = Block::new(BlockConfig { capacity: 2048 }, 8, Box::new(NullChannel));
        let injector = InterruptInjector::new(0, 42, Arc::new(FakeGic));
        VirtioMmioDevice::new(Box::new(block), injector)
    }

    #[test]
    fn magic_value_and_device_id_read_correctly() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x1000);
        let mut dev = make_block_device();
        assert_eq!(
            dev.handle_mmio(&mem, REG_MAGIC_VALUE, false, 4, 0).unwrap(),
            MmioOutcome::Handled(Some(MAGIC_VALUE))
        );
        assert_eq!(
            dev.handle_mmio(&mem, REG_DEVICE_ID, false, 4, 0).unwrap(),
            MmioOutcome::Handled(Some(2))
        );
    }

    #[test]
    fn status_negotiation_sequence_matches_literal_scenario() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x1000);
        let mut dev = make_block_device();

        dev.handle_mmio(&mem, REG_STATUS, true, 4, 1).unwrap();
        dev.handle_mmio(&mem, REG_STATUS, true, 4, 2).unwrap();

        dev.handle_mmio(&mem, REG_DRIVER_FEATURES_SEL, true, 4, 1).unwrap();
        dev.handle_mmio(&mem, REG_DRIVER_FEATURES, true, 4, 0x1).unwrap();

        dev.handle_mmio(&mem, REG_STATUS, true, 4, 8).unwrap();
        let status = dev.handle_mmio(&mem, REG_STATUS, false, 4, 0).unwrap();
        assert_eq!(status, MmioOutcome::Handled(Some(0xB)));
    }

    #[test]
    fn features_ok_is_dropped_when_driver_omits_version_1() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x1000);
        let mut dev = make_block_device();
        dev.handle_mmio(&mem, REG_STATUS, true, 4, 1).unwrap();
        dev.handle_mmio(&mem, REG_STATUS, true, 4, 2).unwrap();
        dev.handle_mmio(&mem, REG_STATUS, true, 4, 8).unwrap();
        let status = dev.handle_mmio(&mem, REG_STATUS, false, 4, 0).unwrap();
        assert_eq!(status, MmioOutcome::Handled(Some(0x3)));
    }

    #[test]
    fn status_write_of_zero_resets_device() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x1000);
        let mut dev = make_block_device();
        dev.handle_mmio(&mem, REG_STATUS, true, 4, 1 | 2).unwrap();
        dev.handle_mmio(&mem, REG_STATUS, true, 4, 0).unwrap();
        assert_eq!(dev.status(), 0);
    }

    #[test]
    fn queue_sel_and_num_read_after_write() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x1000);
        let mut dev = make_block_device();

        dev.handle_mmio(&mem, REG_QUEUE_SEL, true, 4, 0).unwrap();
        assert_eq!(
            dev.handle_mmio(&mem, REG_QUEUE_SEL, false, 4, 0).unwrap(),
            MmioOutcome::Handled(Some(0))
        );

        dev.handle_mmio(&mem, REG_QUEUE_NUM, true, 4, 4).unwrap();
        assert_eq!(
            dev.handle_mmio(&mem, REG_QUEUE_NUM, false, 4, 0).unwrap(),
            MmioOutcome::Handled(Some(4))
        );

        assert_eq!(
            dev.handle_mmio(&mem, REG_QUEUE_READY, false, 4, 0).unwrap(),
            MmioOutcome::Handled(Some(0))
        );
        dev.handle_mmio(&mem, REG_QUEUE_READY, true, 4, 1).unwrap();
        assert_eq!(
            dev.handle_mmio(&mem, REG_QUEUE_READY, false, 4, 0).unwrap(),
            MmioOutcome::Handled(Some(1))
        );
    }

    #[test]
    fn queue_base_writes_rejected_once_ready() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x1000);
        let mut dev = make_block_device();
        dev.handle_mmio(&mem, REG_QUEUE_SEL, true, 4, 0).unwrap();
        dev.handle_mmio(&mem, REG_QUEUE_READY, true, 4, 1).unwrap();
        let result = dev.handle_mmio(&mem, REG_QUEUE_DESC_LOW, true, 4, 0x5000);
        assert!(matches!(result, Err(MmioError::QueueBaseLocked(_))));
    }

    #[test]
    fn registry_dispatches_by_aperture() {
        let mem = FlatGuestMemory::new(GuestAddress(0), 0x1000);
        let mut registry = DeviceRegistry::new();
        registry.register(0x130000, 0x200, make_block_device());
        let outcome = registry.dispatch(&mem, 0x130000 + REG_MAGIC_VALUE, false, 4, 0).unwrap();
        assert_eq!(outcome, MmioOutcome::Handled(Some(MAGIC_VALUE)));
    }
}
