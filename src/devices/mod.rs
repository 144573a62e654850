// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Device personalities
//!
//! One per class. Each implements the six-operation capability set
//! named in spec §2 and §4.3, and owns its per-queue handling; the
//! MMIO dispatcher routes to personalities by instance, not by class
//! (spec §4.2).

pub mod block;
pub mod console;
pub mod gpu;
pub mod net;
pub mod vsock;

use anyhow::Result;

use crate::address_space::GuestMemory;
use crate::queue::Queue;

/// Identifier of each device class, refer to Virtio Spec §5.
pub const VIRTIO_TYPE_NET: u32 = 1;
pub const VIRTIO_TYPE_BLOCK: u32 = 2;
pub const VIRTIO_TYPE_CONSOLE: u32 = 3;
pub const VIRTIO_TYPE_GPU: u32 = 16;
pub const VIRTIO_TYPE_VSOCK: u32 = 19;

/// Fixed vendor tag presented at `VendorID@0x00C`; arbitrary but stable.
pub const VENDOR_ID: u32 = 0x4D51_4656;

pub const VIRTIO_F_VERSION_1: u32 = 32;

/// Check if the bit of a 64-bit feature word is set.
pub fn virtio_has_feature(features: u64, bit: u32) -> bool {
    features & (1u64 << bit) != 0
}

/// The six-operation capability set every device class implements.
/// Queues are owned by the MMIO device wrapper, not the personality
/// (spec §3: "a reference to a device-personality vtable"); the
/// personality is handed the queue array on each call.
pub trait VirtioDevice: Send {
    fn device_type(&self) -> u32;

    /// Number of virtqueues this class uses.
    fn queue_num(&self) -> usize;

    /// Maximum size (`QueueNumMax`) advertised for every queue.
    fn queue_size_max(&self) -> u16 {
        256
    }

    /// Clear all device-owned state. Queue state itself is reset by the
    /// MMIO dispatcher; this resets personality-local state (cached MAC,
    /// connection tables, pending requests, ...).
    fn reset(&mut self);

    fn get_device_features(&self, features_sel: u32) -> u32;

    /// Returns whether the requested subset was accepted. On
    /// acceptance the device latches `features_happy`.
    fn set_driver_features(&mut self, features_sel: u32, value: u32) -> bool;

    fn features_happy(&self) -> bool;

    fn read_config(&mut self, offset: u64, data: &mut [u8]) -> Result<()>;
    fn write_config(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Handle a guest `QueueNotify` for queue `queue_index`. Returns
    /// whether a used-buffer IRQ should be raised.
    fn queue_notify(
        &mut self,
        queue_index: usize,
        mem: &dyn GuestMemory,
        queues: &mut [Queue],
    ) -> Result<bool>;
}
