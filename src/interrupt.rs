// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Interrupt injector
//!
//! On buffer completion the core sets `InterruptStatus` bit 0 and asks
//! the external vGIC to raise the device's virtual IRQ. On a guest
//! `InterruptACK` write the acked bits are cleared. No action is taken
//! on the vGIC's own ack hook for purely virtual devices.

use anyhow::Result;

use crate::external::VgicController;
use crate::queue::Queue;

pub const VIRTIO_MMIO_INT_VRING: u8 = 0x01;
pub const VIRTIO_MMIO_INT_CONFIG: u8 = 0x02;

#[derive(Debug)]
pub enum VirtioInterruptType {
    Config,
    Vring,
}

/// A boxed callback invoked whenever the device wants to raise its
/// virtual IRQ, mirroring the teacher's `VirtioInterrupt` callback type.
pub type VirtioInterrupt =
    Box<dyn Fn(&VirtioInterruptType, Option<&Queue>) -> Result<()> + Send + Sync>;

/// Bridges a device instance's `InterruptStatus` register to the
/// external vGIC collaborator named in spec §6.
pub struct InterruptInjector {
    vcpu_id: u32,
    virq: u32,
    gic: std::sync::Arc<dyn VgicController>,
}

impl InterruptInjector {
    pub fn new(vcpu_id: u32, virq: u32, gic: std::sync::Arc<dyn VgicController>) -> Self {
        InterruptInjector { vcpu_id, virq, gic }
    }

    /// Set the used-buffer status bit and request injection. Returns
    /// whether the vGIC accepted the injection (a `false` here is
    /// logged by the caller, never retried automatically).
    pub fn raise_vring(&self, interrupt_status: &mut u8) -> bool {
        *interrupt_status |= VIRTIO_MMIO_INT_VRING;
        self.gic.inject(self.vcpu_id, self.virq)
    }

    pub fn raise_config_change(&self, interrupt_status: &mut u8) -> bool {
        *interrupt_status |= VIRTIO_MMIO_INT_CONFIG;
        self.gic.inject(self.vcpu_id, self.virq)
    }

    /// Clear the bits the guest acknowledged via `InterruptACK`.
    pub fn ack(&self, interrupt_status: &mut u8, ack_mask: u8) {
        *interrupt_status &= !ack_mask;
    }

    pub fn virq(&self) -> u32 {
        self.virq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeGic(Arc<AtomicBool>);
    impl VgicController for FakeGic {
        fn controller_init(&self, _vcpu: u32) -> bool {
            true
        }
        fn register(
            &self,
            _vcpu: u32,
            _irq: u32,
            _ack_fn: Box<dyn Fn(u32) + Send + Sync>,
            _cookie: u64,
        ) -> bool {
            true
        }
        fn inject(&self, _vcpu: u32, _irq: u32) -> bool {
            self.0.store(true, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn raise_vring_sets_bit_and_injects() {
        let injected = Arc::new(AtomicBool::new(false));
        let injector = InterruptInjector::new(0, 42, Arc::new(FakeGic(injected.clone())));
        let mut status = 0u8;
        assert!(injector.raise_vring(&mut status));
        assert_eq!(status, VIRTIO_MMIO_INT_VRING);
        assert!(injected.load(Ordering::SeqCst));
    }

    #[test]
    fn ack_clears_only_acked_bits() {
        let injector = InterruptInjector::new(0, 42, Arc::new(FakeGic(Arc::new(AtomicBool::new(false)))));
        let mut status = VIRTIO_MMIO_INT_VRING | VIRTIO_MMIO_INT_CONFIG;
        injector.ack(&mut status, VIRTIO_MMIO_INT_VRING);
        assert_eq!(status, VIRTIO_MMIO_INT_CONFIG);
    }
}
