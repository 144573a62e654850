// Copyright (c) 2026 The vmm-virtio-core Authors.

//! virtio-mmio device emulation core for a capability-based microkernel
//! hypervisor: virtqueue walking, MMIO register dispatch, device
//! personalities (block, net, console, vsock, gpu), the shared-ring
//! transport adapter, and virtual interrupt injection.

#[macro_use]
extern crate log;

pub mod address_space;
pub mod config;
pub mod devices;
mod error;
pub mod external;
pub mod interrupt;
pub mod queue;
pub mod transport;
pub mod virtio_mmio;

pub use anyhow::Result;
pub use error::VirtioError;
