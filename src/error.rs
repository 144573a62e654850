// Copyright (c) 2026 The vmm-virtio-core Authors.
//
// Error taxonomy for the virtio device core, per the classes named in
// the spec: guest protocol errors, backend transport errors, config
// errors, and fatal VMM errors. Leaf enums live next to the module that
// raises them; this file aggregates them behind one `VirtioError`.

use thiserror::Error;

use crate::queue::QueueError;
use crate::virtio_mmio::MmioError;

#[derive(Error, Debug)]
pub enum VirtioError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("mmio dispatch error: {0}")]
    Mmio(#[from] MmioError),

    #[error("guest memory access out of bounds: addr=0x{addr:x} len={len}")]
    GuestMemoryOutOfBounds { addr: u64, len: u64 },

    #[error("no device registered for aperture containing 0x{0:x}")]
    NoDeviceAtAddress(u64),

    #[error("unsupported device class: {0}")]
    UnsupportedClass(u32),
}
