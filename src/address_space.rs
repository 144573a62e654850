// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Guest memory
//!
//! The spec requires that "no raw pointer into guest RAM escapes the
//! walker" and that every field the core reads more than once is copied
//! into local storage (TOCTOU defence, since the guest may mutate any
//! descriptor at any instant). This module is the single choke point
//! through which guest-physical addresses are translated and bounds
//! checked.

use std::sync::Mutex;

use crate::error::VirtioError;

pub type Result<T> = std::result::Result<T, VirtioError>;

/// A guest-physical address. Distinct from a host pointer; every use
/// goes through [`GuestMemory::checked_offset`] before touching bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    pub fn checked_add(self, offset: u64) -> Option<GuestAddress> {
        self.0.checked_add(offset).map(GuestAddress)
    }
}

impl std::fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Bounds-checked access to the guest RAM window. Implementations back
/// onto whatever the real VMM's address-space crate maps in; the core
/// only ever sees this trait.
pub trait GuestMemory: Send + Sync {
    /// Size of the guest RAM window in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate that `[addr, addr+len)` lies entirely inside the guest
    /// RAM window, without overflowing. The sole bounds check every
    /// translation in this crate goes through.
    fn checked_offset(&self, addr: GuestAddress, len: u64) -> Result<u64> {
        let end = addr
            .0
            .checked_add(len)
            .ok_or(VirtioError::GuestMemoryOutOfBounds { addr: addr.0, len })?;
        if end > self.len() {
            return Err(VirtioError::GuestMemoryOutOfBounds { addr: addr.0, len });
        }
        Ok(addr.0)
    }

    fn read(&self, addr: GuestAddress, buf: &mut [u8]) -> Result<()>;
    fn write(&self, addr: GuestAddress, buf: &[u8]) -> Result<()>;

    fn read_u16(&self, addr: GuestAddress) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32(&self, addr: GuestAddress) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&self, addr: GuestAddress) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u16(&self, addr: GuestAddress, val: u16) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }

    fn write_u32(&self, addr: GuestAddress, val: u32) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }
}

/// A single contiguous guest RAM window backed by host memory. Used by
/// every unit test in this crate and as the reference implementation
/// when no richer address-space crate is wired in.
pub struct FlatGuestMemory {
    base: GuestAddress,
    backing: Mutex<Vec<u8>>,
}

impl FlatGuestMemory {
    pub fn new(base: GuestAddress, size: usize) -> Self {
        FlatGuestMemory {
            base,
            backing: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn base(&self) -> GuestAddress {
        self.base
    }

    fn local_offset(&self, addr: GuestAddress, len: u64) -> Result<usize> {
        if addr.0 < self.base.0 {
            return Err(VirtioError::GuestMemoryOutOfBounds { addr: addr.0, len });
        }
        let rel = addr.0 - self.base.0;
        let end = rel
            .checked_add(len)
            .ok_or(VirtioError::GuestMemoryOutOfBounds { addr: addr.0, len })?;
        if end > self.backing.lock().unwrap().len() as u64 {
            return Err(VirtioError::GuestMemoryOutOfBounds { addr: addr.0, len });
        }
        Ok(rel as usize)
    }
}

impl GuestMemory for FlatGuestMemory {
    fn len(&self) -> u64 {
        self.backing.lock().unwrap().len() as u64
    }

    fn read(&self, addr: GuestAddress, buf: &mut [u8]) -> Result<()> {
        let off = self.local_offset(addr, buf.len() as u64)?;
        let backing = self.backing.lock().unwrap();
        buf.copy_from_slice(&backing[off..off + buf.len()]);
        Ok(())
    }

    fn write(&self, addr: GuestAddress, buf: &[u8]) -> Result<()> {
        let off = self.local_offset(addr, buf.len() as u64)?;
        let mut backing = self.backing.lock().unwrap();
        backing[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}
