//! BAR sizing, placement and read-back.
//!
//! [`alloc_bar_space`] runs once per function during enumeration: it sizes
//! every BAR with the all-ones probe, places it in the matching region and
//! turns on decode.  [`get_bar_info`] runs afterwards and must leave the
//! programmed BAR untouched, so it restores the original register (and the
//! command register) on every path out.

use fsdk_abi::{Bdf, DriverError, DriverResult, PhysAddr};
use fsdk_lib::{klog_debug, klog_warn};

use super::ConfigSpace;
use super::region::{RegionKind, Regions};
use crate::pci_defs::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarType {
    Io,
    Mem,
    Prefetch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarInfo {
    pub mem_type: BarType,
    pub is_64bit: bool,
    pub phys_addr: PhysAddr,
    pub size: u64,
}

#[inline]
fn bar_offset(index: u8) -> u16 {
    PCI_BAR0_OFFSET + index as u16 * 4
}

#[inline]
fn is_io_bar(raw: u32) -> bool {
    raw & PCI_BAR_SPACE_IO != 0
}

#[inline]
fn is_64bit_bar(raw: u32) -> bool {
    (raw >> PCI_BAR_MEM_TYPE_SHIFT) & PCI_BAR_MEM_TYPE_MASK == PCI_BAR_MEM_TYPE_64
}

/// Number of BAR registers a header of `header_type` carries.
pub fn bar_count(header_type: u8) -> u8 {
    match header_type {
        PCI_HEADER_TYPE_NORMAL => PCI_MAX_BARS,
        _ => PCI_MAX_BRIDGE_BARS,
    }
}

fn rom_offset(header_type: u8) -> Option<u16> {
    match header_type {
        PCI_HEADER_TYPE_NORMAL => Some(PCI_ROM_ADDRESS_OFFSET),
        PCI_HEADER_TYPE_BRIDGE => Some(PCI_ROM_ADDRESS1_OFFSET),
        _ => None,
    }
}

/// Size, place and enable every BAR of `bdf`.
///
/// Region exhaustion leaves that BAR at 0 without decode enabled; config
/// access errors abort the function.
pub fn alloc_bar_space<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    header_type: u8,
    regions: &mut Regions,
) -> DriverResult {
    let mut command = cfg.read16(bdf, PCI_COMMAND_OFFSET)?;
    command &= !(PCI_COMMAND_IO_SPACE | PCI_COMMAND_MEMORY_SPACE);

    let max_bar = bar_count(header_type);
    let mut index = 0u8;
    while index < max_bar {
        let offset = bar_offset(index);
        cfg.write32(bdf, offset, 0xFFFF_FFFF)?;
        let raw = cfg.read32(bdf, offset)?;
        if raw == 0 {
            index += 1;
            continue;
        }

        if is_io_bar(raw) {
            let mut mask = raw & PCI_BAR_IO_MASK;
            // 16-bit decoders hardwire the upper half to zero.
            if mask & 0xFFFF_0000 == 0 {
                mask |= 0xFFFF_0000;
            }
            let size = (!mask).wrapping_add(1) as u64;
            match regions.allocate(RegionKind::Io, size) {
                Ok(base) => {
                    cfg.write32(bdf, offset, base as u32)?;
                    command |= PCI_COMMAND_IO_SPACE;
                    klog_debug!("PCIe: {} BAR{} io {:#x} size {:#x}", bdf, index, base, size);
                }
                Err(err) => {
                    cfg.write32(bdf, offset, 0)?;
                    klog_warn!("PCIe: {} BAR{} io size {:#x}: {}", bdf, index, size, err);
                }
            }
            index += 1;
            continue;
        }

        let is_64 = is_64bit_bar(raw) && index + 1 < max_bar;
        let prefetch = raw & PCI_BAR_MEM_PREFETCH != 0;
        let mut mask = (raw & PCI_BAR_MEM_MASK) as u64;
        if is_64 {
            cfg.write32(bdf, offset + 4, 0xFFFF_FFFF)?;
            mask |= (cfg.read32(bdf, offset + 4)? as u64) << 32;
        } else {
            mask |= 0xFFFF_FFFF_0000_0000;
        }
        let size = (!mask).wrapping_add(1);

        let kind = if regions.prefetch.present && (prefetch || is_64) {
            RegionKind::PrefetchMem
        } else {
            RegionKind::Mem
        };
        match regions.allocate(kind, size) {
            Ok(base) => {
                cfg.write32(bdf, offset, base as u32)?;
                if is_64 {
                    cfg.write32(bdf, offset + 4, (base >> 32) as u32)?;
                }
                command |= PCI_COMMAND_MEMORY_SPACE;
                klog_debug!(
                    "PCIe: {} BAR{} {}{} {:#x} size {:#x}",
                    bdf,
                    index,
                    if kind == RegionKind::PrefetchMem { "pref" } else { "mem" },
                    if is_64 { "64" } else { "32" },
                    base,
                    size
                );
            }
            Err(err) => {
                cfg.write32(bdf, offset, 0)?;
                if is_64 {
                    cfg.write32(bdf, offset + 4, 0)?;
                }
                klog_warn!("PCIe: {} BAR{} mem size {:#x}: {}", bdf, index, size, err);
            }
        }
        // The upper half of a 64-bit BAR is never a BAR of its own.
        index += if is_64 { 2 } else { 1 };
    }

    if let Some(rom) = rom_offset(header_type) {
        cfg.write32(bdf, rom, !PCI_ROM_ADDRESS_ENABLE)?;
        let raw = cfg.read32(bdf, rom)?;
        if raw != 0 {
            let size = (!(raw & !PCI_ROM_ADDRESS_ENABLE)).wrapping_add(1) as u64;
            match regions.allocate(RegionKind::Mem, size) {
                Ok(base) => {
                    cfg.write32(bdf, rom, base as u32)?;
                    command |= PCI_COMMAND_MEMORY_SPACE;
                    klog_debug!("PCIe: {} ROM {:#x} size {:#x}", bdf, base, size);
                }
                Err(err) => {
                    cfg.write32(bdf, rom, 0)?;
                    klog_warn!("PCIe: {} ROM size {:#x}: {}", bdf, size, err);
                }
            }
        }
    }

    cfg.write16(bdf, PCI_COMMAND_OFFSET, command)?;
    cfg.write8(bdf, PCI_CACHE_LINE_SIZE_OFFSET, PCI_DEFAULT_CACHE_LINE_SIZE)?;
    cfg.write8(bdf, PCI_LATENCY_TIMER_OFFSET, PCI_DEFAULT_LATENCY_TIMER)?;
    Ok(())
}

/// Decode the BAR at `index` without disturbing it.
///
/// Decode is switched off around the probe; the BAR value(s) and the command
/// register are written back before returning, including on error.
pub fn get_bar_info<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    index: u8,
) -> DriverResult<BarInfo> {
    if index >= PCI_MAX_BARS {
        return Err(DriverError::OutOfRange);
    }
    let offset = bar_offset(index);
    let original = cfg.read32(bdf, offset)?;
    let is_io = is_io_bar(original);
    let is_64 = !is_io && is_64bit_bar(original);
    let original_hi = if is_64 {
        if index + 1 >= PCI_MAX_BARS {
            return Err(DriverError::OutOfRange);
        }
        Some(cfg.read32(bdf, offset + 4)?)
    } else {
        None
    };

    let command = cfg.read16(bdf, PCI_COMMAND_OFFSET)?;
    let probed = cfg
        .write16(
            bdf,
            PCI_COMMAND_OFFSET,
            command & !(PCI_COMMAND_IO_SPACE | PCI_COMMAND_MEMORY_SPACE),
        )
        .and_then(|()| probe_mask(cfg, bdf, offset, is_64));

    let restored = restore_bar(cfg, bdf, offset, original, original_hi);
    let command_restored = cfg.write16(bdf, PCI_COMMAND_OFFSET, command);
    let mask = probed?;
    restored.and(command_restored)?;

    let (mem_type, flag_bits) = if is_io {
        (BarType::Io, 0x3u64)
    } else if original & PCI_BAR_MEM_PREFETCH != 0 {
        (BarType::Prefetch, 0xF)
    } else {
        (BarType::Mem, 0xF)
    };

    let (lo, hi) = mask;
    let lo = lo as u64 & !flag_bits;
    if lo == 0 && hi.unwrap_or(0) == 0 {
        return Err(DriverError::NotFound);
    }
    let mask = ((hi.unwrap_or(0xFFFF_FFFF) as u64) << 32) | lo;
    let size = (!mask).wrapping_add(1);
    let size = size & !size.wrapping_sub(1);

    let base = ((original_hi.unwrap_or(0) as u64) << 32) | original as u64;
    Ok(BarInfo {
        mem_type,
        is_64bit: is_64,
        phys_addr: PhysAddr::new(base & !flag_bits),
        size,
    })
}

/// All-ones probe of the low register and, for 64-bit BARs, the high one.
fn probe_mask<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    offset: u16,
    is_64: bool,
) -> DriverResult<(u32, Option<u32>)> {
    cfg.write32(bdf, offset, 0xFFFF_FFFF)?;
    let lo = cfg.read32(bdf, offset)?;
    let hi = if is_64 {
        cfg.write32(bdf, offset + 4, 0xFFFF_FFFF)?;
        Some(cfg.read32(bdf, offset + 4)?)
    } else {
        None
    };
    Ok((lo, hi))
}

fn restore_bar<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bdf: Bdf,
    offset: u16,
    original: u32,
    original_hi: Option<u32>,
) -> DriverResult {
    let lo = cfg.write32(bdf, offset, original);
    let hi = match original_hi {
        Some(hi) => cfg.write32(bdf, offset + 4, hi),
        None => Ok(()),
    };
    lo.and(hi)
}
