//! PCI configuration space constants shared by the ECAM host, MSI/MSI-X and
//! the NVMe probe path.
//!
//! Single source of truth for PCI constants used across the driver subsystem.
//! Add new constants here only when a consumer exists.

// =============================================================================
// ECAM geometry
// =============================================================================

pub const ECAM_BUS_SHIFT: u32 = 20;
pub const ECAM_DEVICE_SHIFT: u32 = 15;
pub const ECAM_FUNCTION_SHIFT: u32 = 12;

/// Configuration space size per function (4 KiB).
pub const PCI_CONFIG_SPACE_SIZE: u16 = 0x1000;

/// First extended (PCIe-only) configuration register.
pub const PCI_EXT_CONFIG_START: u16 = 0x100;

pub const PCI_MAX_DEVICE: u8 = 32;
pub const PCI_MAX_FUNCTION: u8 = 8;

// =============================================================================
// Configuration Space Register Offsets (common header)
// =============================================================================

/// Vendor ID register offset (16-bit).
pub const PCI_VENDOR_ID_OFFSET: u16 = 0x00;

/// Device ID register offset (16-bit).
pub const PCI_DEVICE_ID_OFFSET: u16 = 0x02;

/// Command register offset (16-bit).
pub const PCI_COMMAND_OFFSET: u16 = 0x04;

/// Status register offset (16-bit).
pub const PCI_STATUS_OFFSET: u16 = 0x06;

/// Class code dword: revision, prog-if, subclass, class.
pub const PCI_CLASS_REVISION_OFFSET: u16 = 0x08;

/// Cache Line Size register offset (8-bit).
pub const PCI_CACHE_LINE_SIZE_OFFSET: u16 = 0x0C;

/// Latency Timer register offset (8-bit).
pub const PCI_LATENCY_TIMER_OFFSET: u16 = 0x0D;

/// Header Type register offset (8-bit).
pub const PCI_HEADER_TYPE_OFFSET: u16 = 0x0E;

/// Base Address Register 0 offset.
pub const PCI_BAR0_OFFSET: u16 = 0x10;

/// Expansion ROM BAR, header type 0.
pub const PCI_ROM_ADDRESS_OFFSET: u16 = 0x30;

/// Capabilities pointer offset (8-bit).
pub const PCI_CAP_PTR_OFFSET: u16 = 0x34;

// =============================================================================
// Type 1 (bridge) header
// =============================================================================

/// Primary, secondary, subordinate bus and secondary latency timer.
pub const PCI_PRIMARY_BUS_OFFSET: u16 = 0x18;
pub const PCI_SECONDARY_BUS_OFFSET: u16 = 0x19;
pub const PCI_SUBORDINATE_BUS_OFFSET: u16 = 0x1A;

pub const PCI_IO_BASE_OFFSET: u16 = 0x1C;
pub const PCI_IO_LIMIT_OFFSET: u16 = 0x1D;

/// Memory base (low 16 bits) and limit (high 16 bits).
pub const PCI_MEMORY_BASE_OFFSET: u16 = 0x20;

/// Prefetchable memory base (low 16 bits) and limit (high 16 bits).
pub const PCI_PREF_MEMORY_BASE_OFFSET: u16 = 0x24;
pub const PCI_PREF_BASE_UPPER32_OFFSET: u16 = 0x28;
pub const PCI_PREF_LIMIT_UPPER32_OFFSET: u16 = 0x2C;

pub const PCI_IO_BASE_UPPER16_OFFSET: u16 = 0x30;
pub const PCI_IO_LIMIT_UPPER16_OFFSET: u16 = 0x32;

/// Expansion ROM BAR, header type 1.
pub const PCI_ROM_ADDRESS1_OFFSET: u16 = 0x38;

/// Prefetchable window decodes 64-bit addresses (low nibble of 0x24).
pub const PCI_PREF_RANGE_TYPE_MASK: u32 = 0xF;
pub const PCI_PREF_RANGE_TYPE_64: u32 = 0x1;

// =============================================================================
// Header types
// =============================================================================

pub const PCI_HEADER_TYPE_MASK: u8 = 0x7F;
pub const PCI_HEADER_TYPE_MULTIFUNCTION: u8 = 0x80;
pub const PCI_HEADER_TYPE_NORMAL: u8 = 0;
pub const PCI_HEADER_TYPE_BRIDGE: u8 = 1;

// =============================================================================
// Status / Command Register Bits
// =============================================================================

/// Status: Capabilities list present (bit 4).
pub const PCI_STATUS_CAP_LIST: u16 = 0x10;

/// Enable I/O space decode (bit 0).
pub const PCI_COMMAND_IO_SPACE: u16 = 0x0001;

/// Enable memory space decode (bit 1).
pub const PCI_COMMAND_MEMORY_SPACE: u16 = 0x0002;

/// Enable bus master capability (bit 2).
pub const PCI_COMMAND_BUS_MASTER: u16 = 0x0004;

// =============================================================================
// BAR encoding
// =============================================================================

pub const PCI_BAR_SPACE_IO: u32 = 0x1;
pub const PCI_BAR_IO_MASK: u32 = !0x3;
pub const PCI_BAR_MEM_MASK: u32 = !0xF;
pub const PCI_BAR_MEM_TYPE_SHIFT: u32 = 1;
pub const PCI_BAR_MEM_TYPE_MASK: u32 = 0x3;
pub const PCI_BAR_MEM_TYPE_64: u32 = 0x2;
pub const PCI_BAR_MEM_PREFETCH: u32 = 0x8;

pub const PCI_ROM_ADDRESS_ENABLE: u32 = 0x1;

/// BAR registers in a type 0 header.
pub const PCI_MAX_BARS: u8 = 6;

/// BAR registers in a type 1 header.
pub const PCI_MAX_BRIDGE_BARS: u8 = 2;

/// Value normalized into Cache Line Size and Latency Timer during enumeration.
pub const PCI_DEFAULT_CACHE_LINE_SIZE: u8 = 8;
pub const PCI_DEFAULT_LATENCY_TIMER: u8 = 8;

// =============================================================================
// Capability IDs
// =============================================================================

pub const PCI_CAP_ID_MSI: u8 = 0x05;
pub const PCI_CAP_ID_EXP: u8 = 0x10;
pub const PCI_CAP_ID_MSIX: u8 = 0x11;

/// PCI Express Capabilities register (offset +2): device/port type bits 7:4.
pub const PCI_EXP_FLAGS_OFFSET: u16 = 0x02;
pub const PCI_EXP_FLAGS_TYPE_SHIFT: u16 = 4;
pub const PCI_EXP_FLAGS_TYPE_MASK: u16 = 0xF;
pub const PCI_EXP_TYPE_DOWNSTREAM: u16 = 0x5;

// =============================================================================
// Known IDs and classes
// =============================================================================

/// Phytium vendor ID.
pub const PCI_VENDOR_ID_PHYTIUM: u16 = 0x1D17;

/// Read value of an empty slot.
pub const PCI_ID_INVALID: u16 = 0xFFFF;

pub const PCI_CLASS_STORAGE: u8 = 0x01;
pub const PCI_SUBCLASS_STORAGE_NVM: u8 = 0x08;
pub const PCI_PROG_IF_NVME: u8 = 0x02;

// =============================================================================
// Enumeration limits
// =============================================================================

/// Functions recorded by one enumeration pass.
pub const MAX_SCANNED_FUNCTIONS: usize = 256;
