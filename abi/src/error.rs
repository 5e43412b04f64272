//! Driver error taxonomy shared by the PCIe host and the NVMe driver.

use core::fmt;

/// Unified driver error.
///
/// Config-space accessor errors abort only the probe of the function that
/// produced them.  Controller lifecycle errors are fatal to that controller
/// instance.  Request-level failures reach the request's own completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Width-2 or width-4 access at an offset not naturally aligned.
    BadAlignment,
    /// Bus number, BAR index, vector index or similar beyond its bound.
    OutOfRange,
    /// Access crosses the end of a 4 KiB function configuration page.
    AccessViolation,
    /// Access width other than 1, 2 or 4 bytes.
    BadWidth,
    /// Region allocator has no room for the request.
    NoRoom,
    /// Readiness or command-completion wait exceeded its bound.
    Timeout,
    /// Hardware reported a command error or read back as all-ones.
    IoError,
    /// Request pool, PRP list pool or DMA allocation exhausted.
    NoMemory,
    /// Caller passed an argument the operation cannot accept.
    InvalidParam,
    /// Capability, device or namespace not present.
    NotFound,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAlignment => write!(f, "misaligned register access"),
            Self::OutOfRange => write!(f, "index or bus number out of range"),
            Self::AccessViolation => write!(f, "access crosses the config page"),
            Self::BadWidth => write!(f, "unsupported access width"),
            Self::NoRoom => write!(f, "no room left in address region"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::IoError => write!(f, "device I/O error"),
            Self::NoMemory => write!(f, "out of request or DMA memory"),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

/// Convenience result type for driver operations.
pub type DriverResult<T = ()> = Result<T, DriverError>;
