//! Identify Controller / Identify Namespace data decoding.

use fsdk_mm::DmaRegion;

pub const NVME_IDENTIFY_DATA_SIZE: usize = 4096;

/// Maximum LBA formats a namespace can describe.
pub const NVME_MAX_LBAF: usize = 16;

fn text(bytes: &[u8]) -> &str {
    let s = core::str::from_utf8(bytes).unwrap_or("?");
    s.trim_end_matches([' ', '\0'])
}

/// Fields of the Identify Controller page the driver uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerData {
    pub vid: u16,
    pub ssvid: u16,
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    /// Maximum data transfer size as a power of two of the minimum page size;
    /// 0 means unlimited.
    pub mdts: u8,
    pub oacs: u16,
    pub sqes: u8,
    pub cqes: u8,
    pub nn: u32,
    pub oncs: u16,
    pub vwc: u8,
}

impl Default for ControllerData {
    fn default() -> Self {
        Self {
            vid: 0,
            ssvid: 0,
            sn: [0; 20],
            mn: [0; 40],
            fr: [0; 8],
            mdts: 0,
            oacs: 0,
            sqes: 0,
            cqes: 0,
            nn: 0,
            oncs: 0,
            vwc: 0,
        }
    }
}

/// ONCS: Dataset Management (deallocate) supported.
pub const NVME_ONCS_DSM: u16 = 1 << 2;

/// VWC: volatile write cache present.
pub const NVME_VWC_PRESENT: u8 = 1 << 0;

impl ControllerData {
    pub fn decode(page: &DmaRegion) -> Self {
        let mut data = Self {
            vid: u16::from_le(page.read(0)),
            ssvid: u16::from_le(page.read(2)),
            mdts: page.read(77),
            oacs: u16::from_le(page.read(256)),
            sqes: page.read(512),
            cqes: page.read(513),
            nn: u32::from_le(page.read(516)),
            oncs: u16::from_le(page.read(520)),
            vwc: page.read(525),
            ..Self::default()
        };
        page.copy_to_slice(4, &mut data.sn);
        page.copy_to_slice(24, &mut data.mn);
        page.copy_to_slice(64, &mut data.fr);
        data
    }

    pub fn serial(&self) -> &str {
        text(&self.sn)
    }

    pub fn model(&self) -> &str {
        text(&self.mn)
    }

    pub fn firmware(&self) -> &str {
        text(&self.fr)
    }
}

/// One LBA format descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LbaFormat {
    /// Metadata bytes per block.
    pub ms: u16,
    /// log2 of the data block size.
    pub lbads: u8,
    /// Relative performance.
    pub rp: u8,
}

impl LbaFormat {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            ms: raw as u16,
            lbads: (raw >> 16) as u8,
            rp: ((raw >> 24) & 0x3) as u8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NamespaceData {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA formats, 0-based.
    pub nlbaf: u8,
    pub flbas: u8,
    pub noiob: u16,
    pub lbaf: [LbaFormat; NVME_MAX_LBAF],
}

impl NamespaceData {
    pub fn decode(page: &DmaRegion) -> Self {
        let mut data = Self {
            nsze: u64::from_le(page.read(0)),
            ncap: u64::from_le(page.read(8)),
            nuse: u64::from_le(page.read(16)),
            nsfeat: page.read(24),
            nlbaf: page.read(25),
            flbas: page.read(26),
            noiob: u16::from_le(page.read(46)),
            ..Self::default()
        };
        for (i, format) in data.lbaf.iter_mut().enumerate() {
            *format = LbaFormat::from_raw(u32::from_le(page.read(128 + i * 4)));
        }
        data
    }

    /// Index of the LBA format in use.
    pub fn format_index(&self) -> u8 {
        self.flbas & 0xF
    }
}
