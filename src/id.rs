//! PD identity and capability records (`SPEC_FULL.md` §3).

/// The vendor/model/firmware identity a PD reports in reply to `CMD_ID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdId {
    pub vendor_code: [u8; 3],
    pub model: u8,
    pub version: u8,
    pub serial: [u8; 4],
    pub firmware_version: [u8; 3],
}

impl PdId {
    /// Length of the wire encoding used by `REPLY_PDID` (not counting the
    /// reply code byte itself).
    pub const WIRE_LEN: usize = 3 + 1 + 1 + 4 + 3;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..3].copy_from_slice(&self.vendor_code);
        out[3] = self.model;
        out[4] = self.version;
        out[5..9].copy_from_slice(&self.serial);
        out[9..12].copy_from_slice(&self.firmware_version);
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            vendor_code: [buf[0], buf[1], buf[2]],
            model: buf[3],
            version: buf[4],
            serial: [buf[5], buf[6], buf[7], buf[8]],
            firmware_version: [buf[9], buf[10], buf[11]],
        })
    }
}

/// Capability function codes defined by OSDP's `REPLY_PDCAP`, used to index
/// [`Capabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum CapabilityCode {
    ContactStatusMonitoring = 1,
    OutputControl = 2,
    CardDataFormat = 3,
    ReaderLedControl = 4,
    ReaderAudibleOutput = 5,
    ReaderTextOutput = 6,
    TimeKeeping = 7,
    CheckCharacterSupport = 8,
    CommunicationSecurity = 9,
    ReceiveBufferSize = 10,
    LargestCombinedMessage = 11,
    SmartCardSupport = 12,
    Readers = 13,
    Biometrics = 14,
}

/// Number of capability slots tracked (`OSDP_PD_CAP_SENTINEL` in the
/// original header).
pub const CAPABILITY_SENTINEL: usize = 14;

/// One entry of the PD capability table: a compliance level and an item
/// count, as reported by `REPLY_PDCAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capability {
    pub compliance_level: u8,
    pub num_items: u8,
}

/// Fixed-indexed capability table, one slot per [`CapabilityCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    table: [Capability; CAPABILITY_SENTINEL],
}

impl Capabilities {
    pub const fn new() -> Self {
        Self {
            table: [Capability {
                compliance_level: 0,
                num_items: 0,
            }; CAPABILITY_SENTINEL],
        }
    }

    pub fn get(&self, code: CapabilityCode) -> Capability {
        self.table[code as usize - 1]
    }

    pub fn set(&mut self, code: CapabilityCode, cap: Capability) {
        self.table[code as usize - 1] = cap;
    }

    pub fn supports(&self, code: CapabilityCode) -> bool {
        self.get(code).num_items > 0
    }
}
