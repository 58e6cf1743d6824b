//! Register address map of the SIS8300 IQ feedback firmware.
//!
//! Addresses are in 32-bit words. Platform registers sit at the bottom of the
//! map; each application module reserves a 32-word window above
//! [`REG_ADDR_START`]; the buffer region follows from [`BUF_ADDR_OFFSET`].

use byte_struct::*;

use crate::daq::{DAQ_BUF_DEPTH, DAQ_BUF_NUM};
use crate::enum_with_unknown;

/// Value returned by any read when the board is absent or has dropped off the bus
pub const ALL_ONES: u32 = 0xFFFF_FFFF;

/// True if a register read came back as the unavailable sentinel.
#[inline]
pub const fn is_unavailable(word: u32) -> bool {
    word == ALL_ONES
}

// Platform
pub const REG_FIRMWARE_NAME: u32 = 0;
pub const REG_FIRMWARE_VERSION: u32 = 1;
pub const REG_MODULE_SERIAL_NO: u32 = 2;
pub const REG_WATCHDOG_COUNTER: u32 = 3;

// Application
pub const REG_ADDR_START: u32 = 128;

pub const REG_SWITCH_CTRL: u32 = REG_ADDR_START;

pub const REG_OFFSET_DAQ: u32 = REG_ADDR_START + 64;
pub const REG_DAQ_TRIG_DELAY: u32 = REG_OFFSET_DAQ;
pub const REG_IRQ_DELAY_CNT: u32 = REG_OFFSET_DAQ + 1;
pub const REG_PUL_CNT: u32 = REG_OFFSET_DAQ + 2;
/// First of `DAQ_BUF_NUM` consecutive buffer source selectors
pub const REG_DAQ_BUF_SEL_0: u32 = REG_OFFSET_DAQ + 3;

pub const REG_OFFSET_MAIN: u32 = REG_ADDR_START + 128;
pub const REG_REF_FBK_SEL: u32 = REG_OFFSET_MAIN;
pub const REG_ROT_COEF_REF: u32 = REG_OFFSET_MAIN + 1;
pub const REG_ROT_COEF_FBK: u32 = REG_OFFSET_MAIN + 2;
pub const REG_ROT_COEF_ACT: u32 = REG_OFFSET_MAIN + 13;

// Buffers
pub const BUF_ADDR_OFFSET: u32 = 2048;
pub const ROT_TABLE_DEPTH: u32 = 1024;
pub const BUF_ADDR_ROT_TABLE_T: u32 = BUF_ADDR_OFFSET;
pub const BUF_ADDR_ROT_TABLE_A: u32 = BUF_ADDR_ROT_TABLE_T + ROT_TABLE_DEPTH;
pub const BUF_ADDR_DAQ_START: u32 = BUF_ADDR_ROT_TABLE_A + ROT_TABLE_DEPTH;
pub const BUF_ADDR_DAQ_END: u32 = BUF_ADDR_DAQ_START + (DAQ_BUF_NUM * DAQ_BUF_DEPTH) as u32 - 1;

/// Fraction bits of the fixed-point rotation coefficients
pub const ROT_COEF_FRACTION: u32 = 15;

enum_with_unknown! {
    /// Words written to [`REG_SWITCH_CTRL`] around an interrupt counter readout
    pub enum SwitchControl(u32) {
        /// Freeze the interrupt delay and pulse counters for a consistent read
        HoldCounters = 0x4A,
        /// Resume counting
        RunCounters = 0xCA,
    }
}

/// Pack fixed-point cos/sin terms into one rotation coefficient word.
///
/// Cos goes to bits 31..16, sin to bits 15..0.
#[inline]
pub const fn pack_rotation(cos_fixed: i16, sin_fixed: i16) -> u32 {
    ((cos_fixed as u16 as u32) << 16) | (sin_fixed as u16 as u32)
}

/// Identification block read from the first platform registers.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_le]
pub struct BoardInfo {
    /// Four ASCII characters, most significant byte first
    pub firmware_name: u32,

    /// Major in bits 31..24, minor in bits 23..16, build in bits 15..0
    pub firmware_version: u32,

    pub serial_number: u32,
}

impl BoardInfo {
    /// Number of consecutive registers spanned by the block
    pub const NUM_WORDS: usize = 3;

    /// Parse the block from consecutive register words starting at [`REG_FIRMWARE_NAME`].
    pub fn from_words(words: &[u32; Self::NUM_WORDS]) -> Self {
        let mut bytes = [0_u8; BoardInfo::BYTE_LEN];
        for (chunk, w) in bytes.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        Self::read_bytes(&bytes)
    }

    pub fn is_unavailable(&self) -> bool {
        is_unavailable(self.firmware_name)
    }

    pub fn firmware_tag(&self) -> [u8; 4] {
        self.firmware_name.to_be_bytes()
    }

    pub fn major(&self) -> u32 {
        (self.firmware_version >> 24) & 0xFF
    }

    pub fn minor(&self) -> u32 {
        (self.firmware_version >> 16) & 0xFF
    }

    pub fn build(&self) -> u32 {
        self.firmware_version & 0xFFFF
    }
}

/// Interrupt delay and pulse counters, read as one frozen pair.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_le]
pub struct InterruptCounters {
    /// Clock cycles between the hardware interrupt and the readout
    pub delay_count: u32,

    /// Pulses seen by the firmware since reset
    pub pulse_count: u32,
}

impl InterruptCounters {
    /// Pulse count as a signed value with the unavailable sentinel mapped to -1.
    pub fn pulse_count_signed(&self) -> i64 {
        if is_unavailable(self.pulse_count) {
            -1
        } else {
            self.pulse_count as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daq_region_follows_rotation_tables() {
        assert_eq!(BUF_ADDR_DAQ_START, 4096);
        assert_eq!(BUF_ADDR_DAQ_END, 4096 + 4096 - 1);
        assert_eq!(REG_IRQ_DELAY_CNT, 193);
        assert_eq!(REG_PUL_CNT, 194);
        assert_eq!(REG_ROT_COEF_ACT, 269);
    }

    #[test]
    fn parses_board_info_words() {
        let info = BoardInfo::from_words(&[
            u32::from_be_bytes(*b"IQFB"),
            0x0203_0011,
            42,
        ]);
        assert_eq!(&info.firmware_tag(), b"IQFB");
        assert_eq!((info.major(), info.minor(), info.build()), (2, 3, 17));
        assert_eq!(info.serial_number, 42);
        assert!(!info.is_unavailable());
    }

    #[test]
    fn switch_control_words_round_trip() {
        assert_eq!(u32::from(SwitchControl::HoldCounters), 0x4A);
        assert_eq!(SwitchControl::from(0xCA), SwitchControl::RunCounters);
        assert_eq!(SwitchControl::from(7), SwitchControl::Unknown(7));
    }

    #[test]
    fn packs_rotation_terms() {
        assert_eq!(pack_rotation(i16::MAX, 0), 0x7FFF_0000);
        assert_eq!(pack_rotation(0, -1), 0x0000_FFFF);
    }

    #[test]
    fn unavailable_pulse_count_reads_negative() {
        let counters = InterruptCounters {
            delay_count: ALL_ONES,
            pulse_count: ALL_ONES,
        };
        assert_eq!(counters.pulse_count_signed(), -1);
    }
}
