//! Packed DAQ buffer layout.
//!
//! The digitizer streams each pair of 16-bit channels through one 32-bit word.
//! A transfer is `num_buffers` consecutive blocks of `depth` words; logical
//! channel `id` lives in block `id / 2`, in the high half of each word when
//! `id` is even and in the low half when it is odd.

use thiserror::Error;

/// Number of DAQ buffers on the SIS8300 IQ feedback firmware
pub const DAQ_BUF_NUM: usize = 8;

/// Points per DAQ buffer on the SIS8300 IQ feedback firmware
pub const DAQ_BUF_DEPTH: usize = 512;

/// Failure to locate a logical channel in a packed transfer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackError {
    #[error("channel {channel} is outside the {num_channels} channels of the packed transfer")]
    InvalidChannel { channel: usize, num_channels: usize },

    #[error("channel {channel} cannot start an I/Q pair; paired channels must be even")]
    OddPairChannel { channel: usize },

    #[error("packed transfer holds {len} words but the layout needs {expected}")]
    ShortBuffer { len: usize, expected: usize },
}

/// Geometry of one packed transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedLayout {
    pub num_buffers: usize,
    pub depth: usize,
}

impl Default for PackedLayout {
    fn default() -> Self {
        Self::new(DAQ_BUF_NUM, DAQ_BUF_DEPTH)
    }
}

impl PackedLayout {
    pub const fn new(num_buffers: usize, depth: usize) -> Self {
        Self { num_buffers, depth }
    }

    /// Number of logical 16-bit channels carried by the transfer
    pub const fn num_channels(&self) -> usize {
        2 * self.num_buffers
    }

    /// Total number of 32-bit words in one transfer
    pub const fn num_words(&self) -> usize {
        self.num_buffers * self.depth
    }

    /// Check that `channel` addresses one of the packed buffers.
    pub fn check_channel(&self, channel: usize) -> Result<(), UnpackError> {
        if channel / 2 >= self.num_buffers {
            return Err(UnpackError::InvalidChannel {
                channel,
                num_channels: self.num_channels(),
            });
        }
        Ok(())
    }

    /// The block of words that carries `channel`.
    fn block<'a>(&self, packed: &'a [u32], channel: usize) -> Result<&'a [u32], UnpackError> {
        self.check_channel(channel)?;
        let expected = self.num_words();
        if packed.len() < expected {
            return Err(UnpackError::ShortBuffer {
                len: packed.len(),
                expected,
            });
        }
        let start = (channel / 2) * self.depth;
        Ok(&packed[start..start + self.depth])
    }

    /// Extract one logical channel into `out`.
    ///
    /// Writes `min(depth, out.len())` samples and returns that count.
    pub fn unpack_channel(
        &self,
        packed: &[u32],
        channel: usize,
        out: &mut [i16],
    ) -> Result<usize, UnpackError> {
        let block = self.block(packed, channel)?;
        let n = block.len().min(out.len());
        let take_high = channel % 2 == 0;
        for i in 0..n {
            out[i] = if take_high {
                high_half(block[i])
            } else {
                low_half(block[i])
            };
        }
        Ok(n)
    }

    /// Extract the two channels sharing the block that starts at even `channel`.
    ///
    /// High halves land in `hi` and low halves in `lo`. Writes
    /// `min(depth, hi.len(), lo.len())` samples to each and returns that count.
    pub fn unpack_pair(
        &self,
        packed: &[u32],
        channel: usize,
        hi: &mut [i16],
        lo: &mut [i16],
    ) -> Result<usize, UnpackError> {
        if channel % 2 != 0 {
            return Err(UnpackError::OddPairChannel { channel });
        }
        let block = self.block(packed, channel)?;
        let n = block.len().min(hi.len()).min(lo.len());
        for i in 0..n {
            hi[i] = high_half(block[i]);
            lo[i] = low_half(block[i]);
        }
        Ok(n)
    }
}

/// Signed sample carried in bits 31..16
#[inline]
pub const fn high_half(word: u32) -> i16 {
    (word >> 16) as u16 as i16
}

/// Signed sample carried in bits 15..0
#[inline]
pub const fn low_half(word: u32) -> i16 {
    word as u16 as i16
}

/// Pack two signed samples into one word, `hi` in bits 31..16.
#[inline]
pub const fn pack_halves(hi: i16, lo: i16) -> u32 {
    ((hi as u16 as u32) << 16) | (lo as u16 as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: PackedLayout = PackedLayout::new(4, 8);

    /// Buffer k, word i holds (hi, lo) = (k*100 + i, -(k*100 + i) - 1)
    fn packed_fixture() -> [u32; 32] {
        let mut buf = [0_u32; 32];
        for k in 0..LAYOUT.num_buffers {
            for i in 0..LAYOUT.depth {
                let v = (k * 100 + i) as i16;
                buf[k * LAYOUT.depth + i] = pack_halves(v, -v - 1);
            }
        }
        buf
    }

    #[test]
    fn recovers_both_halves_of_each_word() {
        let packed = packed_fixture();
        let mut hi = [0_i16; 8];
        let mut lo = [0_i16; 8];

        for k in 0..LAYOUT.num_buffers {
            assert_eq!(LAYOUT.unpack_channel(&packed, 2 * k, &mut hi), Ok(8));
            assert_eq!(LAYOUT.unpack_channel(&packed, 2 * k + 1, &mut lo), Ok(8));
            for i in 0..LAYOUT.depth {
                let v = (k * 100 + i) as i16;
                assert_eq!(hi[i], v, "high half of buffer {k} word {i}");
                assert_eq!(lo[i], -v - 1, "low half of buffer {k} word {i}");
            }
        }
    }

    #[test]
    fn preserves_twos_complement_extremes() {
        let mut packed = [0_u32; 32];
        packed[8] = pack_halves(i16::MIN, -1);
        packed[9] = pack_halves(i16::MAX, i16::MIN);

        let mut hi = [0_i16; 8];
        let mut lo = [0_i16; 8];
        LAYOUT.unpack_channel(&packed, 2, &mut hi).unwrap();
        LAYOUT.unpack_channel(&packed, 3, &mut lo).unwrap();

        assert_eq!((hi[0], lo[0]), (i16::MIN, -1));
        assert_eq!((hi[1], lo[1]), (i16::MAX, i16::MIN));
    }

    #[test]
    fn rejects_channels_past_the_last_buffer() {
        let packed = packed_fixture();
        let mut out = [0_i16; 8];
        for channel in [8, 9, 100] {
            assert_eq!(
                LAYOUT.unpack_channel(&packed, channel, &mut out),
                Err(UnpackError::InvalidChannel {
                    channel,
                    num_channels: 8
                })
            );
        }
    }

    #[test]
    fn pair_matches_single_channel_unpacking() {
        let packed = packed_fixture();
        let mut hi = [0_i16; 8];
        let mut lo = [0_i16; 8];
        let mut single = [0_i16; 8];

        assert_eq!(LAYOUT.unpack_pair(&packed, 4, &mut hi, &mut lo), Ok(8));
        LAYOUT.unpack_channel(&packed, 4, &mut single).unwrap();
        assert_eq!(hi, single);
        LAYOUT.unpack_channel(&packed, 5, &mut single).unwrap();
        assert_eq!(lo, single);
    }

    #[test]
    fn pair_requires_even_channel() {
        let packed = packed_fixture();
        let mut hi = [0_i16; 8];
        let mut lo = [0_i16; 8];
        assert_eq!(
            LAYOUT.unpack_pair(&packed, 3, &mut hi, &mut lo),
            Err(UnpackError::OddPairChannel { channel: 3 })
        );
    }

    #[test]
    fn short_output_is_filled_partially() {
        let packed = packed_fixture();
        let mut out = [0_i16; 3];
        assert_eq!(LAYOUT.unpack_channel(&packed, 6, &mut out), Ok(3));
        assert_eq!(out, [300, 301, 302]);
    }

    #[test]
    fn truncated_transfer_is_reported() {
        let packed = [0_u32; 10];
        let mut out = [0_i16; 8];
        assert_eq!(
            LAYOUT.unpack_channel(&packed, 0, &mut out),
            Err(UnpackError::ShortBuffer {
                len: 10,
                expected: 32
            })
        );
    }
}
