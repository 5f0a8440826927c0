//! Scratch memory of the audio microcode.
//!
//! A single 2512 byte buffer, addressed in bytes but holding native endian 16-bit samples.
//! The synthesis driver carves it into fixed regions; the processing ops are free to address
//! any range.

use crate::util::boxed_array;
use static_assertions::const_assert;
use zerocopy::IntoBytes;

pub const DMEM_LEN: usize = 2512;

/// Samples processed per channel per update, as a byte count.
pub const DEFAULT_LEN_1CH: u16 = 0x140;
pub const DEFAULT_LEN_2CH: u16 = 2 * DEFAULT_LEN_1CH;

// region map, in byte offsets
pub const TEMP: u16 = 0x000;
pub const RESAMPLED: u16 = 0x020;
pub const RESAMPLED2: u16 = 0x160;
pub const UNCOMPRESSED_NOTE: u16 = 0x180;
pub const NOTE_PAN_TEMP: u16 = 0x200;
pub const STEREO_STRONG_TEMP_DRY: u16 = 0x200;
pub const STEREO_STRONG_TEMP_WET: u16 = 0x340;
pub const COMPRESSED_ADPCM_DATA: u16 = 0x3f0;
pub const LEFT_CH: u16 = 0x4c0;
pub const RIGHT_CH: u16 = 0x600;
pub const WET_LEFT_CH: u16 = 0x740;
pub const WET_RIGHT_CH: u16 = 0x880;

const_assert!(LEFT_CH + DEFAULT_LEN_1CH == RIGHT_CH);
const_assert!(RIGHT_CH + DEFAULT_LEN_1CH == WET_LEFT_CH);
const_assert!(WET_LEFT_CH + DEFAULT_LEN_1CH == WET_RIGHT_CH);
const_assert!(WET_RIGHT_CH as usize + DEFAULT_LEN_1CH as usize <= DMEM_LEN);

#[inline(always)]
pub const fn round_up_8(nbytes: u16) -> u16 {
    (nbytes + 7) & !7
}

#[inline(always)]
pub const fn round_up_16(nbytes: u16) -> u16 {
    (nbytes + 15) & !15
}

#[inline(always)]
pub const fn round_up_32(nbytes: u16) -> u16 {
    (nbytes + 31) & !31
}

pub struct Dmem {
    samples: Box<[i16; DMEM_LEN / 2]>,
}

impl Dmem {
    pub fn new() -> Self {
        Self {
            samples: boxed_array(0),
        }
    }

    /// The whole buffer as samples.
    #[inline(always)]
    pub fn all(&self) -> &[i16] {
        &self.samples[..]
    }

    /// The whole buffer as samples, mutable.
    #[inline(always)]
    pub fn all_mut(&mut self) -> &mut [i16] {
        &mut self.samples[..]
    }

    #[inline(always)]
    pub fn sample(&self, addr: u16) -> i16 {
        debug_assert!(addr % 2 == 0);
        self.samples[addr as usize / 2]
    }

    #[inline(always)]
    pub fn set_sample(&mut self, addr: u16, value: i16) {
        debug_assert!(addr % 2 == 0);
        self.samples[addr as usize / 2] = value;
    }

    #[inline(always)]
    pub fn samples(&self, addr: u16, count: usize) -> &[i16] {
        debug_assert!(addr % 2 == 0);
        let base = addr as usize / 2;
        &self.samples[base..base + count]
    }

    #[inline(always)]
    pub fn samples_mut(&mut self, addr: u16, count: usize) -> &mut [i16] {
        debug_assert!(addr % 2 == 0);
        let base = addr as usize / 2;
        &mut self.samples[base..base + count]
    }

    /// A byte view of a range. Byte addresses may be odd, e.g. when compressed frames are
    /// staged at their transfer alignment phase.
    #[inline(always)]
    pub fn bytes(&self, addr: u16, len: usize) -> &[u8] {
        let base = addr as usize;
        &self.samples.as_bytes()[base..base + len]
    }

    #[inline(always)]
    pub fn bytes_mut(&mut self, addr: u16, len: usize) -> &mut [u8] {
        let base = addr as usize;
        &mut self.samples.as_mut_bytes()[base..base + len]
    }

    /// Overlap-safe byte copy within the buffer.
    #[inline(always)]
    pub fn move_within(&mut self, src: u16, dst: u16, nbytes: u16) {
        let src = src as usize;
        let dst = dst as usize;
        self.samples
            .as_mut_bytes()
            .copy_within(src..src + nbytes as usize, dst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up_8(0), 0);
        assert_eq!(round_up_8(1), 8);
        assert_eq!(round_up_8(8), 8);
        assert_eq!(round_up_16(17), 32);
        assert_eq!(round_up_32(33), 64);
        assert_eq!(round_up_32(64), 64);
    }

    #[test]
    fn byte_and_sample_views_alias() {
        let mut dmem = Dmem::new();
        dmem.set_sample(0x10, 0x1234);
        let bytes = dmem.bytes(0x10, 2);
        assert_eq!(i16::from_ne_bytes([bytes[0], bytes[1]]), 0x1234);
    }

    #[test]
    fn move_within_overlapping() {
        let mut dmem = Dmem::new();
        for i in 0..8 {
            dmem.set_sample(i * 2, i as i16);
        }
        dmem.move_within(0, 4, 16);
        assert_eq!(dmem.sample(4), 0);
        assert_eq!(dmem.sample(6), 1);
        assert_eq!(dmem.sample(18), 7);
    }
}
