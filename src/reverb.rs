//! Reverb ring buffers.
//!
//! Each reverb keeps a ring of downsampled wet samples per channel. Every update carves a
//! segment out of the ring: the driver mixes the oldest samples back into the dry signal,
//! decays them and writes the update's wet output over them. Downsampling reverbs stage
//! their wet output aside and fold it into the ring on the CPU two frames later.

use crate::dmem::DEFAULT_LEN_1CH;
use crate::mixer::{Channel, ResampleState};
use crate::util::boxed_array;

const STAGING_SAMPLES: usize = DEFAULT_LEN_1CH as usize / 2;

pub struct ReverbConfig {
    /// Ring size per channel, in samples after downsampling.
    pub window_size: usize,
    /// Decay gain, out of 0x8000.
    pub gain: u16,
    /// 1 keeps the ring at the output rate.
    pub downsample_rate: u32,
}

/// One update's segment of the ring, split at the wrap point.
pub(crate) struct ReverbItem {
    pub start_pos: usize,
    /// Segment byte lengths before and after the wrap point.
    pub length_a: u16,
    pub length_b: u16,
    // written back for parity with the hardware driver, never read
    pub num_samples_after_downsampling: u16,
    pub chunk_len: u16,
    /// Full rate wet output awaiting the deferred downsample. Left then right halves.
    pub to_downsample: Box<[i16; 2 * STAGING_SAMPLES]>,
}

impl ReverbItem {
    fn new() -> Self {
        Self {
            start_pos: 0,
            length_a: 0,
            length_b: 0,
            num_samples_after_downsampling: 0,
            chunk_len: 0,
            to_downsample: boxed_array(0),
        }
    }
}

pub(crate) struct SynthesisReverb {
    pub gain: u16,
    pub downsample_rate: u32,
    pub window_size: usize,
    pub cur_frame: usize,
    pub frames_to_ignore: u8,
    pub next_ring_pos: usize,
    pub ring_left: Box<[i16]>,
    pub ring_right: Box<[i16]>,
    pub resample_rate: u16,
    /// The upsample pair starts from scratch until the first live frame has been saved.
    pub resample_init: bool,
    pub resample_state_left: ResampleState,
    pub resample_state_right: ResampleState,
    pub items: [Vec<ReverbItem>; 2],
}

impl SynthesisReverb {
    pub fn new(config: &ReverbConfig, updates_per_frame: usize) -> Self {
        let items = core::array::from_fn(|_| {
            (0..updates_per_frame).map(|_| ReverbItem::new()).collect()
        });
        Self {
            gain: config.gain,
            downsample_rate: config.downsample_rate,
            window_size: config.window_size,
            cur_frame: 0,
            frames_to_ignore: if config.downsample_rate == 1 { 0 } else { 2 },
            next_ring_pos: 0,
            ring_left: vec![0; config.window_size].into_boxed_slice(),
            ring_right: vec![0; config.window_size].into_boxed_slice(),
            resample_rate: (0x8000 / config.downsample_rate) as u16,
            resample_init: true,
            resample_state_left: ResampleState::default(),
            resample_state_right: ResampleState::default(),
            items,
        }
    }

    pub fn item(&self, update_index: usize) -> &ReverbItem {
        &self.items[self.cur_frame][update_index]
    }

    pub fn item_mut(&mut self, update_index: usize) -> &mut ReverbItem {
        &mut self.items[self.cur_frame][update_index]
    }

    pub fn ring(&self, channel: Channel, start: usize, count: usize) -> &[i16] {
        debug_assert!(start + count <= self.window_size);
        match channel {
            Channel::Left => &self.ring_left[start..start + count],
            Channel::Right => &self.ring_right[start..start + count],
        }
    }

    pub fn ring_mut(&mut self, channel: Channel, start: usize, count: usize) -> &mut [i16] {
        debug_assert!(start + count <= self.window_size);
        match channel {
            Channel::Left => &mut self.ring_left[start..start + count],
            Channel::Right => &mut self.ring_right[start..start + count],
        }
    }

    /// Folds staged wet output into the ring (downsampling reverbs, once warmed up) and
    /// carves this update's segment.
    pub fn prepare(&mut self, chunk_len: usize, update_index: usize) {
        let rate = self.downsample_rate as usize;

        if rate != 1 && self.frames_to_ignore == 0 {
            let item = &self.items[self.cur_frame][update_index];
            let (left, right) = item.to_downsample.split_at(STAGING_SAMPLES);

            let mut src = 0;
            let mut dst = item.start_pos;
            for _ in 0..item.length_a / 2 {
                self.ring_left[dst] = left[src];
                self.ring_right[dst] = right[src];
                src += rate;
                dst += 1;
            }
            let mut dst = 0;
            for _ in 0..item.length_b / 2 {
                self.ring_left[dst] = left[src];
                self.ring_right[dst] = right[src];
                src += rate;
                dst += 1;
            }
        }

        let n_samples = chunk_len / rate;
        let excess = (n_samples + self.next_ring_pos) as isize - self.window_size as isize;
        let item = &mut self.items[self.cur_frame][update_index];
        item.start_pos = self.next_ring_pos;
        if excess < 0 {
            item.length_a = (n_samples * 2) as u16;
            item.length_b = 0;
            self.next_ring_pos += n_samples;
        } else {
            let excess = excess as usize;
            item.length_a = ((n_samples - excess) * 2) as u16;
            item.length_b = (excess * 2) as u16;
            self.next_ring_pos = excess;
        }
        item.num_samples_after_downsampling = n_samples as u16;
        item.chunk_len = chunk_len as u16;
    }

    /// Frame bookkeeping: burn a warm-up frame and flip item parity.
    pub fn end_frame(&mut self) {
        if self.frames_to_ignore != 0 {
            self.frames_to_ignore -= 1;
        }
        self.cur_frame ^= 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reverb(window_size: usize, downsample_rate: u32) -> SynthesisReverb {
        SynthesisReverb::new(
            &ReverbConfig {
                window_size,
                gain: 0x3000,
                downsample_rate,
            },
            4,
        )
    }

    #[test]
    fn segments_advance_through_the_window() {
        let mut reverb = reverb(100, 1);
        reverb.prepare(40, 0);
        let item = reverb.item(0);
        assert_eq!(item.start_pos, 0);
        assert_eq!((item.length_a, item.length_b), (80, 0));
        assert_eq!(reverb.next_ring_pos, 40);
    }

    #[test]
    fn segments_split_at_the_wrap_point() {
        let mut reverb = reverb(100, 1);
        reverb.next_ring_pos = 90;
        reverb.prepare(20, 0);
        let item = reverb.item(0);
        assert_eq!(item.start_pos, 90);
        assert_eq!((item.length_a, item.length_b), (20, 20));
        assert_eq!(reverb.next_ring_pos, 10);
    }

    #[test]
    fn downsampling_defers_two_frames() {
        let mut reverb = reverb(100, 2);
        assert_eq!(reverb.frames_to_ignore, 2);
        assert_eq!(reverb.resample_rate, 0x4000);

        // stage a ramp and wait out the warm-up
        reverb.prepare(40, 0);
        for (i, sample) in reverb.item_mut(0).to_downsample.iter_mut().enumerate() {
            *sample = i as i16;
        }
        reverb.end_frame();
        reverb.end_frame();
        assert_eq!(reverb.frames_to_ignore, 0);
        assert_eq!(reverb.cur_frame, 0);

        // every other staged sample lands in the ring
        reverb.prepare(40, 0);
        assert_eq!(&reverb.ring_left[..4], &[0, 2, 4, 6]);
        assert_eq!(
            &reverb.ring_right[..4],
            &[
                STAGING_SAMPLES as i16,
                STAGING_SAMPLES as i16 + 2,
                STAGING_SAMPLES as i16 + 4,
                STAGING_SAMPLES as i16 + 6,
            ]
        );
    }
}
