//! Frame driver and voice scheduler.
//!
//! [`Synthesizer`] owns the op machine, the voices and the reverb rings. A frame is split
//! into a handful of updates; each update mixes the reverb tails into the dry channels,
//! runs every active voice through decode, resample and envelope, saves the new wet tails
//! and interleaves the dry pair into the caller's buffer.

use crate::dmem::{
    COMPRESSED_ADPCM_DATA, DEFAULT_LEN_1CH, DEFAULT_LEN_2CH, LEFT_CH, NOTE_PAN_TEMP, RESAMPLED,
    RESAMPLED2, RIGHT_CH, STEREO_STRONG_TEMP_DRY, STEREO_STRONG_TEMP_WET, TEMP, UNCOMPRESSED_NOTE,
    WET_LEFT_CH, WET_RIGHT_CH,
};
use crate::mixer::{Channel, DecodeFlag, Kernels, Reference, ResampleFlag, ResampleState, Rspa};
use crate::ramping::VolRamping;
use crate::reverb::{ReverbConfig, SynthesisReverb};
use crate::voice::{AdpcmBook, AdpcmSample, Voice, VoiceParams, VoiceSource, VoiceState};
use easyerr::Error;
use std::sync::Arc;
use tinyvec::ArrayVec;
use tracing::{info_span, warn};
use zerocopy::IntoBytes;

/// Output sample rate, in Hz.
pub const OUTPUT_RATE: u32 = 32000;
/// Stereo frames per video frame when the output buffer is running low.
pub const SAMPLES_HIGH: usize = 544;
/// Stereo frames per video frame when the output buffer is comfortably full.
pub const SAMPLES_LOW: usize = 528;
/// Buffered frame count above which a frame is synthesized at the low rate.
pub const SAMPLES_DESIRED: usize = 1100;

pub const MAX_VOICES: usize = 56;
pub const MAX_REVERBS: usize = 4;
pub const MAX_UPDATES_PER_FRAME: usize = 8;
/// Sample banks trackable by [`Synthesizer::set_bank_loaded`].
pub const MAX_BANKS: usize = 64;

/// Picks the frame length that keeps the output buffer near [`SAMPLES_DESIRED`].
pub fn samples_for_frame(buffered: usize) -> usize {
    if buffered < SAMPLES_DESIRED {
        SAMPLES_HIGH
    } else {
        SAMPLES_LOW
    }
}

/// Splits the remaining frame length across the remaining updates, rounding each chunk to
/// the nearest multiple of 8. The last update takes whatever is left.
fn chunk_len(remaining: usize, updates_left: usize) -> usize {
    if updates_left == 1 {
        return remaining;
    }
    let v = remaining / updates_left;
    let mut chunk = v - (v & 7);
    if (v & 7) >= 4 {
        chunk += 8;
    }
    chunk
}

pub struct SynthesizerConfig {
    pub voices: usize,
    pub updates_per_frame: usize,
    pub reverbs: Vec<ReverbConfig>,
    /// Master volume applied to the dry signal.
    pub volume: i16,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            voices: MAX_VOICES,
            updates_per_frame: 4,
            reverbs: Vec::new(),
            volume: 0x7fff,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("too many voices: {count} (at most 56)")]
    TooManyVoices { count: usize },
    #[error("updates per frame must be within 1..=8, got {count}")]
    BadUpdateCount { count: usize },
    #[error("too many reverbs: {count} (at most 4)")]
    TooManyReverbs { count: usize },
    #[error("reverb {index} has a zero downsample rate")]
    BadDownsampleRate { index: usize },
    #[error("reverb {index} window is shorter than one update (160 samples)")]
    ReverbWindowTooShort { index: usize },
    #[error("reverb {index} window is not a multiple of 8 samples")]
    UnalignedReverbWindow { index: usize },
}

/// A voice was skipped because its sample bank is not resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankError {
    pub voice: usize,
    pub bank_id: u8,
}

pub struct Synthesizer<K: Kernels = Reference> {
    rspa: Rspa<K>,
    voices: Vec<Voice>,
    reverbs: Vec<SynthesisReverb>,
    ramping: VolRamping,
    updates_per_frame: usize,
    volume: i16,
    /// Predictor book currently loaded into the op machine. Holding it keeps its
    /// pointer identity stable.
    cur_book: Option<Arc<AdpcmBook>>,
    bank_loaded: [bool; MAX_BANKS],
    last_bank_error: Option<BankError>,
}

impl<K: Kernels> Synthesizer<K> {
    pub fn new(config: SynthesizerConfig) -> Result<Self, ConfigError> {
        if config.voices > MAX_VOICES {
            return Err(ConfigError::TooManyVoices {
                count: config.voices,
            });
        }
        if config.updates_per_frame == 0 || config.updates_per_frame > MAX_UPDATES_PER_FRAME {
            return Err(ConfigError::BadUpdateCount {
                count: config.updates_per_frame,
            });
        }
        if config.reverbs.len() > MAX_REVERBS {
            return Err(ConfigError::TooManyReverbs {
                count: config.reverbs.len(),
            });
        }
        for (index, reverb) in config.reverbs.iter().enumerate() {
            if reverb.downsample_rate == 0 {
                return Err(ConfigError::BadDownsampleRate { index });
            }
            if reverb.window_size < DEFAULT_LEN_1CH as usize / 2 {
                return Err(ConfigError::ReverbWindowTooShort { index });
            }
            // segment staging for the upsample path assumes 8-sample alignment
            if reverb.window_size % 8 != 0 {
                return Err(ConfigError::UnalignedReverbWindow { index });
            }
        }

        let reverbs = config
            .reverbs
            .iter()
            .map(|reverb| SynthesisReverb::new(reverb, config.updates_per_frame))
            .collect();

        Ok(Self {
            rspa: Rspa::new(),
            voices: (0..config.voices).map(|_| Voice::new()).collect(),
            reverbs,
            ramping: VolRamping::new(),
            updates_per_frame: config.updates_per_frame,
            volume: config.volume,
            cur_book: None,
            bank_loaded: [true; MAX_BANKS],
            last_bank_error: None,
        })
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    pub fn voice(&self, index: usize) -> &Voice {
        &self.voices[index]
    }

    pub fn voice_mut(&mut self, index: usize) -> &mut Voice {
        &mut self.voices[index]
    }

    pub fn set_volume(&mut self, volume: i16) {
        self.volume = volume;
    }

    /// Marks a sample bank resident or not. Voices playing from a bank that is not resident
    /// are skipped. All banks start out resident.
    pub fn set_bank_loaded(&mut self, bank_id: u8, loaded: bool) {
        if let Some(slot) = self.bank_loaded.get_mut(bank_id as usize) {
            *slot = loaded;
        }
    }

    /// The most recent skipped-voice record, if any.
    pub fn take_bank_error(&mut self) -> Option<BankError> {
        self.last_bank_error.take()
    }

    /// Synthesizes one frame of interleaved stereo into `out`, which holds `2 * n` samples
    /// for a frame of `n` stereo frames. `n` must be a multiple of 16 and small enough that
    /// no update exceeds 160 frames. Returns the number of ops executed.
    pub fn synthesize_frame(&mut self, out: &mut [i16]) -> u32 {
        let frame_len = out.len() / 2;
        debug_assert!(frame_len % 16 == 0);

        let _span = info_span!("synthesize_frame", samples = frame_len).entered();
        let commands_before = self.rspa.commands();

        let mut remaining = frame_len;
        let mut offset = 0;
        for i in (1..=self.updates_per_frame).rev() {
            let chunk = chunk_len(remaining, i);
            let update_index = self.updates_per_frame - i;
            for reverb in &mut self.reverbs {
                reverb.prepare(chunk, update_index);
            }
            self.do_one_update(chunk, update_index, &mut out[offset * 2..(offset + chunk) * 2]);
            remaining -= chunk;
            offset += chunk;
        }
        for reverb in &mut self.reverbs {
            reverb.end_frame();
        }

        self.rspa.commands().wrapping_sub(commands_before)
    }

    fn do_one_update(&mut self, buf_len: usize, update_index: usize, out: &mut [i16]) {
        debug_assert!(buf_len <= DEFAULT_LEN_1CH as usize / 2);
        let num_reverbs = self.reverbs.len();

        // voices grouped by the reverb they feed, dry voices last
        let mut indices: ArrayVec<[u8; MAX_VOICES]> = ArrayVec::new();
        if num_reverbs == 0 {
            for (i, voice) in self.voices.iter().enumerate() {
                if voice.params.enabled {
                    indices.push(i as u8);
                }
            }
        } else {
            for j in 0..num_reverbs {
                for (i, voice) in self.voices.iter().enumerate() {
                    if voice.params.enabled && voice.params.reverb_index as usize == j {
                        indices.push(i as u8);
                    }
                }
            }
            for (i, voice) in self.voices.iter().enumerate() {
                if voice.params.enabled && voice.params.reverb_index as usize >= num_reverbs {
                    indices.push(i as u8);
                }
            }
        }

        self.rspa.clear_buffer(LEFT_CH, DEFAULT_LEN_2CH);

        let mut next = 0;
        for j in 0..num_reverbs {
            self.mix_reverb(buf_len, j, update_index);
            while let Some(&index) = indices.get(next) {
                if self.voices[index as usize].params.reverb_index as usize != j {
                    break;
                }
                next += 1;
                self.process_one(index as usize, buf_len, true);
            }
            self.save_reverb(j, update_index);
        }
        for &index in &indices[next..] {
            self.process_one(index as usize, buf_len, false);
        }

        self.rspa.set_buffer(0, 0, (buf_len * 2) as u16);
        self.rspa.interleave_and_copy(LEFT_CH, RIGHT_CH, out);
    }

    fn process_one(&mut self, index: usize, buf_len: usize, use_reverb: bool) {
        let bank_id = self.voices[index].params.bank_id;
        let resident = (bank_id as usize) < MAX_BANKS && self.bank_loaded[bank_id as usize];
        if !resident {
            warn!(voice = index, bank_id, "sample bank not resident, skipping voice");
            self.last_bank_error = Some(BankError {
                voice: index,
                bank_id,
            });
            return;
        }

        let mut ctx = UpdateCtx {
            rspa: &mut self.rspa,
            ramping: &self.ramping,
            cur_book: &mut self.cur_book,
            master_volume: self.volume,
            use_reverb,
            buf_len,
        };
        ctx.process(&mut self.voices[index]);
    }

    /// Mixes the oldest ring segment into the dry pair and decays the wet pair.
    fn mix_reverb(&mut self, buf_len: usize, index: usize, update_index: usize) {
        let reverb = &self.reverbs[index];
        let item = reverb.item(update_index);
        let (start_pos, length_a, length_b) = (item.start_pos, item.length_a, item.length_b);
        let downsample_rate = reverb.downsample_rate;
        // the decay gain rides on top of 0x8000, wrapping to a negative mix gain
        let decay = 0x8000u16.wrapping_add(reverb.gain) as i16;
        let resample_rate = reverb.resample_rate;
        let resample_flag = if reverb.resample_init {
            ResampleFlag::Init
        } else {
            ResampleFlag::Continue
        };

        self.rspa.clear_buffer(WET_LEFT_CH, DEFAULT_LEN_2CH);
        if downsample_rate == 1 {
            self.load_ring_pair(WET_LEFT_CH, start_pos, length_a, index);
            if length_b != 0 {
                self.load_ring_pair(WET_LEFT_CH + length_a, 0, length_b, index);
            }
        } else {
            // upsample the downsampled tail back to the output rate
            let start_pad = ((start_pos % 8) * 2) as u16;
            let padded_length_a = (start_pad + length_a + 15) & !15;
            self.load_ring_pair(
                RESAMPLED,
                start_pos - start_pad as usize / 2,
                DEFAULT_LEN_1CH,
                index,
            );
            if length_b != 0 {
                self.load_ring_pair(
                    RESAMPLED + padded_length_a,
                    0,
                    DEFAULT_LEN_1CH - padded_length_a,
                    index,
                );
            }

            self.rspa
                .set_buffer(RESAMPLED + start_pad, WET_LEFT_CH, (buf_len * 2) as u16);
            self.rspa.resample(
                resample_flag,
                resample_rate,
                &mut self.reverbs[index].resample_state_left,
            );
            self.rspa
                .set_buffer(RESAMPLED2 + start_pad, WET_RIGHT_CH, (buf_len * 2) as u16);
            self.rspa.resample(
                resample_flag,
                resample_rate,
                &mut self.reverbs[index].resample_state_right,
            );
        }
        self.rspa.set_buffer(0, 0, DEFAULT_LEN_2CH);
        self.rspa.mix(0x7fff, WET_LEFT_CH, LEFT_CH);
        self.rspa.mix(decay, WET_LEFT_CH, WET_LEFT_CH);
    }

    /// Writes this update's wet output over the segment just consumed, or stages it for the
    /// deferred downsample.
    fn save_reverb(&mut self, index: usize, update_index: usize) {
        let item = self.reverbs[index].item(update_index);
        let (start_pos, length_a, length_b) = (item.start_pos, item.length_a, item.length_b);

        if self.reverbs[index].downsample_rate == 1 {
            self.save_ring_pair(WET_LEFT_CH, start_pos, length_a, index);
            if length_b != 0 {
                self.save_ring_pair(WET_LEFT_CH + length_a, 0, length_b, index);
            }
        } else {
            self.rspa.set_buffer(0, WET_LEFT_CH, DEFAULT_LEN_2CH);
            self.rspa.save_buffer(
                self.reverbs[index]
                    .item_mut(update_index)
                    .to_downsample
                    .as_mut_bytes(),
            );
            self.reverbs[index].resample_init = false;
        }
    }

    fn load_ring_pair(&mut self, addr: u16, ring_pos: usize, nbytes: u16, index: usize) {
        let count = (nbytes as usize / 2).min(self.reverbs[index].window_size - ring_pos);
        self.rspa.set_buffer(addr, 0, nbytes);
        self.rspa
            .load_buffer(self.reverbs[index].ring(Channel::Left, ring_pos, count).as_bytes());
        self.rspa.set_buffer(addr + DEFAULT_LEN_1CH, 0, nbytes);
        self.rspa
            .load_buffer(self.reverbs[index].ring(Channel::Right, ring_pos, count).as_bytes());
    }

    fn save_ring_pair(&mut self, addr: u16, ring_pos: usize, nbytes: u16, index: usize) {
        let count = (nbytes as usize / 2).min(self.reverbs[index].window_size - ring_pos);
        self.rspa.set_buffer(0, addr, nbytes);
        self.rspa.save_buffer(
            self.reverbs[index]
                .ring_mut(Channel::Left, ring_pos, count)
                .as_mut_bytes(),
        );
        self.rspa.set_buffer(0, addr + DEFAULT_LEN_1CH, nbytes);
        self.rspa.save_buffer(
            self.reverbs[index]
                .ring_mut(Channel::Right, ring_pos, count)
                .as_mut_bytes(),
        );
    }
}

/// Everything one voice update needs besides the voice itself.
struct UpdateCtx<'a, K: Kernels> {
    rspa: &'a mut Rspa<K>,
    ramping: &'a VolRamping,
    cur_book: &'a mut Option<Arc<AdpcmBook>>,
    master_volume: i16,
    use_reverb: bool,
    /// Stereo frames in this update.
    buf_len: usize,
}

impl<K: Kernels> UpdateCtx<'_, K> {
    fn process(&mut self, voice: &mut Voice) {
        let Voice { params, state } = voice;

        let note_init = params.needs_init;
        params.needs_init = false;
        if note_init {
            *state = VoiceState {
                cur_vol_left: 1,
                cur_vol_right: 1,
                ..VoiceState::default()
            };
        }

        let mut frequency = params.frequency;
        if !frequency.is_finite() || frequency < 0.0 {
            warn!(
                frequency = f64::from(frequency),
                "invalid voice frequency, treating as silence"
            );
            frequency = 0.0;
        }

        // above twice the output rate the stream is decoded in two parts, each pre-halved
        let n_parts: i32;
        let resampling_rate: f32;
        if frequency < 2.0 {
            n_parts = 1;
            if frequency > 1.99996 {
                frequency = 1.99996;
            }
            resampling_rate = frequency;
        } else {
            n_parts = 2;
            if frequency >= 3.99993 {
                frequency = 3.99993;
            }
            resampling_rate = frequency * 0.5;
        }
        params.frequency = frequency;

        let rate_fixed = (resampling_rate * 32768.0) as i32 as u16;
        let samples_len_fixed =
            state.sample_pos_frac as u32 + rate_fixed as u32 * self.buf_len as u32 * 2;
        state.sample_pos_frac = samples_len_fixed as u16;
        let samples_len = (samples_len_fixed >> 16) as i32;

        let Some(source) = params.source.clone() else {
            return;
        };

        let dmem_before_resampling = match &source {
            VoiceSource::Wave(samples) => {
                self.load_wave_samples(samples, state, samples_len);
                let addr = UNCOMPRESSED_NOTE + (state.sample_pos_int * 2) as u16;
                state.sample_pos_int += samples_len as u32;
                addr
            }
            VoiceSource::Adpcm(sample) => {
                self.process_adpcm_parts(sample, params, state, note_init, n_parts, samples_len)
            }
        };

        let resample_flag = if note_init {
            ResampleFlag::Init
        } else {
            ResampleFlag::Continue
        };
        self.rspa
            .set_buffer(dmem_before_resampling, TEMP, (self.buf_len * 2) as u16);
        self.rspa
            .resample(resample_flag, rate_fixed, &mut state.final_resample);

        let pan_settings: u32 = if params.headset_pan_right != 0 || state.prev_headset_pan_right != 0
        {
            1
        } else if params.headset_pan_left != 0 || state.prev_headset_pan_left != 0 {
            2
        } else {
            0
        };

        self.process_envelope(params, state, pan_settings);

        if params.uses_headset_pan_effects {
            self.apply_headset_pan_effects(params, state, note_init, pan_settings);
        }
    }

    fn load_wave_samples(&mut self, samples: &[i16; 64], state: &mut VoiceState, to_load: i32) {
        self.rspa.set_buffer(UNCOMPRESSED_NOTE, 0, 128);
        self.rspa.load_buffer(samples.as_bytes());
        state.sample_pos_int &= 0x3f;
        let headroom = 64 - state.sample_pos_int as i32;
        if headroom < to_load {
            let repeats = (to_load - headroom + 63) / 64;
            for i in 0..repeats {
                self.rspa.dmem_move(
                    UNCOMPRESSED_NOTE,
                    UNCOMPRESSED_NOTE + ((1 + i) * 128) as u16,
                    128,
                );
            }
        }
    }

    /// Decodes `samples_len` samples of the compressed stream, honoring loop points and the
    /// 16-sample frame alignment of the decoder. Returns the scratch address of the samples
    /// to feed the final resampler.
    fn process_adpcm_parts(
        &mut self,
        sample: &AdpcmSample,
        params: &mut VoiceParams,
        state: &mut VoiceState,
        note_init: bool,
        n_parts: i32,
        samples_len: i32,
    ) -> u16 {
        let loop_info = &sample.loop_info;
        let end_pos = loop_info.end as i32;
        let data = &sample.data;

        let mut flag = if note_init {
            DecodeFlag::Init
        } else {
            DecodeFlag::Continue
        };
        let mut resampled_temp_len = 0i32;
        let mut alignment_offset = 0i32;
        let mut dmem_before = UNCOMPRESSED_NOTE;

        let book_loaded = self
            .cur_book
            .as_ref()
            .is_some_and(|book| Arc::ptr_eq(book, &sample.book));
        if !book_loaded {
            *self.cur_book = Some(Arc::clone(&sample.book));
            self.rspa.load_adpcm(&sample.book.table);
        }

        for cur_part in 0..n_parts {
            let mut n_samples_processed = 0i32;
            let mut tail = 0i32;

            let samples_len_adjusted = if n_parts == 1 {
                samples_len
            } else if samples_len & 1 != 0 {
                (samples_len & !1) + cur_part * 2
            } else {
                samples_len
            };

            while n_samples_processed != samples_len_adjusted {
                let mut note_finished = false;
                let mut restart = false;
                let to_process = samples_len_adjusted - n_samples_processed;
                let mut nibble = (state.sample_pos_int & 0xf) as i32;
                let samples_remaining = end_pos - state.sample_pos_int as i32;

                if nibble == 0 && !state.restart {
                    nibble = 16;
                }
                let mut skipped = 16 - nibble;

                let n_packets;
                let mut n_uncompressed;
                let over;
                if to_process < samples_remaining {
                    n_packets = (to_process - skipped + 0xf) / 16;
                    n_uncompressed = n_packets * 16;
                    over = skipped + n_uncompressed - to_process;
                } else {
                    n_uncompressed = samples_remaining - skipped;
                    over = 0;
                    if n_uncompressed <= 0 {
                        n_uncompressed = 0;
                        skipped = samples_remaining;
                    }
                    n_packets = (n_uncompressed + 0xf) / 16;
                    if loop_info.count != 0 {
                        restart = true;
                    } else {
                        note_finished = true;
                    }
                }

                let data_offset;
                if n_packets != 0 {
                    let frame = (state.sample_pos_int as i32 - nibble + 0x10) / 16;
                    let byte_pos = frame as usize * 9;
                    // stage at the transfer alignment phase of the source position
                    data_offset = (byte_pos & 0xf) as i32;
                    let start = byte_pos - data_offset as usize;
                    self.rspa.set_buffer(
                        COMPRESSED_ADPCM_DATA,
                        0,
                        (n_packets * 9 + data_offset) as u16,
                    );
                    self.rspa.load_buffer(data.get(start..).unwrap_or(&[]));
                } else {
                    n_uncompressed = 0;
                    data_offset = 0;
                }

                if state.restart {
                    self.rspa.set_adpcm_loop(&loop_info.state);
                    flag = DecodeFlag::Loop;
                    state.restart = false;
                }

                let n_samples_in_iteration = n_uncompressed + skipped - over;
                if n_samples_processed == 0 {
                    self.rspa.set_buffer(
                        COMPRESSED_ADPCM_DATA + data_offset as u16,
                        UNCOMPRESSED_NOTE,
                        (n_uncompressed * 2) as u16,
                    );
                    self.rspa.adpcm_dec(flag, &mut state.adpcm);
                    alignment_offset = nibble * 2;
                } else {
                    // later chunks decode at a 32-byte boundary and are moved back flush
                    let tail_aligned = (tail + 0x1f) & !0x1f;
                    self.rspa.set_buffer(
                        COMPRESSED_ADPCM_DATA + data_offset as u16,
                        UNCOMPRESSED_NOTE + tail_aligned as u16,
                        (n_uncompressed * 2) as u16,
                    );
                    self.rspa.adpcm_dec(flag, &mut state.adpcm);
                    self.rspa.dmem_move(
                        UNCOMPRESSED_NOTE + (tail_aligned + nibble * 2) as u16,
                        UNCOMPRESSED_NOTE + tail as u16,
                        (n_samples_in_iteration * 2) as u16,
                    );
                }

                n_samples_processed += n_samples_in_iteration;

                match flag {
                    DecodeFlag::Init => {
                        alignment_offset = 0;
                        tail += n_uncompressed * 2;
                    }
                    DecodeFlag::Loop => {
                        tail += n_samples_in_iteration * 2;
                    }
                    DecodeFlag::Continue => {
                        if tail != 0 {
                            tail += n_samples_in_iteration * 2;
                        } else {
                            tail = (nibble + n_samples_in_iteration) * 2;
                        }
                    }
                }
                flag = DecodeFlag::Continue;

                if note_finished {
                    // pad the rest of the update with silence and shut the voice off
                    self.rspa.clear_buffer(
                        UNCOMPRESSED_NOTE + tail as u16,
                        ((samples_len_adjusted - n_samples_processed) * 2) as u16,
                    );
                    state.finished = true;
                    params.enabled = false;
                    break;
                }
                if restart {
                    state.restart = true;
                    state.sample_pos_int = loop_info.start;
                } else {
                    state.sample_pos_int += to_process as u32;
                }
            }

            match (n_parts, cur_part) {
                (1, _) => {
                    dmem_before = UNCOMPRESSED_NOTE + alignment_offset as u16;
                }
                (_, 0) => {
                    self.rspa.set_buffer(
                        UNCOMPRESSED_NOTE + alignment_offset as u16,
                        RESAMPLED,
                        (samples_len_adjusted + 4) as u16,
                    );
                    let mut scratch = ResampleState::default();
                    self.rspa
                        .resample(ResampleFlag::Init, 0xff60, &mut scratch);
                    resampled_temp_len = samples_len_adjusted + 4;
                    dmem_before = RESAMPLED + 4;
                    if state.finished {
                        self.rspa.clear_buffer(
                            RESAMPLED + resampled_temp_len as u16,
                            (samples_len_adjusted + 0x10) as u16,
                        );
                    }
                }
                _ => {
                    self.rspa.set_buffer(
                        UNCOMPRESSED_NOTE + alignment_offset as u16,
                        RESAMPLED2,
                        (samples_len_adjusted + 8) as u16,
                    );
                    let mut scratch = ResampleState::default();
                    self.rspa
                        .resample(ResampleFlag::Init, 0xff60, &mut scratch);
                    self.rspa.dmem_move(
                        RESAMPLED2 + 4,
                        RESAMPLED + resampled_temp_len as u16,
                        (samples_len_adjusted + 4) as u16,
                    );
                }
            }

            if state.finished {
                break;
            }
        }

        dmem_before
    }

    /// Routes the resampled voice through the envelope mixer into the dry and wet pairs.
    fn process_envelope(&mut self, params: &mut VoiceParams, state: &mut VoiceState, pan_settings: u32) {
        let n_bytes = (self.buf_len * 2) as u16;

        let source_left = state.cur_vol_left;
        let source_right = state.cur_vol_right;
        // the volume registers are signed
        let target_left = params.target_vol_left.min(0x7fff);
        let target_right = params.target_vol_right.min(0x7fff);
        state.cur_vol_left = target_left;
        state.cur_vol_right = target_right;

        if params.uses_headset_pan_effects {
            // one channel detours through the pan temp for the shift applied afterwards
            self.rspa.clear_buffer(NOTE_PAN_TEMP, DEFAULT_LEN_1CH);
            match pan_settings {
                1 => {
                    self.rspa.set_buffer(TEMP, NOTE_PAN_TEMP, n_bytes);
                    self.rspa.set_aux_buffer(RIGHT_CH, WET_LEFT_CH, WET_RIGHT_CH);
                }
                2 => {
                    self.rspa.set_buffer(TEMP, LEFT_CH, n_bytes);
                    self.rspa
                        .set_aux_buffer(NOTE_PAN_TEMP, WET_LEFT_CH, WET_RIGHT_CH);
                }
                _ => {
                    self.rspa.set_buffer(TEMP, LEFT_CH, n_bytes);
                    self.rspa.set_aux_buffer(RIGHT_CH, WET_LEFT_CH, WET_RIGHT_CH);
                }
            }
        } else if params.stereo_strong_right {
            self.rspa
                .clear_buffer(STEREO_STRONG_TEMP_DRY, DEFAULT_LEN_2CH);
            self.rspa.set_buffer(TEMP, STEREO_STRONG_TEMP_DRY, n_bytes);
            self.rspa
                .set_aux_buffer(RIGHT_CH, STEREO_STRONG_TEMP_WET, WET_RIGHT_CH);
        } else if params.stereo_strong_left {
            self.rspa
                .clear_buffer(STEREO_STRONG_TEMP_DRY, DEFAULT_LEN_2CH);
            self.rspa.set_buffer(TEMP, LEFT_CH, n_bytes);
            self.rspa
                .set_aux_buffer(STEREO_STRONG_TEMP_DRY, WET_LEFT_CH, STEREO_STRONG_TEMP_WET);
        } else {
            self.rspa.set_buffer(TEMP, LEFT_CH, n_bytes);
            self.rspa.set_aux_buffer(RIGHT_CH, WET_LEFT_CH, WET_RIGHT_CH);
        }

        let steady = target_left == source_left
            && target_right == source_right
            && !params.env_mixer_needs_init;
        if !steady {
            let ramp_left = self
                .ramping
                .get(source_left, target_left, self.buf_len as u32);
            let ramp_right = self
                .ramping
                .get(source_right, target_right, self.buf_len as u32);
            self.rspa.set_volume(Channel::Left, source_left as i16);
            self.rspa.set_volume(Channel::Right, source_right as i16);
            self.rspa
                .set_volume_ramp(Channel::Left, target_left as i16, ramp_left);
            self.rspa
                .set_volume_ramp(Channel::Right, target_right as i16, ramp_right);
            self.rspa
                .set_aux_volume(self.master_volume, (params.reverb_vol as i16) << 8);
        }
        params.env_mixer_needs_init = false;

        if self.use_reverb && params.reverb_vol != 0 {
            self.rspa.env_mixer(!steady, true, &mut state.env_mix);
            if params.stereo_strong_right {
                self.rspa.set_buffer(0, 0, n_bytes);
                self.rspa.mix(-0x8000, STEREO_STRONG_TEMP_DRY, LEFT_CH);
                self.rspa.mix(-0x8000, STEREO_STRONG_TEMP_WET, WET_LEFT_CH);
            } else if params.stereo_strong_left {
                self.rspa.set_buffer(0, 0, n_bytes);
                self.rspa.mix(-0x8000, STEREO_STRONG_TEMP_DRY, RIGHT_CH);
                self.rspa.mix(-0x8000, STEREO_STRONG_TEMP_WET, WET_RIGHT_CH);
            }
        } else {
            self.rspa.env_mixer(!steady, false, &mut state.env_mix);
            if params.stereo_strong_right {
                self.rspa.set_buffer(0, 0, n_bytes);
                self.rspa.mix(-0x8000, STEREO_STRONG_TEMP_DRY, LEFT_CH);
            } else if params.stereo_strong_left {
                self.rspa.set_buffer(0, 0, n_bytes);
                self.rspa.mix(-0x8000, STEREO_STRONG_TEMP_DRY, RIGHT_CH);
            }
        }
    }

    /// Time-shifts the detoured channel by the headset pan delay and mixes it into its dry
    /// channel. A change in delay is absorbed by slightly re-pitching the update.
    fn apply_headset_pan_effects(
        &mut self,
        params: &VoiceParams,
        state: &mut VoiceState,
        note_init: bool,
        pan_settings: u32,
    ) {
        let buf_len = (self.buf_len * 2) as i32;

        let channel = match pan_settings {
            1 | 2 => Channel::new((pan_settings - 1) as u8),
            _ => return,
        };
        let (dest, pan_shift, prev_pan_shift) = match channel {
            Channel::Left => {
                let pan_shift = params.headset_pan_right as i32;
                state.prev_headset_pan_left = 0;
                let prev = state.prev_headset_pan_right as i32;
                state.prev_headset_pan_right = pan_shift as u16;
                (LEFT_CH, pan_shift, prev)
            }
            Channel::Right => {
                let pan_shift = params.headset_pan_left as i32;
                state.prev_headset_pan_right = 0;
                let prev = state.prev_headset_pan_left as i32;
                state.prev_headset_pan_left = pan_shift as u16;
                (RIGHT_CH, pan_shift, prev)
            }
        };

        if !note_init {
            if prev_pan_shift == 0 {
                // no carried samples yet: stage the head of the pan temp as resampler state
                self.rspa.dmem_move(NOTE_PAN_TEMP, TEMP, 8);
                self.rspa.clear_buffer(8, 8);
                self.rspa.dmem_move(NOTE_PAN_TEMP, TEMP + 0x10, 0x10);
                self.rspa.set_buffer(0, TEMP, 32);
                self.rspa.save_buffer(state.pan_resample.as_mut_bytes());
                let pitch = ((buf_len << 0xf) / (buf_len + pan_shift - prev_pan_shift + 8)) as u16;
                self.rspa.set_buffer(
                    NOTE_PAN_TEMP + 8,
                    TEMP,
                    (buf_len + pan_shift - prev_pan_shift) as u16,
                );
                self.rspa
                    .resample(ResampleFlag::Continue, pitch, &mut state.pan_resample);
            } else {
                let pitch = if pan_shift == 0 {
                    ((buf_len << 0xf) / (buf_len - prev_pan_shift - 4)) as u16
                } else {
                    ((buf_len << 0xf) / (buf_len + pan_shift - prev_pan_shift)) as u16
                };
                self.rspa.set_buffer(
                    NOTE_PAN_TEMP,
                    TEMP,
                    (buf_len + pan_shift - prev_pan_shift) as u16,
                );
                self.rspa
                    .resample(ResampleFlag::Continue, pitch, &mut state.pan_resample);
            }

            if prev_pan_shift != 0 {
                // carried samples from the previous update lead the shifted stream
                self.rspa.set_buffer(NOTE_PAN_TEMP, 0, prev_pan_shift as u16);
                self.rspa.load_buffer(state.pan_samples.as_bytes());
                self.rspa.dmem_move(
                    TEMP,
                    NOTE_PAN_TEMP + prev_pan_shift as u16,
                    (buf_len + pan_shift - prev_pan_shift) as u16,
                );
            } else {
                self.rspa
                    .dmem_move(TEMP, NOTE_PAN_TEMP, (buf_len + pan_shift - prev_pan_shift) as u16);
            }
        } else {
            self.rspa.dmem_move(NOTE_PAN_TEMP, TEMP, buf_len as u16);
            self.rspa
                .dmem_move(TEMP, NOTE_PAN_TEMP + pan_shift as u16, buf_len as u16);
            self.rspa.clear_buffer(NOTE_PAN_TEMP, pan_shift as u16);
        }

        if pan_shift != 0 {
            self.rspa
                .set_buffer(0, NOTE_PAN_TEMP + buf_len as u16, pan_shift as u16);
            self.rspa.save_buffer(state.pan_samples.as_mut_bytes());
        }
        self.rspa.set_buffer(0, 0, buf_len as u16);
        self.rspa.mix(0x7fff, NOTE_PAN_TEMP, dest);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_length_tracks_buffered_samples() {
        assert_eq!(samples_for_frame(0), SAMPLES_HIGH);
        assert_eq!(samples_for_frame(SAMPLES_DESIRED - 1), SAMPLES_HIGH);
        assert_eq!(samples_for_frame(SAMPLES_DESIRED), SAMPLES_LOW);
    }

    fn chunks(frame_len: usize, updates: usize) -> Vec<usize> {
        let mut remaining = frame_len;
        let mut out = Vec::new();
        for i in (1..=updates).rev() {
            let chunk = chunk_len(remaining, i);
            remaining -= chunk;
            out.push(chunk);
        }
        out
    }

    #[test]
    fn chunks_cover_the_frame_in_multiples_of_8() {
        assert_eq!(chunks(SAMPLES_HIGH, 4), vec![136, 136, 136, 136]);
        assert_eq!(chunks(SAMPLES_LOW, 4), vec![136, 128, 136, 128]);
        for updates in 1..=MAX_UPDATES_PER_FRAME {
            for frame_len in [SAMPLES_LOW, SAMPLES_HIGH] {
                let chunks = chunks(frame_len, updates);
                assert_eq!(chunks.iter().sum::<usize>(), frame_len);
                for chunk in &chunks[..updates - 1] {
                    assert_eq!(chunk % 8, 0);
                }
            }
        }
    }

    #[test]
    fn config_limits() {
        assert!(matches!(
            Synthesizer::<Reference>::new(SynthesizerConfig {
                voices: MAX_VOICES + 1,
                ..SynthesizerConfig::default()
            }),
            Err(ConfigError::TooManyVoices { count: 57 })
        ));
        assert!(matches!(
            Synthesizer::<Reference>::new(SynthesizerConfig {
                updates_per_frame: 0,
                ..SynthesizerConfig::default()
            }),
            Err(ConfigError::BadUpdateCount { count: 0 })
        ));
        assert!(matches!(
            Synthesizer::<Reference>::new(SynthesizerConfig {
                reverbs: vec![ReverbConfig {
                    window_size: 1024,
                    gain: 0x3000,
                    downsample_rate: 0,
                }],
                ..SynthesizerConfig::default()
            }),
            Err(ConfigError::BadDownsampleRate { index: 0 })
        ));
        assert!(matches!(
            Synthesizer::<Reference>::new(SynthesizerConfig {
                reverbs: vec![ReverbConfig {
                    window_size: 100,
                    gain: 0x3000,
                    downsample_rate: 1,
                }],
                ..SynthesizerConfig::default()
            }),
            Err(ConfigError::ReverbWindowTooShort { index: 0 })
        ));
        assert!(matches!(
            Synthesizer::<Reference>::new(SynthesizerConfig {
                reverbs: vec![ReverbConfig {
                    window_size: 164,
                    gain: 0x3000,
                    downsample_rate: 2,
                }],
                ..SynthesizerConfig::default()
            }),
            Err(ConfigError::UnalignedReverbWindow { index: 0 })
        ));
    }
}
