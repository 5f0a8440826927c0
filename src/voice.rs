//! Voice records fed to the synthesizer.
//!
//! [`VoiceParams`] is the caller-facing half, rewritten by the playback layer between
//! frames. [`VoiceState`] is the synthesis-side half and persists across updates.

use crate::mixer::{AdpcmState, EnvMixState, ResampleState};
use std::sync::Arc;

/// Predictor book of an ADPCM sample.
pub struct AdpcmBook {
    pub order: u32,
    pub npredictors: u32,
    /// `8 * order * npredictors` halfwords.
    pub table: Vec<i16>,
}

/// Loop points of an ADPCM sample, in samples from the start of the data.
///
/// `end` doubles as the end of the sample when `count` is zero. `state` snapshots the
/// decoder history at the loop start.
pub struct AdpcmLoop {
    pub start: u32,
    pub end: u32,
    pub count: u32,
    pub state: [i16; 16],
}

pub struct AdpcmSample {
    pub book: Arc<AdpcmBook>,
    pub loop_info: AdpcmLoop,
    /// Compressed frames, 9 bytes per 16 samples.
    pub data: Arc<[u8]>,
}

#[derive(Clone)]
pub enum VoiceSource {
    Adpcm(Arc<AdpcmSample>),
    /// A 64-sample wavetable, repeated.
    Wave(Arc<[i16; 64]>),
}

/// Per-frame voice settings.
pub struct VoiceParams {
    pub enabled: bool,
    /// Set when the voice (re)starts; cleared by the first update.
    pub needs_init: bool,
    /// Forces the envelope ramp to be rebuilt on the next update.
    pub env_mixer_needs_init: bool,
    /// Playback rate as a ratio of the output rate. Clamped to just under 4.
    pub frequency: f32,
    /// Capped at `0x7fff` when loaded into the volume registers.
    pub target_vol_left: u16,
    pub target_vol_right: u16,
    /// Wet send, in 256ths of full scale.
    pub reverb_vol: u8,
    /// Which reverb the wet send feeds. Out of range runs the voice dry.
    pub reverb_index: u8,
    /// Sample bank this voice's data lives in.
    pub bank_id: u8,
    pub stereo_strong_left: bool,
    pub stereo_strong_right: bool,
    pub uses_headset_pan_effects: bool,
    /// Delay of the opposite channel, in scratch bytes (two per sample).
    pub headset_pan_left: u8,
    pub headset_pan_right: u8,
    pub source: Option<VoiceSource>,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            enabled: false,
            needs_init: false,
            env_mixer_needs_init: false,
            frequency: 1.0,
            target_vol_left: 0,
            target_vol_right: 0,
            reverb_vol: 0,
            reverb_index: 0,
            bank_id: 0,
            stereo_strong_left: false,
            stereo_strong_right: false,
            uses_headset_pan_effects: false,
            headset_pan_left: 0,
            headset_pan_right: 0,
            source: None,
        }
    }
}

#[derive(Default)]
pub struct VoiceState {
    pub(crate) sample_pos_int: u32,
    pub(crate) sample_pos_frac: u16,
    pub(crate) cur_vol_left: u16,
    pub(crate) cur_vol_right: u16,
    pub(crate) prev_headset_pan_left: u16,
    pub(crate) prev_headset_pan_right: u16,
    pub(crate) restart: bool,
    pub(crate) finished: bool,
    pub(crate) adpcm: AdpcmState,
    pub(crate) final_resample: ResampleState,
    pub(crate) env_mix: EnvMixState,
    pub(crate) pan_resample: ResampleState,
    pub(crate) pan_samples: [i16; 32],
}

#[derive(Default)]
pub struct Voice {
    pub params: VoiceParams,
    pub(crate) state: VoiceState,
}

impl Voice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the voice to start playing `source` on the next update.
    pub fn enable(&mut self, source: VoiceSource) {
        self.params.enabled = true;
        self.params.needs_init = true;
        self.params.env_mixer_needs_init = true;
        self.params.source = Some(source);
        self.state.finished = false;
    }

    pub fn disable(&mut self) {
        self.params.enabled = false;
        self.params.needs_init = false;
    }

    pub fn enabled(&self) -> bool {
        self.params.enabled
    }

    /// Whether the voice ran out of sample data and shut itself off.
    pub fn finished(&self) -> bool {
        self.state.finished
    }
}
