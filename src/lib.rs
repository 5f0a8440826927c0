//! Emulation of the RSP audio microcode.
//!
//! The crate is split into the op machine and the driver that sits on top of it:
//! [`Rspa`] emulates the audio processing ops against a scratch memory, and
//! [`Synthesizer`] reproduces the frame driver that schedules voices, reverb and
//! interleaving through those ops.

mod dmem;
mod mixer;
mod ramping;
mod reverb;
mod synth;
mod util;
mod voice;

pub use dmem::{DEFAULT_LEN_1CH, DEFAULT_LEN_2CH, DMEM_LEN, Dmem};
pub use mixer::{
    AdpcmState, AdpcmTable, Buffers, Channel, DecodeFlag, EnvMixState, Kernels, Reference,
    ResampleFlag, ResampleState, Rspa, Volume,
};
pub use reverb::ReverbConfig;
pub use synth::{
    BankError, ConfigError, MAX_BANKS, MAX_REVERBS, MAX_UPDATES_PER_FRAME, MAX_VOICES,
    OUTPUT_RATE, SAMPLES_DESIRED, SAMPLES_HIGH, SAMPLES_LOW, Synthesizer, SynthesizerConfig,
    samples_for_frame,
};
pub use voice::{AdpcmBook, AdpcmLoop, AdpcmSample, Voice, VoiceParams, VoiceSource};
