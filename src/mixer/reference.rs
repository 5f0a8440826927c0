//! Scalar implementation of the sample loops.

use super::{AdpcmState, AdpcmTable, Buffers, EnvMixState, Kernels, ResampleFlag, ResampleState};
use super::{clamp16, clamp32};
use crate::dmem::Dmem;

/// 4-tap interpolation coefficients for each of the 64 fractional phases.
#[rustfmt::skip]
const RESAMPLE_TABLE: [[i16; 4]; 64] = [
    [0x0c39, 0x66ad, 0x0d46, -0x0021], [0x0b39, 0x6696, 0x0e5f, -0x0028],
    [0x0a44, 0x6669, 0x0f83, -0x0030], [0x095a, 0x6626, 0x10b4, -0x0038],
    [0x087d, 0x65cd, 0x11f0, -0x0041], [0x07ab, 0x655e, 0x1338, -0x004a],
    [0x06e4, 0x64d9, 0x148c, -0x0054], [0x0628, 0x643f, 0x15eb, -0x005f],
    [0x0577, 0x638f, 0x1756, -0x006a], [0x04d1, 0x62cb, 0x18cb, -0x0076],
    [0x0435, 0x61f3, 0x1a4c, -0x0082], [0x03a4, 0x6106, 0x1bd7, -0x008f],
    [0x031c, 0x6007, 0x1d6c, -0x009c], [0x029f, 0x5ef5, 0x1f0b, -0x00aa],
    [0x022a, 0x5dd0, 0x20b3, -0x00b8], [0x01be, 0x5c9a, 0x2264, -0x00c6],
    [0x015b, 0x5b53, 0x241e, -0x00d4], [0x0101, 0x59fc, 0x25e0, -0x00e2],
    [0x00ae, 0x5896, 0x27a9, -0x00f0], [0x0063, 0x5720, 0x297a, -0x00fe],
    [0x001f, 0x559d, 0x2b50, -0x010c], [-0x001e, 0x540d, 0x2d2c, -0x0118],
    [-0x0054, 0x5270, 0x2f0d, -0x0125], [-0x0084, 0x50c7, 0x30f3, -0x0130],
    [-0x00ad, 0x4f14, 0x32dc, -0x013a], [-0x00d2, 0x4d57, 0x34c8, -0x0143],
    [-0x00f1, 0x4b91, 0x36b6, -0x014a], [-0x010b, 0x49c2, 0x38a5, -0x0150],
    [-0x0121, 0x47ed, 0x3a95, -0x0154], [-0x0132, 0x4611, 0x3c85, -0x0155],
    [-0x0140, 0x4430, 0x3e74, -0x0154], [-0x014a, 0x424a, 0x4060, -0x0151],
    [-0x0151, 0x4060, 0x424a, -0x014a], [-0x0154, 0x3e74, 0x4430, -0x0140],
    [-0x0155, 0x3c85, 0x4611, -0x0132], [-0x0154, 0x3a95, 0x47ed, -0x0121],
    [-0x0150, 0x38a5, 0x49c2, -0x010b], [-0x014a, 0x36b6, 0x4b91, -0x00f1],
    [-0x0143, 0x34c8, 0x4d57, -0x00d2], [-0x013a, 0x32dc, 0x4f14, -0x00ad],
    [-0x0130, 0x30f3, 0x50c7, -0x0084], [-0x0125, 0x2f0d, 0x5270, -0x0054],
    [-0x0118, 0x2d2c, 0x540d, -0x001e], [-0x010c, 0x2b50, 0x559d, 0x001f],
    [-0x00fe, 0x297a, 0x5720, 0x0063], [-0x00f0, 0x27a9, 0x5896, 0x00ae],
    [-0x00e2, 0x25e0, 0x59fc, 0x0101], [-0x00d4, 0x241e, 0x5b53, 0x015b],
    [-0x00c6, 0x2264, 0x5c9a, 0x01be], [-0x00b8, 0x20b3, 0x5dd0, 0x022a],
    [-0x00aa, 0x1f0b, 0x5ef5, 0x029f], [-0x009c, 0x1d6c, 0x6007, 0x031c],
    [-0x008f, 0x1bd7, 0x6106, 0x03a4], [-0x0082, 0x1a4c, 0x61f3, 0x0435],
    [-0x0076, 0x18cb, 0x62cb, 0x04d1], [-0x006a, 0x1756, 0x638f, 0x0577],
    [-0x005f, 0x15eb, 0x643f, 0x0628], [-0x0054, 0x148c, 0x64d9, 0x06e4],
    [-0x004a, 0x1338, 0x655e, 0x07ab], [-0x0041, 0x11f0, 0x65cd, 0x087d],
    [-0x0038, 0x10b4, 0x6626, 0x095a], [-0x0030, 0x0f83, 0x6669, 0x0a44],
    [-0x0028, 0x0e5f, 0x6696, 0x0b39], [-0x0021, 0x0d46, 0x66ad, 0x0c39],
];

#[inline(always)]
fn sign_extend_nibble(nibble: u8) -> i32 {
    ((nibble as i32) << 28) >> 28
}

/// Scalar backend.
pub struct Reference;

impl Kernels for Reference {
    fn adpcm_dec(
        dmem: &mut Dmem,
        out: u16,
        nbytes: u16,
        table: &AdpcmTable,
        compressed: &[u8],
        state: &mut AdpcmState,
    ) {
        let samples = dmem.all_mut();
        let mut src = 0;
        let mut pos = out as usize / 2;
        let mut nbytes = nbytes as i32;

        while nbytes > 0 {
            let header = compressed[src];
            src += 1;
            let shift = header >> 4;
            let tbl = &table[(header & 0xf) as usize];

            for _ in 0..2 {
                let mut ins = [0i16; 8];
                for j in 0..4 {
                    let byte = compressed[src];
                    src += 1;
                    ins[j * 2] = (sign_extend_nibble(byte >> 4) << shift) as i16;
                    ins[j * 2 + 1] = (sign_extend_nibble(byte & 0xf) << shift) as i16;
                }

                let prev1 = samples[pos - 1] as i32;
                let prev2 = samples[pos - 2] as i32;
                for j in 0..8 {
                    let mut acc = (tbl[0][j] as i32)
                        .wrapping_mul(prev2)
                        .wrapping_add((tbl[1][j] as i32).wrapping_mul(prev1))
                        .wrapping_add((ins[j] as i32) << 11);
                    for k in 0..j {
                        acc = acc.wrapping_add((tbl[1][j - k - 1] as i32) * ins[k] as i32);
                    }
                    samples[pos] = clamp16(acc >> 11);
                    pos += 1;
                }
            }

            nbytes -= 32;
        }

        state.copy_from_slice(&samples[pos - 16..pos]);
    }

    fn resample(
        dmem: &mut Dmem,
        input: u16,
        output: u16,
        nbytes: u16,
        flag: ResampleFlag,
        pitch: u16,
        state: &mut ResampleState,
    ) {
        let samples = dmem.all_mut();
        let in_initial = (input / 2) as i32;
        let mut pos = in_initial;
        let mut out = (output / 2) as usize;
        let mut nbytes = nbytes as i32;

        let mut tmp = state.data;
        if flag == ResampleFlag::Init {
            tmp[..5].fill(0);
        }
        if flag == ResampleFlag::Rewind {
            for (i, &sample) in tmp[8..16].iter().enumerate() {
                samples[(pos - 8) as usize + i] = sample;
            }
            pos -= tmp[5] as i32 / 2;
        }

        // stage history right before the input window
        pos -= 4;
        let mut acc = (tmp[4] as u16) as u32;
        for (i, &sample) in tmp[..4].iter().enumerate() {
            samples[pos as usize + i] = sample;
        }

        loop {
            for _ in 0..8 {
                let tbl = &RESAMPLE_TABLE[(acc * 64 >> 16) as usize];
                let mut sample = 0i32;
                for (t, &coef) in tbl.iter().enumerate() {
                    sample += (samples[pos as usize + t] as i32 * coef as i32 + 0x4000) >> 15;
                }
                samples[out] = clamp16(sample);
                out += 1;

                acc += (pitch as u32) << 1;
                pos += (acc >> 16) as i32;
                acc %= 0x10000;
            }

            nbytes -= 16;
            if nbytes <= 0 {
                break;
            }
        }

        state.data[4] = acc as i16;
        for i in 0..4 {
            state.data[i] = samples[pos as usize + i];
        }
        let mut rewind = (pos - in_initial + 4) & 7;
        pos -= rewind;
        if rewind != 0 {
            rewind = -8 - rewind;
        }
        state.data[5] = rewind as i16;
        for i in 0..8 {
            state.data[8 + i] = samples[pos as usize + i];
        }
    }

    fn env_mixer(
        dmem: &mut Dmem,
        buffers: Buffers,
        nbytes: u16,
        aux: bool,
        state: &mut EnvMixState,
    ) {
        let samples = dmem.all_mut();
        let mut input = (buffers.input / 2) as usize;
        let mut dry = [
            (buffers.output / 2) as usize,
            (buffers.dry_right / 2) as usize,
        ];
        let mut wet = [
            (buffers.wet_left / 2) as usize,
            (buffers.wet_right / 2) as usize,
        ];
        let mut nbytes = nbytes as i32;

        loop {
            for c in 0..2 {
                for i in 0..8 {
                    let target = state.target[c] as i32;
                    if state.rate[c] >> 16 > 0 {
                        // ramping up
                        if state.vols[c][i] >> 16 > target {
                            state.vols[c][i] = target << 16;
                        }
                    } else if state.vols[c][i] >> 16 < target {
                        state.vols[c][i] = target << 16;
                    }

                    let vol = state.vols[c][i] >> 16;
                    let sample = samples[input + i] as i32;
                    let dry_gain = (vol * state.vol_dry as i32 + 0x4000) >> 15;
                    samples[dry[c] + i] = clamp16(
                        (samples[dry[c] + i] as i32 * 0x7fff + sample * dry_gain + 0x4000) >> 15,
                    );
                    if aux {
                        let wet_gain = (vol * state.vol_wet as i32 + 0x4000) >> 15;
                        samples[wet[c] + i] = clamp16(
                            (samples[wet[c] + i] as i32 * 0x7fff + sample * wet_gain + 0x4000)
                                >> 15,
                        );
                    }
                    state.vols[c][i] = clamp32(state.vols[c][i] as i64 * state.rate[c] as i64 >> 16);
                }

                dry[c] += 8;
                if aux {
                    wet[c] += 8;
                }
            }

            nbytes -= 16;
            input += 8;
            if nbytes <= 0 {
                break;
            }
        }
    }

    fn mix(dmem: &mut Dmem, gain: i16, input: u16, output: u16, nbytes: u16) {
        let samples = dmem.all_mut();
        let mut input = (input / 2) as usize;
        let mut output = (output / 2) as usize;
        let mut nbytes = nbytes as i32;

        if gain == -0x8000 {
            while nbytes > 0 {
                for _ in 0..16 {
                    let sample = samples[output] as i32 - samples[input] as i32;
                    samples[output] = clamp16(sample);
                    input += 1;
                    output += 1;
                }
                nbytes -= 32;
            }
            return;
        }

        while nbytes > 0 {
            for _ in 0..16 {
                let sample = (samples[output] as i32 * 0x7fff
                    + samples[input] as i32 * gain as i32
                    + 0x4000)
                    >> 15;
                samples[output] = clamp16(sample);
                input += 1;
                output += 1;
            }
            nbytes -= 32;
        }
    }

    fn interleave(dmem: &mut Dmem, left: u16, right: u16, output: u16, nbytes: u16) {
        let samples = dmem.all_mut();
        let mut l = (left / 2) as usize;
        let mut r = (right / 2) as usize;
        let mut d = (output / 2) as usize;
        let mut count = nbytes as usize / 2 / 8;

        // both channels are read in full before writing, since the destination may overlap
        while count > 0 {
            let mut ls = [0i16; 8];
            let mut rs = [0i16; 8];
            ls.copy_from_slice(&samples[l..l + 8]);
            rs.copy_from_slice(&samples[r..r + 8]);
            for i in 0..8 {
                samples[d + 2 * i] = ls[i];
                samples[d + 2 * i + 1] = rs[i];
            }
            l += 8;
            r += 8;
            d += 16;
            count -= 1;
        }
    }

    fn interleave_and_copy(dmem: &Dmem, left: u16, right: u16, nbytes: u16, out: &mut [i16]) {
        let samples = dmem.all();
        let mut l = (left / 2) as usize;
        let mut r = (right / 2) as usize;
        let mut d = 0;
        // the rounded byte count may run past a short tail buffer
        let mut count = (nbytes as usize / 2 / 8).min(out.len() / 16);

        while count > 0 {
            for i in 0..8 {
                out[d + 2 * i] = samples[l + i];
                out[d + 2 * i + 1] = samples[r + i];
            }
            l += 8;
            r += 8;
            d += 16;
            count -= 1;
        }
    }
}
