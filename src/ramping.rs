//! Exponential volume ramp factors for the envelope mixer.
//!
//! The envelope mixer multiplies its volume by a fixed point rate once per 8 samples. The
//! rate that carries `source` to `target` over an update is `(target / source)^(8 / n)`;
//! these tables precompute it as `lhs[target >> 8] * rhs[source >> 8]`, bucketed by the
//! three update lengths the frame driver produces.

use crate::util::boxed_array;

struct RampTable {
    lhs: Box<[f32; 256]>,
    rhs: Box<[f32; 256]>,
}

impl RampTable {
    fn new(n_samples: u32) -> Self {
        let exp = 8.0 / n_samples as f32;
        let mut lhs = boxed_array(0f32);
        let mut rhs = boxed_array(0f32);
        for i in 0..256u32 {
            let v = (i << 8).max(1) as f32;
            lhs[i as usize] = 65536.0 * v.powf(exp);
            rhs[i as usize] = v.powf(-exp);
        }
        Self { lhs, rhs }
    }

    fn get(&self, source: u16, target: u16) -> i32 {
        (self.lhs[(target >> 8) as usize] * self.rhs[(source >> 8) as usize]) as i32
    }
}

pub struct VolRamping {
    n128: RampTable,
    n136: RampTable,
    n144: RampTable,
}

impl VolRamping {
    pub fn new() -> Self {
        Self {
            n128: RampTable::new(128),
            n136: RampTable::new(136),
            n144: RampTable::new(144),
        }
    }

    /// Per-group rate carrying `source` to `target` over `n_samples` samples.
    pub fn get(&self, source: u16, target: u16, n_samples: u32) -> i32 {
        let table = match n_samples {
            128 => &self.n128,
            144 => &self.n144,
            _ => &self.n136,
        };
        table.get(source, target)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn direction() {
        let ramping = VolRamping::new();
        assert!(ramping.get(0x1000, 0x8000, 136) > 0x10000);
        assert!(ramping.get(0x8000, 0x1000, 136) < 0x10000);
    }

    #[test]
    fn steady_is_near_unity() {
        let ramping = VolRamping::new();
        for n in [128, 136, 144] {
            let rate = ramping.get(0x4000, 0x4000, n);
            assert!((rate - 0x10000).abs() <= 2, "rate {rate:#x}");
        }
    }

    #[test]
    fn longer_updates_ramp_slower() {
        let ramping = VolRamping::new();
        assert!(ramping.get(0x1000, 0x8000, 144) < ramping.get(0x1000, 0x8000, 128));
    }
}
