//! Microphone level from raw ADC readings.

use core::f32::consts::SQRT_2;

use heapless::Vec;
#[cfg_attr(test, allow(unused_imports))]
use micromath::F32Ext;

/// ADC reference voltage.
pub const VREF: f32 = 3.3;
/// Full-scale count of the 12-bit converter.
pub const ADC_MAX: u16 = 4095;
/// Levels below this RMS voltage read as silence.
pub const SILENCE_RMS: f32 = 0.001;
/// Reported level of silence.
pub const FLOOR_DBFS: f32 = -100.0;

/// RMS of a full-scale sine centred at VREF/2.
const FULL_SCALE_RMS: f32 = (VREF / 2.0) / SQRT_2;

/// Convert a 12-bit reading to volts.
pub fn volts(raw: u16) -> f32 {
    raw as f32 / ADC_MAX as f32 * VREF
}

/// Level relative to full scale, in dB.
pub fn dbfs(rms: f32) -> f32 {
    if rms < SILENCE_RMS {
        return FLOOR_DBFS;
    }
    20.0 * (rms / FULL_SCALE_RMS).log10()
}

/// Collects up to `N` voltage samples and reports their AC RMS.
pub struct LevelMeter<const N: usize> {
    samples: Vec<f32, N>,
}

impl<const N: usize> Default for LevelMeter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LevelMeter<N> {
    pub const fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Returns `false` once the window is full; the sample is dropped.
    pub fn push(&mut self, volts: f32) -> bool {
        self.samples.push(volts).is_ok()
    }

    pub fn is_full(&self) -> bool {
        self.samples.is_full()
    }

    /// RMS with the DC offset (the window mean) removed. Zero when empty.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let n = self.samples.len() as f32;
        let offset = self.samples.iter().sum::<f32>() / n;
        let power = self
            .samples
            .iter()
            .map(|v| (v - offset) * (v - offset))
            .sum::<f32>()
            / n;
        power.sqrt()
    }

    pub fn dbfs(&self) -> f32 {
        dbfs(self.rms())
    }
}
