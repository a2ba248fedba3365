/// Timing and encoder constants of the bench.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Encoder slots per shaft revolution.
    pub pulses_per_revolution: u16,
    /// Sampling period while capturing.
    pub sample_interval_ms: u32,
    /// Time each duty step is held while capturing.
    pub step_interval_ms: u32,
    /// Speed report period in manual mode.
    pub report_interval_ms: u32,
    /// Samples closer than this to a duty step are skipped; 0 keeps them all.
    pub settle_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            pulses_per_revolution: 20,
            sample_interval_ms: 4,
            step_interval_ms: 2000,
            report_interval_ms: 500,
            settle_ms: 0,
        }
    }

    pub const fn with_pulses_per_revolution(mut self, pulses: u16) -> Self {
        self.pulses_per_revolution = pulses;
        self
    }

    pub const fn with_sample_interval(mut self, ms: u32) -> Self {
        self.sample_interval_ms = ms;
        self
    }

    pub const fn with_step_interval(mut self, ms: u32) -> Self {
        self.step_interval_ms = ms;
        self
    }

    pub const fn with_report_interval(mut self, ms: u32) -> Self {
        self.report_interval_ms = ms;
        self
    }

    pub const fn with_settle_time(mut self, ms: u32) -> Self {
        self.settle_ms = ms;
        self
    }
}
