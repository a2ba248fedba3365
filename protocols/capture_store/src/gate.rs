use nmea_protocol::GpsFix;

/// Decides whether a capture may go ahead with the current GPS position.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixGate {
    /// Give up after waiting this long for a usable fix.
    pub timeout_ms: u32,
    /// Fixes older than this are stale.
    pub max_age_ms: u32,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixWait {
    Ready,
    Waiting,
    TimedOut,
}

impl Default for FixGate {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_age_ms: 2_000,
        }
    }
}

impl FixGate {
    /// `fix_age_ms` is `None` when no sentence has been parsed yet.
    pub fn check(&self, fix: &GpsFix, fix_age_ms: Option<u32>, waited_ms: u32) -> FixWait {
        let fresh = fix_age_ms.is_some_and(|age| age <= self.max_age_ms);
        if fix.valid_fix && fresh {
            FixWait::Ready
        } else if waited_ms >= self.timeout_ms {
            FixWait::TimedOut
        } else {
            FixWait::Waiting
        }
    }
}
