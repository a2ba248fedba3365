/// Time-based debouncer for a push button interrupt.
pub struct Debouncer {
    window_ms: u32,
    last_ms: Option<u32>,
}

impl Debouncer {
    pub const fn new(window_ms: u32) -> Self {
        Self {
            window_ms,
            last_ms: None,
        }
    }

    /// Returns true if the edge at `now_ms` counts as a new press.
    pub fn accept(&mut self, now_ms: u32) -> bool {
        match self.last_ms {
            Some(last) if now_ms.wrapping_sub(last) <= self.window_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }
}
