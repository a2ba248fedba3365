//! Serial line framing shared by the GPS and console ports.

use heapless::Vec;

/// Collects bytes into newline-terminated lines of at most `N` bytes.
///
/// Carriage returns are dropped. A line that does not fit is thrown away
/// entirely, up to and including its terminating `\n`.
pub struct LineBuffer<const N: usize> {
    buf: Vec<u8, N>,
    overflowed: bool,
    ready: bool,
}

impl<const N: usize> Default for LineBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LineBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            overflowed: false,
            ready: false,
        }
    }

    /// Feed one byte. Returns the completed line when `byte` is `\n`.
    ///
    /// Empty lines and overflowed lines yield `None`.
    pub fn push(&mut self, byte: u8) -> Option<&[u8]> {
        if self.ready {
            self.buf.clear();
            self.ready = false;
        }

        match byte {
            b'\r' => None,
            b'\n' => {
                if self.overflowed {
                    self.overflowed = false;
                    self.buf.clear();
                    return None;
                }
                if self.buf.is_empty() {
                    return None;
                }
                self.ready = true;
                Some(self.buf.as_slice())
            }
            _ => {
                if !self.overflowed && self.buf.push(byte).is_err() {
                    self.overflowed = true;
                    self.buf.clear();
                }
                None
            }
        }
    }
}
