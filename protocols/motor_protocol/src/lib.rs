#![cfg_attr(not(test), no_std)]

//! Motor characterization: console commands, encoder pulse counting and the
//! duty-sweep state machine.

#[macro_use]
mod log;

pub mod characterizer;
pub mod command;
pub mod config;
pub mod debounce;
pub mod encoder;

pub use characterizer::{Characterizer, Mode, Sample, EXPORT_END, EXPORT_HEADER};
pub use command::{Command, CommandError};
pub use config::Config;
pub use debounce::Debouncer;
pub use encoder::{rpm, PulseCounter};

/// Upper bound of every duty cycle handled here, in percent.
pub const MAX_DUTY: u8 = 100;

/// PWM output driving the motor.
pub trait MotorDriver {
    /// `percent` is already clamped to `0..=MAX_DUTY`.
    fn set_duty(&mut self, percent: u8);
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleFull;

/// Line-oriented operator console.
pub trait Console {
    /// Queue one line (without terminator). A line is either queued whole or
    /// refused with [`ConsoleFull`].
    fn send_line(&mut self, line: &str) -> Result<(), ConsoleFull>;
}
