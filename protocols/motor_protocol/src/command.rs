//! Console command grammar.
//!
//! One command per line, keyword case-insensitive, at most one decimal
//! argument separated by blanks:
//!
//! ```text
//! START [step]    sweep capture, step clamped to 1..=100 (default 20)
//! PWM <duty>      manual duty, clamped to 0..=100
//! STOP
//! CAPTURE
//! DUMP
//! DELETE
//! ```

use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{digit1, one_of, space1},
    combinator::{eof, map, opt, value},
    sequence::{pair, preceded, terminated},
    IResult,
};
use thiserror::Error;

use crate::MAX_DUTY;

/// Step used by `START` without an argument.
pub const DEFAULT_STEP: u8 = 20;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start { step: u8 },
    Pwm { duty: u8 },
    Stop,
    Capture,
    Dump,
    Delete,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command")]
    Unknown,
    #[error("malformed command")]
    Malformed,
}

#[derive(Clone, Copy)]
enum Keyword {
    Start,
    Stop,
    Pwm,
    Capture,
    Dump,
    Delete,
}

fn keyword(input: &[u8]) -> IResult<&[u8], Keyword> {
    alt((
        value(Keyword::Start, tag_no_case("START")),
        value(Keyword::Stop, tag_no_case("STOP")),
        value(Keyword::Pwm, tag_no_case("PWM")),
        value(Keyword::Capture, tag_no_case("CAPTURE")),
        value(Keyword::Dump, tag_no_case("DUMP")),
        value(Keyword::Delete, tag_no_case("DELETE")),
    ))(input)
}

/// Signed decimal that saturates at the `i32` range instead of failing.
fn decimal(input: &[u8]) -> IResult<&[u8], i32> {
    map(pair(opt(one_of("+-")), digit1), |(sign, digits): (_, &[u8])| {
        let magnitude = digits.iter().fold(0i32, |acc, &d| {
            acc.saturating_mul(10).saturating_add(i32::from(d - b'0'))
        });
        if sign == Some('-') {
            -magnitude
        } else {
            magnitude
        }
    })(input)
}

fn argument(input: &[u8]) -> IResult<&[u8], Option<i32>> {
    terminated(opt(preceded(space1, decimal)), eof)(input)
}

fn clamp(value: i32, min: u8, max: u8) -> u8 {
    value.clamp(i32::from(min), i32::from(max)) as u8
}

impl Command {
    /// Parse one console line (terminator already removed).
    pub fn parse(line: &[u8]) -> Result<Self, CommandError> {
        let line = line.trim_ascii();
        let (rest, keyword) = keyword(line).map_err(|_| CommandError::Unknown)?;

        // "STARTX" is a different word, not START with a bad argument.
        if rest.first().is_some_and(|b| !b.is_ascii_whitespace()) {
            return Err(CommandError::Unknown);
        }

        let (_, arg) = argument(rest).map_err(|_| CommandError::Malformed)?;

        match (keyword, arg) {
            (Keyword::Start, None) => Ok(Command::Start { step: DEFAULT_STEP }),
            (Keyword::Start, Some(step)) => Ok(Command::Start {
                step: clamp(step, 1, MAX_DUTY),
            }),
            (Keyword::Pwm, Some(duty)) => Ok(Command::Pwm {
                duty: clamp(duty, 0, MAX_DUTY),
            }),
            (Keyword::Pwm, None) => Err(CommandError::Malformed),
            (Keyword::Stop, None) => Ok(Command::Stop),
            (Keyword::Capture, None) => Ok(Command::Capture),
            (Keyword::Dump, None) => Ok(Command::Dump),
            (Keyword::Delete, None) => Ok(Command::Delete),
            (_, Some(_)) => Err(CommandError::Malformed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_with_step() {
        assert_eq!(Command::parse(b"START 10"), Ok(Command::Start { step: 10 }));
    }

    #[test]
    fn start_defaults_step() {
        assert_eq!(Command::parse(b"START"), Ok(Command::Start { step: 20 }));
    }

    #[test]
    fn start_step_is_clamped() {
        assert_eq!(Command::parse(b"START 0"), Ok(Command::Start { step: 1 }));
        assert_eq!(Command::parse(b"START 500"), Ok(Command::Start { step: 100 }));
        assert_eq!(Command::parse(b"START -3"), Ok(Command::Start { step: 1 }));
        assert_eq!(
            Command::parse(b"START 3000000000"),
            Ok(Command::Start { step: 100 })
        );
        assert_eq!(
            Command::parse(b"START -99999999999"),
            Ok(Command::Start { step: 1 })
        );
    }

    #[test]
    fn pwm_is_clamped_not_rejected() {
        assert_eq!(Command::parse(b"PWM 150"), Ok(Command::Pwm { duty: 100 }));
        assert_eq!(Command::parse(b"PWM -20"), Ok(Command::Pwm { duty: 0 }));
        assert_eq!(Command::parse(b"PWM 42"), Ok(Command::Pwm { duty: 42 }));
        assert_eq!(Command::parse(b"PWM +7"), Ok(Command::Pwm { duty: 7 }));
        assert_eq!(
            Command::parse(b"PWM 99999999999"),
            Ok(Command::Pwm { duty: 100 })
        );
    }

    #[test]
    fn keyword_is_case_insensitive_and_trimmed() {
        assert_eq!(Command::parse(b"  pwm\t55 "), Ok(Command::Pwm { duty: 55 }));
        assert_eq!(Command::parse(b"Stop"), Ok(Command::Stop));
        assert_eq!(Command::parse(b"dump"), Ok(Command::Dump));
        assert_eq!(Command::parse(b"DELETE"), Ok(Command::Delete));
        assert_eq!(Command::parse(b"capture"), Ok(Command::Capture));
    }

    #[test]
    fn pwm_requires_a_value() {
        assert_eq!(Command::parse(b"PWM"), Err(CommandError::Malformed));
    }

    #[test]
    fn non_numeric_argument_is_malformed() {
        assert_eq!(Command::parse(b"PWM fast"), Err(CommandError::Malformed));
        assert_eq!(Command::parse(b"START 10x"), Err(CommandError::Malformed));
        assert_eq!(Command::parse(b"START 10 20"), Err(CommandError::Malformed));
    }

    #[test]
    fn argument_on_bare_command_is_malformed() {
        assert_eq!(Command::parse(b"STOP 3"), Err(CommandError::Malformed));
    }

    #[test]
    fn unknown_words() {
        assert_eq!(Command::parse(b""), Err(CommandError::Unknown));
        assert_eq!(Command::parse(b"HELLO"), Err(CommandError::Unknown));
        assert_eq!(Command::parse(b"STARTX"), Err(CommandError::Unknown));
        assert_eq!(Command::parse(b"PWM50"), Err(CommandError::Unknown));
    }
}
