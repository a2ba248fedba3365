#![cfg_attr(not(test), no_std)]

mod line;

pub use line::LineBuffer;

use heapless::Vec;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{char, digit0, digit1, multispace0, one_of};
use nom::combinator::{map, opt, recognize, value};
use nom::sequence::{pair, preceded, tuple};
use nom::IResult;

/// Most fields read out of one sentence; the rest of the line is ignored.
pub const MAX_FIELDS: usize = 20;
/// Longer fields are cut to this many bytes.
pub const MAX_FIELD_LEN: usize = 19;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn from_letter(letter: u8) -> Option<Self> {
        match letter {
            b'N' => Some(Direction::North),
            b'S' => Some(Direction::South),
            b'E' => Some(Direction::East),
            b'W' => Some(Direction::West),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UtcTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UtcDate {
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

/// Fix record filled in by [`Nmea::parse_line`].
///
/// Which fields a sentence touches depends on its type; everything else keeps
/// whatever the caller put there.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub valid_fix: bool,
    /// Decimal degrees, negative in the southern hemisphere.
    pub latitude: f64,
    pub lat_dir: Option<Direction>,
    /// Decimal degrees, negative west of Greenwich.
    pub longitude: f64,
    pub lon_dir: Option<Direction>,
    pub time: UtcTime,
    pub date: UtcDate,
    pub satellites: u8,
    /// Metres above mean sea level.
    pub altitude: f64,
    /// 0 = no fix, 1 = GPS, 2 = DGPS, ...
    pub fix_quality: u8,
}

#[cfg(feature = "defmt")]
impl defmt::Format for GpsFix {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "GpsFix: valid: {}, latitude: {} {}, longitude: {} {}, time: {}, date: {}, sats: {}, alt: {}, quality: {}",
            self.valid_fix,
            self.latitude,
            self.lat_dir,
            self.longitude,
            self.lon_dir,
            self.time,
            self.date,
            self.satellites,
            self.altitude,
            self.fix_quality,
        );
    }
}

/// Sentence types the parser understands.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentence {
    Rmc,
    Gga,
    Gll,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NmeaError {
    #[error("empty line")]
    Empty,
    #[error("line does not start with '$'")]
    MissingStart,
    #[error("unsupported sentence type")]
    Unsupported,
    #[error("receiver reports no fix")]
    NoFix,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// No `*hh` suffix.
    Absent,
    Match,
    Mismatch { expected: u8, computed: u8 },
}

type Fields<'a> = Vec<&'a [u8], MAX_FIELDS>;

pub struct Nmea;

impl Nmea {
    fn parse_sentence_type(input: &[u8]) -> IResult<&[u8], Sentence> {
        alt((
            value(Sentence::Rmc, tag("$GPRMC")),
            value(Sentence::Gga, tag("$GPGGA")),
            value(Sentence::Gll, tag("$GNGLL")),
        ))(input)
    }

    fn split_fields(line: &[u8]) -> Fields<'_> {
        let mut fields = Fields::new();
        let mut rest = line;
        while !rest.is_empty() && !fields.is_full() {
            let end = rest
                .iter()
                .position(|&b| b == b',' || b == b'*')
                .unwrap_or(rest.len());
            let _ = fields.push(&rest[..end.min(MAX_FIELD_LEN)]);
            rest = rest.get(end + 1..).unwrap_or(&[]);
        }
        fields
    }

    fn field<'a>(fields: &Fields<'a>, index: usize) -> &'a [u8] {
        fields.get(index).copied().unwrap_or(&[])
    }

    /// Leading decimal number of `field`, or zero.
    fn leading_float(field: &[u8]) -> f64 {
        Self::float_prefix(field)
            .ok()
            .and_then(|(_, digits)| core::str::from_utf8(digits).ok())
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0.0)
    }

    /// Leading integer of `field`, or zero. Saturates at the `i32` range.
    fn leading_int(field: &[u8]) -> i32 {
        Self::int_prefix(field).map(|(_, v)| v).unwrap_or(0)
    }

    /// `[ws][sign]digits[.digits][e[sign]digits]`, also `.digits`. A dangling
    /// exponent marker is left unconsumed.
    fn float_prefix(input: &[u8]) -> IResult<&[u8], &[u8]> {
        preceded(
            multispace0,
            recognize(tuple((
                opt(one_of("+-")),
                alt((
                    recognize(pair(digit1, opt(pair(char('.'), digit0)))),
                    recognize(pair(char('.'), digit1)),
                )),
                opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
            ))),
        )(input)
    }

    fn int_prefix(input: &[u8]) -> IResult<&[u8], i32> {
        preceded(
            multispace0,
            map(pair(opt(one_of("+-")), digit1), |(sign, digits): (_, &[u8])| {
                let magnitude = digits.iter().fold(0i32, |acc, &d| {
                    acc.saturating_mul(10).saturating_add(i32::from(d - b'0'))
                });
                if sign == Some('-') {
                    -magnitude
                } else {
                    magnitude
                }
            }),
        )(input)
    }

    fn two_digits(input: &[u8]) -> IResult<&[u8], u8> {
        map(
            take_while_m_n(1, 2, |b: u8| b.is_ascii_digit()),
            |digits: &[u8]| digits.iter().fold(0, |acc, b| acc * 10 + (b - b'0')),
        )(input)
    }

    /// `hhmmss` / `ddmmyy` groups.
    fn parse_triplet(field: &[u8]) -> Option<(u8, u8, u8)> {
        tuple((Self::two_digits, Self::two_digits, Self::two_digits))(field)
            .ok()
            .map(|(_, triplet)| triplet)
    }

    fn parse_time(field: &[u8], time: &mut UtcTime) {
        if let Some((hour, minute, second)) = Self::parse_triplet(field) {
            *time = UtcTime {
                hour,
                minute,
                second,
            };
        }
    }

    fn parse_date(field: &[u8], date: &mut UtcDate) {
        if let Some((day, month, yy)) = Self::parse_triplet(field) {
            *date = UtcDate {
                day,
                month,
                year: full_year(yy),
            };
        }
    }

    /// Value and hemisphere of one coordinate; `negative` is the hemisphere
    /// that flips the sign.
    fn parse_coord(
        raw: &[u8],
        hemisphere: &[u8],
        negative: Direction,
    ) -> (f64, Option<Direction>) {
        let dir = hemisphere.first().copied().and_then(Direction::from_letter);
        let mut degrees = to_decimal_degrees(Self::leading_float(raw));
        if dir == Some(negative) {
            degrees = -degrees;
        }
        (degrees, dir)
    }

    fn status_active(field: &[u8]) -> bool {
        field.first() == Some(&b'A')
    }

    fn parse_rmc(fields: &Fields, fix: &mut GpsFix) -> Result<(), NmeaError> {
        if !Self::status_active(Self::field(fields, 2)) {
            fix.valid_fix = false;
            return Err(NmeaError::NoFix);
        }
        fix.valid_fix = true;
        Self::parse_time(Self::field(fields, 1), &mut fix.time);
        (fix.latitude, fix.lat_dir) = Self::parse_coord(
            Self::field(fields, 3),
            Self::field(fields, 4),
            Direction::South,
        );
        (fix.longitude, fix.lon_dir) = Self::parse_coord(
            Self::field(fields, 5),
            Self::field(fields, 6),
            Direction::West,
        );
        Self::parse_date(Self::field(fields, 9), &mut fix.date);
        Ok(())
    }

    fn parse_gga(fields: &Fields, fix: &mut GpsFix) -> Result<(), NmeaError> {
        (fix.latitude, fix.lat_dir) = Self::parse_coord(
            Self::field(fields, 2),
            Self::field(fields, 3),
            Direction::South,
        );
        (fix.longitude, fix.lon_dir) = Self::parse_coord(
            Self::field(fields, 4),
            Self::field(fields, 5),
            Direction::West,
        );
        fix.fix_quality = saturate_u8(Self::leading_int(Self::field(fields, 6)));
        fix.satellites = saturate_u8(Self::leading_int(Self::field(fields, 7)));
        fix.altitude = Self::leading_float(Self::field(fields, 9));
        fix.valid_fix = fix.fix_quality > 0;
        Ok(())
    }

    fn parse_gll(fields: &Fields, fix: &mut GpsFix) -> Result<(), NmeaError> {
        if !Self::status_active(Self::field(fields, 6)) {
            fix.valid_fix = false;
            return Err(NmeaError::NoFix);
        }
        (fix.latitude, fix.lat_dir) = Self::parse_coord(
            Self::field(fields, 1),
            Self::field(fields, 2),
            Direction::South,
        );
        (fix.longitude, fix.lon_dir) = Self::parse_coord(
            Self::field(fields, 3),
            Self::field(fields, 4),
            Direction::West,
        );
        Self::parse_time(Self::field(fields, 5), &mut fix.time);
        fix.valid_fix = true;

        // GLL carries neither date nor constellation data
        fix.date = UtcDate::default();
        fix.satellites = 0;
        fix.altitude = 0.0;
        fix.fix_quality = 1;
        Ok(())
    }

    /// Parse one sentence into `fix`, leaving fields the sentence does not
    /// carry untouched.
    pub fn parse_line(line: &[u8], fix: &mut GpsFix) -> Result<Sentence, NmeaError> {
        match line.first() {
            None => return Err(NmeaError::Empty),
            Some(b'$') => (),
            Some(_) => return Err(NmeaError::MissingStart),
        }

        let (_, sentence) =
            Self::parse_sentence_type(line).map_err(|_| NmeaError::Unsupported)?;
        let fields = Self::split_fields(line);

        match sentence {
            Sentence::Rmc => Self::parse_rmc(&fields, fix)?,
            Sentence::Gga => Self::parse_gga(&fields, fix)?,
            Sentence::Gll => Self::parse_gll(&fields, fix)?,
        }
        Ok(sentence)
    }

    /// Parse one sentence into a fresh record.
    pub fn parse_nmea(line: &[u8]) -> Option<GpsFix> {
        let mut fix = GpsFix::default();
        Self::parse_line(line, &mut fix).ok().map(|_| fix)
    }

    fn hex_byte(input: &[u8]) -> IResult<&[u8], u8> {
        map(
            take_while_m_n(2, 2, |b: u8| b.is_ascii_hexdigit()),
            |digits: &[u8]| {
                digits.iter().fold(0, |acc, &b| {
                    // is_ascii_hexdigit above guarantees to_digit succeeds
                    acc << 4 | (b as char).to_digit(16).unwrap_or(0) as u8
                })
            },
        )(input)
    }

    /// Compare the `*hh` suffix with the XOR of everything between `$` and `*`.
    pub fn checksum_status(line: &[u8]) -> ChecksumStatus {
        let body = line.strip_prefix(b"$").unwrap_or(line);
        let Some(star) = body.iter().position(|&b| b == b'*') else {
            return ChecksumStatus::Absent;
        };
        let computed = body[..star].iter().fold(0u8, |acc, &b| acc ^ b);
        match Self::hex_byte(&body[star + 1..]) {
            Ok((_, expected)) if expected == computed => ChecksumStatus::Match,
            Ok((_, expected)) => ChecksumStatus::Mismatch { expected, computed },
            Err(_) => ChecksumStatus::Absent,
        }
    }
}

/// `ddmm.mmmm` / `dddmm.mmmm` to decimal degrees.
pub fn to_decimal_degrees(raw: f64) -> f64 {
    let degrees = (raw / 100.0) as i32 as f64;
    let minutes = raw - degrees * 100.0;
    degrees + minutes / 60.0
}

/// Two-digit RMC year, pivoting at 80: `94` is 1994, `25` is 2025.
pub fn full_year(yy: u8) -> u16 {
    if yy < 80 {
        2000 + yy as u16
    } else {
        1900 + yy as u16
    }
}

fn saturate_u8(v: i32) -> u8 {
    v.clamp(0, u8::MAX as i32) as u8
}
