#![cfg_attr(not(test), no_std)]

//! GPS-tagged audio level captures: measuring, gating on a GPS fix,
//! persisting to EEPROM and dumping as JSON.

extern crate alloc;

#[macro_use]
mod log;

pub mod audio;
pub mod gate;
pub mod store;

use alloc::string::String;

use nmea_protocol::GpsFix;
use serde::Serialize;
use thiserror::Error;

pub use audio::{dbfs, volts, LevelMeter};
pub use gate::{FixGate, FixWait};
pub use store::{CaptureStore, Eeprom, StoreError};

/// One stored measurement.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct Capture {
    pub level_dbfs: f32,
    pub latitude: f32,
    pub longitude: f32,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("no gps fix")]
    NoFix,
}

impl Capture {
    /// Tag `level_dbfs` with the position of `fix`.
    pub fn from_fix(level_dbfs: f32, fix: &GpsFix) -> Result<Self, CaptureError> {
        if !fix.valid_fix {
            return Err(CaptureError::NoFix);
        }
        Ok(Self {
            level_dbfs,
            latitude: fix.latitude as f32,
            longitude: fix.longitude as f32,
        })
    }

    /// Fields in bank order.
    pub fn values(&self) -> [f32; 3] {
        [self.level_dbfs, self.latitude, self.longitude]
    }

    pub fn from_values([level_dbfs, latitude, longitude]: [f32; 3]) -> Self {
        Self {
            level_dbfs,
            latitude,
            longitude,
        }
    }
}

#[derive(Serialize)]
struct DumpEntry {
    slot: u8,
    level_dbfs: f32,
    latitude: f32,
    longitude: f32,
}

/// One JSON object per stored capture, e.g.
/// `{"slot":1,"level_dbfs":-12.5,"latitude":-33.5,"longitude":-70.25}`.
pub fn dump_line(slot: u8, capture: &Capture) -> Option<String> {
    let entry = DumpEntry {
        slot,
        level_dbfs: capture.level_dbfs,
        latitude: capture.latitude,
        longitude: capture.longitude,
    };
    let line = serde_json::to_string(&entry);
    if line.is_err() {
        warn!("failed to serialize capture {}", slot);
    }
    line.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_needs_a_fix() {
        let fix = GpsFix::default();
        assert_eq!(Capture::from_fix(-20.0, &fix), Err(CaptureError::NoFix));
    }

    #[test]
    fn capture_takes_position_from_fix() {
        let fix = GpsFix {
            valid_fix: true,
            latitude: -33.5,
            longitude: -70.25,
            ..GpsFix::default()
        };
        assert_eq!(
            Capture::from_fix(-12.5, &fix),
            Ok(Capture {
                level_dbfs: -12.5,
                latitude: -33.5,
                longitude: -70.25,
            })
        );
    }

    #[test]
    fn dump_line_is_flat_json() {
        let capture = Capture {
            level_dbfs: -12.5,
            latitude: -33.5,
            longitude: -70.25,
        };
        assert_eq!(
            dump_line(3, &capture).as_deref(),
            Some(r#"{"slot":3,"level_dbfs":-12.5,"latitude":-33.5,"longitude":-70.25}"#)
        );
    }

    #[test]
    fn values_round_trip_bank_order() {
        let capture = Capture::from_values([1.0, 2.0, 3.0]);
        assert_eq!(capture.latitude, 2.0);
        assert_eq!(capture.values(), [1.0, 2.0, 3.0]);
    }
}
