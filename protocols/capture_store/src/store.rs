//! Capture persistence on a three-bank I2C EEPROM.
//!
//! Each bank holds one field of every capture, so slot `n` lives at the same
//! offset in all three banks:
//!
//! ```text
//! offset 0        next free slot, 1-based (0 or 0xFF when blank)
//! offset 1..4     unused
//! offset 4 + 4*i  slot i+1, little-endian f32
//! ```

use thiserror::Error;

use crate::Capture;

/// Bus addresses of the level, latitude and longitude banks.
pub const BANKS: [u8; 3] = [0x51, 0x52, 0x53];
pub const INDEX_OFFSET: u8 = 0;
pub const DATA_OFFSET: u8 = 4;
pub const SLOTS: u8 = 63;

const ERASED: u8 = 0xFF;
/// Index value once every slot has been written.
const SLOTS_END: u8 = SLOTS + 1;

/// Random-access byte storage addressed by bus address and offset.
pub trait Eeprom {
    type Error;

    fn read(&mut self, bank: u8, offset: u8, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// `data` never crosses a 4-byte boundary.
    fn write(&mut self, bank: u8, offset: u8, data: &[u8]) -> Result<(), Self::Error>;
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError<E> {
    #[error("eeprom bus error")]
    Bus(E),
    #[error("slot {0} out of range")]
    OutOfRange(u8),
}

pub struct CaptureStore<E> {
    eeprom: E,
}

fn slot_offset(slot: u8) -> u8 {
    DATA_OFFSET + (slot - 1) * 4
}

impl<E: Eeprom> CaptureStore<E> {
    pub fn new(eeprom: E) -> Self {
        Self { eeprom }
    }

    pub fn release(self) -> E {
        self.eeprom
    }

    fn next_index(&mut self) -> Result<u8, StoreError<E::Error>> {
        let mut index = [0u8];
        self.eeprom
            .read(BANKS[0], INDEX_OFFSET, &mut index)
            .map_err(StoreError::Bus)?;
        Ok(index[0])
    }

    fn set_next_index(&mut self, index: u8) -> Result<(), StoreError<E::Error>> {
        for bank in BANKS {
            self.eeprom
                .write(bank, INDEX_OFFSET, &[index])
                .map_err(StoreError::Bus)?;
        }
        Ok(())
    }

    /// Store `capture` in the next slot and return that slot (1-based).
    ///
    /// After slot 63, or when the index byte is blank or corrupt, writing
    /// starts over at slot 1.
    pub fn save(&mut self, capture: &Capture) -> Result<u8, StoreError<E::Error>> {
        let mut slot = self.next_index()?;
        if slot == 0 || slot == ERASED || slot > SLOTS {
            slot = 1;
        }

        let offset = slot_offset(slot);
        for (bank, value) in BANKS.into_iter().zip(capture.values()) {
            self.eeprom
                .write(bank, offset, &value.to_le_bytes())
                .map_err(StoreError::Bus)?;
        }
        self.set_next_index(slot + 1)?;
        debug!("capture saved to slot {}", slot);
        Ok(slot)
    }

    /// Number of stored captures. A blank or corrupt index reads as empty,
    /// matching where [`save`](Self::save) would write next.
    pub fn len(&mut self) -> Result<u8, StoreError<E::Error>> {
        Ok(match self.next_index()? {
            index @ 1..=SLOTS_END => index - 1,
            _ => 0,
        })
    }

    pub fn is_empty(&mut self) -> Result<bool, StoreError<E::Error>> {
        Ok(self.len()? == 0)
    }

    /// Read slot `slot` (1-based).
    pub fn read(&mut self, slot: u8) -> Result<Capture, StoreError<E::Error>> {
        if slot == 0 || slot > SLOTS {
            return Err(StoreError::OutOfRange(slot));
        }

        let offset = slot_offset(slot);
        let mut values = [0f32; 3];
        for (bank, value) in BANKS.into_iter().zip(values.iter_mut()) {
            let mut bytes = [0u8; 4];
            self.eeprom
                .read(bank, offset, &mut bytes)
                .map_err(StoreError::Bus)?;
            *value = f32::from_le_bytes(bytes);
        }
        Ok(Capture::from_values(values))
    }

    /// Zero every slot and restart at slot 1.
    pub fn flush(&mut self) -> Result<(), StoreError<E::Error>> {
        let zero = 0f32.to_le_bytes();
        for slot in 1..=SLOTS {
            for bank in BANKS {
                self.eeprom
                    .write(bank, slot_offset(slot), &zero)
                    .map_err(StoreError::Bus)?;
            }
        }
        self.set_next_index(1)?;
        info!("capture store flushed");
        Ok(())
    }
}
