use capture_store::Eeprom;
use stm32f4xx_hal::{
    i2c::{Error, I2c},
    pac::I2C1,
};

/// Internal write cycle of the part, in core clock cycles (5 ms at 84 MHz).
const WRITE_CYCLE: u32 = 420_000;

/// Largest write the capture store issues; keeps every write inside one page.
const CHUNK: usize = 4;

/// 24Cxx-style EEPROM banks on I2C1, one bus address per bank.
pub struct I2cEeprom {
    i2c: I2c<I2C1>,
}

impl I2cEeprom {
    pub fn new(i2c: I2c<I2C1>) -> Self {
        Self { i2c }
    }
}

impl Eeprom for I2cEeprom {
    type Error = Error;

    fn read(&mut self, bank: u8, offset: u8, buf: &mut [u8]) -> Result<(), Error> {
        self.i2c.write_read(bank, &[offset], buf)
    }

    fn write(&mut self, bank: u8, offset: u8, data: &[u8]) -> Result<(), Error> {
        let mut address = offset;
        for chunk in data.chunks(CHUNK) {
            let mut frame = [0u8; CHUNK + 1];
            frame[0] = address;
            frame[1..=chunk.len()].copy_from_slice(chunk);
            self.i2c.write(bank, &frame[..=chunk.len()])?;
            cortex_m::asm::delay(WRITE_CYCLE);
            address = address.wrapping_add(chunk.len() as u8);
        }
        Ok(())
    }
}
