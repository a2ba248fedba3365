use motor_protocol::{Console, ConsoleFull};
use ringbuffer::{ConstGenericRingBuffer, RingBuffer};
use rtic::Mutex;
use stm32f4xx_hal::pac::Interrupt;

pub const TX_QUEUE_LEN: usize = 1024;

/// Bytes waiting for the console UART. Drained by the USART2 handler on TXE.
pub type TxQueue = ConstGenericRingBuffer<u8, TX_QUEUE_LEN>;

const LINE_END: &[u8] = b"\r\n";

/// Line sink over the shared TX queue. Each line is queued in its own
/// critical section.
pub struct TxConsole<M> {
    queue: M,
}

impl<M: Mutex<T = TxQueue>> TxConsole<M> {
    pub fn new(queue: M) -> Self {
        Self { queue }
    }
}

impl<M: Mutex<T = TxQueue>> Console for TxConsole<M> {
    fn send_line(&mut self, line: &str) -> Result<(), ConsoleFull> {
        let queued = self.queue.lock(|queue| {
            let room = queue.capacity() - queue.len();
            if room < line.len() + LINE_END.len() {
                return false;
            }
            for &byte in line.as_bytes().iter().chain(LINE_END) {
                queue.push(byte);
            }
            true
        });

        if !queued {
            return Err(ConsoleFull);
        }
        // the handler enables TXE itself once it sees pending bytes
        rtic::pend(Interrupt::USART2);
        Ok(())
    }
}
