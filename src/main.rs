#![warn(clippy::std_instead_of_alloc, clippy::std_instead_of_core)]
#![no_main]
#![no_std]

// RTT and defmt logger setup
use defmt_rtt as _;

// Setup panic behaviour
use panic_probe as _;

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}

// heap for the JSON lines of the capture dump
extern crate alloc;

mod console;
mod eeprom;
mod motor;

use core::sync::atomic::AtomicBool;

use motor_protocol::PulseCounter;
use rtic_monotonics::{systick::Systick, Monotonic};

/// Encoder edges since the control loop last looked.
static PULSES: PulseCounter = PulseCounter::new();

/// Raised by the button handler, consumed by the control loop.
static ABORT: AtomicBool = AtomicBool::new(false);

fn now_ms() -> u32 {
    Systick::now().ticks()
}

defmt::timestamp!("{=u32:ms}", now_ms());

#[rtic::app(device = stm32f4xx_hal::pac, dispatchers = [SPI1, SPI2])]
mod app {
    use core::fmt::Write as _;
    use core::sync::atomic::Ordering;

    use capture_store::{
        dump_line, volts, Capture, CaptureStore, FixGate, FixWait, LevelMeter, StoreError,
    };
    use heapless::{Deque, String, Vec};
    use motor_protocol::{
        Characterizer, Command, CommandError, Config, Console, Debouncer, Sample,
    };
    use nmea_protocol::{ChecksumStatus, GpsFix, LineBuffer, Nmea};
    use ringbuffer::RingBuffer;
    use rtic::Mutex;
    use rtic_monotonics::{create_systick_token, systick::Systick};

    // Use HAL crate for stm32f407
    use stm32f4xx_hal::{
        adc::{
            config::{AdcConfig, SampleTime},
            Adc,
        },
        gpio::{Analog, Edge, Input, PA0, PA1, PA4},
        i2c::{self, I2c},
        pac::{ADC1, USART2, USART3},
        prelude::*,
        serial::{config::Config as SerialConfig, Event, Rx, Serial, Tx},
        timer::Channel1,
    };

    use crate::console::{TxConsole, TxQueue};
    use crate::eeprom::I2cEeprom;
    use crate::motor::PwmMotor;
    use crate::{now_ms, ABORT, PULSES};

    // Setup heap allocator for rust collections
    use embedded_alloc::Heap;

    #[global_allocator]
    static HEAP: Heap = Heap::empty();

    const HEAP_SIZE: usize = 1024;

    /// Enough for a full sweep at step 20 (12 steps of 2 s, one sample per 4 ms).
    const SAMPLE_CAPACITY: usize = 6000;
    const COMMAND_QUEUE_LEN: usize = 8;
    const CONSOLE_LINE_LEN: usize = 64;
    /// NMEA 0183 caps sentences at 82 characters.
    const NMEA_LINE_LEN: usize = 96;

    const CONSOLE_BAUD: u32 = 115_200;
    const GPS_BAUD: u32 = 9_600;
    const PWM_FREQ_KHZ: u32 = 20;

    const CONTROL_PERIOD_MS: u32 = 1;
    const DEBOUNCE_MS: u32 = 200;
    const FIX_POLL_MS: u32 = 100;

    const AUDIO_WINDOW: usize = 1000;
    /// Spacing of audio samples in core cycles, about 8 kHz at 84 MHz.
    const AUDIO_SAMPLE_CYCLES: u32 = 10_500;

    type Bench = Characterizer<'static, PwmMotor, SAMPLE_CAPACITY>;

    /// Most recent GPS state and when it last changed.
    #[derive(Clone, Copy, Default)]
    pub struct GpsState {
        fix: GpsFix,
        updated_ms: Option<u32>,
    }

    #[shared]
    struct Shared {
        commands: Deque<Result<Command, CommandError>, COMMAND_QUEUE_LEN>,
        tx_queue: TxQueue,
        gps: GpsState,
    }

    #[local]
    struct Local {
        console_tx: Tx<USART2>,
        console_rx: Rx<USART2>,
        gps_rx: Rx<USART3>,
        encoder: PA1<Input>,
        button: PA0<Input>,
        bench: Bench,
        store: CaptureStore<I2cEeprom>,
        adc: Adc<ADC1>,
        mic: PA4<Analog>,
    }

    #[init(local = [samples: Vec<Sample, SAMPLE_CAPACITY> = Vec::new()])]
    fn init(ctx: init::Context) -> (Shared, Local) {
        defmt::debug!("Init started");

        // Initialize the allocator
        {
            use core::mem::MaybeUninit;
            static mut HEAP_MEM: [MaybeUninit<u8>; HEAP_SIZE] = [MaybeUninit::uninit(); HEAP_SIZE];
            unsafe { HEAP.init(core::ptr::addr_of_mut!(HEAP_MEM) as usize, HEAP_SIZE) }
        }

        let mut dp = ctx.device;
        let rcc = dp.RCC.constrain();
        let clocks = rcc
            .cfgr
            .use_hse(8.MHz())
            .sysclk(84.MHz())
            .hclk(84.MHz())
            .freeze();

        Systick::start(ctx.core.SYST, clocks.sysclk().raw(), create_systick_token!());

        let gpioa = dp.GPIOA.split();
        let gpiob = dp.GPIOB.split();

        // Motor: TIM3 CH1 on PA6 drives the bridge enable
        let enable = dp
            .TIM3
            .pwm_hz(Channel1::new(gpioa.pa6), PWM_FREQ_KHZ.kHz(), &clocks)
            .split();
        let motor = PwmMotor::new(
            enable,
            gpiob.pb12.into_push_pull_output(),
            gpiob.pb13.into_push_pull_output(),
        );
        let bench = Characterizer::new(motor, Config::default(), ctx.local.samples);

        // Encoder on PA1 and user button on PA0, both on rising edges
        let mut syscfg = dp.SYSCFG.constrain();

        let mut encoder = gpioa.pa1.into_pull_up_input();
        encoder.make_interrupt_source(&mut syscfg);
        encoder.trigger_on_edge(&mut dp.EXTI, Edge::Rising);
        encoder.enable_interrupt(&mut dp.EXTI);

        let mut button = gpioa.pa0.into_pull_down_input();
        button.make_interrupt_source(&mut syscfg);
        button.trigger_on_edge(&mut dp.EXTI, Edge::Rising);
        button.enable_interrupt(&mut dp.EXTI);

        // Configure serial: console on USART2, GPS receiver on USART3
        let mut console: Serial<USART2, u8> = Serial::new(
            dp.USART2,
            (gpioa.pa2, gpioa.pa3),
            SerialConfig::default().baudrate(CONSOLE_BAUD.bps()),
            &clocks,
        )
        .unwrap();
        console.listen(Event::RxNotEmpty);
        let (console_tx, console_rx) = console.split();

        let mut gps: Serial<USART3, u8> = Serial::new(
            dp.USART3,
            (gpiob.pb10, gpiob.pb11),
            SerialConfig::default().baudrate(GPS_BAUD.bps()),
            &clocks,
        )
        .unwrap();
        gps.listen(Event::RxNotEmpty);
        let (_, gps_rx) = gps.split();

        // Capture store on I2C1, microphone on PA4
        let i2c = I2c::new(dp.I2C1, (gpiob.pb6, gpiob.pb7), 100.kHz(), &clocks);
        let store = CaptureStore::new(I2cEeprom::new(i2c));
        let adc = Adc::adc1(dp.ADC1, true, AdcConfig::default());
        let mic = gpioa.pa4.into_analog();

        control::spawn().unwrap();

        defmt::info!("Init done");
        (
            Shared {
                commands: Deque::new(),
                tx_queue: TxQueue::new(),
                gps: GpsState::default(),
            },
            Local {
                console_tx,
                console_rx,
                gps_rx,
                encoder,
                button,
                bench,
                store,
                adc,
                mic,
            },
        )
    }

    #[idle]
    fn idle(_: idle::Context) -> ! {
        defmt::debug!("In idle");
        loop {
            continue;
        }
    }

    /// Periodic control loop: commands, button aborts and the state machine.
    #[task(priority = 2, local = [bench], shared = [commands, tx_queue])]
    async fn control(mut ctx: control::Context) {
        let bench = ctx.local.bench;
        loop {
            let now = now_ms();
            let mut console = TxConsole::new(&mut ctx.shared.tx_queue);

            if ABORT.swap(false, Ordering::AcqRel) && bench.abort() {
                defmt::info!("Stopped by button");
            }

            while let Some(parsed) = ctx.shared.commands.lock(|queue| queue.pop_front()) {
                dispatch(bench, parsed, now, &mut console);
            }

            bench.poll(now, &PULSES, &mut console);

            Systick::delay(CONTROL_PERIOD_MS.millis()).await;
        }
    }

    fn dispatch<C: Console>(
        bench: &mut Bench,
        parsed: Result<Command, CommandError>,
        now: u32,
        console: &mut C,
    ) {
        let command = match parsed {
            Ok(command) => command,
            Err(err) => {
                let mut line: String<32> = String::new();
                let _ = write!(line, "ERR {}", err);
                let _ = console.send_line(&line);
                return;
            }
        };

        let outcome = match command {
            Command::Start { step } => bench.start(step, now, &PULSES, console),
            Command::Pwm { duty } => bench.set_duty(duty, now, &PULSES, console),
            Command::Stop => bench.stop(console),
            Command::Capture | Command::Dump | Command::Delete => {
                if store_job::spawn(command).is_err() {
                    let _ = console.send_line("ERR busy");
                }
                Ok(())
            }
        };

        if let Err(err) = outcome {
            defmt::warn!("{} refused: {}", command, err);
        }
    }

    /// GPS-gated audio capture and EEPROM maintenance. Blocking bus work is
    /// fine here: everything else preempts this task.
    #[task(priority = 1, local = [store, adc, mic], shared = [gps, tx_queue])]
    async fn store_job(mut ctx: store_job::Context, job: Command) {
        let mut console = TxConsole::new(&mut ctx.shared.tx_queue);
        let store = ctx.local.store;

        let outcome = match job {
            Command::Capture => {
                let Some(fix) = wait_for_fix(&mut ctx.shared.gps).await else {
                    defmt::warn!("Capture aborted: no GPS fix");
                    send_line(&mut console, "ERR no gps fix").await;
                    return;
                };
                let level = measure_level(ctx.local.adc, ctx.local.mic);
                match Capture::from_fix(level, &fix) {
                    Ok(capture) => save(store, &capture, &mut console).await,
                    Err(err) => {
                        defmt::warn!("Capture aborted: {}", err);
                        send_line(&mut console, "ERR no gps fix").await;
                        return;
                    }
                }
            }
            Command::Dump => dump(store, &mut console).await,
            Command::Delete => match store.flush() {
                Ok(()) => {
                    send_line(&mut console, "OK DELETE").await;
                    Ok(())
                }
                Err(err) => Err(err),
            },
            _ => Ok(()),
        };

        if let Err(err) = outcome {
            defmt::error!("EEPROM: {}", defmt::Debug2Format(&err));
            send_line(&mut console, "ERR eeprom").await;
        }
    }

    /// Wait until the receiver reports a fresh fix, or give up.
    async fn wait_for_fix(gps: &mut impl Mutex<T = GpsState>) -> Option<GpsFix> {
        let gate = FixGate::default();
        let started = now_ms();
        loop {
            let now = now_ms();
            let (fix, age) = gps.lock(|gps| (gps.fix, gps.updated_ms.map(|t| now.wrapping_sub(t))));
            match gate.check(&fix, age, now.wrapping_sub(started)) {
                FixWait::Ready => return Some(fix),
                FixWait::TimedOut => return None,
                FixWait::Waiting => Systick::delay(FIX_POLL_MS.millis()).await,
            }
        }
    }

    fn measure_level(adc: &mut Adc<ADC1>, mic: &PA4<Analog>) -> f32 {
        let mut meter = LevelMeter::<AUDIO_WINDOW>::new();
        while !meter.is_full() {
            let raw: u16 = adc.convert(mic, SampleTime::Cycles_480);
            meter.push(volts(raw));
            cortex_m::asm::delay(AUDIO_SAMPLE_CYCLES);
        }
        let level = meter.dbfs();
        defmt::debug!("Audio level {} dBFS", level);
        level
    }

    async fn save<C: Console>(
        store: &mut CaptureStore<I2cEeprom>,
        capture: &Capture,
        console: &mut C,
    ) -> Result<(), StoreError<i2c::Error>> {
        let slot = store.save(capture)?;
        defmt::info!("Saved {} to slot {}", capture, slot);

        let mut line: String<24> = String::new();
        let _ = write!(line, "OK CAPTURE {}", slot);
        send_line(console, &line).await;
        if let Some(json) = dump_line(slot, capture) {
            send_line(console, &json).await;
        }
        Ok(())
    }

    async fn dump<C: Console>(
        store: &mut CaptureStore<I2cEeprom>,
        console: &mut C,
    ) -> Result<(), StoreError<i2c::Error>> {
        let count = store.len()?;
        let mut line: String<24> = String::new();
        let _ = write!(line, "OK DUMP {}", count);
        send_line(console, &line).await;

        for slot in 1..=count {
            let capture = store.read(slot)?;
            if let Some(json) = dump_line(slot, &capture) {
                send_line(console, &json).await;
            }
        }
        Ok(())
    }

    /// Queue a line, waiting for room instead of dropping it.
    async fn send_line<C: Console>(console: &mut C, line: &str) {
        while console.send_line(line).is_err() {
            Systick::delay(CONTROL_PERIOD_MS.millis()).await;
        }
    }

    #[task(binds = EXTI1, priority = 4, local = [encoder])]
    fn encoder_edge(ctx: encoder_edge::Context) {
        ctx.local.encoder.clear_interrupt_pending_bit();
        PULSES.record_edge();
    }

    #[task(binds = EXTI0, priority = 3, local = [button, debouncer: Debouncer = Debouncer::new(DEBOUNCE_MS)])]
    fn button_press(ctx: button_press::Context) {
        ctx.local.button.clear_interrupt_pending_bit();
        if ctx.local.debouncer.accept(now_ms()) {
            defmt::debug!("Button pressed");
            ABORT.store(true, Ordering::Release);
        }
    }

    #[task(
        binds = USART2,
        priority = 3,
        local = [console_tx, console_rx, line: LineBuffer<CONSOLE_LINE_LEN> = LineBuffer::new()],
        shared = [commands, tx_queue]
    )]
    fn console_uart(mut ctx: console_uart::Context) {
        let rx = ctx.local.console_rx;
        if rx.is_rx_not_empty() {
            if let Ok(byte) = rx.read() {
                if let Some(line) = ctx.local.line.push(byte) {
                    let parsed = Command::parse(line);
                    defmt::debug!("Console line {=[u8]:a}: {}", line, parsed);
                    ctx.shared.commands.lock(|queue| {
                        if queue.push_back(parsed).is_err() {
                            defmt::warn!("Command queue full, dropped");
                        }
                    });
                }
            }
        }

        let tx = ctx.local.console_tx;
        ctx.shared.tx_queue.lock(|queue| {
            if tx.is_tx_empty() {
                if let Some(byte) = queue.dequeue() {
                    let _ = tx.write(byte);
                }
            }
            if queue.is_empty() {
                tx.unlisten();
            } else {
                tx.listen();
            }
        });
    }

    #[task(
        binds = USART3,
        priority = 3,
        local = [gps_rx, line: LineBuffer<NMEA_LINE_LEN> = LineBuffer::new()],
        shared = [gps]
    )]
    fn gps_uart(mut ctx: gps_uart::Context) {
        let Ok(byte) = ctx.local.gps_rx.read() else {
            return;
        };
        let Some(line) = ctx.local.line.push(byte) else {
            return;
        };

        if let ChecksumStatus::Mismatch { expected, computed } = Nmea::checksum_status(line) {
            defmt::warn!(
                "Checksum doesn't match! got: {:02x}, expected: {:02x}",
                computed,
                expected
            );
            return;
        }

        let now = now_ms();
        ctx.shared.gps.lock(|gps| match Nmea::parse_line(line, &mut gps.fix) {
            Ok(sentence) => {
                gps.updated_ms = Some(now);
                defmt::trace!("{}: {}", sentence, gps.fix);
            }
            Err(err) => defmt::debug!("NMEA line dropped: {}", err),
        });
    }
}
