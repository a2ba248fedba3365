//! Duty-sweep characterization state machine.
//!
//! The machine is driven from a single periodic control loop through
//! [`Characterizer::poll`]. Commands arrive through [`Characterizer::start`],
//! [`Characterizer::set_duty`] and [`Characterizer::stop`]; the user button
//! goes through [`Characterizer::abort`]. Encoder edges are accumulated
//! elsewhere in a [`PulseCounter`] and only ever read-and-cleared here.

use core::fmt::Write;

use heapless::{String, Vec};
use thiserror::Error;

use crate::{config::Config, encoder::rpm, Console, MotorDriver, PulseCounter, MAX_DUTY};

pub const EXPORT_HEADER: &str = "delta;pwm;rpm";
pub const EXPORT_END: &str = "END";

/// Longest line the machine ever emits.
const LINE_LEN: usize = 48;

/// One speed measurement taken during a sweep.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Milliseconds since the capture started.
    pub delta_ms: u32,
    pub duty: u8,
    pub rpm: f32,
}

/// Externally visible state, without the per-state bookkeeping.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Manual,
    Capturing,
    Exporting,
}

/// A motor command arrived while the capture was being exported.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("busy exporting capture")]
pub struct Busy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy)]
struct Sweep {
    duty: u8,
    step: u8,
    direction: Direction,
    started_ms: u32,
    last_sample_ms: u32,
    last_step_ms: u32,
    settle_until_ms: u32,
}

/// Next line of the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportCursor {
    Header,
    Sample(usize),
    Footer,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Manual { duty: u8, last_report_ms: u32 },
    Capturing(Sweep),
    Exporting(ExportCursor),
}

/// `true` once the wrapping clock `now_ms` has reached `deadline_ms`.
fn reached(now_ms: u32, deadline_ms: u32) -> bool {
    (now_ms.wrapping_sub(deadline_ms) as i32) >= 0
}

pub struct Characterizer<'a, M: MotorDriver, const N: usize> {
    config: Config,
    motor: M,
    state: State,
    samples: &'a mut Vec<Sample, N>,
}

impl<'a, M: MotorDriver, const N: usize> Characterizer<'a, M, N> {
    /// Takes ownership of the motor output and stops it.
    pub fn new(mut motor: M, config: Config, samples: &'a mut Vec<Sample, N>) -> Self {
        motor.set_duty(0);
        samples.clear();
        Self {
            config,
            motor,
            state: State::Idle,
            samples,
        }
    }

    pub fn mode(&self) -> Mode {
        match self.state {
            State::Idle => Mode::Idle,
            State::Manual { .. } => Mode::Manual,
            State::Capturing(_) => Mode::Capturing,
            State::Exporting(_) => Mode::Exporting,
        }
    }

    /// Duty currently applied to the motor.
    pub fn duty(&self) -> u8 {
        match self.state {
            State::Manual { duty, .. } => duty,
            State::Capturing(sweep) => sweep.duty,
            State::Idle | State::Exporting(_) => 0,
        }
    }

    /// Samples of the current or last capture, in arrival order.
    pub fn samples(&self) -> &[Sample] {
        self.samples
    }

    /// Begin a sweep from duty 0 with `step` (clamped to `1..=100`).
    ///
    /// A capture already running is restarted and its samples are discarded.
    pub fn start<C: Console>(
        &mut self,
        step: u8,
        now_ms: u32,
        pulses: &PulseCounter,
        console: &mut C,
    ) -> Result<(), Busy> {
        self.ensure_not_exporting(console)?;
        if matches!(self.state, State::Capturing(_)) {
            warn!("capture restarted, samples discarded");
        }

        let step = step.clamp(1, MAX_DUTY);
        self.samples.clear();
        self.motor.set_duty(0);
        pulses.take();
        self.state = State::Capturing(Sweep {
            duty: 0,
            step,
            direction: Direction::Ascending,
            started_ms: now_ms,
            last_sample_ms: now_ms,
            last_step_ms: now_ms,
            settle_until_ms: now_ms.wrapping_add(self.config.settle_ms),
        });
        info!("capture started, step {}", step);

        let mut line: String<LINE_LEN> = String::new();
        let _ = write!(line, "OK START {}", step);
        let _ = console.send_line(&line);
        Ok(())
    }

    /// Switch to manual mode at `duty` (clamped to `0..=100`).
    ///
    /// A running capture is aborted first.
    pub fn set_duty<C: Console>(
        &mut self,
        duty: u8,
        now_ms: u32,
        pulses: &PulseCounter,
        console: &mut C,
    ) -> Result<(), Busy> {
        self.ensure_not_exporting(console)?;
        self.discard_capture();

        let duty = duty.min(MAX_DUTY);
        self.motor.set_duty(duty);
        pulses.take();
        self.state = State::Manual {
            duty,
            last_report_ms: now_ms,
        };
        debug!("manual duty {}", duty);

        let mut line: String<LINE_LEN> = String::new();
        let _ = write!(line, "OK PWM {}", duty);
        let _ = console.send_line(&line);
        Ok(())
    }

    /// `STOP` command: abort a capture or leave manual mode.
    pub fn stop<C: Console>(&mut self, console: &mut C) -> Result<(), Busy> {
        self.ensure_not_exporting(console)?;
        self.halt();
        let _ = console.send_line("OK STOP");
        Ok(())
    }

    /// User button. Same as `STOP` but silent, and ignored during an export.
    ///
    /// Returns whether anything was stopped.
    pub fn abort(&mut self) -> bool {
        match self.state {
            State::Idle | State::Exporting(_) => false,
            State::Manual { .. } | State::Capturing(_) => {
                self.halt();
                true
            }
        }
    }

    /// Advance the machine to `now_ms`. Call at least once per sample
    /// interval.
    pub fn poll<C: Console>(&mut self, now_ms: u32, pulses: &PulseCounter, console: &mut C) {
        match self.state {
            State::Idle => {}
            State::Manual {
                duty,
                last_report_ms,
            } => self.report(duty, last_report_ms, now_ms, pulses, console),
            State::Capturing(sweep) => self.capture(sweep, now_ms, pulses),
            State::Exporting(cursor) => self.export(cursor, console),
        }
    }

    fn ensure_not_exporting<C: Console>(&mut self, console: &mut C) -> Result<(), Busy> {
        if matches!(self.state, State::Exporting(_)) {
            let _ = console.send_line("ERR busy");
            return Err(Busy);
        }
        Ok(())
    }

    fn discard_capture(&mut self) {
        if matches!(self.state, State::Capturing(_)) {
            warn!("capture aborted, {} samples discarded", self.samples.len());
            self.samples.clear();
        }
    }

    fn halt(&mut self) {
        self.discard_capture();
        self.motor.set_duty(0);
        self.state = State::Idle;
        info!("motor stopped");
    }

    fn report<C: Console>(
        &mut self,
        duty: u8,
        last_report_ms: u32,
        now_ms: u32,
        pulses: &PulseCounter,
        console: &mut C,
    ) {
        let elapsed = now_ms.wrapping_sub(last_report_ms);
        if elapsed < self.config.report_interval_ms {
            return;
        }

        let speed = rpm(pulses.take(), self.config.pulses_per_revolution, elapsed);
        let mut line: String<LINE_LEN> = String::new();
        let _ = write!(line, "PWM: {} | RPM: {:.2}", duty, speed);
        // Reports are periodic; a refused one is simply superseded.
        let _ = console.send_line(&line);

        self.state = State::Manual {
            duty,
            last_report_ms: now_ms,
        };
    }

    fn capture(&mut self, mut sweep: Sweep, now_ms: u32, pulses: &PulseCounter) {
        let since_sample = now_ms.wrapping_sub(sweep.last_sample_ms);
        if since_sample >= self.config.sample_interval_ms {
            let speed = rpm(
                pulses.take(),
                self.config.pulses_per_revolution,
                since_sample,
            );
            sweep.last_sample_ms = now_ms;

            if reached(now_ms, sweep.settle_until_ms) && !self.samples.is_full() {
                let sample = Sample {
                    delta_ms: now_ms.wrapping_sub(sweep.started_ms),
                    duty: sweep.duty,
                    rpm: speed,
                };
                // capacity checked above
                let _ = self.samples.push(sample);
                if self.samples.is_full() {
                    warn!("sample buffer full at {} ms", sample.delta_ms);
                }
            }
        }

        if now_ms.wrapping_sub(sweep.last_step_ms) >= self.config.step_interval_ms {
            sweep.last_step_ms = now_ms;
            sweep.settle_until_ms = now_ms.wrapping_add(self.config.settle_ms);

            match sweep.direction {
                Direction::Ascending => {
                    let next = sweep.duty + sweep.step;
                    if next > MAX_DUTY {
                        sweep.duty = MAX_DUTY;
                        sweep.direction = Direction::Descending;
                    } else {
                        sweep.duty = next;
                    }
                }
                Direction::Descending => {
                    if sweep.duty < sweep.step {
                        self.finish_capture(pulses);
                        return;
                    }
                    sweep.duty -= sweep.step;
                }
            }
            self.motor.set_duty(sweep.duty);
            debug!("sweep duty {}", sweep.duty);
        }

        self.state = State::Capturing(sweep);
    }

    fn finish_capture(&mut self, pulses: &PulseCounter) {
        self.motor.set_duty(0);
        pulses.take();
        self.state = State::Exporting(ExportCursor::Header);
        info!("capture complete, {} samples", self.samples.len());
    }

    fn export<C: Console>(&mut self, mut cursor: ExportCursor, console: &mut C) {
        loop {
            let sent = match cursor {
                ExportCursor::Header => console.send_line(EXPORT_HEADER),
                ExportCursor::Sample(index) => match self.samples.get(index) {
                    Some(sample) => console.send_line(&format_sample(sample)),
                    None => {
                        cursor = ExportCursor::Footer;
                        continue;
                    }
                },
                ExportCursor::Footer => console.send_line(EXPORT_END),
            };

            if sent.is_err() {
                // resume from the same line on the next poll
                self.state = State::Exporting(cursor);
                return;
            }

            cursor = match cursor {
                ExportCursor::Header => ExportCursor::Sample(0),
                ExportCursor::Sample(index) => ExportCursor::Sample(index + 1),
                ExportCursor::Footer => {
                    self.state = State::Idle;
                    info!("export done");
                    return;
                }
            };
        }
    }
}

fn format_sample(sample: &Sample) -> String<LINE_LEN> {
    let mut line = String::new();
    let _ = write!(
        line,
        "{};{};{:.2}",
        sample.delta_ms, sample.duty, sample.rpm
    );
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConsoleFull;

    #[derive(Default)]
    struct FakeMotor {
        history: std::vec::Vec<u8>,
    }

    impl MotorDriver for &mut FakeMotor {
        fn set_duty(&mut self, percent: u8) {
            self.history.push(percent);
        }
    }

    #[derive(Default)]
    struct FakeConsole {
        lines: std::vec::Vec<std::string::String>,
        /// Accept at most this many lines before refusing; `None` is unbounded.
        room: Option<usize>,
    }

    impl Console for FakeConsole {
        fn send_line(&mut self, line: &str) -> Result<(), ConsoleFull> {
            match self.room {
                Some(0) => return Err(ConsoleFull),
                Some(ref mut room) => *room -= 1,
                None => {}
            }
            self.lines.push(line.into());
            Ok(())
        }
    }

    const CAPACITY: usize = 8000;

    /// Run the machine with a 1 ms tick until it reaches `mode`, feeding
    /// `edges_per_ms` encoder edges each tick.
    fn run_until<M: MotorDriver, const N: usize>(
        bench: &mut Characterizer<'_, M, N>,
        now: &mut u32,
        pulses: &PulseCounter,
        console: &mut FakeConsole,
        edges_per_ms: u32,
        mode: Mode,
    ) {
        for _ in 0..100_000 {
            if bench.mode() == mode {
                return;
            }
            *now += 1;
            for _ in 0..edges_per_ms {
                pulses.record_edge();
            }
            bench.poll(*now, pulses, console);
        }
        panic!("never reached {:?}", mode);
    }

    #[test]
    fn sweep_visits_every_step_up_and_down() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();
        let mut now = 0;

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        bench.start(20, now, &pulses, &mut console).unwrap();
        assert_eq!(bench.mode(), Mode::Capturing);
        run_until(&mut bench, &mut now, &pulses, &mut console, 0, Mode::Exporting);
        drop(bench);

        let mut visited = motor.history.clone();
        visited.dedup();
        assert_eq!(visited, [0, 20, 40, 60, 80, 100, 80, 60, 40, 20, 0]);

        let duties: std::vec::Vec<u8> = samples.iter().map(|s| s.duty).collect();
        let mut seen = duties.clone();
        seen.dedup();
        assert_eq!(seen, [0, 20, 40, 60, 80, 100, 80, 60, 40, 20, 0]);

        // 12 step intervals of 2 s sampled every 4 ms
        assert_eq!(samples.len(), 6000);
        assert!(samples.windows(2).all(|w| w[0].delta_ms < w[1].delta_ms));
        assert_eq!(samples[0].delta_ms, 4);
    }

    #[test]
    fn export_emits_header_samples_and_marker() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();
        let mut now = 0;

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        bench.start(50, now, &pulses, &mut console).unwrap();
        run_until(&mut bench, &mut now, &pulses, &mut console, 1, Mode::Exporting);
        bench.poll(now, &pulses, &mut console);
        assert_eq!(bench.mode(), Mode::Idle);
        let stored = bench.samples().len();

        assert_eq!(console.lines[0], "OK START 50");
        assert_eq!(console.lines[1], EXPORT_HEADER);
        assert_eq!(console.lines.len(), stored + 3);
        assert_eq!(console.lines.last().map(|l| l.as_str()), Some(EXPORT_END));
        // one edge per ms at 20 ppr is 3000 rpm
        assert_eq!(console.lines[2], "4;0;3000.00");
    }

    #[test]
    fn refused_export_lines_are_retried() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();
        let mut now = 0;

        let config = Config::default().with_step_interval(100);
        let mut bench = Characterizer::new(&mut motor, config, &mut samples);
        bench.start(100, now, &pulses, &mut console).unwrap();
        run_until(&mut bench, &mut now, &pulses, &mut console, 0, Mode::Exporting);
        let stored = bench.samples().len();
        console.lines.clear();

        while bench.mode() == Mode::Exporting {
            console.room = Some(7);
            bench.poll(now, &pulses, &mut console);
        }

        assert_eq!(console.lines.len(), stored + 2);
        assert_eq!(console.lines[0], EXPORT_HEADER);
        for (line, sample) in console.lines[1..].iter().zip(bench.samples()) {
            assert_eq!(*line, format_sample(sample).as_str());
        }
        assert_eq!(console.lines[stored + 1], EXPORT_END);
    }

    #[test]
    fn full_buffer_drops_new_samples() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, 10> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();
        let mut now = 0;

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        bench.start(20, now, &pulses, &mut console).unwrap();
        run_until(&mut bench, &mut now, &pulses, &mut console, 0, Mode::Exporting);

        assert_eq!(bench.samples().len(), 10);
        assert_eq!(bench.samples()[9].delta_ms, 40);
    }

    #[test]
    fn stop_during_capture_discards_everything() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        bench.start(20, 0, &pulses, &mut console).unwrap();
        for now in 1..=5000 {
            bench.poll(now, &pulses, &mut console);
        }
        assert!(!bench.samples().is_empty());
        console.lines.clear();

        bench.stop(&mut console).unwrap();
        for now in 5001..6000 {
            bench.poll(now, &pulses, &mut console);
        }

        assert_eq!(bench.mode(), Mode::Idle);
        assert_eq!(bench.duty(), 0);
        assert!(bench.samples().is_empty());
        assert_eq!(console.lines, ["OK STOP"]);
        drop(bench);
        assert_eq!(motor.history.last(), Some(&0));
    }

    #[test]
    fn button_aborts_capture_silently() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        assert!(!bench.abort());
        bench.start(20, 0, &pulses, &mut console).unwrap();
        for now in 1..=100 {
            bench.poll(now, &pulses, &mut console);
        }
        assert!(bench.abort());
        assert_eq!(bench.mode(), Mode::Idle);
        assert!(bench.samples().is_empty());
        assert_eq!(console.lines, ["OK START 20"]);
    }

    #[test]
    fn manual_mode_reports_speed() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, 4> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        bench.set_duty(50, 1000, &pulses, &mut console).unwrap();
        for _ in 0..10 {
            pulses.record_edge();
        }
        bench.poll(1499, &pulses, &mut console);
        bench.poll(1500, &pulses, &mut console);

        assert_eq!(bench.mode(), Mode::Manual);
        assert_eq!(console.lines, ["OK PWM 50", "PWM: 50 | RPM: 60.00"]);
        assert_eq!(pulses.take(), 0);
    }

    #[test]
    fn pwm_during_capture_switches_to_manual() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        bench.start(20, 0, &pulses, &mut console).unwrap();
        for now in 1..=3000 {
            bench.poll(now, &pulses, &mut console);
        }
        bench.set_duty(150, 3001, &pulses, &mut console).unwrap();

        assert_eq!(bench.mode(), Mode::Manual);
        assert_eq!(bench.duty(), 100);
        assert!(bench.samples().is_empty());
    }

    #[test]
    fn motor_commands_are_refused_while_exporting() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();
        let mut now = 0;

        let config = Config::default().with_step_interval(10);
        let mut bench = Characterizer::new(&mut motor, config, &mut samples);
        bench.start(100, now, &pulses, &mut console).unwrap();
        run_until(&mut bench, &mut now, &pulses, &mut console, 0, Mode::Exporting);
        console.lines.clear();

        assert_eq!(bench.set_duty(30, now, &pulses, &mut console), Err(Busy));
        assert_eq!(bench.start(10, now, &pulses, &mut console), Err(Busy));
        assert_eq!(bench.stop(&mut console), Err(Busy));
        assert!(!bench.abort());
        assert_eq!(console.lines, ["ERR busy", "ERR busy", "ERR busy"]);

        bench.poll(now, &pulses, &mut console);
        assert_eq!(bench.mode(), Mode::Idle);
        assert_eq!(console.lines.last().map(|l| l.as_str()), Some(EXPORT_END));
    }

    #[test]
    fn settle_window_skips_samples_after_each_step() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();

        let config = Config::default().with_settle_time(100);
        let mut bench = Characterizer::new(&mut motor, config, &mut samples);
        bench.start(20, 0, &pulses, &mut console).unwrap();
        for now in 1..=2200 {
            bench.poll(now, &pulses, &mut console);
        }

        // the sample at the step instant still belongs to the previous duty
        assert!(!bench
            .samples()
            .iter()
            .any(|s| (1..100).contains(&(s.delta_ms % 2000))));
        assert_eq!(bench.samples()[0].delta_ms, 100);
        assert!(bench.samples().iter().any(|s| s.delta_ms == 2000));
        assert!(bench.samples().iter().any(|s| s.delta_ms == 2100));
    }

    #[test]
    fn restart_clears_previous_samples() {
        let mut motor = FakeMotor::default();
        let mut samples: Vec<Sample, CAPACITY> = Vec::new();
        let pulses = PulseCounter::new();
        let mut console = FakeConsole::default();

        let mut bench = Characterizer::new(&mut motor, Config::default(), &mut samples);
        bench.start(20, 0, &pulses, &mut console).unwrap();
        for now in 1..=400 {
            bench.poll(now, &pulses, &mut console);
        }
        assert_eq!(bench.samples().len(), 100);

        bench.start(10, 400, &pulses, &mut console).unwrap();
        assert!(bench.samples().is_empty());
        assert_eq!(bench.mode(), Mode::Capturing);
    }
}
