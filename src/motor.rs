use motor_protocol::{MotorDriver, MAX_DUTY};
use stm32f4xx_hal::{
    gpio::{Output, PushPull, PB12, PB13},
    pac::TIM3,
    timer::PwmChannel,
};

/// DC motor behind an H-bridge: PWM on the enable input, forward
/// direction on IN1/IN2. At duty 0 both inputs go low and the motor coasts.
pub struct PwmMotor {
    enable: PwmChannel<TIM3, 0>,
    in1: PB12<Output<PushPull>>,
    in2: PB13<Output<PushPull>>,
}

impl PwmMotor {
    pub fn new(
        mut enable: PwmChannel<TIM3, 0>,
        mut in1: PB12<Output<PushPull>>,
        mut in2: PB13<Output<PushPull>>,
    ) -> Self {
        enable.set_duty(0);
        enable.enable();
        in1.set_low();
        in2.set_low();
        Self { enable, in1, in2 }
    }
}

impl MotorDriver for PwmMotor {
    fn set_duty(&mut self, percent: u8) {
        let max = u32::from(self.enable.get_max_duty());
        let duty = max * u32::from(percent.min(MAX_DUTY)) / u32::from(MAX_DUTY);
        self.enable.set_duty(duty as u16);
        if percent == 0 {
            self.in1.set_low();
        } else {
            self.in1.set_high();
        }
        self.in2.set_low();
    }
}
