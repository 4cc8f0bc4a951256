use tracing::info;

/// Buzzer, marker laser and status LED.
pub trait Outputs: Send {
    fn beep(&mut self, count: u8);
    fn laser(&mut self, on: bool);
    fn led(&mut self, on: bool);
}

/// Outputs for a controller with nothing wired: log only.
#[derive(Debug, Default)]
pub struct LogOutputs {
    pub laser_on: bool,
    pub led_on: bool,
    pub beeps: u32,
}

impl Outputs for LogOutputs {
    fn beep(&mut self, count: u8) {
        self.beeps += u32::from(count);
        info!("beep x{}", count);
    }

    fn laser(&mut self, on: bool) {
        self.laser_on = on;
        info!("laser {}", if on { "on" } else { "off" });
    }

    fn led(&mut self, on: bool) {
        self.led_on = on;
        info!("led {}", if on { "on" } else { "off" });
    }
}
