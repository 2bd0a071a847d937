use std::{thread, time::Duration};

use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use log::{info, warn};

enum RelayBackend {
    Gpio(PinDriver<'static, AnyOutputPin, Output>),
    Disabled,
}

/// Momentary contact across the opener's push-button terminals.
pub struct Relay {
    backend: RelayBackend,
    pulse: Duration,
    pulses: u64,
}

impl Relay {
    pub fn new(pin: AnyOutputPin, pulse: Duration) -> anyhow::Result<Self> {
        let mut driver = PinDriver::output(pin)?;
        driver.set_low()?;
        Ok(Self {
            backend: RelayBackend::Gpio(driver),
            pulse,
            pulses: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            backend: RelayBackend::Disabled,
            pulse: Duration::ZERO,
            pulses: 0,
        }
    }

    pub fn pulse(&mut self) -> anyhow::Result<()> {
        let RelayBackend::Gpio(driver) = &mut self.backend else {
            warn!("relay disabled; pulse skipped");
            return Ok(());
        };

        driver.set_high()?;
        thread::sleep(self.pulse);
        driver.set_low()?;
        self.pulses += 1;

        info!("relay pulsed for {:?} (total {})", self.pulse, self.pulses);
        Ok(())
    }
}
