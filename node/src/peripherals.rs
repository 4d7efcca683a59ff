//! Hardware the sampler drives, and a simulated RC discharge for host runs.

use std::{cell::RefCell, rc::Rc, time::Instant};

use decay_core::AdcResolution;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeripheralError {
    /// The peripheral was never initialized or went away.
    #[error("{0} is not available")]
    Unavailable(&'static str),
    /// A single conversion failed; the peripheral is still usable.
    #[error("conversion failed")]
    ReadFailed,
}

pub trait AnalogInput {
    fn read(&mut self) -> Result<u16, PeripheralError>;
}

pub trait ExcitationPin {
    fn set_high(&mut self) -> Result<(), PeripheralError>;
    fn set_low(&mut self) -> Result<(), PeripheralError>;
}

/// Simulated capacitor behind an excitation pin and an analog input.
///
/// Driving the pin high charges the capacitor to the supply voltage; once
/// released it decays with time constant `rc_secs`.
#[derive(Debug, Clone)]
pub struct DischargeRig {
    state: Rc<RefCell<RigState>>,
}

#[derive(Debug)]
struct RigState {
    max_code: u16,
    rc_secs: f64,
    noise_codes: u16,
    charged: bool,
    released_at: Option<Instant>,
}

impl DischargeRig {
    pub fn new(resolution: AdcResolution, rc_secs: f64, noise_codes: u16) -> Self {
        Self {
            state: Rc::new(RefCell::new(RigState {
                max_code: resolution.max_code(),
                rc_secs,
                noise_codes,
                charged: false,
                released_at: None,
            })),
        }
    }

    pub fn split(self) -> (RigInput, RigExcitation) {
        (
            RigInput {
                state: self.state.clone(),
            },
            RigExcitation { state: self.state },
        )
    }
}

pub struct RigInput {
    state: Rc<RefCell<RigState>>,
}

impl AnalogInput for RigInput {
    fn read(&mut self) -> Result<u16, PeripheralError> {
        let state = self.state.borrow();
        let max = f64::from(state.max_code);

        let level = match (state.charged, state.released_at) {
            (true, _) => max,
            (false, Some(released_at)) => {
                let t = released_at.elapsed().as_secs_f64();
                max * (-t / state.rc_secs).exp()
            }
            (false, None) => 0.0,
        };

        let noise = if state.noise_codes == 0 {
            0.0
        } else {
            let n = f64::from(state.noise_codes);
            rand::thread_rng().gen_range(-n..=n)
        };

        Ok((level + noise).round().clamp(0.0, max) as u16)
    }
}

pub struct RigExcitation {
    state: Rc<RefCell<RigState>>,
}

impl ExcitationPin for RigExcitation {
    fn set_high(&mut self) -> Result<(), PeripheralError> {
        let mut state = self.state.borrow_mut();
        state.charged = true;
        state.released_at = None;
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), PeripheralError> {
        let mut state = self.state.borrow_mut();
        if state.charged {
            state.released_at = Some(Instant::now());
        }
        state.charged = false;
        Ok(())
    }
}
