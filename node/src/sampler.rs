use std::time::{Duration, Instant};

use decay_core::{CaptureBuffer, Sample};

use crate::peripherals::{AnalogInput, ExcitationPin, PeripheralError};

/// Charges the capacitor, releases it and records the discharge curve.
pub struct Sampler<A, P> {
    input: A,
    excitation: P,
    settle_time: Duration,
    sample_count: usize,
    boot: Instant,
}

impl<A: AnalogInput, P: ExcitationPin> Sampler<A, P> {
    pub fn new(input: A, excitation: P, settle_time: Duration, sample_count: usize) -> Self {
        Self {
            input,
            excitation,
            settle_time,
            sample_count,
            boot: Instant::now(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Blocks for the settle time plus `sample_count` conversions.
    ///
    /// Samples are taken back to back, so the cadence is whatever a single
    /// conversion takes. A failed conversion is recorded as 0.
    pub fn capture(&mut self) -> Result<CaptureBuffer, PeripheralError> {
        self.excitation.set_high()?;
        std::thread::sleep(self.settle_time);
        self.excitation.set_low()?;

        let start = Instant::now();
        let started_at_ms = start.duration_since(self.boot).as_millis() as u64;
        let mut buffer = CaptureBuffer::new(started_at_ms);
        let mut failed_reads = 0usize;

        for _ in 0..self.sample_count {
            let elapsed_us = start.elapsed().as_micros().min(u32::MAX as u128) as u32;
            let value = match self.input.read() {
                Ok(value) => value,
                Err(PeripheralError::ReadFailed) => {
                    failed_reads += 1;
                    0
                }
                Err(e) => return Err(e),
            };

            if buffer.push(Sample { value, elapsed_us }).is_err() {
                log::warn!("Capture buffer full after {} samples", buffer.len());
                break;
            }
        }

        if failed_reads > 0 {
            log::warn!("{failed_reads} of {} conversions failed", self.sample_count);
        }
        log::info!(
            "Data sampled: {} samples in {}us",
            buffer.len(),
            start.elapsed().as_micros()
        );

        Ok(buffer)
    }
}
