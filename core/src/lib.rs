#![cfg_attr(not(test), no_std)]

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "config")]
pub mod config;
pub mod naming;
pub mod record;
pub mod topics;

use heapless::Vec;

/// Upper bound on the number of samples a single capture can hold.
pub const MAX_SAMPLES: usize = 2048;

/// One analog reading together with the time it was taken, relative to the
/// start of the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Sample {
    pub value: u16,
    pub elapsed_us: u32,
}

/// The ordered samples of a single capture.
///
/// Index position is the acquisition order. A buffer is only ever appended
/// to while capturing and is read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    samples: Vec<Sample, MAX_SAMPLES>,
    started_at_ms: u64,
}

impl CaptureBuffer {
    pub const fn new(started_at_ms: u64) -> Self {
        Self {
            samples: Vec::new(),
            started_at_ms,
        }
    }

    /// Appends a sample, handing it back when the buffer is full.
    pub fn push(&mut self, sample: Sample) -> Result<(), Sample> {
        self.samples.push(sample)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Node uptime in milliseconds when the capture started.
    pub const fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Uptime in milliseconds at which the given sample was taken.
    pub fn sample_millis(&self, sample: &Sample) -> u64 {
        self.started_at_ms + u64::from(sample.elapsed_us / 1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdcResolution(u8);

impl AdcResolution {
    pub const BITS_10: Self = Self(10);
    pub const BITS_12: Self = Self(12);

    pub const fn new(bits: u8) -> Option<Self> {
        if bits == 0 || bits > 16 {
            None
        } else {
            Some(Self(bits))
        }
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Highest code the converter can report, e.g. 4095 at 12 bits.
    pub const fn max_code(&self) -> u16 {
        ((1u32 << self.0) - 1) as u16
    }
}

/// Linear conversion from raw converter codes to volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageScale {
    reference_voltage: f64,
    resolution: AdcResolution,
}

impl VoltageScale {
    pub const fn new(reference_voltage: f64, resolution: AdcResolution) -> Self {
        Self {
            reference_voltage,
            resolution,
        }
    }

    pub const fn reference_voltage(&self) -> f64 {
        self.reference_voltage
    }

    pub const fn resolution(&self) -> AdcResolution {
        self.resolution
    }

    pub fn volts(&self, code: u16) -> f64 {
        f64::from(code) * self.reference_voltage / f64::from(self.resolution.max_code())
    }
}

/// Local wall-clock time resolved once per trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CalendarTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}
