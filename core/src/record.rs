//! Textual layout of a capture.
//!
//! A record is one header line followed by one line per sample, in capture
//! order, each terminated by `\n`.

use core::fmt::{self, Write};

use crate::{CaptureBuffer, VoltageScale};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordLayout {
    /// `voltage,elapsed_us`
    Csv,
    /// `index;voltage;millis`
    Indexed,
}

impl RecordLayout {
    pub const fn header(&self) -> &'static str {
        match self {
            RecordLayout::Csv => "Voltage,Time",
            RecordLayout::Indexed => "Index;Voltage;Millis",
        }
    }
}

/// Voltage formatted the way it appears in records and telemetry payloads.
pub struct Volts(pub f64);

impl fmt::Display for Volts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

pub fn write_record<W: Write>(
    out: &mut W,
    buffer: &CaptureBuffer,
    scale: &VoltageScale,
    layout: RecordLayout,
) -> fmt::Result {
    out.write_str(layout.header())?;
    out.write_char('\n')?;

    for (index, sample) in buffer.samples().iter().enumerate() {
        let volts = Volts(scale.volts(sample.value));
        match layout {
            RecordLayout::Csv => writeln!(out, "{},{}", volts, sample.elapsed_us)?,
            RecordLayout::Indexed => {
                writeln!(out, "{};{};{}", index, volts, buffer.sample_millis(sample))?
            }
        }
    }

    Ok(())
}
