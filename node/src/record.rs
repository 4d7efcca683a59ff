use decay_core::{
    record::{write_record, RecordLayout},
    CaptureBuffer, VoltageScale,
};

/// Serialized form of one capture. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    layout: RecordLayout,
    text: String,
}

impl Record {
    pub fn serialize(buffer: &CaptureBuffer, scale: &VoltageScale, layout: RecordLayout) -> Self {
        // header plus roughly "3.300,123456\n" per sample
        let mut text = String::with_capacity(layout.header().len() + 1 + buffer.len() * 16);
        // Writing into a String cannot fail
        let _ = write_record(&mut text, buffer, scale, layout);

        Self { layout, text }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Number of data lines, excluding the header.
    pub fn sample_lines(&self) -> usize {
        self.text.lines().count().saturating_sub(1)
    }

    pub fn log_lines(&self) {
        if log::log_enabled!(log::Level::Trace) {
            for line in self.text.lines() {
                log::trace!("{line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decay_core::{AdcResolution, Sample};

    #[test]
    fn line_count_matches_samples() {
        let mut buffer = CaptureBuffer::new(0);
        for i in 0..499u32 {
            buffer
                .push(Sample {
                    value: (i * 8) as u16,
                    elapsed_us: i * 3,
                })
                .unwrap();
        }
        let scale = VoltageScale::new(3.3, AdcResolution::BITS_12);

        let record = Record::serialize(&buffer, &scale, RecordLayout::Csv);

        assert_eq!(record.sample_lines(), buffer.len());
        assert!(record.as_str().starts_with("Voltage,Time\n0.000,0\n"));
        assert!(record.as_str().ends_with('\n'));
    }

    #[test]
    fn empty_capture_is_header_only() {
        let scale = VoltageScale::new(3.3, AdcResolution::BITS_10);
        let record = Record::serialize(&CaptureBuffer::new(0), &scale, RecordLayout::Indexed);

        assert_eq!(record.as_str(), "Index;Voltage;Millis\n");
        assert_eq!(record.sample_lines(), 0);
    }
}
