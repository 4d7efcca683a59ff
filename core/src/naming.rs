use core::fmt::Write;

use crate::CalendarTimestamp;

pub const MAX_NAME_LEN: usize = 32;

pub type ArtifactName = heapless::String<MAX_NAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("artifact name exceeds the maximum name length")]
pub struct NameTooLong;

/// `MMDDHHmm.<extension>`
///
/// Two captures within the same minute get the same name.
pub fn timestamp_artifact_name(
    timestamp: &CalendarTimestamp,
    extension: &str,
) -> Result<ArtifactName, NameTooLong> {
    let mut name = ArtifactName::new();
    write!(
        name,
        "{:02}{:02}{:02}{:02}.{}",
        timestamp.month, timestamp.day, timestamp.hour, timestamp.minute, extension
    )
    .map_err(|_| NameTooLong)?;
    Ok(name)
}

/// `<prefix><counter>.<extension>`, e.g. `data_3.txt`.
pub fn counter_artifact_name(
    prefix: &str,
    counter: u32,
    extension: &str,
) -> Result<ArtifactName, NameTooLong> {
    let mut name = ArtifactName::new();
    write!(name, "{prefix}{counter}.{extension}").map_err(|_| NameTooLong)?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_name_is_zero_padded() {
        let timestamp = CalendarTimestamp {
            year: 2024,
            month: 3,
            day: 7,
            hour: 9,
            minute: 5,
            second: 59,
        };
        assert_eq!(
            timestamp_artifact_name(&timestamp, "csv").unwrap(),
            "03070905.csv"
        );
    }

    #[test]
    fn counter_name() {
        assert_eq!(counter_artifact_name("data_", 0, "txt").unwrap(), "data_0.txt");
        assert_eq!(counter_artifact_name("data_", 42, "txt").unwrap(), "data_42.txt");
    }

    #[test]
    fn oversized_name_is_rejected() {
        let prefix = "a_very_long_prefix_that_does_not_fit_";
        assert_eq!(counter_artifact_name(prefix, 1, "txt"), Err(NameTooLong));
    }
}
