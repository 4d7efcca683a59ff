use std::{
    net::UdpSocket,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use decay_core::CalendarTimestamp;
use jiff::{civil::DateTime, tz::Offset, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum TimeSourceError {
    #[error("time source reported no time")]
    NoTime,
    #[error("time source query failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed time source reply")]
    Malformed,
    #[error("time out of range: {0}")]
    OutOfRange(#[from] jiff::Error),
}

/// Something that knows the current UTC time in seconds since the epoch.
pub trait TimeSource {
    fn epoch_seconds(&mut self) -> Result<u64, TimeSourceError>;
}

impl<T: TimeSource + ?Sized> TimeSource for Box<T> {
    fn epoch_seconds(&mut self) -> Result<u64, TimeSourceError> {
        (**self).epoch_seconds()
    }
}

pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn epoch_seconds(&mut self) -> Result<u64, TimeSourceError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|_| TimeSourceError::NoTime)
    }
}

/// Minimal SNTP client (RFC 4330), one request per query.
pub struct SntpTimeSource {
    server: String,
    timeout: Duration,
}

impl SntpTimeSource {
    /// Seconds between the NTP era start (1900) and the unix epoch.
    const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    fn parse_reply(reply: &[u8]) -> Result<u64, TimeSourceError> {
        if reply.len() < 48 {
            return Err(TimeSourceError::Malformed);
        }
        let transmit_secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]);
        u64::from(transmit_secs)
            .checked_sub(Self::NTP_UNIX_OFFSET)
            .ok_or(TimeSourceError::NoTime)
    }
}

impl TimeSource for SntpTimeSource {
    fn epoch_seconds(&mut self) -> Result<u64, TimeSourceError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;
        socket.connect(&self.server)?;

        // LI = 0, VN = 4, Mode = 3 (client)
        let mut request = [0u8; 48];
        request[0] = 0b00_100_011;
        socket.send(&request)?;

        let mut reply = [0u8; 48];
        let len = socket.recv(&mut reply)?;
        Self::parse_reply(&reply[..len])
    }
}

/// Turns the network time into local calendar fields.
pub struct ClockResolver<T> {
    source: T,
    utc_offset: Offset,
}

impl<T: TimeSource> ClockResolver<T> {
    pub fn new(source: T, utc_offset_hours: i8) -> Result<Self, TimeSourceError> {
        Ok(Self {
            source,
            utc_offset: Offset::from_hours(utc_offset_hours)?,
        })
    }

    /// Queries the source every call; results are never cached.
    pub fn resolve_now(&mut self) -> Result<CalendarTimestamp, TimeSourceError> {
        let epoch = self.source.epoch_seconds()?;
        // The radio's time query answers 0 until it has heard from a server
        if epoch == 0 {
            return Err(TimeSourceError::NoTime);
        }

        let seconds = i64::try_from(epoch).map_err(|_| TimeSourceError::Malformed)?;
        let local = self.utc_offset.to_datetime(Timestamp::from_second(seconds)?);

        let timestamp = CalendarTimestamp {
            year: local.year() as u16,
            month: local.month() as u8,
            day: local.day() as u8,
            hour: local.hour() as u8,
            minute: local.minute() as u8,
            second: local.second() as u8,
        };
        log::debug!("Resolved local time {timestamp:?}");

        Ok(timestamp)
    }
}

/// File modification time for a resolved timestamp.
///
/// The calendar fields are local time without a zone, the way FAT stores
/// them, so they are written as if they were UTC.
pub fn modified_time(timestamp: &CalendarTimestamp) -> Result<SystemTime, TimeSourceError> {
    let datetime = DateTime::new(
        timestamp.year as i16,
        timestamp.month as i8,
        timestamp.day as i8,
        timestamp.hour as i8,
        timestamp.minute as i8,
        timestamp.second as i8,
        0,
    )?;
    Ok(SystemTime::from(Offset::UTC.to_timestamp(datetime)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    /// Replays a queue of epoch values, repeating the last one.
    #[derive(Clone)]
    pub struct FixedTimeSource {
        pub epochs: Rc<RefCell<VecDeque<u64>>>,
    }

    impl FixedTimeSource {
        pub fn new(epochs: &[u64]) -> Self {
            Self {
                epochs: Rc::new(RefCell::new(epochs.iter().copied().collect())),
            }
        }
    }

    impl TimeSource for FixedTimeSource {
        fn epoch_seconds(&mut self) -> Result<u64, TimeSourceError> {
            let mut epochs = self.epochs.borrow_mut();
            match epochs.len() {
                0 => Err(TimeSourceError::NoTime),
                1 => Ok(epochs[0]),
                _ => Ok(epochs.pop_front().unwrap_or_default()),
            }
        }
    }

    // 2024-03-07T16:05:09Z
    const EPOCH: u64 = 1_709_827_509;

    #[test]
    fn applies_utc_offset() {
        let mut resolver = ClockResolver::new(FixedTimeSource::new(&[EPOCH]), -7).unwrap();

        assert_eq!(
            resolver.resolve_now().unwrap(),
            CalendarTimestamp {
                year: 2024,
                month: 3,
                day: 7,
                hour: 9,
                minute: 5,
                second: 9,
            }
        );
    }

    #[test]
    fn offset_can_cross_midnight() {
        // 2024-01-01T03:00:00Z
        let mut resolver =
            ClockResolver::new(FixedTimeSource::new(&[1_704_078_000]), -7).unwrap();
        let timestamp = resolver.resolve_now().unwrap();

        assert_eq!((timestamp.year, timestamp.month, timestamp.day), (2023, 12, 31));
        assert_eq!(timestamp.hour, 20);
    }

    #[test]
    fn same_tick_resolves_identically() {
        let mut resolver = ClockResolver::new(FixedTimeSource::new(&[EPOCH]), -7).unwrap();
        assert_eq!(resolver.resolve_now().unwrap(), resolver.resolve_now().unwrap());
    }

    #[test]
    fn zero_epoch_is_unavailable() {
        let mut resolver = ClockResolver::new(FixedTimeSource::new(&[0]), -7).unwrap();
        assert!(matches!(resolver.resolve_now(), Err(TimeSourceError::NoTime)));

        let mut resolver = ClockResolver::new(FixedTimeSource::new(&[]), -7).unwrap();
        assert!(matches!(resolver.resolve_now(), Err(TimeSourceError::NoTime)));
    }

    #[test]
    fn sntp_reply_parsing() {
        let mut reply = [0u8; 48];
        let ntp_secs = (EPOCH + SntpTimeSource::NTP_UNIX_OFFSET) as u32;
        reply[40..44].copy_from_slice(&ntp_secs.to_be_bytes());

        assert_eq!(SntpTimeSource::parse_reply(&reply).unwrap(), EPOCH);
        assert!(matches!(
            SntpTimeSource::parse_reply(&reply[..20]),
            Err(TimeSourceError::Malformed)
        ));
    }

    #[test]
    fn sntp_query_against_loopback_server() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut request = [0u8; 48];
            let (_, peer) = server.recv_from(&mut request).unwrap();
            assert_eq!(request[0] & 0b111, 3);

            let mut reply = [0u8; 48];
            let ntp_secs = (EPOCH + SntpTimeSource::NTP_UNIX_OFFSET) as u32;
            reply[40..44].copy_from_slice(&ntp_secs.to_be_bytes());
            server.send_to(&reply, peer).unwrap();
        });

        let mut source = SntpTimeSource::new(addr.to_string(), Duration::from_secs(2));
        assert_eq!(source.epoch_seconds().unwrap(), EPOCH);
        handle.join().unwrap();
    }

    #[test]
    fn modified_time_uses_calendar_fields() {
        let timestamp = CalendarTimestamp {
            year: 1970,
            month: 1,
            day: 2,
            hour: 0,
            minute: 0,
            second: 1,
        };
        assert_eq!(
            modified_time(&timestamp).unwrap(),
            UNIX_EPOCH + Duration::from_secs(86_401)
        );
    }
}
