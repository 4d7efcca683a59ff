use core::fmt::Write;

use crate::record::Volts;

pub const TELEMETRY_TOPIC: &str = "+/telemetry";

pub type TelemetryTopic = heapless::String<{ TELEMETRY_TOPIC.len() + 64 }>;
pub type VoltagePayload = heapless::String<24>;

/// Topic a node publishes its samples on, e.g. `decay-node/telemetry`.
pub fn telemetry_topic(node_id: &str) -> Option<TelemetryTopic> {
    let mut s = TelemetryTopic::new();

    let (l, r) = TELEMETRY_TOPIC.split_once('+')?;
    s.push_str(l).ok()?;
    s.push_str(node_id).ok()?;
    s.push_str(r).ok()?;

    Some(s)
}

pub fn parse_telemetry_topic(topic: &str) -> Option<&str> {
    let node_id = topic.strip_suffix("/telemetry")?;
    (!node_id.is_empty() && !node_id.contains('/')).then_some(node_id)
}

/// Decimal ASCII voltage, one per published message. `None` if the
/// reading does not fit the payload buffer.
pub fn voltage_payload(volts: f64) -> Option<VoltagePayload> {
    let mut s = VoltagePayload::new();
    write!(s, "{}", Volts(volts)).ok()?;
    Some(s)
}
