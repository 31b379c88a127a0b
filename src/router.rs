use crate::classifier::TelemetryLine;
use crate::models::{CommandRecord, TelemetryRecord};
use crate::registry::DeviceRegistry;

/// The record batch produced by one routing decision. Committed atomically
/// by the store, or not at all.
#[derive(Debug, Default)]
pub struct RoutingOutcome {
    pub telemetry: Vec<TelemetryRecord>,
    pub commands: Vec<CommandRecord>,
}

impl RoutingOutcome {
    /// An empty outcome means the message was unmatched and is dropped.
    pub fn is_empty(&self) -> bool {
        self.telemetry.is_empty() && self.commands.is_empty()
    }
}

/// Correlates an inbound message against the registry. A message is admitted
/// when the claimed IMEI matches a registered device, or the inbound topic is
/// a registered read topic, or both; unmatched traffic produces no records.
pub fn route(
    registry: &DeviceRegistry,
    imei_claim: &str,
    topic: &str,
    lines: &[TelemetryLine],
    raw_payload: &str,
    received_at: &str,
) -> RoutingOutcome {
    let mut outcome = RoutingOutcome::default();

    if let Some(device) = registry.match_by_imei(imei_claim) {
        for line in lines {
            outcome.telemetry.push(TelemetryRecord {
                imei: device.imei.clone(),
                topic: topic.to_string(),
                timestamp: line.timestamp.clone(),
                raw_line: line.raw_line.clone(),
                received_at: received_at.to_string(),
            });
        }
    }

    for device in registry.match_by_topic(topic) {
        outcome.commands.push(CommandRecord {
            imei: device.imei,
            topic: topic.to_string(),
            timestamp: received_at.to_string(),
            raw_payload: raw_payload.trim().to_string(),
            received_at: received_at.to_string(),
        });
    }

    outcome
}
