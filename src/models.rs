use time::macros::format_description;
use time::OffsetDateTime;

/// Wall-clock receive timestamp, `YYYY-MM-DD HH:MM:SS`.
pub fn now_timestamp() -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| String::new())
}

/// A registered fleet device. `imei` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub imei: String,
    pub read_topic: String,
    pub comment: String,
    pub registered_at: String,
}

/// Broker connection parameters as configured by the operator. The port is
/// kept as the raw configured string and validated at connect time.
#[derive(Debug, Clone)]
pub struct BrokerTarget {
    pub name: String,
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// One parsed telemetry line, headed for the `data` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub imei: String,
    pub topic: String,
    pub timestamp: String,
    pub raw_line: String,
    pub received_at: String,
}

/// One full inbound payload addressed to a device's read topic, headed for
/// the `commands` table. Stored verbatim, stamped with receive time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub imei: String,
    pub topic: String,
    pub timestamp: String,
    pub raw_payload: String,
    pub received_at: String,
}

/// A row read back from the `data` or `commands` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub imei: String,
    pub timestamp: String,
    pub message: String,
    pub topic: String,
}

/// A GPS coordinate sample extracted from a stored command payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub valid: bool,
}
