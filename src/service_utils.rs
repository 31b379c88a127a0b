use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::db::{DatabaseService, QueryField, RecordTable, StoreError};
use crate::mqtt_service::{MqttService, SessionEvent};
use crate::route_engine::{self, RouteEngine};

/// Forward session lifecycle events to the log so operators can follow
/// connect/disconnect transitions.
pub fn watch_session_events(mqtt_service: Arc<MqttService>) {
    let events = mqtt_service.subscribe_events();
    tokio::spawn(drain_session_events(events));
}

/// Falling behind the broadcast buffer is recoverable; only a closed channel
/// ends the watcher. Returns the number of events seen.
async fn drain_session_events(mut events: broadcast::Receiver<SessionEvent>) -> usize {
    let mut seen = 0usize;
    loop {
        match events.recv().await {
            Ok(event) => {
                seen += 1;
                info!("Session event: {:?}", event);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event watcher fell behind; missed {} session event(s).", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    seen
}

/// Block until ctrl-c, then tear the session down. Committed records are
/// never rolled back; only new deliveries stop.
pub async fn handle_shutdown(mqtt_service: Arc<MqttService>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }

    info!("Shutting down ingestion service...");
    mqtt_service.disconnect().await;
    info!(
        "Unmatched messages dropped this run: {}",
        mqtt_service.unmatched_count()
    );
}

/// One-shot `route <imei>` command: reconstruct and print the device route.
pub async fn run_route_command(db: &DatabaseService, engine: &RouteEngine, imei: &str) {
    let commands = match db.commands_for_imei(imei) {
        Ok(rows) => rows,
        Err(e) => {
            error!("Failed to read command history for {}: {}", imei, e);
            return;
        }
    };

    let payloads: Vec<String> = commands.into_iter().map(|row| row.message).collect();
    let fixes = route_engine::extract_fixes(&payloads);

    match engine.reconstruct(&fixes).await {
        Ok(route) => {
            info!(
                "Route for {}: {} waypoint(s), {:.1}m total.",
                imei,
                route.waypoints.len(),
                route.total_distance
            );
            for waypoint in &route.waypoints {
                info!("{}", waypoint.popup.replace('\n', " | "));
            }
        }
        Err(e) => error!("Route reconstruction for {} failed: {}", imei, e),
    }
}

/// One-shot `export <imei|topic> <value>` command: write the matching rows
/// as CSV to stdout.
pub fn run_export_command(db: &DatabaseService, field: &str, value: &str) {
    let field = match field {
        "imei" => QueryField::Imei,
        "topic" => QueryField::Topic,
        other => {
            error!("Unknown export field '{}', expected imei or topic.", other);
            return;
        }
    };

    match db.export_csv(RecordTable::Data, field, value) {
        Ok(bytes) => {
            if let Err(e) = std::io::stdout().write_all(&bytes) {
                error!("Failed to write CSV export: {}", e);
            }
        }
        Err(StoreError::NoData) => error!("No data found for the specified {:?}.", field),
        Err(e) => error!("Export failed: {}", e),
    }
}
