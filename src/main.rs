mod classifier;
mod config;
mod db;
mod models;
mod mqtt_service;
mod registry;
mod route_engine;
mod router;
mod service_utils;

use crate::config::Config;
use crate::db::DatabaseService;
use crate::mqtt_service::MqttService;
use crate::registry::DeviceRegistry;
use crate::route_engine::RouteEngine;
use crate::service_utils::{
    handle_shutdown, run_export_command, run_route_command, watch_session_events,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let db_service = match DatabaseService::new(&config.database_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    let registry = Arc::new(DeviceRegistry::new(db_service.clone()));
    if let Err(e) = registry.load() {
        error!("Failed to load device registry: {:?}", e);
        return;
    }

    // One-shot maintenance commands: route reconstruction and CSV export.
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [command, imei] if command == "route" => {
            let engine = match RouteEngine::new(
                &config.route_service_url,
                Duration::from_millis(config.route_timeout_ms),
            ) {
                Ok(engine) => engine,
                Err(e) => {
                    error!("Failed to create route engine: {}", e);
                    return;
                }
            };
            run_route_command(&db_service, &engine, imei).await;
            return;
        }
        [command, field, value] if command == "export" => {
            run_export_command(&db_service, field, value);
            return;
        }
        [] => {}
        other => {
            error!("Unknown arguments: {:?}", other);
            return;
        }
    }

    if config.mqtt_host.is_empty() {
        error!("MQTT_HOST must be set to start the ingestion service.");
        return;
    }

    // Remember the configured broker and startup topics for later sessions.
    if let Err(e) = db_service.save_broker(&config.default_broker()) {
        error!("Failed to persist broker target: {:?}", e);
        return;
    }
    for topic in &config.startup_topics {
        if let Err(e) = db_service.save_topic(topic) {
            error!("Failed to persist topic '{}': {:?}", topic, e);
            return;
        }
    }

    let mqtt_service = MqttService::new(registry.clone(), db_service.clone());
    watch_session_events(mqtt_service.clone());

    if let Err(e) = mqtt_service.connect(&config.default_broker()).await {
        error!("Failed to connect to MQTT broker: {}", e);
        return;
    }

    let topics = match db_service.load_topics() {
        Ok(topics) => topics,
        Err(e) => {
            error!("Failed to load topic list: {:?}", e);
            return;
        }
    };
    for topic in &topics {
        if let Err(e) = mqtt_service.subscribe(topic).await {
            error!("Failed to subscribe to '{}': {}", topic, e);
        }
    }
    info!(
        "Ingesting on {} subscription(s) for {} registered device(s).",
        mqtt_service.active_subscription_count().await,
        registry.all().len()
    );

    handle_shutdown(mqtt_service).await;
    info!("All services shut down successfully.");
}
