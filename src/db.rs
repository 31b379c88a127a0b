use log::{error, info, warn};
use rusqlite::{params, Connection};
use std::sync::Mutex;
use thiserror::Error;

use crate::models::{BrokerTarget, CommandRecord, Device, StoredMessage, TelemetryRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no data matched the export predicate")]
    NoData,
    #[error("CSV export failed: {0}")]
    Export(String),
}

/// Which append-only relation a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTable {
    Data,
    Commands,
}

impl RecordTable {
    fn as_sql(self) -> &'static str {
        match self {
            RecordTable::Data => "data",
            RecordTable::Commands => "commands",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryField {
    Imei,
    Topic,
}

impl QueryField {
    fn as_sql(self) -> &'static str {
        match self {
            QueryField::Imei => "imei",
            QueryField::Topic => "topic",
        }
    }
}

pub struct DatabaseService {
    conn: Mutex<Connection>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS data (
            id INTEGER PRIMARY KEY,
            topic TEXT,
            message TEXT,
            timestamp TEXT,
            imei TEXT,
            received_at TEXT
        );

        CREATE TABLE IF NOT EXISTS commands (
            id INTEGER PRIMARY KEY,
            topic TEXT,
            message TEXT,
            timestamp TEXT,
            imei TEXT,
            received_at TEXT
        );

        CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY,
            imei TEXT NOT NULL UNIQUE,
            read_topic TEXT,
            comments TEXT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS brokers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL,
            port TEXT NOT NULL,
            username TEXT,
            password TEXT,
            client_id TEXT
        );

        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY,
            topic TEXT NOT NULL UNIQUE
        );

        CREATE INDEX IF NOT EXISTS idx_data_topic ON data(topic);
        CREATE INDEX IF NOT EXISTS idx_data_imei ON data(imei);
        CREATE INDEX IF NOT EXISTS idx_commands_topic ON commands(topic);
        CREATE INDEX IF NOT EXISTS idx_commands_imei ON commands(imei);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Commits all records produced by one routing decision in a single
    /// transaction, so a failure mid-insert never leaves partial telemetry.
    pub fn insert_batch(
        &self,
        telemetry: &[TelemetryRecord],
        commands: &[CommandRecord],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for record in telemetry {
            tx.execute(
                "INSERT INTO data (imei, timestamp, message, topic, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.imei,
                    record.timestamp,
                    record.raw_line,
                    record.topic,
                    record.received_at
                ],
            )?;
        }

        for record in commands {
            tx.execute(
                "INSERT INTO commands (imei, timestamp, message, topic, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.imei,
                    record.timestamp,
                    record.raw_payload,
                    record.topic,
                    record.received_at
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn query_table(
        conn: &Connection,
        table: RecordTable,
        field: QueryField,
        value: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT imei, timestamp, message, topic FROM {} WHERE {} = ?1 ORDER BY id",
            table.as_sql(),
            field.as_sql()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], |row| {
            Ok(StoredMessage {
                imei: row.get(0)?,
                timestamp: row.get(1)?,
                message: row.get(2)?,
                topic: row.get(3)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Retrieves stored messages in insertion order. Querying `data` by topic
    /// with no rows falls through to `commands` on the same topic.
    pub fn query(
        &self,
        table: RecordTable,
        field: QueryField,
        value: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let results = Self::query_table(&conn, table, field, value)?;
        if results.is_empty() && table == RecordTable::Data && field == QueryField::Topic {
            return Self::query_table(&conn, RecordTable::Commands, QueryField::Topic, value);
        }
        Ok(results)
    }

    /// The ordered command history for one device, input to route reconstruction.
    pub fn commands_for_imei(&self, imei: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::query_table(&conn, RecordTable::Commands, QueryField::Imei, imei)
    }

    /// Renders a query result as a CSV byte stream. An empty result set is a
    /// distinct `NoData` condition, not an empty file. Unlike `query`, the
    /// export reads only the requested table; the topic fallback is a display
    /// affordance, not part of the download.
    pub fn export_csv(
        &self,
        table: RecordTable,
        field: QueryField,
        value: &str,
    ) -> Result<Vec<u8>, StoreError> {
        let rows = {
            let conn = self.conn.lock().unwrap();
            Self::query_table(&conn, table, field, value)?
        };
        if rows.is_empty() {
            warn!(
                "No data found for export ({} = {}).",
                field.as_sql(),
                value
            );
            return Err(StoreError::NoData);
        }

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["IMEI", "Timestamp", "Message", "Topic"])
            .map_err(|e| StoreError::Export(e.to_string()))?;
        for row in &rows {
            writer
                .write_record([&row.imei, &row.timestamp, &row.message, &row.topic])
                .map_err(|e| StoreError::Export(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| StoreError::Export(e.to_string()))
    }

    // ---- device table, backing the registry ----

    pub fn load_devices(&self) -> Result<Vec<Device>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare("SELECT imei, read_topic, comments, timestamp FROM devices ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Device {
                imei: row.get(0)?,
                read_topic: row.get(1)?,
                comment: row.get(2)?,
                registered_at: row.get(3)?,
            })
        })?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    pub fn insert_device(&self, device: &Device) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (imei, read_topic, comments, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                device.imei,
                device.read_topic,
                device.comment,
                device.registered_at
            ],
        )?;
        Ok(())
    }

    pub fn delete_device(&self, imei: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM devices WHERE imei = ?1", params![imei])?)
    }

    // ---- broker / topic list persistence, consumed by the configuration boundary ----

    pub fn load_brokers(&self) -> Result<Vec<BrokerTarget>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT name, host, port, username, password, client_id FROM brokers ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BrokerTarget {
                name: row.get(0)?,
                host: row.get(1)?,
                port: row.get(2)?,
                username: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                password: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                client_id: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            })
        })?;

        let mut brokers = Vec::new();
        for row in rows {
            brokers.push(row?);
        }
        Ok(brokers)
    }

    pub fn save_broker(&self, target: &BrokerTarget) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO brokers (name, host, port, username, password, client_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                password = excluded.password,
                client_id = excluded.client_id
            "#,
            params![
                target.name,
                target.host,
                target.port,
                target.username,
                target.password,
                target.client_id
            ],
        )?;
        Ok(())
    }

    pub fn delete_broker(&self, name: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM brokers WHERE name = ?1", params![name])?)
    }

    pub fn load_topics(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare("SELECT topic FROM topics ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut topics = Vec::new();
        for row in rows {
            topics.push(row?);
        }
        Ok(topics)
    }

    pub fn save_topic(&self, topic: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO topics (topic) VALUES (?1) ON CONFLICT(topic) DO NOTHING",
            params![topic],
        )?;
        Ok(())
    }

    pub fn delete_topic(&self, topic: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM topics WHERE topic = ?1", params![topic])?)
    }
}
