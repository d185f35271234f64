use crate::identity::HostIdentity;
use crate::sensor_cache::SensorCache;
use crate::system_metrics::SystemMetrics;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const WALL_CLOCK_FORMAT: &str = "%m/%d/%Y %H:%M:%S";
const ROWID_FORMAT: &str = "%Y%m%d%H%M%S";

/// One row on the wire. Field names match the server table schema exactly;
/// numeric fields are unquoted JSON numbers, everything else is a string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub uuid: String,
    pub rowid: String,
    pub hostname: String,
    pub host: String,
    pub ipaddress: String,
    pub macaddress: String,
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
    pub equivalentco2ppm: f64,
    pub totalvocppb: f64,
    pub pressure: f64,
    pub temperatureicp: f64,
    pub cputempf: i64,
    pub cpu: f64,
    pub memory: f64,
    pub diskusage: String,
    pub runtime: i64,
    pub ts: i64,
    pub systemtime: String,
    pub starttime: String,
    pub endtime: String,
    pub datetimestamp: String,
    pub te: String,
}

/// Produces fully-populated rows by merging the sensor cache, system metrics
/// and host identity with per-row identifiers and timestamps.
pub struct ReadingAssembler {
    cache: Arc<SensorCache>,
    metrics: Arc<SystemMetrics>,
    identity: HostIdentity,
    process_start: Instant,
}

impl ReadingAssembler {
    pub fn new(
        cache: Arc<SensorCache>,
        metrics: Arc<SystemMetrics>,
        identity: HostIdentity,
    ) -> Self {
        Self {
            cache,
            metrics,
            identity,
            process_start: Instant::now(),
        }
    }

    pub fn assemble(&self) -> Reading {
        let sample_started = Instant::now();
        let start_wall = Utc::now();

        let sensors = self.cache.snapshot();
        let system = self.metrics.current();

        let now = Utc::now();
        let elapsed = sample_started.elapsed().as_secs_f64();

        let row_uuid = Uuid::new_v4().to_string();
        let rowid = format!("{}_{row_uuid}", now.format(ROWID_FORMAT));
        let end_secs = now.timestamp_micros() as f64 / 1_000_000.0;

        Reading {
            uuid: row_uuid,
            rowid,
            hostname: self.identity.hostname().to_string(),
            host: self.identity.hostname().to_string(),
            ipaddress: self.identity.ipv4().to_string(),
            macaddress: self.identity.mac().to_string(),
            temperature: round_to(sanitize(sensors.values.temperature_c), 4),
            humidity: round_to(sanitize(sensors.values.humidity_pct), 2),
            co2: round_to(sanitize(sensors.values.co2_ppm), 2),
            equivalentco2ppm: round_to(sanitize(sensors.values.equivalent_co2_ppm), 5),
            totalvocppb: round_to(sanitize(sensors.values.total_voc_ppb), 3),
            pressure: round_to(sanitize(sensors.values.pressure_pa), 2),
            temperatureicp: round_to(sanitize(sensors.values.temperature_icp_f), 2),
            cputempf: system.cpu_temp_f,
            cpu: round_to(sanitize(system.cpu_pct), 1),
            memory: round_to(sanitize(system.mem_pct), 1),
            diskusage: format!("{:.1} MB", sanitize(system.disk_free_mb)),
            runtime: self.process_start.elapsed().as_secs() as i64,
            ts: now.timestamp(),
            systemtime: now.format(WALL_CLOCK_FORMAT).to_string(),
            starttime: start_wall.format(WALL_CLOCK_FORMAT).to_string(),
            endtime: format!("{end_secs:.6}"),
            datetimestamp: now.to_rfc3339(),
            te: format!("{elapsed:.6}"),
        }
    }
}

/// One compact JSON object per line, newline separated, no enclosing array.
pub fn to_ndjson(rows: &[Reading]) -> Result<String> {
    let mut lines = Vec::with_capacity(rows.len());
    for row in rows {
        lines.push(serde_json::to_string(row)?);
    }
    Ok(lines.join("\n"))
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10_f64.powi(digits as i32);
    (value * factor).round() / factor
}
