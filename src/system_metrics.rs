use crate::probe::celsius_to_fahrenheit;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, System};

const THERMAL_ZONE_PATH: &str = "/sys/devices/virtual/thermal/thermal_zone0/temp";

#[derive(Debug, Clone, Copy)]
pub struct SystemMetricsSnapshot {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub cpu_temp_f: i64,
    pub disk_free_mb: f64,
    pub updated_at: Instant,
}

struct MetricsState {
    system: System,
    disks: Disks,
    components: Components,
    last: Option<SystemMetricsSnapshot>,
}

/// Coarse OS metrics behind a time-bounded cache. Refreshed inline on access
/// when stale; there is no background refresher. CPU% is the non-blocking
/// delta variant, so the very first call reports 0.
pub struct SystemMetrics {
    state: Mutex<MetricsState>,
    refresh_interval: Duration,
}

impl SystemMetrics {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            state: Mutex::new(MetricsState {
                system: System::new(),
                disks: Disks::new_with_refreshed_list(),
                components: Components::new_with_refreshed_list(),
                last: None,
            }),
            refresh_interval,
        }
    }

    pub fn current(&self) -> SystemMetricsSnapshot {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(last) = state.last {
            if last.updated_at.elapsed() < self.refresh_interval {
                return last;
            }
        }
        let snapshot = refresh(&mut state);
        state.last = Some(snapshot);
        snapshot
    }
}

fn refresh(state: &mut MetricsState) -> SystemMetricsSnapshot {
    state.system.refresh_cpu_usage();
    state.system.refresh_memory();
    state.disks.refresh();
    state.components.refresh();

    let cpu_pct = {
        let value = f64::from(state.system.global_cpu_usage());
        if value.is_finite() && value >= 0.0 {
            value
        } else {
            0.0
        }
    };

    let total_memory = state.system.total_memory();
    let mem_pct = if total_memory > 0 {
        state.system.used_memory() as f64 / total_memory as f64 * 100.0
    } else {
        0.0
    };

    let cpu_temp_f = cpu_temperature_f(&state.components);
    let disk_free_mb = disk_free_mb(&state.disks);

    SystemMetricsSnapshot {
        cpu_pct,
        mem_pct,
        cpu_temp_f,
        disk_free_mb,
        updated_at: Instant::now(),
    }
}

fn cpu_temperature_f(components: &Components) -> i64 {
    let from_components = components
        .iter()
        .find(|component| {
            let label = component.label().to_lowercase();
            label.contains("cpu") || label.contains("soc")
        })
        .map(|component| component.temperature())
        .map(f64::from)
        .filter(|value| value.is_finite());

    let celsius = from_components.or_else(read_thermal_zone_celsius);
    match celsius {
        Some(celsius) => celsius_to_fahrenheit(celsius).round() as i64,
        None => 0,
    }
}

// Raspberry Pi thermal zone: millidegrees Celsius, one line.
fn read_thermal_zone_celsius() -> Option<f64> {
    let raw = std::fs::read_to_string(THERMAL_ZONE_PATH).ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    let celsius = millidegrees / 1000.0;
    celsius.is_finite().then_some(celsius)
}

fn disk_free_mb(disks: &Disks) -> f64 {
    let disk = disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first());
    match disk {
        Some(disk) => disk.available_space() as f64 / (1024.0 * 1024.0),
        None => 0.0,
    }
}
