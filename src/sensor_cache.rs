use crate::probe::{ProbeReading, SensorProbe};
use anyhow::{Context, Result};
use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(20);

/// Most-recent values from all probes, merged field by field.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorValues {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub co2_ppm: f64,
    pub equivalent_co2_ppm: f64,
    pub total_voc_ppb: f64,
    pub pressure_pa: f64,
    pub temperature_icp_f: f64,
}

#[derive(Debug, Clone)]
pub struct SensorSnapshot {
    pub values: SensorValues,
    pub updated_at: Option<Instant>,
    pub update_count: u64,
    pub probe_errors: u64,
}

#[derive(Debug)]
struct Shared {
    values: SensorValues,
    updated_at: Option<Instant>,
    update_count: u64,
    probe_errors: u64,
    rounds_completed: u64,
}

/// Decouples slow probe reads from row emission. A single background thread
/// samples every probe each cycle; `snapshot()` is a short lock and a copy.
pub struct SensorCache {
    shared: Arc<Mutex<Shared>>,
    shutdown_tx: Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stale_after: Duration,
    started_at: Instant,
}

impl SensorCache {
    pub fn start(
        probes: Vec<Box<dyn SensorProbe>>,
        sample_period: Duration,
        stale_after: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Mutex::new(Shared {
            values: SensorValues::default(),
            updated_at: None,
            update_count: 0,
            probe_errors: 0,
            rounds_completed: 0,
        }));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("sensor-cache".to_string())
            .spawn(move || {
                let mut probes = probes;
                loop {
                    for probe in probes.iter_mut() {
                        // Allow shutdown to cut a multi-probe round short.
                        match shutdown_rx.try_recv() {
                            Ok(()) | Err(TryRecvError::Disconnected) => return,
                            Err(TryRecvError::Empty) => {}
                        }
                        match probe.sample() {
                            Ok(reading) => {
                                let mut state = lock(&worker_shared);
                                merge(&mut state.values, &reading);
                                state.updated_at = Some(Instant::now());
                                state.update_count += 1;
                            }
                            Err(err) => {
                                tracing::debug!(probe = probe.name(), error = %err, "probe sample failed");
                                lock(&worker_shared).probe_errors += 1;
                            }
                        }
                    }
                    lock(&worker_shared).rounds_completed += 1;

                    match shutdown_rx.recv_timeout(sample_period) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            })
            .context("failed to spawn sensor cache worker")?;

        Ok(Self {
            shared,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            stale_after,
            started_at: Instant::now(),
        })
    }

    /// Consistent copy of the current snapshot. Never blocks on probe I/O;
    /// before the first successful sample it is all zeros with
    /// `update_count == 0`.
    pub fn snapshot(&self) -> SensorSnapshot {
        let state = lock(&self.shared);
        SensorSnapshot {
            values: state.values,
            updated_at: state.updated_at,
            update_count: state.update_count,
            probe_errors: state.probe_errors,
        }
    }

    /// True once no probe has produced a value for longer than the stale
    /// threshold. Rows keep flowing either way; this only feeds health logs.
    pub fn stale(&self) -> bool {
        let state = lock(&self.shared);
        match state.updated_at {
            Some(at) => at.elapsed() > self.stale_after,
            None => state.rounds_completed > 0 && self.started_at.elapsed() > self.stale_after,
        }
    }

    /// Signals the worker and joins it with a bounded wait. A probe stuck in
    /// a long `sample()` is abandoned rather than holding up shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = match lock(&self.worker).take() {
            Some(handle) => handle,
            None => return,
        };
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("sensor cache worker did not stop in time; detaching");
                return;
            }
            std::thread::sleep(JOIN_POLL);
        }
        let _ = handle.join();
    }
}

fn merge(values: &mut SensorValues, reading: &ProbeReading) {
    if let Some(v) = reading.temperature_c {
        values.temperature_c = v;
    }
    if let Some(v) = reading.humidity_pct {
        values.humidity_pct = v;
    }
    if let Some(v) = reading.co2_ppm {
        values.co2_ppm = v;
    }
    if let Some(v) = reading.equivalent_co2_ppm {
        values.equivalent_co2_ppm = v;
    }
    if let Some(v) = reading.total_voc_ppb {
        values.total_voc_ppb = v;
    }
    if let Some(v) = reading.pressure_pa {
        values.pressure_pa = v;
    }
    if let Some(v) = reading.temperature_icp_f {
        values.temperature_icp_f = v;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;

    struct FixedProbe {
        reading: ProbeReading,
        delay: Duration,
    }

    impl SensorProbe for FixedProbe {
        fn name(&self) -> &str {
            "fixed"
        }

        fn sample(&mut self) -> Result<ProbeReading, ProbeError> {
            std::thread::sleep(self.delay);
            Ok(self.reading)
        }
    }

    struct FlakyProbe {
        fail_after: u32,
        calls: u32,
    }

    impl SensorProbe for FlakyProbe {
        fn name(&self) -> &str {
            "flaky"
        }

        fn sample(&mut self) -> Result<ProbeReading, ProbeError> {
            self.calls += 1;
            if self.calls > self.fail_after {
                return Err(ProbeError("bus timeout".to_string()));
            }
            Ok(ProbeReading {
                co2_ppm: Some(f64::from(self.calls) * 100.0),
                ..ProbeReading::default()
            })
        }
    }

    #[test]
    fn first_snapshot_is_zeros() {
        let cache = SensorCache::start(
            vec![Box::new(FixedProbe {
                reading: ProbeReading {
                    temperature_c: Some(21.5),
                    ..ProbeReading::default()
                },
                delay: Duration::from_secs(5),
            })],
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .unwrap();

        let snap = cache.snapshot();
        assert_eq!(snap.update_count, 0);
        assert_eq!(snap.values.temperature_c, 0.0);
        cache.shutdown();
    }

    #[test]
    fn snapshot_does_not_block_on_slow_probe() {
        let cache = SensorCache::start(
            vec![Box::new(FixedProbe {
                reading: ProbeReading {
                    temperature_c: Some(21.5),
                    ..ProbeReading::default()
                },
                delay: Duration::from_secs(1),
            })],
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .unwrap();

        let started = Instant::now();
        for _ in 0..1000 {
            let _ = cache.snapshot();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        cache.shutdown();
    }

    #[test]
    fn failed_sample_keeps_previous_value() {
        let cache = SensorCache::start(
            vec![Box::new(FlakyProbe {
                fail_after: 1,
                calls: 0,
            })],
            Duration::from_millis(10),
            Duration::from_secs(60),
        )
        .unwrap();

        // First round succeeds with co2 = 100, every later round fails.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let snap = cache.snapshot();
            if snap.probe_errors >= 2 {
                assert_eq!(snap.values.co2_ppm, 100.0);
                assert_eq!(snap.update_count, 1);
                break;
            }
            assert!(Instant::now() < deadline, "probe errors never accumulated");
            std::thread::sleep(Duration::from_millis(10));
        }
        cache.shutdown();
    }

    #[test]
    fn shutdown_joins_worker_quickly() {
        let cache = SensorCache::start(
            vec![Box::new(FixedProbe {
                reading: ProbeReading::default(),
                delay: Duration::from_millis(1),
            })],
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        cache.shutdown();
        assert!(started.elapsed() < JOIN_TIMEOUT);
    }
}
