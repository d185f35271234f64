use rand::Rng;
use thiserror::Error;

/// Transient fault while reading a probe. The cache treats this as "no update
/// this cycle" and keeps the previous value.
#[derive(Debug, Error)]
#[error("probe read failed: {0}")]
pub struct ProbeError(pub String);

/// One probe's contribution to a row. Fields a probe does not measure stay
/// `None` and leave the cached value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeReading {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub co2_ppm: Option<f64>,
    pub equivalent_co2_ppm: Option<f64>,
    pub total_voc_ppb: Option<f64>,
    pub pressure_pa: Option<f64>,
    pub temperature_icp_f: Option<f64>,
}

/// A blocking environmental sensor. `sample()` may take seconds on real
/// hardware; callers must never invoke it from a latency-sensitive path.
pub trait SensorProbe: Send {
    fn name(&self) -> &str;
    fn sample(&mut self) -> Result<ProbeReading, ProbeError>;
}

// SGP30 hardware reports this eCO2 value until its baseline settles.
const SGP30_WARMUP_ECO2_PPM: f64 = 65_535.0;
const SGP30_WARMUP_SAMPLES: u32 = 3;

/// CO2 / temperature / humidity probe modeled on the SCD4x. Values wander
/// around realistic base points the same way the bench unit does.
pub struct Scd4xSim {
    base_temperature_c: f64,
    base_humidity_pct: f64,
    base_co2_ppm: f64,
}

impl Default for Scd4xSim {
    fn default() -> Self {
        Self {
            base_temperature_c: 25.0,
            base_humidity_pct: 50.0,
            base_co2_ppm: 1000.0,
        }
    }
}

impl SensorProbe for Scd4xSim {
    fn name(&self) -> &str {
        "scd4x"
    }

    fn sample(&mut self) -> Result<ProbeReading, ProbeError> {
        let mut rng = rand::thread_rng();
        Ok(ProbeReading {
            temperature_c: Some(self.base_temperature_c + rng.gen_range(-2.0..2.0)),
            humidity_pct: Some(self.base_humidity_pct + rng.gen_range(-5.0..5.0)),
            co2_ppm: Some(self.base_co2_ppm + rng.gen_range(-100.0..100.0)),
            ..ProbeReading::default()
        })
    }
}

/// Barometric pressure probe modeled on the ICP10125. Reports its die
/// temperature in Fahrenheit, matching the wire schema.
pub struct Icp10125Sim {
    base_pressure_pa: f64,
}

impl Default for Icp10125Sim {
    fn default() -> Self {
        Self {
            base_pressure_pa: 101_325.0,
        }
    }
}

impl SensorProbe for Icp10125Sim {
    fn name(&self) -> &str {
        "icp10125"
    }

    fn sample(&mut self) -> Result<ProbeReading, ProbeError> {
        let mut rng = rand::thread_rng();
        let temp_c: f64 = 25.0 + rng.gen_range(-2.0..2.0);
        Ok(ProbeReading {
            pressure_pa: Some(self.base_pressure_pa + rng.gen_range(-100.0..100.0)),
            temperature_icp_f: Some(celsius_to_fahrenheit(temp_c)),
            ..ProbeReading::default()
        })
    }
}

/// Air-quality probe modeled on the SGP30, including its warm-up behavior.
#[derive(Default)]
pub struct Sgp30Sim {
    samples_taken: u32,
}

impl SensorProbe for Sgp30Sim {
    fn name(&self) -> &str {
        "sgp30"
    }

    fn sample(&mut self) -> Result<ProbeReading, ProbeError> {
        self.samples_taken += 1;
        let mut rng = rand::thread_rng();
        let eco2 = if self.samples_taken <= SGP30_WARMUP_SAMPLES {
            SGP30_WARMUP_ECO2_PPM
        } else {
            400.0 + rng.gen_range(0.0..200.0)
        };
        Ok(ProbeReading {
            equivalent_co2_ppm: Some(eco2),
            total_voc_ppb: Some(rng.gen_range(0.0..500.0)),
            ..ProbeReading::default()
        })
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    9.0 / 5.0 * celsius + 32.0
}

/// The probe set of the reference hardware: SCD4x, ICP10125, SGP30.
pub fn default_probes() -> Vec<Box<dyn SensorProbe>> {
    vec![
        Box::new(Scd4xSim::default()),
        Box::new(Icp10125Sim::default()),
        Box::new(Sgp30Sim::default()),
    ]
}
