//! Greenhouse climate simulator for local development.
//!
//! Temperature and humidity each follow a mean-reverting random walk with
//! per-reading sensor noise. Humidity is loosely anti-correlated with
//! temperature, and running the heater pushes temperature up.

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 is close to N(0,1).
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profile selected via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Beats every period and pushes data every period.
    Steady,
    /// Drops roughly a third of heartbeats and is noisier.
    Flaky,
    /// Keeps beating but never pushes sensors or status.
    Silent,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "flaky" => Self::Flaky,
            "silent" => Self::Silent,
            _ => Self::Steady,
        }
    }

    /// Probability that a due heartbeat is skipped.
    pub fn beat_drop_prob(self) -> f64 {
        match self {
            Self::Flaky => 0.35,
            Self::Steady | Self::Silent => 0.0,
        }
    }

    pub fn publishes_data(self) -> bool {
        !matches!(self, Self::Silent)
    }

    fn noise_sigma(self) -> f64 {
        match self {
            Self::Flaky => 0.6,
            Self::Steady | Self::Silent => 0.15,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Flaky => write!(f, "flaky"),
            Self::Silent => write!(f, "silent"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    pub humidity: f64,
}

pub struct ClimateSim {
    temperature: f64,
    humidity: f64,
    noise_sigma: f64,
    heating: bool,
}

const AMBIENT_TEMP: f64 = 22.0;
const HEATED_TEMP: f64 = 30.0;
const CENTER_HUMIDITY: f64 = 60.0;
const MEAN_REVERSION: f64 = 0.08;

impl ClimateSim {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            temperature: AMBIENT_TEMP + gaussian(0.0, 1.0),
            humidity: CENTER_HUMIDITY + gaussian(0.0, 3.0),
            noise_sigma: scenario.noise_sigma(),
            heating: false,
        }
    }

    /// Whether the heater is running; the temperature drifts toward a
    /// higher set point while it is.
    pub fn set_heating(&mut self, on: bool) {
        self.heating = on;
    }

    /// Advance one step and return the rounded reading.
    pub fn sample(&mut self) -> Climate {
        let target = if self.heating { HEATED_TEMP } else { AMBIENT_TEMP };
        let dt = MEAN_REVERSION * (target - self.temperature) + gaussian(0.0, 0.2);
        self.temperature = (self.temperature + dt).clamp(-10.0, 60.0);

        // Warmer air holds more water, so relative humidity falls.
        let dh = MEAN_REVERSION * (CENTER_HUMIDITY - self.humidity) - 1.5 * dt
            + gaussian(0.0, 0.5);
        self.humidity = (self.humidity + dh).clamp(0.0, 100.0);

        Climate {
            temperature: round1(self.temperature + gaussian(0.0, self.noise_sigma)),
            humidity: round1((self.humidity + gaussian(0.0, self.noise_sigma)).clamp(0.0, 100.0)),
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
