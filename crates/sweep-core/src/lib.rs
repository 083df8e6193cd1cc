//! # HH-Sweep Core
//!
//! Shared types for the Hodgkin-Huxley parameter sweep.
//!
//! ## Working Units
//!
//! Every number handed to the simulation engine is expressed in one
//! consistent system, so equations never carry unit conversions:
//!
//! | Quantity | Working unit |
//! |----------|--------------|
//! | Time | ms |
//! | Voltage | mV |
//! | Current | nA |
//! | Conductance | uS |
//! | Capacitance | nF |
//!
//! With these, `uS * mV = nA` and `nA / nF = mV/ms`.
//!
//! Constants are declared as [`Quantity`] values with their natural units
//! and converted once with [`Quantity::in_unit`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("Unit mismatch: expected {expected}, got {got}")]
    UnitError { expected: String, got: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SweepError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (nA)
pub type Current = f64;

/// Conductance (uS)
pub type Conductance = f64;

/// Capacitance (nF)
pub type Capacitance = f64;

/// Firing rate (Hz)
pub type Rate = f64;

// ============================================================================
// UNITS
// ============================================================================

/// Physical dimension of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Time,
    Voltage,
    Current,
    Conductance,
    Capacitance,
    Resistance,
    Frequency,
    Area,
    SpecificCapacitance,
    SpecificConductance,
    Dimensionless,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Time => "time",
            Self::Voltage => "voltage",
            Self::Current => "current",
            Self::Conductance => "conductance",
            Self::Capacitance => "capacitance",
            Self::Resistance => "resistance",
            Self::Frequency => "frequency",
            Self::Area => "area",
            Self::SpecificCapacitance => "capacitance per area",
            Self::SpecificConductance => "conductance per area",
            Self::Dimensionless => "dimensionless",
        };
        f.write_str(name)
    }
}

/// Physical units with SI prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    // Time
    Second,
    Millisecond,
    Microsecond,

    // Voltage
    Volt,
    Millivolt,

    // Current
    Ampere,
    Nanoampere,
    Picoampere,

    // Conductance
    Siemens,
    Microsiemens,
    Nanosiemens,

    // Capacitance
    Farad,
    Nanofarad,
    Picofarad,

    // Resistance
    Ohm,
    Megaohm,
    Gigaohm,

    // Frequency
    Hertz,

    // Area
    SquareMetre,
    SquareCentimetre,
    SquareMicrometre,

    // Per-area membrane properties
    MicrofaradPerSquareCentimetre,
    SiemensPerSquareCentimetre,
    MillisiemensPerSquareCentimetre,

    Dimensionless,
}

impl Unit {
    /// Convert to SI base units
    pub fn to_si_factor(&self) -> f64 {
        match self {
            Unit::Second => 1.0,
            Unit::Millisecond => 1e-3,
            Unit::Microsecond => 1e-6,
            Unit::Volt => 1.0,
            Unit::Millivolt => 1e-3,
            Unit::Ampere => 1.0,
            Unit::Nanoampere => 1e-9,
            Unit::Picoampere => 1e-12,
            Unit::Siemens => 1.0,
            Unit::Microsiemens => 1e-6,
            Unit::Nanosiemens => 1e-9,
            Unit::Farad => 1.0,
            Unit::Nanofarad => 1e-9,
            Unit::Picofarad => 1e-12,
            Unit::Ohm => 1.0,
            Unit::Megaohm => 1e6,
            Unit::Gigaohm => 1e9,
            Unit::Hertz => 1.0,
            Unit::SquareMetre => 1.0,
            Unit::SquareCentimetre => 1e-4,
            Unit::SquareMicrometre => 1e-12,
            Unit::MicrofaradPerSquareCentimetre => 1e-2,
            Unit::SiemensPerSquareCentimetre => 1e4,
            Unit::MillisiemensPerSquareCentimetre => 10.0,
            Unit::Dimensionless => 1.0,
        }
    }

    pub fn dimension(&self) -> Dimension {
        match self {
            Unit::Second | Unit::Millisecond | Unit::Microsecond => Dimension::Time,
            Unit::Volt | Unit::Millivolt => Dimension::Voltage,
            Unit::Ampere | Unit::Nanoampere | Unit::Picoampere => Dimension::Current,
            Unit::Siemens | Unit::Microsiemens | Unit::Nanosiemens => Dimension::Conductance,
            Unit::Farad | Unit::Nanofarad | Unit::Picofarad => Dimension::Capacitance,
            Unit::Ohm | Unit::Megaohm | Unit::Gigaohm => Dimension::Resistance,
            Unit::Hertz => Dimension::Frequency,
            Unit::SquareMetre | Unit::SquareCentimetre | Unit::SquareMicrometre => Dimension::Area,
            Unit::MicrofaradPerSquareCentimetre => Dimension::SpecificCapacitance,
            Unit::SiemensPerSquareCentimetre | Unit::MillisiemensPerSquareCentimetre => {
                Dimension::SpecificConductance
            }
            Unit::Dimensionless => Dimension::Dimensionless,
        }
    }

    /// Unit symbol used in labels and equation annotations
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Second => "s",
            Unit::Millisecond => "ms",
            Unit::Microsecond => "us",
            Unit::Volt => "V",
            Unit::Millivolt => "mV",
            Unit::Ampere => "A",
            Unit::Nanoampere => "nA",
            Unit::Picoampere => "pA",
            Unit::Siemens => "S",
            Unit::Microsiemens => "uS",
            Unit::Nanosiemens => "nS",
            Unit::Farad => "F",
            Unit::Nanofarad => "nF",
            Unit::Picofarad => "pF",
            Unit::Ohm => "ohm",
            Unit::Megaohm => "Mohm",
            Unit::Gigaohm => "Gohm",
            Unit::Hertz => "Hz",
            Unit::SquareMetre => "m2",
            Unit::SquareCentimetre => "cm2",
            Unit::SquareMicrometre => "um2",
            Unit::MicrofaradPerSquareCentimetre => "uF/cm2",
            Unit::SiemensPerSquareCentimetre => "S/cm2",
            Unit::MillisiemensPerSquareCentimetre => "mS/cm2",
            Unit::Dimensionless => "1",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = SweepError;

    /// Accepts both symbols (`mV`) and Brian-style names (`mvolt`, `volt`).
    fn from_str(s: &str) -> Result<Self> {
        let unit = match s.trim() {
            "s" | "second" => Unit::Second,
            "ms" | "msecond" => Unit::Millisecond,
            "us" | "usecond" => Unit::Microsecond,
            "V" | "volt" => Unit::Volt,
            "mV" | "mvolt" => Unit::Millivolt,
            "A" | "amp" | "ampere" => Unit::Ampere,
            "nA" | "namp" => Unit::Nanoampere,
            "pA" | "pamp" => Unit::Picoampere,
            "S" | "siemens" => Unit::Siemens,
            "uS" | "usiemens" => Unit::Microsiemens,
            "nS" | "nsiemens" => Unit::Nanosiemens,
            "F" | "farad" => Unit::Farad,
            "nF" | "nfarad" => Unit::Nanofarad,
            "pF" | "pfarad" => Unit::Picofarad,
            "ohm" => Unit::Ohm,
            "Mohm" => Unit::Megaohm,
            "Gohm" => Unit::Gigaohm,
            "Hz" | "hertz" => Unit::Hertz,
            "m2" | "metre**2" => Unit::SquareMetre,
            "cm2" | "cm**2" => Unit::SquareCentimetre,
            "um2" | "umetre**2" => Unit::SquareMicrometre,
            "uF/cm2" | "ufarad/cm**2" => Unit::MicrofaradPerSquareCentimetre,
            "S/cm2" | "siemens/cm**2" => Unit::SiemensPerSquareCentimetre,
            "mS/cm2" | "msiemens/cm**2" => Unit::MillisiemensPerSquareCentimetre,
            "1" | "" => Unit::Dimensionless,
            other => return Err(SweepError::ParseError(format!("Unknown unit: {}", other))),
        };
        Ok(unit)
    }
}

/// Quantity with value and unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Convert to SI base units
    pub fn to_si(&self) -> f64 {
        self.value * self.unit.to_si_factor()
    }

    /// Numeric value expressed in `target`, which must share the dimension
    pub fn in_unit(&self, target: Unit) -> Result<f64> {
        if self.unit.dimension() != target.dimension() {
            return Err(SweepError::UnitError {
                expected: target.dimension().to_string(),
                got: self.unit.dimension().to_string(),
            });
        }
        Ok(self.to_si() / target.to_si_factor())
    }

    /// Turn a per-area membrane property into an absolute one
    pub fn over_area(&self, area: Quantity) -> Result<Quantity> {
        if area.unit.dimension() != Dimension::Area {
            return Err(SweepError::UnitError {
                expected: Dimension::Area.to_string(),
                got: area.unit.dimension().to_string(),
            });
        }
        let unit = match self.unit.dimension() {
            Dimension::SpecificCapacitance => Unit::Farad,
            Dimension::SpecificConductance => Unit::Siemens,
            other => {
                return Err(SweepError::UnitError {
                    expected: "a per-area quantity".into(),
                    got: other.to_string(),
                })
            }
        };
        Ok(Quantity::new(self.to_si() * area.to_si(), unit))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

// ============================================================================
// TIME SERIES
// ============================================================================

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Smallest and largest recorded value
    pub fn range(&self) -> Option<(f64, f64)> {
        self.values.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

// ============================================================================
// ION CHANNEL KINETICS
// ============================================================================

/// Relative exponential `(e^x - 1) / x`, equal to 1 at `x = 0`
pub fn exprel(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0 + 0.5 * x
    } else {
        x.exp_m1() / x
    }
}

/// Ion channel model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IonChannel {
    /// Channel name
    pub name: String,
    /// Maximum conductance (uS)
    pub g_max: Conductance,
    /// Reversal potential (mV)
    pub e_rev: Voltage,
    /// Gate variables
    pub gates: Vec<GateVariable>,
}

impl IonChannel {
    /// Open conductance for the given gate states (same order as `gates`)
    pub fn conductance(&self, g_max: Conductance, gate_states: &[f64]) -> Conductance {
        self.gates
            .iter()
            .zip(gate_states)
            .fold(g_max, |g, (gate, &x)| g * x.powi(gate.power as i32))
    }

    /// Current flowing into the cell (nA) at membrane potential `v`
    pub fn current(&self, g_max: Conductance, v: Voltage, gate_states: &[f64]) -> Current {
        self.conductance(g_max, gate_states) * (self.e_rev - v)
    }
}

/// Gate variable (e.g., m, h, n in Hodgkin-Huxley)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVariable {
    /// Variable name
    pub name: String,
    /// Power (exponent in gating)
    pub power: u32,
    /// Opening rate (1/ms)
    pub alpha: RateFunction,
    /// Closing rate (1/ms)
    pub beta: RateFunction,
}

impl GateVariable {
    /// Steady-state open fraction alpha/(alpha+beta)
    pub fn steady_state(&self, v: Voltage) -> f64 {
        let a = self.alpha.eval(v);
        let b = self.beta.eval(v);
        if a + b > 0.0 {
            a / (a + b)
        } else {
            0.0
        }
    }

    /// Linear coefficients `(A, B)` of `dx/dt = A + B x` at voltage `v`
    pub fn linear_coefficients(&self, v: Voltage) -> (f64, f64) {
        let a = self.alpha.eval(v);
        let b = self.beta.eval(v);
        (a, -(a + b))
    }
}

/// Rate function type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RateFunction {
    /// Standard HH form: A*(V+B)/(exp((V+B)/C)-1)
    HodgkinHuxley { a: f64, b: f64, c: f64 },
    /// Exponential: A*exp((V+B)/C)
    Exponential { a: f64, b: f64, c: f64 },
    /// Sigmoid: A/(1+exp((V+B)/C))
    Sigmoid { a: f64, b: f64, c: f64 },
    /// Linear: A*(V+B)
    Linear { a: f64, b: f64 },
    /// Constant
    Constant(f64),
}

impl RateFunction {
    /// Evaluate rate at given voltage
    pub fn eval(&self, v: Voltage) -> f64 {
        match self {
            // A*(V+B)/(exp(x)-1) with x = (V+B)/C is A*C/exprel(x),
            // finite through the removable singularity at x = 0
            Self::HodgkinHuxley { a, b, c } => a * c / exprel((v + b) / c),
            Self::Exponential { a, b, c } => a * ((v + b) / c).exp(),
            Self::Sigmoid { a, b, c } => a / (1.0 + ((v + b) / c).exp()),
            Self::Linear { a, b } => a * (v + b),
            Self::Constant(c) => *c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_functions() {
        let hh = RateFunction::HodgkinHuxley { a: 0.1, b: 40.0, c: 10.0 };
        let rate = hh.eval(-65.0);
        assert!(rate > 0.0);

        let exp = RateFunction::Exponential { a: 0.1, b: 65.0, c: 80.0 };
        let rate = exp.eval(-65.0);
        assert!(rate > 0.0);
    }

    #[test]
    fn test_hh_rate_singularity() {
        // 0.1*(v+40)/(exp((v+40)/10)-1) tends to 0.1*10 at v = -40
        let hh = RateFunction::HodgkinHuxley { a: 0.1, b: 40.0, c: 10.0 };
        assert!((hh.eval(-40.0) - 1.0).abs() < 1e-12);

        let near = hh.eval(-40.0 + 1e-7);
        assert!((near - 1.0).abs() < 1e-6);

        let direct = 0.1 * (-55.0 + 40.0) / (((-55.0 + 40.0) / 10.0f64).exp() - 1.0);
        assert!((hh.eval(-55.0) - direct).abs() < 1e-12);
    }

    #[test]
    fn test_exprel() {
        assert_eq!(exprel(0.0), 1.0);
        assert!((exprel(1.0) - (1f64.exp() - 1.0)).abs() < 1e-12);
        assert!(exprel(-50.0) > 0.0);
    }

    #[test]
    fn test_time_series() {
        let mut ts = TimeSeries::new("voltage").with_units("mV");
        ts.push(0.0, -65.0);
        ts.push(0.1, -64.0);
        assert_eq!(ts.len(), 2);
        assert_eq!(ts.range(), Some((-65.0, -64.0)));
        assert_eq!(ts.units.as_deref(), Some("mV"));
    }

    #[test]
    fn test_unit_conversion() {
        let cm = Quantity::new(1.0, Unit::MicrofaradPerSquareCentimetre);
        let area = Quantity::new(20000.0, Unit::SquareMicrometre);
        let c = cm.over_area(area).unwrap();
        assert!((c.in_unit(Unit::Nanofarad).unwrap() - 0.2).abs() < 1e-12);

        let g = Quantity::new(100.0, Unit::MillisiemensPerSquareCentimetre);
        let g = g.over_area(area).unwrap();
        assert!((g.in_unit(Unit::Microsiemens).unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_mismatch() {
        let v = Quantity::new(-65.0, Unit::Millivolt);
        let err = v.in_unit(Unit::Nanoampere).unwrap_err();
        assert!(matches!(err, SweepError::UnitError { .. }));
    }

    #[test]
    fn test_unit_parsing() {
        assert_eq!("volt".parse::<Unit>().unwrap(), Unit::Volt);
        assert_eq!("mV".parse::<Unit>().unwrap(), Unit::Millivolt);
        assert_eq!("1".parse::<Unit>().unwrap(), Unit::Dimensionless);
        assert_eq!("Hz".parse::<Unit>().unwrap().dimension(), Dimension::Frequency);
        assert!("furlong".parse::<Unit>().is_err());
    }

    #[test]
    fn test_gate_steady_state() {
        let gate = GateVariable {
            name: "n".into(),
            power: 4,
            alpha: RateFunction::Constant(1.0),
            beta: RateFunction::Constant(3.0),
        };
        assert!((gate.steady_state(-65.0) - 0.25).abs() < 1e-12);
        assert_eq!(gate.linear_coefficients(-65.0), (1.0, -4.0));
    }

    #[test]
    fn test_channel_current() {
        let channel = IonChannel {
            name: "k".into(),
            g_max: 6.0,
            e_rev: -90.0,
            gates: vec![GateVariable {
                name: "n".into(),
                power: 4,
                alpha: RateFunction::Constant(1.0),
                beta: RateFunction::Constant(1.0),
            }],
        };
        assert!((channel.conductance(6.0, &[0.5]) - 0.375).abs() < 1e-12);
        // outward current at rest
        assert!(channel.current(6.0, -65.0, &[0.5]) < 0.0);
    }
}
