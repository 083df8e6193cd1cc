//! # HH-Sweep: Hodgkin-Huxley parameter sweep
//!
//! Firing rate of a single-compartment Hodgkin-Huxley neuron (Traube and
//! Miles, 1991 kinetics) over a grid of maximal conductance x injected current.
//!
//! ## Procedure
//!
//! | Step | Item |
//! |------|------|
//! | Constants | [`Biophysics`] |
//! | Grid | [`ParameterRange`], [`ParameterGrid`] |
//! | Model | [`HodgkinHuxley::equations_text`] |
//! | Population + monitor | `sweep_engine::NeuronGroup`, `SpikeMonitor` |
//! | Execution | `sweep_engine::Network::run` |
//! | Post-processing | [`firing_rate`], [`RateMatrix::project`] |
//!
//! ## Example
//!
//! ```rust,ignore
//! use sweep_hh::{run_sweep, SweepConfig};
//!
//! let result = run_sweep(&SweepConfig::default())?;
//! println!("max rate: {:?} Hz", result.matrix.max_rate());
//! ```

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use sweep_core::{
    Capacitance, Conductance, Current, GateVariable, IonChannel, Quantity, Rate, RateFunction,
    SweepError, TimeSeries, Unit, Voltage,
};
use sweep_engine::{
    EngineError, ExecutionParams, IntegrationMethod, NativeModel, Network, NeuronEquations,
    NeuronGroup, RefractorySpec, SpikeMonitor, StateMonitor, Backend,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum HhError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Core(#[from] SweepError),
    #[error("Invalid range: {0}")]
    InvalidRange(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Projection error: {0}")]
    Projection(String),
    #[error("Cell ({row}, {col}) written twice")]
    DoubleWrite { row: usize, col: usize },
}

pub type Result<T> = std::result::Result<T, HhError>;

/// Name of the neuron group built by the sweep
pub const GROUP: &str = "neurons";

// ============================================================================
// BIOPHYSICS
// ============================================================================

/// Fixed biophysical constants, with their natural units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Biophysics {
    /// Membrane area
    pub area: Quantity,
    /// Specific membrane capacitance
    pub cm: Quantity,
    /// Specific leak conductance
    pub gl: Quantity,
    /// Leak reversal
    pub el: Quantity,
    /// Potassium reversal
    pub ek: Quantity,
    /// Sodium reversal
    pub ena: Quantity,
    /// Specific maximal sodium conductance
    pub g_na: Quantity,
    /// Specific maximal delayed-rectifier potassium conductance
    pub g_kd: Quantity,
    /// Threshold offset of the rate functions
    pub vt: Quantity,
}

impl Default for Biophysics {
    fn default() -> Self {
        Self {
            area: Quantity::new(20000.0, Unit::SquareMicrometre),
            cm: Quantity::new(1.0, Unit::MicrofaradPerSquareCentimetre),
            gl: Quantity::new(5e-5, Unit::SiemensPerSquareCentimetre),
            el: Quantity::new(-65.0, Unit::Millivolt),
            ek: Quantity::new(-90.0, Unit::Millivolt),
            ena: Quantity::new(50.0, Unit::Millivolt),
            g_na: Quantity::new(100.0, Unit::MillisiemensPerSquareCentimetre),
            g_kd: Quantity::new(30.0, Unit::MillisiemensPerSquareCentimetre),
            vt: Quantity::new(-63.0, Unit::Millivolt),
        }
    }
}

/// Constants in working units (nF, uS, mV)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkingConstants {
    pub cm: Capacitance,
    pub gl: Conductance,
    pub g_na: Conductance,
    pub g_kd: Conductance,
    pub el: Voltage,
    pub ek: Voltage,
    pub ena: Voltage,
    pub vt: Voltage,
}

impl Biophysics {
    /// Scale per-area values by the membrane area and convert to working units
    pub fn working(&self) -> Result<WorkingConstants> {
        let absolute = |q: Quantity, unit: Unit| -> Result<f64> { Ok(q.over_area(self.area)?.in_unit(unit)?) };
        Ok(WorkingConstants {
            cm: absolute(self.cm, Unit::Nanofarad)?,
            gl: absolute(self.gl, Unit::Microsiemens)?,
            g_na: absolute(self.g_na, Unit::Microsiemens)?,
            g_kd: absolute(self.g_kd, Unit::Microsiemens)?,
            el: self.el.in_unit(Unit::Millivolt)?,
            ek: self.ek.in_unit(Unit::Millivolt)?,
            ena: self.ena.in_unit(Unit::Millivolt)?,
            vt: self.vt.in_unit(Unit::Millivolt)?,
        })
    }
}

/// Which maximal conductance varies along the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariedConductance {
    #[default]
    Sodium,
    Potassium,
    Leak,
}

impl VariedConductance {
    pub fn all() -> &'static [Self] {
        &[Self::Sodium, Self::Potassium, Self::Leak]
    }

    /// Parameter name in the model equations
    pub fn parameter(&self) -> &'static str {
        match self {
            Self::Sodium => "g_na",
            Self::Potassium => "g_kd",
            Self::Leak => "gl",
        }
    }

    /// 100-point range (uS) bracketing the default value of this conductance
    pub fn default_range(&self) -> ParameterRange {
        let (start, step) = match self {
            Self::Sodium => (2.0, 0.4),
            Self::Potassium => (0.6, 0.12),
            Self::Leak => (0.001, 0.0002),
        };
        ParameterRange {
            name: self.parameter().to_string(),
            unit: "uS".into(),
            start,
            step,
            count: 100,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Sodium => "maximal sodium conductance",
            Self::Potassium => "maximal delayed-rectifier potassium conductance",
            Self::Leak => "leak conductance",
        }
    }
}

impl fmt::Display for VariedConductance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.parameter())
    }
}

/// Initial values of the gating variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialGating {
    /// m = h = n = 0
    #[default]
    Zero,
    /// alpha / (alpha + beta) at the resting potential
    SteadyState,
}

// ============================================================================
// MODEL
// ============================================================================

/// Traube-Miles Hodgkin-Huxley neuron with one conductance made per-unit
#[derive(Debug, Clone)]
pub struct HodgkinHuxley {
    pub constants: WorkingConstants,
    pub varied: VariedConductance,
    /// Gates m (power 3), h (power 1)
    pub sodium: IonChannel,
    /// Gate n (power 4)
    pub potassium: IonChannel,
}

impl HodgkinHuxley {
    pub fn new(biophysics: &Biophysics, varied: VariedConductance) -> Result<Self> {
        let c = biophysics.working()?;
        let vt = c.vt;

        let m = GateVariable {
            name: "m".into(),
            power: 3,
            alpha: RateFunction::HodgkinHuxley { a: -0.32, b: -(13.0 + vt), c: -4.0 },
            beta: RateFunction::HodgkinHuxley { a: 0.28, b: -(vt + 40.0), c: 5.0 },
        };
        let h = GateVariable {
            name: "h".into(),
            power: 1,
            alpha: RateFunction::Exponential { a: 0.128, b: -(17.0 + vt), c: -18.0 },
            beta: RateFunction::Sigmoid { a: 4.0, b: -(40.0 + vt), c: -5.0 },
        };
        let n = GateVariable {
            name: "n".into(),
            power: 4,
            alpha: RateFunction::HodgkinHuxley { a: -0.032, b: -(15.0 + vt), c: -5.0 },
            beta: RateFunction::Exponential { a: 0.5, b: -(10.0 + vt), c: -40.0 },
        };

        Ok(Self {
            constants: c,
            varied,
            sodium: IonChannel {
                name: "Na".into(),
                g_max: c.g_na,
                e_rev: c.ena,
                gates: vec![m, h],
            },
            potassium: IonChannel {
                name: "Kd".into(),
                g_max: c.g_kd,
                e_rev: c.ek,
                gates: vec![n],
            },
        })
    }

    /// Equation block in the engine's language (working units)
    pub fn equations_text(&self) -> String {
        format!(
            "\
dv/dt = (gl*(El - v) - g_na*(m*m*m)*h*(v - ENa) - g_kd*(n*n*n*n)*(v - EK) + I)/Cm : volt
dm/dt = alpha_m*(1 - m) - beta_m*m : 1
dn/dt = alpha_n*(1 - n) - beta_n*n : 1
dh/dt = alpha_h*(1 - h) - beta_h*h : 1
alpha_m = 0.32*4/exprel((13 - v + VT)/4) : Hz
beta_m = 0.28*5/exprel((v - VT - 40)/5) : Hz
alpha_h = 0.128*exp((17 - v + VT)/18) : Hz
beta_h = 4/(1 + exp((40 - v + VT)/5)) : Hz
alpha_n = 0.032*5/exprel((15 - v + VT)/5) : Hz
beta_n = 0.5*exp((10 - v + VT)/40) : Hz
{} : siemens (constant)
I : amp (constant)
",
            self.varied.parameter()
        )
    }

    /// Parsed equations with threshold and refractoriness
    pub fn equations(&self) -> Result<NeuronEquations> {
        let equations = sweep_engine::parse_equations(&self.equations_text())?
            .with_threshold("v > -40")?
            .with_refractory(RefractorySpec::Condition("v > -40".into()))?;
        Ok(equations)
    }

    /// Namespace constants, excluding the varied conductance
    pub fn namespace(&self) -> Vec<(&'static str, f64)> {
        let c = &self.constants;
        [
            ("Cm", c.cm),
            ("gl", c.gl),
            ("g_na", c.g_na),
            ("g_kd", c.g_kd),
            ("El", c.el),
            ("EK", c.ek),
            ("ENa", c.ena),
            ("VT", c.vt),
        ]
        .into_iter()
        .filter(|(name, _)| *name != self.varied.parameter())
        .collect()
    }

    /// Steady-state (m, h, n) at membrane potential `v`
    pub fn steady_state(&self, v: Voltage) -> (f64, f64, f64) {
        (
            self.sodium.gates[0].steady_state(v),
            self.sodium.gates[1].steady_state(v),
            self.potassium.gates[0].steady_state(v),
        )
    }

    /// (gl, g_na, g_kd) with the varied one replaced by `g_varied`
    fn conductances(&self, g_varied: Conductance) -> (Conductance, Conductance, Conductance) {
        let c = &self.constants;
        match self.varied {
            VariedConductance::Sodium => (c.gl, g_varied, c.g_kd),
            VariedConductance::Potassium => (c.gl, c.g_na, g_varied),
            VariedConductance::Leak => (g_varied, c.g_na, c.g_kd),
        }
    }
}

impl NativeModel for HodgkinHuxley {
    fn state_variables(&self) -> Vec<String> {
        ["v", "m", "h", "n"].map(String::from).to_vec()
    }

    fn parameters(&self) -> Vec<String> {
        vec![self.varied.parameter().to_string(), "I".to_string()]
    }

    fn derivatives(&self, state: &[f64], params: &[f64], out: &mut [f64]) {
        let (v, m, h, n) = (state[0], state[1], state[2], state[3]);
        let (gl, g_na, g_kd) = self.conductances(params[0]);
        let i_ext: Current = params[1];

        let i_leak = gl * (self.constants.el - v);
        let i_na = self.sodium.current(g_na, v, &[m, h]);
        let i_k = self.potassium.current(g_kd, v, &[n]);
        out[0] = (i_leak + i_na + i_k + i_ext) / self.constants.cm;

        let gates = [
            (&self.sodium.gates[0], m),
            (&self.sodium.gates[1], h),
            (&self.potassium.gates[0], n),
        ];
        for (k, (gate, x)) in gates.into_iter().enumerate() {
            let (a, b) = gate.linear_coefficients(v);
            out[k + 1] = a + b * x;
        }
    }

    fn linear_coefficients(&self, state: &[f64], params: &[f64], a: &mut [f64], b: &mut [f64]) {
        let (v, m, h, n) = (state[0], state[1], state[2], state[3]);
        let (gl, g_na, g_kd) = self.conductances(params[0]);
        let c = &self.constants;

        let g_na_open = self.sodium.conductance(g_na, &[m, h]);
        let g_k_open = self.potassium.conductance(g_kd, &[n]);
        a[0] = (gl * c.el + g_na_open * c.ena + g_k_open * c.ek + params[1]) / c.cm;
        b[0] = -(gl + g_na_open + g_k_open) / c.cm;

        let gates = [&self.sodium.gates[0], &self.sodium.gates[1], &self.potassium.gates[0]];
        for (k, gate) in gates.into_iter().enumerate() {
            let (ak, bk) = gate.linear_coefficients(v);
            a[k + 1] = ak;
            b[k + 1] = bk;
        }
    }
}

// ============================================================================
// PARAMETER GRID
// ============================================================================

/// Evenly spaced values `start + k * step`, `k < count`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub name: String,
    pub unit: String,
    pub start: f64,
    pub step: f64,
    pub count: usize,
}

impl ParameterRange {
    pub fn new(name: &str, unit: &str, start: f64, step: f64, count: usize) -> Result<Self> {
        let range = Self {
            name: name.to_string(),
            unit: unit.to_string(),
            start,
            step,
            count,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.start.is_finite() {
            return Err(HhError::InvalidRange(format!("{}: start must be finite", self.name)));
        }
        if !self.step.is_finite() || self.step == 0.0 {
            return Err(HhError::InvalidRange(format!(
                "{}: step must be finite and non-zero, got {}",
                self.name, self.step
            )));
        }
        if self.count == 0 {
            return Err(HhError::InvalidRange(format!("{}: empty range", self.name)));
        }
        Ok(())
    }

    pub fn value(&self, k: usize) -> f64 {
        self.start + k as f64 * self.step
    }

    pub fn values(&self) -> Array1<f64> {
        Array1::from_iter((0..self.count).map(|k| self.value(k)))
    }

    pub fn last(&self) -> f64 {
        self.value(self.count.saturating_sub(1))
    }

    /// Nearest grid index, `None` outside the range
    pub fn index_of(&self, value: f64) -> Option<usize> {
        let k = ((value - self.start) / self.step).round();
        if k.is_finite() && k >= 0.0 && (k as usize) < self.count {
            Some(k as usize)
        } else {
            None
        }
    }

    /// Axis label, e.g. `g_na (uS)`
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.unit)
    }
}

/// One combination of the two varied parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub conductance: Conductance,
    pub current: Current,
}

/// Conductance range x current range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub conductance: ParameterRange,
    pub current: ParameterRange,
}

impl ParameterGrid {
    pub fn new(conductance: ParameterRange, current: ParameterRange) -> Result<Self> {
        conductance.validate()?;
        current.validate()?;
        Ok(Self { conductance, current })
    }

    pub fn len(&self) -> usize {
        self.conductance.count * self.current.count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point `k` of the flattened grid (conductance outer)
    pub fn point(&self, k: usize) -> GridPoint {
        let n_b = self.current.count;
        GridPoint {
            conductance: self.conductance.value(k / n_b),
            current: self.current.value(k % n_b),
        }
    }

    /// Full outer product, row-major
    pub fn combinations(&self) -> Vec<GridPoint> {
        (0..self.len()).map(|k| self.point(k)).collect()
    }
}

// ============================================================================
// RATES
// ============================================================================

/// Spike count over `duration_ms` as a rate in Hz
pub fn firing_rate(count: usize, duration_ms: f64) -> Result<Rate> {
    if !(duration_ms.is_finite() && duration_ms > 0.0) {
        return Err(HhError::InvalidConfig(format!(
            "duration must be positive, got {} ms",
            duration_ms
        )));
    }
    Ok(count as f64 / (duration_ms / 1000.0))
}

/// Firing rates laid out on the grid: rows = current, columns = conductance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateMatrix {
    pub rates: Array2<f64>,
}

impl RateMatrix {
    /// Sentinel for cells no unit mapped to
    pub const MISSING: f64 = f64::NAN;

    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            rates: Array2::from_elem((rows, cols), Self::MISSING),
        }
    }

    /// Place each unit's rate at the cell its stored parameter values round to
    pub fn project(grid: &ParameterGrid, conductances: &[f64], currents: &[f64], rates: &[f64]) -> Result<Self> {
        if conductances.len() != rates.len() || currents.len() != rates.len() {
            return Err(HhError::Projection(format!(
                "{} conductances, {} currents, {} rates",
                conductances.len(),
                currents.len(),
                rates.len()
            )));
        }

        let mut matrix = Self::empty(grid.current.count, grid.conductance.count);
        for (k, ((&g, &i), &rate)) in conductances.iter().zip(currents).zip(rates).enumerate() {
            let col = grid.conductance.index_of(g).ok_or_else(|| {
                HhError::Projection(format!("unit {}: {} = {} is off the grid", k, grid.conductance.name, g))
            })?;
            let row = grid.current.index_of(i).ok_or_else(|| {
                HhError::Projection(format!("unit {}: {} = {} is off the grid", k, grid.current.name, i))
            })?;
            matrix.set(row, col, rate)?;
        }

        let missing = matrix.missing_cells();
        if missing > 0 {
            warn!(missing, "rate matrix has unmapped cells");
        }
        Ok(matrix)
    }

    /// Write a cell once
    pub fn set(&mut self, row: usize, col: usize, rate: f64) -> Result<()> {
        let cell = self
            .rates
            .get_mut((row, col))
            .ok_or_else(|| HhError::Projection(format!("cell ({}, {}) out of bounds", row, col)))?;
        if !cell.is_nan() {
            return Err(HhError::DoubleWrite { row, col });
        }
        *cell = rate;
        Ok(())
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.rates.get((row, col)).copied().filter(|r| !r.is_nan())
    }

    pub fn shape(&self) -> (usize, usize) {
        self.rates.dim()
    }

    pub fn missing_cells(&self) -> usize {
        self.rates.iter().filter(|r| r.is_nan()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_cells() == 0
    }

    pub fn max_rate(&self) -> Option<f64> {
        self.rates
            .iter()
            .copied()
            .filter(|r| !r.is_nan())
            .fold(None, |acc, r| Some(acc.map_or(r, |m: f64| m.max(r))))
    }

    /// Fraction of mapped cells with rate 0
    pub fn silent_fraction(&self) -> f64 {
        let mapped = self.rates.iter().filter(|r| !r.is_nan()).count();
        if mapped == 0 {
            return 0.0;
        }
        let silent = self.rates.iter().filter(|&&r| r == 0.0).count();
        silent as f64 / mapped as f64
    }

    /// Smallest current with a non-zero rate, per conductance column
    pub fn rheobase(&self, current: &ParameterRange) -> Vec<Option<Current>> {
        self.rates
            .columns()
            .into_iter()
            .map(|col| {
                // rows ordered by increasing current only for a positive step
                let mut rows: Vec<usize> = (0..col.len()).collect();
                if current.step < 0.0 {
                    rows.reverse();
                }
                rows.into_iter()
                    .find(|&row| col[row] > 0.0)
                    .map(|row| current.value(row))
            })
            .collect()
    }

    /// Row-major copy, missing cells as `None`
    pub fn to_rows(&self) -> Vec<Vec<Option<f64>>> {
        self.rates
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|&r| if r.is_nan() { None } else { Some(r) }).collect())
            .collect()
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Full sweep configuration; `Default` is the 100 x 100 sweep over g_na
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub biophysics: Biophysics,
    pub varied: VariedConductance,
    /// Varied conductance range (uS)
    pub conductance: ParameterRange,
    /// Injected current range (nA)
    pub current: ParameterRange,
    pub duration_ms: f64,
    pub dt_ms: f64,
    pub method: IntegrationMethod,
    pub initial_gating: InitialGating,
    pub execution: ExecutionParams,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            biophysics: Biophysics::default(),
            varied: VariedConductance::Sodium,
            conductance: VariedConductance::Sodium.default_range(),
            current: ParameterRange {
                name: "I".into(),
                unit: "nA".into(),
                start: 0.0,
                step: 0.007,
                count: 100,
            },
            duration_ms: 1000.0,
            dt_ms: 0.1,
            method: IntegrationMethod::ExponentialEuler,
            initial_gating: InitialGating::Zero,
            execution: ExecutionParams {
                backend: Backend::Native,
                num_threads: 0,
            },
        }
    }
}

impl SweepConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(SweepError::from)?;
        let config: Self = serde_json::from_str(&text).map_err(SweepError::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self).map_err(SweepError::from)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.duration_ms.is_finite() && self.duration_ms > 0.0) {
            return Err(HhError::InvalidConfig(format!(
                "duration must be positive, got {} ms",
                self.duration_ms
            )));
        }
        if !(self.dt_ms.is_finite() && self.dt_ms > 0.0) {
            return Err(HhError::InvalidConfig(format!("dt must be positive, got {} ms", self.dt_ms)));
        }
        if sweep_engine::steps_for(self.duration_ms, self.dt_ms) == 0 {
            return Err(HhError::InvalidConfig("duration shorter than one step".into()));
        }
        self.conductance.validate()?;
        self.current.validate()?;
        self.biophysics.working()?;
        Ok(())
    }

    pub fn grid(&self) -> Result<ParameterGrid> {
        ParameterGrid::new(self.conductance.clone(), self.current.clone())
    }

    /// Vary another conductance over its default range
    pub fn with_varied(mut self, varied: VariedConductance) -> Self {
        self.varied = varied;
        self.conductance = varied.default_range();
        self
    }

    /// Resample both ranges to `points` values over the same span
    pub fn with_points(mut self, points: usize) -> Self {
        for range in [&mut self.conductance, &mut self.current] {
            if points > 1 && range.count > 1 {
                range.step *= (range.count - 1) as f64 / (points - 1) as f64;
            }
            range.count = points;
        }
        self
    }
}

// ============================================================================
// SWEEP
// ============================================================================

/// Outcome of a sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    pub grid: ParameterGrid,
    /// Spike count per unit, grid order
    pub counts: Vec<usize>,
    /// Rate per unit (Hz), grid order
    pub rates: Vec<f64>,
    pub matrix: RateMatrix,
    pub elapsed_secs: f64,
}

fn build_network(config: &SweepConfig, points: &[GridPoint]) -> Result<Network> {
    let model = HodgkinHuxley::new(&config.biophysics, config.varied)?;
    let n = points.len();

    let mut group = NeuronGroup::new(GROUP, n, model.equations()?).with_method(config.method);
    for (name, value) in model.namespace() {
        group.set_constant(name, value);
    }
    group.set_parameter(
        config.varied.parameter(),
        points.iter().map(|p| p.conductance).collect(),
    )?;
    group.set_parameter("I", points.iter().map(|p| p.current).collect())?;

    let el = model.constants.el;
    group.set_initial("v", Array1::from_elem(n, el))?;
    if config.initial_gating == InitialGating::SteadyState {
        let (m, h, nk) = model.steady_state(el);
        group.set_initial("m", Array1::from_elem(n, m))?;
        group.set_initial("h", Array1::from_elem(n, h))?;
        group.set_initial("n", Array1::from_elem(n, nk))?;
    }
    group.attach_native(Arc::new(model))?;

    let mut network = Network::new(config.dt_ms).with_execution(config.execution);
    network.add_neuron_group(group);
    network.add_spike_monitor(SpikeMonitor::new(GROUP, n));
    Ok(network)
}

pub fn run_sweep(config: &SweepConfig) -> Result<SweepResult> {
    run_sweep_with_progress(config, |_| {})
}

/// Run the sweep, calling `progress` once per finished unit
#[instrument(skip(config, progress), fields(varied = %config.varied, backend = %config.execution.backend))]
pub fn run_sweep_with_progress<F>(config: &SweepConfig, progress: F) -> Result<SweepResult>
where
    F: Fn(usize) + Sync,
{
    config.validate()?;
    let grid = config.grid()?;
    let points = grid.combinations();
    info!(
        units = points.len(),
        duration_ms = config.duration_ms,
        dt_ms = config.dt_ms,
        method = %config.method,
        "starting sweep"
    );

    let start = Instant::now();
    let mut network = build_network(config, &points)?;
    network.run_with_progress(config.duration_ms, progress)?;

    let monitor = network
        .spike_monitors
        .get(GROUP)
        .ok_or_else(|| HhError::Projection("spike monitor missing".into()))?;
    let group = network
        .neuron_groups
        .get(GROUP)
        .ok_or_else(|| HhError::Projection("neuron group missing".into()))?;

    let counts = monitor.counts.clone();
    let rates = counts
        .iter()
        .map(|&c| firing_rate(c, config.duration_ms))
        .collect::<Result<Vec<_>>>()?;

    let conductances = group
        .parameters
        .get(config.varied.parameter())
        .ok_or_else(|| HhError::Projection(format!("no parameter {}", config.varied)))?;
    let currents = group
        .parameters
        .get("I")
        .ok_or_else(|| HhError::Projection("no parameter I".into()))?;
    let matrix = RateMatrix::project(&grid, &conductances.to_vec(), &currents.to_vec(), &rates)?;

    let elapsed_secs = start.elapsed().as_secs_f64();
    info!(
        elapsed_secs,
        spikes = monitor.num_spikes(),
        max_rate = matrix.max_rate().unwrap_or(0.0),
        "sweep finished"
    );

    Ok(SweepResult {
        grid,
        counts,
        rates,
        matrix,
        elapsed_secs,
    })
}

/// Membrane potential trace and spikes of one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTrace {
    pub point: GridPoint,
    pub v: TimeSeries,
    pub spikes: Vec<f64>,
    pub rate: Rate,
}

/// Simulate a single grid point with `v` recorded every step
pub fn trace_unit(config: &SweepConfig, point: GridPoint) -> Result<UnitTrace> {
    config.validate()?;
    let mut network = build_network(config, &[point])?;
    network.add_state_monitor(StateMonitor::new(GROUP, &["v"], &[0], 1));
    network.run(config.duration_ms)?;

    let spikes = network
        .spike_monitors
        .get(GROUP)
        .map(|m| m.spikes.iter().map(|&(_, t)| t).collect::<Vec<_>>())
        .unwrap_or_default();
    let v = network
        .state_monitors
        .get(GROUP)
        .and_then(|m| m.trace("v", 0))
        .cloned()
        .ok_or_else(|| HhError::Projection("v was not recorded".into()))?
        .with_units("mV");

    Ok(UnitTrace {
        point,
        rate: firing_rate(spikes.len(), config.duration_ms)?,
        v,
        spikes,
    })
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub units: usize,
    pub total_spikes: usize,
    pub max_rate: Option<f64>,
    pub silent_fraction: f64,
    pub missing_cells: usize,
    /// Per conductance value, in grid order
    pub rheobase: Vec<Option<f64>>,
    pub elapsed_secs: f64,
}

/// Everything written by `--json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub config: SweepConfig,
    pub conductance_values: Vec<f64>,
    pub current_values: Vec<f64>,
    /// rows = current, columns = conductance
    pub rates: Vec<Vec<Option<f64>>>,
    pub summary: SweepSummary,
}

impl SweepReport {
    pub fn new(config: &SweepConfig, result: &SweepResult) -> Self {
        Self {
            config: config.clone(),
            conductance_values: result.grid.conductance.values().to_vec(),
            current_values: result.grid.current.values().to_vec(),
            rates: result.matrix.to_rows(),
            summary: SweepSummary {
                units: result.counts.len(),
                total_spikes: result.counts.iter().sum(),
                max_rate: result.matrix.max_rate(),
                silent_fraction: result.matrix.silent_fraction(),
                missing_cells: result.matrix.missing_cells(),
                rheobase: result.matrix.rheobase(&result.grid.current),
                elapsed_secs: result.elapsed_secs,
            },
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).map_err(SweepError::from)?;
        std::fs::write(path, text).map_err(SweepError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(name: &str, start: f64, step: f64, count: usize) -> ParameterRange {
        ParameterRange::new(name, "u", start, step, count).unwrap()
    }

    fn short_config(conductance: ParameterRange, current: ParameterRange, duration_ms: f64) -> SweepConfig {
        SweepConfig {
            conductance,
            current,
            duration_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_working_constants() {
        let c = Biophysics::default().working().unwrap();
        assert!((c.cm - 0.2).abs() < 1e-12);
        assert!((c.gl - 0.01).abs() < 1e-12);
        assert!((c.g_na - 20.0).abs() < 1e-9);
        assert!((c.g_kd - 6.0).abs() < 1e-9);
        assert_eq!(c.el, -65.0);
        assert_eq!(c.vt, -63.0);
    }

    #[test]
    fn test_grid_ordering() {
        let grid = ParameterGrid::new(range("g", 10.0, 10.0, 3), range("I", 0.0, 0.5, 4)).unwrap();
        let points = grid.combinations();
        assert_eq!(points.len(), 12);
        assert_eq!(grid.len(), 12);

        for (k, p) in points.iter().enumerate() {
            assert_eq!(p.conductance, grid.conductance.value(k / 4));
            assert_eq!(p.current, grid.current.value(k % 4));
        }
        assert_eq!(points[5], GridPoint { conductance: 20.0, current: 0.5 });
    }

    #[test]
    fn test_index_round_trip() {
        let config = SweepConfig::default();
        for r in [&config.conductance, &config.current] {
            for k in 0..r.count {
                assert_eq!(r.index_of(r.value(k)), Some(k));
            }
        }

        let descending = range("x", 1.0, -0.1, 11);
        for k in 0..11 {
            assert_eq!(descending.index_of(descending.value(k)), Some(k));
        }
        assert_eq!(descending.index_of(2.0), None);
        assert_eq!(config.current.index_of(-1.0), None);
        assert_eq!(config.current.index_of(f64::NAN), None);
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(ParameterRange::new("x", "u", 0.0, 0.0, 10).is_err());
        assert!(ParameterRange::new("x", "u", 0.0, 1.0, 0).is_err());
        assert!(ParameterRange::new("x", "u", f64::NAN, 1.0, 3).is_err());
        assert!(ParameterRange::new("x", "u", 0.0, f64::INFINITY, 3).is_err());
    }

    #[test]
    fn test_firing_rate() {
        assert_eq!(firing_rate(0, 1000.0).unwrap(), 0.0);
        assert_eq!(firing_rate(12, 1000.0).unwrap(), 12.0);
        assert_eq!(firing_rate(5, 250.0).unwrap(), 20.0);
        assert!(firing_rate(3, 0.0).is_err());
        assert!(firing_rate(3, -5.0).is_err());
    }

    #[test]
    fn test_projection_is_bijection() {
        let grid = ParameterGrid::new(range("g", 1.0, 1.0, 3), range("I", 0.0, 0.1, 2)).unwrap();
        let points = grid.combinations();
        let g: Vec<f64> = points.iter().map(|p| p.conductance).collect();
        let i: Vec<f64> = points.iter().map(|p| p.current).collect();
        let rates: Vec<f64> = (0..points.len()).map(|k| k as f64).collect();

        let matrix = RateMatrix::project(&grid, &g, &i, &rates).unwrap();
        assert_eq!(matrix.shape(), (2, 3));
        assert!(matrix.is_complete());
        for k in 0..points.len() {
            assert_eq!(matrix.get(k % 2, k / 2), Some(k as f64));
        }
    }

    #[test]
    fn test_projection_errors() {
        let grid = ParameterGrid::new(range("g", 1.0, 1.0, 2), range("I", 0.0, 1.0, 2)).unwrap();

        let twice = RateMatrix::project(&grid, &[1.0, 1.0], &[0.0, 0.0], &[1.0, 2.0]);
        assert!(matches!(twice, Err(HhError::DoubleWrite { row: 0, col: 0 })));

        let off = RateMatrix::project(&grid, &[9.0], &[0.0], &[1.0]);
        assert!(matches!(off, Err(HhError::Projection(_))));

        let partial = RateMatrix::project(&grid, &[1.0], &[1.0], &[3.0]).unwrap();
        assert_eq!(partial.missing_cells(), 3);
        assert!(!partial.is_complete());
        assert_eq!(partial.get(0, 0), None);
        assert_eq!(partial.get(1, 0), Some(3.0));
    }

    #[test]
    fn test_matrix_summary() {
        let current = range("I", 0.0, 0.1, 3);
        let mut matrix = RateMatrix::empty(3, 2);
        for (row, col, r) in [(0, 0, 0.0), (1, 0, 0.0), (2, 0, 8.0), (0, 1, 0.0), (1, 1, 4.0), (2, 1, 10.0)] {
            matrix.set(row, col, r).unwrap();
        }

        assert_eq!(matrix.max_rate(), Some(10.0));
        assert!((matrix.silent_fraction() - 0.5).abs() < 1e-12);
        let rheobase = matrix.rheobase(&current);
        assert!((rheobase[0].unwrap() - 0.2).abs() < 1e-12);
        assert!((rheobase[1].unwrap() - 0.1).abs() < 1e-12);

        assert_eq!(RateMatrix::empty(2, 2).max_rate(), None);
        assert_eq!(RateMatrix::empty(2, 2).rheobase(&current), vec![None, None]);
    }

    #[test]
    fn test_equations_parse() {
        let model = HodgkinHuxley::new(&Biophysics::default(), VariedConductance::Sodium).unwrap();
        let eqs = model.equations().unwrap();
        assert_eq!(eqs.state_variables(), vec!["v", "m", "n", "h"]);
        assert_eq!(eqs.algebraic.len(), 6);
        assert_eq!(eqs.parameter_names(), vec!["g_na", "I"]);
        assert!(eqs.threshold.is_some());

        assert!(model.namespace().iter().all(|(name, _)| *name != "g_na"));
        assert_eq!(model.namespace().len(), 7);

        let leak = HodgkinHuxley::new(&Biophysics::default(), VariedConductance::Leak).unwrap();
        assert!(leak.equations_text().contains("gl : siemens"));
    }

    #[test]
    fn test_native_rates_match_text() {
        // the kernel must agree with the subexpressions of the equation block
        let model = HodgkinHuxley::new(&Biophysics::default(), VariedConductance::Sodium).unwrap();
        let vt = -63.0f64;
        for v in [-80.0, -50.0, -40.0, -23.0, 0.0, 30.0] {
            let alpha_m = 0.32 * (13.0 - v + vt) / (((13.0 - v + vt) / 4.0).exp() - 1.0);
            let beta_h = 4.0 / (1.0 + ((40.0 - v + vt) / 5.0).exp());
            let beta_n = 0.5 * ((10.0 - v + vt) / 40.0).exp();
            if (13.0 - v + vt).abs() > 1e-9 {
                assert!((model.sodium.gates[0].alpha.eval(v) - alpha_m).abs() < 1e-9);
            }
            assert!((model.sodium.gates[1].beta.eval(v) - beta_h).abs() < 1e-12);
            assert!((model.potassium.gates[0].beta.eval(v) - beta_n).abs() < 1e-12);
        }
        // singular point of alpha_m: v = 13 + VT
        assert!((model.sodium.gates[0].alpha.eval(-50.0) - 1.28).abs() < 1e-9);
    }

    #[test]
    fn test_steady_state_gating() {
        let model = HodgkinHuxley::new(&Biophysics::default(), VariedConductance::Sodium).unwrap();
        let (m, h, n) = model.steady_state(-65.0);
        for x in [m, h, n] {
            assert!(x > 0.0 && x < 1.0);
        }
        assert!(m < 0.05);
        assert!(h > 0.9);
    }

    #[test]
    fn test_trace_spikes_and_silence() {
        let config = SweepConfig {
            duration_ms: 100.0,
            ..Default::default()
        };

        let driven = trace_unit(&config, GridPoint { conductance: 20.0, current: 0.6 }).unwrap();
        assert!(!driven.spikes.is_empty());
        assert!(driven.rate > 0.0);
        assert_eq!(driven.v.len(), 1000);
        let (lo, hi) = driven.v.range().unwrap();
        assert!(hi > 0.0 && lo < -60.0);

        let silent = trace_unit(&config, GridPoint { conductance: 20.0, current: 0.0 }).unwrap();
        assert!(silent.spikes.is_empty());
        assert_eq!(silent.rate, 0.0);
    }

    #[test]
    fn test_backends_agree() {
        let mut config = short_config(range("g_na", 20.0, 10.0, 2), range("I", 0.0, 0.5, 2), 100.0);
        config.execution.num_threads = 2;

        config.execution.backend = Backend::Native;
        let native = run_sweep(&config).unwrap();
        config.execution.backend = Backend::Interpreted;
        let interpreted = run_sweep(&config).unwrap();

        assert_eq!(native.counts, interpreted.counts);
        assert!(native.counts[1] > 0);
        assert_eq!(native.counts[0], 0);
    }

    #[test]
    fn test_small_sweep_example() {
        let config = short_config(range("g_na", 10.0, 10.0, 10), range("I", 0.0, 0.1, 10), 100.0);
        let result = run_sweep(&config).unwrap();

        assert_eq!(result.counts.len(), 100);
        assert_eq!(result.matrix.shape(), (10, 10));
        assert!(result.matrix.is_complete());
        assert_eq!(result.matrix.get(0, 0), Some(0.0));
        assert!(result.rates.iter().all(|&r| r >= 0.0));
        assert!(result.matrix.max_rate().unwrap() > 0.0);
    }

    #[test]
    fn test_with_points_keeps_span() {
        let config = SweepConfig::default().with_points(12);
        assert_eq!(config.conductance.count, 12);
        assert!((config.conductance.last() - SweepConfig::default().conductance.last()).abs() < 1e-9);
        assert!((config.current.last() - 0.693).abs() < 1e-9);

        let leak = SweepConfig::default().with_varied(VariedConductance::Leak);
        assert_eq!(leak.conductance.name, "gl");
        assert!(leak.conductance.start < 0.01 && leak.conductance.last() > 0.01);
    }

    #[test]
    fn test_config_validation() {
        assert!(SweepConfig::default().validate().is_ok());

        let bad_duration = SweepConfig {
            duration_ms: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad_duration.validate(), Err(HhError::InvalidConfig(_))));

        let bad_dt = SweepConfig {
            dt_ms: -0.1,
            ..Default::default()
        };
        assert!(bad_dt.validate().is_err());

        let mut empty = SweepConfig::default();
        empty.current.count = 0;
        assert!(matches!(empty.validate(), Err(HhError::InvalidRange(_))));
    }

    #[test]
    fn test_config_json_file() {
        let config = SweepConfig::default().with_varied(VariedConductance::Potassium);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), config.to_json_pretty().unwrap()).unwrap();

        let loaded = SweepConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded.varied, VariedConductance::Potassium);
        assert_eq!(loaded.conductance.name, "g_kd");
        assert_eq!(loaded.current, config.current);
        assert_eq!(loaded.method, IntegrationMethod::ExponentialEuler);

        assert!(SweepConfig::from_json_file(Path::new("/nonexistent/sweep.json")).is_err());
    }

    #[test]
    fn test_report_json() {
        let config = short_config(range("g_na", 20.0, 10.0, 2), range("I", 0.0, 0.6, 2), 50.0);
        let result = run_sweep(&config).unwrap();
        let report = SweepReport::new(&config, &result);
        assert_eq!(report.summary.units, 4);
        assert_eq!(report.rates.len(), 2);
        assert_eq!(report.summary.rheobase.len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["summary"]["units"], 4);
        assert_eq!(value["current_values"][1], 0.6);
    }
}
