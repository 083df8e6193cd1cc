//! # Sweep Engine: equation-based spiking neuron simulation
//!
//! A small simulation engine in the style of Brian (Romain Brette and
//! Dan Goodman, 2007). Models are written as text:
//!
//! ```text
//! dv/dt = ((v_rest - v) + r_m * I) / tau_m : volt
//! I : amp
//! ```
//!
//! This crate provides:
//! - Equation parser (differential equations, subexpressions, parameters)
//! - Expression compiler with constant folding
//! - Integration methods (Euler, Heun, RK2, RK4, exponential Euler)
//! - Interpreted and native (compiled Rust) execution backends
//! - Spike monitors and state monitors
//! - Multi-threaded execution of independent units
//!
//! All numbers are in working units (ms, mV, nA, uS, nF), see `sweep_core`.

use ndarray::Array1;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use sweep_core::{exprel, Quantity, SweepError, Time, TimeSeries, Unit};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid equation: {0}")]
    EquationError(String),
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),
    #[error("Size mismatch: expected {expected} values, got {got}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("Simulation error: {0}")]
    SimulationError(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error(transparent)]
    Core(#[from] SweepError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// EXPRESSION LANGUAGE
// ============================================================================

#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" }

number = @{
    (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+)
    ~ (^"e" ~ ("+" | "-")? ~ ASCII_DIGIT+)?
}
ident = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }

add = { "+" }
sub = { "-" }
pow = { "**" | "^" }
mul = { "*" }
div = { "/" }
neg = { "-" }

call    = { ident ~ "(" ~ (expr ~ ("," ~ expr)*)? ~ ")" }
primary = _{ number | call | ident | "(" ~ expr ~ ")" }
atom    = _{ neg* ~ primary }
bin_op  = _{ add | sub | pow | mul | div }
expr    = { atom ~ (bin_op ~ atom)* }

cmp = { ">=" | "<=" | "==" | "!=" | ">" | "<" }

expression = { SOI ~ expr ~ EOI }
condition  = { SOI ~ expr ~ cmp ~ expr ~ EOI }
"#]
struct ExpressionParser;

static PRATT: LazyLock<PrattParser<Rule>> = LazyLock::new(|| {
    PrattParser::new()
        .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
        .op(Op::infix(Rule::mul, Assoc::Left) | Op::infix(Rule::div, Assoc::Left))
        .op(Op::prefix(Rule::neg))
        .op(Op::infix(Rule::pow, Assoc::Right))
});

/// Binary arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Pow => lhs.powf(rhs),
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Parse a single arithmetic expression
    pub fn parse(source: &str) -> Result<Self> {
        let mut pairs = ExpressionParser::parse(Rule::expression, source)
            .map_err(|e| EngineError::ParseError(e.to_string()))?;
        let mut inner = next_pair(&mut pairs, source)?.into_inner();
        parse_expr(next_pair(&mut inner, source)?.into_inner())
    }

    /// Identifiers referenced by the expression, in order of first use
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit_identifiers(&mut out);
        out
    }

    fn visit_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Ident(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Expr::Neg(x) => x.visit_identifiers(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.visit_identifiers(out);
                rhs.visit_identifiers(out);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.visit_identifiers(out);
                }
            }
        }
    }
}

fn next_pair<'i>(pairs: &mut Pairs<'i, Rule>, source: &str) -> Result<Pair<'i, Rule>> {
    pairs
        .next()
        .ok_or_else(|| EngineError::ParseError(format!("Incomplete expression: {}", source)))
}

fn parse_expr(pairs: Pairs<Rule>) -> Result<Expr> {
    PRATT
        .map_primary(|primary| match primary.as_rule() {
            Rule::number => primary
                .as_str()
                .parse::<f64>()
                .map(Expr::Number)
                .map_err(|e| EngineError::ParseError(format!("{}: {}", primary.as_str(), e))),
            Rule::ident => Ok(Expr::Ident(primary.as_str().to_string())),
            Rule::call => {
                let mut inner = primary.into_inner();
                let name = inner
                    .next()
                    .map(|p| p.as_str().to_string())
                    .ok_or_else(|| EngineError::ParseError("Function call without name".into()))?;
                let args = inner
                    .map(|arg| parse_expr(arg.into_inner()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Call(name, args))
            }
            Rule::expr => parse_expr(primary.into_inner()),
            rule => Err(EngineError::ParseError(format!("Unexpected {:?}", rule))),
        })
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::neg => Ok(Expr::Neg(Box::new(rhs?))),
            rule => Err(EngineError::ParseError(format!("Unexpected prefix {:?}", rule))),
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::add => BinaryOp::Add,
                Rule::sub => BinaryOp::Sub,
                Rule::mul => BinaryOp::Mul,
                Rule::div => BinaryOp::Div,
                Rule::pow => BinaryOp::Pow,
                rule => return Err(EngineError::ParseError(format!("Unexpected operator {:?}", rule))),
            };
            Ok(Expr::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(pairs)
}

/// Comparison operator in threshold/refractory conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    NotEqual,
}

impl Comparison {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterEqual),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessEqual),
            "==" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            _ => None,
        }
    }

    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Greater => lhs > rhs,
            Self::GreaterEqual => lhs >= rhs,
            Self::Less => lhs < rhs,
            Self::LessEqual => lhs <= rhs,
            Self::Equal => lhs == rhs,
            Self::NotEqual => lhs != rhs,
        }
    }
}

/// Boolean condition: `lhs op rhs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub lhs: Expr,
    pub op: Comparison,
    pub rhs: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let mut pairs = ExpressionParser::parse(Rule::condition, source)
            .map_err(|e| EngineError::ParseError(e.to_string()))?;
        let mut inner = next_pair(&mut pairs, source)?.into_inner();

        let lhs = parse_expr(next_pair(&mut inner, source)?.into_inner())?;
        let symbol = next_pair(&mut inner, source)?;
        let op = Comparison::from_symbol(symbol.as_str()).ok_or_else(|| {
            EngineError::ParseError(format!("Unknown comparison: {}", symbol.as_str()))
        })?;
        let rhs = parse_expr(next_pair(&mut inner, source)?.into_inner())?;

        Ok(Self { lhs, op, rhs })
    }

    fn identifiers(&self) -> Vec<&str> {
        let mut ids = self.lhs.identifiers();
        for id in self.rhs.identifiers() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// Reset assignment operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

/// Parse reset statements separated by newlines or `;`
pub fn parse_reset(text: &str) -> Result<Vec<(String, AssignOp, Expr)>> {
    let mut statements = Vec::new();

    for stmt in text.split(['\n', ';']).map(str::trim).filter(|s| !s.is_empty()) {
        let (target, op, value) = if let Some((l, r)) = stmt.split_once("+=") {
            (l, AssignOp::Add, r)
        } else if let Some((l, r)) = stmt.split_once("-=") {
            (l, AssignOp::Sub, r)
        } else if let Some((l, r)) = stmt.split_once('=') {
            (l, AssignOp::Set, r)
        } else {
            return Err(EngineError::ParseError(format!("Not an assignment: {}", stmt)));
        };

        let target = target.trim();
        if !is_identifier(target) {
            return Err(EngineError::ParseError(format!("Invalid reset target: {}", target)));
        }
        statements.push((target.to_string(), op, Expr::parse(value)?));
    }

    Ok(statements)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

// ============================================================================
// EQUATION SYSTEM
// ============================================================================

/// Differential equation: dv/dt = expr
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifferentialEquation {
    pub variable: String,
    pub expression: String,
    pub expr: Expr,
    pub unit: Unit,
}

/// Algebraic equation: v = expr (computed each timestep)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgebraicEquation {
    pub variable: String,
    pub expression: String,
    pub expr: Expr,
    pub unit: Unit,
}

/// Per-neuron constant: `I : amp`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDeclaration {
    pub name: String,
    pub unit: Unit,
}

/// Threshold condition for spike generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdCondition {
    pub condition: String, // e.g., "v > -40"
}

/// Reset equations after spike
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetEquations {
    pub equations: Vec<String>, // e.g., ["v = -65", "w += 0.1"]
}

/// Refractory period specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RefractorySpec {
    Duration(Quantity), // Fixed duration
    Condition(String),  // While condition holds
}

/// Integration methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMethod {
    Euler,
    Heun,
    RungeKutta2,
    RungeKutta4,
    /// For conditionally linear equations (Hodgkin-Huxley)
    ExponentialEuler,
}

impl IntegrationMethod {
    pub fn all() -> &'static [Self] {
        &[
            Self::Euler,
            Self::Heun,
            Self::RungeKutta2,
            Self::RungeKutta4,
            Self::ExponentialEuler,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Euler => "euler",
            Self::Heun => "heun",
            Self::RungeKutta2 => "rk2",
            Self::RungeKutta4 => "rk4",
            Self::ExponentialEuler => "exponential_euler",
        }
    }
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Complete neuron equations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronEquations {
    pub differential: Vec<DifferentialEquation>,
    pub algebraic: Vec<AlgebraicEquation>,
    pub parameters: Vec<ParameterDeclaration>,
    pub threshold: Option<ThresholdCondition>,
    pub reset: Option<ResetEquations>,
    pub refractory: Option<RefractorySpec>,
}

impl NeuronEquations {
    pub fn with_threshold(mut self, condition: &str) -> Result<Self> {
        Condition::parse(condition)?;
        self.threshold = Some(ThresholdCondition {
            condition: condition.trim().to_string(),
        });
        Ok(self)
    }

    pub fn with_reset(mut self, statements: &str) -> Result<Self> {
        let parsed = parse_reset(statements)?;
        for (target, _, _) in &parsed {
            if !self.differential.iter().any(|eq| &eq.variable == target) {
                return Err(EngineError::UnknownVariable(target.clone()));
            }
        }
        self.reset = Some(ResetEquations {
            equations: statements
                .split(['\n', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        });
        Ok(self)
    }

    pub fn with_refractory(mut self, spec: RefractorySpec) -> Result<Self> {
        match &spec {
            RefractorySpec::Condition(condition) => {
                Condition::parse(condition)?;
            }
            RefractorySpec::Duration(duration) => {
                duration.in_unit(Unit::Millisecond)?;
            }
        }
        self.refractory = Some(spec);
        Ok(self)
    }

    /// State variable names in declaration order
    pub fn state_variables(&self) -> Vec<&str> {
        self.differential.iter().map(|eq| eq.variable.as_str()).collect()
    }

    /// Parameter names in declaration order
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    /// Evaluation order of subexpressions (dependencies first)
    pub fn subexpression_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .algebraic
            .iter()
            .enumerate()
            .map(|(i, eq)| (eq.variable.as_str(), i))
            .collect();

        let mut marks = vec![Mark::Unvisited; self.algebraic.len()];
        let mut order = Vec::with_capacity(self.algebraic.len());
        for i in 0..self.algebraic.len() {
            visit_subexpression(&self.algebraic, &index, i, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    fn check_names(&self) -> Result<()> {
        let mut seen: Vec<&str> = Vec::new();
        let names = self
            .differential
            .iter()
            .map(|eq| eq.variable.as_str())
            .chain(self.algebraic.iter().map(|eq| eq.variable.as_str()))
            .chain(self.parameters.iter().map(|p| p.name.as_str()));

        for name in names {
            if name == "t" {
                return Err(EngineError::EquationError("'t' is reserved for time".into()));
            }
            if seen.contains(&name) {
                return Err(EngineError::EquationError(format!("'{}' is defined twice", name)));
            }
            seen.push(name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

fn visit_subexpression(
    equations: &[AlgebraicEquation],
    index: &HashMap<&str, usize>,
    i: usize,
    marks: &mut [Mark],
    order: &mut Vec<usize>,
) -> Result<()> {
    match marks[i] {
        Mark::Done => return Ok(()),
        Mark::Visiting => {
            return Err(EngineError::EquationError(format!(
                "Cyclic definition involving '{}'",
                equations[i].variable
            )))
        }
        Mark::Unvisited => {}
    }

    marks[i] = Mark::Visiting;
    for dep in equations[i].expr.identifiers() {
        if let Some(&j) = index.get(dep) {
            visit_subexpression(equations, index, j, marks, order)?;
        }
    }
    marks[i] = Mark::Done;
    order.push(i);
    Ok(())
}

/// Parse Brian-style equations
///
/// ```text
/// dv/dt = (El - v) / tau : volt     # differential equation
/// g = g_max * m : siemens            # subexpression
/// I : amp                            # per-neuron parameter
/// ```
pub fn parse_equations(text: &str) -> Result<NeuronEquations> {
    let mut differential = vec![];
    let mut algebraic = vec![];
    let mut parameters = vec![];

    for raw in text.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let (definition, annotation) = line.split_once(':').ok_or_else(|| {
            EngineError::EquationError(format!("Missing unit annotation: {}", line))
        })?;
        // flags such as "(constant)" follow the unit
        let unit: Unit = annotation.split('(').next().unwrap_or("").parse()?;

        match definition.split_once('=') {
            Some((lhs, rhs)) => {
                let lhs = lhs.trim();
                let expression = rhs.trim().to_string();
                let expr = Expr::parse(&expression)?;

                if lhs.starts_with('d') && lhs.ends_with("/dt") {
                    let variable = lhs[1..lhs.len() - 3].trim();
                    if !is_identifier(variable) {
                        return Err(EngineError::EquationError(format!(
                            "Invalid variable name: {}",
                            variable
                        )));
                    }
                    differential.push(DifferentialEquation {
                        variable: variable.to_string(),
                        expression,
                        expr,
                        unit,
                    });
                } else {
                    if !is_identifier(lhs) {
                        return Err(EngineError::EquationError(format!(
                            "Invalid subexpression name: {}",
                            lhs
                        )));
                    }
                    algebraic.push(AlgebraicEquation {
                        variable: lhs.to_string(),
                        expression,
                        expr,
                        unit,
                    });
                }
            }
            None => {
                let name = definition.trim();
                if !is_identifier(name) {
                    return Err(EngineError::EquationError(format!(
                        "Invalid parameter name: {}",
                        name
                    )));
                }
                parameters.push(ParameterDeclaration {
                    name: name.to_string(),
                    unit,
                });
            }
        }
    }

    let equations = NeuronEquations {
        differential,
        algebraic,
        parameters,
        threshold: None,
        reset: None,
        refractory: None,
    };
    equations.check_names()?;
    equations.subexpression_order()?;
    Ok(equations)
}

// ============================================================================
// COMPILED MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Exp,
    Log,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tanh,
    Exprel,
    Min,
    Max,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "exp" => Self::Exp,
            "log" => Self::Log,
            "sqrt" => Self::Sqrt,
            "abs" => Self::Abs,
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tanh" => Self::Tanh,
            "exprel" => Self::Exprel,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max => 2,
            _ => 1,
        }
    }

    fn apply1(self, x: f64) -> f64 {
        match self {
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sqrt => x.sqrt(),
            Self::Abs => x.abs(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tanh => x.tanh(),
            Self::Exprel => exprel(x),
            Self::Min | Self::Max => f64::NAN,
        }
    }

    fn apply2(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Min => a.min(b),
            Self::Max => a.max(b),
            _ => f64::NAN,
        }
    }
}

/// Expression with identifiers resolved to slots
#[derive(Debug, Clone)]
enum Node {
    Const(f64),
    Slot(usize),
    Neg(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Unary(Function, Box<Node>),
    Pair(Function, Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, slots: &[f64]) -> f64 {
        match self {
            Node::Const(c) => *c,
            Node::Slot(i) => slots[*i],
            Node::Neg(x) => -x.eval(slots),
            Node::Binary(op, lhs, rhs) => op.apply(lhs.eval(slots), rhs.eval(slots)),
            Node::Unary(f, x) => f.apply1(x.eval(slots)),
            Node::Pair(f, a, b) => f.apply2(a.eval(slots), b.eval(slots)),
        }
    }

    fn folded(self) -> Node {
        let constant = match &self {
            Node::Const(_) | Node::Slot(_) => false,
            Node::Neg(x) | Node::Unary(_, x) => matches!(**x, Node::Const(_)),
            Node::Binary(_, a, b) | Node::Pair(_, a, b) => {
                matches!(**a, Node::Const(_)) && matches!(**b, Node::Const(_))
            }
        };
        if constant {
            Node::Const(self.eval(&[]))
        } else {
            self
        }
    }
}

struct SymbolTable<'a> {
    slots: HashMap<&'a str, usize>,
    constants: &'a HashMap<String, f64>,
}

impl SymbolTable<'_> {
    fn compile(&self, expr: &Expr) -> Result<Node> {
        let node = match expr {
            Expr::Number(x) => Node::Const(*x),
            Expr::Ident(name) => match self.slots.get(name.as_str()) {
                Some(&slot) => Node::Slot(slot),
                None => match self.constants.get(name) {
                    Some(&value) => Node::Const(value),
                    None => return Err(EngineError::UnknownIdentifier(name.clone())),
                },
            },
            Expr::Neg(x) => Node::Neg(Box::new(self.compile(x)?)),
            Expr::Binary(op, lhs, rhs) => {
                Node::Binary(*op, Box::new(self.compile(lhs)?), Box::new(self.compile(rhs)?))
            }
            Expr::Call(name, args) => {
                let f = Function::lookup(name)
                    .ok_or_else(|| EngineError::UnknownIdentifier(format!("{}()", name)))?;
                if args.len() != f.arity() {
                    return Err(EngineError::EquationError(format!(
                        "{}() takes {} argument(s), got {}",
                        name,
                        f.arity(),
                        args.len()
                    )));
                }
                let mut args = args
                    .iter()
                    .map(|a| self.compile(a))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter();
                match (args.next(), args.next()) {
                    (Some(a), None) => Node::Unary(f, Box::new(a)),
                    (Some(a), Some(b)) => Node::Pair(f, Box::new(a), Box::new(b)),
                    _ => return Err(EngineError::EquationError(format!("{}() needs arguments", name))),
                }
            }
        };
        Ok(node.folded())
    }

    fn compile_condition(&self, condition: &Condition, subexpressions: &[&str]) -> Result<CompiledCondition> {
        Ok(CompiledCondition {
            lhs: self.compile(&condition.lhs)?,
            op: condition.op,
            rhs: self.compile(&condition.rhs)?,
            needs_subexpressions: condition
                .identifiers()
                .iter()
                .any(|id| subexpressions.contains(id)),
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledCondition {
    lhs: Node,
    op: Comparison,
    rhs: Node,
    needs_subexpressions: bool,
}

impl CompiledCondition {
    fn holds(&self, slots: &[f64]) -> bool {
        self.op.holds(self.lhs.eval(slots), self.rhs.eval(slots))
    }
}

#[derive(Debug, Clone)]
enum CompiledRefractory {
    None,
    Duration(Time),
    Condition(CompiledCondition),
}

#[derive(Debug, Clone)]
struct CompiledReset {
    target: usize,
    op: AssignOp,
    value: Node,
    needs_subexpressions: bool,
}

/// Slot layout: `[state.., parameters.., subexpressions.., t]`
#[derive(Debug, Clone)]
struct CompiledModel {
    state_names: Vec<String>,
    n_state: usize,
    n_params: usize,
    sub_base: usize,
    time_slot: usize,
    subexpressions: Vec<Node>,
    /// `touches[i]`: some subexpression depends on state variable `i`
    touches: Vec<bool>,
    derivatives: Vec<Node>,
    threshold: Option<CompiledCondition>,
    refractory: CompiledRefractory,
    reset: Vec<CompiledReset>,
    spike_needs_subexpressions: bool,
}

impl CompiledModel {
    fn build(equations: &NeuronEquations, constants: &HashMap<String, f64>) -> Result<Self> {
        let n_state = equations.differential.len();
        let n_params = equations.parameters.len();
        let order = equations.subexpression_order()?;
        let sub_base = n_state + n_params;
        let time_slot = sub_base + order.len();

        let mut slots: HashMap<&str, usize> = HashMap::new();
        for (i, eq) in equations.differential.iter().enumerate() {
            slots.insert(eq.variable.as_str(), i);
        }
        for (j, p) in equations.parameters.iter().enumerate() {
            slots.insert(p.name.as_str(), n_state + j);
        }
        for (k, &idx) in order.iter().enumerate() {
            slots.insert(equations.algebraic[idx].variable.as_str(), sub_base + k);
        }
        slots.insert("t", time_slot);
        let table = SymbolTable { slots, constants };

        let subexpressions = order
            .iter()
            .map(|&idx| table.compile(&equations.algebraic[idx].expr))
            .collect::<Result<Vec<_>>>()?;
        let derivatives = equations
            .differential
            .iter()
            .map(|eq| table.compile(&eq.expr))
            .collect::<Result<Vec<_>>>()?;

        // state variables each subexpression reaches, directly or through others
        let sub_names: Vec<&str> = order
            .iter()
            .map(|&idx| equations.algebraic[idx].variable.as_str())
            .collect();
        let mut reach: Vec<Vec<bool>> = Vec::with_capacity(order.len());
        for &idx in &order {
            let mut deps = vec![false; n_state];
            for id in equations.algebraic[idx].expr.identifiers() {
                if let Some(i) = equations.differential.iter().position(|eq| eq.variable == id) {
                    deps[i] = true;
                } else if let Some(k) = sub_names.iter().position(|s| *s == id) {
                    for (d, &r) in deps.iter_mut().zip(&reach[k]) {
                        *d |= r;
                    }
                }
            }
            reach.push(deps);
        }
        let touches = (0..n_state).map(|i| reach.iter().any(|deps| deps[i])).collect();

        let threshold = match &equations.threshold {
            Some(th) => Some(table.compile_condition(&Condition::parse(&th.condition)?, &sub_names)?),
            None => None,
        };

        let refractory = match &equations.refractory {
            None => CompiledRefractory::None,
            Some(RefractorySpec::Duration(d)) => CompiledRefractory::Duration(d.in_unit(Unit::Millisecond)?),
            Some(RefractorySpec::Condition(c)) => {
                CompiledRefractory::Condition(table.compile_condition(&Condition::parse(c)?, &sub_names)?)
            }
        };

        let mut reset = Vec::new();
        if let Some(statements) = &equations.reset {
            for (target, op, value) in parse_reset(&statements.equations.join("\n"))? {
                let target_slot = equations
                    .differential
                    .iter()
                    .position(|eq| eq.variable == target)
                    .ok_or_else(|| EngineError::UnknownVariable(target.clone()))?;
                reset.push(CompiledReset {
                    target: target_slot,
                    op,
                    needs_subexpressions: value.identifiers().iter().any(|id| sub_names.contains(id)),
                    value: table.compile(&value)?,
                });
            }
        }

        let spike_needs_subexpressions = threshold.as_ref().is_some_and(|c| c.needs_subexpressions)
            || matches!(&refractory, CompiledRefractory::Condition(c) if c.needs_subexpressions);

        Ok(Self {
            state_names: equations.differential.iter().map(|eq| eq.variable.clone()).collect(),
            n_state,
            n_params,
            sub_base,
            time_slot,
            subexpressions,
            touches,
            derivatives,
            threshold,
            refractory,
            reset,
            spike_needs_subexpressions,
        })
    }

    /// Fresh slot vector with the unit's parameters filled in
    fn context(&self, params: &[f64]) -> Vec<f64> {
        let mut slots = vec![0.0; self.time_slot + 1];
        slots[self.n_state..self.n_state + self.n_params].copy_from_slice(params);
        slots
    }

    fn load(&self, slots: &mut [f64], x: &[f64], t: Time, subexpressions: bool) {
        slots[..self.n_state].copy_from_slice(x);
        slots[self.time_slot] = t;
        if subexpressions {
            self.eval_subexpressions(slots);
        }
    }

    fn eval_subexpressions(&self, slots: &mut [f64]) {
        for (k, node) in self.subexpressions.iter().enumerate() {
            let value = node.eval(slots);
            slots[self.sub_base + k] = value;
        }
    }

    /// Exponential Euler is only exact for `dx/dt = A + B x`
    fn check_linearity(&self, x: &[f64], params: &[f64], t: Time) -> Result<()> {
        let mut slots = self.context(params);
        for i in 0..self.n_state {
            let mut probe = |value: f64| {
                self.load(&mut slots, x, t, false);
                slots[i] = value;
                self.eval_subexpressions(&mut slots);
                self.derivatives[i].eval(&slots)
            };
            let (f0, f1, f2) = (probe(0.0), probe(1.0), probe(2.0));
            let curvature = (f2 - 2.0 * f1 + f0).abs();
            let scale = 1.0 + f0.abs() + f1.abs() + f2.abs();
            if !(curvature <= 1e-6 * scale) {
                return Err(EngineError::EquationError(format!(
                    "exponential_euler needs d{0}/dt to be linear in {0}",
                    self.state_names[i]
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// INTEGRATION
// ============================================================================

/// Right-hand side of a unit's ODE system
trait Dynamics {
    fn derivatives(&mut self, x: &[f64], t: Time, out: &mut [f64]);

    /// Coefficients of `dx_i/dt = A_i + B_i x_i`, other variables frozen
    fn linear_coefficients(&mut self, x: &[f64], t: Time, a: &mut [f64], b: &mut [f64]);
}

struct InterpretedDynamics<'a> {
    model: &'a CompiledModel,
    slots: Vec<f64>,
}

impl<'a> InterpretedDynamics<'a> {
    fn new(model: &'a CompiledModel, params: &[f64]) -> Self {
        Self {
            model,
            slots: model.context(params),
        }
    }
}

impl Dynamics for InterpretedDynamics<'_> {
    fn derivatives(&mut self, x: &[f64], t: Time, out: &mut [f64]) {
        self.model.load(&mut self.slots, x, t, true);
        for (o, node) in out.iter_mut().zip(&self.model.derivatives) {
            *o = node.eval(&self.slots);
        }
    }

    fn linear_coefficients(&mut self, x: &[f64], t: Time, a: &mut [f64], b: &mut [f64]) {
        let model = self.model;
        model.load(&mut self.slots, x, t, true);
        for i in 0..model.n_state {
            self.slots[i] = 0.0;
            if model.touches[i] {
                model.eval_subexpressions(&mut self.slots);
            }
            let f0 = model.derivatives[i].eval(&self.slots);

            self.slots[i] = 1.0;
            if model.touches[i] {
                model.eval_subexpressions(&mut self.slots);
            }
            let f1 = model.derivatives[i].eval(&self.slots);

            a[i] = f0;
            b[i] = f1 - f0;
            self.slots[i] = x[i];
            if model.touches[i] {
                model.eval_subexpressions(&mut self.slots);
            }
        }
    }
}

/// Compiled Rust kernel standing in for the parsed equations
///
/// Variable and parameter names must match the group's equations; their
/// order may differ and is mapped once when the group is prepared.
pub trait NativeModel: Send + Sync + fmt::Debug {
    fn state_variables(&self) -> Vec<String>;

    fn parameters(&self) -> Vec<String>;

    fn derivatives(&self, state: &[f64], params: &[f64], out: &mut [f64]);

    fn linear_coefficients(&self, state: &[f64], params: &[f64], a: &mut [f64], b: &mut [f64]);
}

#[derive(Debug, Clone)]
struct NativeBinding {
    model: Arc<dyn NativeModel>,
    /// `state_order[j]`: group index of the model's j-th variable
    state_order: Vec<usize>,
    param_order: Vec<usize>,
}

struct NativeDynamics<'a> {
    binding: &'a NativeBinding,
    params: Vec<f64>,
    x: Vec<f64>,
    out: Vec<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
}

impl<'a> NativeDynamics<'a> {
    fn new(binding: &'a NativeBinding, params: &[f64]) -> Self {
        let n = binding.state_order.len();
        Self {
            binding,
            params: binding.param_order.iter().map(|&k| params[k]).collect(),
            x: vec![0.0; n],
            out: vec![0.0; n],
            a: vec![0.0; n],
            b: vec![0.0; n],
        }
    }

    fn gather(&mut self, x: &[f64]) {
        for (dst, &src) in self.x.iter_mut().zip(&self.binding.state_order) {
            *dst = x[src];
        }
    }
}

impl Dynamics for NativeDynamics<'_> {
    fn derivatives(&mut self, x: &[f64], _t: Time, out: &mut [f64]) {
        self.gather(x);
        self.binding.model.derivatives(&self.x, &self.params, &mut self.out);
        for (j, &dst) in self.binding.state_order.iter().enumerate() {
            out[dst] = self.out[j];
        }
    }

    fn linear_coefficients(&mut self, x: &[f64], _t: Time, a: &mut [f64], b: &mut [f64]) {
        self.gather(x);
        self.binding
            .model
            .linear_coefficients(&self.x, &self.params, &mut self.a, &mut self.b);
        for (j, &dst) in self.binding.state_order.iter().enumerate() {
            a[dst] = self.a[j];
            b[dst] = self.b[j];
        }
    }
}

struct StepBuffers {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl StepBuffers {
    fn new(n: usize) -> Self {
        Self {
            k1: vec![0.0; n],
            k2: vec![0.0; n],
            k3: vec![0.0; n],
            k4: vec![0.0; n],
            tmp: vec![0.0; n],
        }
    }
}

fn integrate<D: Dynamics>(
    method: IntegrationMethod,
    dynamics: &mut D,
    x: &mut [f64],
    t: Time,
    dt: Time,
    buf: &mut StepBuffers,
) {
    match method {
        IntegrationMethod::Euler => {
            dynamics.derivatives(x, t, &mut buf.k1);
            for (xi, k) in x.iter_mut().zip(&buf.k1) {
                *xi += dt * k;
            }
        }
        IntegrationMethod::Heun => {
            dynamics.derivatives(x, t, &mut buf.k1);
            for ((tmp, xi), k) in buf.tmp.iter_mut().zip(x.iter()).zip(&buf.k1) {
                *tmp = xi + dt * k;
            }
            dynamics.derivatives(&buf.tmp, t + dt, &mut buf.k2);
            for ((xi, k1), k2) in x.iter_mut().zip(&buf.k1).zip(&buf.k2) {
                *xi += 0.5 * dt * (k1 + k2);
            }
        }
        IntegrationMethod::RungeKutta2 => {
            dynamics.derivatives(x, t, &mut buf.k1);
            for ((tmp, xi), k) in buf.tmp.iter_mut().zip(x.iter()).zip(&buf.k1) {
                *tmp = xi + 0.5 * dt * k;
            }
            dynamics.derivatives(&buf.tmp, t + 0.5 * dt, &mut buf.k2);
            for (xi, k) in x.iter_mut().zip(&buf.k2) {
                *xi += dt * k;
            }
        }
        IntegrationMethod::RungeKutta4 => {
            dynamics.derivatives(x, t, &mut buf.k1);
            for ((tmp, xi), k) in buf.tmp.iter_mut().zip(x.iter()).zip(&buf.k1) {
                *tmp = xi + 0.5 * dt * k;
            }
            dynamics.derivatives(&buf.tmp, t + 0.5 * dt, &mut buf.k2);
            for ((tmp, xi), k) in buf.tmp.iter_mut().zip(x.iter()).zip(&buf.k2) {
                *tmp = xi + 0.5 * dt * k;
            }
            dynamics.derivatives(&buf.tmp, t + 0.5 * dt, &mut buf.k3);
            for ((tmp, xi), k) in buf.tmp.iter_mut().zip(x.iter()).zip(&buf.k3) {
                *tmp = xi + dt * k;
            }
            dynamics.derivatives(&buf.tmp, t + dt, &mut buf.k4);
            for (i, xi) in x.iter_mut().enumerate() {
                *xi += dt / 6.0 * (buf.k1[i] + 2.0 * buf.k2[i] + 2.0 * buf.k3[i] + buf.k4[i]);
            }
        }
        IntegrationMethod::ExponentialEuler => {
            dynamics.linear_coefficients(x, t, &mut buf.k1, &mut buf.k2);
            for ((xi, a), b) in x.iter_mut().zip(&buf.k1).zip(&buf.k2) {
                // x + (A + B x) (e^{B dt} - 1) / B, exact for constant A, B
                *xi += (a + b * *xi) * dt * exprel(b * dt);
            }
        }
    }
}

/// Number of steps covering `duration`
pub fn steps_for(duration: Time, dt: Time) -> usize {
    ((duration / dt) - 1e-9).ceil().max(0.0) as usize
}

// ============================================================================
// EXECUTION
// ============================================================================

/// Execution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Evaluate the parsed equations
    #[default]
    Interpreted,
    /// Use the group's attached [`NativeModel`]
    Native,
}

impl Backend {
    pub fn all() -> &'static [Self] {
        &[Self::Interpreted, Self::Native]
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interpreted => f.write_str("interpreted"),
            Self::Native => f.write_str("native"),
        }
    }
}

/// Execution parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParams {
    pub backend: Backend,
    /// Worker threads (0 = all cores, 1 = sequential)
    pub num_threads: usize,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            backend: Backend::Interpreted,
            num_threads: 0,
        }
    }
}

struct RecordPlan {
    variables: Vec<usize>,
    every: usize,
}

struct UnitContext<'a> {
    model: &'a CompiledModel,
    native: Option<&'a NativeBinding>,
    method: IntegrationMethod,
    t0: Time,
    dt: Time,
    n_steps: usize,
}

struct UnitOutcome {
    state: Vec<f64>,
    last_spike: Time,
    not_refractory: bool,
    spikes: Vec<Time>,
    samples: Vec<(Time, Vec<f64>)>,
}

fn simulate_unit(
    ctx: &UnitContext<'_>,
    unit: usize,
    initial: &[f64],
    params: &[f64],
    last_spike: Time,
    not_refractory: bool,
    record: Option<&RecordPlan>,
) -> Result<UnitOutcome> {
    match ctx.native {
        Some(binding) => {
            let dynamics = NativeDynamics::new(binding, params);
            run_unit(ctx, dynamics, unit, initial, params, last_spike, not_refractory, record)
        }
        None => {
            let dynamics = InterpretedDynamics::new(ctx.model, params);
            run_unit(ctx, dynamics, unit, initial, params, last_spike, not_refractory, record)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_unit<D: Dynamics>(
    ctx: &UnitContext<'_>,
    mut dynamics: D,
    unit: usize,
    initial: &[f64],
    params: &[f64],
    mut last_spike: Time,
    mut not_refractory: bool,
    record: Option<&RecordPlan>,
) -> Result<UnitOutcome> {
    let model = ctx.model;
    let mut x = initial.to_vec();
    let mut buffers = StepBuffers::new(model.n_state);
    let mut probe = model.context(params);
    let mut spikes = Vec::new();
    let mut samples = Vec::new();

    for step in 0..ctx.n_steps {
        let t = ctx.t0 + step as f64 * ctx.dt;
        if let Some(plan) = record {
            if step % plan.every == 0 {
                samples.push((t, plan.variables.iter().map(|&k| x[k]).collect()));
            }
        }

        integrate(ctx.method, &mut dynamics, &mut x, t, ctx.dt, &mut buffers);
        let t_next = ctx.t0 + (step + 1) as f64 * ctx.dt;

        if let Some(bad) = x.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::NumericalError(format!(
                "unit {}: '{}' is not finite at t = {:.4} ms",
                unit, model.state_names[bad], t_next
            )));
        }

        let Some(threshold) = &model.threshold else {
            continue;
        };
        model.load(&mut probe, &x, t_next, model.spike_needs_subexpressions);

        if !not_refractory {
            not_refractory = match &model.refractory {
                CompiledRefractory::None => true,
                CompiledRefractory::Duration(d) => t_next - last_spike >= d - 1e-9,
                CompiledRefractory::Condition(c) => !c.holds(&probe),
            };
        }

        if not_refractory && threshold.holds(&probe) {
            spikes.push(t_next);
            last_spike = t_next;
            for op in &model.reset {
                model.load(&mut probe, &x, t_next, op.needs_subexpressions);
                let value = op.value.eval(&probe);
                match op.op {
                    AssignOp::Set => x[op.target] = value,
                    AssignOp::Add => x[op.target] += value,
                    AssignOp::Sub => x[op.target] -= value,
                }
            }
            not_refractory = matches!(model.refractory, CompiledRefractory::None);
        }
    }

    Ok(UnitOutcome {
        state: x,
        last_spike,
        not_refractory,
        spikes,
        samples,
    })
}

// ============================================================================
// NEURON GROUP
// ============================================================================

/// A group of neurons sharing the same equations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronGroup {
    pub name: String,
    pub n: usize,
    pub equations: NeuronEquations,
    pub method: IntegrationMethod,
    /// Values for identifiers that are neither variables nor parameters
    pub constants: HashMap<String, f64>,
    /// State variables for all neurons
    pub state: HashMap<String, Array1<f64>>,
    /// Per-neuron constant parameters
    pub parameters: HashMap<String, Array1<f64>>,
    /// Last spike time for each neuron (-inf if never spiked)
    pub last_spike: Array1<f64>,
    pub not_refractory: Vec<bool>,
    #[serde(skip)]
    native: Option<NativeBinding>,
}

impl NeuronGroup {
    pub fn new(name: &str, n: usize, equations: NeuronEquations) -> Self {
        let state = equations
            .differential
            .iter()
            .map(|eq| (eq.variable.clone(), Array1::zeros(n)))
            .collect();
        let parameters = equations
            .parameters
            .iter()
            .map(|p| (p.name.clone(), Array1::zeros(n)))
            .collect();

        Self {
            name: name.to_string(),
            n,
            equations,
            method: IntegrationMethod::Euler,
            constants: HashMap::new(),
            state,
            parameters,
            last_spike: Array1::from_elem(n, f64::NEG_INFINITY),
            not_refractory: vec![true; n],
            native: None,
        }
    }

    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn set_constant(&mut self, name: &str, value: f64) {
        self.constants.insert(name.to_string(), value);
    }

    pub fn set_initial(&mut self, variable: &str, values: Array1<f64>) -> Result<()> {
        if let Some(state) = self.state.get_mut(variable) {
            if values.len() != self.n {
                return Err(EngineError::SizeMismatch {
                    expected: self.n,
                    got: values.len(),
                });
            }
            *state = values;
            Ok(())
        } else {
            Err(EngineError::UnknownVariable(variable.to_string()))
        }
    }

    pub fn set_parameter(&mut self, name: &str, values: Array1<f64>) -> Result<()> {
        if let Some(param) = self.parameters.get_mut(name) {
            if values.len() != self.n {
                return Err(EngineError::SizeMismatch {
                    expected: self.n,
                    got: values.len(),
                });
            }
            *param = values;
            Ok(())
        } else {
            Err(EngineError::UnknownVariable(name.to_string()))
        }
    }

    /// Attach a compiled kernel for [`Backend::Native`]
    pub fn attach_native(&mut self, model: Arc<dyn NativeModel>) -> Result<()> {
        let state_vars = self.equations.state_variables();
        let param_names = self.equations.parameter_names();

        let native_vars = model.state_variables();
        let native_params = model.parameters();
        if native_vars.len() != state_vars.len() {
            return Err(EngineError::SizeMismatch {
                expected: state_vars.len(),
                got: native_vars.len(),
            });
        }
        if native_params.len() != param_names.len() {
            return Err(EngineError::SizeMismatch {
                expected: param_names.len(),
                got: native_params.len(),
            });
        }

        let locate = |names: &[&str], wanted: &String| {
            names
                .iter()
                .position(|n| n == wanted)
                .ok_or_else(|| EngineError::UnknownVariable(wanted.clone()))
        };
        let state_order = native_vars
            .iter()
            .map(|v| locate(&state_vars, v))
            .collect::<Result<Vec<_>>>()?;
        let param_order = native_params
            .iter()
            .map(|p| locate(&param_names, p))
            .collect::<Result<Vec<_>>>()?;

        self.native = Some(NativeBinding {
            model,
            state_order,
            param_order,
        });
        Ok(())
    }

    pub fn has_native(&self) -> bool {
        self.native.is_some()
    }

    fn columns<'a>(map: &'a HashMap<String, Array1<f64>>, names: &[&str]) -> Result<Vec<&'a Array1<f64>>> {
        names
            .iter()
            .map(|name| {
                map.get(*name)
                    .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn run_units(
        &mut self,
        t0: Time,
        dt: Time,
        n_steps: usize,
        execution: &ExecutionParams,
        mut spikes: Option<&mut SpikeMonitor>,
        mut states: Option<&mut StateMonitor>,
        progress: &(dyn Fn(usize) + Sync),
    ) -> Result<()> {
        let model = CompiledModel::build(&self.equations, &self.constants)?;
        let native = match execution.backend {
            Backend::Interpreted => None,
            Backend::Native => Some(self.native.as_ref().ok_or_else(|| {
                EngineError::SimulationError(format!(
                    "group '{}' has no native model attached",
                    self.name
                ))
            })?),
        };

        let state_names: Vec<String> = model.state_names.clone();
        let state_refs: Vec<&str> = state_names.iter().map(String::as_str).collect();
        let param_names = self.equations.parameter_names();

        let state_cols = Self::columns(&self.state, &state_refs)?;
        let param_cols = Self::columns(&self.parameters, &param_names)?;
        let initial: Vec<Vec<f64>> = (0..self.n)
            .map(|i| state_cols.iter().map(|c| c[i]).collect())
            .collect();
        let params: Vec<Vec<f64>> = (0..self.n)
            .map(|i| param_cols.iter().map(|c| c[i]).collect())
            .collect();

        if self.method == IntegrationMethod::ExponentialEuler && native.is_none() && self.n > 0 {
            model.check_linearity(&initial[0], &params[0], t0)?;
        }

        let (plan, recorded) = match states.as_deref() {
            Some(monitor) => {
                let variables = monitor
                    .variables
                    .iter()
                    .map(|v| {
                        state_refs
                            .iter()
                            .position(|s| s == v)
                            .ok_or_else(|| EngineError::UnknownVariable(v.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let recorded: HashMap<usize, usize> = monitor
                    .record_indices
                    .iter()
                    .enumerate()
                    .map(|(pos, &unit)| (unit, pos))
                    .collect();
                let plan = RecordPlan {
                    variables,
                    every: monitor.record_every.max(1),
                };
                (Some(plan), recorded)
            }
            None => (None, HashMap::new()),
        };

        let ctx = UnitContext {
            model: &model,
            native,
            method: self.method,
            t0,
            dt,
            n_steps,
        };
        let last_spike = &self.last_spike;
        let not_refractory = &self.not_refractory;

        let simulate = |unit: usize| -> Result<UnitOutcome> {
            let record = plan.as_ref().filter(|_| recorded.contains_key(&unit));
            let outcome = simulate_unit(
                &ctx,
                unit,
                &initial[unit],
                &params[unit],
                last_spike[unit],
                not_refractory[unit],
                record,
            )?;
            progress(unit);
            Ok(outcome)
        };

        let outcomes: Vec<UnitOutcome> = if execution.num_threads == 1 {
            (0..self.n).map(&simulate).collect::<Result<Vec<_>>>()?
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(execution.num_threads)
                .build()
                .map_err(|e| EngineError::SimulationError(format!("thread pool: {}", e)))?;
            pool.install(|| (0..self.n).into_par_iter().map(&simulate).collect::<Result<Vec<_>>>())?
        };

        for (i, outcome) in outcomes.into_iter().enumerate() {
            for (k, name) in state_names.iter().enumerate() {
                if let Some(col) = self.state.get_mut(name) {
                    col[i] = outcome.state[k];
                }
            }
            self.last_spike[i] = outcome.last_spike;
            self.not_refractory[i] = outcome.not_refractory;

            if let Some(monitor) = spikes.as_mut() {
                for &t in &outcome.spikes {
                    monitor.record_spike(i, t);
                }
            }
            if let (Some(monitor), Some(&pos)) = (states.as_mut(), recorded.get(&i)) {
                monitor.append(pos, &outcome.samples);
            }
        }

        if let Some(monitor) = spikes {
            monitor.sort_by_time();
        }
        Ok(())
    }
}

// ============================================================================
// MONITORS
// ============================================================================

/// Record spike times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeMonitor {
    pub source: String,
    /// Recorded spikes: (neuron_idx, time_ms)
    pub spikes: Vec<(usize, f64)>,
    /// Spike counts per neuron
    pub counts: Vec<usize>,
}

impl SpikeMonitor {
    pub fn new(source: &str, n: usize) -> Self {
        Self {
            source: source.to_string(),
            spikes: vec![],
            counts: vec![0; n],
        }
    }

    pub fn record_spike(&mut self, idx: usize, time: f64) {
        self.spikes.push((idx, time));
        if idx < self.counts.len() {
            self.counts[idx] += 1;
        }
    }

    fn sort_by_time(&mut self) {
        self.spikes.sort_by(|a, b| a.1.total_cmp(&b.1));
    }

    /// Get spike trains for each neuron
    pub fn spike_trains(&self) -> HashMap<usize, Vec<f64>> {
        let mut trains: HashMap<usize, Vec<f64>> = HashMap::new();
        for &(idx, time) in &self.spikes {
            trains.entry(idx).or_default().push(time);
        }
        trains
    }

    pub fn num_spikes(&self) -> usize {
        self.spikes.len()
    }

    /// Per-neuron firing rates in Hz
    pub fn rates(&self, duration_ms: f64) -> Vec<f64> {
        if duration_ms <= 0.0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts
            .iter()
            .map(|&c| c as f64 / (duration_ms / 1000.0))
            .collect()
    }

    /// Calculate firing rate in Hz
    pub fn mean_rate(&self, duration_ms: f64) -> f64 {
        if self.counts.is_empty() || duration_ms <= 0.0 {
            return 0.0;
        }
        let total_spikes: usize = self.counts.iter().sum();
        (total_spikes as f64) / (self.counts.len() as f64) / (duration_ms / 1000.0)
    }
}

/// Record state variables over time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMonitor {
    pub source: String,
    pub variables: Vec<String>,
    pub record_indices: Vec<usize>, // Which neurons to record
    pub record_every: usize,        // Recording interval in steps
    /// Recorded traces: variable -> one series per recorded neuron
    pub data: HashMap<String, Vec<TimeSeries>>,
}

impl StateMonitor {
    pub fn new(source: &str, variables: &[&str], indices: &[usize], record_every: usize) -> Self {
        let data = variables
            .iter()
            .map(|var| {
                let series = indices
                    .iter()
                    .map(|i| TimeSeries::new(&format!("{}[{}]", var, i)))
                    .collect();
                (var.to_string(), series)
            })
            .collect();

        Self {
            source: source.to_string(),
            variables: variables.iter().map(|s| s.to_string()).collect(),
            record_indices: indices.to_vec(),
            record_every,
            data,
        }
    }

    /// Trace of `variable` for neuron `unit`, if recorded
    pub fn trace(&self, variable: &str, unit: usize) -> Option<&TimeSeries> {
        let pos = self.record_indices.iter().position(|&i| i == unit)?;
        self.data.get(variable)?.get(pos)
    }

    fn append(&mut self, pos: usize, samples: &[(Time, Vec<f64>)]) {
        for (k, var) in self.variables.iter().enumerate() {
            if let Some(series) = self.data.get_mut(var).and_then(|s| s.get_mut(pos)) {
                for (t, values) in samples {
                    series.push(*t, values[k]);
                }
            }
        }
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Groups, monitors and the simulation clock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub neuron_groups: HashMap<String, NeuronGroup>,
    /// Keyed by source group name
    pub spike_monitors: HashMap<String, SpikeMonitor>,
    /// Keyed by source group name
    pub state_monitors: HashMap<String, StateMonitor>,
    pub execution: ExecutionParams,
    pub dt: f64, // Timestep in ms
    pub t: f64,  // Current time in ms
}

impl Network {
    pub fn new(dt: f64) -> Self {
        Self {
            neuron_groups: HashMap::new(),
            spike_monitors: HashMap::new(),
            state_monitors: HashMap::new(),
            execution: ExecutionParams::default(),
            dt,
            t: 0.0,
        }
    }

    pub fn with_execution(mut self, execution: ExecutionParams) -> Self {
        self.execution = execution;
        self
    }

    pub fn add_neuron_group(&mut self, group: NeuronGroup) {
        self.neuron_groups.insert(group.name.clone(), group);
    }

    pub fn add_spike_monitor(&mut self, monitor: SpikeMonitor) {
        self.spike_monitors.insert(monitor.source.clone(), monitor);
    }

    pub fn add_state_monitor(&mut self, monitor: StateMonitor) {
        self.state_monitors.insert(monitor.source.clone(), monitor);
    }

    /// Run simulation for given duration
    pub fn run(&mut self, duration: f64) -> Result<()> {
        self.run_with_progress(duration, |_| {})
    }

    /// Run, calling `progress` with each neuron index as it finishes
    #[instrument(skip(self, progress), fields(t = self.t, dt = self.dt))]
    pub fn run_with_progress<F>(&mut self, duration: f64, progress: F) -> Result<()>
    where
        F: Fn(usize) + Sync,
    {
        if !(duration.is_finite() && duration >= 0.0) {
            return Err(EngineError::SimulationError(format!("Invalid duration: {}", duration)));
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(EngineError::SimulationError(format!("Invalid timestep: {}", self.dt)));
        }

        let n_steps = steps_for(duration, self.dt);
        for (name, group) in self.neuron_groups.iter_mut() {
            debug!(
                group = %name,
                units = group.n,
                steps = n_steps,
                method = %group.method,
                backend = %self.execution.backend,
                threads = self.execution.num_threads,
                "integrating group"
            );
            group.run_units(
                self.t,
                self.dt,
                n_steps,
                &self.execution,
                self.spike_monitors.get_mut(name),
                self.state_monitors.get_mut(name),
                &progress,
            )?;
        }

        self.t += n_steps as f64 * self.dt;
        Ok(())
    }
}

// ============================================================================
// STANDARD MODELS
// ============================================================================

/// Leaky Integrate-and-Fire neuron
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LIFNeuron {
    pub tau_m: f64,    // Membrane time constant (ms)
    pub v_rest: f64,   // Resting potential (mV)
    pub v_reset: f64,  // Reset potential (mV)
    pub v_thresh: f64, // Spike threshold (mV)
    pub r_m: f64,      // Membrane resistance (MOhm)
    pub tau_ref: f64,  // Refractory period (ms)
}

impl Default for LIFNeuron {
    fn default() -> Self {
        Self {
            tau_m: 10.0,
            v_rest: -65.0,
            v_reset: -65.0,
            v_thresh: -50.0,
            r_m: 10.0,
            tau_ref: 2.0,
        }
    }
}

impl LIFNeuron {
    pub fn to_equations(&self) -> Result<NeuronEquations> {
        let text = format!(
            "dv/dt = (({} - v) + {} * I) / {} : volt\nI : amp",
            self.v_rest, self.r_m, self.tau_m
        );
        parse_equations(&text)?
            .with_threshold(&format!("v > {}", self.v_thresh))?
            .with_reset(&format!("v = {}", self.v_reset))?
            .with_refractory(RefractorySpec::Duration(Quantity::new(
                self.tau_ref,
                Unit::Millisecond,
            )))
    }
}

/// Izhikevich simple model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IzhikevichNeuron {
    pub a: f64, // Recovery time scale
    pub b: f64, // Recovery sensitivity
    pub c: f64, // Reset potential (mV)
    pub d: f64, // Recovery reset
}

impl IzhikevichNeuron {
    /// Regular spiking (RS) - typical excitatory cortical neuron
    pub fn regular_spiking() -> Self {
        Self { a: 0.02, b: 0.2, c: -65.0, d: 8.0 }
    }

    /// Fast spiking (FS) - inhibitory interneuron
    pub fn fast_spiking() -> Self {
        Self { a: 0.1, b: 0.2, c: -65.0, d: 2.0 }
    }

    pub fn to_equations(&self) -> Result<NeuronEquations> {
        let text = format!(
            "dv/dt = 0.04 * v * v + 5.0 * v + 140.0 - u + I : volt\n\
             du/dt = {} * ({} * v - u) : 1\n\
             I : amp",
            self.a, self.b
        );
        parse_equations(&text)?
            .with_threshold("v >= 30.0")?
            .with_reset(&format!("v = {}; u += {}", self.c, self.d))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn eval(source: &str) -> f64 {
        let expr = Expr::parse(source).unwrap();
        let constants = HashMap::new();
        let table = SymbolTable {
            slots: HashMap::new(),
            constants: &constants,
        };
        table.compile(&expr).unwrap().eval(&[])
    }

    fn lif_group(n: usize, current: f64) -> NeuronGroup {
        let lif = LIFNeuron::default();
        let mut group = NeuronGroup::new("lif", n, lif.to_equations().unwrap())
            .with_method(IntegrationMethod::ExponentialEuler);
        group.set_initial("v", Array1::from_elem(n, -65.0)).unwrap();
        group.set_parameter("I", Array1::from_elem(n, current)).unwrap();
        group
    }

    #[derive(Debug)]
    struct NativeLeak;

    impl NativeModel for NativeLeak {
        fn state_variables(&self) -> Vec<String> {
            vec!["v".into()]
        }

        fn parameters(&self) -> Vec<String> {
            vec!["I".into()]
        }

        fn derivatives(&self, state: &[f64], params: &[f64], out: &mut [f64]) {
            out[0] = ((-65.0 - state[0]) + 10.0 * params[0]) / 10.0;
        }

        fn linear_coefficients(&self, _state: &[f64], params: &[f64], a: &mut [f64], b: &mut [f64]) {
            a[0] = (-65.0 + 10.0 * params[0]) / 10.0;
            b[0] = -0.1;
        }
    }

    #[test]
    fn test_operator_precedence() {
        assert_eq!(eval("1 + 2 * 3"), 7.0);
        assert_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_eq!(eval("-2**2"), -4.0);
        assert_eq!(eval("2**3**2"), 512.0);
        assert_eq!(eval("2^3"), 8.0);
        assert_eq!(eval("10 - 4 - 3"), 3.0);
        assert_eq!(eval("1.5e1 / .5"), 30.0);
    }

    #[test]
    fn test_function_calls() {
        assert_eq!(eval("exprel(0)"), 1.0);
        assert_eq!(eval("max(2, -3) + min(2, -3)"), -1.0);
        assert!((eval("exp(1)") - std::f64::consts::E).abs() < 1e-12);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Expr::parse("1 +"), Err(EngineError::ParseError(_))));
        assert!(matches!(Expr::parse("(v"), Err(EngineError::ParseError(_))));
        assert!(Condition::parse("v >").is_err());

        let expr = Expr::parse("foo(1)").unwrap();
        let constants = HashMap::new();
        let table = SymbolTable {
            slots: HashMap::new(),
            constants: &constants,
        };
        assert!(matches!(table.compile(&expr), Err(EngineError::UnknownIdentifier(_))));
    }

    #[test]
    fn test_condition() {
        let cond = Condition::parse("v > -40").unwrap();
        assert_eq!(cond.op, Comparison::Greater);
        assert_eq!(cond.lhs, Expr::Ident("v".into()));
        assert_eq!(cond.rhs, Expr::Neg(Box::new(Expr::Number(40.0))));
    }

    #[test]
    fn test_identifiers() {
        let expr = Expr::parse("alpha_m * (1 - m) - beta_m * m").unwrap();
        assert_eq!(expr.identifiers(), vec!["alpha_m", "m", "beta_m"]);
    }

    #[test]
    fn test_parse_equations() {
        let text = r#"
            dv/dt = (v_rest - v) / tau + g : volt
            dw/dt = a * (v - v_rest) : amp   # adaptation
            g = k * h2 : siemens
            h2 = w * 2 : 1
            I : amp (constant)
        "#;

        let eqs = parse_equations(text).unwrap();
        assert_eq!(eqs.differential.len(), 2);
        assert_eq!(eqs.algebraic.len(), 2);
        assert_eq!(eqs.parameter_names(), vec!["I"]);
        assert_eq!(eqs.differential[0].unit, Unit::Volt);
        assert_eq!(eqs.differential[1].unit, Unit::Ampere);

        // h2 before g
        assert_eq!(eqs.subexpression_order().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_equation_errors() {
        let cyclic = "dv/dt = a : volt\na = b : 1\nb = a : 1";
        assert!(matches!(parse_equations(cyclic), Err(EngineError::EquationError(_))));

        let duplicate = "dv/dt = -v : volt\nv : volt";
        assert!(matches!(parse_equations(duplicate), Err(EngineError::EquationError(_))));

        assert!(parse_equations("dv/dt = -v").is_err());
        assert!(parse_equations("dv/dt = -v : parsec").is_err());
    }

    #[test]
    fn test_neuron_group() {
        let lif = LIFNeuron::default();
        let mut group = NeuronGroup::new("test", 100, lif.to_equations().unwrap());

        assert_eq!(group.n, 100);
        assert!(group.state.contains_key("v"));
        assert!(group.parameters.contains_key("I"));

        group.set_initial("v", Array1::from_elem(100, -70.0)).unwrap();
        assert_eq!(group.state["v"][0], -70.0);

        let err = group.set_initial("v", Array1::zeros(3)).unwrap_err();
        assert!(matches!(err, EngineError::SizeMismatch { expected: 100, got: 3 }));
        assert!(group.set_parameter("w", Array1::zeros(100)).is_err());
    }

    #[test]
    fn test_spike_monitor() {
        let mut monitor = SpikeMonitor::new("test", 10);
        monitor.record_spike(0, 10.0);
        monitor.record_spike(0, 20.0);
        monitor.record_spike(1, 15.0);

        assert_eq!(monitor.counts[0], 2);
        assert_eq!(monitor.counts[1], 1);
        assert_eq!(monitor.num_spikes(), 3);
        assert_eq!(monitor.spike_trains()[&0], vec![10.0, 20.0]);
        // 3 spikes over 10 neurons in 100 ms
        assert!((monitor.mean_rate(100.0) - 3.0).abs() < 1e-12);
        assert_eq!(monitor.rates(100.0)[..3], [20.0, 10.0, 0.0]);
    }

    #[test]
    fn test_lif_spiking() {
        let mut net = Network::new(0.1);
        net.add_neuron_group(lif_group(2, 2.0));
        net.add_spike_monitor(SpikeMonitor::new("lif", 2));
        net.run(100.0).unwrap();

        // v_inf = -45 mV, time to threshold = 10 ln 4 ~ 13.9 ms
        let monitor = &net.spike_monitors["lif"];
        assert!(monitor.counts[0] >= 5 && monitor.counts[0] <= 8);
        assert_eq!(monitor.counts[0], monitor.counts[1]);
        assert!((net.t - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_lif_subthreshold() {
        let mut net = Network::new(0.1);
        net.add_neuron_group(lif_group(1, 1.0));
        net.add_spike_monitor(SpikeMonitor::new("lif", 1));
        net.run(100.0).unwrap();

        assert_eq!(net.spike_monitors["lif"].counts[0], 0);
        // converges to -55 mV
        assert!((net.neuron_groups["lif"].state["v"][0] + 55.0).abs() < 0.1);
    }

    #[test]
    fn test_refractory_duration() {
        let lif = LIFNeuron {
            tau_ref: 30.0,
            ..Default::default()
        };
        let mut group = NeuronGroup::new("lif", 1, lif.to_equations().unwrap());
        group.set_initial("v", Array1::from_elem(1, -65.0)).unwrap();
        group.set_parameter("I", Array1::from_elem(1, 3.0)).unwrap();

        let mut net = Network::new(0.1);
        net.add_neuron_group(group);
        net.add_spike_monitor(SpikeMonitor::new("lif", 1));
        net.run(200.0).unwrap();

        let trains = net.spike_monitors["lif"].spike_trains();
        let train = &trains[&0];
        assert!(train.len() >= 3);
        for w in train.windows(2) {
            assert!(w[1] - w[0] >= 30.0 - 1e-6);
        }
    }

    #[test]
    fn test_refractory_condition() {
        let text = "dv/dt = (I - v) / 5 : volt\nI : amp";
        let eqs = parse_equations(text)
            .unwrap()
            .with_threshold("v > 1")
            .unwrap()
            .with_refractory(RefractorySpec::Condition("v > 1".into()))
            .unwrap();
        let mut group = NeuronGroup::new("g", 1, eqs);
        group.set_parameter("I", Array1::from_elem(1, 2.0)).unwrap();

        let mut net = Network::new(0.1);
        net.add_neuron_group(group);
        net.add_spike_monitor(SpikeMonitor::new("g", 1));
        net.run(50.0).unwrap();

        // v stays above 1 after crossing once: a single event
        assert_eq!(net.spike_monitors["g"].counts[0], 1);
    }

    #[test]
    fn test_izhikevich_reset() {
        let izh = IzhikevichNeuron::regular_spiking();
        let mut group = NeuronGroup::new("izh", 1, izh.to_equations().unwrap())
            .with_method(IntegrationMethod::Euler);
        group.set_initial("v", Array1::from_elem(1, -65.0)).unwrap();
        group.set_initial("u", Array1::from_elem(1, -13.0)).unwrap();
        group.set_parameter("I", Array1::from_elem(1, 10.0)).unwrap();

        let mut net = Network::new(0.1);
        net.add_neuron_group(group);
        net.add_spike_monitor(SpikeMonitor::new("izh", 1));
        net.run(200.0).unwrap();

        assert!(net.spike_monitors["izh"].counts[0] > 0);
        assert!(net.neuron_groups["izh"].state["v"][0] < 30.0);
    }

    #[test]
    fn test_exponential_euler_rejects_nonlinear() {
        let izh = IzhikevichNeuron::fast_spiking();
        let mut group = NeuronGroup::new("izh", 1, izh.to_equations().unwrap())
            .with_method(IntegrationMethod::ExponentialEuler);
        group.set_initial("v", Array1::from_elem(1, -65.0)).unwrap();

        let mut net = Network::new(0.1);
        net.add_neuron_group(group);
        assert!(matches!(net.run(1.0), Err(EngineError::EquationError(_))));
    }

    #[test]
    fn test_unknown_identifier_at_run() {
        let eqs = parse_equations("dv/dt = -v / tau : volt").unwrap();
        let mut net = Network::new(0.1);
        net.add_neuron_group(NeuronGroup::new("g", 1, eqs.clone()));
        assert!(matches!(net.run(1.0), Err(EngineError::UnknownIdentifier(_))));

        let mut group = NeuronGroup::new("g", 1, eqs);
        group.set_constant("tau", 10.0);
        let mut net = Network::new(0.1);
        net.add_neuron_group(group);
        assert!(net.run(1.0).is_ok());
    }

    #[test]
    fn test_integration_methods_agree() {
        // dv/dt = -v, v(0) = 1
        let mut finals = Vec::new();
        for &method in IntegrationMethod::all() {
            let eqs = parse_equations("dv/dt = -v : 1").unwrap();
            let mut group = NeuronGroup::new("g", 1, eqs).with_method(method);
            group.set_initial("v", Array1::from_elem(1, 1.0)).unwrap();
            let mut net = Network::new(0.01);
            net.add_neuron_group(group);
            net.run(1.0).unwrap();
            finals.push(net.neuron_groups["g"].state["v"][0]);
        }
        let exact = (-1.0f64).exp();
        for v in finals {
            assert!((v - exact).abs() < 5e-3);
        }
    }

    #[test]
    fn test_native_matches_interpreted() {
        let run = |backend: Backend| {
            let mut group = lif_group(3, 2.5);
            group.attach_native(Arc::new(NativeLeak)).unwrap();
            let mut net = Network::new(0.1).with_execution(ExecutionParams {
                backend,
                num_threads: 1,
            });
            net.add_neuron_group(group);
            net.add_spike_monitor(SpikeMonitor::new("lif", 3));
            net.run(100.0).unwrap();
            (
                net.spike_monitors["lif"].counts.clone(),
                net.neuron_groups["lif"].state["v"][0],
            )
        };

        let (counts_i, v_i) = run(Backend::Interpreted);
        let (counts_n, v_n) = run(Backend::Native);
        assert_eq!(counts_i, counts_n);
        assert!((v_i - v_n).abs() < 1e-9);
    }

    #[test]
    fn test_native_requires_model() {
        let mut net = Network::new(0.1).with_execution(ExecutionParams {
            backend: Backend::Native,
            num_threads: 1,
        });
        net.add_neuron_group(lif_group(1, 2.0));
        assert!(matches!(net.run(1.0), Err(EngineError::SimulationError(_))));
    }

    #[test]
    fn test_attach_native_checks_names() {
        #[derive(Debug)]
        struct Wrong;
        impl NativeModel for Wrong {
            fn state_variables(&self) -> Vec<String> {
                vec!["x".into()]
            }
            fn parameters(&self) -> Vec<String> {
                vec!["I".into()]
            }
            fn derivatives(&self, _: &[f64], _: &[f64], _: &mut [f64]) {}
            fn linear_coefficients(&self, _: &[f64], _: &[f64], _: &mut [f64], _: &mut [f64]) {}
        }

        let mut group = lif_group(1, 0.0);
        assert!(group.attach_native(Arc::new(Wrong)).is_err());
        assert!(!group.has_native());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let run = |threads: usize| {
            let n = 16;
            let mut group = lif_group(n, 0.0);
            let currents = Array1::from_iter((0..n).map(|i| i as f64 * 0.25));
            group.set_parameter("I", currents).unwrap();
            let mut net = Network::new(0.1).with_execution(ExecutionParams {
                backend: Backend::Interpreted,
                num_threads: threads,
            });
            net.add_neuron_group(group);
            net.add_spike_monitor(SpikeMonitor::new("lif", n));
            net.run(50.0).unwrap();
            net.spike_monitors["lif"].clone()
        };

        let sequential = run(1);
        let parallel = run(4);
        assert_eq!(sequential.counts, parallel.counts);
        assert_eq!(sequential.spikes.len(), parallel.spikes.len());
        assert!(sequential.counts[15] > 0);
        assert_eq!(sequential.counts[0], 0);
    }

    #[test]
    fn test_progress_callback() {
        let done = AtomicUsize::new(0);
        let mut net = Network::new(0.1);
        net.add_neuron_group(lif_group(8, 1.0));
        net.run_with_progress(5.0, |_| {
            done.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(done.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_state_monitor() {
        let mut net = Network::new(0.1);
        net.add_neuron_group(lif_group(4, 1.0));
        net.add_state_monitor(StateMonitor::new("lif", &["v"], &[2], 10));
        net.run(10.0).unwrap();

        let monitor = &net.state_monitors["lif"];
        let trace = monitor.trace("v", 2).unwrap();
        // 100 steps, one sample every 10
        assert_eq!(trace.len(), 10);
        assert_eq!(trace.values[0], -65.0);
        assert!(trace.values[9] > -65.0);
        assert!(monitor.trace("v", 0).is_none());
    }

    #[test]
    fn test_continued_runs() {
        let single = {
            let mut net = Network::new(0.1);
            net.add_neuron_group(lif_group(1, 2.0));
            net.add_spike_monitor(SpikeMonitor::new("lif", 1));
            net.run(60.0).unwrap();
            net.spike_monitors["lif"].spikes.clone()
        };
        let split = {
            let mut net = Network::new(0.1);
            net.add_neuron_group(lif_group(1, 2.0));
            net.add_spike_monitor(SpikeMonitor::new("lif", 1));
            net.run(25.0).unwrap();
            net.run(35.0).unwrap();
            net.spike_monitors["lif"].spikes.clone()
        };

        assert_eq!(single.len(), split.len());
        for (a, b) in single.iter().zip(&split) {
            assert!((a.1 - b.1).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_run() {
        let mut net = Network::new(0.1);
        assert!(net.run(-1.0).is_err());
        let mut net = Network::new(0.0);
        assert!(net.run(1.0).is_err());
    }

    #[test]
    fn test_steps_for() {
        assert_eq!(steps_for(1000.0, 0.1), 10000);
        assert_eq!(steps_for(0.0, 0.1), 0);
        assert_eq!(steps_for(0.25, 0.1), 3);
    }
}
