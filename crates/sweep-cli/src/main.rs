//! # HH-Sweep CLI
//!
//! Command-line interface for the Hodgkin-Huxley conductance x current sweep.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use sweep_engine::{Backend, IntegrationMethod};
use sweep_hh::{
    run_sweep_with_progress, trace_unit, GridPoint, HodgkinHuxley, InitialGating, SweepConfig,
    SweepReport, SweepResult, VariedConductance,
};
use sweep_plot::{render_heatmap, render_trace, HeatmapAxes, HeatmapOptions};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "hhsweep")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Hodgkin-Huxley firing-rate sweep over conductance x injected current", long_about = None)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the parameter sweep
    Run {
        /// JSON configuration (defaults to the 100 x 100 g_na sweep)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Points per range, keeping each range's span
        #[arg(long)]
        points: Option<usize>,
        /// Simulated duration (ms)
        #[arg(long)]
        duration: Option<f64>,
        /// Time step (ms)
        #[arg(long)]
        dt: Option<f64>,
        /// Worker threads (0 = all cores)
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        #[arg(long, value_enum)]
        method: Option<MethodArg>,
        /// Conductance to vary
        #[arg(long, value_enum)]
        vary: Option<VaryArg>,
        /// Start gates at their resting steady state instead of 0
        #[arg(long)]
        steady_state: bool,
        /// Write the heatmap as SVG
        #[arg(long)]
        plot: Option<PathBuf>,
        /// Write a JSON report
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Simulate one grid point and show its voltage trace
    Trace {
        /// Varied conductance value (uS)
        #[arg(short = 'g', long)]
        conductance: f64,
        /// Injected current (nA)
        #[arg(short = 'i', long)]
        current: f64,
        /// Simulated duration (ms)
        #[arg(long, default_value_t = 200.0)]
        duration: f64,
        #[arg(long, value_enum)]
        vary: Option<VaryArg>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Write the trace as SVG
        #[arg(long)]
        plot: Option<PathBuf>,
    },

    /// Print the model equations
    Equations {
        #[arg(long, value_enum, default_value_t = VaryArg::Na)]
        vary: VaryArg,
    },

    /// Print the default configuration as JSON
    Config,

    /// List integration methods, backends and varied conductances
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Native,
    Interpreted,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Native => Backend::Native,
            BackendArg::Interpreted => Backend::Interpreted,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Euler,
    Heun,
    Rk2,
    Rk4,
    ExponentialEuler,
}

impl From<MethodArg> for IntegrationMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Euler => IntegrationMethod::Euler,
            MethodArg::Heun => IntegrationMethod::Heun,
            MethodArg::Rk2 => IntegrationMethod::RungeKutta2,
            MethodArg::Rk4 => IntegrationMethod::RungeKutta4,
            MethodArg::ExponentialEuler => IntegrationMethod::ExponentialEuler,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum VaryArg {
    Na,
    K,
    Leak,
}

impl From<VaryArg> for VariedConductance {
    fn from(arg: VaryArg) -> Self {
        match arg {
            VaryArg::Na => VariedConductance::Sodium,
            VaryArg::K => VariedConductance::Potassium,
            VaryArg::Leak => VariedConductance::Leak,
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info,sweep_engine=info,sweep_hh=info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SweepConfig> {
    match path {
        Some(path) => SweepConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(SweepConfig::default()),
    }
}

fn progress_bar(len: u64) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn print_summary(config: &SweepConfig, result: &SweepResult) {
    let matrix = &result.matrix;
    let grid = &result.grid;
    let spikes: usize = result.counts.iter().sum();

    println!();
    println!("{}", "Sweep complete".green().bold());
    println!(
        "  Units:           {} ({} x {})",
        result.counts.len(),
        grid.conductance.count,
        grid.current.count
    );
    println!("  Varied:          {} ({})", config.varied.to_string().cyan(), config.varied.description());
    println!("  Duration:        {} ms (dt = {} ms, {})", config.duration_ms, config.dt_ms, config.method);
    println!("  Elapsed:         {:.2} s", result.elapsed_secs);
    println!("  Total spikes:    {}", spikes);
    match matrix.max_rate() {
        Some(rate) => println!("  Max rate:        {:.1} Hz", rate),
        None => println!("  Max rate:        {}", "n/a".yellow()),
    }
    println!("  Silent cells:    {:.1}%", 100.0 * matrix.silent_fraction());
    if !matrix.is_complete() {
        println!("  {} {} cells unmapped", "Warning:".yellow().bold(), matrix.missing_cells());
    }

    let rheobase = matrix.rheobase(&grid.current);
    let stride = rheobase.len().div_ceil(10).max(1);
    println!();
    println!("  {:>12}  {:>12}", grid.conductance.label(), "rheobase (nA)");
    for (k, value) in rheobase.iter().enumerate().step_by(stride) {
        let rheo = match value {
            Some(i) => format!("{:.3}", i),
            None => "silent".dimmed().to_string(),
        };
        println!("  {:>12.3}  {:>12}", grid.conductance.value(k), rheo);
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    config: Option<PathBuf>,
    points: Option<usize>,
    duration: Option<f64>,
    dt: Option<f64>,
    threads: Option<usize>,
    backend: Option<BackendArg>,
    method: Option<MethodArg>,
    vary: Option<VaryArg>,
    steady_state: bool,
    plot: Option<PathBuf>,
    json: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load_config(config.as_deref())?;
    if let Some(vary) = vary {
        config = config.with_varied(vary.into());
    }
    if let Some(points) = points {
        if points == 0 {
            bail!("--points must be at least 1");
        }
        config = config.with_points(points);
    }
    if let Some(duration) = duration {
        config.duration_ms = duration;
    }
    if let Some(dt) = dt {
        config.dt_ms = dt;
    }
    if let Some(threads) = threads {
        config.execution.num_threads = threads;
    }
    if let Some(backend) = backend {
        config.execution.backend = backend.into();
    }
    if let Some(method) = method {
        config.method = method.into();
    }
    if steady_state {
        config.initial_gating = InitialGating::SteadyState;
    }
    config.validate().context("invalid sweep configuration")?;

    let units = config.conductance.count * config.current.count;
    println!(
        "{} {} units, {} = {}..{} {}, I = {}..{} nA",
        "Sweeping".green().bold(),
        units,
        config.varied,
        config.conductance.start,
        config.conductance.last(),
        config.conductance.unit,
        config.current.start,
        config.current.last()
    );

    let pb = progress_bar(units as u64)?;
    let result = run_sweep_with_progress(&config, |_| pb.inc(1)).context("sweep failed")?;
    pb.finish_and_clear();

    print_summary(&config, &result);

    if let Some(path) = plot {
        let axes = HeatmapAxes {
            x_label: result.grid.conductance.label(),
            x_values: result.grid.conductance.values().to_vec(),
            y_label: result.grid.current.label(),
            y_values: result.grid.current.values().to_vec(),
        };
        let options = HeatmapOptions {
            title: format!("Firing rate, {} x I ({} ms)", config.varied, config.duration_ms),
            ..Default::default()
        };
        render_heatmap(&result.matrix.rates, &axes, &path, &options)
            .with_context(|| format!("failed to write heatmap {}", path.display()))?;
        println!("  {} {}", "Heatmap:".cyan(), path.display());
    }

    if let Some(path) = json {
        SweepReport::new(&config, &result)
            .write_json(&path)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        println!("  {} {}", "Report:".cyan(), path.display());
    }

    Ok(())
}

fn trace(
    conductance: f64,
    current: f64,
    duration: f64,
    vary: Option<VaryArg>,
    config: Option<PathBuf>,
    plot: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load_config(config.as_deref())?;
    if let Some(vary) = vary {
        config = config.with_varied(vary.into());
    }
    config.duration_ms = duration;

    info!(conductance, current, duration, "tracing single unit");
    let point = GridPoint { conductance, current };
    let result = trace_unit(&config, point).context("trace failed")?;

    println!(
        "{} {} = {} uS, I = {} nA",
        "Unit:".green().bold(),
        config.varied,
        conductance,
        current
    );
    println!("  Spikes:  {}", result.spikes.len());
    println!("  Rate:    {:.1} Hz", result.rate);
    if let Some((lo, hi)) = result.v.range() {
        println!("  v range: {:.2} .. {:.2} mV", lo, hi);
    }
    if !result.spikes.is_empty() {
        let times: Vec<String> = result.spikes.iter().take(20).map(|t| format!("{:.1}", t)).collect();
        let more = if result.spikes.len() > 20 { " ..." } else { "" };
        println!("  Times:   {}{} ms", times.join(", "), more);
    }

    if let Some(path) = plot {
        let title = format!("{} = {} uS, I = {} nA", config.varied, conductance, current);
        render_trace(&result.v, &result.spikes, &title, &path)
            .with_context(|| format!("failed to write trace {}", path.display()))?;
        println!("  {} {}", "Trace:".cyan(), path.display());
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            points,
            duration,
            dt,
            threads,
            backend,
            method,
            vary,
            steady_state,
            plot,
            json,
        } => run(
            config,
            points,
            duration,
            dt,
            threads,
            backend,
            method,
            vary,
            steady_state,
            plot,
            json,
        )?,

        Commands::Trace {
            conductance,
            current,
            duration,
            vary,
            config,
            plot,
        } => trace(conductance, current, duration, vary, config, plot)?,

        Commands::Equations { vary } => {
            let model = HodgkinHuxley::new(&Default::default(), vary.into())?;
            println!("{}", "# Traube-Miles Hodgkin-Huxley (mV, ms, nA, uS, nF)".dimmed());
            print!("{}", model.equations_text());
            println!("{}", "# threshold: v > -40, refractory while v > -40".dimmed());
            println!();
            println!("{}", "Constants:".green().bold());
            for (name, value) in model.namespace() {
                println!("  {:<4} = {}", name.cyan(), value);
            }
        }

        Commands::Config => {
            println!("{}", SweepConfig::default().to_json_pretty()?);
        }

        Commands::List => {
            println!("{}", "Integration methods:".green().bold());
            for method in IntegrationMethod::all() {
                println!("  {}", method.to_string().cyan());
            }
            println!();
            println!("{}", "Backends:".green().bold());
            for backend in Backend::all() {
                println!("  {}", backend.to_string().cyan());
            }
            println!();
            println!("{}", "Varied conductances:".green().bold());
            for varied in VariedConductance::all() {
                println!("  {} - {}", varied.parameter().cyan(), varied.description());
            }
        }
    }

    Ok(())
}
