//! # Sweep Plot: SVG figures
//!
//! - [`render_heatmap`]: rate matrix with grid-valued tick labels and a color bar
//! - [`render_trace`]: membrane potential over time with spike markers
//!
//! Figures are drawn with the `plotters` SVG backend.

use ndarray::Array2;
use plotters::prelude::*;
use std::fmt::Display;
use std::path::Path;
use sweep_core::TimeSeries;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("Nothing to plot: matrix is empty")]
    EmptyMatrix,
    #[error("Nothing to plot: trace has no samples")]
    EmptyTrace,
    #[error("Axis {axis} has {got} labels for {expected} cells")]
    AxisMismatch {
        axis: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Render error: {0}")]
    Render(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PlotError>;

fn draw_err<E: Display>(e: E) -> PlotError {
    PlotError::Render(e.to_string())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ============================================================================
// COLOR MAP
// ============================================================================

const VIRIDIS: [(u8, u8, u8); 9] = [
    (68, 1, 84),
    (71, 44, 122),
    (59, 81, 139),
    (44, 113, 142),
    (33, 144, 141),
    (39, 173, 129),
    (92, 200, 99),
    (170, 220, 50),
    (253, 231, 37),
];

/// Cells no unit mapped to
pub const MISSING_COLOR: RGBColor = RGBColor(200, 200, 200);

/// Viridis color for `t` in [0, 1] (clamped)
pub fn colormap(t: f64) -> RGBColor {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    let pos = t * (VIRIDIS.len() - 1) as f64;
    let k = (pos.floor() as usize).min(VIRIDIS.len() - 2);
    let frac = pos - k as f64;

    let (r0, g0, b0) = VIRIDIS[k];
    let (r1, g1, b1) = VIRIDIS[k + 1];
    let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * frac).round() as u8;
    RGBColor(lerp(r0, r1), lerp(g0, g1), lerp(b0, b1))
}

/// Finite (min, max) of the matrix, widened when degenerate
fn color_range(matrix: &Array2<f64>) -> (f64, f64) {
    let (lo, hi) = matrix
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));

    if !lo.is_finite() {
        warn!("no finite values in matrix, using color range [0, 1]");
        (0.0, 1.0)
    } else if hi - lo <= f64::EPSILON * lo.abs().max(1.0) {
        warn!(value = lo, "constant matrix, widening color range");
        (lo, lo + 1.0)
    } else {
        (lo, hi)
    }
}

// ============================================================================
// HEATMAP
// ============================================================================

/// Axis values of the heatmap: one value per column / row
#[derive(Debug, Clone)]
pub struct HeatmapAxes {
    pub x_label: String,
    pub x_values: Vec<f64>,
    pub y_label: String,
    pub y_values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct HeatmapOptions {
    pub title: String,
    pub colorbar_label: String,
    pub width: u32,
    pub height: u32,
    /// Approximate number of tick labels per axis
    pub ticks: usize,
}

impl Default for HeatmapOptions {
    fn default() -> Self {
        Self {
            title: "Firing rate".into(),
            colorbar_label: "rate (Hz)".into(),
            width: 900,
            height: 700,
            ticks: 10,
        }
    }
}

/// Label for the cell nearest to coordinate `x` (cell `k` spans `[k, k+1)`)
fn tick_label(values: &[f64], x: f64) -> String {
    let k = (x - 0.5).round().max(0.0) as usize;
    match values.get(k.min(values.len().saturating_sub(1))) {
        Some(v) => format!("{:.3}", v)
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string(),
        None => String::new(),
    }
}

/// Draw `matrix` (rows = y, columns = x, row 0 at the bottom) to an SVG file
pub fn render_heatmap(
    matrix: &Array2<f64>,
    axes: &HeatmapAxes,
    path: &Path,
    options: &HeatmapOptions,
) -> Result<()> {
    let (rows, cols) = matrix.dim();
    if rows == 0 || cols == 0 {
        return Err(PlotError::EmptyMatrix);
    }
    if axes.x_values.len() != cols {
        return Err(PlotError::AxisMismatch {
            axis: "x",
            expected: cols,
            got: axes.x_values.len(),
        });
    }
    if axes.y_values.len() != rows {
        return Err(PlotError::AxisMismatch {
            axis: "y",
            expected: rows,
            got: axes.y_values.len(),
        });
    }

    ensure_parent(path)?;
    let (lo, hi) = color_range(matrix);
    debug!(rows, cols, lo, hi, path = %path.display(), "rendering heatmap");

    let root = SVGBackend::new(path, (options.width, options.height)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let (main, bar) = root.split_horizontally(options.width.saturating_sub(130));

    let mut chart = ChartBuilder::on(&main)
        .caption(&options.title, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(0f64..cols as f64, 0f64..rows as f64)
        .map_err(draw_err)?;

    let x_ticks = |x: &f64| tick_label(&axes.x_values, *x);
    let y_ticks = |y: &f64| tick_label(&axes.y_values, *y);
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc(axes.x_label.as_str())
        .y_desc(axes.y_label.as_str())
        .x_labels(options.ticks.min(cols).max(2))
        .y_labels(options.ticks.min(rows).max(2))
        .x_label_formatter(&x_ticks)
        .y_label_formatter(&y_ticks)
        .draw()
        .map_err(draw_err)?;

    let span = hi - lo;
    chart
        .draw_series(matrix.indexed_iter().map(|((i, j), &value)| {
            let color = if value.is_finite() {
                colormap((value - lo) / span)
            } else {
                MISSING_COLOR
            };
            let (x, y) = (j as f64, i as f64);
            Rectangle::new([(x, y), (x + 1.0, y + 1.0)], color.filled())
        }))
        .map_err(draw_err)?;

    let mut colorbar = ChartBuilder::on(&bar)
        .margin_top(45)
        .margin_bottom(60)
        .margin_right(15)
        .y_label_area_size(60)
        .build_cartesian_2d(0f64..1f64, lo..hi)
        .map_err(draw_err)?;
    colorbar
        .configure_mesh()
        .disable_mesh()
        .disable_x_axis()
        .y_desc(options.colorbar_label.as_str())
        .y_labels(6)
        .draw()
        .map_err(draw_err)?;

    const SLICES: usize = 128;
    colorbar
        .draw_series((0..SLICES).map(|k| {
            let y0 = lo + span * k as f64 / SLICES as f64;
            let y1 = lo + span * (k + 1) as f64 / SLICES as f64;
            let color = colormap((k as f64 + 0.5) / SLICES as f64);
            Rectangle::new([(0.0, y0), (1.0, y1)], color.filled())
        }))
        .map_err(draw_err)?;

    root.present().map_err(draw_err)?;
    Ok(())
}

// ============================================================================
// TRACE
// ============================================================================

/// Membrane potential trace with a marker line at each spike time
pub fn render_trace(trace: &TimeSeries, spikes: &[f64], title: &str, path: &Path) -> Result<()> {
    let (v_min, v_max) = trace.range().ok_or(PlotError::EmptyTrace)?;
    let t_start = trace.time.first().copied().unwrap_or(0.0);
    let t_end = trace.time.last().copied().unwrap_or(1.0).max(t_start + 1e-9);
    let pad = ((v_max - v_min) * 0.05).max(1.0);
    let (y0, y1) = (v_min - pad, v_max + pad);

    ensure_parent(path)?;
    let root = SVGBackend::new(path, (1000, 450)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(t_start..t_end, y0..y1)
        .map_err(draw_err)?;
    chart
        .configure_mesh()
        .x_desc("time (ms)")
        .y_desc(trace.units.as_deref().map_or_else(|| trace.name.clone(), |u| format!("{} ({})", trace.name, u)))
        .draw()
        .map_err(draw_err)?;

    for &t in spikes {
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(t, y0), (t, y1)],
                RED.mix(0.3),
            )))
            .map_err(draw_err)?;
    }
    chart
        .draw_series(LineSeries::new(
            trace.time.iter().copied().zip(trace.values.iter().copied()),
            &BLUE,
        ))
        .map_err(draw_err)?;

    root.present().map_err(draw_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes(cols: usize, rows: usize) -> HeatmapAxes {
        HeatmapAxes {
            x_label: "g_na (uS)".into(),
            x_values: (0..cols).map(|j| 2.0 + 0.4 * j as f64).collect(),
            y_label: "I (nA)".into(),
            y_values: (0..rows).map(|i| 0.007 * i as f64).collect(),
        }
    }

    #[test]
    fn test_colormap_endpoints() {
        assert_eq!(colormap(0.0), RGBColor(68, 1, 84));
        assert_eq!(colormap(1.0), RGBColor(253, 231, 37));
        assert_eq!(colormap(-3.0), colormap(0.0));
        assert_eq!(colormap(7.0), colormap(1.0));
        assert_eq!(colormap(f64::NAN), colormap(0.0));
    }

    #[test]
    fn test_color_range() {
        let m = Array2::from_shape_vec((2, 2), vec![0.0, f64::NAN, 4.0, 2.0]).unwrap();
        assert_eq!(color_range(&m), (0.0, 4.0));

        let flat = Array2::from_elem((2, 2), 3.0);
        assert_eq!(color_range(&flat), (3.0, 4.0));

        let missing = Array2::from_elem((1, 1), f64::NAN);
        assert_eq!(color_range(&missing), (0.0, 1.0));
    }

    #[test]
    fn test_tick_labels() {
        let values = [0.0, 0.007, 0.014];
        assert_eq!(tick_label(&values, 0.5), "0");
        assert_eq!(tick_label(&values, 1.5), "0.007");
        assert_eq!(tick_label(&values, 99.0), "0.014");
    }

    #[test]
    fn test_render_heatmap() {
        let matrix = Array2::from_shape_fn((4, 5), |(i, j)| if i == 2 && j == 3 { f64::NAN } else { (i * j) as f64 });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plots").join("rates.svg");

        render_heatmap(&matrix, &axes(5, 4), &path, &HeatmapOptions::default()).unwrap();

        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("rate (Hz)"));
        assert!(svg.matches("<rect").count() >= 20 + 128);
    }

    #[test]
    fn test_render_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.svg");

        let empty = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            render_heatmap(&empty, &axes(3, 0), &path, &HeatmapOptions::default()),
            Err(PlotError::EmptyMatrix)
        ));

        let matrix = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            render_heatmap(&matrix, &axes(4, 2), &path, &HeatmapOptions::default()),
            Err(PlotError::AxisMismatch { axis: "x", expected: 3, got: 4 })
        ));
    }

    #[test]
    fn test_render_trace() {
        let mut trace = TimeSeries::new("v").with_units("mV");
        for k in 0..200 {
            let t = k as f64 * 0.1;
            trace.push(t, -65.0 + 10.0 * (t / 3.0).sin());
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.svg");
        render_trace(&trace, &[4.7, 13.2], "unit 0", &path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("<svg"));

        assert!(matches!(
            render_trace(&TimeSeries::new("v"), &[], "empty", &path),
            Err(PlotError::EmptyTrace)
        ));
    }
}
