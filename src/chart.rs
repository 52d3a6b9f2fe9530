//! Charting adapter: temperature series to plot traces.

use chrono::{DateTime, TimeZone, Timelike};

use crate::store::state::{DashboardState, Sensor};

/// Visible span of the temperature chart, anchored at the newest sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartWindow {
    FifteenMinutes,
    OneHour,
    SixHours,
    OneDay,
    All,
}

impl ChartWindow {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "15m" => Some(ChartWindow::FifteenMinutes),
            "1h" => Some(ChartWindow::OneHour),
            "6h" => Some(ChartWindow::SixHours),
            "24h" | "1d" => Some(ChartWindow::OneDay),
            "all" => Some(ChartWindow::All),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChartWindow::FifteenMinutes => "15m",
            ChartWindow::OneHour => "1h",
            ChartWindow::SixHours => "6h",
            ChartWindow::OneDay => "24h",
            ChartWindow::All => "all",
        }
    }

    pub fn minutes(&self) -> Option<u32> {
        match self {
            ChartWindow::FifteenMinutes => Some(15),
            ChartWindow::OneHour => Some(60),
            ChartWindow::SixHours => Some(360),
            ChartWindow::OneDay => Some(1440),
            ChartWindow::All => None,
        }
    }

    pub fn next(&self) -> Self {
        match self {
            ChartWindow::FifteenMinutes => ChartWindow::OneHour,
            ChartWindow::OneHour => ChartWindow::SixHours,
            ChartWindow::SixHours => ChartWindow::OneDay,
            ChartWindow::OneDay => ChartWindow::All,
            ChartWindow::All => ChartWindow::FifteenMinutes,
        }
    }
}

/// Plot order: coldest stage first.
pub const TRACE_ORDER: [Sensor; 4] = [Sensor::TFAA, Sensor::TGGG, Sensor::T03K, Sensor::T60K];

pub fn trace_name(sensor: Sensor) -> &'static str {
    match sensor {
        Sensor::T60K => "60K",
        Sensor::T03K => "3K",
        Sensor::TGGG => "GGG",
        Sensor::TFAA => "FAA",
    }
}

/// One sensor's line, broken into runs of consecutive finite samples.
/// A missing value ends the current run, so the line is not drawn across it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub sensor: Sensor,
    /// Runs of (epoch seconds, kelvin).
    pub segments: Vec<Vec<(f64, f64)>>,
}

impl Trace {
    pub fn points(&self) -> impl Iterator<Item = &(f64, f64)> {
        self.segments.iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartData {
    pub traces: Vec<Trace>,
    pub x_bounds: [f64; 2],
    pub y_bounds: [f64; 2],
    pub x_labels: Vec<String>,
    pub y_labels: Vec<String>,
}

/// Project the visible window. `None` until the first sample arrives.
pub fn project<Tz: TimeZone>(
    state: &DashboardState,
    window: ChartWindow,
    max_points: usize,
    tz: &Tz,
) -> Option<ChartData> {
    let temps = &state.temps;
    let last = temps.last_timestamp()?;
    let start = match window.minutes() {
        Some(m) => {
            let cutoff = last - f64::from(m) * 60.0;
            temps.timestamps.partition_point(|t| *t < cutoff)
        }
        None => 0,
    };
    let stride = (temps.len() - start).div_ceil(max_points.max(1)).max(1);

    let traces: Vec<Trace> = TRACE_ORDER
        .iter()
        .map(|sensor| {
            let values = temps.series(*sensor);
            let mut segments = Vec::new();
            let mut run: Vec<(f64, f64)> = Vec::new();
            for i in start..temps.len() {
                match values[i].finite() {
                    // Decimate within a run; always keep a run's first point.
                    Some(v) if run.is_empty() || (i - start) % stride == 0 => {
                        run.push((temps.timestamps[i], v))
                    }
                    Some(_) => {}
                    None if run.is_empty() => {}
                    None => segments.push(std::mem::take(&mut run)),
                }
            }
            if !run.is_empty() {
                segments.push(run);
            }
            Trace {
                sensor: *sensor,
                segments,
            }
        })
        .collect();

    let x_min = match window.minutes() {
        Some(m) => last - f64::from(m) * 60.0,
        None => temps.timestamps[start],
    };
    let x_bounds = if last > x_min { [x_min, last] } else { [last - 1.0, last + 1.0] };
    let y_bounds = y_bounds(&traces);

    Some(ChartData {
        x_labels: time_labels(x_bounds, tz),
        y_labels: vec![
            format!("{:.2}", y_bounds[0]),
            format!("{:.2}", (y_bounds[0] + y_bounds[1]) / 2.0),
            format!("{:.2}", y_bounds[1]),
        ],
        traces,
        x_bounds,
        y_bounds,
    })
}

fn y_bounds(traces: &[Trace]) -> [f64; 2] {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for (_, v) in traces.iter().flat_map(|t| t.points()) {
        lo = lo.min(*v);
        hi = hi.max(*v);
    }
    if !lo.is_finite() || !hi.is_finite() {
        return [0.0, 1.0];
    }
    let span = hi - lo;
    if span < 1e-9 {
        let pad = (hi.abs() * 0.05).max(0.5);
        return [lo - pad, hi + pad];
    }
    [lo - span * 0.05, hi + span * 0.05]
}

fn time_labels<Tz: TimeZone>(x_bounds: [f64; 2], tz: &Tz) -> Vec<String> {
    let mid = (x_bounds[0] + x_bounds[1]) / 2.0;
    [x_bounds[0], mid, x_bounds[1]]
        .iter()
        .map(|secs| {
            DateTime::from_timestamp(secs.floor() as i64, 0)
                .map(|utc| {
                    let d = utc.with_timezone(tz);
                    format!("{:02}:{:02}", d.hour(), d.minute())
                })
                .unwrap_or_default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Reading, TempBatch};
    use chrono::Utc;

    fn state_with(rows: &[(f64, f64)]) -> DashboardState {
        let mut s = DashboardState::new();
        let mut b = TempBatch::default();
        for (ts, v) in rows {
            b.push_row(*ts, [(*v).into(), (*v).into(), Reading::Missing, (*v).into()]);
        }
        s.temps.append(b, 100_000);
        s
    }

    #[test]
    fn test_window_parse_and_cycle() {
        assert_eq!(ChartWindow::parse("6H"), Some(ChartWindow::SixHours));
        assert_eq!(ChartWindow::parse("2h"), None);
        let mut w = ChartWindow::FifteenMinutes;
        for _ in 0..5 {
            w = w.next();
        }
        assert_eq!(w, ChartWindow::FifteenMinutes);
    }

    #[test]
    fn test_empty_series_has_no_chart() {
        let s = DashboardState::new();
        assert!(project(&s, ChartWindow::All, 1000, &Utc).is_none());
    }

    #[test]
    fn test_window_clips_old_samples() {
        // 0s .. 7200s, one sample per 10 minutes
        let rows: Vec<(f64, f64)> = (0..=12).map(|i| (i as f64 * 600.0, 4.0)).collect();
        let s = state_with(&rows);
        let chart = project(&s, ChartWindow::OneHour, 1000, &Utc).unwrap();
        let faa = &chart.traces[0];
        assert_eq!(faa.sensor, Sensor::TFAA);
        assert_eq!(faa.segments.len(), 1);
        assert_eq!(faa.segments[0].first().unwrap().0, 3600.0);
        assert_eq!(faa.points().count(), 7);
        assert_eq!(chart.x_bounds, [3600.0, 7200.0]);
    }

    #[test]
    fn test_missing_values_are_skipped() {
        let s = state_with(&[(0.0, 1.0), (1.0, 2.0)]);
        let chart = project(&s, ChartWindow::All, 1000, &Utc).unwrap();
        let ggg = chart.traces.iter().find(|t| t.sensor == Sensor::TGGG).unwrap();
        assert!(ggg.segments.is_empty());
    }

    #[test]
    fn test_gap_rows_split_the_line() {
        let mut s = DashboardState::new();
        let gap = || [Reading::Missing, Reading::Missing, Reading::Missing, Reading::Missing];
        let row = |v: f64| [Reading::Value(v), Reading::Value(v), Reading::Value(v), Reading::Value(v)];
        let mut b = TempBatch::default();
        b.push_row(0.0, gap());
        b.push_row(1.0, row(1.0));
        b.push_row(2.0, row(1.1));
        b.push_row(3.0, gap());
        b.push_row(10.0, row(2.0));
        b.push_row(11.0, row(2.1));
        s.temps.append(b, 100);
        let chart = project(&s, ChartWindow::All, 1000, &Utc).unwrap();
        let faa = &chart.traces[0];
        assert_eq!(
            faa.segments,
            vec![vec![(1.0, 1.0), (2.0, 1.1)], vec![(10.0, 2.0), (11.0, 2.1)]]
        );
    }

    #[test]
    fn test_flat_series_gets_padded_bounds() {
        let s = state_with(&[(0.0, 4.0), (1.0, 4.0)]);
        let chart = project(&s, ChartWindow::All, 1000, &Utc).unwrap();
        assert!(chart.y_bounds[0] < 4.0 && chart.y_bounds[1] > 4.0);
    }

    #[test]
    fn test_decimation_caps_points() {
        let rows: Vec<(f64, f64)> = (0..1000).map(|i| (i as f64, i as f64)).collect();
        let s = state_with(&rows);
        let chart = project(&s, ChartWindow::All, 100, &Utc).unwrap();
        assert!(chart.traces[0].points().count() <= 100);
        assert_eq!(chart.x_labels, vec!["00:00", "00:08", "00:16"]);
    }

    #[test]
    fn test_trace_names() {
        let names: Vec<&str> = TRACE_ORDER.iter().map(|s| trace_name(*s)).collect();
        assert_eq!(names, vec!["FAA", "GGG", "3K", "60K"]);
    }
}
