use serde_json::{Map, Value};

use crate::protocol::{InstrumentFlags, LogRecord, Reading, TempBatch};

/// The four cryostat thermometers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sensor {
    T60K,
    T03K,
    TGGG,
    TFAA,
}

impl Sensor {
    /// Gauge order, warmest stage first.
    pub const ALL: [Sensor; 4] = [Sensor::T60K, Sensor::T03K, Sensor::TGGG, Sensor::TFAA];

    pub fn label(&self) -> &'static str {
        match self {
            Sensor::T60K => "60K",
            Sensor::T03K => "03K",
            Sensor::TGGG => "GGG",
            Sensor::TFAA => "FAA",
        }
    }

    /// Hex color used by every view of this sensor.
    pub fn color_hex(&self) -> &'static str {
        match self {
            Sensor::T60K => "#d62728",
            Sensor::T03K => "#2ca02c",
            Sensor::TGGG => "#ff7f0e",
            Sensor::TFAA => "#1f77b4",
        }
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Sensor::T60K => (0xd6, 0x27, 0x28),
            Sensor::T03K => (0x2c, 0xa0, 0x2c),
            Sensor::TGGG => (0xff, 0x7f, 0x0e),
            Sensor::TFAA => (0x1f, 0x77, 0xb4),
        }
    }
}

/// Temperature history as parallel columns of equal length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TempSeries {
    /// Seconds since the Unix epoch.
    pub timestamps: Vec<f64>,
    pub t60k: Vec<Reading>,
    pub t03k: Vec<Reading>,
    pub tggg: Vec<Reading>,
    pub tfaa: Vec<Reading>,
}

/// What happened while appending a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendStats {
    pub appended: usize,
    /// Rows discarded because the batch columns had different lengths.
    pub ragged_dropped: usize,
    pub resorted: bool,
    /// Oldest rows dropped to stay within capacity.
    pub evicted: usize,
}

impl TempSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn series(&self, sensor: Sensor) -> &[Reading] {
        match sensor {
            Sensor::T60K => &self.t60k,
            Sensor::T03K => &self.t03k,
            Sensor::TGGG => &self.tggg,
            Sensor::TFAA => &self.tfaa,
        }
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.timestamps.last().copied()
    }

    /// Latest reading of one sensor.
    pub fn latest(&self, sensor: Sensor) -> Option<&Reading> {
        self.series(sensor).last()
    }

    /// Change per second between the last two samples. NaN when there are
    /// fewer than two samples or either value is not numeric.
    pub fn rate(&self, sensor: Sensor) -> f64 {
        let n = self.len();
        if n < 2 {
            return f64::NAN;
        }
        let values = self.series(sensor);
        let dt = self.timestamps[n - 1] - self.timestamps[n - 2];
        (values[n - 1].as_f64() - values[n - 2].as_f64()) / dt
    }

    /// Append a batch, keeping the columns aligned and ordered by time.
    pub fn append(&mut self, batch: TempBatch, capacity: usize) -> AppendStats {
        let mut stats = AppendStats::default();
        let rows = batch.rows();
        let longest = [
            batch.timestamps.len(),
            batch.t60k.len(),
            batch.t03k.len(),
            batch.tggg.len(),
            batch.tfaa.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        stats.ragged_dropped = longest - rows;
        if rows == 0 {
            return stats;
        }

        let out_of_order = match (self.last_timestamp(), batch.timestamps.first()) {
            (Some(last), Some(first)) => *first < last,
            _ => false,
        };

        let TempBatch {
            timestamps,
            t60k,
            t03k,
            tggg,
            tfaa,
        } = batch;
        self.timestamps.extend(timestamps.into_iter().take(rows));
        self.t60k.extend(t60k.into_iter().take(rows));
        self.t03k.extend(t03k.into_iter().take(rows));
        self.tggg.extend(tggg.into_iter().take(rows));
        self.tfaa.extend(tfaa.into_iter().take(rows));
        stats.appended = rows;

        let in_batch_disorder = self.timestamps.windows(2).any(|w| w[1] < w[0]);
        if out_of_order || in_batch_disorder {
            self.sort_by_time();
            stats.resorted = true;
        }

        if self.len() > capacity {
            let excess = self.len() - capacity;
            self.timestamps.drain(..excess);
            self.t60k.drain(..excess);
            self.t03k.drain(..excess);
            self.tggg.drain(..excess);
            self.tfaa.drain(..excess);
            stats.evicted = excess;
        }
        stats
    }

    /// Stable sort by timestamp. Repeated timestamps keep the first row, so
    /// a history reply overlapping live samples does not double them.
    fn sort_by_time(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|a, b| self.timestamps[*a].total_cmp(&self.timestamps[*b]));
        order.dedup_by(|later, earlier| self.timestamps[*later] == self.timestamps[*earlier]);

        let timestamps = order.iter().map(|i| self.timestamps[*i]).collect();
        let t60k = order.iter().map(|i| self.t60k[*i].clone()).collect();
        let t03k = order.iter().map(|i| self.t03k[*i].clone()).collect();
        let tggg = order.iter().map(|i| self.tggg[*i].clone()).collect();
        let tfaa = order.iter().map(|i| self.tfaa[*i].clone()).collect();
        self.timestamps = timestamps;
        self.t60k = t60k;
        self.t03k = t03k;
        self.tggg = tggg;
        self.tfaa = tfaa;
    }

    pub fn is_aligned(&self) -> bool {
        let n = self.timestamps.len();
        self.t60k.len() == n && self.t03k.len() == n && self.tggg.len() == n && self.tfaa.len() == n
    }
}

/// Instruments the server reports on, in display order.
pub const DEFAULT_INSTRUMENTS: [&str; 7] = [
    "Compressor",
    "Ruox Temperature Monitor",
    "Diode Temperature Monitor",
    "Power Supply",
    "Magnet Voltage Monitor",
    "Heat Switch",
    "Pump Cart Pressure",
];

pub const HEAT_SWITCH: &str = "Heat Switch";
pub const COMPRESSOR: &str = "Compressor";

/// Instrument name to connectivity, in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruments {
    entries: Vec<(String, InstrumentFlags)>,
}

impl Default for Instruments {
    fn default() -> Self {
        Self {
            entries: DEFAULT_INSTRUMENTS
                .iter()
                .map(|name| (name.to_string(), InstrumentFlags::default()))
                .collect(),
        }
    }
}

impl Instruments {
    pub fn get(&self, name: &str) -> Option<InstrumentFlags> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, f)| *f)
    }

    /// Replace a status wholesale, appending unseen names.
    pub fn upsert(&mut self, name: String, flags: InstrumentFlags) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = flags,
            None => self.entries.push((name, flags)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, InstrumentFlags)> {
        self.entries.iter().map(|(n, f)| (n.as_str(), *f))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the dashboard knows about the cryostat.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardState {
    pub temps: TempSeries,
    pub instruments: Instruments,
    /// Newest first.
    pub log: Vec<LogRecord>,
    pub is_magging_up: bool,
    pub is_regulating: bool,
    /// `None` while the server cannot read the compressor.
    pub compressor_on: Option<bool>,
    /// Torr.
    pub pressure: f64,
    pub ps_voltage: f64,
    pub ps_current: f64,
    pub back_emf: f64,
    /// Scalars this client does not interpret.
    pub extra: Map<String, Value>,
}

impl Default for DashboardState {
    fn default() -> Self {
        Self {
            temps: TempSeries::default(),
            instruments: Instruments::default(),
            log: Vec::new(),
            // Controls stay locked until the server says otherwise.
            is_magging_up: true,
            is_regulating: true,
            compressor_on: Some(false),
            pressure: f64::NAN,
            ps_voltage: f64::NAN,
            ps_current: f64::NAN,
            back_emf: f64::NAN,
            extra: Map::new(),
        }
    }
}

impl DashboardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_is_sorted(&self) -> bool {
        self.log.windows(2).all(|w| w[0].datetime >= w[1].datetime)
    }
}
