use bitvec::prelude::*;
use ndarray::{Array1, ArrayD, IxDyn};
use std::fmt::Display;

use super::error::{FormulaError, HistogramError};
use super::event::EventCode;
use super::formula::FormulaEngine;
use super::schema::{RecordSchema, RecordView};

/// Identity of a histogram: the event type it belongs to and a serial unique within the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistogramId {
    pub event: EventCode,
    pub serial: u64,
}

impl Display for HistogramId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.event, self.serial)
    }
}

/// Most bins (under/overflow included) a single histogram may allocate
pub const MAX_BINS: usize = 1 << 28;

/// A uniformly binned axis. Bin 0 is the underflow and bin `nbins + 1` the overflow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axis {
    pub nbins: usize,
    pub low: f64,
    pub high: f64,
}

impl Axis {
    pub fn new(nbins: usize, low: f64, high: f64) -> Result<Self, HistogramError> {
        if nbins == 0 {
            return Err(HistogramError::BadAxis(String::from(
                "an axis needs at least one bin",
            )));
        }
        if nbins > MAX_BINS - 2 {
            return Err(HistogramError::BadAxis(format!(
                "{nbins} bins is more than the limit of {MAX_BINS}"
            )));
        }
        if !low.is_finite() || !high.is_finite() || low >= high {
            return Err(HistogramError::BadAxis(format!(
                "range [{low}, {high}) is empty or not finite"
            )));
        }
        Ok(Self { nbins, low, high })
    }

    pub fn find_bin(&self, value: f64) -> usize {
        if value < self.low {
            0
        } else if value >= self.high {
            self.nbins + 1
        } else {
            let fraction = (value - self.low) / (self.high - self.low);
            ((fraction * self.nbins as f64) as usize).min(self.nbins - 1) + 1
        }
    }

    pub fn bin_width(&self) -> f64 {
        (self.high - self.low) / self.nbins as f64
    }

    /// Axis with one bin per integer in `0..n`
    fn counting(n: usize) -> Self {
        Self {
            nbins: n,
            low: 0.0,
            high: n as f64,
        }
    }
}

/// Which axis of a summary histogram carries the parameter index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    /// parameter index on x, value on y
    #[default]
    Vertical,
    /// value on x, parameter index on y
    Horizontal,
}

impl Orientation {
    /// `"v"` or `"h"`. Anything else falls back to vertical.
    pub fn from_flag(flag: &str) -> Self {
        match flag.trim() {
            "h" | "H" => Orientation::Horizontal,
            "v" | "V" => Orientation::Vertical,
            other => {
                spdlog::warn!("Orientation option {other} was not recognized. Defaulting to vertical");
                Orientation::Vertical
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistogramKind {
    /// 1 to 3 dimensions, one increment per event
    Standard,
    /// Many parameters sharing one value axis
    Summary { orientation: Orientation },
    /// Groups of parameters filled tuple by tuple into the same bins
    Gamma,
    /// One increment per set bit of an integer parameter
    Bitmask { nbits: u32 },
    /// A growing time series, one value per event
    Scaler,
}

/// Everything needed to create a histogram
#[derive(Debug, Clone)]
pub struct HistogramSpec {
    pub name: String,
    /// Empty means generate one from the parameters and gate
    pub title: String,
    pub params: String,
    pub gate: String,
    pub kind: HistogramKind,
    pub axes: Vec<Axis>,
}

impl HistogramSpec {
    fn new(name: &str, params: &str, gate: &str, kind: HistogramKind, axes: Vec<Axis>) -> Self {
        Self {
            name: name.to_string(),
            title: String::new(),
            params: params.to_string(),
            gate: gate.to_string(),
            kind,
            axes,
        }
    }

    pub fn d1(name: &str, params: &str, gate: &str, x: Axis) -> Self {
        Self::new(name, params, gate, HistogramKind::Standard, vec![x])
    }

    pub fn d2(name: &str, params: &str, gate: &str, x: Axis, y: Axis) -> Self {
        Self::new(name, params, gate, HistogramKind::Standard, vec![x, y])
    }

    pub fn d3(name: &str, params: &str, gate: &str, x: Axis, y: Axis, z: Axis) -> Self {
        Self::new(name, params, gate, HistogramKind::Standard, vec![x, y, z])
    }

    /// `params` is a `;` separated list which may use `base[first-last]` ranges
    pub fn summary(
        name: &str,
        params: &str,
        gate: &str,
        values: Axis,
        orientation: Orientation,
    ) -> Self {
        Self::new(
            name,
            params,
            gate,
            HistogramKind::Summary { orientation },
            vec![values],
        )
    }

    /// `params` holds one `;` separated group per axis, groups separated by `:`
    pub fn gamma(name: &str, params: &str, gate: &str, axes: Vec<Axis>) -> Self {
        Self::new(name, params, gate, HistogramKind::Gamma, axes)
    }

    pub fn bitmask(name: &str, param: &str, gate: &str, nbits: u32) -> Self {
        Self::new(
            name,
            param,
            gate,
            HistogramKind::Bitmask { nbits },
            vec![Axis::counting(nbits as usize)],
        )
    }

    pub fn scaler(name: &str, param: &str, gate: &str, initial_bins: usize) -> Self {
        Self::new(
            name,
            param,
            gate,
            HistogramKind::Scaler,
            vec![Axis::counting(initial_bins.max(1))],
        )
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
}

/// Expand `base[first-last]suffix` into `base[first]suffix`, ..., `base[last]suffix`
fn expand_range(entry: &str) -> Result<Vec<String>, HistogramError> {
    let bad = || HistogramError::BadParameterCount {
        params: entry.to_string(),
        expected: 1,
    };
    let range = entry.find('[').and_then(|open| {
        let close = open + entry[open..].find(']')?;
        let (first, last) = entry[open + 1..close].split_once('-')?;
        Some((open, close, first, last))
    });
    match range {
        Some((open, close, first, last)) => {
            let first = first.trim().parse::<usize>().map_err(|_| bad())?;
            let last = last.trim().parse::<usize>().map_err(|_| bad())?;
            if first > last {
                return Err(bad());
            }
            let (base, suffix) = (&entry[..open], &entry[close + 1..]);
            Ok((first..=last)
                .map(|index| format!("{base}[{index}]{suffix}"))
                .collect())
        }
        None => Ok(vec![entry.to_string()]),
    }
}

fn expand_list(list: &str) -> Result<Vec<String>, HistogramError> {
    let mut expanded = Vec::new();
    for entry in list.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        expanded.extend(expand_range(entry)?);
    }
    if expanded.is_empty() {
        return Err(HistogramError::BadParameterCount {
            params: list.to_string(),
            expected: 1,
        });
    }
    Ok(expanded)
}

fn default_title(params: &str, gate: &str) -> String {
    format!("{params} {{ {gate} }}")
}

#[derive(Debug, Clone)]
enum Bins {
    Grid(ArrayD<f64>),
    Series { values: Vec<f64>, cursor: usize },
}

fn grid(axes: &[Axis]) -> Result<Bins, HistogramError> {
    let shape: Vec<usize> = axes.iter().map(|a| a.nbins.saturating_add(2)).collect();
    let total = shape
        .iter()
        .try_fold(1usize, |total, n| total.checked_mul(*n))
        .filter(|total| *total <= MAX_BINS);
    if total.is_none() {
        return Err(HistogramError::BadAxis(format!(
            "{shape:?} bins is more than the limit of {MAX_BINS}"
        )));
    }
    Ok(Bins::Grid(ArrayD::zeros(IxDyn(&shape))))
}

/// A detached copy of a histogram, safe to hand to the foreground
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub id: HistogramId,
    pub name: String,
    pub title: String,
    pub kind: HistogramKind,
    pub params: Vec<String>,
    pub gate: String,
    pub axes: Vec<Axis>,
    /// Includes under/overflow bins, except for scalers
    pub bins: ArrayD<f64>,
    pub entries: u64,
}

impl HistogramSnapshot {
    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    pub fn bin_content(&self, index: &[usize]) -> Option<f64> {
        self.bins.get(IxDyn(index)).copied()
    }

    pub fn total(&self) -> f64 {
        self.bins.sum()
    }
}

/// A live histogram. Only ever reached through its registry, which holds the set lock while any
/// of these methods run.
#[derive(Debug)]
pub struct Histogram {
    id: HistogramId,
    name: String,
    title: String,
    use_default_title: bool,
    param_arg: String,
    kind: HistogramKind,
    axes: Vec<Axis>,
    gate: FormulaEngine,
    params: Vec<FormulaEngine>,
    bins: Bins,
    entries: u64,
    growth_factor: f64,
}

impl Histogram {
    pub(crate) fn new(
        id: HistogramId,
        spec: &HistogramSpec,
        branch: &str,
        schema: &'static RecordSchema,
        growth_factor: f64,
    ) -> Result<Self, HistogramError> {
        let gate = FormulaEngine::new(branch, schema, &spec.gate)?;
        let compile = |exprs: Vec<String>| -> Result<Vec<FormulaEngine>, FormulaError> {
            exprs
                .iter()
                .map(|e| FormulaEngine::new(branch, schema, e))
                .collect()
        };
        let bad_count = |expected: usize| HistogramError::BadParameterCount {
            params: spec.params.clone(),
            expected,
        };

        let (params, axes) = match &spec.kind {
            HistogramKind::Standard => {
                let expected = spec.axes.len();
                if !(1..=3).contains(&expected) {
                    return Err(HistogramError::BadAxis(format!(
                        "{expected} axes given, standard histograms have 1 to 3"
                    )));
                }
                let tokens: Vec<String> = spec.params.split(':').map(String::from).collect();
                if tokens.len() != expected || tokens.iter().any(|t| t.trim().is_empty()) {
                    return Err(bad_count(expected));
                }
                (compile(tokens)?, spec.axes.clone())
            }
            HistogramKind::Summary { orientation } => {
                let values = match spec.axes.as_slice() {
                    [values] => *values,
                    _ => {
                        return Err(HistogramError::BadAxis(String::from(
                            "summary histograms take exactly one value axis",
                        )))
                    }
                };
                let params = compile(expand_list(&spec.params)?)?;
                let index = Axis::counting(params.len());
                let axes = match orientation {
                    Orientation::Vertical => vec![index, values],
                    Orientation::Horizontal => vec![values, index],
                };
                (params, axes)
            }
            HistogramKind::Gamma => {
                let expected = spec.axes.len();
                if !(1..=3).contains(&expected) {
                    return Err(HistogramError::BadAxis(format!(
                        "{expected} axes given, gamma histograms have 1 to 3"
                    )));
                }
                let groups = spec
                    .params
                    .split(':')
                    .map(expand_list)
                    .collect::<Result<Vec<_>, _>>()?;
                if groups.len() != expected {
                    return Err(bad_count(expected));
                }
                if groups.iter().any(|g| g.len() != groups[0].len()) {
                    return Err(HistogramError::MismatchedGroups(spec.params.clone()));
                }
                (compile(groups.concat())?, spec.axes.clone())
            }
            HistogramKind::Bitmask { nbits } => {
                if !(1..=64).contains(nbits) {
                    return Err(HistogramError::BadBitCount(*nbits));
                }
                if spec.params.contains(':') {
                    return Err(bad_count(1));
                }
                (
                    compile(vec![spec.params.clone()])?,
                    vec![Axis::counting(*nbits as usize)],
                )
            }
            HistogramKind::Scaler => {
                if spec.params.contains(':') {
                    return Err(bad_count(1));
                }
                let capacity = spec.axes.first().map(|a| a.nbins).unwrap_or(1).max(1);
                if capacity > MAX_BINS {
                    return Err(HistogramError::BadAxis(format!(
                        "{capacity} scaler bins is more than the limit of {MAX_BINS}"
                    )));
                }
                (
                    compile(vec![spec.params.clone()])?,
                    vec![Axis::counting(capacity)],
                )
            }
        };

        let bins = match spec.kind {
            HistogramKind::Scaler => Bins::Series {
                values: vec![0.0; axes[0].nbins],
                cursor: 0,
            },
            _ => grid(&axes)?,
        };

        let use_default_title = spec.title.trim().is_empty();
        let title = if use_default_title {
            default_title(&spec.params, gate.expression())
        } else {
            spec.title.clone()
        };

        Ok(Self {
            id,
            name: spec.name.clone(),
            title,
            use_default_title,
            param_arg: spec.params.clone(),
            kind: spec.kind.clone(),
            axes,
            gate,
            params,
            bins,
            entries: 0,
            growth_factor: growth_factor.max(1.0),
        })
    }

    pub fn id(&self) -> HistogramId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn kind(&self) -> &HistogramKind {
        &self.kind
    }

    pub fn gate(&self) -> &str {
        self.gate.expression()
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Fill from a view borrowed out of the already held data lock. Returns the number of
    /// increments made.
    pub(crate) fn fill_unlocked(&mut self, view: &RecordView<'_>) -> usize {
        let gate = self.gate.evaluate(view);
        if gate == 0.0 || gate.is_nan() {
            return 0;
        }
        let values: Vec<f64> = self.params.iter().map(|p| p.evaluate(view)).collect();

        let filled = match (&self.kind, &mut self.bins) {
            (HistogramKind::Standard, Bins::Grid(bins)) => {
                if values.iter().any(|v| v.is_nan()) {
                    0
                } else {
                    let index: Vec<usize> = self
                        .axes
                        .iter()
                        .zip(values.iter())
                        .map(|(axis, v)| axis.find_bin(*v))
                        .collect();
                    increment(bins, &index)
                }
            }
            (HistogramKind::Summary { orientation }, Bins::Grid(bins)) => {
                let value_axis = match orientation {
                    Orientation::Vertical => self.axes[1],
                    Orientation::Horizontal => self.axes[0],
                };
                let mut filled = 0;
                for (position, value) in values.iter().enumerate() {
                    if value.is_nan() {
                        continue;
                    }
                    let (param_bin, value_bin) = (position + 1, value_axis.find_bin(*value));
                    let index = match orientation {
                        Orientation::Vertical => [param_bin, value_bin],
                        Orientation::Horizontal => [value_bin, param_bin],
                    };
                    filled += increment(bins, &index);
                }
                filled
            }
            (HistogramKind::Gamma, Bins::Grid(bins)) => {
                let dims = self.axes.len();
                let tuples = values.len() / dims;
                let mut filled = 0;
                for position in 0..tuples {
                    let coords: Vec<f64> =
                        (0..dims).map(|d| values[d * tuples + position]).collect();
                    if coords.iter().any(|v| v.is_nan()) {
                        continue;
                    }
                    let index: Vec<usize> = self
                        .axes
                        .iter()
                        .zip(coords.iter())
                        .map(|(axis, v)| axis.find_bin(*v))
                        .collect();
                    filled += increment(bins, &index);
                }
                filled
            }
            (HistogramKind::Bitmask { nbits }, Bins::Grid(bins)) => {
                let value = values[0];
                if value.is_nan() {
                    0
                } else {
                    // negative values keep their two's complement bit pattern
                    let word = if value < 0.0 {
                        value as i64 as u64
                    } else {
                        value as u64
                    };
                    let mut filled = 0;
                    for bit in word.view_bits::<Lsb0>().iter_ones() {
                        if bit >= *nbits as usize {
                            break;
                        }
                        filled += increment(bins, &[bit + 1]);
                    }
                    filled
                }
            }
            (HistogramKind::Scaler, Bins::Series { values: series, cursor }) => {
                let value = values[0];
                if value.is_nan() {
                    0
                } else {
                    if *cursor == series.len() {
                        let grown = ((series.len() as f64) * self.growth_factor).ceil() as usize;
                        series.resize(grown.min(MAX_BINS).max(series.len() + 1), 0.0);
                        self.axes[0] = Axis::counting(series.len());
                    }
                    series[*cursor] = value;
                    *cursor += 1;
                    1
                }
            }
            _ => 0,
        };
        self.entries += filled as u64;
        filled
    }

    /// Replace the gate. On error the old gate is kept.
    pub(crate) fn regate(&mut self, gate: &str) -> Result<(), FormulaError> {
        self.gate.change_expression(gate)?;
        if self.use_default_title {
            self.title = default_title(&self.param_arg, self.gate.expression());
        }
        Ok(())
    }

    /// Zero every bin and the entry count. Axes and formulas are unchanged.
    pub(crate) fn clear(&mut self) {
        match &mut self.bins {
            Bins::Grid(bins) => bins.fill(0.0),
            Bins::Series { values, cursor } => {
                values.fill(0.0);
                *cursor = 0;
            }
        }
        self.entries = 0;
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let bins = match &self.bins {
            Bins::Grid(bins) => bins.clone(),
            Bins::Series { values, .. } => Array1::from(values.clone()).into_dyn(),
        };
        HistogramSnapshot {
            id: self.id,
            name: self.name.clone(),
            title: self.title.clone(),
            kind: self.kind.clone(),
            params: self
                .params
                .iter()
                .map(|p| p.expression().to_string())
                .collect(),
            gate: self.gate.expression().to_string(),
            axes: self.axes.clone(),
            bins,
            entries: self.entries,
        }
    }
}

fn increment(bins: &mut ArrayD<f64>, index: &[usize]) -> usize {
    match bins.get_mut(IxDyn(index)) {
        Some(bin) => {
            *bin += 1.0;
            1
        }
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Record;

    #[derive(Debug, Default)]
    struct Shot {
        adc: [f64; 6],
        pattern: u32,
        energy: f64,
        trigger: u8,
    }
    crate::impl_record!(Shot {
        adc,
        pattern,
        energy,
        trigger
    });

    const ID: HistogramId = HistogramId {
        event: 1,
        serial: 0,
    };

    fn build(spec: &HistogramSpec) -> Result<Histogram, HistogramError> {
        Histogram::new(ID, spec, "shot", Shot::schema(), 2.0)
    }

    fn axis(nbins: usize, low: f64, high: f64) -> Axis {
        Axis::new(nbins, low, high).unwrap()
    }

    #[test]
    fn test_axis_bins() {
        let x = axis(10, 0.0, 100.0);
        assert_eq!(x.find_bin(-1.0), 0);
        assert_eq!(x.find_bin(0.0), 1);
        assert_eq!(x.find_bin(9.99), 1);
        assert_eq!(x.find_bin(50.0), 6);
        assert_eq!(x.find_bin(99.99), 10);
        assert_eq!(x.find_bin(100.0), 11);
        assert!(Axis::new(0, 0.0, 1.0).is_err());
        assert!(Axis::new(1, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_standard_fill_and_gate() {
        let mut hist =
            build(&HistogramSpec::d1("e", "energy", "trigger == 1", axis(10, 0.0, 10.0))).unwrap();
        assert_eq!(hist.title(), "energy { trigger==1 }");
        let mut shot = Shot {
            energy: 3.5,
            ..Default::default()
        };
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 0);
        shot.trigger = 1;
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 1);
        let snap = hist.snapshot();
        assert_eq!(snap.bin_content(&[4]), Some(1.0));
        assert_eq!(snap.entries, 1);

        hist.clear();
        assert_eq!(hist.snapshot().total(), 0.0);
        assert_eq!(hist.entries(), 0);
    }

    #[test]
    fn test_two_dimensional_parameter_order() {
        let mut hist = build(&HistogramSpec::d2(
            "xy",
            "adc[0]:adc[1]",
            "",
            axis(4, 0.0, 4.0),
            axis(4, 0.0, 40.0),
        ))
        .unwrap();
        let mut shot = Shot::default();
        shot.adc[0] = 1.5;
        shot.adc[1] = 35.0;
        hist.fill_unlocked(&RecordView::new(&shot));
        assert_eq!(hist.snapshot().bin_content(&[2, 4]), Some(1.0));
    }

    #[test]
    fn test_bad_parameter_count() {
        let result = build(&HistogramSpec::d2(
            "bad",
            "adc[0]",
            "",
            axis(4, 0.0, 4.0),
            axis(4, 0.0, 4.0),
        ));
        assert!(matches!(
            result,
            Err(HistogramError::BadParameterCount { expected: 2, .. })
        ));
        let result = build(&HistogramSpec::d1("bad", "nosuch", "", axis(4, 0.0, 4.0)));
        assert!(matches!(result, Err(HistogramError::Formula(_))));
    }

    #[test]
    fn test_regate_keeps_bins() {
        let mut hist = build(&HistogramSpec::d1("e", "energy", "", axis(10, 0.0, 10.0))).unwrap();
        let shot = Shot {
            energy: 1.0,
            ..Default::default()
        };
        hist.fill_unlocked(&RecordView::new(&shot));
        assert!(hist.regate("energy >").is_err());
        assert_eq!(hist.gate(), "1");
        hist.regate("energy > 5").unwrap();
        assert_eq!(hist.title(), "energy { energy>5 }");
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 0);
        assert_eq!(hist.entries(), 1);

        let mut titled =
            build(&HistogramSpec::d1("t", "energy", "", axis(10, 0.0, 10.0)).with_title("mine"))
                .unwrap();
        titled.regate("0").unwrap();
        assert_eq!(titled.title(), "mine");
        assert_eq!(titled.fill_unlocked(&RecordView::new(&shot)), 0);
    }

    #[test]
    fn test_summary_range_expansion() {
        assert_eq!(
            expand_list("adc[0-2]; energy").unwrap(),
            vec!["adc[0]", "adc[1]", "adc[2]", "energy"]
        );
        assert!(expand_range("adc[3-1]").is_err());

        let mut hist = build(&HistogramSpec::summary(
            "sum",
            "adc[0-5]",
            "",
            axis(10, 0.0, 10.0),
            Orientation::Vertical,
        ))
        .unwrap();
        let mut shot = Shot::default();
        for (i, v) in shot.adc.iter_mut().enumerate() {
            *v = i as f64 * 1.5;
        }
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 6);
        let snap = hist.snapshot();
        assert_eq!(snap.axes[0].nbins, 6);
        // adc[2] = 3.0: parameter bin 3, value bin 4
        assert_eq!(snap.bin_content(&[3, 4]), Some(1.0));

        let mut horizontal = build(&HistogramSpec::summary(
            "sumh",
            "adc[0-5]",
            "",
            axis(10, 0.0, 10.0),
            Orientation::Horizontal,
        ))
        .unwrap();
        horizontal.fill_unlocked(&RecordView::new(&shot));
        let snap = horizontal.snapshot();
        assert_eq!(snap.axes[1].nbins, 6);
        assert_eq!(snap.bin_content(&[4, 3]), Some(1.0));
        assert_eq!(snap.bin_content(&[3, 4]), Some(0.0));
    }

    #[test]
    fn test_gamma_groups() {
        let mismatched = build(&HistogramSpec::gamma(
            "g",
            "adc[0-2]:adc[3-4]",
            "",
            vec![axis(10, 0.0, 10.0), axis(10, 0.0, 10.0)],
        ));
        assert!(matches!(mismatched, Err(HistogramError::MismatchedGroups(_))));

        let mut hist = build(&HistogramSpec::gamma(
            "g",
            "adc[0-2]",
            "",
            vec![axis(10, 0.0, 10.0)],
        ))
        .unwrap();
        let shot = Shot {
            adc: [1.0, 1.0, 7.0, 0.0, 0.0, 0.0],
            ..Default::default()
        };
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 3);
        let snap = hist.snapshot();
        assert_eq!(snap.bin_content(&[2]), Some(2.0));
        assert_eq!(snap.bin_content(&[8]), Some(1.0));
    }

    #[test]
    fn test_bitmask_counts_set_bits() {
        assert!(matches!(
            build(&HistogramSpec::bitmask("b", "pattern", "", 65)),
            Err(HistogramError::BadBitCount(65))
        ));
        let mut hist = build(&HistogramSpec::bitmask("b", "pattern", "", 4)).unwrap();
        let shot = Shot {
            pattern: 0b1_0101,
            ..Default::default()
        };
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 2);
        let snap = hist.snapshot();
        assert_eq!(snap.bin_content(&[1]), Some(1.0));
        assert_eq!(snap.bin_content(&[2]), Some(0.0));
        assert_eq!(snap.bin_content(&[3]), Some(1.0));
    }

    #[test]
    fn test_bitmask_negative_value() {
        let mut hist = build(&HistogramSpec::bitmask("b", "energy", "", 8)).unwrap();
        let shot = Shot {
            energy: -2.0,
            ..Default::default()
        };
        // ...1111_1110
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 7);
        let snap = hist.snapshot();
        assert_eq!(snap.bin_content(&[1]), Some(0.0));
        assert_eq!(snap.bin_content(&[8]), Some(1.0));
    }

    #[test]
    fn test_oversized_bin_count() {
        let wide = axis(1 << 22, 0.0, 1.0);
        assert!(matches!(
            build(&HistogramSpec::d3("big", "energy:energy:energy", "", wide, wide, wide)),
            Err(HistogramError::BadAxis(_))
        ));
        assert!(matches!(
            build(&HistogramSpec::d2("big", "energy:energy", "", wide, wide)),
            Err(HistogramError::BadAxis(_))
        ));
        assert!(matches!(
            build(&HistogramSpec::scaler("big", "energy", "", MAX_BINS + 1)),
            Err(HistogramError::BadAxis(_))
        ));
        assert!(Axis::new(usize::MAX, 0.0, 1.0).is_err());
        let fine = axis(1000, 0.0, 1.0);
        assert!(build(&HistogramSpec::d2("ok", "energy:energy", "", fine, fine)).is_ok());
    }

    #[test]
    fn test_scaler_grows() {
        let mut hist = build(&HistogramSpec::scaler("s", "energy", "", 2)).unwrap();
        let mut shot = Shot::default();
        for i in 0..5 {
            shot.energy = i as f64;
            hist.fill_unlocked(&RecordView::new(&shot));
        }
        let snap = hist.snapshot();
        assert_eq!(snap.bins.len(), 8);
        assert_eq!(snap.axes[0].nbins, 8);
        assert_eq!(snap.bin_content(&[4]), Some(4.0));
        hist.clear();
        shot.energy = 9.0;
        hist.fill_unlocked(&RecordView::new(&shot));
        assert_eq!(hist.snapshot().bin_content(&[0]), Some(9.0));
    }

    #[test]
    fn test_nan_is_not_filled() {
        let mut hist =
            build(&HistogramSpec::d1("n", "energy / adc[0]", "", axis(4, 0.0, 4.0))).unwrap();
        let shot = Shot::default();
        assert_eq!(hist.fill_unlocked(&RecordView::new(&shot)), 0);
        assert_eq!(hist.entries(), 0);
    }
}
