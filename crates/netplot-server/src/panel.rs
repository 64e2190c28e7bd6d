//! Panel state model and the process-wide frame configuration.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use smol_str::SmolStr;

use crate::error::NetplotError;

pub type SharedPanel = Arc<Mutex<PanelState>>;
pub type SharedGlobalConfig = Arc<Mutex<GlobalConfig>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphType {
    Time,
    Bar,
    Xy,
    Dial,
}

impl GraphType {
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "time" => Some(Self::Time),
            "bar" => Some(Self::Bar),
            "xy" => Some(Self::Xy),
            "dial" => Some(Self::Dial),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Bar => "bar",
            Self::Xy => "xy",
            Self::Dial => "dial",
        }
    }

    /// Axis rendering hint written into the persisted document.
    #[must_use]
    pub fn x_axis_type(self) -> &'static str {
        match self {
            Self::Time => "date",
            Self::Bar => "category",
            Self::Xy | Self::Dial => "linear",
        }
    }

    /// Time panels stamp implicit samples with the arrival time.
    fn implicit_x_is_wall_clock(self) -> bool {
        matches!(self, Self::Time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttributeKind {
    Text,
    Flag,
    Number,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanelAttribute {
    PlotTitle,
    PlotName,
    XAxisName,
    YAxisName,
    EnableLines,
    LineWidth,
    EnableShapes,
    EnableAutoscale,
    MinScaleValue,
    MaxScaleValue,
    MaxAgeSeconds,
    EnableLogYAxis,
    EnableZeroOnXScale,
    EnableZeroOnYScale,
    EnableLegend,
    TickCount,
}

impl PanelAttribute {
    pub const ALL: [Self; 16] = [
        Self::PlotTitle,
        Self::PlotName,
        Self::XAxisName,
        Self::YAxisName,
        Self::EnableLines,
        Self::LineWidth,
        Self::EnableShapes,
        Self::EnableAutoscale,
        Self::MinScaleValue,
        Self::MaxScaleValue,
        Self::MaxAgeSeconds,
        Self::EnableLogYAxis,
        Self::EnableZeroOnXScale,
        Self::EnableZeroOnYScale,
        Self::EnableLegend,
        Self::TickCount,
    ];

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.as_str() == name)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlotTitle => "plot_title",
            Self::PlotName => "plot_name",
            Self::XAxisName => "x_axis_name",
            Self::YAxisName => "y_axis_name",
            Self::EnableLines => "enable_lines",
            Self::LineWidth => "line_width",
            Self::EnableShapes => "enable_shapes",
            Self::EnableAutoscale => "enable_autoscale",
            Self::MinScaleValue => "min_scale_value",
            Self::MaxScaleValue => "max_scale_value",
            Self::MaxAgeSeconds => "max_age_seconds",
            Self::EnableLogYAxis => "enable_log_y_axis",
            Self::EnableZeroOnXScale => "enable_zero_on_x_scale",
            Self::EnableZeroOnYScale => "enable_zero_on_y_scale",
            Self::EnableLegend => "enable_legend",
            Self::TickCount => "tick_count",
        }
    }

    fn kind(self) -> AttributeKind {
        match self {
            Self::PlotTitle | Self::PlotName | Self::XAxisName | Self::YAxisName => {
                AttributeKind::Text
            }
            Self::EnableLines
            | Self::EnableShapes
            | Self::EnableAutoscale
            | Self::EnableLogYAxis
            | Self::EnableZeroOnXScale
            | Self::EnableZeroOnYScale
            | Self::EnableLegend => AttributeKind::Flag,
            Self::LineWidth | Self::MinScaleValue | Self::MaxScaleValue | Self::MaxAgeSeconds => {
                AttributeKind::Number
            }
            Self::TickCount => AttributeKind::Count,
        }
    }

    /// Checks `value` against the attribute's scalar type.
    pub fn validate(self, value: &str) -> Result<(), NetplotError> {
        let ok = match self.kind() {
            AttributeKind::Text => true,
            AttributeKind::Flag => parse_flag(value).is_some(),
            AttributeKind::Number => value.trim().parse::<f64>().is_ok_and(f64::is_finite),
            AttributeKind::Count => value.trim().parse::<u32>().is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(NetplotError::protocol(format!(
                "invalid value '{value}' for attribute {}",
                self.as_str()
            )))
        }
    }
}

/// Parses the boolean tokens accepted by flag attributes and `enable_status`.
#[must_use]
pub fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotValue {
    pub series: u32,
    pub x: f64,
    pub y: f64,
}

impl Serialize for PlotValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.series)?;
        tuple.serialize_element(&number_value(self.x))?;
        tuple.serialize_element(&number_value(self.y))?;
        tuple.end()
    }
}

/// Integral values are written as JSON integers, matching what the polling
/// client has always received.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        return Value::from(value as i64);
    }
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

#[derive(Debug, Clone)]
pub struct PanelState {
    slot_index: usize,
    graph_type: GraphType,
    attributes: IndexMap<PanelAttribute, SmolStr>,
    values: Vec<PlotValue>,
    trace_count: u32,
    replot_cursors: HashMap<u32, usize>,
    initialized: bool,
}

impl PanelState {
    #[must_use]
    pub fn new(slot_index: usize, graph_type: GraphType) -> Self {
        Self {
            slot_index,
            graph_type,
            attributes: IndexMap::new(),
            values: Vec::new(),
            trace_count: 0,
            replot_cursors: HashMap::new(),
            initialized: false,
        }
    }

    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    #[must_use]
    pub fn graph_type(&self) -> GraphType {
        self.graph_type
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn initialize(&mut self) {
        self.initialized = true;
    }

    pub fn set_attribute(&mut self, attribute: PanelAttribute, value: &str) {
        self.attributes.insert(attribute, SmolStr::new(value));
    }

    #[must_use]
    pub fn attribute(&self, attribute: PanelAttribute) -> Option<&str> {
        self.attributes.get(&attribute).map(SmolStr::as_str)
    }

    /// Document file name, known once `plot_name` has been set.
    #[must_use]
    pub fn filename(&self) -> Option<String> {
        let name = self.attribute(PanelAttribute::PlotName)?;
        let name = sanitize_file_stem(name);
        if name.is_empty() {
            return None;
        }
        Some(format!("{}_{name}.json", self.slot_index))
    }

    /// Opens a new series slot and returns its index.
    pub fn add_series(&mut self) -> u32 {
        let index = self.trace_count;
        self.trace_count = self.trace_count.saturating_add(1);
        index
    }

    #[must_use]
    pub fn trace_count(&self) -> u32 {
        self.trace_count
    }

    #[must_use]
    pub fn values(&self) -> &[PlotValue] {
        &self.values
    }

    #[must_use]
    pub fn series_len(&self, series: u32) -> usize {
        self.values
            .iter()
            .filter(|value| value.series == series)
            .count()
    }

    /// Appends a point, or overwrites the next point in place while a replot
    /// is in progress for `series`.
    pub fn push_value(&mut self, series: u32, x: f64, y: f64) {
        if let Some(position) = self.replot_cursors.get(&series).copied() {
            let existing = self
                .values
                .iter_mut()
                .filter(|value| value.series == series)
                .nth(position);
            if let Some(existing) = existing {
                existing.y = y;
                self.replot_cursors.insert(series, position + 1);
                return;
            }
            self.replot_cursors.remove(&series);
        }
        self.values.push(PlotValue { series, x, y });
    }

    /// Appends a value that arrived without an x coordinate.
    #[allow(clippy::cast_precision_loss)]
    pub fn push_implicit(&mut self, series: u32, y: f64, now_ms: f64) {
        let x = if self.graph_type.implicit_x_is_wall_clock() {
            now_ms
        } else {
            self.series_len(series) as f64
        };
        self.push_value(series, x, y);
    }

    /// Drops every buffered point of `series`; returns how many were removed.
    pub fn clear_series(&mut self, series: u32) -> usize {
        let before = self.values.len();
        self.values.retain(|value| value.series != series);
        self.replot_cursors.remove(&series);
        before - self.values.len()
    }

    pub fn replot_series(&mut self, series: u32) {
        self.replot_cursors.insert(series, 0);
    }

    #[must_use]
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        for (attribute, value) in &self.attributes {
            doc.insert(attribute.as_str().to_string(), json!(value.as_str()));
        }
        doc.insert("graph".into(), json!(self.graph_type.as_str()));
        doc.insert("plot_panel_index".into(), json!(self.slot_index));
        if let Some(filename) = self.filename() {
            doc.insert("plot_filename".into(), json!(filename));
        }
        doc.insert("trace_count".into(), json!(self.trace_count));
        doc.insert("x_axis_type".into(), json!(self.graph_type.x_axis_type()));
        doc.insert(
            "plot_values".into(),
            serde_json::to_value(&self.values).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        Value::Object(doc)
    }
}

fn sanitize_file_stem(name: &str) -> String {
    name.trim()
        .chars()
        .map(|ch| {
            if ch == '/' || ch == '\\' || ch.is_whitespace() {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalConfig {
    pub paper_bgcolor: SmolStr,
    pub plot_bgcolor: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_title: Option<SmolStr>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            paper_bgcolor: SmolStr::new("white"),
            plot_bgcolor: SmolStr::new("white"),
            grid: None,
            frame_title: None,
        }
    }
}

impl GlobalConfig {
    #[must_use]
    pub fn shared() -> SharedGlobalConfig {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Sets the panel grid; the grid may not hold more cells than slots.
    pub fn set_grid(&mut self, rows: u32, columns: u32, max_panels: usize) -> Result<(), NetplotError> {
        let cells = u64::from(rows) * u64::from(columns);
        if cells > max_panels as u64 {
            return Err(NetplotError::validation(format!(
                "grid of {rows} by {columns} is invalid (max plot count={max_panels})"
            )));
        }
        self.grid = Some((rows, columns));
        Ok(())
    }

    pub fn set_frame_title(&mut self, title: &str) {
        self.frame_title = Some(SmolStr::new(title));
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy_panel() -> PanelState {
        let mut panel = PanelState::new(3, GraphType::Xy);
        panel.set_attribute(PanelAttribute::PlotName, "demo");
        panel.initialize();
        panel
    }

    #[test]
    fn filename_requires_plot_name_and_sanitizes_separators() {
        let mut panel = PanelState::new(2, GraphType::Time);
        assert_eq!(panel.filename(), None);
        panel.set_attribute(PanelAttribute::PlotName, "cpu load/core 1");
        assert_eq!(panel.filename().as_deref(), Some("2_cpu_load_core_1.json"));
    }

    #[test]
    fn document_lists_attributes_and_integral_values() {
        let mut panel = xy_panel();
        panel.set_attribute(PanelAttribute::EnableLogYAxis, "true");
        panel.add_series();
        panel.push_value(0, 1.0, 2.0);
        panel.push_value(0, 3.0, 4.5);

        let doc = panel.to_document();
        assert_eq!(doc["plot_name"], json!("demo"));
        assert_eq!(doc["enable_log_y_axis"], json!("true"));
        assert_eq!(doc["graph"], json!("xy"));
        assert_eq!(doc["plot_panel_index"], json!(3));
        assert_eq!(doc["plot_filename"], json!("3_demo.json"));
        assert_eq!(doc["trace_count"], json!(1));
        assert_eq!(doc["x_axis_type"], json!("linear"));
        assert_eq!(doc["plot_values"], json!([[0, 1, 2], [0, 3, 4.5]]));
    }

    #[test]
    fn replot_overwrites_in_place_then_appends() {
        let mut panel = xy_panel();
        panel.push_value(0, 1.0, 10.0);
        panel.push_value(1, 1.0, 99.0);
        panel.push_value(0, 2.0, 20.0);

        panel.replot_series(0);
        panel.push_value(0, 1.0, 11.0);
        panel.push_value(0, 2.0, 21.0);
        panel.push_value(0, 3.0, 31.0);

        let series0: Vec<(f64, f64)> = panel
            .values()
            .iter()
            .filter(|value| value.series == 0)
            .map(|value| (value.x, value.y))
            .collect();
        assert_eq!(series0, vec![(1.0, 11.0), (2.0, 21.0), (3.0, 31.0)]);
        assert_eq!(panel.series_len(1), 1);
    }

    #[test]
    fn clear_series_leaves_other_series() {
        let mut panel = xy_panel();
        panel.push_value(0, 1.0, 1.0);
        panel.push_value(1, 1.0, 2.0);
        panel.push_value(0, 2.0, 3.0);
        assert_eq!(panel.clear_series(0), 2);
        assert_eq!(panel.values(), &[PlotValue { series: 1, x: 1.0, y: 2.0 }]);
    }

    #[test]
    fn implicit_x_depends_on_graph_type() {
        let mut bar = PanelState::new(0, GraphType::Bar);
        bar.push_implicit(0, 5.0, 1_000.0);
        bar.push_implicit(0, 6.0, 2_000.0);
        assert_eq!(bar.values()[1].x, 1.0);

        let mut time = PanelState::new(0, GraphType::Time);
        time.push_implicit(0, 5.0, 1_000.0);
        assert_eq!(time.values()[0].x, 1_000.0);
    }

    #[test]
    fn attribute_validation_by_kind() {
        assert!(PanelAttribute::LineWidth.validate("2.5").is_ok());
        assert!(PanelAttribute::LineWidth.validate("wide").is_err());
        assert!(PanelAttribute::EnableLines.validate("false").is_ok());
        assert!(PanelAttribute::EnableLines.validate("maybe").is_err());
        assert!(PanelAttribute::TickCount.validate("-1").is_err());
        assert!(PanelAttribute::PlotTitle.validate("anything at all").is_ok());
        assert_eq!(PanelAttribute::parse("tick_count"), Some(PanelAttribute::TickCount));
        assert_eq!(PanelAttribute::parse("colour"), None);
    }

    #[test]
    fn grid_capacity_boundary() {
        let mut global = GlobalConfig::default();
        assert!(global.set_grid(2, 4, 8).is_ok());
        let err = global.set_grid(3, 3, 8).expect_err("9 cells exceed 8 slots");
        assert!(matches!(err, NetplotError::Validation(_)));
        assert_eq!(global.grid, Some((2, 4)));
    }

    #[test]
    fn global_document_shape() {
        let mut global = GlobalConfig::default();
        assert_eq!(
            global.to_document(),
            json!({"paper_bgcolor": "white", "plot_bgcolor": "white"})
        );
        global.set_grid(1, 2, 4).expect("grid fits");
        global.set_frame_title("Bench");
        assert_eq!(
            global.to_document(),
            json!({
                "paper_bgcolor": "white",
                "plot_bgcolor": "white",
                "grid": [1, 2],
                "frame_title": "Bench",
            })
        );
    }
}
