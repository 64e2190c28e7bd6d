//! Line protocol: framing and the per-connection command state machine.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::debug;

use crate::error::NetplotError;
use crate::panel::{
    parse_flag, GraphType, PanelAttribute, PanelState, SharedGlobalConfig, SharedPanel,
};
use crate::persistence::{Document, PersistenceHandle, GLOBAL_CONFIG_FILE};

pub const PROTOCOL_VERSION: &str = "2.5";
pub const ACK: &str = "OK";
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[must_use]
pub fn greeting() -> String {
    format!("netplot_version={PROTOCOL_VERSION}\n")
}

/// Reassembles newline-terminated lines from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every line completed by `bytes`, without its terminator.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, NetplotError> {
        let mut lines = Vec::new();
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(decode_line(&std::mem::take(&mut self.pending)));
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        if self.pending.len() > MAX_LINE_BYTES {
            self.pending.clear();
            return Err(NetplotError::protocol(format!(
                "line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        Ok(lines)
    }

    /// Drains an unterminated trailing line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(decode_line(&std::mem::take(&mut self.pending)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches(['\r', '\n']).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// State changed (and the owning document was scheduled).
    Applied,
    /// Blank line or comment.
    Skipped,
    /// Acknowledgement mode changed; always acknowledged.
    StatusToggled,
    /// Unrecognized input dropped without closing the session.
    Ignored { reason: SmolStr },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command<'a> {
    SetGraph(&'a str),
    SetGrid(&'a str),
    SetFrameTitle(&'a str),
    SetAttribute { name: &'a str, value: &'a str },
    Init,
    AddPlot,
    Clear(u32),
    Replot(u32),
    EnableStatus(bool),
    Data(&'a str),
}

fn parse_command(line: &str) -> Result<Command<'_>, NetplotError> {
    if let Some(assignment) = line.strip_prefix("set ") {
        let (name, value) = assignment
            .split_once('=')
            .map(|(name, value)| (name.trim(), value.trim()))
            .filter(|(name, value)| !name.is_empty() && !value.is_empty())
            .ok_or_else(|| NetplotError::protocol(format!("malformed set command '{line}'")))?;
        return Ok(match name {
            "graph" => Command::SetGraph(value),
            "grid" => Command::SetGrid(value),
            "frame_title" => Command::SetFrameTitle(value),
            _ => Command::SetAttribute { name, value },
        });
    }
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next().unwrap_or_default();
    let argument = tokens.next();
    let command = match keyword {
        "init" => Command::Init,
        "add_plot" => Command::AddPlot,
        "clear" => Command::Clear(parse_series_argument(keyword, argument)?),
        "replot" => Command::Replot(parse_series_argument(keyword, argument)?),
        "enable_status" => {
            let flag = argument.ok_or_else(|| {
                NetplotError::protocol("enable_status requires a flag argument")
            })?;
            let enabled = parse_flag(flag).ok_or_else(|| {
                NetplotError::protocol(format!("enable_status: '{flag}' is not a flag"))
            })?;
            Command::EnableStatus(enabled)
        }
        _ => return Ok(Command::Data(line)),
    };
    if matches!(command, Command::Init | Command::AddPlot) && argument.is_some() {
        return Ok(Command::Data(line));
    }
    Ok(command)
}

fn parse_series_argument(keyword: &str, argument: Option<&str>) -> Result<u32, NetplotError> {
    argument
        .and_then(parse_series_index)
        .ok_or_else(|| NetplotError::protocol(format!("{keyword} requires a series index")))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_series_index(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Ok(index) = text.parse::<u32>() {
        return Some(index);
    }
    let value = text.parse::<f64>().ok()?;
    (value.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&value)).then(|| value as u32)
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataLine {
    /// `idx:x:y` groups.
    Points(Vec<(u32, f64, f64)>),
    /// Timestamped point; `x_ms` is UTC epoch milliseconds.
    Timestamped { series: u32, x_ms: f64, y: f64 },
    /// Values without x; the n-th value goes to series n.
    Bare(Vec<f64>),
}

fn value_tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|token| !token.is_empty())
}

/// Classifies a data line; `None` means unrecognized input.
#[must_use]
pub fn parse_data_line(line: &str) -> Option<DataLine> {
    parse_points(line)
        .or_else(|| parse_timestamped(line))
        .or_else(|| parse_bare(line))
}

fn parse_points(line: &str) -> Option<DataLine> {
    if !line.contains(':') || line.contains(';') {
        return None;
    }
    let points = value_tokens(line)
        .map(|token| {
            let mut parts = token.split(':');
            let series = parse_series_index(parts.next()?)?;
            let x = parse_number(parts.next()?)?;
            let y = parse_number(parts.next()?)?;
            parts.next().is_none().then_some((series, x, y))
        })
        .collect::<Option<Vec<_>>>()?;
    (!points.is_empty()).then_some(DataLine::Points(points))
}

fn parse_timestamped(line: &str) -> Option<DataLine> {
    if !line.contains(';') {
        return None;
    }
    let fields: Vec<&str> = if line.contains(':') {
        // Client form: idx:Y;M;D;h;m;s;ms:y
        let mut parts = line.split(':');
        let series = parts.next()?;
        let date = parts.next()?;
        let y = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        std::iter::once(series)
            .chain(date.split(';'))
            .chain(std::iter::once(y))
            .collect()
    } else {
        line.split(';').collect()
    };
    if fields.len() != 9 {
        return None;
    }
    let series = parse_series_index(fields[0])?;
    let mut stamp = [0u32; 7];
    for (slot, field) in stamp.iter_mut().zip(&fields[1..8]) {
        *slot = field.trim().parse().ok()?;
    }
    let y = parse_number(fields[8])?;
    let [year, month, day, hour, minute, second, milli] = stamp;
    let x_ms = timestamp_millis(year, month, day, hour, minute, second, milli)?;
    Some(DataLine::Timestamped { series, x_ms, y })
}

#[allow(clippy::cast_precision_loss)]
fn timestamp_millis(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    milli: u32,
) -> Option<f64> {
    let date = chrono::NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)?;
    let stamp = date.and_hms_milli_opt(hour, minute, second, milli)?;
    Some(stamp.and_utc().timestamp_millis() as f64)
}

fn parse_bare(line: &str) -> Option<DataLine> {
    let values = value_tokens(line)
        .map(parse_number)
        .collect::<Option<Vec<_>>>()?;
    (!values.is_empty()).then_some(DataLine::Bare(values))
}

#[allow(clippy::cast_precision_loss)]
fn wall_clock_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Interprets one connection's lines against its panel and the shared frame
/// configuration.
#[derive(Debug)]
pub struct LineProcessor {
    slot_index: usize,
    max_panels: usize,
    panel: Option<SharedPanel>,
    global: SharedGlobalConfig,
    persistence: PersistenceHandle,
    acks_enabled: bool,
    now_ms: fn() -> f64,
}

impl LineProcessor {
    #[must_use]
    pub fn new(
        slot_index: usize,
        max_panels: usize,
        global: SharedGlobalConfig,
        persistence: PersistenceHandle,
    ) -> Self {
        Self {
            slot_index,
            max_panels,
            panel: None,
            global,
            persistence,
            acks_enabled: true,
            now_ms: wall_clock_ms,
        }
    }

    #[must_use]
    pub fn with_acks(mut self, enabled: bool) -> Self {
        self.acks_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, now_ms: fn() -> f64) -> Self {
        self.now_ms = now_ms;
        self
    }

    #[must_use]
    pub fn acks_enabled(&self) -> bool {
        self.acks_enabled
    }

    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    #[must_use]
    pub fn panel(&self) -> Option<&SharedPanel> {
        self.panel.as_ref()
    }

    pub fn process_line(&mut self, line: &str) -> Result<LineOutcome, NetplotError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('/') {
            return Ok(LineOutcome::Skipped);
        }
        debug!(slot = self.slot_index, "line: <{line}>");
        match parse_command(line)? {
            Command::SetGraph(value) => self.set_graph(value),
            Command::SetGrid(value) => self.set_grid(value),
            Command::SetFrameTitle(title) => {
                self.global.lock().set_frame_title(title);
                self.persist_global()?;
                Ok(LineOutcome::Applied)
            }
            Command::SetAttribute { name, value } => self.set_attribute(name, value),
            Command::Init => {
                let panel = self.require_panel("init a graph")?;
                panel.lock().initialize();
                self.persist_panel()?;
                Ok(LineOutcome::Applied)
            }
            Command::AddPlot => {
                let panel = self.require_panel("add a plot")?;
                let series = panel.lock().add_series();
                debug!(slot = self.slot_index, series, "added plot");
                self.persist_panel()?;
                Ok(LineOutcome::Applied)
            }
            Command::Clear(series) => {
                let panel = self.require_initialized(&format!("clear plot {series}"))?;
                let removed = panel.lock().clear_series(series);
                debug!(slot = self.slot_index, series, removed, "cleared plot");
                self.persist_panel()?;
                Ok(LineOutcome::Applied)
            }
            Command::Replot(series) => {
                let panel = self.require_initialized(&format!("replot {series}"))?;
                panel.lock().replot_series(series);
                self.persist_panel()?;
                Ok(LineOutcome::Applied)
            }
            Command::EnableStatus(enabled) => {
                self.acks_enabled = enabled;
                debug!(slot = self.slot_index, enabled, "status messages");
                Ok(LineOutcome::StatusToggled)
            }
            Command::Data(text) => self.add_values(text),
        }
    }

    fn set_graph(&mut self, value: &str) -> Result<LineOutcome, NetplotError> {
        let graph_type = GraphType::parse(value).ok_or_else(|| {
            NetplotError::validation(format!("{value} is an unknown graph type"))
        })?;
        if let Some(existing) = &self.panel {
            let (current, filename) = {
                let existing = existing.lock();
                (existing.graph_type(), existing.filename())
            };
            if current != graph_type {
                return Err(NetplotError::validation(format!(
                    "graph type already set to {} on this connection",
                    current.as_str()
                )));
            }
            // The replaced panel must not keep being written under its name.
            if let Some(filename) = filename {
                self.persistence.forget(filename)?;
            }
        }
        self.panel = Some(Arc::new(Mutex::new(PanelState::new(
            self.slot_index,
            graph_type,
        ))));
        Ok(LineOutcome::Applied)
    }

    fn set_grid(&mut self, value: &str) -> Result<LineOutcome, NetplotError> {
        let dims = value
            .split_once(',')
            .and_then(|(rows, columns)| {
                Some((rows.trim().parse::<u32>().ok()?, columns.trim().parse::<u32>().ok()?))
            })
            .ok_or_else(|| NetplotError::protocol(format!("{value} is an invalid grid dimension")))?;
        self.global
            .lock()
            .set_grid(dims.0, dims.1, self.max_panels)?;
        self.persist_global()?;
        Ok(LineOutcome::Applied)
    }

    fn set_attribute(&mut self, name: &str, value: &str) -> Result<LineOutcome, NetplotError> {
        let panel = self.panel.clone().ok_or_else(|| {
            NetplotError::protocol("Attempt to set an attribute before a plot type has been defined.")
        })?;
        let Some(attribute) = PanelAttribute::parse(name) else {
            return Ok(LineOutcome::Ignored {
                reason: format!("unknown attribute '{name}'").into(),
            });
        };
        attribute.validate(value)?;
        panel.lock().set_attribute(attribute, value);
        self.persist_panel()?;
        Ok(LineOutcome::Applied)
    }

    fn add_values(&mut self, text: &str) -> Result<LineOutcome, NetplotError> {
        let panel = self.require_initialized("add values")?;
        let Some(data) = parse_data_line(text) else {
            return Ok(LineOutcome::Ignored {
                reason: format!("unrecognized data line '{text}'").into(),
            });
        };
        {
            let mut panel = panel.lock();
            match data {
                DataLine::Points(points) => {
                    for (series, x, y) in points {
                        panel.push_value(series, x, y);
                    }
                }
                DataLine::Timestamped { series, x_ms, y } => panel.push_value(series, x_ms, y),
                DataLine::Bare(values) => {
                    let now_ms = (self.now_ms)();
                    for (series, y) in (0u32..).zip(values) {
                        panel.push_implicit(series, y, now_ms);
                    }
                }
            }
        }
        self.persist_panel()?;
        Ok(LineOutcome::Applied)
    }

    fn require_panel(&self, action: &str) -> Result<SharedPanel, NetplotError> {
        self.panel.clone().ok_or_else(|| {
            NetplotError::protocol(format!(
                "Attempt to {action} before setting a graph type."
            ))
        })
    }

    fn require_initialized(&self, action: &str) -> Result<SharedPanel, NetplotError> {
        let panel = self.require_panel(action)?;
        if !panel.lock().is_initialized() {
            return Err(NetplotError::protocol(format!(
                "Cannot {action} as the plot has not been initialised yet."
            )));
        }
        Ok(panel)
    }

    fn persist_panel(&self) -> Result<(), NetplotError> {
        let Some(panel) = &self.panel else {
            return Ok(());
        };
        let Some(filename) = panel.lock().filename() else {
            return Ok(());
        };
        self.persistence
            .enqueue(filename, Document::Panel(panel.clone()))
    }

    fn persist_global(&self) -> Result<(), NetplotError> {
        self.persistence
            .enqueue(GLOBAL_CONFIG_FILE, Document::Global(self.global.clone()))
    }
}
