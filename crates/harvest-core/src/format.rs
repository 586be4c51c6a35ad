//! Output formats for delivered value lists
//!
//! The transport and tail plugins hand every sample to a sink; these
//! helpers render a sample the way the downstream expects it: the
//! plain-text `PUTVAL` command, one Graphite line per value, or a JSON
//! object.

use serde::Serialize;

use crate::errors::{ProtocolError, Result};
use crate::types::{Value, ValueList};

// ----------------------------------------------------------------------------
// Format Selection
// ----------------------------------------------------------------------------

/// Rendering applied to records before they reach the downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `PUTVAL` line of the plain-text protocol
    Command,
    /// One JSON object per value list
    Json,
    /// One `path value timestamp` line per value
    Graphite,
}

impl std::str::FromStr for Format {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "command" => Ok(Format::Command),
            "json" => Ok(Format::Json),
            "graphite" => Ok(Format::Graphite),
            other => Err(ProtocolError::malformed(format!(
                "unknown format {other:?}"
            ))),
        }
    }
}

/// Render one value list in the chosen format
pub fn render(format: Format, vl: &ValueList) -> String {
    match format {
        Format::Command => render_command(vl),
        Format::Json => render_json(vl),
        Format::Graphite => render_graphite(vl),
    }
}

// ----------------------------------------------------------------------------
// PUTVAL Command
// ----------------------------------------------------------------------------

fn command_value(value: &Value) -> String {
    match *value {
        Value::Counter(v) | Value::Derive(v) | Value::Absolute(v) => v.to_string(),
        Value::Gauge(v) if v.is_nan() => "U".to_owned(),
        Value::Gauge(v) => v.to_string(),
    }
}

fn render_command(vl: &ValueList) -> String {
    let mut out = format!(
        "PUTVAL \"{}\" interval={:.3} {:.3}",
        vl.identifier(),
        vl.interval.as_secs_f64(),
        vl.time.as_secs_f64()
    );
    for value in &vl.values {
        out.push(':');
        out.push_str(&command_value(value));
    }
    out
}

// ----------------------------------------------------------------------------
// Graphite
// ----------------------------------------------------------------------------

/// Graphite rejects dots and whitespace inside a path component
fn graphite_escape(s: &str) -> String {
    s.chars()
        .map(|c| if c == '.' || c.is_whitespace() || c == '"' { '_' } else { c })
        .collect()
}

fn graphite_path(vl: &ValueList) -> String {
    let mut path = String::with_capacity(64);
    path.push_str(&graphite_escape(&vl.host));
    path.push('.');
    path.push_str(&graphite_escape(&vl.plugin));
    if !vl.plugin_instance.is_empty() {
        path.push('-');
        path.push_str(&graphite_escape(&vl.plugin_instance));
    }
    path.push('.');
    path.push_str(&graphite_escape(&vl.type_name));
    if !vl.type_instance.is_empty() {
        path.push('-');
        path.push_str(&graphite_escape(&vl.type_instance));
    }
    path
}

fn render_graphite(vl: &ValueList) -> String {
    let path = graphite_path(vl);
    let time = vl.time.as_secs();
    let mut out = String::new();
    for (i, value) in vl.values.iter().enumerate() {
        out.push_str(&path);
        if vl.values.len() > 1 {
            out.push_str(&format!(".{i}"));
        }
        out.push(' ');
        out.push_str(&command_value(value));
        out.push(' ');
        out.push_str(&time.to_string());
        out.push('\n');
    }
    out
}

// ----------------------------------------------------------------------------
// JSON
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct JsonRecord<'a> {
    values: Vec<serde_json::Value>,
    dstypes: Vec<crate::types::ValueKind>,
    time: f64,
    interval: f64,
    host: &'a str,
    plugin: &'a str,
    plugin_instance: &'a str,
    #[serde(rename = "type")]
    type_name: &'a str,
    type_instance: &'a str,
}

fn render_json(vl: &ValueList) -> String {
    let values = vl
        .values
        .iter()
        .map(|value| match *value {
            Value::Counter(v) | Value::Derive(v) | Value::Absolute(v) => v.into(),
            // JSON has no NaN; follow the "null means undefined" rule.
            Value::Gauge(v) if v.is_nan() => serde_json::Value::Null,
            Value::Gauge(v) => v.into(),
        })
        .collect();

    let record = JsonRecord {
        values,
        dstypes: vl.values.iter().map(|v| v.kind()).collect(),
        time: vl.time.as_secs_f64(),
        interval: vl.interval.as_secs_f64(),
        host: &vl.host,
        plugin: &vl.plugin,
        plugin_instance: &vl.plugin_instance,
        type_name: &vl.type_name,
        type_instance: &vl.type_instance,
    };
    serde_json::to_string(&record).expect("value list serializes without error")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
