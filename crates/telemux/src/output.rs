//! Output formatting: table, JSON, plain.
//!
//! Everything renders to a `String` first so the formatting is testable;
//! `print_output` does the actual write.

use std::io::{self, Write};

use serde_json::{Map, Value, json};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use telemux_core::{AttributeData, Snapshot, SubscriptionData};

use crate::cli::OutputFormat;

#[derive(Tabled)]
struct SampleRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct AttributeRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Updated")]
    updated: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Epoch milliseconds as RFC 3339 (UTC), or the raw number if out of range.
pub fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts).map_or_else(
        || ts.to_string(),
        |dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    )
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render an aggregated window.
pub fn render_snapshot(format: OutputFormat, snapshot: &Snapshot) -> String {
    let series = snapshot.iter().map(|(key, points)| {
        let samples = points.iter().map(|(ts, v)| (*ts, v.to_json()));
        (key.as_str(), samples.collect::<Vec<_>>())
    });
    render_series(format, series.collect())
}

/// Render raw `[ts, value]` samples per key (latest telemetry).
pub fn render_samples(format: OutputFormat, data: &SubscriptionData) -> String {
    let series = data
        .iter()
        .map(|(key, samples)| (key.as_str(), samples.clone()));
    render_series(format, series.collect())
}

fn render_series(format: OutputFormat, series: Vec<(&str, Vec<(i64, Value)>)>) -> String {
    match format {
        OutputFormat::Table => {
            let rows: Vec<SampleRow> = series
                .iter()
                .flat_map(|(key, samples)| {
                    samples.iter().map(move |(ts, v)| SampleRow {
                        key: (*key).to_owned(),
                        time: format_ts(*ts),
                        value: value_text(v),
                    })
                })
                .collect();
            render_table(&rows)
        }
        OutputFormat::Json | OutputFormat::JsonCompact => {
            let doc: Map<String, Value> = series
                .into_iter()
                .map(|(key, samples)| {
                    let points = samples.into_iter().map(|(ts, v)| json!([ts, v])).collect();
                    (key.to_owned(), Value::Array(points))
                })
                .collect();
            render_json(&Value::Object(doc), format == OutputFormat::JsonCompact)
        }
        OutputFormat::Plain => series
            .iter()
            .flat_map(|(key, samples)| {
                samples
                    .iter()
                    .map(move |(ts, v)| format!("{key}\t{ts}\t{}", value_text(v)))
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Render attribute values.
pub fn render_attributes(format: OutputFormat, attributes: &[AttributeData]) -> String {
    match format {
        OutputFormat::Table => {
            let rows: Vec<AttributeRow> = attributes
                .iter()
                .map(|a| AttributeRow {
                    key: a.key.clone(),
                    updated: format_ts(a.last_update_ts),
                    value: value_text(&a.value),
                })
                .collect();
            render_table(&rows)
        }
        OutputFormat::Json | OutputFormat::JsonCompact => render_json(
            &serde_json::to_value(attributes).unwrap_or_default(),
            format == OutputFormat::JsonCompact,
        ),
        OutputFormat::Plain => attributes
            .iter()
            .map(|a| format!("{}\t{}", a.key, value_text(&a.value)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Render an arbitrary JSON document (RPC responses, config).
pub fn render_value(format: OutputFormat, value: &Value) -> String {
    match format {
        OutputFormat::JsonCompact => render_json(value, true),
        OutputFormat::Plain => value_text(value),
        OutputFormat::Table | OutputFormat::Json => render_json(value, false),
    }
}

/// Tag each point series with a label, for side-by-side comparison output.
pub fn label_snapshot(label: &str, snapshot: &Snapshot) -> Snapshot {
    snapshot
        .iter()
        .map(|(key, points)| (format!("{label}:{key}"), points.clone()))
        .collect()
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Format-specific renderers ────────────────────────────────────────

fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

fn render_json(value: &Value, compact: bool) -> String {
    if compact {
        value.to_string()
    } else {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    }
}
