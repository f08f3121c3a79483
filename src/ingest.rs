//! Recorded source ingestion
//!
//! Loads measurement files exported by the recording rig. Three layouts are
//! accepted and detected from the content:
//!
//! - a JSON array of measurements
//! - a JSON array of `{ "data": [...] }` per-user wrappers
//! - newline-delimited JSON, one measurement per line

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::IngestError;
use crate::types::{Measurement, UserData};

/// Load every measurement from a source file
pub fn load_source(path: &Path) -> Result<Vec<Measurement>, IngestError> {
    let text = fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let measurements = parse_source(path, &text)?;
    debug!(path = %path.display(), measurements = measurements.len(), "source loaded");
    Ok(measurements)
}

/// Parse source text; `path` is only used in diagnostics
pub fn parse_source(path: &Path, text: &str) -> Result<Vec<Measurement>, IngestError> {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();

    if trimmed.starts_with('[') {
        return parse_array(path, trimmed);
    }
    if trimmed.starts_with('{') {
        // A lone object parses as one document; JSON lines do not
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return parse_document(path, value);
        }
    }
    parse_lines(path, text)
}

fn json_error(path: &Path, source: serde_json::Error) -> IngestError {
    IngestError::Json {
        path: path.to_path_buf(),
        source,
    }
}

fn parse_array(path: &Path, text: &str) -> Result<Vec<Measurement>, IngestError> {
    let items: Vec<Value> = serde_json::from_str(text).map_err(|e| json_error(path, e))?;

    let wrapped = items
        .first()
        .map(|first| first.get("data").is_some_and(Value::is_array))
        .unwrap_or(false);

    if wrapped {
        let users: Vec<UserData> =
            serde_json::from_value(Value::Array(items)).map_err(|e| json_error(path, e))?;
        Ok(users.into_iter().flat_map(|user| user.data).collect())
    } else {
        serde_json::from_value(Value::Array(items)).map_err(|e| json_error(path, e))
    }
}

/// A single object: either one measurement or one `{ "data": [...] }` wrapper
fn parse_document(path: &Path, value: Value) -> Result<Vec<Measurement>, IngestError> {
    if value.get("data").is_some_and(Value::is_array) {
        let user: UserData = serde_json::from_value(value).map_err(|e| json_error(path, e))?;
        return Ok(user.data);
    }
    if value.get("measureType").is_some() {
        let measurement: Measurement =
            serde_json::from_value(value).map_err(|e| json_error(path, e))?;
        return Ok(vec![measurement]);
    }
    Err(IngestError::UnsupportedShape(path.to_path_buf()))
}

fn parse_lines(path: &Path, text: &str) -> Result<Vec<Measurement>, IngestError> {
    let mut measurements = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let measurement = serde_json::from_str(line).map_err(|e| IngestError::Line {
            path: path.to_path_buf(),
            line: index + 1,
            message: e.to_string(),
        })?;
        measurements.push(measurement);
    }
    Ok(measurements)
}

/// Rewrite a JSON-lines file as a pretty-printed JSON array.
///
/// Lines are copied as raw JSON values, so fields outside the measurement
/// model survive. Returns the number of records written.
pub fn convert_jsonl_to_array(input: &Path, output: &Path) -> Result<usize, IngestError> {
    let text = fs::read_to_string(input).map_err(|source| IngestError::Io {
        path: input.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|e| IngestError::Line {
            path: input.to_path_buf(),
            line: index + 1,
            message: e.to_string(),
        })?;
        records.push(value);
    }

    let json = serde_json::to_string_pretty(&records).map_err(|e| json_error(output, e))?;
    fs::write(output, json).map_err(|source| IngestError::Io {
        path: output.to_path_buf(),
        source,
    })?;
    debug!(input = %input.display(), output = %output.display(), records = records.len(), "converted");
    Ok(records.len())
}
