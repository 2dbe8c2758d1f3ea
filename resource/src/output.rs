//! Output formatting for the resource tool.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use resource_core::{EditReport, GcStats, Hash, KeyHash, Platform, Resolved, SkippedOperation};
use serde::Serialize;
use std::io::{self, Write};

/// Result codes surfaced to the shell.
pub mod result_code {
    pub const OK: i32 = 0;
    pub const INVALID_ARGUMENT: i32 = -1;
    pub const UNKNOWN_COMMAND: i32 = -2;
    pub const UNABLE_TO_OPEN_OUTPUT_FILE: i32 = -3;
}

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: i32` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    /// In text mode, writes the error chain directly.
    pub fn write_error(&self, error: &anyhow::Error, result_code: i32) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: i32,
    pub error: String,
}

/// Output for a lookup-only invocation.
#[derive(Debug, Serialize)]
pub struct LookupOutput {
    pub success: bool,
    pub result_code: i32,
    pub path: String,
    pub id: String,
    pub signature: String,
}

/// A resolved property value.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueData {
    Value { value: String },
    Blob { checksum: Hash, size: u64 },
    Missing,
}

impl ValueData {
    pub fn from_resolved(resolved: Option<Resolved<'_>>) -> Self {
        match resolved {
            Some(Resolved::Value(bytes)) => ValueData::Value {
                value: String::from_utf8_lossy(bytes).into_owned(),
            },
            Some(Resolved::Blob { checksum, size }) => ValueData::Blob { checksum, size },
            None => ValueData::Missing,
        }
    }
}

/// Answer to a `--get` query.
#[derive(Debug, Serialize)]
pub struct ValueInfo {
    pub key: String,
    pub key_hash: KeyHash,
    pub platform: Platform,
    #[serde(flatten)]
    pub data: ValueData,
}

/// Collapse and blob collection results.
#[derive(Debug, Serialize)]
pub struct CollapseInfo {
    pub statements_removed: usize,
}

/// Output for an editing session.
#[derive(Debug, Serialize)]
pub struct EditOutput {
    pub success: bool,
    pub result_code: i32,
    pub id: String,
    pub applied: usize,
    pub skipped: Vec<SkippedOperation>,
    pub statements: usize,
    pub values: Vec<ValueInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse: Option<CollapseInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clearblobs: Option<GcStats>,
    pub dry_run: bool,
    /// Encoding written, or None if nothing was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<String>,
}

impl EditOutput {
    pub fn new(id: String, report: &EditReport, dry_run: bool) -> Self {
        Self {
            success: report.skipped.is_empty(),
            result_code: result_code::OK,
            id,
            applied: report.applied,
            skipped: report.skipped.clone(),
            statements: 0,
            values: Vec::new(),
            collapse: None,
            clearblobs: None,
            dry_run,
            written: None,
        }
    }

    /// Human-readable rendering.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for skipped in &self.skipped {
            text.push_str(&format!(
                "Skipped operation {} ({}): {}\n",
                skipped.index, skipped.key, skipped.reason
            ));
        }
        for value in &self.values {
            match &value.data {
                ValueData::Value { value: v } => {
                    text.push_str(&format!("{} = {}\n", value.key, v));
                }
                ValueData::Blob { checksum, size } => {
                    text.push_str(&format!("{} = blob {} ({} bytes)\n", value.key, checksum, size));
                }
                ValueData::Missing => text.push_str(&format!("{} is not set\n", value.key)),
            }
        }
        if self.applied > 0 {
            text.push_str(&format!("Applied {} operations to {}\n", self.applied, self.id));
        }
        if let Some(collapse) = &self.collapse {
            text.push_str(&format!(
                "Collapsed history: {} statements removed, {} remain\n",
                collapse.statements_removed, self.statements
            ));
        }
        if let Some(stats) = &self.clearblobs {
            let verb = if self.dry_run { "Would delete" } else { "Deleted" };
            text.push_str(&format!(
                "{} {} blobs, {} bytes\n",
                verb, stats.blobs_deleted, stats.bytes_freed
            ));
        }
        if let Some(encoding) = &self.written {
            text.push_str(&format!("Wrote {} source {}\n", encoding, self.id));
        }
        text
    }
}
