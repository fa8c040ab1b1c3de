//! Output formatting for pushwire-cli (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human readable lines and tables (default)
    #[default]
    Table,
    /// One JSON object per line
    Json,
    /// CSV format
    Csv,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print data in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Csv => {
                print_csv(data);
            }
        }
    }

    /// Print key-value pairs (for info command)
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
                );
            }
            OutputFormat::Csv => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
                println!("{}", keys.join(","));
                let values: Vec<String> = pairs.iter().map(|(_, v)| escape_csv(v)).collect();
                println!("{}", values.join(","));
            }
        }
    }

    /// Print one live update as soon as it arrives
    pub fn print_update(&self, update: &UpdateLine) {
        match self.format {
            OutputFormat::Table => {
                let fields: Vec<String> = update
                    .fields
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value.as_deref().unwrap_or("-")))
                    .collect();
                println!(
                    "[{}] {}: {}",
                    update.timestamp.dimmed(),
                    update.item.bold(),
                    fields.join(" ")
                );
            }
            OutputFormat::Json => {
                if let Ok(json) = serde_json::to_string(update) {
                    println!("{}", json);
                }
            }
            OutputFormat::Csv => {
                let values: Vec<String> = [update.timestamp.clone(), update.item.clone()]
                    .into_iter()
                    .chain(
                        update
                            .fields
                            .iter()
                            .map(|(_, v)| v.clone().unwrap_or_default()),
                    )
                    .map(|v| escape_csv(&v))
                    .collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Print data as CSV
fn print_csv<T: Serialize>(data: &[T]) {
    let Some(first) = data.first() else {
        return;
    };

    // Get field names from the first item
    if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(first) {
        let headers: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
        println!("{}", headers.join(","));

        for item in data {
            if let Ok(serde_json::Value::Object(row)) = serde_json::to_value(item) {
                let values: Vec<String> = headers
                    .iter()
                    .map(|h| {
                        row.get(*h)
                            .map(|v| match v {
                                serde_json::Value::String(s) => escape_csv(s),
                                other => escape_csv(&other.to_string()),
                            })
                            .unwrap_or_default()
                    })
                    .collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Escape a value for CSV output
pub fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Display types
// =============================================================================

/// One row update with unchanged fields already filled in
#[derive(Debug, Serialize)]
pub struct UpdateLine {
    pub timestamp: String,
    pub item: String,
    /// `(field name, current value)`; `None` when the server sent no value
    pub fields: Vec<(String, Option<String>)>,
}

/// Per-item summary printed when streaming stops
#[derive(Debug, Tabled, Serialize)]
pub struct ItemSummary {
    #[tabled(rename = "Item")]
    pub item: String,
    #[tabled(rename = "Updates")]
    pub updates: u64,
    #[tabled(rename = "Last values")]
    pub last: String,
}

/// Decoded protocol line for the decode command
#[derive(Debug, Tabled, Serialize)]
pub struct DecodedRow {
    #[tabled(rename = "Line")]
    pub line: String,
    #[tabled(rename = "Kind")]
    pub kind: String,
    #[tabled(rename = "Detail")]
    pub detail: String,
}
