//! Decode command - show how protocol lines are interpreted

use std::io::BufRead;

use anyhow::{Context, Result};
use pushwire_client::protocol::decode_line;
use pushwire_client::{FieldValue, UpdateEvent};

use crate::output::{DecodedRow, OutputContext};

/// Decode lines given as arguments, or read them from stdin
pub fn decode(lines: &[String], ctx: &OutputContext) -> Result<()> {
    let lines = if lines.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to read stdin")?
    } else {
        lines.to_vec()
    };

    let rows: Vec<DecodedRow> = lines.iter().map(|line| describe(line)).collect();
    ctx.print(&rows);
    Ok(())
}

fn describe(line: &str) -> DecodedRow {
    let (kind, detail) = match decode_line(line) {
        Ok(UpdateEvent::Heartbeat) => ("heartbeat", String::new()),
        Ok(UpdateEvent::Row(row)) => {
            let fields: Vec<String> = row.fields.iter().map(field_label).collect();
            ("row", format!("item {}: {}", row.item, fields.join(" | ")))
        }
        Ok(UpdateEvent::ControlAck(detail)) => ("control-ack", detail.unwrap_or_default()),
        Ok(UpdateEvent::Error(error)) => ("error", error.to_string()),
        Ok(UpdateEvent::EndOfStream(cause)) => (
            "end",
            cause.map(|c| c.to_string()).unwrap_or_default(),
        ),
        Err(malformed) => ("malformed", malformed.reason.to_string()),
    };
    DecodedRow {
        line: line.to_string(),
        kind: kind.to_string(),
        detail,
    }
}

fn field_label(field: &FieldValue) -> String {
    match field {
        FieldValue::Value(v) => format!("{:?}", v),
        FieldValue::Unchanged => "<unchanged>".to_string(),
        FieldValue::Absent => "<absent>".to_string(),
    }
}
