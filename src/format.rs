//! Output formatting for tabular results.
//!
//! Renders a [`ResultSet`] as an ASCII table, a Markdown table or JSON. Used
//! by the CLI for query, describe and explain output.

use crate::config::OutputFormat;
use crate::error::{DbError, DbResult};
use crate::models::ResultSet;
use serde_json::Value as JsonValue;
use std::time::Duration;
use unicode_width::UnicodeWidthStr;

pub fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(_) | JsonValue::Object(_) => value.to_string(),
    }
}

/// Render a result in the requested format.
pub fn render(rs: &ResultSet, format: OutputFormat, elapsed: Duration) -> DbResult<String> {
    match format {
        OutputFormat::Table => Ok(format_as_table(rs, elapsed)),
        OutputFormat::Markdown => Ok(format_as_markdown(rs)),
        OutputFormat::Json => serde_json::to_string_pretty(rs)
            .map_err(|e| DbError::internal(format!("Failed to serialize result: {e}"))),
    }
}

/// MySQL-CLI style table. Statements without columns print a write summary.
pub fn format_as_table(rs: &ResultSet, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let columns = rs.columns();
    if columns.is_empty() {
        return match rs.last_insert_id() {
            Some(id) => format!(
                "Query OK, {} affected (last insert id {id}) ({secs:.2} sec)\n",
                plural(rs.rows_affected(), "row")
            ),
            None => format!(
                "Query OK, {} affected ({secs:.2} sec)\n",
                plural(rs.rows_affected(), "row")
            ),
        };
    }
    if rs.is_empty() {
        return format!("Empty set ({secs:.2} sec)\n");
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
    for row in rs.rows() {
        for (i, col) in columns.iter().enumerate() {
            if let Some(value) = row.get(col) {
                widths[i] = widths[i].max(format_value(value).width());
            }
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    let mut output = separator.clone();
    output.push_str(
        &(columns
            .iter()
            .zip(&widths)
            .map(|(col, w)| format!("| {} ", pad(col, *w, Align::Center)))
            .collect::<String>()
            + "|\n"),
    );
    output.push_str(&separator);

    for row in rs.rows() {
        let line: String = columns
            .iter()
            .zip(&widths)
            .map(|(col, w)| {
                let value = row.get(col).unwrap_or(&JsonValue::Null);
                let align = if value.is_number() { Align::Right } else { Align::Left };
                format!("| {} ", pad(&format_value(value), *w, align))
            })
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&separator);
    output.push_str(&format!("{} in set ({secs:.2} sec)\n", plural(rs.len() as u64, "row")));
    output
}

pub fn format_as_markdown(rs: &ResultSet) -> String {
    let columns = rs.columns();
    if columns.is_empty() {
        return format!("*{} affected*", plural(rs.rows_affected(), "row"));
    }

    let mut output = columns.iter().map(|c| format!("| {c} ")).collect::<String>() + "|\n";
    output.push_str(&(columns.iter().map(|_| "|---").collect::<String>() + "|\n"));

    for row in rs.rows() {
        let line: String = columns
            .iter()
            .map(|col| {
                let value = row.get(col).unwrap_or(&JsonValue::Null);
                // Pipes would split the cell
                format!("| {} ", format_value(value).replace('|', "\\|"))
            })
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&format!("\n*{}*", plural(rs.len() as u64, "row")));
    output
}

fn plural(count: u64, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

#[derive(Clone, Copy)]
enum Align {
    Left,
    Right,
    Center,
}

/// Pad by display width; `format!` width counts chars, not terminal columns.
fn pad(text: &str, width: usize, align: Align) -> String {
    let fill = width.saturating_sub(text.width());
    match align {
        Align::Left => format!("{text}{}", " ".repeat(fill)),
        Align::Right => format!("{}{text}", " ".repeat(fill)),
        Align::Center => {
            let left = fill / 2;
            format!("{}{text}{}", " ".repeat(left), " ".repeat(fill - left))
        }
    }
}
