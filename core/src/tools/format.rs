/// Display formatting for tool results and model replies
use serde_json::{Map, Value};
use std::collections::BTreeSet;

const CHAT_TEMPLATE_MARKERS: &[&str] = &["<|im_start|>", "<|im_end|>"];

/// Render a tool result for the conversation.
///
/// Arrays of records become an aligned table, strings are passed through,
/// anything else is pretty-printed JSON.
pub fn format_result(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) if items.is_empty() => String::new(),
        Value::Array(items) => match as_records(items) {
            Some(rows) => render_table(&rows),
            None => pretty(value),
        },
        Value::Null => String::new(),
        other => pretty(other),
    }
}

/// Provider output is text; text holding an array of records gets the table
/// treatment too.
pub fn format_provider_output(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
            if let Some(rows) = as_records(&items) {
                return render_table(&rows);
            }
        }
    }
    trimmed.to_string()
}

/// Strip chat-template markers some local models leak into replies
pub fn clean_model_output(text: &str) -> String {
    let mut cleaned = text.to_string();
    for marker in CHAT_TEMPLATE_MARKERS {
        cleaned = cleaned.replace(marker, "");
    }
    cleaned.trim().to_string()
}

fn as_records(items: &[Value]) -> Option<Vec<&Map<String, Value>>> {
    if items.is_empty() {
        return None;
    }
    items.iter().map(Value::as_object).collect()
}

fn render_table(rows: &[&Map<String, Value>]) -> String {
    let columns: Vec<&String> = rows
        .iter()
        .flat_map(|row| row.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .map(|col| {
            rows.iter()
                .filter_map(|row| row.get(col.as_str()))
                .map(|v| cell(v).chars().count())
                .fold(col.chars().count(), usize::max)
        })
        .collect();

    let mut lines = Vec::with_capacity(rows.len() + 2);

    lines.push(join_cells(
        columns.iter().map(|c| c.to_uppercase()),
        &widths,
    ));
    lines.push(join_cells(widths.iter().map(|w| "-".repeat(*w)), &widths));

    for row in rows {
        lines.push(join_cells(
            columns
                .iter()
                .map(|col| row.get(col.as_str()).map(cell).unwrap_or_default()),
            &widths,
        ));
    }

    lines.join("\n")
}

fn join_cells(cells: impl Iterator<Item = String>, widths: &[usize]) -> String {
    let mut line = String::new();
    for (text, width) in cells.zip(widths) {
        let pad = width.saturating_sub(text.chars().count());
        line.push_str(&text);
        line.push_str(&" ".repeat(pad + 2));
    }
    line.trim_end().to_string()
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
