//! Deterministic renderings of a result set: markdown table, prompt data
//! sample, derived insights and the non-LLM fallback summary.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::{ExecutionResult, Row, SummaryResult};

const NUMERIC_EXCLUDED: &[&str] = &["id", "count"];
const CATEGORICAL_EXCLUDED: &[&str] = &["id", "description", "notes"];
const INSIGHT_MARKERS: &[&str] = &["shows", "indicates", "reveals", "suggests"];
const PROMPT_SAMPLE_ROWS: usize = 50;

/// Markdown table of `rows`, at most `row_limit` of them.
pub fn markdown_table(columns: &[String], rows: &[Row], row_limit: usize) -> String {
    if rows.is_empty() {
        return "No data available".to_string();
    }

    // Prefer the declared column order; fall back to the first row's keys.
    let headers: Vec<&str> = if columns.is_empty() {
        rows[0].keys().map(String::as_str).collect()
    } else {
        columns.iter().map(String::as_str).collect()
    };

    let mut lines = Vec::with_capacity(rows.len().min(row_limit) + 3);
    lines.push(format!("| {} |", headers.join(" | ")));
    lines.push(format!("|{}|", vec![" --- "; headers.len()].join("|")));

    for row in rows.iter().take(row_limit) {
        let cells: Vec<String> = headers
            .iter()
            .map(|header| markdown_cell(row.get(*header)))
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
    }

    if rows.len() > row_limit {
        lines.push(format!(
            "\n*Showing {row_limit} of {} total rows*",
            rows.len()
        ));
    }

    lines.join("\n")
}

fn markdown_cell(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::String(text)) => text.replace('|', "\\|").replace('\n', " "),
        Some(other) => other.to_string(),
    }
}

/// Row sample embedded in the summarization prompt.
pub fn data_sample(rows: &[Row]) -> String {
    if rows.is_empty() {
        return "No data returned from query".to_string();
    }

    let sample = &rows[..rows.len().min(PROMPT_SAMPLE_ROWS)];
    let mut parts = Vec::new();

    if sample.len() <= 10 {
        parts.push("Complete Dataset:".to_string());
        for (i, row) in sample.iter().enumerate() {
            parts.push(format!("Row {}: {}", i + 1, Value::Object(row.clone())));
        }
        return parts.join("\n");
    }

    parts.push("Sample Data (First 5 rows):".to_string());
    for (i, row) in sample.iter().take(5).enumerate() {
        parts.push(format!("Row {}: {}", i + 1, Value::Object(row.clone())));
    }
    if rows.len() > PROMPT_SAMPLE_ROWS {
        parts.push(format!(
            "\n... ({} more rows not shown)",
            rows.len() - PROMPT_SAMPLE_ROWS
        ));
    }
    parts.push("\nLast 3 rows from sample:".to_string());
    let tail_start = sample.len() - 3;
    for (offset, row) in sample[tail_start..].iter().enumerate() {
        parts.push(format!(
            "Row {}: {}",
            tail_start + offset + 1,
            Value::Object(row.clone())
        ));
    }

    parts.join("\n")
}

/// Insights derived from the rows and from the model's summary text.
pub fn key_insights(summary_text: &str, rows: &[Row], limit: usize) -> Vec<String> {
    let mut insights = Vec::new();

    if let Some(first) = rows.first() {
        insights.push(format!("Dataset contains {} records", rows.len()));
        insights.extend(numeric_insights(first, rows));
        insights.extend(categorical_insights(first, rows));
    }
    insights.extend(text_insights(summary_text));

    insights.truncate(limit);
    insights
}

fn numeric_insights(first: &Row, rows: &[Row]) -> Vec<String> {
    first
        .iter()
        .filter(|(name, value)| {
            value.is_number() && !NUMERIC_EXCLUDED.contains(&name.to_ascii_lowercase().as_str())
        })
        .take(3)
        .filter_map(|(name, _)| {
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|row| row.get(name).and_then(Value::as_f64))
                .collect();
            if values.is_empty() {
                return None;
            }
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Some(format!(
                "{name}: avg={avg:.2}, range={}-{}",
                format_number(min),
                format_number(max)
            ))
        })
        .collect()
}

fn categorical_insights(first: &Row, rows: &[Row]) -> Vec<String> {
    first
        .iter()
        .filter(|(name, value)| {
            value.is_string() && !CATEGORICAL_EXCLUDED.contains(&name.to_ascii_lowercase().as_str())
        })
        .take(2)
        .filter_map(|(name, _)| {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            let mut order: Vec<&str> = Vec::new();
            for value in rows
                .iter()
                .filter_map(|row| row.get(name).and_then(Value::as_str))
                .filter(|v| !v.is_empty())
            {
                let count = counts.entry(value).or_insert(0);
                if *count == 0 {
                    order.push(value);
                }
                *count += 1;
            }
            // Ties go to the value seen first.
            let most_common = order
                .iter()
                .copied()
                .reduce(|best, candidate| {
                    if counts[candidate] > counts[best] {
                        candidate
                    } else {
                        best
                    }
                })?;
            Some(format!(
                "{name}: {} unique values, most common: {most_common}",
                counts.len()
            ))
        })
        .collect()
}

fn text_insights(summary_text: &str) -> Vec<String> {
    summary_text
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            INSIGHT_MARKERS.iter().any(|marker| lower.contains(marker)) && line.len() < 150
        })
        .take(5)
        .map(String::from)
        .collect()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Plain-text summary built from execution metadata alone.
pub fn fallback_text(execution: &ExecutionResult) -> String {
    if !execution.success {
        return "Query execution failed - no data to summarize".to_string();
    }

    let mut parts = vec![
        "Query Results Summary:".to_string(),
        format!("• Total rows returned: {}", execution.row_count),
        format!("• Execution time: {:.2}ms", execution.execution_time_ms),
    ];
    if !execution.columns.is_empty() {
        parts.push(format!("• Columns: {}", execution.columns.join(", ")));
    }
    if !execution.rows.is_empty() {
        parts.push(format!(
            "• Sample data available for {} records",
            execution.rows.len()
        ));
    }
    parts.join("\n")
}

/// Summary used in place of a failed summarization call.
pub fn fallback_summary(execution: &ExecutionResult, markdown_row_limit: usize) -> SummaryResult {
    let text = fallback_text(execution);
    SummaryResult {
        success: true,
        html_summary: Some(format!(
            "<p><strong>Fallback Summary:</strong> {}</p>",
            text.replace('•', "<strong>•</strong>")
        )),
        summary: Some(text),
        markdown_data: Some(markdown_table(
            &execution.columns,
            &execution.rows,
            markdown_row_limit,
        )),
        key_insights: vec![
            "LLM summarization failed".to_string(),
            format!("Retrieved {} records", execution.row_count),
        ],
        error: None,
        data_points_analyzed: execution.row_count,
        summary_time_ms: 0.0,
        prompt_tokens: Some(0),
        completion_tokens: Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn execution(rows: Vec<Row>) -> ExecutionResult {
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        ExecutionResult {
            success: true,
            row_count: rows.len(),
            rows,
            columns,
            data_types: BTreeMap::new(),
            truncated: false,
            execution_time_ms: 4.5,
            error: None,
            query_executed: Some("SELECT 1".into()),
        }
    }

    #[test]
    fn markdown_table_escapes_and_limits() {
        let rows = vec![
            row(json!({"status": "a|b", "note": null})),
            row(json!({"status": "line\nbreak", "note": 3})),
            row(json!({"status": "x", "note": 1.5})),
        ];
        let columns = vec!["status".to_string(), "note".to_string()];
        let table = markdown_table(&columns, &rows, 2);

        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "| status | note |");
        assert_eq!(lines[1], "| --- | --- |");
        assert_eq!(lines[2], "| a\\|b | null |");
        assert_eq!(lines[3], "| line break | 3 |");
        assert!(table.ends_with("\n\n*Showing 2 of 3 total rows*"));
    }

    #[test]
    fn markdown_table_empty() {
        assert_eq!(markdown_table(&[], &[], 50), "No data available");
    }

    #[test]
    fn small_samples_are_complete() {
        let rows = vec![row(json!({"a": 1})), row(json!({"a": 2}))];
        let sample = data_sample(&rows);
        assert_eq!(sample, "Complete Dataset:\nRow 1: {\"a\":1}\nRow 2: {\"a\":2}");
    }

    #[test]
    fn large_samples_show_head_and_tail() {
        let rows: Vec<Row> = (1..=60).map(|i| row(json!({ "n": i }))).collect();
        let sample = data_sample(&rows);
        assert!(sample.starts_with("Sample Data (First 5 rows):\nRow 1: {\"n\":1}"));
        assert!(sample.contains("... (10 more rows not shown)"));
        assert!(sample.contains("Last 3 rows from sample:\nRow 48: {\"n\":48}"));
        assert!(sample.ends_with("Row 50: {\"n\":50}"));
    }

    #[test]
    fn insights_cover_numbers_categories_and_text() {
        let rows = vec![
            row(json!({"id": 1, "amount": 10, "status": "succeeded"})),
            row(json!({"id": 2, "amount": 30, "status": "failed"})),
            row(json!({"id": 3, "amount": 20, "status": "succeeded"})),
        ];
        let insights = key_insights(
            "<p>Volume shows steady growth.</p>\nNothing here\n",
            &rows,
            10,
        );
        assert_eq!(
            insights,
            vec![
                "Dataset contains 3 records".to_string(),
                "amount: avg=20.00, range=10-30".to_string(),
                "status: 2 unique values, most common: succeeded".to_string(),
                "<p>Volume shows steady growth.</p>".to_string(),
            ]
        );
    }

    #[test]
    fn insights_follow_column_order() {
        let rows = vec![
            row(json!({"zeta": 1, "yaw": 2, "xray": 3, "alpha": 4})),
            row(json!({"zeta": 3, "yaw": 4, "xray": 5, "alpha": 6})),
        ];
        let insights = key_insights("", &rows, 10);
        assert_eq!(
            insights,
            vec![
                "Dataset contains 2 records".to_string(),
                "zeta: avg=2.00, range=1-3".to_string(),
                "yaw: avg=3.00, range=2-4".to_string(),
                "xray: avg=4.00, range=3-5".to_string(),
            ]
        );
    }

    #[test]
    fn insights_respect_limit() {
        let rows = vec![row(json!({"a": 1, "b": 2, "c": 3, "d": "x", "e": "y"}))];
        assert_eq!(key_insights("", &rows, 2).len(), 2);
    }

    #[test]
    fn fallback_summary_uses_row_count() {
        let exec = execution(vec![row(json!({"status": "ok"})), row(json!({"status": "no"}))]);
        let summary = fallback_summary(&exec, 50);

        assert!(summary.success);
        assert_eq!(summary.data_points_analyzed, 2);
        assert_eq!(
            summary.summary.as_deref(),
            Some(
                "Query Results Summary:\n• Total rows returned: 2\n• Execution time: 4.50ms\n\
                 • Columns: status\n• Sample data available for 2 records"
            )
        );
        let html = summary.html_summary.unwrap();
        assert!(html.starts_with("<p><strong>Fallback Summary:</strong> Query Results Summary:"));
        assert!(html.contains("<strong>•</strong> Total rows returned: 2"));
        assert_eq!(
            summary.key_insights,
            vec!["LLM summarization failed", "Retrieved 2 records"]
        );
    }
}
