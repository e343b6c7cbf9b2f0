//! `codebox history`: show recent runs.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use crate::config::Config;
use crate::history::{HistoryRecord, JsonlHistory};
use crate::outcome::Termination;

/// Characters of source shown per entry in the table view.
const PREVIEW_CHARS: usize = 60;

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of entries to show, newest first
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(config: &Config, args: &HistoryArgs) -> Result<()> {
    let Some(path) = config.history.resolved_path() else {
        println!("\n{} No history location available.", "ℹ".blue());
        return Ok(());
    };

    let history = JsonlHistory::new(path);
    let records = history.recent(args.limit)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!(
            "\n{} No runs recorded yet in {}.",
            "ℹ".blue(),
            history.path().display()
        );
        println!("  Run {} to execute some code.", "codebox run".green());
        return Ok(());
    }

    for record in &records {
        println!("{}", format_record(record));
    }
    Ok(())
}

/// One history line: time, language, status, then a source preview.
pub(crate) fn format_record(record: &HistoryRecord) -> String {
    let status = record.status.to_string();
    let status = if record.status == Termination::Success {
        status.green()
    } else {
        status.red()
    };
    format!(
        "{}  {}  {} (exit {})  {}",
        record
            .timestamp
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed(),
        format!("{:<6}", record.language).cyan(),
        status,
        record.exit_code,
        preview(&record.code)
    )
}

/// First line of the source, shortened for display.
fn preview(code: &str) -> String {
    let first = code.lines().next().unwrap_or_default().trim();
    let more = code.lines().nth(1).is_some();
    let mut out: String = first.chars().take(PREVIEW_CHARS).collect();
    if more || first.chars().count() > PREVIEW_CHARS {
        out.push_str(" …");
    }
    out
}
