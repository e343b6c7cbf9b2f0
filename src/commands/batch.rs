//! `codebox batch`: run many submissions concurrently.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{connect_executor, format_status};
use crate::config::Config;
use crate::outcome::{ExecutionResult, Termination};
use crate::scheduler::{run_batch, validate_batch};
use crate::task::RawRequest;

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// JSON file with the submissions (reads stdin when omitted or "-")
    pub file: Option<PathBuf>,

    /// Print results as a JSON array
    #[arg(long)]
    pub json: bool,
}

/// Accepted batch documents: `{"tasks": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Wrapped { tasks: Vec<RawRequest> },
    Bare(Vec<RawRequest>),
}

impl BatchFile {
    fn into_requests(self) -> Vec<RawRequest> {
        match self {
            Self::Wrapped { tasks } | Self::Bare(tasks) => tasks,
        }
    }
}

/// Run a batch. Returns whether every task succeeded.
pub async fn run(config: &Config, args: BatchArgs) -> Result<bool> {
    let content = read_input(args.file.as_deref())?;
    let requests = parse_batch(&content)?;

    let tasks = validate_batch(requests, &config.task_limits()?, config.pool.max_batch)?;
    let executor = connect_executor(config).await?;
    let results = run_batch(&executor, tasks).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print!("{}", format_batch(&results));
    }

    Ok(results.iter().all(|r| r.status == Termination::Success))
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch file: {}", path.display())),
        _ => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .context("Failed to read batch from stdin")?;
            Ok(content)
        }
    }
}

fn parse_batch(content: &str) -> Result<Vec<RawRequest>> {
    let file: BatchFile = serde_json::from_str(content).context("Failed to parse batch JSON")?;
    Ok(file.into_requests())
}

/// Human-readable batch report: each result in order, then a tally.
pub(crate) fn format_batch(results: &[ExecutionResult]) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format_status(result));
        out.push('\n');
        for line in result.output.lines() {
            out.push_str(&format!("    {line}\n"));
        }
        for line in result.error.lines() {
            out.push_str(&format!("    {}\n", line.red()));
        }
    }

    let succeeded = results
        .iter()
        .filter(|r| r.status == Termination::Success)
        .count();
    out.push_str(&format!(
        "\n{} of {} succeeded\n",
        succeeded.to_string().cyan(),
        results.len().to_string().cyan()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_batch() {
        let requests = parse_batch(
            r#"{"tasks": [{"code": "print(1)"}, {"language": "node", "code": "console.log(2)", "id": "b"}]}"#,
        )
        .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].language, None);
        assert_eq!(requests[1].language.as_deref(), Some("node"));
        assert_eq!(requests[1].id.as_deref(), Some("b"));
    }

    #[test]
    fn test_parse_bare_array_with_lang_alias() {
        let requests = parse_batch(r#"[{"lang": "python", "code": "print(1)"}]"#).unwrap();
        assert_eq!(requests[0].language.as_deref(), Some("python"));
    }

    #[test]
    fn test_parse_rejects_non_batch() {
        assert!(parse_batch(r#"{"code": "print(1)"}"#).is_err());
        assert!(parse_batch("not json").is_err());
    }

    #[test]
    fn test_format_batch_tally() {
        colored::control::set_override(false);
        let results = vec![
            ExecutionResult::completed("a", "1\n".to_string(), String::new(), 0),
            ExecutionResult::completed("b", String::new(), "boom\n".to_string(), 1),
        ];
        let out = format_batch(&results);
        assert!(out.contains("✓ a: success (exit 0)\n    1\n"));
        assert!(out.contains("✗ b: runtime error (exit 1)\n    boom\n"));
        assert!(out.ends_with("1 of 2 succeeded\n"));
    }
}
