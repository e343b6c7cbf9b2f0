//! `codebox run`: execute one inline submission.

use anyhow::{Context, Result};
use clap::Args;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{connect_executor, print_result};
use crate::config::Config;
use crate::outcome::Termination;
use crate::task::{validate_inline, RawRequest};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source file to run (reads stdin when omitted or "-")
    pub file: Option<PathBuf>,

    /// Code to run, instead of a file
    #[arg(short, long, conflicts_with = "file")]
    pub code: Option<String>,

    /// Language: python or node (default: from file extension, else python)
    #[arg(short, long)]
    pub language: Option<String>,

    /// Submission id reported back with the result
    #[arg(long)]
    pub id: Option<String>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run one submission. Returns whether it succeeded.
pub async fn run(config: &Config, args: RunArgs) -> Result<bool> {
    let code = read_source(args.code, args.file.as_deref())?;
    let language = args
        .language
        .or_else(|| args.file.as_deref().and_then(language_for).map(str::to_string));

    let mut request = RawRequest {
        language,
        code: Some(code),
        ..Default::default()
    };
    if let Some(id) = args.id {
        request = request.with_id(id);
    }

    let task = validate_inline(request, &config.task_limits()?)?;
    let executor = connect_executor(config).await?;
    let result = executor.run(task).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    Ok(result.status == Termination::Success)
}

fn read_source(code: Option<String>, file: Option<&Path>) -> Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source file: {}", path.display())),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read source from stdin")?;
            Ok(code)
        }
    }
}

/// Language implied by a source file's extension.
pub(crate) fn language_for(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "py" => Some("python"),
        "js" | "mjs" | "cjs" => Some("node"),
        _ => None,
    }
}
