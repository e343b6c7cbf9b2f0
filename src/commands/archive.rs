//! `codebox run-archive`: execute a multi-file project from a zip or tar archive.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

use super::run::language_for;
use super::{connect_executor, print_result};
use crate::config::Config;
use crate::outcome::Termination;
use crate::task::{validate, RawRequest};

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// Project archive (.zip, .tar or .tar.gz)
    pub archive: PathBuf,

    /// File inside the archive to run, relative to its root
    #[arg(short, long)]
    pub entry: String,

    /// Language: python or node (default: from entry extension, else python)
    #[arg(short, long)]
    pub language: Option<String>,

    /// Submission id reported back with the result
    #[arg(long)]
    pub id: Option<String>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run an archive submission. Returns whether it succeeded.
pub async fn run(config: &Config, args: ArchiveArgs) -> Result<bool> {
    let language = args
        .language
        .or_else(|| language_for(Path::new(&args.entry)).map(str::to_string));

    let mut request = RawRequest {
        language,
        entry: Some(args.entry),
        ..Default::default()
    };
    if let Some(id) = args.id {
        request = request.with_id(id);
    }

    let task = validate(request, &config.task_limits()?)?;

    let bytes = tokio::fs::read(&args.archive)
        .await
        .with_context(|| format!("Failed to read archive: {}", args.archive.display()))?;

    let executor = connect_executor(config).await?;
    let result = executor
        .run_archive(task, bytes, &archive_label(&args.archive))
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    Ok(result.status == Termination::Success)
}

/// File name shown in history for an archive run.
fn archive_label(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}
