//! Runtime image management.
//!
//! Tasks never pull images on demand: a missing image is a launch failure.
//! These commands fetch and inspect the per-language images ahead of time.

use anyhow::{Context, Result};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::service::ImageSummary;
use bollard::Docker;
use clap::Subcommand;
use colored::Colorize;
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::config::Config;
use crate::sandbox::DockerSandbox;
use crate::task::Language;

/// Image management actions.
#[derive(Subcommand, Debug)]
pub enum ImageAction {
    /// Pull the runtime images from their registry
    Pull {
        /// Only pull the image for this language
        #[arg(short, long)]
        language: Option<String>,

        /// Pull even if the image exists locally
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Show whether each runtime image is available locally
    Status,
}

/// Run image management command.
pub async fn run(config: &Config, action: ImageAction) -> Result<()> {
    let sandbox = DockerSandbox::connect()?;
    sandbox.ping().await?;
    let docker = sandbox.client();

    match action {
        ImageAction::Pull { language, force } => {
            for image in selected_images(config, language.as_deref())? {
                pull_image(docker, &image, force).await?;
            }
        }
        ImageAction::Status => {
            let images = list_images(docker).await?;
            for language in [Language::Python, Language::Node] {
                let image = &config.languages.runtime(language).image;
                println!("{}", format_image_status(language, image, &images));
            }
        }
    }

    Ok(())
}

/// Images to pull: one language's, or every configured one.
fn selected_images(config: &Config, language: Option<&str>) -> Result<Vec<String>> {
    let languages = match language {
        Some(name) => vec![name.parse::<Language>()?],
        None => vec![Language::Python, Language::Node],
    };
    Ok(languages
        .into_iter()
        .map(|l| config.languages.runtime(l).image.clone())
        .collect())
}

async fn list_images(docker: &Docker) -> Result<Vec<ImageSummary>> {
    docker
        .list_images(Some(ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        }))
        .await
        .context("Failed to list images")
}

/// Local images whose tags match `image`.
fn matching_images<'a>(images: &'a [ImageSummary], image: &str) -> Vec<&'a ImageSummary> {
    let (name, tag) = parse_image_tag(image);
    images
        .iter()
        .filter(|img| {
            img.repo_tags.iter().any(|tag_str| {
                let (n, t) = parse_image_tag(tag_str);
                n == name && t == tag
            })
        })
        .collect()
}

/// Pull one image unless it is already present.
async fn pull_image(docker: &Docker, image: &str, force: bool) -> Result<()> {
    if !force && !matching_images(&list_images(docker).await?, image).is_empty() {
        println!("Image '{image}' already exists locally (use --force to pull anyway).");
        return Ok(());
    }

    info!("Pulling image {}...", image);

    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };
    let mut stream = docker.create_image(Some(options), None, None);

    let mut last_output = String::new();
    while let Some(chunk) = stream.next().await {
        let output = chunk.with_context(|| format!("Error pulling image {image}"))?;
        if let Some(error) = &output.error {
            anyhow::bail!("Docker pull error: {error}");
        }
        if let Some(status) = &output.status {
            let trimmed = status.trim();
            if !trimmed.is_empty() {
                println!("{trimmed}");
                last_output = trimmed.to_string();
            }
        }
    }

    if last_output.contains("Downloaded") || last_output.contains("Image is up to date") {
        info!("Image pulled successfully: {}", image);
    } else {
        warn!("Pull of {} completed, but success message not found.", image);
    }

    Ok(())
}

/// One status line per language.
pub(crate) fn format_image_status(
    language: Language,
    image: &str,
    images: &[ImageSummary],
) -> String {
    let matches = matching_images(images, image);
    let Some(found) = matches.first() else {
        return format!(
            "{} {:<6}  {}  {} (run {})",
            "✗".red(),
            language.to_string(),
            image.cyan(),
            "missing".red(),
            "codebox image pull".green()
        );
    };

    #[allow(clippy::cast_precision_loss)]
    let size_megabytes = found.size.unsigned_abs() as f64 / 1_048_576.0;
    format!(
        "{} {:<6}  {}  {} ({size_megabytes:.1} MB)",
        "✓".green(),
        language.to_string(),
        image.cyan(),
        "present".green()
    )
}

/// Split `name:tag`, defaulting the tag to `latest`. Registry ports are kept
/// in the name.
fn parse_image_tag(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(colon) if !image[colon + 1..].contains('/') => (&image[..colon], &image[colon + 1..]),
        _ => (image, "latest"),
    }
}
