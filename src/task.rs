//! Task descriptors and submission validation.
//!
//! A [`TaskDescriptor`] is the validated, immutable form of one submission.
//! [`validate`] is the only way to build one from caller input, and it runs
//! every cheap check before any sandbox resource is allocated.

use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::ValidationError;

/// Supported runtimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) enum Language {
    /// CPython interpreter.
    #[default]
    Python,
    /// Node.js runtime.
    Node,
}

impl Language {
    /// File name inline code is written to inside the staging directory.
    pub fn inline_file_name(self) -> &'static str {
        match self {
            Self::Python => "user_code.py",
            Self::Node => "user_code.js",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::Node => write!(f, "node"),
        }
    }
}

impl std::str::FromStr for Language {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "node" | "javascript" | "js" => Ok(Self::Node),
            _ => Err(ValidationError::unsupported_language(s)),
        }
    }
}

/// Resource limits applied to one task.
///
/// Network access has no field: sandboxes never get a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    /// Maximum source length in characters.
    pub max_code_chars: usize,
    /// Wall-clock timeout.
    pub timeout: Duration,
    /// Memory ceiling in bytes.
    pub memory_bytes: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_code_chars: 5000,
            timeout: Duration::from_secs(10),
            memory_bytes: 128 * 1024 * 1024,
        }
    }
}

/// A relative path inside a project that cannot escape its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryPoint(PathBuf);

impl EntryPoint {
    /// Parse an entry point, rejecting absolute paths and traversal.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::invalid_entry_point(raw, "must not be empty"));
        }
        if trimmed.contains('\0') {
            return Err(ValidationError::invalid_entry_point(raw, "contains a NUL byte"));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(ValidationError::invalid_entry_point(
                        raw,
                        "escapes the project root",
                    ));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ValidationError::invalid_entry_point(raw, "must be relative"));
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(ValidationError::invalid_entry_point(raw, "does not name a file"));
        }

        Ok(Self(normalized))
    }

    /// The normalized relative path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Path as seen from inside the sandbox, using `/` separators.
    pub fn to_container_path(&self) -> String {
        self.0
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_container_path())
    }
}

/// Where a task's source comes from. Exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskSource {
    /// Code text submitted directly.
    Inline(String),
    /// Entry point inside a prepared project directory.
    Project { entry: EntryPoint },
}

/// Submission as received from the request layer, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "lang")]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub entry: Option<String>,
}

impl RawRequest {
    /// Inline submission.
    pub fn inline(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            code: Some(code.into()),
            ..Default::default()
        }
    }

    /// Archive submission with the given entry point.
    pub fn archive(language: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            entry: Some(entry.into()),
            ..Default::default()
        }
    }

    /// Set a caller-assigned submission id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A validated submission. Immutable once built.
#[derive(Debug, Clone)]
pub(crate) struct TaskDescriptor {
    id: String,
    language: Language,
    source: TaskSource,
    limits: Limits,
}

impl TaskDescriptor {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn source(&self) -> &TaskSource {
        &self.source
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Text recorded in history for this task.
    pub fn summary(&self) -> String {
        match &self.source {
            TaskSource::Inline(code) => code.clone(),
            TaskSource::Project { entry } => format!("[archive run] {entry}"),
        }
    }
}

/// Validate a raw submission into a [`TaskDescriptor`].
///
/// Checks run cheapest first: language, source shape, length, entry point.
pub(crate) fn validate(
    raw: RawRequest,
    limits: &Limits,
) -> Result<TaskDescriptor, ValidationError> {
    let language = match raw.language.as_deref() {
        Some(lang) if !lang.trim().is_empty() => lang.parse()?,
        _ => Language::default(),
    };

    let source = match (raw.code, raw.entry) {
        (Some(_), Some(_)) => return Err(ValidationError::ConflictingSource),
        (None, None) => return Err(ValidationError::MissingSource),
        (Some(code), None) => {
            if code.trim().is_empty() {
                return Err(ValidationError::EmptyCode);
            }
            let length = code.chars().count();
            if length > limits.max_code_chars {
                return Err(ValidationError::code_too_long(length, limits.max_code_chars));
            }
            TaskSource::Inline(code)
        }
        (None, Some(entry)) => TaskSource::Project {
            entry: EntryPoint::parse(&entry)?,
        },
    };

    let id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_task_id);

    Ok(TaskDescriptor {
        id,
        language,
        source,
        limits: *limits,
    })
}

/// Validate a submission that must run from inline code, such as a batch
/// member. An entry point without an archive is an input error.
pub(crate) fn validate_inline(
    raw: RawRequest,
    limits: &Limits,
) -> Result<TaskDescriptor, ValidationError> {
    let task = validate(raw, limits)?;
    if let TaskSource::Project { entry } = task.source() {
        return Err(ValidationError::InlineCodeRequired {
            entry: entry.to_string(),
        });
    }
    Ok(task)
}

/// Short random id for submissions that did not bring one.
fn new_task_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[..12].to_string()
}
