//! Archive preparation for multi-file submissions.
//!
//! Extracts a zip or tar (optionally gzip-compressed) archive into a fresh
//! [`StagingDir`], refusing any member that would land outside it, then
//! checks that the declared entry point exists.
//!
//! Links may only point downward: a symlink or hardlink target that is
//! absolute or has a `..` component rejects the whole archive. With every
//! link pointing below itself, no chain of links can leave the root.

use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::PrepError;
use crate::staging::StagingDir;
use crate::task::EntryPoint;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// File type bits of a unix mode, and the symlink type.
const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Extract `bytes` into a new staging directory and resolve `entry`.
///
/// On failure the staging directory is removed before returning.
pub(crate) fn prepare(bytes: &[u8], entry: &EntryPoint) -> Result<StagingDir, PrepError> {
    let mut staging = StagingDir::new().map_err(|source| PrepError::Staging { source })?;

    match extract(bytes, staging.path()).and_then(|count| {
        resolve_entry(staging.path(), entry)?;
        Ok(count)
    }) {
        Ok(count) => {
            info!(
                "Prepared archive ({} members) in {}",
                count,
                staging.path().display()
            );
            Ok(staging)
        }
        Err(e) => {
            staging.close();
            Err(e)
        }
    }
}

/// Unpack every member into `root`, returning the number extracted.
fn extract(bytes: &[u8], root: &Path) -> Result<usize, PrepError> {
    if bytes.starts_with(&ZIP_MAGIC) {
        extract_zip(bytes, root)
    } else {
        extract_tar(bytes, root)
    }
}

fn extract_tar(bytes: &[u8], root: &Path) -> Result<usize, PrepError> {
    let reader: Box<dyn Read + '_> = if bytes.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let mut count = 0;
    for member in archive.entries().map_err(bad_archive)? {
        let mut member = member.map_err(bad_archive)?;
        let raw_path = member.path().map_err(bad_archive)?.into_owned();

        let Some(relative) = contained_path(&raw_path) else {
            return Err(PrepError::unsafe_archive(raw_path.display().to_string()));
        };

        match member.header().entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
            EntryType::Symlink | EntryType::Link => {
                let target = link_target(&member, &raw_path)?;
                check_link(&raw_path, &target)?;
            }
            other => {
                debug!("Skipping archive member {} ({:?})", raw_path.display(), other);
                continue;
            }
        }

        if relative.as_os_str().is_empty() {
            continue;
        }

        // unpack_in re-checks containment against the real filesystem
        if !member.unpack_in(root).map_err(bad_archive)? {
            return Err(PrepError::unsafe_archive(raw_path.display().to_string()));
        }
        count += 1;
    }

    Ok(count)
}

fn extract_zip(bytes: &[u8], root: &Path) -> Result<usize, PrepError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(bad_zip)?;
    let canonical_root = fs::canonicalize(root).map_err(staging_error)?;

    let mut count = 0;
    for index in 0..archive.len() {
        let mut member = archive.by_index(index).map_err(bad_zip)?;
        let raw_path = PathBuf::from(member.name());

        let Some(relative) = contained_path(&raw_path) else {
            return Err(PrepError::unsafe_archive(raw_path.display().to_string()));
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = root.join(&relative);

        if member.is_dir() {
            fs::create_dir_all(&dest).map_err(staging_error)?;
            ensure_inside(&canonical_root, &dest, &raw_path)?;
            count += 1;
            continue;
        }

        let parent = dest.parent().unwrap_or(root);
        fs::create_dir_all(parent).map_err(staging_error)?;
        ensure_inside(&canonical_root, parent, &raw_path)?;
        remove_existing(&dest)?;

        let is_symlink = member
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK);
        if is_symlink {
            let mut target = String::new();
            member.read_to_string(&mut target).map_err(bad_archive)?;
            let target = PathBuf::from(target);
            check_link(&raw_path, &target)?;
            symlink(&target, &dest).map_err(staging_error)?;
        } else {
            let mut file = fs::File::create(&dest).map_err(staging_error)?;
            io::copy(&mut member, &mut file).map_err(bad_archive)?;
        }
        count += 1;
    }

    Ok(count)
}

/// Lexically normalize `path`, returning `None` if it is absolute or climbs
/// above its starting point.
fn contained_path(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}

/// Link targets must be relative and never step up a level.
fn check_link(raw_path: &Path, target: &Path) -> Result<(), PrepError> {
    let downward = target
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if downward {
        Ok(())
    } else {
        Err(PrepError::unsafe_archive(format!(
            "{} -> {}",
            raw_path.display(),
            target.display()
        )))
    }
}

fn link_target<R: Read>(
    member: &tar::Entry<'_, R>,
    raw_path: &Path,
) -> Result<PathBuf, PrepError> {
    member
        .link_name()
        .map_err(bad_archive)?
        .map(|target| target.into_owned())
        .ok_or_else(|| {
            PrepError::unsafe_archive(format!("{} (link without target)", raw_path.display()))
        })
}

/// Fail unless `path` really resolves below `canonical_root`.
fn ensure_inside(canonical_root: &Path, path: &Path, raw_path: &Path) -> Result<(), PrepError> {
    let resolved = fs::canonicalize(path).map_err(staging_error)?;
    if resolved.starts_with(canonical_root) {
        Ok(())
    } else {
        Err(PrepError::unsafe_archive(raw_path.display().to_string()))
    }
}

/// Clear a previous member at `dest` so a new file never writes through a link.
fn remove_existing(dest: &Path) -> Result<(), PrepError> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(dest).map_err(staging_error),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn symlink(target: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks in zip archives need a unix host",
    ))
}

/// The entry must be a regular file that really lives inside `root`.
fn resolve_entry(root: &Path, entry: &EntryPoint) -> Result<(), PrepError> {
    let not_found = || PrepError::entry_point_not_found(entry.to_string());

    let canonical_root = fs::canonicalize(root).map_err(staging_error)?;
    let resolved = fs::canonicalize(root.join(entry.as_path())).map_err(|_| not_found())?;
    if !resolved.starts_with(&canonical_root) {
        return Err(PrepError::unsafe_archive(entry.to_string()));
    }
    match fs::metadata(&resolved) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(not_found()),
    }
}

fn bad_archive(source: io::Error) -> PrepError {
    PrepError::BadArchive { source }
}

fn bad_zip(err: zip::result::ZipError) -> PrepError {
    bad_archive(io::Error::other(err))
}

fn staging_error(source: io::Error) -> PrepError {
    PrepError::Staging { source }
}
