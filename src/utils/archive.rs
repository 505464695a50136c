use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::errors::Result;

fn strip_components(path: &Path, depth: usize) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut skipped = 0usize;
    for component in path.components() {
        let Component::Normal(segment) = component else {
            continue;
        };
        if skipped < depth {
            skipped += 1;
            continue;
        }
        out.push(segment);
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Extracts a zip archive into `dest`, dropping the first `strip_depth` path
/// segments of every entry. Entries whose names would escape `dest` are skipped.
///
/// Returns the number of files written.
pub fn extract_zip(archive_path: &Path, dest: &Path, strip_depth: usize) -> Result<u32> {
    let archive_file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(archive_file)?;
    fs::create_dir_all(dest)?;

    let mut extracted = 0u32;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(entry_path) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!("skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let Some(relative_path) = strip_components(&entry_path, strip_depth) else {
            continue;
        };
        let target_path = dest.join(&relative_path);

        if entry.is_dir() {
            fs::create_dir_all(&target_path)?;
            continue;
        }
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&target_path)?;
        io::copy(&mut entry, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target_path, fs::Permissions::from_mode(mode))?;
        }
        extracted += 1;
    }

    Ok(extracted)
}

/// Depth to strip so that an archive with a single top-level folder
/// (`jdk-25+36-jre/bin/java`) lands directly in the destination.
pub fn single_root_depth(archive_path: &Path) -> Result<usize> {
    let archive_file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(archive_file)?;

    let mut root: Option<PathBuf> = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let Some(path) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let mut components = path.components().filter_map(|component| match component {
            Component::Normal(segment) => Some(PathBuf::from(segment)),
            _ => None,
        });
        let Some(first) = components.next() else {
            continue;
        };
        let nested = components.next().is_some();
        if !nested && !entry.is_dir() {
            return Ok(0);
        }
        match &root {
            Some(existing) if existing != &first => return Ok(0),
            Some(_) => {}
            None => root = Some(first),
        }
    }

    Ok(if root.is_some() { 1 } else { 0 })
}
