use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes `contents` next to `path` and renames it into place.
/// Each call stages under its own temp name, so concurrent writers never collide.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = sibling_with_suffix(path, &format!("{}-{unique}.tmp", std::process::id()));
    if let Some(parent) = temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&temp_path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(temp_path, path).await?;
    Ok(())
}

/// `server.jar` + `bak` -> `server.jar.bak`; keeps the original extension.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let bytes = file.read(&mut buffer)?;
        if bytes == 0 {
            break;
        }
        hasher.update(&buffer[..bytes]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub bytes: u64,
}

/// Recursively copies `source` into `dest`, skipping `exclude` (and anything below it).
pub fn copy_dir(source: &Path, dest: &Path, exclude: Option<&Path>) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    copy_dir_inner(source, dest, exclude, &mut stats)?;
    Ok(stats)
}

fn copy_dir_inner(
    source: &Path,
    dest: &Path,
    exclude: Option<&Path>,
    stats: &mut CopyStats,
) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        if exclude.map(|skip| path == skip).unwrap_or(false) {
            continue;
        }
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_inner(&path, &target, exclude, stats)?;
        } else if file_type.is_file() {
            stats.bytes += fs::copy(&path, &target)?;
            stats.files += 1;
        }
    }
    Ok(())
}

pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(unix)]
pub fn mark_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
pub fn mark_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
