//! Artifact naming and relocation into the persistent output directory.
//!
//! Names combine a UTC timestamp, the process id, a process-wide counter and a
//! random suffix, so concurrent invocations (threads or processes) sharing one
//! output directory never collide.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info};

/// File name a snippet must write in its working directory to be captured.
pub const ARTIFACT_FILE_NAME: &str = "output.html";

const ARTIFACT_PREFIX: &str = "plot";
const ARTIFACT_EXTENSION: &str = "html";

static ARTIFACT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Build a fresh, collision-resistant artifact file name.
pub fn unique_artifact_name() -> String {
    let seq = ARTIFACT_SEQ.fetch_add(1, Ordering::Relaxed);
    build_artifact_name(
        &generate_timestamp(),
        std::process::id(),
        seq,
        &generate_short_id(),
    )
}

pub fn build_artifact_name(timestamp: &str, pid: u32, seq: u64, short_id: &str) -> String {
    format!("{ARTIFACT_PREFIX}_{timestamp}_{pid}_{seq}_{short_id}.{ARTIFACT_EXTENSION}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// Return the artifact inside `workspace` if the snippet produced one.
///
/// Only a regular file counts; a symlink named like the artifact is ignored so
/// a snippet cannot smuggle an outside path into the output directory.
pub fn find_artifact(workspace: &Path) -> Option<PathBuf> {
    let candidate = workspace.join(ARTIFACT_FILE_NAME);
    match fs::symlink_metadata(&candidate) {
        Ok(meta) if meta.file_type().is_file() => Some(candidate),
        Ok(_) => {
            debug!(path = %candidate.display(), "ignoring non-regular artifact entry");
            None
        }
        Err(_) => None,
    }
}

/// Move `source` into `output_dir` under a fresh unique name and return the final path.
///
/// Uses `rename` when possible and falls back to copy + remove when the
/// workspace and the output directory live on different filesystems.
pub fn relocate_artifact(source: &Path, output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("create output dir {}", output_dir.display()))?;
    let dest = output_dir.join(unique_artifact_name());

    match fs::rename(source, &dest) {
        Ok(()) => {}
        Err(rename_err) => {
            debug!(err = %rename_err, "rename failed, copying artifact instead");
            copy_into_new_file(source, &dest)
                .with_context(|| format!("copy artifact to {}", dest.display()))?;
            fs::remove_file(source)
                .with_context(|| format!("remove workspace artifact {}", source.display()))?;
        }
    }

    info!(path = %dest.display(), "artifact relocated");
    Ok(dest)
}

fn copy_into_new_file(source: &Path, dest: &Path) -> io::Result<u64> {
    let mut reader = File::open(source)?;
    let mut writer = OpenOptions::new().write(true).create_new(true).open(dest)?;
    let copied = io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(copied)
}
