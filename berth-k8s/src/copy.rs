//! Copying local directories into a running pod
//!
//! The source is packed into a uniquely named tar archive under the runner's
//! temp directory, then streamed into `tar xf -` over exec stdin.

use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use berth_core::error::{HookError, Result};

use crate::client::{ClusterClient, ExecIo};

/// Record size `tar` reads its input in; a shorter final record leaves the
/// remote `tar` waiting for input that never comes
const TAR_RECORD_SIZE: u64 = 10240;

/// Packs `source` into a tar archive at `archive`
///
/// Directories are archived by content, a single file under its own name.
/// Symlinks are stored as links.
fn write_archive(source: &Path, archive: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(archive)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    if source.is_dir() {
        builder.append_dir_all(".", source)?;
    } else {
        let name = source
            .file_name()
            .ok_or_else(|| std::io::Error::other("source has no file name"))?;
        builder.append_path_with_name(source, name)?;
    }
    let file = builder.into_inner()?;
    let len = file.metadata()?.len();
    file.set_len(len.div_ceil(TAR_RECORD_SIZE) * TAR_RECORD_SIZE)?;
    file.sync_all()
}

/// Where the archive has to be unpacked for `source` to land on `target`
fn extract_dir(source: &Path, target: &str) -> String {
    if source.is_dir() {
        return target.to_string();
    }
    Path::new(target)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

/// Copies `source` to `target` inside `container` of `pod`
///
/// The target directory must already exist.
pub async fn copy_to_pod(
    client: &dyn ClusterClient,
    temp_dir: &Path,
    pod: &str,
    container: &str,
    source: &Path,
    target: &str,
) -> Result<()> {
    if !source.exists() {
        return Err(HookError::InvalidInput(format!(
            "cannot copy {} into pod {}: source does not exist",
            source.display(),
            pod
        )));
    }

    let archive = temp_dir.join(format!("{}.tar", Uuid::new_v4()));
    debug!("Archiving {} to {}", source.display(), archive.display());

    let (src, dst) = (source.to_path_buf(), archive.clone());
    let packed = tokio::task::spawn_blocking(move || write_archive(&src, &dst))
        .await
        .map_err(std::io::Error::other)
        .and_then(|written| written)
        .map_err(|e| {
            HookError::backend(
                format!("archive {}", source.display()),
                format!("failed to create archive: {}", e),
            )
        });

    let result = match packed {
        Ok(()) => unpack(client, pod, container, &archive, &extract_dir(source, target)).await,
        Err(e) => Err(e),
    };
    remove_archive(&archive).await;
    result
}

async fn unpack(
    client: &dyn ClusterClient,
    pod: &str,
    container: &str,
    archive: &Path,
    target: &str,
) -> Result<()> {
    let command = vec![
        "tar".to_string(),
        "xf".to_string(),
        "-".to_string(),
        "-C".to_string(),
        target.to_string(),
    ];
    let io = ExecIo {
        stdin: Some(archive.to_path_buf()),
        capture: true,
    };
    let output = client.exec(pod, container, command, io).await?;

    if !output.success || !output.stderr.trim().is_empty() {
        return Err(HookError::backend(
            format!("copy into {}:{}", pod, target),
            output.describe(),
        ));
    }
    debug!("Copied archive into {}:{}", pod, target);
    Ok(())
}

async fn remove_archive(archive: &Path) {
    match tokio::fs::remove_file(archive).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove archive {}: {}", archive.display(), e),
    }
}
