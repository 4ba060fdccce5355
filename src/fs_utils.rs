use std::path::Path;

use tracing::debug;

use crate::error::{io_at, Result};

/// Best-effort copy of archive-relative files from `root` into `dst`,
/// keeping their relative layout.
///
/// Files that no longer exist (or are unreadable) are skipped. Returns the
/// number of files copied.
pub async fn copy_resources_best_effort(
    root: &Path,
    dst: &Path,
    resources: &[String],
    purpose: &str,
) -> Result<usize> {
    let mut copied = 0;

    for relative in resources {
        let src_path = root.join(relative);
        let dst_path = dst.join(relative);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_at(parent))?;
        }

        match tokio::fs::copy(&src_path, &dst_path).await {
            Ok(_) => copied += 1,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(
                    path = %src_path.display(),
                    purpose = %purpose,
                    "Skipping missing or unreadable file during best-effort copy"
                );
            }
            Err(e) => return Err(io_at(&src_path)(e)),
        }
    }

    Ok(copied)
}
