use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest sanitized stem kept in a stored file name.
const MAX_STEM_LEN: usize = 64;

/// On-disk image storage.
///
/// Uploads live at `{uploads}/{name}`; the annotated copy of the same upload
/// lives at `{results}/{name}`, so one name identifies both files.
pub struct ImageStore {
    uploads: PathBuf,
    results: PathBuf,
}

impl ImageStore {
    pub async fn new(uploads: PathBuf, results: PathBuf) -> Result<Self> {
        fs::create_dir_all(&uploads).await?;
        fs::create_dir_all(&results).await?;
        info!(
            "Image storage: uploads in {}, results in {}",
            uploads.display(),
            results.display()
        );
        Ok(Self { uploads, results })
    }

    pub fn results_dir(&self) -> &Path {
        &self.results
    }

    pub fn upload_path(&self, name: &str) -> Result<PathBuf> {
        ensure_valid(name)?;
        Ok(self.uploads.join(name))
    }

    pub fn result_path(&self, name: &str) -> Result<PathBuf> {
        ensure_valid(name)?;
        Ok(self.results.join(name))
    }

    pub async fn save_upload(&self, name: &str, data: &[u8]) -> Result<()> {
        fs::write(self.upload_path(name)?, data).await?;
        Ok(())
    }

    pub async fn save_result(&self, name: &str, data: &[u8]) -> Result<()> {
        fs::write(self.result_path(name)?, data).await?;
        Ok(())
    }

    pub async fn upload_exists(&self, name: &str) -> bool {
        match self.upload_path(name) {
            Ok(path) => fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Remove whatever a failed analysis left behind.
    pub async fn discard(&self, name: &str) {
        if let Err(e) = self.delete_image(name).await {
            warn!("Failed to discard {}: {:#}", name, e);
        }
    }

    /// Delete both the upload and its annotated copy. Missing files are fine.
    /// Both removals are attempted; the first failure is returned.
    pub async fn delete_image(&self, name: &str) -> Result<()> {
        let upload = remove_if_present(&self.upload_path(name)?).await;
        let result = remove_if_present(&self.result_path(name)?).await;
        upload.and(result)?;
        info!("Deleted image files for {}", name);
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} already gone", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Stored names are single path components made of sanitized characters and
/// never start with a dot.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && sanitize_filename(name) == name
}

fn ensure_valid(name: &str) -> Result<()> {
    if !is_valid_name(name) {
        bail!("invalid stored file name: {:?}", name);
    }
    Ok(())
}

/// Server-side name for a new upload: `{uuid}_{stem}.{extension}`.
pub fn stored_name(original: Option<&str>, extension: &str) -> String {
    let stem = original
        .and_then(|n| Path::new(n).file_stem())
        .and_then(|s| s.to_str())
        .map(sanitize_filename)
        .map(|s| s.trim_matches('.').chars().take(MAX_STEM_LEN).collect::<String>())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "upload".to_string());

    format!("{}_{}.{}", Uuid::new_v4(), stem, extension)
}
