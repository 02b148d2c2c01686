//! Image manifest contract.
//!
//! The registry fetcher is an external collaborator; the core owns the
//! manifest file and the rootfs-path contract and delegates the actual
//! fetch through [`ImagePuller`].

use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::store::{self, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image '{0}' not found in manifest, pull it first")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("image fetch helper '{helper}' failed for '{reference}': {message}")]
    Fetch {
        helper: String,
        reference: String,
        message: String,
    },
}

/// One manifest entry. Re-pulling a tag mutates its entry in place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    #[serde(rename = "repoTag")]
    pub repo_tag: String,
    #[serde(rename = "imageID")]
    pub image_id: String,
}

/// Read/write access to the image manifest and the extracted rootfs
/// directories beneath the images dir.
#[derive(Debug, Clone)]
pub struct ImageStore {
    images_dir: PathBuf,
}

impl ImageStore {
    pub fn new<P: Into<PathBuf>>(images_dir: P) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.images_dir.join("manifest.json")
    }

    /// All manifest entries; a missing manifest is an empty one.
    pub fn entries(&self) -> Result<Vec<ManifestEntry>, ImageError> {
        Ok(store::read_json_opt(&self.manifest_path())?.unwrap_or_default())
    }

    /// `repo:tag` strings for every known image.
    pub fn list(&self) -> Result<Vec<String>, ImageError> {
        Ok(self.entries()?.into_iter().map(|e| e.repo_tag).collect())
    }

    /// Resolves the overlay lowerdir for `name:tag`.
    pub fn rootfs_path(&self, name: &str, tag: &str) -> Result<PathBuf, ImageError> {
        let reference = format!("{name}:{tag}");
        let entries = self.entries()?;
        let entry = entries
            .iter()
            .find(|e| e.repo_tag == reference)
            .ok_or(ImageError::NotFound(reference))?;
        Ok(self.images_dir.join(&entry.image_id).join("rootfs"))
    }

    /// Records `repo_tag -> image_id`, updating the entry in place when
    /// the tag was pulled before.
    pub fn record(&self, repo_tag: &str, image_id: &str) -> Result<(), ImageError> {
        let mut entries = self.entries()?;
        match entries.iter_mut().find(|e| e.repo_tag == repo_tag) {
            Some(entry) => entry.image_id = image_id.to_string(),
            None => entries.push(ManifestEntry {
                repo_tag: repo_tag.to_string(),
                image_id: image_id.to_string(),
            }),
        }
        store::write_json_atomic(&self.manifest_path(), &entries)?;
        Ok(())
    }
}

/// The fetch side of the image contract.
pub trait ImagePuller: Send + Sync {
    /// Fetches `reference` and lays it out under the images dir, leaving
    /// the manifest updated.
    fn pull(&self, reference: &str) -> Result<(), ImageError>;
}

/// Delegates the fetch to an external helper binary.
///
/// The helper is invoked as `<helper> <reference> <images-dir>` and must
/// extract the image rootfs under `<images-dir>/<imageID>/rootfs/`,
/// printing the resulting image id on stdout. The manifest entry is
/// recorded here afterwards.
pub struct HelperPuller {
    helper: String,
    store: ImageStore,
}

impl HelperPuller {
    pub fn new(helper: &str, store: ImageStore) -> Self {
        Self {
            helper: helper.to_string(),
            store,
        }
    }
}

impl ImagePuller for HelperPuller {
    fn pull(&self, reference: &str) -> Result<(), ImageError> {
        tracing::info!(reference, helper = %self.helper, "pulling image");
        let output = Command::new(&self.helper)
            .arg(reference)
            .arg(&self.store.images_dir)
            .output()
            .map_err(|err| ImageError::Fetch {
                helper: self.helper.clone(),
                reference: reference.to_string(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(ImageError::Fetch {
                helper: self.helper.clone(),
                reference: reference.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let image_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if image_id.is_empty() {
            return Err(ImageError::Fetch {
                helper: self.helper.clone(),
                reference: reference.to_string(),
                message: "helper reported no image id".to_string(),
            });
        }

        let repo_tag = normalize_reference(reference);
        self.store.record(&repo_tag, &image_id)?;
        tracing::info!(%repo_tag, image_id, "image recorded in manifest");
        Ok(())
    }
}

fn normalize_reference(reference: &str) -> String {
    let (name, tag) = crate::container::parse_image_reference(reference);
    format!("{name}:{tag}")
}
