//! Deployment descriptor access.
//!
//! The compose file is owned by the container control plane; cuo only rewrites
//! the per-service `image` field. The document is kept as a raw YAML value so
//! keys it does not understand survive a rewrite. Replacement is atomic: the
//! new document is written to a sibling temp path and renamed over the
//! original, so a crash mid-write never leaves a corrupt descriptor.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::error::CuoError;

/// A parsed deployment descriptor bound to its file path.
#[derive(Debug, Clone)]
pub struct Descriptor {
    path: PathBuf,
    doc: Value,
}

impl Descriptor {
    /// Read and parse the descriptor at `path`.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read descriptor: {}", path.display()))?;
        let doc: Value = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse descriptor: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    /// The image reference currently recorded for `service`.
    pub fn image_for(&self, service: &str) -> Result<String, CuoError> {
        self.service_entry(service)?
            .get("image")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| CuoError::ServiceNotFound(service.to_string()))
    }

    /// Rewrite the image reference for `service`.
    pub fn set_image(&mut self, service: &str, image: &str) -> Result<(), CuoError> {
        let entry = self
            .doc
            .get_mut("services")
            .and_then(|s| s.get_mut(service))
            .ok_or_else(|| CuoError::ServiceNotFound(service.to_string()))?;
        entry
            .as_mapping_mut()
            .ok_or_else(|| CuoError::ServiceNotFound(service.to_string()))?
            .insert(Value::from("image"), Value::from(image));
        Ok(())
    }

    /// Atomically replace the descriptor on disk.
    ///
    /// A transient I/O failure is retried once before surfacing. Returns the
    /// number of retries consumed.
    pub fn write_atomic(&self) -> Result<u32, CuoError> {
        match self.write_once() {
            Ok(()) => Ok(0),
            Err(first) => {
                warn!(
                    descriptor = %self.path.display(),
                    error = %first,
                    "Descriptor write failed, retrying once"
                );
                self.write_once().map(|()| 1)
            }
        }
    }

    fn write_once(&self) -> Result<(), CuoError> {
        let serialized = serde_yaml::to_string(&self.doc)
            .map_err(|e| CuoError::DescriptorWrite(e.to_string()))?;

        let tmp = temp_path(&self.path);
        fs::write(&tmp, serialized).map_err(|e| CuoError::DescriptorWrite(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CuoError::DescriptorWrite(e.to_string())
        })?;

        debug!(descriptor = %self.path.display(), "Descriptor replaced");
        Ok(())
    }

    fn service_entry(&self, service: &str) -> Result<&Value, CuoError> {
        self.doc
            .get("services")
            .and_then(|s| s.get(service))
            .ok_or_else(|| CuoError::ServiceNotFound(service.to_string()))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "descriptor".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Advisory lock on one service of a deployment descriptor.
///
/// Held by the executor across a whole upgrade step, so at most one session
/// drives a given service at a time; sessions for other services on the same
/// descriptor are unaffected. A sibling `.<descriptor>.<service>.lock` file
/// created exclusively, recording the holder pid, removed on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    pub fn acquire(descriptor_path: &Path, service: &str) -> Result<Self, CuoError> {
        let path = sibling_path(descriptor_path, &format!("{service}.lock"));
        create_lock_file(&path, service)?;
        Ok(Self { path })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        remove_lock_file(&self.path);
    }
}

/// Advisory write lock on a deployment descriptor.
///
/// Held only across one read-modify-write of the descriptor, so concurrent
/// sessions' rewrites of the shared file never interleave. A sibling
/// `.<descriptor>.lock` file, same exclusive-create discipline as
/// [`SessionLock`].
#[derive(Debug)]
pub struct DescriptorLock {
    path: PathBuf,
}

impl DescriptorLock {
    pub fn acquire(descriptor_path: &Path, service: &str) -> Result<Self, CuoError> {
        let path = sibling_path(descriptor_path, "lock");
        create_lock_file(&path, service)?;
        Ok(Self { path })
    }
}

impl Drop for DescriptorLock {
    fn drop(&mut self) {
        remove_lock_file(&self.path);
    }
}

fn create_lock_file(path: &Path, service: &str) -> Result<(), CuoError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                CuoError::LockHeld {
                    service: service.to_string(),
                    path: path.display().to_string(),
                }
            } else {
                CuoError::DescriptorWrite(e.to_string())
            }
        })?;
    let _ = writeln!(file, "{}", std::process::id());
    debug!(lock = %path.display(), "Lock acquired");
    Ok(())
}

fn remove_lock_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(lock = %path.display(), error = %e, "Failed to remove lock file");
    }
}

fn sibling_path(descriptor_path: &Path, suffix: &str) -> PathBuf {
    let name = descriptor_path
        .file_name()
        .map_or_else(|| "descriptor".to_string(), |n| n.to_string_lossy().into_owned());
    descriptor_path.with_file_name(format!(".{name}.{suffix}"))
}
