//! Local seeding: publish files already on disk as an artifact.
//!
//! Steps, each aborting the pipeline on failure:
//!   1. the path must hold at least one non-empty file
//!   2. build the descriptor and write `<path>/torrent`
//!   3. derive the content hash from it
//!   4. copy (or link) the data root into `<data_dir>/<hash>`
//!   5. register with the swarm and search at size 0
//!
//! Nothing written by an earlier step is rolled back.
//!
//! The data root is `<path>/data` when that directory exists, else `<path>`.
//! Both the hash and the stored copy or link cover the data root only.

use std::fs;
use std::path::{Path, PathBuf};

use bitsflow_core::descriptor::{contains_data, Info, Manifest, DATA_DIR_NAME, MANIFEST_NAME};

use crate::error::{FsError, Result};
use crate::node::Node;

/// How seeded data reaches managed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedMode {
    #[default]
    Copy,
    Link,
}

/// Outcome of a successful seeding run.
#[derive(Debug, Clone)]
pub struct Seeded {
    pub hash: String,
    pub manifest: PathBuf,
    pub stored_at: PathBuf,
    /// The destination was already present and left untouched.
    pub already_present: bool,
}

impl Node {
    pub async fn seed_local(&self, path: impl Into<PathBuf>, mode: SeedMode) -> Result<Seeded> {
        let path = path.into();
        let data_dir = self.swarm.data_dir();
        let trackers = self.config.trackers.clone();

        let seeded = tokio::task::spawn_blocking(move || prepare(&path, &data_dir, &trackers, mode))
            .await
            .map_err(|e| FsError::Io(std::io::Error::other(e)))??;

        self.swarm.search(&seeded.hash, 0).await?;
        self.swarm.add_local_seed_file(&seeded.hash);

        tracing::info!(
            hash = %seeded.hash,
            mode = ?mode,
            stored_at = %seeded.stored_at.display(),
            already_present = seeded.already_present,
            "seeding local artifact"
        );
        Ok(seeded)
    }
}

/// Filesystem part of the pipeline: steps 1 to 4.
fn prepare(path: &Path, data_dir: &Path, trackers: &[String], mode: SeedMode) -> Result<Seeded> {
    let data_root = {
        let nested = path.join(DATA_DIR_NAME);
        if nested.is_dir() {
            nested
        } else {
            path.to_path_buf()
        }
    };

    if !contains_data(&data_root)? {
        return Err(FsError::NotFound(format!(
            "no non-empty file under {}",
            data_root.display()
        )));
    }

    let info = Info::build_from_path(&data_root)?;
    let manifest = Manifest::new(info, trackers);
    let manifest_path = path.join(MANIFEST_NAME);
    manifest.write_to(&manifest_path)?;
    let hash = manifest.content_hash().to_hex();

    fs::create_dir_all(data_dir)?;
    let dest = data_dir.join(&hash);
    let already_present = match materialize(&data_root, &dest, mode) {
        Ok(()) => false,
        Err(FsError::AlreadyExists(p)) => {
            tracing::debug!(path = %p.display(), "artifact already materialized");
            true
        }
        Err(e) => return Err(e),
    };

    Ok(Seeded {
        hash,
        manifest: manifest_path,
        stored_at: dest,
        already_present,
    })
}

fn materialize(src: &Path, dest: &Path, mode: SeedMode) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        return Err(FsError::AlreadyExists(dest.to_path_buf()));
    }
    match mode {
        SeedMode::Link => {
            let target = fs::canonicalize(src)?;
            match symlink(&target, dest) {
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(FsError::AlreadyExists(dest.to_path_buf()))
                }
                other => Ok(other?),
            }
        }
        SeedMode::Copy => {
            // Copy beside the destination, then rename into place.
            let file_name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let tmp = dest.with_file_name(format!(".tmp-{}-{}", file_name, std::process::id()));
            let _ = fs::remove_dir_all(&tmp);
            let _ = fs::remove_file(&tmp);

            let copied = if src.is_file() {
                fs::create_dir_all(&tmp).and_then(|_| {
                    let name = src.file_name().unwrap_or(src.as_os_str());
                    fs::copy(src, tmp.join(name)).map(|_| ())
                })
            } else {
                copy_tree(src, &tmp)
            };
            if let Err(e) = copied {
                let _ = fs::remove_dir_all(&tmp);
                return Err(e.into());
            }

            match fs::rename(&tmp, dest) {
                Ok(()) => Ok(()),
                Err(_) if dest.exists() => {
                    let _ = fs::remove_dir_all(&tmp);
                    Err(FsError::AlreadyExists(dest.to_path_buf()))
                }
                Err(e) => {
                    let _ = fs::remove_dir_all(&tmp);
                    Err(e.into())
                }
            }
        }
    }
}

/// Recursive copy. The top-level manifest stays behind.
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fn walk(root: &Path, src: &Path, dest: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if src == root && entry.file_name() == MANIFEST_NAME {
                continue;
            }
            let from = entry.path();
            let to = dest.join(entry.file_name());
            if fs::metadata(&from)?.is_dir() {
                walk(root, &from, &to)?;
            } else {
                fs::copy(&from, &to)?;
            }
        }
        Ok(())
    }
    walk(src, src, dest)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}
