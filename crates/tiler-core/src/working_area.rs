//! Per-job scratch directory

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Scratch space for one job at `<temp_root>/<image_id>/`.
///
/// The downloaded source goes under `source/` and the encoder writes to
/// `tiles/`, so neither can shadow the other whatever the names. Call [`WorkingArea::release`] once
/// the job is over; if the value is dropped without that (panic, early
/// return) the directory is still removed on a best-effort basis.
#[derive(Debug)]
pub struct WorkingArea {
    root: PathBuf,
    released: bool,
}

impl WorkingArea {
    /// Create a fresh working area, discarding leftovers from an earlier run
    pub fn create(temp_root: &Path, image_id: &str) -> io::Result<Self> {
        let root = temp_root.join(image_id);
        if root.exists() {
            debug!("Removing stale working area {}", root.display());
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            released: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for the downloaded source
    pub fn source_path(&self, file_name: &str) -> PathBuf {
        self.root.join("source").join(file_name)
    }

    /// Directory the encoder writes into; its contents land under `{image_id}/`
    pub fn tiles_dir(&self) -> PathBuf {
        self.root.join("tiles")
    }

    /// Remove the working area. A directory that is already gone is fine.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        remove_tree(&self.root)
    }
}

impl Drop for WorkingArea {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_tree(&self.root) {
            warn!(
                "Failed to clean up working area {}: {}",
                self.root.display(),
                err
            );
        }
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed working area {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let temp = TempDir::new().unwrap();
        let area = WorkingArea::create(temp.path(), "slide-001").unwrap();

        assert_eq!(area.root(), temp.path().join("slide-001"));
        assert_eq!(
            area.source_path("a.tiff"),
            temp.path().join("slide-001/source/a.tiff")
        );
        assert_eq!(area.tiles_dir(), temp.path().join("slide-001/tiles"));
        assert!(area.root().is_dir());
    }

    #[test]
    fn test_source_named_like_image_id_stays_apart() {
        let temp = TempDir::new().unwrap();
        let area = WorkingArea::create(temp.path(), "a.png").unwrap();

        let source = area.source_path("a.png");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"data").unwrap();
        fs::create_dir_all(area.tiles_dir().join("image_files/0")).unwrap();

        assert!(source.is_file());
        assert!(area.tiles_dir().is_dir());
        area.release().unwrap();
    }

    #[test]
    fn test_release_removes_everything() {
        let temp = TempDir::new().unwrap();
        let area = WorkingArea::create(temp.path(), "slide-001").unwrap();
        fs::create_dir_all(area.tiles_dir().join("image_files/0")).unwrap();
        fs::create_dir_all(area.root().join("source")).unwrap();
        fs::write(area.source_path("a.tiff"), b"data").unwrap();

        let root = area.root().to_path_buf();
        area.release().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let temp = TempDir::new().unwrap();
        let root = {
            let area = WorkingArea::create(temp.path(), "slide-002").unwrap();
            fs::write(area.root().join("a.tiff"), b"data").unwrap();
            area.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn test_create_discards_stale_content() {
        let temp = TempDir::new().unwrap();
        let stale = temp.path().join("slide-003/old.jpg");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old").unwrap();

        let area = WorkingArea::create(temp.path(), "slide-003").unwrap();
        assert!(!stale.exists());
        area.release().unwrap();
    }

    #[test]
    fn test_release_after_external_removal() {
        let temp = TempDir::new().unwrap();
        let area = WorkingArea::create(temp.path(), "slide-004").unwrap();
        fs::remove_dir_all(area.root()).unwrap();
        assert!(area.release().is_ok());
    }
}
