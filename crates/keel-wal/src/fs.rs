use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::{PageId, WalConfig};
use crate::error::{WalError, WalResult};

/// Represents the canonical on-disk layout for a WAL instance.
///
/// ```text
/// <root>/
///   metadata          fixed-size voter-state record, replaced atomically
///   index             append-only fixed-width entry index
///   pages/<decimal>   one fixed-size file per page
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    pages: PathBuf,
}

const METADATA_FILE: &str = "metadata";
const INDEX_FILE: &str = "index";
const PAGES_DIR: &str = "pages";

impl Layout {
    pub fn new(config: &WalConfig) -> Self {
        let root = config.root_dir.clone();
        let pages = root.join(PAGES_DIR);
        Self { root, pages }
    }

    pub fn ensure(&self) -> WalResult<()> {
        fs::create_dir_all(&self.pages).map_err(WalError::from)?;
        let _ = sync_dir(&self.root);
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn pages_dir(&self) -> &Path {
        &self.pages
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn page_path(&self, page: PageId) -> PathBuf {
        self.pages.join(page.as_u32().to_string())
    }

    /// Parses a file name under `pages/` back into its page id.
    pub fn parse_page_file(name: &Path) -> WalResult<PageId> {
        name.file_name()
            .and_then(|n| n.to_str())
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(PageId::new)
            .ok_or_else(|| {
                WalError::invalid_state(format!("invalid page filename: {}", name.display()))
            })
    }

    /// Returns the page ids present on disk, unordered.
    pub fn scan_pages(&self) -> WalResult<Vec<PageId>> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(&self.pages) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(err) => return Err(WalError::from(err)),
        };
        for entry in entries {
            let entry = entry.map_err(WalError::from)?;
            found.push(Self::parse_page_file(&entry.path())?);
        }
        Ok(found)
    }
}

/// Creates `path` as a zero-filled file of exactly `size` bytes.
///
/// Page files are preallocated at their final size so later writes
/// never change the file length; the length itself is made durable
/// before the file is handed out.
pub fn preallocate_file(path: &Path, size: u64) -> WalResult<File> {
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| WalError::io_at(path, 0, err))?;
    file.set_len(size)
        .and_then(|_| file.sync_all())
        .map_err(|err| WalError::io_at(path, 0, err))?;
    Ok(file)
}

/// Best-effort fsync of a directory, making preceding renames and
/// unlinks within it durable.
///
/// Filesystems and platforms that cannot open or sync a directory are
/// tolerated; the data files themselves are synced separately and the
/// directory entry ordering is the only thing given up.
pub fn sync_dir(path: &Path) -> WalResult<()> {
    let dir = match File::open(path) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => return Ok(()),
        Err(err) => return Err(WalError::io_at(path, 0, err)),
    };
    match dir.sync_all() {
        Ok(()) => Ok(()),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
            ) =>
        {
            Ok(())
        }
        Err(err) => Err(WalError::io_at(path, 0, err)),
    }
}

/// Atomically replaces `dst` with `bytes`.
///
/// The content goes to a sibling temp file first, is fsynced there,
/// and is renamed over `dst`; the parent directory is then synced so
/// the rename survives a crash. At every point the destination holds
/// either the old or the new content, never a torn mix. An abandoned
/// temp file cleans itself up on drop.
pub fn replace_file(dst: &Path, bytes: &[u8]) -> WalResult<()> {
    let parent = dst
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| WalError::invalid_config("replace target has no parent directory"))?;
    let name = dst
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| WalError::invalid_config("replace target has no file name"))?;

    let mut temp = tempfile::Builder::new()
        .prefix(name)
        .suffix(".swap")
        .tempfile_in(parent)
        .map_err(|err| WalError::io_at(parent, 0, err))?;
    temp.as_file_mut()
        .write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| WalError::io_at(temp.path(), 0, err))?;

    temp.persist(dst)
        .map_err(|err| WalError::io_at(dst, 0, err.error))?
        .sync_all()
        .map_err(|err| WalError::io_at(dst, 0, err))?;
    sync_dir(parent)
}
