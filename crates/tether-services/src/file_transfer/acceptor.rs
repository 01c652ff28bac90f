//! Deciding whether, and where, to accept an announced file.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub file_id: u64,
    pub file_size: u64,
    pub file_name: String,
}

/// Consulted once per `UR_RECEIVER`. Returning a path means the receiver is
/// ready; the transfer owns that path from then on and removes it if the
/// transfer fails.
pub trait FileAcceptor: Send + Sync {
    fn accept(&self, offer: &FileOffer) -> Option<PathBuf>;
}

/// Accepts everything into one directory.
pub struct DirectoryAcceptor {
    dir: PathBuf,
}

impl DirectoryAcceptor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Final path component of an announced name. Anything that could escape
/// the target directory, or is empty, becomes `file-<id>`.
pub fn safe_file_name(name: &str, file_id: u64) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .replace('\0', "");
    match last.as_str() {
        "" | "." | ".." => format!("file-{file_id}"),
        _ => last,
    }
}

/// Create `path` only if nothing is there yet.
fn claim(path: &Path) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

impl DirectoryAcceptor {
    /// Reserve a fresh file for `offer`: the plain name, then `<id>-name`,
    /// then `<id>-<n>-name`. The empty file is created here so concurrent
    /// offers with one name never land on the same path.
    fn reserve(&self, offer: &FileOffer) -> io::Result<Option<PathBuf>> {
        std::fs::create_dir_all(&self.dir)?;
        let name = safe_file_name(&offer.file_name, offer.file_id);
        let id = offer.file_id;
        let candidates = std::iter::once(name.clone())
            .chain(std::iter::once(format!("{id}-{name}")))
            .chain((1..=MAX_RENAMES).map(|n| format!("{id}-{n}-{name}")));
        for candidate in candidates {
            let path = self.dir.join(candidate);
            if claim(&path)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

const MAX_RENAMES: u32 = 64;

impl FileAcceptor for DirectoryAcceptor {
    fn accept(&self, offer: &FileOffer) -> Option<PathBuf> {
        match self.reserve(offer) {
            Ok(Some(path)) => Some(path),
            Ok(None) => {
                tracing::warn!(file_id = offer.file_id, name = %offer.file_name, "no free file name, declining");
                None
            }
            Err(e) => {
                tracing::warn!(
                    file_id = offer.file_id,
                    dir = %self.dir.display(),
                    error = %e,
                    "cannot create download file, declining"
                );
                None
            }
        }
    }
}

/// Declines every offer.
pub struct RejectAll;

impl FileAcceptor for RejectAll {
    fn accept(&self, offer: &FileOffer) -> Option<PathBuf> {
        tracing::debug!(file_id = offer.file_id, name = %offer.file_name, "rejecting file offer");
        None
    }
}
