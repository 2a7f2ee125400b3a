use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::SessionId;

#[derive(Debug, Error)]
pub enum BookmarkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for BookmarkError {
    fn from(value: toml::de::Error) -> Self {
        BookmarkError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for BookmarkError {
    fn from(value: toml::ser::Error) -> Self {
        BookmarkError::Toml(value.to_string())
    }
}

/// Locally persisted "last known session id", used to offer a rejoin.
pub trait SessionBookmark: Send + Sync {
    fn load(&self) -> Result<Option<SessionId>, BookmarkError>;
    fn save(&self, id: &SessionId) -> Result<(), BookmarkError>;
    fn clear(&self) -> Result<(), BookmarkError>;
}

/// Clears `bookmark` only if it still names `id`. Returns whether it did.
pub fn clear_if_current(
    bookmark: &dyn SessionBookmark,
    id: &SessionId,
) -> Result<bool, BookmarkError> {
    match bookmark.load()? {
        Some(current) if &current == id => {
            bookmark.clear()?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookmarkFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_session: Option<SessionId>,
}

#[derive(Debug, Clone)]
pub struct FileBookmark {
    path: PathBuf,
}

impl FileBookmark {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `session.toml` under the platform config directory.
    pub fn default_location() -> Option<Self> {
        ProjectDirs::from("dev", "tandem", "tandem")
            .map(|dirs| Self::new(dirs.config_dir().join("session.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &BookmarkFile) -> Result<(), BookmarkError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, toml::to_string(file)?)?;
        Ok(())
    }
}

impl SessionBookmark for FileBookmark {
    fn load(&self) -> Result<Option<SessionId>, BookmarkError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(toml::from_str::<BookmarkFile>(&contents)?.last_session),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, id: &SessionId) -> Result<(), BookmarkError> {
        self.write(&BookmarkFile {
            last_session: Some(id.clone()),
        })
    }

    fn clear(&self) -> Result<(), BookmarkError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBookmark {
    slot: Mutex<Option<SessionId>>,
}

impl MemoryBookmark {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBookmark for MemoryBookmark {
    fn load(&self) -> Result<Option<SessionId>, BookmarkError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, id: &SessionId) -> Result<(), BookmarkError> {
        *self.slot.lock() = Some(id.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), BookmarkError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_bookmark_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let bookmark = FileBookmark::new(dir.path().join("nested").join("session.toml"));
        assert_eq!(bookmark.load().unwrap(), None);

        let id = SessionId::new("ABCDEFGHJK");
        bookmark.save(&id).unwrap();
        assert_eq!(bookmark.load().unwrap(), Some(id));

        bookmark.clear().unwrap();
        assert_eq!(bookmark.load().unwrap(), None);
        bookmark.clear().unwrap();
    }

    #[test]
    fn clear_if_current_keeps_other_sessions() {
        let bookmark = MemoryBookmark::new();
        let kept = SessionId::new("ABCDEFGHJK");
        bookmark.save(&kept).unwrap();
        assert!(!clear_if_current(&bookmark, &SessionId::new("ZZZZZZZZZZ")).unwrap());
        assert_eq!(bookmark.load().unwrap(), Some(kept.clone()));
        assert!(clear_if_current(&bookmark, &kept).unwrap());
        assert!(!clear_if_current(&bookmark, &kept).unwrap());
    }

    #[test]
    fn corrupt_bookmark_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        fs::write(&path, "last_session = [").unwrap();
        assert!(matches!(
            FileBookmark::new(path).load(),
            Err(BookmarkError::Toml(_))
        ));
    }
}
