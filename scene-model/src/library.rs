//! Resolution of scene names to files on disk.

use std::path::{Path, PathBuf};

use crate::error::{Result, SceneError};
use crate::model::Scene;

/// Scenes available to one room, stored as `<root>/<room>/<name>.json`.
#[derive(Debug, Clone)]
pub struct SceneLibrary {
    root: PathBuf,
    room: String,
    default_scene: String,
}

impl SceneLibrary {
    pub fn new(
        root: impl Into<PathBuf>,
        room: impl Into<String>,
        default_scene: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            room: room.into(),
            default_scene: default_scene.into(),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Directory holding this room's scene files.
    pub fn room_dir(&self) -> PathBuf {
        self.root.join(&self.room)
    }

    /// Path of a scene file; the `.json` suffix is optional in `name`.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        let name = sanitize(name)?;
        Ok(self.room_dir().join(format!("{name}.json")))
    }

    /// Load the room's configured default scene.
    pub fn load_default(&self) -> Result<Scene> {
        self.load_named(&self.default_scene)
    }

    /// Load a scene by name, as carried in `start_scene` messages.
    pub fn load_named(&self, name: &str) -> Result<Scene> {
        let path = self.path_for(name)?;
        tracing::debug!("Resolving scene '{}' to {}", name, path.display());
        Scene::load(&path)
    }

    /// Names of the scene files present in the room directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.room_dir();
        let entries = std::fs::read_dir(&dir).map_err(|source| SceneError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| file_stem(&path))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

fn sanitize(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    let stem = trimmed.strip_suffix(".json").unwrap_or(trimmed);
    let unsafe_name = stem.is_empty()
        || stem.contains('/')
        || stem.contains('\\')
        || stem.contains("..")
        || stem.starts_with('.');
    if unsafe_name {
        return Err(SceneError::InvalidName(name.to_string()));
    }
    Ok(stem)
}
