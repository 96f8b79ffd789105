use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use tokio::fs;
use tracing::{debug, info, warn};

/// One saved playlist item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    /// What the user originally asked for; re-resolved on load.
    pub input: String,
    pub title: Option<String>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedPlaylist {
    pub entries: Vec<PlaylistEntry>,
    pub updated_at: DateTime<Utc>,
}

/// Everything stored for one session, one JSON file each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionFile {
    playlists: BTreeMap<String, SavedPlaylist>,
}

/// Playlist store backed by JSON files under `data_dir/playlists`.
pub struct JsonStorage {
    data_dir: PathBuf,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let playlists_dir = data_dir.join("playlists");
        fs::create_dir_all(&playlists_dir)
            .await
            .with_context(|| format!("creating {}", playlists_dir.display()))?;

        info!("📁 Storage initialized at: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    /// Loads a named playlist, `None` if it was never saved.
    pub async fn load_playlist(&self, session: u64, name: &str) -> Result<Option<Vec<PlaylistEntry>>> {
        let file = self.read_session(session).await?;
        Ok(file
            .playlists
            .get(&normalize(name))
            .map(|playlist| playlist.entries.clone()))
    }

    /// Saves a named playlist, replacing any previous entries.
    pub async fn save_playlist(&self, session: u64, name: &str, entries: Vec<PlaylistEntry>) -> Result<()> {
        let name = normalize(name);
        if name.is_empty() {
            anyhow::bail!("Playlist name cannot be empty");
        }

        let mut file = self.read_session(session).await?;
        let count = entries.len();
        file.playlists.insert(
            name.clone(),
            SavedPlaylist {
                entries,
                updated_at: Utc::now(),
            },
        );
        self.write_session(session, &file).await?;

        info!("💾 Saved playlist '{}' ({} tracks) for {}", name, count, session);
        Ok(())
    }

    pub async fn list_playlists(&self, session: u64) -> Result<Vec<String>> {
        let file = self.read_session(session).await?;
        Ok(file.playlists.into_keys().collect())
    }

    /// Returns whether a playlist was removed.
    pub async fn delete_playlist(&self, session: u64, name: &str) -> Result<bool> {
        let mut file = self.read_session(session).await?;
        let removed = file.playlists.remove(&normalize(name)).is_some();
        if removed {
            self.write_session(session, &file).await?;
            info!("🗑️ Deleted playlist '{}' for {}", name, session);
        }
        Ok(removed)
    }

    async fn read_session(&self, session: u64) -> Result<SessionFile> {
        let path = self.session_file_path(session);
        match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved data for {}", session);
                Ok(SessionFile::default())
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn write_session(&self, session: u64, file: &SessionFile) -> Result<()> {
        let path = self.session_file_path(session);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(file)?;
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            warn!("Replacing {} failed: {}", path.display(), e);
            return Err(e).with_context(|| format!("replacing {}", path.display()));
        }
        Ok(())
    }

    fn session_file_path(&self, session: u64) -> PathBuf {
        self.data_dir
            .join("playlists")
            .join(format!("guild_{}.json", session))
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(input: &str) -> PlaylistEntry {
        PlaylistEntry {
            input: input.to_string(),
            title: Some(format!("{input} title")),
            duration: Some(Duration::from_secs(200)),
        }
    }

    #[tokio::test]
    async fn missing_playlist_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(storage.load_playlist(1, "chill").await.unwrap(), None);
        assert!(storage.list_playlists(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();

        storage
            .save_playlist(1, "Chill", vec![entry("a"), entry("b")])
            .await
            .unwrap();
        storage.save_playlist(1, "chill ", vec![entry("c")]).await.unwrap();

        assert_eq!(storage.load_playlist(1, "CHILL").await.unwrap(), Some(vec![entry("c")]));
        assert_eq!(storage.list_playlists(1).await.unwrap(), vec!["chill".to_string()]);
    }

    #[tokio::test]
    async fn sessions_are_isolated_and_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
            storage.save_playlist(1, "mix", vec![entry("a")]).await.unwrap();
            storage.save_playlist(2, "mix", vec![entry("z")]).await.unwrap();
        }
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(storage.load_playlist(1, "mix").await.unwrap(), Some(vec![entry("a")]));
        assert_eq!(storage.load_playlist(2, "mix").await.unwrap(), Some(vec![entry("z")]));
    }

    #[tokio::test]
    async fn delete_and_reject_empty_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        storage.save_playlist(1, "x", vec![entry("a")]).await.unwrap();

        assert!(storage.delete_playlist(1, "x").await.unwrap());
        assert!(!storage.delete_playlist(1, "x").await.unwrap());
        assert!(storage.save_playlist(1, "  ", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        std::fs::write(dir.path().join("playlists").join("guild_5.json"), "{not json").unwrap();
        assert!(storage.load_playlist(5, "x").await.is_err());
    }
}
