//! Tracking file: the streamers to mine and their setting overrides.
//!
//! ```json
//! [{ "username": "somestreamer", "settings": { "make_predictions": false } }]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::settings::SettingsOverrides;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedStreamer {
    pub username: String,
    #[serde(default)]
    pub settings: SettingsOverrides,
}

#[derive(Debug, Clone)]
pub struct TrackingFile {
    path: PathBuf,
}

impl TrackingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file. Usernames are normalised; later duplicates are dropped.
    pub async fn load(&self) -> Result<Vec<TrackedStreamer>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let entries: Vec<TrackedStreamer> = serde_json::from_str(&raw)?;
        let mut out: Vec<TrackedStreamer> = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.username = entry.username.trim().to_lowercase();
            if entry.username.is_empty() || out.iter().any(|e| e.username == entry.username) {
                continue;
            }
            out.push(entry);
        }
        tracing::debug!(path = %self.path.display(), count = out.len(), "Loaded tracking file");
        Ok(out)
    }

    /// Write entries back, keeping only the overrides each streamer was declared with.
    pub async fn save(&self, entries: &[TrackedStreamer]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Strategy;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pointsminer-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_load_normalises_and_dedups() {
        let path = temp_path("load");
        tokio::fs::write(
            &path,
            r#"[
                {"username": " Alice ", "settings": {"bet": {"strategy": "HIGH_ODDS"}}},
                {"username": "bob"},
                {"username": "ALICE"}
            ]"#,
        )
        .await
        .unwrap();

        let entries = TrackingFile::new(&path).load().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].username, "alice");
        assert_eq!(entries[0].settings.bet.strategy, Some(Strategy::HighOdds));
        assert_eq!(entries[1].settings, SettingsOverrides::default());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let path = temp_path("save");
        let file = TrackingFile::new(&path);
        let mut settings = SettingsOverrides::default();
        settings.follow_raid = Some(false);
        let entries = vec![TrackedStreamer {
            username: "carol".into(),
            settings,
        }];
        file.save(&entries).await.unwrap();
        assert_eq!(file.load().await.unwrap(), entries);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = TrackingFile::new(temp_path("missing")).load().await.unwrap_err();
        assert_eq!(err.cause(), "io");
    }
}
