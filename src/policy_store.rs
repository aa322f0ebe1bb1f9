use crate::error::{AutodeleteError, Result};
use crate::models::ChannelConfig;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Persisted per-channel retention configuration
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Returns `None` when the channel has no stored policy
    async fn load_policy(&self, channel_id: &str) -> Result<Option<ChannelConfig>>;

    async fn save_policy(&self, config: &ChannelConfig) -> Result<()>;

    /// IDs of every channel with a stored policy
    async fn list_channels(&self) -> Result<Vec<String>>;
}

/// Stores one `<channel_id>.yml` file per channel in a directory
pub struct YamlPolicyStore {
    dir: PathBuf,
}

impl YamlPolicyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, channel_id: &str) -> Result<PathBuf> {
        let valid = !channel_id.is_empty()
            && channel_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AutodeleteError::ConfigError(format!(
                "invalid channel id {:?}",
                channel_id
            )));
        }
        Ok(self.dir.join(format!("{}.yml", channel_id)))
    }
}

#[async_trait]
impl PolicyStore for YamlPolicyStore {
    async fn load_policy(&self, channel_id: &str) -> Result<Option<ChannelConfig>> {
        let path = self.path_for(channel_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let config: ChannelConfig = serde_yaml::from_str(&content)?;
        if config.channel_id != channel_id {
            return Err(AutodeleteError::ConfigError(format!(
                "{} holds the policy for channel {}",
                path.display(),
                config.channel_id
            )));
        }
        Ok(Some(config))
    }

    async fn save_policy(&self, config: &ChannelConfig) -> Result<()> {
        let path = self.path_for(&config.channel_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write to a sibling file first so readers never see a partial document
        let tmp = path.with_extension("yml.tmp");
        tokio::fs::write(&tmp, serde_yaml::to_string(config)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(channel_id = %config.channel_id, "saved channel policy");
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("Policy directory does not exist: {:?}", self.dir);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = channel_id_of(&entry.path()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn channel_id_of(path: &Path) -> Option<String> {
    if path.extension()? != "yml" {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::channel_config;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlPolicyStore::new(dir.path().join("data"));
        let mut config = channel_config("123", Some(3600), Some(50));
        config.keep_messages = vec!["999".to_string()];

        store.save_policy(&config).await.unwrap();

        assert_eq!(store.load_policy("123").await.unwrap(), Some(config));
        assert_eq!(store.list_channels().await.unwrap(), vec!["123"]);
    }

    #[tokio::test]
    async fn test_missing_policy_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlPolicyStore::new(dir.path());

        assert_eq!(store.load_policy("404").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlPolicyStore::new(dir.path().join("nope"));

        assert!(store.list_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_hand_written_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("77.yml"),
            "channel_id: \"77\"\nname: memes\nmax_age_secs: 600\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let store = YamlPolicyStore::new(dir.path());

        let config = store.load_policy("77").await.unwrap().unwrap();
        assert_eq!(config.name, "memes");
        assert_eq!(config.max_age_secs, Some(600));
        assert!(config.exclude_pinned);
        assert_eq!(store.list_channels().await.unwrap(), vec!["77"]);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_and_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("1.yml"),
            "channel_id: \"2\"\nmax_count: 5\n",
        )
        .unwrap();
        let store = YamlPolicyStore::new(dir.path());

        assert!(store.load_policy("1").await.is_err());
        assert!(store.load_policy("../etc/passwd").await.is_err());
    }
}
