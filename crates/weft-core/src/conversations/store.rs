//! Conversation storage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::record::{ConversationRecord, ConversationSummary};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Updated,
    Created,
    Messages,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Inclusive bounds on `updated_at`
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Case-insensitive; matched against summary, first message, then raw messages
    pub search_term: Option<String>,
    pub provider: Option<String>,
    /// 0 means no limit
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub summaries: Vec<ConversationSummary>,
    /// Matches before pagination
    pub total: usize,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(&self, record: &ConversationRecord) -> Result<()>;
    /// `Ok(None)` when no record exists for `id`.
    async fn load(&self, id: &str) -> Result<Option<ConversationRecord>>;
    async fn query(&self, options: &QueryOptions) -> Result<QueryResult>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// One pretty-printed JSON file per conversation.
#[derive(Debug, Clone)]
pub struct JsonConversationStore {
    dir: PathBuf,
}

impl JsonConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            bail!("Invalid conversation id: {id:?}");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn load_all(&self) -> Result<Vec<ConversationRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.dir.display()));
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable conversation");
                }
            }
        }
        Ok(records)
    }
}

async fn read_record(path: &Path) -> Result<ConversationRecord> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

#[async_trait]
impl ConversationStore for JsonConversationStore {
    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        let path = self.path_for(&record.id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create directory {}", self.dir.display()))?;

        let json = serde_json::to_vec_pretty(record).context("Failed to serialize conversation")?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| {
                format!(
                    "Failed to rename {} to {}",
                    tmp_path.display(),
                    path.display()
                )
            })?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let path = self.path_for(id)?;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => read_record(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to access {}", path.display())),
        }
    }

    async fn query(&self, options: &QueryOptions) -> Result<QueryResult> {
        let search = options
            .search_term
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut summaries: Vec<ConversationSummary> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|record| {
                if options.start_date.is_some_and(|start| record.updated_at < start)
                    || options.end_date.is_some_and(|end| record.updated_at > end)
                {
                    return false;
                }
                if let Some(provider) = &options.provider
                    && !record.provider.eq_ignore_ascii_case(provider)
                {
                    return false;
                }
                search.as_deref().is_none_or(|term| matches_search(record, term))
            })
            .map(|record| record.to_summary())
            .collect();

        summaries.sort_by(|a, b| {
            let ordering = match options.sort_by {
                SortBy::Updated => a.updated_at.cmp(&b.updated_at),
                SortBy::Created => a.created_at.cmp(&b.created_at),
                SortBy::Messages => a.message_count.cmp(&b.message_count),
            };
            match options.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
            .then_with(|| a.id.cmp(&b.id))
        });

        let total = summaries.len();
        let offset = options.offset.min(total);
        let limit = if options.limit == 0 {
            total - offset
        } else {
            options.limit.min(total - offset)
        };
        let summaries = summaries.into_iter().skip(offset).take(limit).collect();

        Ok(QueryResult { summaries, total })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => bail!("Conversation not found: {id}"),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

fn matches_search(record: &ConversationRecord, term: &str) -> bool {
    record.summary.to_lowercase().contains(term)
        || record
            .first_user_message()
            .is_some_and(|m| m.to_lowercase().contains(term))
        || record.raw_messages.to_string().to_lowercase().contains(term)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn record(id: &str, provider: &str, first: &str, age_days: i64) -> ConversationRecord {
        let mut record = ConversationRecord::new(id, provider);
        record.raw_messages = json!([
            {"role": "user", "content": first},
            {"role": "assistant", "content": format!("reply to {id}")}
        ]);
        record.updated_at = Utc::now() - Duration::days(age_days);
        record.created_at = record.updated_at;
        record
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConversationStore::new(dir.path().join("conversations"));
        let rec = record("c1", "anthropic", "hello", 0);

        store.save(&rec).await.unwrap();
        assert!(!dir.path().join("conversations/c1.json.tmp").exists());
        assert_eq!(store.load("c1").await.unwrap(), Some(rec));

        store.delete("c1").await.unwrap();
        assert_eq!(store.load("c1").await.unwrap(), None);
        assert!(store.delete("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConversationStore::new(dir.path());
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.load("").await.is_err());
    }

    #[tokio::test]
    async fn test_query_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConversationStore::new(dir.path().join("nope"));
        let result = store.query(&QueryOptions::default()).await.unwrap();
        assert_eq!(result.total, 0);
    }

    #[tokio::test]
    async fn test_query_filters_sorts_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConversationStore::new(dir.path());
        store.save(&record("old", "anthropic", "fix the parser", 10)).await.unwrap();
        store.save(&record("mid", "openai", "write docs", 5)).await.unwrap();
        store.save(&record("new", "anthropic", "Parser bug again", 1)).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let all = store.query(&QueryOptions::default()).await.unwrap();
        assert_eq!(all.total, 3);
        let ids: Vec<_> = all.summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid", "old"]);

        let search = store
            .query(&QueryOptions {
                search_term: Some("PARSER".to_string()),
                sort_order: SortOrder::Asc,
                ..QueryOptions::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = search.summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["old", "new"]);

        // Raw-message search reaches assistant replies
        let deep = store
            .query(&QueryOptions {
                search_term: Some("reply to mid".to_string()),
                ..QueryOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(deep.total, 1);

        let page = store
            .query(&QueryOptions {
                provider: Some("anthropic".to_string()),
                limit: 1,
                offset: 1,
                ..QueryOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.summaries.len(), 1);
        assert_eq!(page.summaries[0].id, "old");

        let recent = store
            .query(&QueryOptions {
                start_date: Some(Utc::now() - Duration::days(3)),
                ..QueryOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.total, 1);
        assert_eq!(recent.summaries[0].id, "new");
    }
}
