//! In-memory [`ArticleStore`] with the same batch and uniqueness semantics as Postgres.

use std::collections::{BTreeMap, HashSet};

use almanac_core::{Article, NewArticle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::store::{first_duplicate, ArticleStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<String, Article>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryArticleStore {
    state: Mutex<MemoryState>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Article> {
        self.state.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn insert_batch(&self, batch: &[NewArticle]) -> Result<usize, StoreError> {
        if let Some(external_id) = first_duplicate(batch) {
            return Err(StoreError::DuplicateInBatch {
                external_id: external_id.to_string(),
            });
        }

        let mut state = self.state.lock().await;
        if batch.iter().any(|a| state.rows.contains_key(&a.external_id)) {
            return Err(StoreError::Conflict {
                operation: "insert_batch",
            });
        }

        let committed_at = Utc::now();
        for article in batch {
            state.next_id += 1;
            let id = state.next_id;
            state.rows.insert(
                article.external_id.clone(),
                Article::from_new(id, article.clone(), committed_at),
            );
        }
        Ok(batch.len())
    }

    async fn existing_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(external_ids
            .iter()
            .filter(|id| state.rows.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Article>, StoreError> {
        Ok(self.state.lock().await.rows.get(external_id).cloned())
    }

    async fn update_article(&self, article: &NewArticle) -> Result<Article, StoreError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.rows.get_mut(&article.external_id) else {
            return Err(StoreError::NotFound {
                external_id: article.external_id.clone(),
            });
        };
        stored.apply_update(article.clone(), Utc::now());
        Ok(stored.clone())
    }

    async fn list_published_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .rows
            .values()
            .filter(|a| a.published_at >= start && a.published_at < end)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.published_at.cmp(&a.published_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.rows.len() as i64)
    }
}
