//! Ingestion store contract and its Postgres implementation.

use std::collections::HashSet;
use std::time::Duration;

use almanac_core::{Article, Engagement, NewArticle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record in the batch collides with a stored `external_id`; nothing was committed.
    #[error("{operation} rejected: external_id already stored")]
    Conflict { operation: &'static str },
    #[error("batch repeats external_id {external_id}")]
    DuplicateInBatch { external_id: String },
    #[error("article {external_id} not found")]
    NotFound { external_id: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Persistence seam shared by the ingestion pipeline and the query layer.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Inserts every record in one unit of work, or none of them.
    async fn insert_batch(&self, batch: &[NewArticle]) -> Result<usize, StoreError>;

    /// Returns the subset of `external_ids` that is already stored.
    async fn existing_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>, StoreError>;

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Article>, StoreError>;

    /// Replaces the content of a stored article. `created_at` is kept and
    /// `updated_at` never moves backward.
    async fn update_article(&self, article: &NewArticle) -> Result<Article, StoreError>;

    /// Articles with `start <= published_at < end`, newest first.
    async fn list_published_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;
}

/// Returns the first `external_id` that appears more than once in `batch`.
pub fn first_duplicate(batch: &[NewArticle]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(batch.len());
    batch
        .iter()
        .map(|a| a.external_id.as_str())
        .find(|id| !seen.insert(*id))
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgArticleStore {
    pool: PgPool,
}

const ARTICLE_COLUMNS: &str = "id, external_id, title, author, source_url, canonical_link, body_summary, \
     published_at, cover_image_url, comment_count, read_count, like_count, collect_count, \
     share_count, created_at, updated_at";

impl PgArticleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("article schema migrations applied");
        Ok(())
    }
}

fn article_from_row(row: &PgRow) -> Result<Article, sqlx::Error> {
    Ok(Article {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        source_url: row.try_get("source_url")?,
        canonical_link: row.try_get("canonical_link")?,
        body_summary: row.try_get("body_summary")?,
        published_at: row.try_get("published_at")?,
        cover_image_url: row.try_get("cover_image_url")?,
        engagement: Engagement {
            comment_count: row.try_get("comment_count")?,
            read_count: row.try_get("read_count")?,
            like_count: row.try_get("like_count")?,
            collect_count: row.try_get("collect_count")?,
            share_count: row.try_get("share_count")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn classify_write_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    let unique_violation = err
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if unique_violation {
        StoreError::Conflict { operation }
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn insert_batch(&self, batch: &[NewArticle]) -> Result<usize, StoreError> {
        if let Some(external_id) = first_duplicate(batch) {
            return Err(StoreError::DuplicateInBatch {
                external_id: external_id.to_string(),
            });
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let committed_at = Utc::now();
        // Dropping `tx` on any early return rolls the whole batch back.
        let mut tx = self.pool.begin().await?;
        for article in batch {
            sqlx::query(
                r#"
                INSERT INTO articles (
                    external_id, title, author, source_url, canonical_link, body_summary,
                    published_at, cover_image_url, comment_count, read_count, like_count,
                    collect_count, share_count, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
                "#,
            )
            .bind(&article.external_id)
            .bind(&article.title)
            .bind(&article.author)
            .bind(&article.source_url)
            .bind(&article.canonical_link)
            .bind(&article.body_summary)
            .bind(article.published_at)
            .bind(&article.cover_image_url)
            .bind(article.engagement.comment_count)
            .bind(article.engagement.read_count)
            .bind(article.engagement.like_count)
            .bind(article.engagement.collect_count)
            .bind(article.engagement.share_count)
            .bind(committed_at)
            .execute(&mut *tx)
            .await
            .map_err(|err| classify_write_error("insert_batch", err))?;
        }
        tx.commit().await?;
        Ok(batch.len())
    }

    async fn existing_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if external_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT external_id FROM articles WHERE external_id = ANY($1)")
                .bind(external_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Article>, StoreError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(article_from_row).transpose()?)
    }

    async fn update_article(&self, article: &NewArticle) -> Result<Article, StoreError> {
        let sql = format!(
            r#"
            UPDATE articles
               SET title = $2,
                   author = $3,
                   source_url = $4,
                   canonical_link = $5,
                   body_summary = $6,
                   published_at = $7,
                   cover_image_url = $8,
                   comment_count = $9,
                   read_count = $10,
                   like_count = $11,
                   collect_count = $12,
                   share_count = $13,
                   updated_at = GREATEST(updated_at, $14)
             WHERE external_id = $1
         RETURNING {ARTICLE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&article.external_id)
            .bind(&article.title)
            .bind(&article.author)
            .bind(&article.source_url)
            .bind(&article.canonical_link)
            .bind(&article.body_summary)
            .bind(article.published_at)
            .bind(&article.cover_image_url)
            .bind(article.engagement.comment_count)
            .bind(article.engagement.read_count)
            .bind(article.engagement.like_count)
            .bind(article.engagement.collect_count)
            .bind(article.engagement.share_count)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| classify_write_error("update_article", err))?;

        match row {
            Some(row) => Ok(article_from_row(&row)?),
            None => Err(StoreError::NotFound {
                external_id: article.external_id.clone(),
            }),
        }
    }

    async fn list_published_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ARTICLE_COLUMNS}
              FROM articles
             WHERE published_at >= $1
               AND published_at < $2
             ORDER BY published_at DESC, id DESC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| article_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn article(external_id: &str, hour: u32) -> NewArticle {
        NewArticle {
            external_id: external_id.to_string(),
            title: format!("title {external_id}"),
            author: "desk".into(),
            source_url: format!("https://news.example/{external_id}"),
            canonical_link: format!("https://news.example/{external_id}"),
            body_summary: Some("summary".into()),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).single().unwrap(),
            cover_image_url: String::new(),
            engagement: Engagement::default(),
        }
    }

    #[test]
    fn first_duplicate_finds_repeated_keys() {
        let batch = vec![article("a", 1), article("b", 2), article("a", 3)];
        assert_eq!(first_duplicate(&batch), Some("a"));
        assert_eq!(first_duplicate(&batch[..2]), None);
    }

    /// Runs only against a live database: `DATABASE_URL=postgres://... cargo test`.
    async fn pg_store_from_env() -> Option<PgArticleStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = connect_pool(&url, 2).await.ok()?;
        let store = PgArticleStore::new(pool);
        store.migrate().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn pg_batch_with_stored_collision_commits_nothing() {
        let Some(store) = pg_store_from_env().await else {
            return;
        };
        let prefix = uuid::Uuid::new_v4().simple().to_string();
        let key = |n: usize| format!("{prefix}-{n}");

        store.insert_batch(&[article(&key(3), 3)]).await.unwrap();

        let batch = (1..=5).map(|n| article(&key(n), n as u32)).collect::<Vec<_>>();
        let err = store.insert_batch(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { operation: "insert_batch" }));

        let ids = batch.iter().map(|a| a.external_id.clone()).collect::<Vec<_>>();
        let existing = store.existing_external_ids(&ids).await.unwrap();
        assert_eq!(existing, HashSet::from([key(3)]));
    }

    #[tokio::test]
    async fn pg_accepts_long_text_fields() {
        let Some(store) = pg_store_from_env().await else {
            return;
        };
        let external_id = uuid::Uuid::new_v4().to_string();
        let mut long = article(&external_id, 7);
        long.title = "t".repeat(600);
        long.author = "a".repeat(300);
        long.source_url = format!("https://news.example/{}", "p".repeat(2000));
        long.canonical_link = long.source_url.clone();
        long.cover_image_url = format!("https://img.example/{}", "i".repeat(800));

        assert_eq!(store.insert_batch(&[long.clone()]).await.unwrap(), 1);
        let stored = store.get_by_external_id(&external_id).await.unwrap().unwrap();
        assert_eq!(stored.title, long.title);
        assert_eq!(stored.source_url, long.source_url);
        assert_eq!(stored.cover_image_url, long.cover_image_url);
    }

    #[tokio::test]
    async fn pg_update_keeps_created_at() {
        let Some(store) = pg_store_from_env().await else {
            return;
        };
        let external_id = uuid::Uuid::new_v4().to_string();
        store.insert_batch(&[article(&external_id, 5)]).await.unwrap();
        let stored = store.get_by_external_id(&external_id).await.unwrap().unwrap();

        let mut changed = article(&external_id, 6);
        changed.title = "updated".into();
        let updated = store.update_article(&changed).await.unwrap();

        assert_eq!(updated.id, stored.id);
        assert_eq!(updated.title, "updated");
        assert_eq!(updated.created_at, stored.created_at);
        assert!(updated.updated_at >= stored.updated_at);
    }
}
