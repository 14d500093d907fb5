//! Core domain model for Almanac's news ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "almanac-core";

/// Engagement counters carried by every article. All values are non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Engagement {
    pub comment_count: i64,
    pub read_count: i64,
    pub like_count: i64,
    pub collect_count: i64,
    pub share_count: i64,
}

impl Engagement {
    /// Builds counters from raw upstream values, clamping anything negative to zero.
    pub fn clamped(comment: i64, read: i64, like: i64, collect: i64, share: i64) -> Self {
        Self {
            comment_count: comment.max(0),
            read_count: read.max(0),
            like_count: like.max(0),
            collect_count: collect.max(0),
            share_count: share.max(0),
        }
    }
}

/// Normalized handoff contract from the normalizer into the ingestion store.
///
/// Carries no store-managed fields; `created_at`/`updated_at` are assigned on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArticle {
    pub external_id: String,
    pub title: String,
    pub author: String,
    pub source_url: String,
    pub canonical_link: String,
    pub body_summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub cover_image_url: String,
    pub engagement: Engagement,
}

/// Canonical persisted article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub author: String,
    pub source_url: String,
    pub canonical_link: String,
    pub body_summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub cover_image_url: String,
    pub engagement: Engagement,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    pub fn from_new(id: i64, new: NewArticle, committed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            external_id: new.external_id,
            title: new.title,
            author: new.author,
            source_url: new.source_url,
            canonical_link: new.canonical_link,
            body_summary: new.body_summary,
            published_at: new.published_at,
            cover_image_url: new.cover_image_url,
            engagement: new.engagement,
            created_at: committed_at,
            updated_at: committed_at,
        }
    }

    /// Applies fresh content from `new`, keeping identity and `created_at`.
    ///
    /// `updated_at` only ever moves forward.
    pub fn apply_update(&mut self, new: NewArticle, now: DateTime<Utc>) {
        self.title = new.title;
        self.author = new.author;
        self.source_url = new.source_url;
        self.canonical_link = new.canonical_link;
        self.body_summary = new.body_summary;
        self.published_at = new.published_at;
        self.cover_image_url = new.cover_image_url;
        self.engagement = new.engagement;
        self.updated_at = self.updated_at.max(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(external_id: &str) -> NewArticle {
        NewArticle {
            external_id: external_id.to_string(),
            title: "Title".into(),
            author: String::new(),
            source_url: String::new(),
            canonical_link: String::new(),
            body_summary: None,
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).single().unwrap(),
            cover_image_url: String::new(),
            engagement: Engagement::default(),
        }
    }

    #[test]
    fn engagement_clamps_negative_counters() {
        let e = Engagement::clamped(-3, 10, 0, -1, 7);
        assert_eq!(
            e,
            Engagement {
                comment_count: 0,
                read_count: 10,
                like_count: 0,
                collect_count: 0,
                share_count: 7,
            }
        );
    }

    #[test]
    fn update_never_moves_updated_at_backward() {
        let committed = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().unwrap();
        let mut article = Article::from_new(1, sample("a"), committed);
        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().unwrap();

        let mut changed = sample("a");
        changed.title = "Changed".into();
        article.apply_update(changed, earlier);

        assert_eq!(article.title, "Changed");
        assert_eq!(article.created_at, committed);
        assert_eq!(article.updated_at, committed);
    }
}
