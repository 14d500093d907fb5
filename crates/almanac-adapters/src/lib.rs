//! Feed wire contract, lenient decoder and record normalizer.
//!
//! The upstream feed is not trustworthy: nested objects arrive as `null`,
//! `{}`, `[]` or strings depending on the feed variant, counters arrive as
//! numbers or numeric strings, and one container key is misspelled
//! (`interation_info`, with `commet_num` inside). Decoding never fails on a
//! single field; only unusable top-level JSON fails a batch.

use std::collections::HashMap;
use std::str::FromStr;

use almanac_core::{Engagement, NewArticle};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "almanac-adapters";

/// Width of the `articles.external_id` column.
pub const MAX_EXTERNAL_ID_CHARS: usize = 100;

/// Wire format of `publish_time`.
pub const PUBLISH_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("feed response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feed response top-level value is not an object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("feed item has no external id")]
    MissingExternalId,
    #[error("feed item {external_id} has unparseable publish_time {raw:?}")]
    UnparseablePublishTime { external_id: String, raw: String },
    #[error("feed item id is {chars} chars, limit is {}", MAX_EXTERNAL_ID_CHARS)]
    OversizedExternalId { chars: usize },
}

#[derive(Debug, Error)]
#[error("unknown time zone {0:?}")]
pub struct UnknownTimeZone(pub String);

/// Zone in which upstream wall-clock timestamps are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedTimeZone {
    /// The process's configured local zone.
    #[default]
    Local,
    Named(Tz),
}

impl FromStr for FeedTimeZone {
    type Err = UnknownTimeZone;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }
        s.parse::<Tz>()
            .map(Self::Named)
            .map_err(|_| UnknownTimeZone(s.to_string()))
    }
}

impl FeedTimeZone {
    /// Resolves a wall-clock time in this zone. Nonexistent local times (DST
    /// gaps) yield `None`; ambiguous ones resolve to the earlier instant.
    pub fn resolve(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Self::Local => Local
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Named(tz) => tz
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    pub fn parse_publish_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(raw.trim(), PUBLISH_TIME_FORMAT).ok()?;
        self.resolve(&naive)
    }

    /// UTC bounds `[start, end)` of one calendar day in this zone.
    pub fn day_bounds(&self, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.start_of_day(date)?;
        let end = self.start_of_day(date.succ_opt()?)?;
        Some((start, end))
    }

    /// First instant of `date`. Where local midnight falls in a DST gap this
    /// is the first wall-clock minute after the gap.
    fn start_of_day(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        (0..24 * 60)
            .map(|minute| midnight + chrono::Duration::minutes(minute))
            .find_map(|naive| self.resolve(&naive))
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Nested objects: anything that is not a JSON object collapses to the default.
fn lenient_object<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(deserializer)?;
    if !value.is_object() {
        return Ok(T::default());
    }
    Ok(T::deserialize(value).unwrap_or_default())
}

fn scalar_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(scalar_string(&value))
}

fn lenient_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    let count = match &value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        JsonValue::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    Ok(count)
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PicInfo {
    #[serde(default, deserialize_with = "lenient_strings")]
    pub big_img: Vec<String>,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub small_img: Vec<String>,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub three_img: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub ext: HashMap<String, String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub share_img: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub img_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LinkInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    pub share_url: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub short_url: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub org_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MediaInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    pub chl_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub chl_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub icon: String,
}

/// Interaction counters. Upstream spells the comment counter `commet_num`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InteractionInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    pub comment_id: String,
    #[serde(rename = "commet_num", alias = "comment_num", default, deserialize_with = "lenient_count")]
    pub comment_num: i64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub read_num: i64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub like_num: i64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub collect_num: i64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub share_num: i64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub share_wechat_num: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Category {
    #[serde(default, deserialize_with = "lenient_string")]
    pub cate1_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cate1_en_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cate1_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cate2_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cate2_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PubInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    pub source: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sub_source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ShareInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    pub share_title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub share_subtitle: String,
}

/// One untrusted feed item as received from upstream.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedItem {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub articletype: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub short_title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub publish_time: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub update_time: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub desc: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub long_summary: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_address: String,
    #[serde(default, deserialize_with = "lenient_object")]
    pub pic_info: PicInfo,
    #[serde(default, deserialize_with = "lenient_object")]
    pub link_info: LinkInfo,
    #[serde(default, deserialize_with = "lenient_object")]
    pub media_info: MediaInfo,
    #[serde(rename = "interation_info", alias = "interaction_info", default, deserialize_with = "lenient_object")]
    pub interaction: InteractionInfo,
    #[serde(default, deserialize_with = "lenient_object")]
    pub category: Category,
    #[serde(default, deserialize_with = "lenient_object")]
    pub pub_info: PubInfo,
    #[serde(default, deserialize_with = "lenient_object")]
    pub share_info: ShareInfo,
}

/// Structured view of one feed response, in feed order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFeed {
    pub timestamp: String,
    pub trace_id: String,
    pub items: Vec<FeedItem>,
    /// `data` entries that could not be read as an item at all.
    pub malformed: usize,
}

pub fn decode_feed(bytes: &[u8]) -> Result<DecodedFeed, DecodeError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let JsonValue::Object(mut envelope) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let timestamp = envelope.get("timestamp").map(scalar_string).unwrap_or_default();
    let trace_id = envelope.get("trace_id").map(scalar_string).unwrap_or_default();
    let entries = match envelope.remove("data") {
        Some(JsonValue::Array(entries)) => entries,
        _ => Vec::new(),
    };

    let mut items = Vec::with_capacity(entries.len());
    let mut malformed = 0usize;
    for (index, entry) in entries.into_iter().enumerate() {
        if !entry.is_object() {
            debug!(index, "feed entry is not an object");
            malformed += 1;
            continue;
        }
        match serde_json::from_value::<FeedItem>(entry) {
            Ok(item) => items.push(item),
            Err(err) => {
                debug!(index, error = %err, "feed entry could not be decoded");
                malformed += 1;
            }
        }
    }

    Ok(DecodedFeed {
        timestamp,
        trace_id,
        items,
        malformed,
    })
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// Maps one feed item into the canonical record, or says why it is unusable.
pub fn normalize_item(item: &FeedItem, tz: &FeedTimeZone) -> Result<NewArticle, SkipReason> {
    let external_id = non_empty(&item.id).ok_or(SkipReason::MissingExternalId)?;
    let id_chars = external_id.chars().count();
    if id_chars > MAX_EXTERNAL_ID_CHARS {
        return Err(SkipReason::OversizedExternalId { chars: id_chars });
    }
    let published_at = tz.parse_publish_time(&item.publish_time).ok_or_else(|| {
        SkipReason::UnparseablePublishTime {
            external_id: external_id.to_string(),
            raw: item.publish_time.clone(),
        }
    })?;

    let source_url = item.link_info.url.trim().to_string();
    let canonical_link = non_empty(&item.link_info.org_url)
        .map(ToString::to_string)
        .unwrap_or_else(|| source_url.clone());
    let body_summary = non_empty(&item.desc)
        .or_else(|| non_empty(&item.long_summary))
        .map(ToString::to_string);
    let cover_image_url = item
        .pic_info
        .big_img
        .first()
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let counters = &item.interaction;

    Ok(NewArticle {
        external_id: external_id.to_string(),
        title: item.title.trim().to_string(),
        author: item.media_info.chl_name.trim().to_string(),
        source_url,
        canonical_link,
        body_summary,
        published_at,
        cover_image_url,
        engagement: Engagement::clamped(
            counters.comment_num,
            counters.read_num,
            counters.like_num,
            counters.collect_num,
            counters.share_num,
        ),
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    /// One record per `external_id`; a later feed item replaces an earlier one.
    pub records: Vec<NewArticle>,
    pub skipped: Vec<SkipReason>,
    /// Items folded into an earlier record with the same `external_id`.
    pub duplicates: usize,
}

pub fn normalize_batch(items: &[FeedItem], tz: &FeedTimeZone) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(items.len());

    for item in items {
        match normalize_item(item, tz) {
            Ok(record) => match positions.get(&record.external_id) {
                Some(&pos) => {
                    batch.records[pos] = record;
                    batch.duplicates += 1;
                }
                None => {
                    positions.insert(record.external_id.clone(), batch.records.len());
                    batch.records.push(record);
                }
            },
            Err(reason) => {
                debug!(%reason, "skipping feed item");
                batch.skipped.push(reason);
            }
        }
    }

    batch
}
