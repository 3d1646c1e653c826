//! Canonical schema rows and the `Sink` seam every write goes through.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// (source_id, provider_item_id)
pub type TitleSourceKey = (i64, String);
/// (provider_key, external_id)
pub type GameVariantKey = (String, String);

/// Owner kinds a media row may hang off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaOwnerKind {
    TitleSource,
    GameVariant,
}

impl MediaOwnerKind {
    pub const ALL: [MediaOwnerKind; 2] = [MediaOwnerKind::TitleSource, MediaOwnerKind::GameVariant];

    pub fn as_str(self) -> &'static str {
        match self {
            MediaOwnerKind::TitleSource => "title_source",
            MediaOwnerKind::GameVariant => "game_variant",
        }
    }
}

impl fmt::Display for MediaOwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaOwnerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match MediaOwnerKind::ALL.iter().find(|k| k.as_str() == s) {
            Some(kind) => Ok(*kind),
            None => bail!("unknown media owner kind {s:?}"),
        }
    }
}

/// Resolved media owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaOwner {
    pub kind: MediaOwnerKind,
    pub id: i64,
}

#[derive(Debug, Clone)]
pub struct NewSource {
    pub provider_key: String,
    pub name: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTitle {
    pub normalized_key: String,
    pub slug: String,
    pub name: String,
    pub synopsis: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TitleUpsert {
    pub title_id: i64,
    pub product_id: i64,
    /// false when another writer already owned the key
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleSourceRow {
    pub title_id: i64,
    pub source_id: i64,
    pub provider_item_id: String,
    pub external_id: Option<i64>,
    pub name: String,
    pub platforms: Vec<String>,
    pub raw_payload: Value,
}

impl TitleSourceRow {
    pub const COLUMNS: usize = 7;

    pub fn key(&self) -> TitleSourceKey {
        (self.source_id, self.provider_item_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameVariantRow {
    pub title_id: i64,
    pub provider: String,
    pub external_id: String,
    pub name: String,
    pub rating: Option<f64>,
    pub release_date: Option<NaiveDate>,
    pub attributes: Value,
}

impl GameVariantRow {
    pub const COLUMNS: usize = 7;

    pub fn key(&self) -> GameVariantKey {
        (self.provider.clone(), self.external_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRow {
    pub owner: MediaOwner,
    pub url: String,
    pub metadata: Value,
}

impl MediaRow {
    pub const COLUMNS: usize = 4;

    pub fn key(&self) -> (MediaOwnerKind, i64, String) {
        (self.owner.kind, self.owner.id, self.url.clone())
    }
}

/// Sighting of an existing Title: refreshes `updated_at` and offers a synopsis
/// that replaces the Product's only when longer.
#[derive(Debug, Clone, PartialEq)]
pub struct TitleTouch {
    pub title_id: i64,
    pub synopsis: Option<String>,
}

impl TitleTouch {
    pub const COLUMNS: usize = 2;
}

/// Bulk read used to seed the identity cache once per worker.
#[derive(Debug, Default, Clone)]
pub struct IdentitySnapshot {
    pub titles_by_key: HashMap<String, i64>,
    pub titles_by_item: HashMap<GameVariantKey, i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub products: i64,
    pub titles: i64,
    pub sources: i64,
    pub title_sources: i64,
    pub game_variants: i64,
    pub media_assets: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleSourceRecord {
    pub id: i64,
    pub title_id: i64,
    pub provider_key: String,
    pub provider_item_id: String,
    pub name: String,
    pub platforms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRecord {
    pub id: i64,
    pub owner: MediaOwner,
    pub url: String,
    pub metadata: Value,
}

/// Storage for the canonical identity graph.
///
/// Every row-level write is an idempotent upsert keyed by the table's unique
/// constraint; implementations must tolerate concurrent writers.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn ensure_schema(&self) -> Result<()>;

    async fn load_identity_snapshot(&self) -> Result<IdentitySnapshot>;

    /// Get-or-insert a provider registry row.
    async fn ensure_source(&self, source: &NewSource) -> Result<i64>;

    /// Insert Product + Title for a key; on a uniqueness conflict re-read and
    /// return the winner's ids with `created = false`.
    async fn create_title(&self, title: &NewTitle) -> Result<TitleUpsert>;

    /// Upsert provider observations, returning the id of every row.
    async fn upsert_title_sources(
        &self,
        rows: &[TitleSourceRow],
    ) -> Result<Vec<(TitleSourceKey, i64)>>;

    /// Insert-only cross-reference links; existing rows are left untouched.
    async fn link_title_sources(&self, rows: &[TitleSourceRow]) -> Result<u64>;

    async fn upsert_game_variants(
        &self,
        rows: &[GameVariantRow],
    ) -> Result<Vec<(GameVariantKey, i64)>>;

    async fn upsert_media(&self, rows: &[MediaRow]) -> Result<u64>;

    async fn touch_titles(&self, rows: &[TitleTouch]) -> Result<u64>;

    async fn counts(&self) -> Result<TableCounts>;

    async fn sources_for_title(&self, title_id: i64) -> Result<Vec<TitleSourceRecord>>;

    async fn media_for_owner(&self, owner: MediaOwner) -> Result<Vec<MediaRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_kind_round_trips_through_text() {
        for kind in MediaOwnerKind::ALL {
            assert_eq!(kind.as_str().parse::<MediaOwnerKind>().unwrap(), kind);
        }
        assert!("video_game".parse::<MediaOwnerKind>().is_err());
    }
}
