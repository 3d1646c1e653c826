//! In-memory sink enforcing the same unique keys as the Postgres schema.
//!
//! Backs dry runs and tests. Write failures can be injected per chunk call.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::sink::{
    GameVariantKey, GameVariantRow, IdentitySnapshot, MediaOwner, MediaOwnerKind, MediaRecord,
    MediaRow, NewSource, NewTitle, Sink, TableCounts, TitleSourceKey, TitleSourceRecord,
    TitleSourceRow, TitleTouch, TitleUpsert,
};

#[derive(Debug, Clone)]
pub struct StoredProduct {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub synopsis: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredTitle {
    pub id: i64,
    pub product_id: i64,
    pub slug: String,
    pub name: String,
    pub normalized_key: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredTitleSource {
    pub id: i64,
    pub row: TitleSourceRow,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredGameVariant {
    pub id: i64,
    pub row: GameVariantRow,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub id: i64,
    pub metadata: Value,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    products: IndexMap<String, StoredProduct>,
    titles: IndexMap<String, StoredTitle>,
    sources: IndexMap<String, (i64, NewSource)>,
    title_sources: IndexMap<TitleSourceKey, StoredTitleSource>,
    game_variants: IndexMap<GameVariantKey, StoredGameVariant>,
    media: IndexMap<(MediaOwnerKind, i64, String), StoredMedia>,
}

impl MemoryState {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn source_key_by_id(&self, source_id: i64) -> Option<&str> {
        self.sources
            .iter()
            .find(|(_, (id, _))| *id == source_id)
            .map(|(k, _)| k.as_str())
    }

    fn title_exists(&self, title_id: i64) -> bool {
        self.titles.values().any(|t| t.id == title_id)
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
    failing_writes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` row-level write calls fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self, table: &str) -> Result<()> {
        let took = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if took.is_ok() {
            bail!("injected write failure on {table}");
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory sink state poisoned"))
    }

    pub fn title_by_key(&self, key: &str) -> Option<StoredTitle> {
        self.lock().ok()?.titles.get(key).cloned()
    }

    pub fn product(&self, product_id: i64) -> Option<StoredProduct> {
        self.lock()
            .ok()?
            .products
            .values()
            .find(|p| p.id == product_id)
            .cloned()
    }

    pub fn title_source(&self, source_id: i64, provider_item_id: &str) -> Option<StoredTitleSource> {
        self.lock()
            .ok()?
            .title_sources
            .get(&(source_id, provider_item_id.to_string()))
            .cloned()
    }

    pub fn game_variant(&self, provider: &str, external_id: &str) -> Option<StoredGameVariant> {
        self.lock()
            .ok()?
            .game_variants
            .get(&(provider.to_string(), external_id.to_string()))
            .cloned()
    }

    pub fn source_id(&self, provider_key: &str) -> Option<i64> {
        self.lock().ok()?.sources.get(provider_key).map(|(id, _)| *id)
    }

    pub fn media(&self) -> Vec<MediaRecord> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        state
            .media
            .iter()
            .map(|((kind, owner_id, url), m)| MediaRecord {
                id: m.id,
                owner: MediaOwner {
                    kind: *kind,
                    id: *owner_id,
                },
                url: url.clone(),
                metadata: m.metadata.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn load_identity_snapshot(&self) -> Result<IdentitySnapshot> {
        let state = self.lock()?;
        let mut snapshot = IdentitySnapshot::default();
        for (key, title) in &state.titles {
            snapshot.titles_by_key.insert(key.clone(), title.id);
        }
        for ((source_id, item_id), ts) in &state.title_sources {
            if let Some(provider_key) = state.source_key_by_id(*source_id) {
                snapshot
                    .titles_by_item
                    .insert((provider_key.to_string(), item_id.clone()), ts.row.title_id);
            }
        }
        for (key, gv) in &state.game_variants {
            snapshot
                .titles_by_item
                .entry(key.clone())
                .or_insert(gv.row.title_id);
        }
        Ok(snapshot)
    }

    async fn ensure_source(&self, source: &NewSource) -> Result<i64> {
        let mut state = self.lock()?;
        if let Some((id, _)) = state.sources.get(&source.provider_key) {
            return Ok(*id);
        }
        let id = state.allocate();
        state
            .sources
            .insert(source.provider_key.clone(), (id, source.clone()));
        Ok(id)
    }

    async fn create_title(&self, title: &NewTitle) -> Result<TitleUpsert> {
        let mut state = self.lock()?;
        if let Some(existing) = state.titles.get(&title.normalized_key) {
            return Ok(TitleUpsert {
                title_id: existing.id,
                product_id: existing.product_id,
                created: false,
            });
        }
        let existing_product = state.products.get(&title.slug).map(|p| p.id);
        let product_id = match existing_product {
            Some(id) => id,
            None => {
                let id = state.allocate();
                state.products.insert(
                    title.slug.clone(),
                    StoredProduct {
                        id,
                        slug: title.slug.clone(),
                        name: title.name.clone(),
                        synopsis: title.synopsis.clone(),
                    },
                );
                id
            }
        };
        let title_id = state.allocate();
        state.titles.insert(
            title.normalized_key.clone(),
            StoredTitle {
                id: title_id,
                product_id,
                slug: title.slug.clone(),
                name: title.name.clone(),
                normalized_key: title.normalized_key.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(TitleUpsert {
            title_id,
            product_id,
            created: true,
        })
    }

    async fn upsert_title_sources(
        &self,
        rows: &[TitleSourceRow],
    ) -> Result<Vec<(TitleSourceKey, i64)>> {
        self.check_write("video_game_title_sources")?;
        let mut state = self.lock()?;
        for row in rows {
            if !state.title_exists(row.title_id) {
                bail!("foreign key violation: title {} missing", row.title_id);
            }
        }
        let now = Utc::now();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.key();
            if let Some(existing) = state.title_sources.get_mut(&key) {
                existing.row.name = row.name.clone();
                existing.row.platforms = row.platforms.clone();
                existing.row.raw_payload = row.raw_payload.clone();
                existing.updated_at = now;
                out.push((key, existing.id));
                continue;
            }
            let id = state.allocate();
            state.title_sources.insert(
                key.clone(),
                StoredTitleSource {
                    id,
                    row: row.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            out.push((key, id));
        }
        Ok(out)
    }

    async fn link_title_sources(&self, rows: &[TitleSourceRow]) -> Result<u64> {
        self.check_write("video_game_title_sources")?;
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut inserted = 0u64;
        for row in rows {
            let key = row.key();
            if state.title_sources.contains_key(&key) {
                continue;
            }
            let id = state.allocate();
            state.title_sources.insert(
                key,
                StoredTitleSource {
                    id,
                    row: row.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn upsert_game_variants(
        &self,
        rows: &[GameVariantRow],
    ) -> Result<Vec<(GameVariantKey, i64)>> {
        self.check_write("video_games")?;
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.key();
            if let Some(existing) = state.game_variants.get_mut(&key) {
                existing.row.name = row.name.clone();
                existing.row.rating = row.rating;
                existing.row.release_date = row.release_date;
                existing.row.attributes = row.attributes.clone();
                existing.updated_at = now;
                out.push((key, existing.id));
                continue;
            }
            let id = state.allocate();
            state.game_variants.insert(
                key.clone(),
                StoredGameVariant {
                    id,
                    row: row.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            out.push((key, id));
        }
        Ok(out)
    }

    async fn upsert_media(&self, rows: &[MediaRow]) -> Result<u64> {
        self.check_write("media_assets")?;
        let mut state = self.lock()?;
        let mut written = 0u64;
        for row in rows {
            let key = row.key();
            if let Some(existing) = state.media.get_mut(&key) {
                existing.metadata = row.metadata.clone();
            } else {
                let id = state.allocate();
                state.media.insert(
                    key,
                    StoredMedia {
                        id,
                        metadata: row.metadata.clone(),
                    },
                );
            }
            written += 1;
        }
        Ok(written)
    }

    async fn touch_titles(&self, rows: &[TitleTouch]) -> Result<u64> {
        self.check_write("video_game_titles")?;
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut product_synopsis: HashMap<i64, String> = HashMap::new();
        let mut touched = 0u64;
        for touch in rows {
            let Some(title) = state.titles.values_mut().find(|t| t.id == touch.title_id) else {
                continue;
            };
            title.updated_at = now;
            touched += 1;
            if let Some(s) = &touch.synopsis {
                product_synopsis.insert(title.product_id, s.clone());
            }
        }
        for (product_id, synopsis) in product_synopsis {
            if let Some(p) = state.products.values_mut().find(|p| p.id == product_id) {
                let current = p.synopsis.as_deref().map(str::len).unwrap_or(0);
                if synopsis.len() > current {
                    p.synopsis = Some(synopsis);
                }
            }
        }
        Ok(touched)
    }

    async fn counts(&self) -> Result<TableCounts> {
        let state = self.lock()?;
        Ok(TableCounts {
            products: state.products.len() as i64,
            titles: state.titles.len() as i64,
            sources: state.sources.len() as i64,
            title_sources: state.title_sources.len() as i64,
            game_variants: state.game_variants.len() as i64,
            media_assets: state.media.len() as i64,
        })
    }

    async fn sources_for_title(&self, title_id: i64) -> Result<Vec<TitleSourceRecord>> {
        let state = self.lock()?;
        let mut out = Vec::new();
        for ((source_id, item_id), ts) in &state.title_sources {
            if ts.row.title_id != title_id {
                continue;
            }
            let provider_key = state
                .source_key_by_id(*source_id)
                .unwrap_or_default()
                .to_string();
            out.push(TitleSourceRecord {
                id: ts.id,
                title_id,
                provider_key,
                provider_item_id: item_id.clone(),
                name: ts.row.name.clone(),
                platforms: ts.row.platforms.clone(),
            });
        }
        Ok(out)
    }

    async fn media_for_owner(&self, owner: MediaOwner) -> Result<Vec<MediaRecord>> {
        Ok(self
            .media()
            .into_iter()
            .filter(|m| m.owner == owner)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_title(key: &str) -> NewTitle {
        NewTitle {
            normalized_key: key.to_string(),
            slug: format!("{key}-slug"),
            name: key.to_string(),
            synopsis: None,
        }
    }

    #[tokio::test]
    async fn create_title_returns_existing_on_conflict() {
        let sink = MemorySink::new();
        let a = sink.create_title(&new_title("foo")).await.unwrap();
        let b = sink.create_title(&new_title("foo")).await.unwrap();
        assert!(a.created);
        assert!(!b.created);
        assert_eq!(a.title_id, b.title_id);
        assert_eq!(sink.counts().await.unwrap().titles, 1);
        assert_eq!(sink.counts().await.unwrap().products, 1);
    }

    #[tokio::test]
    async fn upsert_preserves_creation_timestamp() {
        let sink = MemorySink::new();
        let t = sink.create_title(&new_title("foo")).await.unwrap();
        let row = TitleSourceRow {
            title_id: t.title_id,
            source_id: 1,
            provider_item_id: "1".into(),
            external_id: Some(1),
            name: "Foo".into(),
            platforms: vec![],
            raw_payload: json!({}),
        };
        sink.upsert_title_sources(&[row.clone()]).await.unwrap();
        let first = sink.title_source(1, "1").unwrap();
        let mut renamed = row;
        renamed.name = "Foo Renamed".into();
        sink.upsert_title_sources(&[renamed]).await.unwrap();
        let second = sink.title_source(1, "1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.row.name, "Foo Renamed");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_per_call() {
        let sink = MemorySink::new();
        sink.fail_next_writes(1);
        assert!(sink.upsert_media(&[]).await.is_err());
        assert!(sink.upsert_media(&[]).await.is_ok());
    }
}
