//! Buffered, chunked writes into a [`Sink`].
//!
//! Rows are buffered per logical table and deduplicated on the table's unique
//! key (last write wins) so one `INSERT .. ON CONFLICT` never touches the same
//! row twice. A flush writes each table in chunks sized to stay under the
//! sink's bind-parameter cap. Media rows are buffered against their owner's
//! natural key and resolved to real ids once the owners have been written.

use anyhow::Result;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::sink::{
    GameVariantKey, GameVariantRow, IdentitySnapshot, MediaOwner, MediaOwnerKind, MediaRow,
    NewSource, NewTitle, Sink, TitleSourceKey, TitleSourceRow, TitleTouch, TitleUpsert,
};
use crate::errors::IngestError;

/// Postgres bind-parameter ceiling per statement.
pub const PARAM_HARD_CAP: usize = 65_535;
pub const DEFAULT_MAX_PARAMS: usize = 65_000;
pub const DEFAULT_BUFFER_SIZE: usize = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Rows buffered in any single table before an automatic flush.
    pub buffer_size: usize,
    pub max_params: usize,
    pub dry_run: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_params: DEFAULT_MAX_PARAMS,
            dry_run: false,
        }
    }
}

impl WriterConfig {
    /// Rows per statement for a table with `columns` bound columns.
    pub fn rows_per_chunk(&self, columns: usize) -> usize {
        let params = self.max_params.clamp(1, PARAM_HARD_CAP);
        (params / columns.max(1)).max(1)
    }
}

/// Owner of a media row before the owner's id is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingOwner {
    TitleSource(TitleSourceKey),
    GameVariant(GameVariantKey),
    Resolved(MediaOwner),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMedia {
    pub owner: PendingOwner,
    pub url: String,
    pub metadata: Value,
}

/// A row destined for one logical table.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferedRow {
    /// A provider's own observation: upserted.
    TitleSource(TitleSourceRow),
    /// A cross-reference back-fill: inserted only when absent.
    Link(TitleSourceRow),
    GameVariant(GameVariantRow),
    Media(PendingMedia),
    Touch(TitleTouch),
}

/// Outcome of one or more flushes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub rows_written: u64,
    pub rows_failed: u64,
    pub chunks_failed: u64,
    /// Media whose owner never got an id (its owner's chunk failed).
    pub media_unresolved: u64,
    /// Rows dropped because the writer runs dry.
    pub rows_discarded: u64,
}

impl FlushReport {
    pub fn merge(&mut self, other: &FlushReport) {
        self.rows_written += other.rows_written;
        self.rows_failed += other.rows_failed;
        self.chunks_failed += other.chunks_failed;
        self.media_unresolved += other.media_unresolved;
        self.rows_discarded += other.rows_discarded;
    }

    /// True when every buffered row reached the sink (or was discarded by a dry run).
    pub fn is_clean(&self) -> bool {
        self.rows_failed == 0 && self.chunks_failed == 0 && self.media_unresolved == 0
    }
}

/// The only component allowed to talk to the sink.
pub struct BatchWriter {
    sink: Arc<dyn Sink>,
    config: WriterConfig,
    title_sources: IndexMap<TitleSourceKey, TitleSourceRow>,
    links: IndexMap<TitleSourceKey, TitleSourceRow>,
    game_variants: IndexMap<GameVariantKey, GameVariantRow>,
    media: IndexMap<(PendingOwner, String), PendingMedia>,
    touches: IndexMap<i64, TitleTouch>,
    // dry-run bookkeeping: ids handed out without touching the sink
    dry_sources: HashMap<String, i64>,
    dry_titles: HashMap<String, TitleUpsert>,
    next_dry_id: i64,
    totals: FlushReport,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn Sink>, config: WriterConfig) -> Self {
        Self {
            sink,
            config,
            title_sources: IndexMap::new(),
            links: IndexMap::new(),
            game_variants: IndexMap::new(),
            media: IndexMap::new(),
            touches: IndexMap::new(),
            dry_sources: HashMap::new(),
            dry_titles: HashMap::new(),
            next_dry_id: 0,
            totals: FlushReport::default(),
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Accumulated report over every flush so far.
    pub fn totals(&self) -> &FlushReport {
        &self.totals
    }

    pub fn buffered_rows(&self) -> usize {
        self.title_sources.len()
            + self.links.len()
            + self.game_variants.len()
            + self.media.len()
            + self.touches.len()
    }

    fn buffer_full(&self) -> bool {
        let limit = self.config.buffer_size.max(1);
        self.title_sources.len() >= limit
            || self.links.len() >= limit
            || self.game_variants.len() >= limit
            || self.media.len() >= limit
            || self.touches.len() >= limit
    }

    fn allocate_dry_id(&mut self) -> i64 {
        self.next_dry_id -= 1;
        self.next_dry_id
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        self.sink.ensure_schema().await
    }

    pub async fn load_identity_snapshot(&self) -> Result<IdentitySnapshot> {
        self.sink.load_identity_snapshot().await
    }

    /// Write-through get-or-insert of a provider registry row.
    pub async fn ensure_source(&mut self, source: &NewSource) -> Result<i64> {
        if self.config.dry_run {
            if let Some(id) = self.dry_sources.get(&source.provider_key) {
                return Ok(*id);
            }
            let id = self.allocate_dry_id();
            self.dry_sources.insert(source.provider_key.clone(), id);
            return Ok(id);
        }
        self.sink.ensure_source(source).await
    }

    /// Write-through Product + Title creation. Titles are written immediately so
    /// the buffered rows that point at them always have a parent.
    pub async fn create_title(&mut self, title: &NewTitle) -> Result<TitleUpsert> {
        if self.config.dry_run {
            if let Some(existing) = self.dry_titles.get(&title.normalized_key) {
                return Ok(TitleUpsert {
                    created: false,
                    ..*existing
                });
            }
            let product_id = self.allocate_dry_id();
            let title_id = self.allocate_dry_id();
            let upsert = TitleUpsert {
                title_id,
                product_id,
                created: true,
            };
            self.dry_titles.insert(title.normalized_key.clone(), upsert);
            return Ok(upsert);
        }
        self.sink.create_title(title).await
    }

    fn push(&mut self, row: BufferedRow) {
        match row {
            BufferedRow::TitleSource(r) => {
                self.title_sources.insert(r.key(), r);
            }
            BufferedRow::Link(r) => {
                // first link wins within a buffer too
                self.links.entry(r.key()).or_insert(r);
            }
            BufferedRow::GameVariant(r) => {
                self.game_variants.insert(r.key(), r);
            }
            BufferedRow::Media(m) => {
                self.media.insert((m.owner.clone(), m.url.clone()), m);
            }
            BufferedRow::Touch(t) => {
                let entry = self.touches.entry(t.title_id).or_insert(TitleTouch {
                    title_id: t.title_id,
                    synopsis: None,
                });
                if longer(&t.synopsis, &entry.synopsis) {
                    entry.synopsis = t.synopsis;
                }
            }
        }
    }

    /// Buffer rows; flushes automatically once any table reaches the buffer
    /// size and returns that flush's report.
    pub async fn enqueue(
        &mut self,
        rows: impl IntoIterator<Item = BufferedRow>,
    ) -> Option<FlushReport> {
        for row in rows {
            self.push(row);
        }
        if self.buffer_full() {
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Write everything buffered. Chunk failures are logged and counted; the
    /// remaining chunks are still attempted.
    pub async fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        let title_sources: Vec<TitleSourceRow> =
            std::mem::take(&mut self.title_sources).into_values().collect();
        let mut links: IndexMap<TitleSourceKey, TitleSourceRow> = std::mem::take(&mut self.links);
        let game_variants: Vec<GameVariantRow> =
            std::mem::take(&mut self.game_variants).into_values().collect();
        let media: Vec<PendingMedia> = std::mem::take(&mut self.media).into_values().collect();
        let touches: Vec<TitleTouch> = std::mem::take(&mut self.touches).into_values().collect();

        // an observation of the same key supersedes a back-filled link
        for r in &title_sources {
            links.shift_remove(&r.key());
        }
        let links: Vec<TitleSourceRow> = links.into_values().collect();

        let total = title_sources.len() + links.len() + game_variants.len() + media.len() + touches.len();
        if total == 0 {
            return report;
        }

        if self.config.dry_run {
            report.rows_discarded = total as u64;
            debug!(rows = total, "dry run: discarding buffered rows");
            self.totals.merge(&report);
            return report;
        }

        let sink = Arc::clone(&self.sink);
        let cfg = self.config;

        let mut title_source_ids: HashMap<TitleSourceKey, i64> = HashMap::new();
        for chunk in title_sources.chunks(cfg.rows_per_chunk(TitleSourceRow::COLUMNS)) {
            if let Some(ids) = write_chunk(
                &mut report,
                "video_game_title_sources",
                chunk.len(),
                sink.upsert_title_sources(chunk),
            )
            .await
            {
                report.rows_written += ids.len() as u64;
                title_source_ids.extend(ids);
            }
        }

        for chunk in links.chunks(cfg.rows_per_chunk(TitleSourceRow::COLUMNS)) {
            if let Some(inserted) = write_chunk(
                &mut report,
                "video_game_title_sources",
                chunk.len(),
                sink.link_title_sources(chunk),
            )
            .await
            {
                report.rows_written += inserted;
            }
        }

        let mut game_variant_ids: HashMap<GameVariantKey, i64> = HashMap::new();
        for chunk in game_variants.chunks(cfg.rows_per_chunk(GameVariantRow::COLUMNS)) {
            if let Some(ids) = write_chunk(
                &mut report,
                "video_games",
                chunk.len(),
                sink.upsert_game_variants(chunk),
            )
            .await
            {
                report.rows_written += ids.len() as u64;
                game_variant_ids.extend(ids);
            }
        }

        // second pass: placeholders -> owner ids
        let mut media_rows: Vec<MediaRow> = Vec::with_capacity(media.len());
        for m in media {
            let owner = match &m.owner {
                PendingOwner::Resolved(owner) => Some(*owner),
                PendingOwner::TitleSource(key) => {
                    title_source_ids.get(key).map(|id| MediaOwner {
                        kind: MediaOwnerKind::TitleSource,
                        id: *id,
                    })
                }
                PendingOwner::GameVariant(key) => {
                    game_variant_ids.get(key).map(|id| MediaOwner {
                        kind: MediaOwnerKind::GameVariant,
                        id: *id,
                    })
                }
            };
            match owner {
                Some(owner) => media_rows.push(MediaRow {
                    owner,
                    url: m.url,
                    metadata: m.metadata,
                }),
                None => {
                    debug!(url = %m.url, owner = ?m.owner, "media owner unresolved; dropping row");
                    report.media_unresolved += 1;
                }
            }
        }
        for chunk in media_rows.chunks(cfg.rows_per_chunk(MediaRow::COLUMNS)) {
            if let Some(written) =
                write_chunk(&mut report, "media_assets", chunk.len(), sink.upsert_media(chunk)).await
            {
                report.rows_written += written;
            }
        }

        for chunk in touches.chunks(cfg.rows_per_chunk(TitleTouch::COLUMNS)) {
            if write_chunk(
                &mut report,
                "video_game_titles",
                chunk.len(),
                sink.touch_titles(chunk),
            )
            .await
            .is_some()
            {
                report.rows_written += chunk.len() as u64;
            }
        }

        info!(
            rows = total,
            written = report.rows_written,
            failed = report.rows_failed,
            chunks_failed = report.chunks_failed,
            media_unresolved = report.media_unresolved,
            "flush complete"
        );
        self.totals.merge(&report);
        report
    }
}

async fn write_chunk<T>(
    report: &mut FlushReport,
    table: &'static str,
    rows: usize,
    fut: impl Future<Output = Result<T>>,
) -> Option<T> {
    match fut.await {
        Ok(v) => Some(v),
        Err(e) => {
            let err = IngestError::ChunkWrite {
                table,
                rows,
                message: format!("{e:#}"),
            };
            error!(table, chunk_rows = rows, error = %err, "chunk write failed; continuing with remaining chunks");
            report.rows_failed += rows as u64;
            report.chunks_failed += 1;
            None
        }
    }
}

fn longer(candidate: &Option<String>, current: &Option<String>) -> bool {
    match (candidate, current) {
        (Some(c), Some(cur)) => c.len() > cur.len(),
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemorySink;
    use serde_json::json;

    async fn setup(config: WriterConfig) -> (Arc<MemorySink>, BatchWriter, i64, i64) {
        let sink = Arc::new(MemorySink::new());
        let mut writer = BatchWriter::new(sink.clone(), config);
        let source_id = writer
            .ensure_source(&NewSource {
                provider_key: "x".into(),
                name: "Provider X".into(),
                base_url: None,
            })
            .await
            .unwrap();
        let title = writer
            .create_title(&NewTitle {
                normalized_key: "foo".into(),
                slug: "foo-0beec7b5".into(),
                name: "Foo".into(),
                synopsis: None,
            })
            .await
            .unwrap();
        (sink, writer, source_id, title.title_id)
    }

    fn ts_row(title_id: i64, source_id: i64, item: &str, name: &str) -> TitleSourceRow {
        TitleSourceRow {
            title_id,
            source_id,
            provider_item_id: item.to_string(),
            external_id: item.parse().ok(),
            name: name.to_string(),
            platforms: vec!["PC".into()],
            raw_payload: json!({ "id": item }),
        }
    }

    fn gv_row(title_id: i64, external_id: &str, rating: Option<f64>) -> GameVariantRow {
        GameVariantRow {
            title_id,
            provider: "x".into(),
            external_id: external_id.to_string(),
            name: "Foo".into(),
            rating,
            release_date: None,
            attributes: json!({}),
        }
    }

    #[test]
    fn chunk_size_respects_param_cap() {
        let cfg = WriterConfig {
            buffer_size: 10,
            max_params: 1_000_000,
            dry_run: false,
        };
        assert_eq!(cfg.rows_per_chunk(7), PARAM_HARD_CAP / 7);
        let tiny = WriterConfig {
            max_params: 3,
            ..cfg
        };
        assert_eq!(tiny.rows_per_chunk(7), 1);
        assert_eq!(tiny.rows_per_chunk(2), 1);
    }

    #[tokio::test]
    async fn dedupes_within_buffer_last_write_wins() {
        let (sink, mut writer, source_id, title_id) = setup(WriterConfig::default()).await;
        writer
            .enqueue([
                BufferedRow::TitleSource(ts_row(title_id, source_id, "1", "Foo")),
                BufferedRow::TitleSource(ts_row(title_id, source_id, "1", "Foo (renamed)")),
            ])
            .await;
        assert_eq!(writer.buffered_rows(), 1);
        let report = writer.flush().await;
        assert!(report.is_clean());
        assert_eq!(sink.title_source(source_id, "1").unwrap().row.name, "Foo (renamed)");
    }

    #[tokio::test]
    async fn flushes_in_chunks_and_is_idempotent() {
        let cfg = WriterConfig {
            buffer_size: 1_000,
            max_params: 14, // two rows per chunk
            dry_run: false,
        };
        let (sink, mut writer, source_id, title_id) = setup(cfg).await;
        let rows: Vec<BufferedRow> = (1..=5)
            .map(|i| BufferedRow::GameVariant(gv_row(title_id, &i.to_string(), Some(i as f64))))
            .collect();
        writer.enqueue(rows.clone()).await;
        let first = writer.flush().await;
        assert_eq!(first.rows_written, 5);
        writer.enqueue(rows).await;
        writer.flush().await;
        let counts = sink.counts().await.unwrap();
        assert_eq!(counts.game_variants, 5);
        assert_eq!(sink.game_variant("x", "3").unwrap().row.rating, Some(3.0));
        assert!(source_id > 0);
    }

    #[tokio::test]
    async fn auto_flushes_when_buffer_fills() {
        let cfg = WriterConfig {
            buffer_size: 2,
            ..WriterConfig::default()
        };
        let (sink, mut writer, source_id, title_id) = setup(cfg).await;
        let none = writer
            .enqueue([BufferedRow::TitleSource(ts_row(title_id, source_id, "1", "Foo"))])
            .await;
        assert!(none.is_none());
        let flushed = writer
            .enqueue([BufferedRow::TitleSource(ts_row(title_id, source_id, "2", "Foo"))])
            .await
            .expect("buffer full triggers flush");
        assert_eq!(flushed.rows_written, 2);
        assert_eq!(writer.buffered_rows(), 0);
        assert_eq!(sink.counts().await.unwrap().title_sources, 2);
    }

    #[tokio::test]
    async fn media_placeholders_resolve_after_owner_flush() {
        let (sink, mut writer, source_id, title_id) = setup(WriterConfig::default()).await;
        let ts = ts_row(title_id, source_id, "1", "Foo");
        let gv = gv_row(title_id, "1", None);
        writer
            .enqueue([
                BufferedRow::Media(PendingMedia {
                    owner: PendingOwner::TitleSource(ts.key()),
                    url: "https://img/cover.jpg".into(),
                    metadata: json!({}),
                }),
                BufferedRow::Media(PendingMedia {
                    owner: PendingOwner::GameVariant(gv.key()),
                    url: "https://vid/trailer.mp4".into(),
                    metadata: json!({ "kind": "trailer" }),
                }),
                BufferedRow::TitleSource(ts),
                BufferedRow::GameVariant(gv),
            ])
            .await;
        let report = writer.flush().await;
        assert!(report.is_clean());

        let ts_id = sink.title_source(source_id, "1").unwrap().id;
        let gv_id = sink.game_variant("x", "1").unwrap().id;
        let images = sink
            .media_for_owner(MediaOwner {
                kind: MediaOwnerKind::TitleSource,
                id: ts_id,
            })
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, "https://img/cover.jpg");
        let videos = sink
            .media_for_owner(MediaOwner {
                kind: MediaOwnerKind::GameVariant,
                id: gv_id,
            })
            .await
            .unwrap();
        assert_eq!(videos.len(), 1);
    }

    #[tokio::test]
    async fn failed_chunk_does_not_block_remaining_chunks() {
        let cfg = WriterConfig {
            buffer_size: 1_000,
            max_params: 14,
            dry_run: false,
        };
        let (sink, mut writer, _source_id, title_id) = setup(cfg).await;
        writer
            .enqueue((1..=6).map(|i| BufferedRow::GameVariant(gv_row(title_id, &i.to_string(), None))))
            .await;
        sink.fail_next_writes(1);
        let report = writer.flush().await;
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.rows_failed, 2);
        assert_eq!(report.rows_written, 4);
        assert!(!report.is_clean());
        assert_eq!(sink.counts().await.unwrap().game_variants, 4);
        assert_eq!(writer.totals().chunks_failed, 1);
    }

    #[tokio::test]
    async fn media_of_failed_owner_is_counted_unresolved() {
        let (sink, mut writer, source_id, title_id) = setup(WriterConfig::default()).await;
        let ts = ts_row(title_id, source_id, "1", "Foo");
        writer
            .enqueue([
                BufferedRow::Media(PendingMedia {
                    owner: PendingOwner::TitleSource(ts.key()),
                    url: "https://img/a.jpg".into(),
                    metadata: json!({}),
                }),
                BufferedRow::TitleSource(ts),
            ])
            .await;
        sink.fail_next_writes(1);
        let report = writer.flush().await;
        assert_eq!(report.media_unresolved, 1);
        assert_eq!(sink.counts().await.unwrap().media_assets, 0);
    }

    #[tokio::test]
    async fn observation_supersedes_link_for_same_key() {
        let (sink, mut writer, source_id, title_id) = setup(WriterConfig::default()).await;
        writer
            .enqueue([
                BufferedRow::Link(ts_row(title_id, source_id, "9", "linked")),
                BufferedRow::TitleSource(ts_row(title_id, source_id, "9", "observed")),
            ])
            .await;
        writer.flush().await;
        assert_eq!(sink.title_source(source_id, "9").unwrap().row.name, "observed");
        assert_eq!(sink.counts().await.unwrap().title_sources, 1);
    }

    #[tokio::test]
    async fn touches_merge_to_longest_synopsis() {
        let (sink, mut writer, _source_id, title_id) = setup(WriterConfig::default()).await;
        writer
            .enqueue([
                BufferedRow::Touch(TitleTouch {
                    title_id,
                    synopsis: Some("a much longer synopsis".into()),
                }),
                BufferedRow::Touch(TitleTouch {
                    title_id,
                    synopsis: Some("short".into()),
                }),
            ])
            .await;
        writer.flush().await;
        let title = sink.title_by_key("foo").unwrap();
        let product = sink.product(title.product_id).unwrap();
        assert_eq!(product.synopsis.as_deref(), Some("a much longer synopsis"));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let cfg = WriterConfig {
            dry_run: true,
            ..WriterConfig::default()
        };
        let (sink, mut writer, source_id, title_id) = setup(cfg).await;
        assert!(source_id < 0);
        assert!(title_id < 0);
        writer
            .enqueue([
                BufferedRow::TitleSource(ts_row(title_id, source_id, "1", "Foo")),
                BufferedRow::GameVariant(gv_row(title_id, "1", None)),
            ])
            .await;
        let report = writer.flush().await;
        assert_eq!(report.rows_discarded, 2);
        assert_eq!(report.rows_written, 0);
        assert_eq!(sink.counts().await.unwrap(), Default::default());
    }
}
