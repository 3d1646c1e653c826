//! Per-item ingestion: fetch, resolve, buffer, flush and checkpoint.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, Cursor};
use crate::database_ops::sink::{GameVariantRow, NewSource, Sink, TitleSourceRow, TitleTouch};
use crate::database_ops::writer::{
    BatchWriter, BufferedRow, FlushReport, PendingMedia, PendingOwner, WriterConfig,
};
use crate::errors::{item_error, IngestError};
use crate::identity::{IdentityResolver, MatchKind, ResolveRequest};
use crate::partition::PartitionSpec;
use crate::records::{
    fetch_with_retry, FetchPolicy, MediaKind, ProviderRecord, RecordFetcher, WorkEntry, WorkItem,
};

/// Prefix of the single stdout line a worker prints on exit.
pub const SUMMARY_PREFIX: &str = "WORKER_SUMMARY ";

/// Lifecycle of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemState {
    Pending,
    Resolved,
    Buffered,
    Flushed,
    Skipped,
    Failed,
}

impl ItemState {
    pub fn can_transition(self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, Resolved)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Resolved, Buffered)
                | (Resolved, Failed)
                | (Buffered, Flushed)
        )
    }

    pub fn transition(self, next: ItemState) -> Result<ItemState> {
        if !self.can_transition(next) {
            bail!("invalid item transition {self:?} -> {next:?}");
        }
        Ok(next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Flushed | ItemState::Skipped | ItemState::Failed)
    }
}

/// Counters reported at the end of every run.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSummary {
    pub provider: String,
    pub partition: Option<String>,
    pub processed: u64,
    pub matched: u64,
    pub created: u64,
    pub skipped: u64,
    pub failed: u64,
    pub flushed: u64,
    pub rows_written: u64,
    pub rows_failed: u64,
    pub chunks_failed: u64,
    pub media_unresolved: u64,
    pub rows_discarded: u64,
    pub resumed_from: Option<usize>,
    pub completed: bool,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn merge(&mut self, other: &RunSummary) {
        self.processed += other.processed;
        self.matched += other.matched;
        self.created += other.created;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.flushed += other.flushed;
        self.rows_written += other.rows_written;
        self.rows_failed += other.rows_failed;
        self.chunks_failed += other.chunks_failed;
        self.media_unresolved += other.media_unresolved;
        self.rows_discarded += other.rows_discarded;
        self.elapsed_ms = self.elapsed_ms.max(other.elapsed_ms);
    }

    fn absorb_flush(&mut self, report: &FlushReport) {
        self.rows_written += report.rows_written;
        self.rows_failed += report.rows_failed;
        self.chunks_failed += report.chunks_failed;
        self.media_unresolved += report.media_unresolved;
        self.rows_discarded += report.rows_discarded;
    }

    pub fn has_write_failures(&self) -> bool {
        self.rows_failed > 0 || self.chunks_failed > 0 || self.media_unresolved > 0
    }

    pub fn summary_line(&self) -> Result<String> {
        Ok(format!("{SUMMARY_PREFIX}{}", serde_json::to_string(self)?))
    }

    pub fn parse_summary_line(line: &str) -> Option<RunSummary> {
        let body = line.trim().strip_prefix(SUMMARY_PREFIX.trim_end())?;
        serde_json::from_str(body.trim()).ok()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source: NewSource,
    pub limit: Option<usize>,
    pub resume: bool,
    pub partition: Option<PartitionSpec>,
    pub fetch_policy: FetchPolicy,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_interval: Duration,
}

impl PipelineOptions {
    pub fn new(source: NewSource) -> Self {
        Self {
            source,
            limit: None,
            resume: true,
            partition: None,
            fetch_policy: FetchPolicy::default(),
            checkpoint_dir: PathBuf::from(".checkpoints"),
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

enum ItemOutcome {
    Buffered {
        matched: MatchKind,
        rows: Vec<BufferedRow>,
    },
    Skipped,
    Failed,
}

struct PendingItem {
    index: usize,
    item_id: String,
    state: ItemState,
}

pub struct IngestionPipeline {
    writer: BatchWriter,
    resolver: IdentityResolver,
    fetcher: Option<Arc<dyn RecordFetcher>>,
    checkpoint: Option<CheckpointStore>,
    options: PipelineOptions,
    source_id: i64,
    summary: RunSummary,
    // items handled since the last flush, in order
    unflushed: Vec<PendingItem>,
    last_done: Option<Cursor>,
    writes_failed: bool,
}

impl IngestionPipeline {
    pub async fn new(
        sink: Arc<dyn Sink>,
        writer_config: WriterConfig,
        options: PipelineOptions,
        fetcher: Option<Arc<dyn RecordFetcher>>,
    ) -> Result<Self> {
        let mut writer = BatchWriter::new(sink, writer_config);
        let mut resolver = IdentityResolver::bootstrap(&writer).await?;
        let source_id = resolver.register_source(&mut writer, &options.source).await?;
        let checkpoint = (!writer_config.dry_run).then(|| {
            CheckpointStore::for_scope(
                &options.checkpoint_dir,
                &options.source.provider_key,
                options.partition,
                options.checkpoint_interval,
            )
        });
        let summary = RunSummary {
            provider: options.source.provider_key.clone(),
            partition: options.partition.map(|p| p.to_string()),
            ..RunSummary::default()
        };
        Ok(Self {
            writer,
            resolver,
            fetcher,
            checkpoint,
            options,
            source_id,
            summary,
            unflushed: Vec::new(),
            last_done: None,
            writes_failed: false,
        })
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Run over the pipeline's partition of `entries` (the whole list when
    /// unpartitioned). Per-item errors are counted; only fatal errors abort.
    pub async fn run(&mut self, entries: &[WorkEntry]) -> Result<RunSummary> {
        let started = Instant::now();
        let range = match self.options.partition {
            Some(p) => p.range(entries.len()),
            None => 0..entries.len(),
        };

        let mut resume_after: Option<usize> = None;
        if self.options.resume {
            if let Some(store) = &self.checkpoint {
                let cp = store.load()?.filter(|cp| {
                    let current = entries
                        .get(cp.cursor.index)
                        .filter(|_| range.contains(&cp.cursor.index))
                        .map(WorkEntry::label);
                    let matches = current.as_deref() == Some(cp.cursor.item_id.as_str());
                    if !matches {
                        warn!(
                            index = cp.cursor.index,
                            saved_item = %cp.cursor.item_id,
                            current_item = ?current,
                            "checkpoint does not match this work list; starting from the beginning"
                        );
                    }
                    matches
                });
                if let Some(cp) = cp {
                    info!(
                        index = cp.cursor.index,
                        item_id = %cp.cursor.item_id,
                        processed = cp.processed_count,
                        "resuming from checkpoint"
                    );
                    self.summary.processed = cp.processed_count;
                    self.summary.matched = cp.matched_count;
                    self.summary.created = cp.created_count;
                    self.summary.skipped = cp.skipped_count;
                    self.summary.failed = cp.failed_count;
                    self.summary.resumed_from = Some(cp.cursor.index);
                    resume_after = Some(cp.cursor.index);
                    self.last_done = Some(cp.cursor);
                }
            }
        }

        info!(
            provider = %self.options.source.provider_key,
            partition = ?self.options.partition.map(|p| p.to_string()),
            start = range.start,
            end = range.end,
            resume_after = ?resume_after,
            "pipeline starting"
        );

        let mut attempted = 0usize;
        let mut exhausted = true;
        for index in range {
            if resume_after.is_some_and(|after| index <= after) {
                continue;
            }
            if self.options.limit.is_some_and(|limit| attempted >= limit) {
                exhausted = false;
                info!(limit = attempted, "item limit reached");
                break;
            }
            attempted += 1;
            let entry = &entries[index];
            self.process(index, entry).await?;

            if !self.writes_failed && self.checkpoint.as_ref().is_some_and(CheckpointStore::is_due) {
                self.flush_and_checkpoint().await?;
            }
        }

        self.flush_and_checkpoint().await?;

        if exhausted && !self.writes_failed {
            if let Some(store) = &self.checkpoint {
                store.clear()?;
            }
            self.summary.completed = true;
        } else if self.writes_failed {
            warn!("write failures occurred; checkpoint left at the last fully written item");
        }

        self.summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            provider = %self.summary.provider,
            processed = self.summary.processed,
            matched = self.summary.matched,
            created = self.summary.created,
            skipped = self.summary.skipped,
            failed = self.summary.failed,
            rows_written = self.summary.rows_written,
            rows_failed = self.summary.rows_failed,
            elapsed_ms = self.summary.elapsed_ms,
            "pipeline finished"
        );
        Ok(self.summary.clone())
    }

    async fn process(&mut self, index: usize, entry: &WorkEntry) -> Result<()> {
        let label = entry.label();
        let mut state = ItemState::Pending;
        let outcome = self.process_entry(entry, &mut state).await?;
        self.summary.processed += 1;
        match outcome {
            ItemOutcome::Buffered { matched, rows } => {
                match matched {
                    MatchKind::Created => self.summary.created += 1,
                    MatchKind::Existing | MatchKind::Key => self.summary.matched += 1,
                }
                state = state.transition(ItemState::Buffered)?;
                self.unflushed.push(PendingItem {
                    index,
                    item_id: label,
                    state,
                });
                if let Some(report) = self.writer.enqueue(rows).await {
                    self.after_flush(&report)?;
                }
            }
            ItemOutcome::Skipped => {
                state = state.transition(ItemState::Skipped)?;
                self.summary.skipped += 1;
                self.mark_done(index, label, state);
            }
            ItemOutcome::Failed => {
                state = state.transition(ItemState::Failed)?;
                self.summary.failed += 1;
                self.mark_done(index, label, state);
            }
        }
        Ok(())
    }

    /// Advance the cursor past an item with no pending writes, as long as
    /// nothing earlier is still sitting in the buffer.
    fn mark_done(&mut self, index: usize, item_id: String, state: ItemState) {
        if self.unflushed.is_empty() {
            self.last_done = Some(Cursor { index, item_id });
        } else {
            self.unflushed.push(PendingItem {
                index,
                item_id,
                state,
            });
        }
    }

    async fn process_entry(
        &mut self,
        entry: &WorkEntry,
        state: &mut ItemState,
    ) -> Result<ItemOutcome> {
        let record: Cow<'_, ProviderRecord> = match entry {
            WorkEntry::Malformed { position, message } => {
                warn!(position, %message, "malformed work item");
                return Ok(ItemOutcome::Failed);
            }
            WorkEntry::Item(WorkItem::Record(record)) => Cow::Borrowed(record),
            WorkEntry::Item(WorkItem::Id(id)) => match self.fetch(id).await {
                Ok(record) => Cow::Owned(record),
                Err(e) => {
                    warn!(item_id = %id, error = %e, "record fetch failed");
                    return Ok(ItemOutcome::Failed);
                }
            },
        };

        if record.name.as_deref().map(str::trim).unwrap_or("").is_empty() {
            debug!(item_id = %record.id, "record has no name; skipping");
            return Ok(ItemOutcome::Skipped);
        }

        let provider = self.options.source.provider_key.clone();
        let resolution = match self
            .resolver
            .resolve(
                &mut self.writer,
                ResolveRequest {
                    provider: &provider,
                    external_id: &record.id,
                    raw_name: record.name.as_deref(),
                    platform: record.platforms.first().map(String::as_str),
                    synopsis: record.synopsis.as_deref(),
                },
            )
            .await
        {
            Ok(r) => r,
            Err(e) => match item_error(&e) {
                Some(ie) if ie.is_skip() => return Ok(ItemOutcome::Skipped),
                Some(_) => {
                    warn!(item_id = %record.id, error = %format!("{e:#}"), "identity resolution failed");
                    return Ok(ItemOutcome::Failed);
                }
                // sink errors end the run; the checkpoint stays where it was
                None => return Err(e.context(format!("resolving item {}", record.id))),
            },
        };
        *state = state.transition(ItemState::Resolved)?;

        let mut rows = self.rows_for(&record, resolution.title_id, resolution.created);
        match self
            .resolver
            .backfill(
                &mut self.writer,
                &provider,
                &record.id,
                resolution.title_id,
                record.name.as_deref().unwrap_or_default(),
                &record.cross_refs,
            )
            .await
        {
            Ok(links) => rows.extend(links),
            Err(e) if item_error(&e).is_some() => {
                // Resolved -> Failed
                warn!(item_id = %record.id, error = %format!("{e:#}"), "cross-reference back-fill failed");
                return Ok(ItemOutcome::Failed);
            }
            Err(e) => return Err(e.context(format!("back-filling links for item {}", record.id))),
        }

        Ok(ItemOutcome::Buffered {
            matched: resolution.matched,
            rows,
        })
    }

    async fn fetch(&self, id: &str) -> Result<ProviderRecord, IngestError> {
        let Some(fetcher) = &self.fetcher else {
            return Err(IngestError::RecordUnavailable {
                item_id: id.to_string(),
            });
        };
        fetch_with_retry(fetcher.as_ref(), id, self.options.fetch_policy).await
    }

    fn rows_for(&self, record: &ProviderRecord, title_id: i64, created: bool) -> Vec<BufferedRow> {
        let provider = &self.options.source.provider_key;
        let name = record.name.clone().unwrap_or_default();
        let title_source = TitleSourceRow {
            title_id,
            source_id: self.source_id,
            provider_item_id: record.id.clone(),
            external_id: record.numeric_id(),
            name: name.clone(),
            platforms: record.platforms.clone(),
            raw_payload: record.raw.clone(),
        };
        let variant = GameVariantRow {
            title_id,
            provider: provider.clone(),
            external_id: record.id.clone(),
            name,
            rating: record.rating,
            release_date: record.release_date,
            attributes: json!({
                "platforms": record.platforms,
                "refs": record.cross_refs,
            }),
        };

        let mut rows = Vec::with_capacity(3 + record.media.len());
        for media in &record.media {
            let owner = match media.kind {
                MediaKind::Image => PendingOwner::TitleSource(title_source.key()),
                MediaKind::Video => PendingOwner::GameVariant(variant.key()),
            };
            rows.push(BufferedRow::Media(PendingMedia {
                owner,
                url: media.url.clone(),
                metadata: media.metadata.clone(),
            }));
        }
        if !created {
            rows.push(BufferedRow::Touch(TitleTouch {
                title_id,
                synopsis: record.synopsis.clone(),
            }));
        }
        rows.push(BufferedRow::TitleSource(title_source));
        rows.push(BufferedRow::GameVariant(variant));
        rows
    }

    fn after_flush(&mut self, report: &FlushReport) -> Result<()> {
        self.summary.absorb_flush(report);
        if !report.is_clean() {
            self.writes_failed = true;
        }
        for item in self.unflushed.drain(..) {
            if !item.state.is_terminal() {
                item.state.transition(ItemState::Flushed)?;
                self.summary.flushed += 1;
            }
            self.last_done = Some(Cursor {
                index: item.index,
                item_id: item.item_id,
            });
        }
        Ok(())
    }

    async fn flush_and_checkpoint(&mut self) -> Result<()> {
        let report = self.writer.flush().await;
        self.after_flush(&report)?;
        self.save_checkpoint()
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        if self.writes_failed {
            return Ok(());
        }
        let (Some(store), Some(cursor)) = (self.checkpoint.as_mut(), self.last_done.clone()) else {
            return Ok(());
        };
        store.save(&Checkpoint {
            cursor,
            processed_count: self.summary.processed,
            matched_count: self.summary.matched,
            created_count: self.summary.created,
            skipped_count: self.summary.skipped,
            failed_count: self.summary.failed,
            timestamp: Utc::now(),
        })
    }
}
