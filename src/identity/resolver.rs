//! Maps provider observations onto canonical Titles.

use anyhow::Result;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument, warn};

use super::cache::{IdentityCache, LinkOutcome};
use crate::database_ops::sink::{NewSource, NewTitle, TitleSourceRow};
use crate::database_ops::writer::{BatchWriter, BufferedRow};
use crate::errors::IngestError;
use crate::normalization::{normalize, slug_for_key};

/// Key for records whose name normalizes to nothing. Normalized keys never
/// contain `:`, so these cannot collide with real ones.
pub fn synthetic_key(provider: &str, external_id: &str) -> String {
    format!("synthetic:{provider}:{external_id}")
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub provider: &'a str,
    pub external_id: &'a str,
    pub raw_name: Option<&'a str>,
    pub platform: Option<&'a str>,
    /// Carried onto a newly created Product.
    pub synopsis: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// (provider, external id) was already linked.
    Existing,
    /// Another record with the same normalized key owns the Title.
    Key,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub title_id: i64,
    pub created: bool,
    pub matched: MatchKind,
    /// None on the fast path, where the name is never normalized.
    pub key: Option<String>,
}

pub struct IdentityResolver {
    cache: IdentityCache,
    source_ids: HashMap<String, i64>,
}

impl IdentityResolver {
    pub fn new(cache: IdentityCache) -> Self {
        Self {
            cache,
            source_ids: HashMap::new(),
        }
    }

    /// Seed the cache with a single bulk read through the writer.
    pub async fn bootstrap(writer: &BatchWriter) -> Result<Self> {
        let snapshot = writer.load_identity_snapshot().await?;
        let cache = IdentityCache::from_snapshot(snapshot);
        debug!(
            keys = cache.len_keys(),
            items = cache.len_items(),
            "identity cache seeded"
        );
        Ok(Self::new(cache))
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Register a provider with its display metadata.
    pub async fn register_source(
        &mut self,
        writer: &mut BatchWriter,
        source: &NewSource,
    ) -> Result<i64> {
        if let Some(id) = self.source_ids.get(&source.provider_key) {
            return Ok(*id);
        }
        let id = writer.ensure_source(source).await?;
        self.source_ids.insert(source.provider_key.clone(), id);
        Ok(id)
    }

    /// Source id for a provider, creating a bare registry row on first use.
    pub async fn source_id(&mut self, writer: &mut BatchWriter, provider: &str) -> Result<i64> {
        if let Some(id) = self.source_ids.get(provider) {
            return Ok(*id);
        }
        self.register_source(
            writer,
            &NewSource {
                provider_key: provider.to_string(),
                name: provider.to_string(),
                base_url: None,
            },
        )
        .await
    }

    #[instrument(skip(self, writer, req), fields(provider = req.provider, item_id = req.external_id, platform = ?req.platform))]
    pub async fn resolve(
        &mut self,
        writer: &mut BatchWriter,
        req: ResolveRequest<'_>,
    ) -> Result<Resolution> {
        if let Some(title_id) = self.cache.title_for_item(req.provider, req.external_id) {
            return Ok(Resolution {
                title_id,
                created: false,
                matched: MatchKind::Existing,
                key: None,
            });
        }

        let raw_name = req
            .raw_name
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::MissingName {
                item_id: req.external_id.to_string(),
            })?;

        let mut key = normalize(raw_name);
        if key.is_empty() {
            key = synthetic_key(req.provider, req.external_id);
            debug!(raw_name, key = %key, "name normalized to nothing; using synthetic key");
        }

        if let Some(title_id) = self.cache.title_for_key(&key) {
            self.cache
                .remember_item(req.provider, req.external_id, title_id);
            return Ok(Resolution {
                title_id,
                created: false,
                matched: MatchKind::Key,
                key: Some(key),
            });
        }

        let upsert = writer
            .create_title(&NewTitle {
                normalized_key: key.clone(),
                slug: slug_for_key(&key),
                name: raw_name.to_string(),
                synopsis: req.synopsis.map(str::to_string),
            })
            .await?;
        self.cache.remember_key(&key, upsert.title_id);
        self.cache
            .remember_item(req.provider, req.external_id, upsert.title_id);
        if upsert.created {
            debug!(title_id = upsert.title_id, key = %key, "created title");
        } else {
            debug!(title_id = upsert.title_id, key = %key, "title created concurrently; using winner");
        }
        Ok(Resolution {
            title_id: upsert.title_id,
            created: upsert.created,
            matched: if upsert.created {
                MatchKind::Created
            } else {
                MatchKind::Key
            },
            key: Some(key),
        })
    }

    /// Link rows for every other provider id the record names. The link is
    /// authoritative: the name is not consulted. A referenced item already
    /// linked to a different Title keeps its existing link.
    pub async fn backfill(
        &mut self,
        writer: &mut BatchWriter,
        origin_provider: &str,
        origin_id: &str,
        title_id: i64,
        display_name: &str,
        cross_refs: &BTreeMap<String, String>,
    ) -> Result<Vec<BufferedRow>> {
        let mut rows = Vec::new();
        for (provider, other_id) in cross_refs {
            if provider == origin_provider {
                continue;
            }
            match self.cache.remember_item(provider, other_id, title_id) {
                LinkOutcome::AlreadyLinked => continue,
                LinkOutcome::Conflict { existing } => {
                    warn!(
                        provider = %provider,
                        item_id = %other_id,
                        existing_title = existing,
                        title_id,
                        "cross-reference points at a different title; keeping existing link"
                    );
                    continue;
                }
                LinkOutcome::Inserted => {}
            }
            let source_id = self.source_id(writer, provider).await?;
            rows.push(BufferedRow::Link(TitleSourceRow {
                title_id,
                source_id,
                provider_item_id: other_id.clone(),
                external_id: other_id.parse::<i64>().ok(),
                name: display_name.to_string(),
                platforms: Vec::new(),
                raw_payload: json!({
                    "linked_from": { "provider": origin_provider, "id": origin_id }
                }),
            }));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemorySink;
    use crate::database_ops::sink::Sink;
    use crate::database_ops::writer::WriterConfig;
    use std::sync::Arc;

    fn req<'a>(provider: &'a str, id: &'a str, name: Option<&'a str>) -> ResolveRequest<'a> {
        ResolveRequest {
            provider,
            external_id: id,
            raw_name: name,
            platform: None,
            synopsis: None,
        }
    }

    async fn fresh() -> (Arc<MemorySink>, BatchWriter, IdentityResolver) {
        let sink = Arc::new(MemorySink::new());
        let writer = BatchWriter::new(sink.clone(), WriterConfig::default());
        let resolver = IdentityResolver::bootstrap(&writer).await.unwrap();
        (sink, writer, resolver)
    }

    #[tokio::test]
    async fn creates_then_matches_by_key() {
        let (sink, mut writer, mut resolver) = fresh().await;
        let a = resolver
            .resolve(&mut writer, req("x", "1", Some("Foo: Deluxe Edition")))
            .await
            .unwrap();
        assert!(a.created);
        assert_eq!(a.matched, MatchKind::Created);
        assert_eq!(a.key.as_deref(), Some("foo"));

        let b = resolver
            .resolve(&mut writer, req("y", "55", Some("FOO")))
            .await
            .unwrap();
        assert_eq!(b.title_id, a.title_id);
        assert!(!b.created);
        assert_eq!(b.matched, MatchKind::Key);
        assert_eq!(sink.counts().await.unwrap().titles, 1);
    }

    #[tokio::test]
    async fn fast_path_skips_normalization() {
        let (_sink, mut writer, mut resolver) = fresh().await;
        let a = resolver
            .resolve(&mut writer, req("x", "1", Some("Foo")))
            .await
            .unwrap();
        // a renamed record for the same provider id stays on its Title
        let b = resolver
            .resolve(&mut writer, req("x", "1", Some("Completely Different")))
            .await
            .unwrap();
        assert_eq!(b.title_id, a.title_id);
        assert_eq!(b.matched, MatchKind::Existing);
        assert!(b.key.is_none());
    }

    #[tokio::test]
    async fn fast_path_uses_seeded_snapshot() {
        let sink = Arc::new(MemorySink::new());
        {
            let mut writer = BatchWriter::new(sink.clone(), WriterConfig::default());
            let mut resolver = IdentityResolver::bootstrap(&writer).await.unwrap();
            let source_id = resolver.source_id(&mut writer, "x").await.unwrap();
            let r = resolver
                .resolve(&mut writer, req("x", "1", Some("Foo")))
                .await
                .unwrap();
            writer
                .enqueue([BufferedRow::TitleSource(TitleSourceRow {
                    title_id: r.title_id,
                    source_id,
                    provider_item_id: "1".into(),
                    external_id: Some(1),
                    name: "Foo".into(),
                    platforms: vec![],
                    raw_payload: json!({}),
                })])
                .await;
            writer.flush().await;
        }
        let writer = BatchWriter::new(sink.clone(), WriterConfig::default());
        let resolver = IdentityResolver::bootstrap(&writer).await.unwrap();
        assert!(resolver.cache().title_for_item("x", "1").is_some());
        assert!(resolver.cache().title_for_key("foo").is_some());
    }

    #[tokio::test]
    async fn empty_key_falls_back_to_synthetic() {
        let (sink, mut writer, mut resolver) = fresh().await;
        let a = resolver
            .resolve(&mut writer, req("x", "1", Some("(2019)")))
            .await
            .unwrap();
        let b = resolver
            .resolve(&mut writer, req("x", "2", Some("™")))
            .await
            .unwrap();
        assert_eq!(a.key.as_deref(), Some("synthetic:x:1"));
        assert_eq!(b.key.as_deref(), Some("synthetic:x:2"));
        assert_ne!(a.title_id, b.title_id);
        assert_eq!(sink.counts().await.unwrap().titles, 2);
    }

    #[tokio::test]
    async fn missing_name_is_a_skip() {
        let (_sink, mut writer, mut resolver) = fresh().await;
        let err = resolver
            .resolve(&mut writer, req("x", "1", Some("   ")))
            .await
            .unwrap_err();
        let ingest = err.downcast_ref::<IngestError>().unwrap();
        assert!(ingest.is_skip());
    }

    #[tokio::test]
    async fn backfill_links_without_normalizing() {
        let (sink, mut writer, mut resolver) = fresh().await;
        let a = resolver
            .resolve(&mut writer, req("x", "1", Some("Foo")))
            .await
            .unwrap();
        let refs: BTreeMap<String, String> = [
            ("y".to_string(), "900".to_string()),
            ("x".to_string(), "1".to_string()),
        ]
        .into_iter()
        .collect();
        let rows = resolver
            .backfill(&mut writer, "x", "1", a.title_id, "Foo", &refs)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        writer.enqueue(rows).await;
        assert!(writer.flush().await.is_clean());

        // provider y's own record, under any name, now lands on the linked Title
        let b = resolver
            .resolve(&mut writer, req("y", "900", Some("Bar")))
            .await
            .unwrap();
        assert_eq!(b.title_id, a.title_id);
        assert_eq!(b.matched, MatchKind::Existing);

        let sources = sink.sources_for_title(a.title_id).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].provider_key, "y");
        assert_eq!(sources[0].provider_item_id, "900");
    }

    #[tokio::test]
    async fn conflicting_backfill_keeps_first_link() {
        let (_sink, mut writer, mut resolver) = fresh().await;
        let foo = resolver
            .resolve(&mut writer, req("x", "1", Some("Foo")))
            .await
            .unwrap();
        let bar = resolver
            .resolve(&mut writer, req("x", "2", Some("Bar")))
            .await
            .unwrap();
        let refs: BTreeMap<String, String> =
            [("y".to_string(), "7".to_string())].into_iter().collect();
        let first = resolver
            .backfill(&mut writer, "x", "1", foo.title_id, "Foo", &refs)
            .await
            .unwrap();
        let second = resolver
            .backfill(&mut writer, "x", "2", bar.title_id, "Bar", &refs)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(resolver.cache().title_for_item("y", "7"), Some(foo.title_id));
    }

    #[tokio::test]
    async fn concurrent_creates_converge_on_one_title() {
        let sink = Arc::new(MemorySink::new());
        let mut writer_a = BatchWriter::new(sink.clone(), WriterConfig::default());
        let mut writer_b = BatchWriter::new(sink.clone(), WriterConfig::default());
        // both caches are seeded before either creates, like two workers at startup
        let mut resolver_a = IdentityResolver::bootstrap(&writer_a).await.unwrap();
        let mut resolver_b = IdentityResolver::bootstrap(&writer_b).await.unwrap();

        let (a, b) = tokio::join!(
            resolver_a.resolve(&mut writer_a, req("x", "1", Some("Foo"))),
            resolver_b.resolve(&mut writer_b, req("y", "2", Some("foo - deluxe edition"))),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.title_id, b.title_id);
        assert_eq!([a.created, b.created].iter().filter(|c| **c).count(), 1);
        let counts = sink.counts().await.unwrap();
        assert_eq!(counts.titles, 1);
        assert_eq!(counts.products, 1);

        // later reads from either side hit the same row
        let again = resolver_b
            .resolve(&mut writer_b, req("z", "3", Some("FOO")))
            .await
            .unwrap();
        assert_eq!(again.title_id, a.title_id);
    }
}
