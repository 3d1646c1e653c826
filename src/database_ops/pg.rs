use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    types::Json,
    PgPool, Postgres, QueryBuilder, Row,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::sink::{
    GameVariantKey, GameVariantRow, IdentitySnapshot, MediaOwner, MediaOwnerKind, MediaRecord,
    MediaRow, NewSource, NewTitle, Sink, TableCounts, TitleSourceKey, TitleSourceRecord,
    TitleSourceRow, TitleTouch, TitleUpsert,
};
use crate::errors::IngestError;
use crate::util::env::env_flag;

/// Connectivity failures become [`IngestError::SinkUnavailable`]; anything
/// else keeps the sqlx error under `what`.
fn sink_error(err: sqlx::Error, what: &'static str) -> anyhow::Error {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => IngestError::SinkUnavailable {
            message: format!("{what}: {err}"),
        }
        .into(),
        other => anyhow::Error::new(other).context(what),
    }
}

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .map_err(|e| IngestError::MissingConfig {
                key: format!("DATABASE_URL ({e})"),
            })?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let fast_ingest = env_flag("FAST_INGEST", false);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if fast_ingest {
                        // Best-effort; ignore errors to avoid blocking startup in restricted envs
                        let _ = sqlx::query("SET synchronous_commit = 'off'")
                            .execute(&mut *conn)
                            .await;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await
            .map_err(|e| IngestError::SinkUnavailable {
                message: e.to_string(),
            })?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS products (
  id          bigserial PRIMARY KEY,
  slug        text NOT NULL UNIQUE,
  name        text NOT NULL,
  synopsis    text,
  created_at  timestamptz NOT NULL DEFAULT now(),
  updated_at  timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS video_game_titles (
  id              bigserial PRIMARY KEY,
  product_id      bigint NOT NULL REFERENCES products(id),
  slug            text NOT NULL UNIQUE,
  name            text NOT NULL,
  normalized_key  text NOT NULL UNIQUE,
  created_at      timestamptz NOT NULL DEFAULT now(),
  updated_at      timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS video_game_sources (
  id            bigserial PRIMARY KEY,
  provider_key  text NOT NULL UNIQUE,
  name          text NOT NULL,
  base_url      text,
  created_at    timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS video_game_title_sources (
  id                    bigserial PRIMARY KEY,
  video_game_title_id   bigint NOT NULL REFERENCES video_game_titles(id),
  video_game_source_id  bigint NOT NULL REFERENCES video_game_sources(id),
  provider_item_id      text NOT NULL,
  external_id           bigint,
  name                  text NOT NULL,
  platforms             text[] NOT NULL DEFAULT '{}',
  raw_payload           jsonb NOT NULL DEFAULT '{}'::jsonb,
  created_at            timestamptz NOT NULL DEFAULT now(),
  updated_at            timestamptz NOT NULL DEFAULT now(),
  UNIQUE (video_game_source_id, provider_item_id)
);

CREATE TABLE IF NOT EXISTS video_games (
  id                   bigserial PRIMARY KEY,
  video_game_title_id  bigint NOT NULL REFERENCES video_game_titles(id),
  provider             text NOT NULL,
  external_id          text NOT NULL,
  name                 text NOT NULL,
  rating               double precision,
  release_date         date,
  attributes           jsonb NOT NULL DEFAULT '{}'::jsonb,
  created_at           timestamptz NOT NULL DEFAULT now(),
  updated_at           timestamptz NOT NULL DEFAULT now(),
  UNIQUE (provider, external_id)
);

CREATE TABLE IF NOT EXISTS media_assets (
  id          bigserial PRIMARY KEY,
  owner_type  text NOT NULL CHECK (owner_type IN ('title_source', 'game_variant')),
  owner_id    bigint NOT NULL,
  url         text NOT NULL,
  metadata    jsonb NOT NULL DEFAULT '{}'::jsonb,
  created_at  timestamptz NOT NULL DEFAULT now(),
  updated_at  timestamptz NOT NULL DEFAULT now(),
  UNIQUE (owner_type, owner_id, url)
);

CREATE INDEX IF NOT EXISTS video_game_title_sources_title_idx
  ON video_game_title_sources (video_game_title_id);
CREATE INDEX IF NOT EXISTS video_games_title_idx
  ON video_games (video_game_title_id);
"#;

/// Postgres-backed sink. All statements are unnamed (`persistent(false)`) so
/// the sink is safe behind a transaction-mode pooler.
#[derive(Clone)]
pub struct PgSink {
    db: Db,
}

#[derive(sqlx::FromRow)]
struct TitleSourceJoinRow {
    id: i64,
    video_game_title_id: i64,
    provider_key: String,
    provider_item_id: String,
    name: String,
    platforms: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct MediaAssetRow {
    id: i64,
    owner_type: String,
    owner_id: i64,
    url: String,
    metadata: Json<Value>,
}

impl PgSink {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        Ok(Self::new(Db::connect(database_url, max_connections).await?))
    }
}

#[async_trait]
impl Sink for PgSink {
    #[instrument(skip(self))]
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.db.pool)
            .await
            .context("creating canonical schema")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_identity_snapshot(&self) -> Result<IdentitySnapshot> {
        let mut snapshot = IdentitySnapshot::default();

        let mut titles = sqlx::query("SELECT id, normalized_key FROM video_game_titles")
            .persistent(false)
            .fetch(&self.db.pool);
        while let Some(row) = titles.try_next().await? {
            snapshot
                .titles_by_key
                .insert(row.get::<String, _>("normalized_key"), row.get::<i64, _>("id"));
        }
        drop(titles);

        let mut sources = sqlx::query(
            "SELECT s.provider_key, ts.provider_item_id, ts.video_game_title_id \
             FROM video_game_title_sources ts \
             JOIN video_game_sources s ON s.id = ts.video_game_source_id",
        )
        .persistent(false)
        .fetch(&self.db.pool);
        while let Some(row) = sources.try_next().await? {
            snapshot.titles_by_item.insert(
                (
                    row.get::<String, _>("provider_key"),
                    row.get::<String, _>("provider_item_id"),
                ),
                row.get::<i64, _>("video_game_title_id"),
            );
        }
        drop(sources);

        let mut variants =
            sqlx::query("SELECT provider, external_id, video_game_title_id FROM video_games")
                .persistent(false)
                .fetch(&self.db.pool);
        while let Some(row) = variants.try_next().await? {
            snapshot
                .titles_by_item
                .entry((
                    row.get::<String, _>("provider"),
                    row.get::<String, _>("external_id"),
                ))
                .or_insert(row.get::<i64, _>("video_game_title_id"));
        }

        info!(
            titles = snapshot.titles_by_key.len(),
            items = snapshot.titles_by_item.len(),
            "identity snapshot loaded"
        );
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn ensure_source(&self, source: &NewSource) -> Result<i64> {
        if let Some(r) = sqlx::query("SELECT id FROM video_game_sources WHERE provider_key = $1")
            .persistent(false)
            .bind(&source.provider_key)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(|e| sink_error(e, "looking up video_game_source"))?
        {
            return Ok(r.get::<i64, _>("id"));
        }

        // Another worker may insert between the SELECT and here; the no-op
        // update makes RETURNING yield the existing id in that case.
        let inserted = sqlx::query(
            "INSERT INTO video_game_sources (provider_key, name, base_url) VALUES ($1, $2, $3) \
             ON CONFLICT (provider_key) DO UPDATE SET provider_key = EXCLUDED.provider_key \
             RETURNING id",
        )
        .persistent(false)
        .bind(&source.provider_key)
        .bind(&source.name)
        .bind(&source.base_url)
        .fetch_one(&self.db.pool)
        .await
        .map_err(|e| sink_error(e, "inserting video_game_source"))?;
        let id = inserted.get::<i64, _>("id");
        debug!(provider_key = %source.provider_key, source_id = id, "video_game_source ensured");
        Ok(id)
    }

    #[instrument(skip(self, title), fields(key = %title.normalized_key))]
    async fn create_title(&self, title: &NewTitle) -> Result<TitleUpsert> {
        let product = sqlx::query(
            "INSERT INTO products (slug, name, synopsis) VALUES ($1, $2, $3) \
             ON CONFLICT (slug) DO UPDATE SET updated_at = now() \
             RETURNING id",
        )
        .persistent(false)
        .bind(&title.slug)
        .bind(&title.name)
        .bind(&title.synopsis)
        .fetch_one(&self.db.pool)
        .await
        .map_err(|e| sink_error(e, "upserting product"))?;
        let product_id = product.get::<i64, _>("id");

        let inserted = sqlx::query(
            "INSERT INTO video_game_titles (product_id, slug, name, normalized_key) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (normalized_key) DO NOTHING \
             RETURNING id",
        )
        .persistent(false)
        .bind(product_id)
        .bind(&title.slug)
        .bind(&title.name)
        .bind(&title.normalized_key)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(|e| sink_error(e, "inserting video_game_title"))?;

        if let Some(r) = inserted {
            return Ok(TitleUpsert {
                title_id: r.get::<i64, _>("id"),
                product_id,
                created: true,
            });
        }

        // Lost the race: re-read the winner.
        let winner = sqlx::query(
            "SELECT id, product_id FROM video_game_titles WHERE normalized_key = $1",
        )
        .persistent(false)
        .bind(&title.normalized_key)
        .fetch_one(&self.db.pool)
        .await
        .map_err(|e| sink_error(e, "re-reading title after uniqueness conflict"))?;
        debug!(key = %title.normalized_key, "title already owned by another writer");
        Ok(TitleUpsert {
            title_id: winner.get::<i64, _>("id"),
            product_id: winner.get::<i64, _>("product_id"),
            created: false,
        })
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_title_sources(
        &self,
        rows: &[TitleSourceRow],
    ) -> Result<Vec<(TitleSourceKey, i64)>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = title_source_insert(rows);
        qb.push(
            " ON CONFLICT (video_game_source_id, provider_item_id) DO UPDATE SET \
              name = EXCLUDED.name, \
              platforms = EXCLUDED.platforms, \
              raw_payload = EXCLUDED.raw_payload, \
              updated_at = now() \
              RETURNING id, video_game_source_id, provider_item_id",
        );
        let recs = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        Ok(recs
            .into_iter()
            .map(|r| {
                (
                    (
                        r.get::<i64, _>("video_game_source_id"),
                        r.get::<String, _>("provider_item_id"),
                    ),
                    r.get::<i64, _>("id"),
                )
            })
            .collect())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn link_title_sources(&self, rows: &[TitleSourceRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = title_source_insert(rows);
        qb.push(" ON CONFLICT (video_game_source_id, provider_item_id) DO NOTHING");
        let res = qb.build().persistent(false).execute(&self.db.pool).await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_game_variants(
        &self,
        rows: &[GameVariantRow],
    ) -> Result<Vec<(GameVariantKey, i64)>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO video_games (video_game_title_id, provider, external_id, name, rating, release_date, attributes) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.title_id)
                .push_bind(row.provider.clone())
                .push_bind(row.external_id.clone())
                .push_bind(row.name.clone())
                .push_bind(row.rating)
                .push_bind(row.release_date)
                .push_bind(Json(row.attributes.clone()));
        });
        qb.push(
            " ON CONFLICT (provider, external_id) DO UPDATE SET \
              name = EXCLUDED.name, \
              rating = EXCLUDED.rating, \
              release_date = EXCLUDED.release_date, \
              attributes = EXCLUDED.attributes, \
              updated_at = now() \
              RETURNING id, provider, external_id",
        );
        let recs = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        Ok(recs
            .into_iter()
            .map(|r| {
                (
                    (
                        r.get::<String, _>("provider"),
                        r.get::<String, _>("external_id"),
                    ),
                    r.get::<i64, _>("id"),
                )
            })
            .collect())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_media(&self, rows: &[MediaRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO media_assets (owner_type, owner_id, url, metadata) ");
        qb.push_values(rows, |mut b, row| {
            b.push_bind(row.owner.kind.as_str())
                .push_bind(row.owner.id)
                .push_bind(row.url.clone())
                .push_bind(Json(row.metadata.clone()));
        });
        qb.push(
            " ON CONFLICT (owner_type, owner_id, url) DO UPDATE SET \
              metadata = EXCLUDED.metadata, \
              updated_at = now()",
        );
        let res = qb.build().persistent(false).execute(&self.db.pool).await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn touch_titles(&self, rows: &[TitleTouch]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = rows.iter().map(|t| t.title_id).collect();
        let touched = sqlx::query(
            "UPDATE video_game_titles SET updated_at = now() WHERE id = ANY($1)",
        )
        .persistent(false)
        .bind(&ids)
        .execute(&self.db.pool)
        .await?
        .rows_affected();

        let with_synopsis: Vec<&TitleTouch> =
            rows.iter().filter(|t| t.synopsis.is_some()).collect();
        if !with_synopsis.is_empty() {
            // Prefer the longer synopsis; never shorten what is already stored.
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "UPDATE products p SET synopsis = v.synopsis, updated_at = now() FROM (",
            );
            qb.push_values(with_synopsis, |mut b, t| {
                b.push_bind(t.title_id)
                    .push_unseparated("::bigint")
                    .push_bind(t.synopsis.clone())
                    .push_unseparated("::text");
            });
            qb.push(
                ") AS v(title_id, synopsis) \
                 JOIN video_game_titles t ON t.id = v.title_id \
                 WHERE p.id = t.product_id \
                   AND length(v.synopsis) > coalesce(length(p.synopsis), 0)",
            );
            qb.build().persistent(false).execute(&self.db.pool).await?;
        }
        Ok(touched)
    }

    async fn counts(&self) -> Result<TableCounts> {
        let r = sqlx::query(
            "SELECT \
               (SELECT count(*) FROM products) AS products, \
               (SELECT count(*) FROM video_game_titles) AS titles, \
               (SELECT count(*) FROM video_game_sources) AS sources, \
               (SELECT count(*) FROM video_game_title_sources) AS title_sources, \
               (SELECT count(*) FROM video_games) AS game_variants, \
               (SELECT count(*) FROM media_assets) AS media_assets",
        )
        .persistent(false)
        .fetch_one(&self.db.pool)
        .await?;
        Ok(TableCounts {
            products: r.get("products"),
            titles: r.get("titles"),
            sources: r.get("sources"),
            title_sources: r.get("title_sources"),
            game_variants: r.get("game_variants"),
            media_assets: r.get("media_assets"),
        })
    }

    async fn sources_for_title(&self, title_id: i64) -> Result<Vec<TitleSourceRecord>> {
        let rows = sqlx::query_as::<_, TitleSourceJoinRow>(
            "SELECT ts.id, ts.video_game_title_id, s.provider_key, ts.provider_item_id, ts.name, ts.platforms \
             FROM video_game_title_sources ts \
             JOIN video_game_sources s ON s.id = ts.video_game_source_id \
             WHERE ts.video_game_title_id = $1 \
             ORDER BY ts.id",
        )
        .persistent(false)
        .bind(title_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TitleSourceRecord {
                id: r.id,
                title_id: r.video_game_title_id,
                provider_key: r.provider_key,
                provider_item_id: r.provider_item_id,
                name: r.name,
                platforms: r.platforms,
            })
            .collect())
    }

    async fn media_for_owner(&self, owner: MediaOwner) -> Result<Vec<MediaRecord>> {
        let rows = sqlx::query_as::<_, MediaAssetRow>(
            "SELECT id, owner_type, owner_id, url, metadata FROM media_assets \
             WHERE owner_type = $1 AND owner_id = $2 ORDER BY id",
        )
        .persistent(false)
        .bind(owner.kind.as_str())
        .bind(owner.id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(MediaRecord {
                    id: r.id,
                    owner: MediaOwner {
                        kind: r.owner_type.parse::<MediaOwnerKind>()?,
                        id: r.owner_id,
                    },
                    url: r.url,
                    metadata: r.metadata.0,
                })
            })
            .collect()
    }
}

fn title_source_insert(rows: &[TitleSourceRow]) -> QueryBuilder<'_, Postgres> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO video_game_title_sources \
         (video_game_title_id, video_game_source_id, provider_item_id, external_id, name, platforms, raw_payload) ",
    );
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.title_id)
            .push_bind(row.source_id)
            .push_bind(row.provider_item_id.clone())
            .push_bind(row.external_id)
            .push_bind(row.name.clone())
            .push_bind(row.platforms.clone())
            .push_bind(Json(row.raw_payload.clone()));
    });
    qb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_fatal_chain;

    #[test]
    fn connectivity_errors_become_sink_unavailable() {
        for err in [sqlx::Error::PoolTimedOut, sqlx::Error::PoolClosed] {
            let mapped = sink_error(err, "upserting product");
            assert!(is_fatal_chain(&mapped));
            assert!(matches!(
                mapped.downcast_ref::<IngestError>(),
                Some(IngestError::SinkUnavailable { .. })
            ));
        }
        let io = sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(is_fatal_chain(&sink_error(io, "inserting video_game_title")));
    }

    #[test]
    fn other_sqlx_errors_keep_their_context() {
        let mapped = sink_error(sqlx::Error::RowNotFound, "re-reading title");
        assert!(!is_fatal_chain(&mapped));
        assert!(format!("{mapped:#}").starts_with("re-reading title"));
    }
}
