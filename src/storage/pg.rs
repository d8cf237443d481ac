//! Postgres-backed relay storage.
//!
//! Events land in a single `event` table indexed by kind/author/time with
//! tags as `jsonb`; sponsor keys, the event registry and pending log
//! descriptions each get a small side table. Reads go through the reader
//! pool, writes through the writer pool.

use super::{api::Result, crypt, StorageApi};
use crate::{
    constants::KIND_TX_LOG,
    error::StorageError,
    nostr::tag_value,
    types::{Event, Sponsor},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nostr::{Event as NostrEvent, Filter};
use serde_json::json;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};

/// [`StorageApi`] implementation over Postgres.
#[derive(Debug)]
pub struct PgStorage {
    writer: PgPool,
    reader: PgPool,
    secret: String,
}

impl PgStorage {
    /// Creates a storage handle over existing writer and reader pools.
    pub fn new(writer: PgPool, reader: PgPool, secret: impl Into<String>) -> Self {
        Self { writer, reader, secret: secret.into() }
    }
}

fn row_to_event(row: &PgRow) -> Result<NostrEvent> {
    let tags: serde_json::Value = row.try_get("tags")?;
    let event = json!({
        "id": row.try_get::<String, _>("id")?,
        "pubkey": row.try_get::<String, _>("pubkey")?,
        "created_at": row.try_get::<i64, _>("created_at")?,
        "kind": row.try_get::<i32, _>("kind")?,
        "tags": tags,
        "content": row.try_get::<String, _>("content")?,
        "sig": row.try_get::<String, _>("sig")?,
    });
    serde_json::from_value(event).map_err(StorageError::from)
}

fn event_tags_json(event: &NostrEvent) -> serde_json::Value {
    json!(event.tags.iter().map(|tag| tag.as_slice()).collect::<Vec<_>>())
}

const SELECT_EVENT: &str = "SELECT id, pubkey, created_at, kind, tags, content, sig FROM event";

/// Appends the WHERE clauses for a NIP-01 filter.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    qb.push(" WHERE true");

    if let Some(ids) = &filter.ids {
        let ids: Vec<String> = ids.iter().map(|id| id.to_hex()).collect();
        qb.push(" AND id = ANY(").push_bind(ids).push(")");
    }

    if let Some(authors) = &filter.authors {
        let authors: Vec<String> = authors.iter().map(|pk| pk.to_hex()).collect();
        qb.push(" AND pubkey = ANY(").push_bind(authors).push(")");
    }

    if let Some(kinds) = &filter.kinds {
        let kinds: Vec<i32> = kinds.iter().map(|k| k.as_u16() as i32).collect();
        qb.push(" AND kind = ANY(").push_bind(kinds).push(")");
    }

    if let Some(since) = filter.since {
        qb.push(" AND created_at >= ").push_bind(since.as_u64() as i64);
    }

    if let Some(until) = filter.until {
        qb.push(" AND created_at <= ").push_bind(until.as_u64() as i64);
    }

    for (tag, values) in &filter.generic_tags {
        let values: Vec<String> = values.iter().map(ToString::to_string).collect();
        qb.push(
            " AND EXISTS (SELECT 1 FROM jsonb_array_elements(tags) AS tag WHERE tag->>0 = ",
        )
        .push_bind(tag.to_string())
        .push(" AND tag->>1 = ANY(")
        .push_bind(values)
        .push("))");
    }
}

#[async_trait]
impl StorageApi for PgStorage {
    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS event(
                id text NOT NULL PRIMARY KEY,
                pubkey text NOT NULL,
                created_at bigint NOT NULL,
                kind integer NOT NULL,
                tags jsonb NOT NULL DEFAULT '[]',
                content text NOT NULL DEFAULT '',
                sig text NOT NULL
            );
            CREATE INDEX IF NOT EXISTS event_kind_idx ON event(kind);
            CREATE INDEX IF NOT EXISTS event_pubkey_idx ON event(pubkey);
            CREATE INDEX IF NOT EXISTS event_created_at_idx ON event(created_at DESC);
            CREATE INDEX IF NOT EXISTS event_tags_idx ON event USING gin(tags);

            CREATE TABLE IF NOT EXISTS t_sponsors(
                contract text NOT NULL PRIMARY KEY,
                pk text NOT NULL,
                created_at timestamptz NOT NULL DEFAULT current_timestamp,
                updated_at timestamptz NOT NULL DEFAULT current_timestamp
            );

            CREATE TABLE IF NOT EXISTS t_events(
                chain_id text NOT NULL,
                contract text NOT NULL,
                topic text NOT NULL,
                alias text NOT NULL DEFAULT '',
                event_signature text NOT NULL,
                name text NOT NULL DEFAULT '',
                created_at timestamptz NOT NULL DEFAULT current_timestamp,
                updated_at timestamptz NOT NULL DEFAULT current_timestamp,
                PRIMARY KEY (chain_id, contract, topic)
            );

            CREATE TABLE IF NOT EXISTS t_data(
                hash text NOT NULL PRIMARY KEY,
                data jsonb NOT NULL,
                created_at timestamptz NOT NULL DEFAULT current_timestamp
            );
            "#,
        )
        .execute(&self.writer)
        .await?;

        Ok(())
    }

    async fn save_event(&self, event: &NostrEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event(id, pubkey, created_at, kind, tags, content, sig)
            VALUES($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id.to_hex())
        .bind(event.pubkey.to_hex())
        .bind(event.created_at.as_u64() as i64)
        .bind(event.kind.as_u16() as i32)
        .bind(event_tags_json(event))
        .bind(&event.content)
        .bind(event.sig.to_string())
        .execute(&self.writer)
        .await?;

        Ok(())
    }

    async fn save_replaceable_event(&self, event: &NostrEvent) -> Result<()> {
        let d = tag_value(event, "d").unwrap_or_default().to_string();

        sqlx::query(
            r#"
            DELETE FROM event
            WHERE kind = $1 AND pubkey = $2
            AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(tags) AS tag
                WHERE tag->>0 = 'd' AND tag->>1 = $3
            )
            "#,
        )
        .bind(event.kind.as_u16() as i32)
        .bind(event.pubkey.to_hex())
        .bind(d)
        .execute(&self.writer)
        .await?;

        self.save_event(event).await
    }

    async fn query_events(&self, filter: Filter) -> Result<Vec<NostrEvent>> {
        let mut qb = QueryBuilder::new(SELECT_EVENT);
        push_filter(&mut qb, &filter);
        qb.push(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.reader).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn count_events(&self, filter: Filter) -> Result<usize> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) AS count FROM event");
        push_filter(&mut qb, &filter);

        let row = qb.build().fetch_one(&self.reader).await?;
        Ok(row.try_get::<i64, _>("count")? as usize)
    }

    async fn delete_event(&self, event_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM event WHERE id = $1")
            .bind(event_id)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    async fn get_log_event(&self, chain_id: &str, hash: &str) -> Result<Option<NostrEvent>> {
        let row = sqlx::query(&format!(
            r#"
            {SELECT_EVENT}
            WHERE kind = $1
            AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(tags) AS tag
                WHERE tag->>0 = 't' AND tag->>1 = $2
            )
            AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(tags) AS tag
                WHERE tag->>0 = 'd' AND tag->>1 = $3
            )
            LIMIT 1
            "#
        ))
        .bind(KIND_TX_LOG as i32)
        .bind(chain_id)
        .bind(hash)
        .fetch_optional(&self.reader)
        .await?;

        row.as_ref().map(row_to_event).transpose()
    }

    async fn list_log_events(
        &self,
        contract: &str,
        topic: &str,
        max_created_at: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NostrEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            {SELECT_EVENT}
            WHERE kind = $1
            AND created_at <= $2
            AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(tags) AS tag
                WHERE tag->>0 = 'p' AND tag->>1 = $3
            )
            AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(tags) AS tag
                WHERE tag->>0 = 'topic' AND tag->>1 = $4
            )
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(KIND_TX_LOG as i32)
        .bind(max_created_at)
        .bind(contract)
        .bind(topic)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.reader)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn get_mention_event(&self, event_id: &str) -> Result<Option<NostrEvent>> {
        let row = sqlx::query(&format!(
            r#"
            {SELECT_EVENT}
            WHERE kind = 1
            AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(tags) AS tag
                WHERE tag->>0 = 'e' AND tag->>1 = $1
            )
            AND EXISTS (
                SELECT 1 FROM jsonb_array_elements(tags) AS tag
                WHERE tag->>0 = 't' AND tag->>1 = 'mention'
            )
            LIMIT 1
            "#
        ))
        .bind(event_id)
        .fetch_optional(&self.reader)
        .await?;

        row.as_ref().map(row_to_event).transpose()
    }

    async fn get_sponsor(&self, contract: &str) -> Result<Sponsor> {
        let row = sqlx::query(
            "SELECT contract, pk, created_at, updated_at FROM t_sponsors WHERE contract = $1",
        )
        .bind(contract)
        .fetch_optional(&self.reader)
        .await?
        .ok_or(StorageError::NotFound)?;

        let encrypted: String = row.try_get("pk")?;
        Ok(Sponsor {
            contract: row.try_get("contract")?,
            private_key: crypt::decrypt(&encrypted, &self.secret)?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    async fn add_sponsor(&self, sponsor: &Sponsor) -> Result<()> {
        let encrypted = crypt::encrypt(&sponsor.private_key, &self.secret)?;
        sqlx::query(
            r#"
            INSERT INTO t_sponsors(contract, pk, created_at, updated_at)
            VALUES($1, $2, $3, $4)
            "#,
        )
        .bind(&sponsor.contract)
        .bind(encrypted)
        .bind(sponsor.created_at)
        .bind(sponsor.updated_at)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    async fn update_sponsor(&self, sponsor: &Sponsor) -> Result<()> {
        let encrypted = crypt::encrypt(&sponsor.private_key, &self.secret)?;
        sqlx::query("UPDATE t_sponsors SET pk = $1, updated_at = $2 WHERE contract = $3")
            .bind(encrypted)
            .bind(sponsor.updated_at)
            .bind(&sponsor.contract)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    async fn register_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO t_events(chain_id, contract, topic, alias, event_signature, name)
            VALUES($1, $2, $3, $4, $5, $6)
            ON CONFLICT (chain_id, contract, topic)
            DO UPDATE SET alias = $4, event_signature = $5, name = $6,
                updated_at = current_timestamp
            "#,
        )
        .bind(&event.chain_id)
        .bind(&event.contract)
        .bind(&event.topic)
        .bind(&event.alias)
        .bind(&event.event_signature)
        .bind(&event.name)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    async fn event_exists(&self, chain_id: &str, contract: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS found FROM t_events WHERE chain_id = $1 AND contract = $2 LIMIT 1",
        )
        .bind(chain_id)
        .bind(contract)
        .fetch_optional(&self.reader)
        .await?;
        Ok(row.is_some())
    }

    async fn get_event(&self, chain_id: &str, contract: &str, topic: &str) -> Result<Event> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, contract, topic, alias, event_signature, name,
                created_at, updated_at
            FROM t_events
            WHERE chain_id = $1 AND contract = $2 AND topic = $3
            "#,
        )
        .bind(chain_id)
        .bind(contract)
        .bind(topic)
        .fetch_optional(&self.reader)
        .await?
        .ok_or(StorageError::NotFound)?;

        row_to_registry_event(&row)
    }

    async fn list_events(&self, chain_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, contract, topic, alias, event_signature, name,
                created_at, updated_at
            FROM t_events
            WHERE chain_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(chain_id)
        .fetch_all(&self.reader)
        .await?;

        rows.iter().map(row_to_registry_event).collect()
    }

    async fn upsert_pending_data(&self, hash: &str, data: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO t_data(hash, data)
            VALUES($1, $2)
            ON CONFLICT (hash) DO UPDATE SET data = $2
            "#,
        )
        .bind(hash)
        .bind(data)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    async fn get_pending_data(&self, hash: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT data FROM t_data WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.reader)
            .await?;
        row.map(|row| row.try_get("data").map_err(StorageError::from)).transpose()
    }

    async fn delete_pending_data(&self, hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM t_data WHERE hash = $1")
            .bind(hash)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.reader).await?;
        Ok(())
    }
}

fn row_to_registry_event(row: &PgRow) -> Result<Event> {
    Ok(Event {
        chain_id: row.try_get("chain_id")?,
        contract: row.try_get("contract")?,
        topic: row.try_get("topic")?,
        alias: row.try_get("alias")?,
        event_signature: row.try_get("event_signature")?,
        name: row.try_get("name")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}
