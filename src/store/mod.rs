// Structured Store (C2, spec.md §4.2). SQLite via sqlx, runtime-checked queries
// throughout (no `query!` macro — the crate is built without a reachable database
// for compile-time query verification, so `query`/`query_as` plus explicit binds
// is the only safe style here).

pub mod models;

use crate::error::{MemoryError, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use uuid::Uuid;

pub use models::*;

/// Relational store of projects, conversations, messages, memory units and cost
/// rows. Table DDL is created inline at construction (reference convention: see
/// `CREATE TABLE IF NOT EXISTS` at store construction, no external migrations dir).
pub struct StructuredStore {
    pool: SqlitePool,
}

impl StructuredStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates all tables and the composite indexes required by §4.2:
    /// `(project_id, unit_type, created_at)` and `(conversation_id)`.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                project_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                settings TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(project_id),
                session_id TEXT,
                title TEXT,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                message_count INTEGER NOT NULL DEFAULT 0,
                token_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_units (
                unit_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                conversation_id TEXT,
                unit_type TEXT NOT NULL,
                title TEXT NOT NULL,
                summary TEXT NOT NULL,
                content TEXT NOT NULL,
                relevance_score REAL NOT NULL,
                token_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_units_project_type_created ON memory_units(project_id, unit_type, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_units_conversation ON memory_units(conversation_id)",
        )
        .execute(&self.pool)
        .await?;

        // I3: keywords need a set-containment predicate, not substring match of a
        // serialized blob. A child table with one row per (unit_id, keyword) gives
        // an indexed `keyword = ?` predicate, which is what the binary index on the
        // semi-structured column reduces to in SQLite.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_unit_keywords (
                unit_id TEXT NOT NULL REFERENCES memory_units(unit_id) ON DELETE CASCADE,
                keyword TEXT NOT NULL,
                PRIMARY KEY (unit_id, keyword)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_keywords_keyword ON memory_unit_keywords(keyword)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cost_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                operation TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                project_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.ensure_project(GLOBAL_PROJECT_ID).await?;
        Ok(())
    }

    // ---- Projects ----------------------------------------------------------

    /// Created lazily on first reference (spec.md §3).
    pub async fn ensure_project(&self, project_id: &str) -> Result<Project> {
        if let Some(existing) = self.get_project(project_id).await? {
            return Ok(existing);
        }
        let project = Project::lazy(project_id);
        sqlx::query(
            "INSERT OR IGNORE INTO projects (project_id, name, is_active, settings, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&project.project_id)
        .bind(&project.name)
        .bind(project.is_active)
        .bind(project.settings.to_string())
        .bind(project.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(project)
    }

    /// All active project ids, used by cross-project search's
    /// `include_all_projects` option (spec.md §6) before C8's permission
    /// filter narrows the set further.
    pub async fn list_project_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT project_id FROM projects WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("project_id")).collect())
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT project_id, name, is_active, settings, created_at FROM projects WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Project {
            project_id: r.get("project_id"),
            name: r.get("name"),
            is_active: r.get::<i64, _>("is_active") != 0,
            settings: serde_json::from_str(&r.get::<String, _>("settings")).unwrap_or_default(),
            created_at: from_unix(r.get("created_at")),
        }))
    }

    // ---- Conversations & messages ------------------------------------------

    pub async fn store_conversation(
        &self,
        project_id: &str,
        session_id: Option<String>,
        messages: Vec<(Role, String, DateTime<Utc>)>,
    ) -> Result<Conversation> {
        self.ensure_project(project_id).await?;

        let conversation_id = Uuid::new_v4().to_string();
        let started_at = messages
            .first()
            .map(|(_, _, ts)| *ts)
            .unwrap_or_else(Utc::now);
        let token_count: i64 = messages.iter().map(|(_, c, _)| estimate_tokens(c)).sum();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO conversations
                (conversation_id, project_id, session_id, title, started_at, ended_at, message_count, token_count, metadata)
            VALUES (?, ?, ?, NULL, ?, NULL, ?, ?, '{}')
            "#,
        )
        .bind(&conversation_id)
        .bind(project_id)
        .bind(&session_id)
        .bind(started_at.timestamp())
        .bind(messages.len() as i64)
        .bind(token_count)
        .execute(&mut *tx)
        .await?;

        for (role, content, ts) in &messages {
            let message_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO messages (message_id, conversation_id, role, content, timestamp, token_count, metadata)
                VALUES (?, ?, ?, ?, ?, ?, '{}')
                "#,
            )
            .bind(&message_id)
            .bind(&conversation_id)
            .bind(role.to_string())
            .bind(content)
            .bind(ts.timestamp())
            .bind(estimate_tokens(content))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(Conversation {
            conversation_id,
            project_id: project_id.to_string(),
            session_id,
            title: None,
            started_at,
            ended_at: None,
            message_count: messages.len() as i64,
            token_count,
            metadata: serde_json::json!({}),
        })
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, project_id, session_id, title, started_at, ended_at, message_count, token_count, metadata
            FROM conversations WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_conversation))
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT message_id, conversation_id, role, content, timestamp, token_count, metadata FROM messages WHERE conversation_id = ? ORDER BY timestamp ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_message).collect()
    }

    /// I5: ingestable once ≥1 HUMAN and ≥1 ASSISTANT message exist, or the caller
    /// passes an explicit close signal (`force`).
    pub async fn is_ingestable(&self, conversation_id: &str, force: bool) -> Result<bool> {
        if force {
            return Ok(true);
        }
        let messages = self.get_messages(conversation_id).await?;
        let has_human = messages.iter().any(|m| m.role == Role::Human);
        let has_assistant = messages.iter().any(|m| m.role == Role::Assistant);
        Ok(has_human && has_assistant)
    }

    // ---- Memory units --------------------------------------------------------

    /// Insert a memory unit row inside its own transaction. Does not touch the
    /// vector store — that coupling is the orchestrator's compensating write
    /// (spec.md §4.8), kept out of the Structured Store on purpose.
    pub async fn insert_memory_unit(&self, unit: &MemoryUnit) -> Result<()> {
        unit.validate()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO memory_units
                (unit_id, project_id, conversation_id, unit_type, title, summary, content,
                 relevance_score, token_count, created_at, updated_at, expires_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&unit.unit_id)
        .bind(&unit.project_id)
        .bind(&unit.conversation_id)
        .bind(unit.unit_type.to_string())
        .bind(&unit.title)
        .bind(&unit.summary)
        .bind(&unit.content)
        .bind(unit.relevance_score)
        .bind(unit.token_count)
        .bind(unit.created_at.timestamp())
        .bind(unit.updated_at.timestamp())
        .bind(unit.expires_at.map(|t| t.timestamp()))
        .bind(unit.is_active)
        .execute(&mut *tx)
        .await?;

        for keyword in &unit.keywords {
            sqlx::query("INSERT OR IGNORE INTO memory_unit_keywords (unit_id, keyword) VALUES (?, ?)")
                .bind(&unit.unit_id)
                .bind(keyword)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Compensation: delete a memory unit row (and its keyword rows, via cascade)
    /// after a failed vector-store upsert (spec.md §4.8 step 3).
    pub async fn delete_memory_unit(&self, unit_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM memory_units WHERE unit_id = ?")
            .bind(unit_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_memory_unit(&self, unit_id: &str) -> Result<Option<MemoryUnit>> {
        let row = sqlx::query(
            r#"
            SELECT unit_id, project_id, conversation_id, unit_type, title, summary, content,
                   relevance_score, token_count, created_at, updated_at, expires_at, is_active
            FROM memory_units WHERE unit_id = ?
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(Some(self.hydrate_unit(r).await?)),
            None => Ok(None),
        }
    }

    /// Keyword-branch recall (spec.md §4.6 Stage A keyword branch): units whose
    /// keyword set intersects `candidates`, ordered by `created_at DESC`, with a
    /// per-unit match count for scoring. Uses the containment-friendly child
    /// table (I3), never a LIKE over a serialized blob.
    pub async fn search_by_keywords(
        &self,
        project_id: &str,
        candidates: &BTreeSet<String>,
        unit_types: Option<&[UnitType]>,
        limit: usize,
        now: DateTime<Utc>,
        include_expired: bool,
    ) -> Result<Vec<(MemoryUnit, usize)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = candidates.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let type_filter = unit_types
            .map(|ts| format!(
                "AND mu.unit_type IN ({})",
                ts.iter().map(|_| "?").collect::<Vec<_>>().join(",")
            ))
            .unwrap_or_default();
        let expiry_filter = if include_expired {
            ""
        } else {
            "AND (mu.expires_at IS NULL OR mu.expires_at > ?)"
        };

        let sql = format!(
            r#"
            SELECT mu.unit_id, mu.project_id, mu.conversation_id, mu.unit_type, mu.title, mu.summary,
                   mu.content, mu.relevance_score, mu.token_count, mu.created_at, mu.updated_at,
                   mu.expires_at, mu.is_active, COUNT(k.keyword) AS match_count
            FROM memory_units mu
            JOIN memory_unit_keywords k ON k.unit_id = mu.unit_id
            WHERE mu.project_id = ? AND mu.is_active = 1 AND k.keyword IN ({placeholders}) {type_filter} {expiry_filter}
            GROUP BY mu.unit_id
            ORDER BY mu.created_at DESC
            LIMIT ?
            "#
        );

        let mut query = sqlx::query(&sql).bind(project_id);
        for k in candidates {
            query = query.bind(k);
        }
        if let Some(ts) = unit_types {
            for t in ts {
                query = query.bind(t.to_string());
            }
        }
        if !include_expired {
            query = query.bind(now.timestamp());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let match_count: i64 = row.get("match_count");
            let unit = self.row_to_unit_with_keywords(&row).await?;
            out.push((unit, match_count as usize));
        }
        Ok(out)
    }

    async fn hydrate_unit(&self, row: sqlx::sqlite::SqliteRow) -> Result<MemoryUnit> {
        self.row_to_unit_with_keywords(&row).await
    }

    async fn row_to_unit_with_keywords(&self, row: &sqlx::sqlite::SqliteRow) -> Result<MemoryUnit> {
        let unit_id: String = row.get("unit_id");
        let keywords = self.keywords_for(&unit_id).await?;
        Ok(MemoryUnit {
            unit_id,
            project_id: row.get("project_id"),
            conversation_id: row.get("conversation_id"),
            unit_type: row.get::<String, _>("unit_type").parse()?,
            title: row.get("title"),
            summary: row.get("summary"),
            content: row.get("content"),
            keywords,
            relevance_score: row.get("relevance_score"),
            token_count: row.get("token_count"),
            created_at: from_unix(row.get("created_at")),
            updated_at: from_unix(row.get("updated_at")),
            expires_at: row.get::<Option<i64>, _>("expires_at").map(from_unix),
            is_active: row.get::<i64, _>("is_active") != 0,
        })
    }

    async fn keywords_for(&self, unit_id: &str) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT keyword FROM memory_unit_keywords WHERE unit_id = ?")
            .bind(unit_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("keyword")).collect())
    }

    pub async fn record_cost(&self, record: &CostRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cost_records (provider, model, operation, input_tokens, output_tokens, cost, timestamp, project_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.provider)
        .bind(&record.model)
        .bind(&record.operation)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.cost)
        .bind(record.timestamp.timestamp())
        .bind(&record.project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<(i64, i64, i64)> {
        let projects: i64 = sqlx::query("SELECT COUNT(*) AS c FROM projects")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let conversations: i64 = sqlx::query("SELECT COUNT(*) AS c FROM conversations")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let units: i64 = sqlx::query("SELECT COUNT(*) AS c FROM memory_units WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        Ok((projects, conversations, units))
    }
}

fn row_to_conversation(r: sqlx::sqlite::SqliteRow) -> Conversation {
    Conversation {
        conversation_id: r.get("conversation_id"),
        project_id: r.get("project_id"),
        session_id: r.get("session_id"),
        title: r.get("title"),
        started_at: from_unix(r.get("started_at")),
        ended_at: r.get::<Option<i64>, _>("ended_at").map(from_unix),
        message_count: r.get("message_count"),
        token_count: r.get("token_count"),
        metadata: serde_json::from_str(&r.get::<String, _>("metadata")).unwrap_or_default(),
    }
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> Result<Message> {
    Ok(Message {
        message_id: r.get("message_id"),
        conversation_id: r.get("conversation_id"),
        role: r.get::<String, _>("role").parse()?,
        content: r.get("content"),
        timestamp: from_unix(r.get("timestamp")),
        token_count: r.get("token_count"),
        metadata: serde_json::from_str(&r.get::<String, _>("metadata")).unwrap_or_default(),
    })
}

fn from_unix(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

use crate::utils::estimate_tokens;

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> StructuredStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = StructuredStore::new(pool);
        store.run_migrations().await.unwrap();
        store
    }

    #[tokio::test]
    async fn lazy_project_creation() {
        let store = test_store().await;
        let p = store.ensure_project("proj-a").await.unwrap();
        assert_eq!(p.project_id, "proj-a");
        assert!(store.get_project("proj-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conversation_ingestability() {
        let store = test_store().await;
        let now = Utc::now();
        let conv = store
            .store_conversation(
                "proj-a",
                None,
                vec![(Role::Human, "hi".into(), now)],
            )
            .await
            .unwrap();
        assert!(!store.is_ingestable(&conv.conversation_id, false).await.unwrap());

        let conv2 = store
            .store_conversation(
                "proj-a",
                None,
                vec![
                    (Role::Human, "what is a b-tree".into(), now),
                    (Role::Assistant, "a balanced search tree".into(), now),
                ],
            )
            .await
            .unwrap();
        assert!(store.is_ingestable(&conv2.conversation_id, false).await.unwrap());
    }

    #[tokio::test]
    async fn keyword_containment_search() {
        let store = test_store().await;
        let now = Utc::now();
        let unit = MemoryUnit {
            unit_id: Uuid::new_v4().to_string(),
            project_id: "proj-a".to_string(),
            conversation_id: None,
            unit_type: UnitType::Conversation,
            title: "B-tree basics".to_string(),
            summary: "explains b-trees".to_string(),
            content: "...".to_string(),
            keywords: ["btree", "tree", "index"].iter().map(|s| s.to_string()).collect(),
            relevance_score: 0.8,
            token_count: 10,
            created_at: now,
            updated_at: now,
            expires_at: None,
            is_active: true,
        };
        store.ensure_project("proj-a").await.unwrap();
        store.insert_memory_unit(&unit).await.unwrap();

        let candidates: BTreeSet<String> = ["tree", "unrelated"].iter().map(|s| s.to_string()).collect();
        let results = store
            .search_by_keywords("proj-a", &candidates, None, 20, now, false)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, 1);
    }
}
