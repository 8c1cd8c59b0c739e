use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::evaluation::compare::FieldVerdict;
use crate::evaluation::score::DocumentScore;
use crate::util::{ensure_directory, now_utc_string};

const STORE_SCHEMA_VERSION: &str = "2";

/// A stored score with the SHA-256 of the label it was scored against.
/// Rows written before hashes were recorded carry `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredScore {
    pub score: DocumentScore,
    pub label_sha256: Option<String>,
}

/// Scored (variant, document) pairs persisted across runs so an interrupted
/// benchmark can resume and `report` can rebuild results without
/// re-extracting.
pub struct ScoreStore {
    connection: Connection,
}

impl ScoreStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            ensure_directory(parent)?;
        }

        let connection = Connection::open(path)
            .with_context(|| format!("failed to open score store: {}", path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;

        Ok(Self { connection })
    }

    pub fn upsert(&self, score: &DocumentScore, label_sha256: &str, run_id: &str) -> Result<()> {
        let verdicts = serde_json::to_string(&score.verdicts)
            .context("failed to serialize field verdicts")?;

        self.connection
            .execute(
                "
                INSERT INTO document_scores (
                  variant_id, document_id, fully_correct, accepted, duration_ns,
                  llm_duration_ns, failure, verdicts_json, label_sha256, run_id, scored_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(variant_id, document_id) DO UPDATE SET
                  fully_correct = excluded.fully_correct,
                  accepted = excluded.accepted,
                  duration_ns = excluded.duration_ns,
                  llm_duration_ns = excluded.llm_duration_ns,
                  failure = excluded.failure,
                  verdicts_json = excluded.verdicts_json,
                  label_sha256 = excluded.label_sha256,
                  run_id = excluded.run_id,
                  scored_at = excluded.scored_at
                ",
                params![
                    score.variant_id,
                    score.document_id,
                    score.fully_correct,
                    score.accepted,
                    duration_to_nanos(score.duration),
                    score.llm_duration.map(duration_to_nanos),
                    score.failure,
                    verdicts,
                    label_sha256,
                    run_id,
                    now_utc_string(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to store score for variant {} document {}",
                    score.variant_id, score.document_id
                )
            })?;

        Ok(())
    }

    /// Stored scores ordered by variant then document.
    pub fn load_scores(&self) -> Result<Vec<DocumentScore>> {
        Ok(self
            .load_stored()?
            .into_iter()
            .map(|stored| stored.score)
            .collect())
    }

    /// Like `load_scores`, keeping the label hash of every row.
    pub fn load_stored(&self) -> Result<Vec<StoredScore>> {
        let mut statement = self.connection.prepare(
            "
            SELECT variant_id, document_id, fully_correct, accepted, duration_ns,
                   llm_duration_ns, failure, verdicts_json, label_sha256
            FROM document_scores
            ORDER BY variant_id, document_id
            ",
        )?;

        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut scores = Vec::new();
        for row in rows {
            let (
                variant_id,
                document_id,
                fully_correct,
                accepted,
                duration_ns,
                llm_duration_ns,
                failure,
                verdicts_json,
                label_sha256,
            ) = row.context("failed to read stored score row")?;

            let verdicts: Vec<FieldVerdict> = serde_json::from_str(&verdicts_json).with_context(|| {
                format!("failed to parse stored verdicts for variant {variant_id} document {document_id}")
            })?;

            scores.push(StoredScore {
                score: DocumentScore {
                    variant_id,
                    document_id,
                    verdicts,
                    fully_correct,
                    accepted,
                    duration: nanos_to_duration(duration_ns),
                    llm_duration: llm_duration_ns.map(nanos_to_duration),
                    failure,
                },
                label_sha256,
            });
        }

        Ok(scores)
    }

    /// Drops stored scores of `variants` so a fresh run does not mix with an
    /// earlier one.
    pub fn clear_variants(&self, variants: &[String]) -> Result<usize> {
        let mut removed = 0;
        for variant_id in variants {
            removed += self
                .connection
                .execute(
                    "DELETE FROM document_scores WHERE variant_id = ?1",
                    params![variant_id],
                )
                .with_context(|| format!("failed to clear stored scores for {variant_id}"))?;
        }
        Ok(removed)
    }

    pub fn schema_version(&self) -> Result<Option<String>> {
        let version = self
            .connection
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS document_scores (
              variant_id TEXT NOT NULL,
              document_id TEXT NOT NULL,
              fully_correct INTEGER NOT NULL,
              accepted INTEGER NOT NULL,
              duration_ns INTEGER NOT NULL,
              llm_duration_ns INTEGER,
              failure TEXT,
              verdicts_json TEXT NOT NULL,
              label_sha256 TEXT,
              run_id TEXT NOT NULL,
              scored_at TEXT NOT NULL,
              PRIMARY KEY (variant_id, document_id)
            );
            ",
        )
        .context("failed to create score store schema")?;

    let has_label_hash = connection
        .prepare("SELECT 1 FROM pragma_table_info('document_scores') WHERE name = 'label_sha256'")?
        .exists([])?;
    if !has_label_hash {
        connection
            .execute("ALTER TABLE document_scores ADD COLUMN label_sha256 TEXT", [])
            .context("failed to add label_sha256 to score store")?;
    }

    connection
        .execute(
            "
            INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![STORE_SCHEMA_VERSION],
        )
        .context("failed to record score store schema version")?;

    Ok(())
}

fn duration_to_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn nanos_to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(0))
}
