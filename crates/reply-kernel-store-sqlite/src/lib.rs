use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use reply_kernel_core::{
    auto_promotion_tier, Disposition, EngineConfig, EntryContent, EntryId, KnowledgeEntry,
    KnowledgePattern, MergeAction, OutcomeId, OutcomeRecord, PlannedMerge, RawConversationRecord,
    RawRecordId, ResponseCounter, SourceType, TrustTier,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS knowledge_entries (
  entry_id TEXT PRIMARY KEY,
  key TEXT NOT NULL,
  title TEXT NOT NULL,
  body TEXT NOT NULL,
  problem TEXT,
  solution TEXT,
  trust_tier TEXT NOT NULL CHECK (trust_tier IN ('verified','learned','raw')),
  confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
  source_type TEXT NOT NULL CHECK (source_type IN ('manual','conversation_extract','pattern_consolidation')),
  source_count INTEGER NOT NULL CHECK (source_count >= 1),
  usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
  success_count INTEGER NOT NULL DEFAULT 0 CHECK (success_count >= 0),
  failure_count INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
  superseded_by TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  last_accessed_at TEXT,
  expires_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_knowledge_entries_active_key
  ON knowledge_entries(key) WHERE superseded_by IS NULL AND expires_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_knowledge_entries_tier ON knowledge_entries(trust_tier);
CREATE INDEX IF NOT EXISTS idx_knowledge_entries_key ON knowledge_entries(key);

CREATE TABLE IF NOT EXISTS entry_links (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  from_entry_id TEXT NOT NULL,
  to_entry_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (from_entry_id) REFERENCES knowledge_entries(entry_id),
  FOREIGN KEY (to_entry_id) REFERENCES knowledge_entries(entry_id)
);

CREATE INDEX IF NOT EXISTS idx_entry_links_from ON entry_links(from_entry_id);
CREATE INDEX IF NOT EXISTS idx_entry_links_to ON entry_links(to_entry_id);

CREATE TABLE IF NOT EXISTS raw_conversation_records (
  record_id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL,
  problem TEXT NOT NULL,
  solution TEXT NOT NULL,
  extraction_confidence REAL NOT NULL CHECK (extraction_confidence >= 0.0 AND extraction_confidence <= 1.0),
  processed INTEGER NOT NULL DEFAULT 0,
  consolidated_into TEXT,
  similar_records_json TEXT NOT NULL,
  captured_at TEXT NOT NULL,
  FOREIGN KEY (consolidated_into) REFERENCES knowledge_entries(entry_id)
);

CREATE INDEX IF NOT EXISTS idx_raw_records_processed ON raw_conversation_records(processed);
CREATE INDEX IF NOT EXISTS idx_raw_records_conversation ON raw_conversation_records(conversation_id);

CREATE TABLE IF NOT EXISTS knowledge_patterns (
  pattern TEXT PRIMARY KEY,
  occurrence_count INTEGER NOT NULL DEFAULT 0,
  best_entry_id TEXT,
  best_confidence REAL NOT NULL DEFAULT 0.0,
  alternatives_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (best_entry_id) REFERENCES knowledge_entries(entry_id)
);

CREATE TABLE IF NOT EXISTS response_counters (
  conversation_id TEXT PRIMARY KEY,
  response_count INTEGER NOT NULL DEFAULT 0 CHECK (response_count >= 0),
  max_allowed INTEGER NOT NULL CHECK (max_allowed >= 1),
  window_start TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consolidation_lock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  holder TEXT,
  acquired_at TEXT
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS decision_outcomes (
  outcome_id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL,
  disposition TEXT NOT NULL CHECK (disposition IN ('auto_replied','escalated','suppressed')),
  category TEXT,
  entry_id TEXT,
  confidence REAL,
  reason TEXT NOT NULL,
  trace_json TEXT NOT NULL,
  helpful INTEGER,
  decided_at TEXT NOT NULL,
  FOREIGN KEY (entry_id) REFERENCES knowledge_entries(entry_id)
);

CREATE INDEX IF NOT EXISTS idx_decision_outcomes_conversation ON decision_outcomes(conversation_id);
CREATE INDEX IF NOT EXISTS idx_decision_outcomes_decided_at ON decision_outcomes(decided_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub imported_entries: usize,
    pub skipped_existing_entries: usize,
    pub imported_raw_records: usize,
    pub skipped_existing_raw_records: usize,
    pub imported_patterns: usize,
    pub skipped_existing_patterns: usize,
    pub imported_outcomes: usize,
    pub skipped_existing_outcomes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackApplication {
    pub outcome_id: OutcomeId,
    pub entry_id: Option<EntryId>,
    pub promoted_to: Option<TrustTier>,
}

const ENTRY_COLUMNS: &str = "entry_id, key, title, body, problem, solution, trust_tier, \
     confidence, source_type, source_count, usage_count, success_count, failure_count, \
     superseded_by, created_at, updated_at, last_accessed_at, expires_at";

impl SqliteStore {
    /// Open a SQLite-backed knowledge store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.conn
                .execute_batch(MIGRATION_002_SQL)
                .context("failed to apply migration v2")?;
            record_schema_version(&self.conn, 2)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "knowledge_entries")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        // Tables exist but no migration rows were recorded; infer the version
        // from what an older scaffold actually created.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "decision_outcomes")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    /// Persist one validated knowledge entry and its supersession links.
    ///
    /// # Errors
    /// Returns an error when validation fails, the active-key uniqueness
    /// constraint is violated, or any write in the transaction fails.
    pub fn insert_entry(&mut self, entry: &KnowledgeEntry, config: &EngineConfig) -> Result<()> {
        entry
            .validate(config)
            .map_err(|err| anyhow!("entry validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        // Displaced entries leave the active-key index before the replacement
        // claims it; links require the successor row, so they come last.
        mark_superseded_placeholder(&tx, &entry.supersedes)?;
        insert_entry_row(&tx, entry)?;
        set_superseded_by(&tx, entry.id, &entry.supersedes)?;
        tx.commit().context("failed to commit entry transaction")?;
        Ok(())
    }

    /// Rewrite an entry's content, confidence, and source count. Counter
    /// columns are untouched so concurrent atomic increments are never lost.
    ///
    /// # Errors
    /// Returns an error when the entry does not exist or the write fails.
    pub fn update_entry_content(
        &mut self,
        entry_id: EntryId,
        content: &EntryContent,
        confidence: f64,
        source_count: u32,
        as_of: OffsetDateTime,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE knowledge_entries
                 SET title = ?2, body = ?3, problem = ?4, solution = ?5,
                     confidence = ?6, source_count = ?7, updated_at = ?8
                 WHERE entry_id = ?1",
                params![
                    entry_id.to_string(),
                    content.title,
                    content.body,
                    content.problem,
                    content.solution,
                    confidence,
                    source_count,
                    rfc3339(as_of)?,
                ],
            )
            .context("failed to update entry content")?;

        if changed == 0 {
            return Err(anyhow!("entry not found: {entry_id}"));
        }
        Ok(())
    }

    /// Load one entry with its supersession links.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_entry(&self, entry_id: EntryId) -> Result<Option<KnowledgeEntry>> {
        load_entry(&self.conn, entry_id)
    }

    /// Load every entry, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entries(&self) -> Result<Vec<KnowledgeEntry>> {
        load_entries_where(&self.conn, "1 = 1", &[])
    }

    /// Load entries in one trust tier, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entries_by_tier(&self, tier: TrustTier) -> Result<Vec<KnowledgeEntry>> {
        load_entries_where(
            &self.conn,
            "trust_tier = ?1",
            &[&tier.as_str().to_string()],
        )
    }

    /// Case-insensitive text search over key, title, body, problem, and
    /// solution. Only active entries are returned, strongest tier first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn search_entries(&self, query: &str, as_of: OffsetDateTime) -> Result<Vec<KnowledgeEntry>> {
        let needle = format!("%{}%", escape_like(query));
        let mut entries = load_entries_where(
            &self.conn,
            "(key LIKE ?1 ESCAPE '\\' OR title LIKE ?1 ESCAPE '\\' OR body LIKE ?1 ESCAPE '\\'
              OR problem LIKE ?1 ESCAPE '\\' OR solution LIKE ?1 ESCAPE '\\')",
            &[&needle],
        )?;
        entries.retain(|entry| entry.is_active(as_of));
        entries.sort_by(|lhs, rhs| {
            rhs.trust_tier
                .rank()
                .cmp(&lhs.trust_tier.rank())
                .then_with(|| {
                    rhs.confidence
                        .partial_cmp(&lhs.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| lhs.id.cmp(&rhs.id))
        });
        Ok(entries)
    }

    /// Retire an entry: with a successor the entry is superseded, without one
    /// it is expired as of now. Either way it stops answering queries but the
    /// row survives for audit.
    ///
    /// # Errors
    /// Returns an error when the entry or successor does not exist or the
    /// write fails.
    pub fn retire_entry(
        &mut self,
        entry_id: EntryId,
        replaced_by: Option<EntryId>,
        as_of: OffsetDateTime,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        match replaced_by {
            Some(successor) => {
                if load_entry(&tx, successor)?.is_none() {
                    return Err(anyhow!("successor entry not found: {successor}"));
                }
                set_superseded_by(&tx, successor, &[entry_id])?;
            }
            None => {
                let changed = tx
                    .execute(
                        "UPDATE knowledge_entries SET expires_at = ?2, updated_at = ?2
                         WHERE entry_id = ?1",
                        params![entry_id.to_string(), rfc3339(as_of)?],
                    )
                    .context("failed to expire entry")?;
                if changed == 0 {
                    return Err(anyhow!("entry not found: {entry_id}"));
                }
            }
        }

        tx.commit().context("failed to commit retire transaction")?;
        Ok(())
    }

    /// Atomically count one automated use of an entry.
    ///
    /// # Errors
    /// Returns an error when the entry does not exist or the write fails.
    pub fn record_usage(&mut self, entry_id: EntryId, as_of: OffsetDateTime) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE knowledge_entries
                 SET usage_count = usage_count + 1, last_accessed_at = ?2
                 WHERE entry_id = ?1",
                params![entry_id.to_string(), rfc3339(as_of)?],
            )
            .context("failed to record entry usage")?;
        if changed == 0 {
            return Err(anyhow!("entry not found: {entry_id}"));
        }
        Ok(())
    }

    /// Apply one helpful/unhelpful signal to the outcome log and, when the
    /// outcome produced an automated reply, to the entry's counters. Runs the
    /// auto-promotion check inside the same transaction.
    ///
    /// # Errors
    /// Returns an error when the outcome does not exist or any write fails.
    pub fn apply_feedback(
        &mut self,
        outcome_id: OutcomeId,
        helpful: bool,
        config: &EngineConfig,
        as_of: OffsetDateTime,
    ) -> Result<FeedbackApplication> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        let outcome = load_outcome(&tx, outcome_id)?
            .ok_or_else(|| anyhow!("outcome not found: {outcome_id}"))?;

        tx.execute(
            "UPDATE decision_outcomes SET helpful = ?2 WHERE outcome_id = ?1",
            params![outcome_id.to_string(), helpful],
        )
        .context("failed to record feedback on outcome")?;

        let mut promoted_to = None;
        if let Some(entry_id) = outcome.entry_id {
            let column = if helpful { "success_count" } else { "failure_count" };
            let update = format!(
                "UPDATE knowledge_entries SET {column} = {column} + 1, updated_at = ?2
                 WHERE entry_id = ?1"
            );
            tx.execute(&update, params![entry_id.to_string(), rfc3339(as_of)?])
                .context("failed to update entry feedback counters")?;

            if let Some(entry) = load_entry(&tx, entry_id)? {
                if let Some(tier) = auto_promotion_tier(&entry, config) {
                    tx.execute(
                        "UPDATE knowledge_entries SET trust_tier = ?2 WHERE entry_id = ?1",
                        params![entry_id.to_string(), tier.as_str()],
                    )
                    .context("failed to promote entry trust tier")?;
                    promoted_to = Some(tier);
                }
            }
        }

        tx.commit().context("failed to commit feedback transaction")?;
        Ok(FeedbackApplication { outcome_id, entry_id: outcome.entry_id, promoted_to })
    }

    /// Persist one raw conversation capture for later consolidation.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn insert_raw_record(&mut self, record: &RawConversationRecord) -> Result<()> {
        record
            .validate()
            .map_err(|err| anyhow!("raw record validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO raw_conversation_records(
                    record_id, conversation_id, problem, solution, extraction_confidence,
                    processed, consolidated_into, similar_records_json, captured_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.to_string(),
                    record.conversation_id,
                    record.problem,
                    record.solution,
                    record.extraction_confidence,
                    record.processed,
                    record.consolidated_into.map(|id| id.to_string()),
                    serde_json::to_string(&record.similar_records)
                        .context("failed to serialize similar records")?,
                    rfc3339(record.captured_at)?,
                ],
            )
            .context("failed to insert raw conversation record")?;
        Ok(())
    }

    /// Load raw records still waiting for consolidation, oldest id first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_unprocessed_raw(&self) -> Result<Vec<RawConversationRecord>> {
        load_raw_where(&self.conn, "processed = 0")
    }

    /// Load every raw record, oldest id first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_raw_records(&self) -> Result<Vec<RawConversationRecord>> {
        load_raw_where(&self.conn, "1 = 1")
    }

    /// Load one pattern index row.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_pattern(&self, pattern: &str) -> Result<Option<KnowledgePattern>> {
        load_pattern(&self.conn, pattern)
    }

    /// Load the whole pattern index, label order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_patterns(&self) -> Result<Vec<KnowledgePattern>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern, occurrence_count, best_entry_id, best_confidence,
                    alternatives_json, updated_at
             FROM knowledge_patterns ORDER BY pattern ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut patterns = Vec::new();
        while let Some(row) = rows.next()? {
            patterns.push(pattern_from_row(row)?);
        }
        Ok(patterns)
    }

    /// Count one more observation of a topic, creating the pattern row on the
    /// first occurrence. A single conditional statement, safe under
    /// concurrent message handling.
    ///
    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn bump_pattern_occurrence(
        &mut self,
        pattern: &str,
        by: u64,
        as_of: OffsetDateTime,
    ) -> Result<()> {
        let by = i64::try_from(by).context("occurrence bump is out of range")?;
        self.conn
            .execute(
                "INSERT INTO knowledge_patterns(pattern, occurrence_count, best_entry_id,
                                                best_confidence, alternatives_json, updated_at)
                 VALUES (?1, ?2, NULL, 0.0, '[]', ?3)
                 ON CONFLICT(pattern) DO UPDATE SET
                    occurrence_count = occurrence_count + ?2,
                    updated_at = ?3",
                params![pattern, by, rfc3339(as_of)?],
            )
            .context("failed to bump pattern occurrence")?;
        Ok(())
    }

    /// Register a candidate entry for a pattern, honoring the best-switch
    /// margin. Returns true when the pattern's best entry changed.
    ///
    /// # Errors
    /// Returns an error when the pattern row cannot be read or written.
    pub fn record_pattern_candidate(
        &mut self,
        pattern: &str,
        entry_id: EntryId,
        confidence: f64,
        config: &EngineConfig,
        as_of: OffsetDateTime,
    ) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut row = load_pattern(&tx, pattern)?
            .unwrap_or_else(|| KnowledgePattern::new(pattern.to_string(), as_of));
        let switched =
            row.record_candidate(entry_id, confidence, config.best_switch_margin, as_of);
        save_pattern(&tx, &row)?;
        tx.commit().context("failed to commit pattern transaction")?;
        Ok(switched)
    }

    /// Conditionally count one automated reply for a conversation.
    ///
    /// One conditional UPDATE, never a read-then-write pair, so two handlers
    /// racing on duplicate webhook deliveries cannot both pass the cap.
    ///
    /// # Errors
    /// Returns an error when the counter store is unreachable; callers treat
    /// that as a throttle failure and escalate.
    pub fn try_increment_response(
        &mut self,
        conversation_id: &str,
        max_allowed: u32,
        as_of: OffsetDateTime,
    ) -> Result<bool> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO response_counters(
                    conversation_id, response_count, max_allowed, window_start
                 ) VALUES (?1, 0, ?2, ?3)",
                params![conversation_id, max_allowed, rfc3339(as_of)?],
            )
            .context("failed to seed response counter")?;

        let changed = self
            .conn
            .execute(
                "UPDATE response_counters
                 SET response_count = response_count + 1
                 WHERE conversation_id = ?1 AND response_count < max_allowed",
                params![conversation_id],
            )
            .context("failed to increment response counter")?;

        Ok(changed == 1)
    }

    /// Read a conversation's throttle state without mutating it.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn response_status(&self, conversation_id: &str) -> Result<Option<ResponseCounter>> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, response_count, max_allowed, window_start
             FROM response_counters WHERE conversation_id = ?1",
        )?;
        let counter = stmt
            .query_row(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?;

        match counter {
            Some((conversation_id, response_count, max_allowed, window_start)) => {
                Ok(Some(ResponseCounter {
                    conversation_id,
                    response_count,
                    max_allowed,
                    window_start: parse_rfc3339(&window_start)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Claim the single consolidation slot. At most one batch pass may run at
    /// a time because it mutates trust tiers and supersession links that the
    /// decision path reads.
    ///
    /// # Errors
    /// Returns an error when the claim statement fails.
    pub fn try_acquire_consolidation_lock(&mut self, holder: &str) -> Result<bool> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO consolidation_lock(id, holder, acquired_at)
                 VALUES (1, NULL, NULL)",
                [],
            )
            .context("failed to seed consolidation lock row")?;

        let changed = self
            .conn
            .execute(
                "UPDATE consolidation_lock SET holder = ?1, acquired_at = ?2
                 WHERE id = 1 AND holder IS NULL",
                params![holder, now_rfc3339()?],
            )
            .context("failed to acquire consolidation lock")?;

        Ok(changed == 1)
    }

    /// Release the consolidation slot if this holder still owns it.
    ///
    /// # Errors
    /// Returns an error when the release statement fails.
    pub fn release_consolidation_lock(&mut self, holder: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE consolidation_lock SET holder = NULL, acquired_at = NULL
                 WHERE id = 1 AND holder = ?1",
                params![holder],
            )
            .context("failed to release consolidation lock")?;
        Ok(())
    }

    /// Apply one planned merge in a single transaction: write or adopt the
    /// winning entry, supersede displaced duplicates, fold the consumed raw
    /// records into the result, and refresh the pattern index.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails; the
    /// transaction rolls back and the group stays unprocessed.
    pub fn apply_merge(
        &mut self,
        merge: &PlannedMerge,
        config: &EngineConfig,
        as_of: OffsetDateTime,
    ) -> Result<EntryId> {
        let tx = self.conn.transaction().context("failed to start merge transaction")?;

        let entry_id = match merge.action {
            MergeAction::CreateEntry => {
                let entry = KnowledgeEntry {
                    id: EntryId::new(),
                    key: merge.pattern.clone(),
                    content: merge.content.clone(),
                    trust_tier: TrustTier::Learned,
                    confidence: merge.confidence,
                    source_type: SourceType::PatternConsolidation,
                    source_count: merge.group_size.max(1),
                    usage_count: 0,
                    success_count: 0,
                    failure_count: 0,
                    supersedes: merge.supersedes.clone(),
                    superseded_by: None,
                    created_at: as_of,
                    updated_at: as_of,
                    last_accessed_at: None,
                    expires_at: None,
                };
                entry
                    .validate(config)
                    .map_err(|err| anyhow!("consolidated entry validation failed: {err}"))?;
                // Displaced duplicates leave the active-key index before the
                // replacement claims it.
                mark_superseded_placeholder(&tx, &merge.supersedes)?;
                insert_entry_row(&tx, &entry)?;
                set_superseded_by(&tx, entry.id, &merge.supersedes)?;
                entry.id
            }
            MergeAction::UpdateEntry(entry_id) => {
                let changed = tx
                    .execute(
                        "UPDATE knowledge_entries
                         SET title = ?2, body = ?3, problem = ?4, solution = ?5,
                             confidence = ?6, source_count = ?7, updated_at = ?8
                         WHERE entry_id = ?1",
                        params![
                            entry_id.to_string(),
                            merge.content.title,
                            merge.content.body,
                            merge.content.problem,
                            merge.content.solution,
                            merge.confidence,
                            merge.group_size.max(1),
                            rfc3339(as_of)?,
                        ],
                    )
                    .context("failed to update consolidated entry")?;
                if changed == 0 {
                    return Err(anyhow!("merge target entry not found: {entry_id}"));
                }
                set_superseded_by(&tx, entry_id, &merge.supersedes)?;
                entry_id
            }
            MergeAction::AdoptExisting(entry_id) => {
                let changed = tx
                    .execute(
                        "UPDATE knowledge_entries
                         SET source_count = source_count + ?2, updated_at = ?3
                         WHERE entry_id = ?1",
                        params![entry_id.to_string(), merge.group_size, rfc3339(as_of)?],
                    )
                    .context("failed to fold group into adopted entry")?;
                if changed == 0 {
                    return Err(anyhow!("merge target entry not found: {entry_id}"));
                }
                set_superseded_by(&tx, entry_id, &merge.supersedes)?;
                entry_id
            }
        };

        for record_id in &merge.consumed_raw {
            let similar: Vec<RawRecordId> = merge
                .consumed_raw
                .iter()
                .copied()
                .filter(|other| other != record_id)
                .collect();
            tx.execute(
                "UPDATE raw_conversation_records
                 SET processed = 1, consolidated_into = ?2, similar_records_json = ?3
                 WHERE record_id = ?1",
                params![
                    record_id.to_string(),
                    entry_id.to_string(),
                    serde_json::to_string(&similar)
                        .context("failed to serialize similar records")?,
                ],
            )
            .context("failed to mark raw record consolidated")?;
        }

        let mut pattern = load_pattern(&tx, &merge.pattern)?
            .unwrap_or_else(|| KnowledgePattern::new(merge.pattern.clone(), as_of));
        pattern.occurrence_count += u64::from(merge.group_size);
        match merge.action {
            MergeAction::CreateEntry | MergeAction::UpdateEntry(_) => {
                pattern.set_best(entry_id, merge.confidence, as_of);
            }
            MergeAction::AdoptExisting(_) => {
                pattern.record_candidate(
                    entry_id,
                    merge.confidence,
                    config.best_switch_margin,
                    as_of,
                );
            }
        }
        save_pattern(&tx, &pattern)?;

        tx.commit().context("failed to commit merge transaction")?;
        Ok(entry_id)
    }

    /// Persist one decision outcome row.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_outcome(&mut self, outcome: &OutcomeRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO decision_outcomes(
                    outcome_id, conversation_id, disposition, category, entry_id,
                    confidence, reason, trace_json, helpful, decided_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    outcome.id.to_string(),
                    outcome.conversation_id,
                    outcome.disposition.as_str(),
                    outcome.category,
                    outcome.entry_id.map(|id| id.to_string()),
                    outcome.confidence,
                    outcome.reason,
                    serde_json::to_string(&outcome.trace)
                        .context("failed to serialize decision trace")?,
                    outcome.helpful,
                    rfc3339(outcome.decided_at)?,
                ],
            )
            .context("failed to insert decision outcome")?;
        Ok(())
    }

    /// Load one outcome row.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_outcome(&self, outcome_id: OutcomeId) -> Result<Option<OutcomeRecord>> {
        load_outcome(&self.conn, outcome_id)
    }

    /// Load recent outcomes, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_outcomes(&self, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT outcome_id, conversation_id, disposition, category, entry_id,
                    confidence, reason, trace_json, helpful, decided_at
             FROM decision_outcomes
             ORDER BY decided_at DESC, outcome_id ASC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit])?;
        let mut outcomes = Vec::new();
        while let Some(row) = rows.next()? {
            outcomes.push(outcome_from_row(row)?);
        }
        Ok(outcomes)
    }

    /// Every entry connected to the given one through supersession links, in
    /// creation order. External admin UIs render this as the audit chain.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn supersession_chain(&self, entry_id: EntryId) -> Result<Vec<KnowledgeEntry>> {
        let mut edges: Vec<(EntryId, EntryId)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT from_entry_id, to_entry_id FROM entry_links ORDER BY id ASC")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let from: String = row.get(0)?;
                let to: String = row.get(1)?;
                edges.push((parse_entry_id(&from)?, parse_entry_id(&to)?));
            }
        }

        let mut connected = BTreeSet::new();
        let mut queue = VecDeque::from([entry_id]);
        while let Some(current) = queue.pop_front() {
            if !connected.insert(current) {
                continue;
            }
            for (from, to) in &edges {
                if *from == current && !connected.contains(to) {
                    queue.push_back(*to);
                }
                if *to == current && !connected.contains(from) {
                    queue.push_back(*from);
                }
            }
        }

        let mut chain = Vec::new();
        for id in connected {
            if let Some(entry) = load_entry(&self.conn, id)? {
                chain.push(entry);
            }
        }
        chain.sort_by(|lhs, rhs| {
            lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
        });
        Ok(chain)
    }

    /// Export all persisted state as deterministic NDJSON plus a manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or
    /// serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let entries = self.list_entries()?;
        let raw_records = self.list_raw_records()?;
        let patterns = self.list_patterns()?;
        let outcomes = self.list_outcomes(usize::MAX)?;

        let mut files = Vec::new();
        for (name, digest) in [
            ("knowledge_entries.ndjson", write_ndjson_file(&out_dir.join("knowledge_entries.ndjson"), &entries)?),
            ("raw_records.ndjson", write_ndjson_file(&out_dir.join("raw_records.ndjson"), &raw_records)?),
            ("knowledge_patterns.ndjson", write_ndjson_file(&out_dir.join("knowledge_patterns.ndjson"), &patterns)?),
            ("decision_outcomes.ndjson", write_ndjson_file(&out_dir.join("decision_outcomes.ndjson"), &outcomes)?),
        ] {
            files.push(ExportFileDigest {
                path: name.to_string(),
                sha256: digest.0,
                records: digest.1,
            });
        }

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files,
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, duplicate
    /// handling, or writes fail.
    pub fn import_snapshot(
        &mut self,
        in_dir: &Path,
        skip_existing: bool,
        config: &EngineConfig,
    ) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();

        for entry in read_ndjson_file::<KnowledgeEntry>(&in_dir.join("knowledge_entries.ndjson"))? {
            if load_entry(&self.conn, entry.id)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_entries += 1;
                    continue;
                }
                return Err(anyhow!("entry already exists: {}", entry.id));
            }
            // Supersession columns are restored verbatim; links were exported
            // on the entry rows themselves.
            let tx = self.conn.transaction().context("failed to start transaction")?;
            entry
                .validate(config)
                .map_err(|err| anyhow!("imported entry validation failed: {err}"))?;
            insert_entry_row(&tx, &entry)?;
            if let Some(superseded_by) = entry.superseded_by {
                tx.execute(
                    "UPDATE knowledge_entries SET superseded_by = ?2 WHERE entry_id = ?1",
                    params![entry.id.to_string(), superseded_by.to_string()],
                )
                .context("failed to restore superseded_by")?;
            }
            tx.commit().context("failed to commit import transaction")?;
            summary.imported_entries += 1;
        }

        for record in
            read_ndjson_file::<RawConversationRecord>(&in_dir.join("raw_records.ndjson"))?
        {
            if raw_record_exists(&self.conn, record.id)? {
                if skip_existing {
                    summary.skipped_existing_raw_records += 1;
                    continue;
                }
                return Err(anyhow!("raw record already exists: {}", record.id));
            }
            self.insert_raw_record(&record)?;
            summary.imported_raw_records += 1;
        }

        for pattern in
            read_ndjson_file::<KnowledgePattern>(&in_dir.join("knowledge_patterns.ndjson"))?
        {
            if load_pattern(&self.conn, &pattern.pattern)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_patterns += 1;
                    continue;
                }
                return Err(anyhow!("pattern already exists: {}", pattern.pattern));
            }
            save_pattern(&self.conn, &pattern)?;
            summary.imported_patterns += 1;
        }

        for outcome in
            read_ndjson_file::<OutcomeRecord>(&in_dir.join("decision_outcomes.ndjson"))?
        {
            if load_outcome(&self.conn, outcome.id)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_outcomes += 1;
                    continue;
                }
                return Err(anyhow!("outcome already exists: {}", outcome.id));
            }
            self.insert_outcome(&outcome)?;
            summary.imported_outcomes += 1;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or
    /// migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn insert_entry_row(conn: &Connection, entry: &KnowledgeEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO knowledge_entries(
            entry_id, key, title, body, problem, solution, trust_tier, confidence,
            source_type, source_count, usage_count, success_count, failure_count,
            superseded_by, created_at, updated_at, last_accessed_at, expires_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
            ?9, ?10, ?11, ?12, ?13,
            ?14, ?15, ?16, ?17, ?18
        )",
        params![
            entry.id.to_string(),
            entry.key,
            entry.content.title,
            entry.content.body,
            entry.content.problem,
            entry.content.solution,
            entry.trust_tier.as_str(),
            entry.confidence,
            entry.source_type.as_str(),
            entry.source_count,
            i64::try_from(entry.usage_count).context("usage_count out of range")?,
            i64::try_from(entry.success_count).context("success_count out of range")?,
            i64::try_from(entry.failure_count).context("failure_count out of range")?,
            entry.superseded_by.map(|id| id.to_string()),
            rfc3339(entry.created_at)?,
            rfc3339(entry.updated_at)?,
            entry.last_accessed_at.map(rfc3339).transpose()?,
            entry.expires_at.map(rfc3339).transpose()?,
        ],
    )
    .context("failed to insert knowledge entry")?;
    Ok(())
}

/// Clear the displaced entries out of the active-key unique index before the
/// successor row is inserted. `set_superseded_by` fills in the real successor
/// id right after.
fn mark_superseded_placeholder(conn: &Connection, displaced: &[EntryId]) -> Result<()> {
    let now = now_rfc3339()?;
    for target in displaced {
        conn.execute(
            "UPDATE knowledge_entries SET expires_at = ?2
             WHERE entry_id = ?1 AND superseded_by IS NULL AND expires_at IS NULL",
            params![target.to_string(), now],
        )
        .context("failed to stage displaced entry")?;
    }
    Ok(())
}

fn set_superseded_by(conn: &Connection, successor: EntryId, displaced: &[EntryId]) -> Result<()> {
    let now = now_rfc3339()?;
    for target in displaced {
        let changed = conn
            .execute(
                "UPDATE knowledge_entries SET superseded_by = ?2 WHERE entry_id = ?1",
                params![target.to_string(), successor.to_string()],
            )
            .context("failed to mark entry superseded")?;
        if changed == 0 {
            return Err(anyhow!("superseded entry not found: {target}"));
        }
        conn.execute(
            "INSERT INTO entry_links(from_entry_id, to_entry_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![successor.to_string(), target.to_string(), now],
        )
        .context("failed to insert supersession link")?;
    }
    Ok(())
}

fn load_entry(conn: &Connection, entry_id: EntryId) -> Result<Option<KnowledgeEntry>> {
    let query = format!(
        "SELECT {ENTRY_COLUMNS} FROM knowledge_entries WHERE entry_id = ?1"
    );
    let mut stmt = conn.prepare(&query)?;
    let mut rows = stmt.query(params![entry_id.to_string()])?;
    match rows.next()? {
        Some(row) => {
            let mut entry = entry_from_row(row)?;
            entry.supersedes = load_supersedes(conn, entry.id)?;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

fn load_entries_where(
    conn: &Connection,
    predicate: &str,
    bindings: &[&String],
) -> Result<Vec<KnowledgeEntry>> {
    let query = format!(
        "SELECT {ENTRY_COLUMNS} FROM knowledge_entries
         WHERE {predicate}
         ORDER BY created_at DESC, entry_id ASC"
    );
    let mut stmt = conn.prepare(&query)?;
    let binding_refs: Vec<&dyn rusqlite::ToSql> =
        bindings.iter().map(|value| *value as &dyn rusqlite::ToSql).collect();
    let mut rows = stmt.query(binding_refs.as_slice())?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(entry_from_row(row)?);
    }

    for entry in &mut entries {
        entry.supersedes = load_supersedes(conn, entry.id)?;
    }
    Ok(entries)
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<KnowledgeEntry> {
    let entry_id_raw: String = row.get(0)?;
    let trust_tier_raw: String = row.get(6)?;
    let source_type_raw: String = row.get(8)?;
    let superseded_by_raw: Option<String> = row.get(13)?;
    let last_accessed_raw: Option<String> = row.get(16)?;
    let expires_raw: Option<String> = row.get(17)?;

    Ok(KnowledgeEntry {
        id: parse_entry_id(&entry_id_raw)?,
        key: row.get(1)?,
        content: EntryContent {
            title: row.get(2)?,
            body: row.get(3)?,
            problem: row.get(4)?,
            solution: row.get(5)?,
        },
        trust_tier: TrustTier::parse(&trust_tier_raw)
            .ok_or_else(|| anyhow!("unknown trust_tier: {trust_tier_raw}"))?,
        confidence: row.get(7)?,
        source_type: SourceType::parse(&source_type_raw)
            .ok_or_else(|| anyhow!("unknown source_type: {source_type_raw}"))?,
        source_count: row.get(9)?,
        usage_count: u64_from_row(row, 10)?,
        success_count: u64_from_row(row, 11)?,
        failure_count: u64_from_row(row, 12)?,
        supersedes: Vec::new(),
        superseded_by: superseded_by_raw.as_deref().map(parse_entry_id).transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(14)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(15)?)?,
        last_accessed_at: last_accessed_raw.as_deref().map(parse_rfc3339).transpose()?,
        expires_at: expires_raw.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn load_supersedes(conn: &Connection, entry_id: EntryId) -> Result<Vec<EntryId>> {
    let mut stmt = conn.prepare(
        "SELECT to_entry_id FROM entry_links WHERE from_entry_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![entry_id.to_string()], |row| row.get::<_, String>(0))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(parse_entry_id(&row?)?);
    }
    Ok(ids)
}

fn load_raw_where(conn: &Connection, predicate: &str) -> Result<Vec<RawConversationRecord>> {
    let query = format!(
        "SELECT record_id, conversation_id, problem, solution, extraction_confidence,
                processed, consolidated_into, similar_records_json, captured_at
         FROM raw_conversation_records
         WHERE {predicate}
         ORDER BY record_id ASC"
    );
    let mut stmt = conn.prepare(&query)?;
    let mut rows = stmt.query([])?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let record_id_raw: String = row.get(0)?;
        let consolidated_raw: Option<String> = row.get(6)?;
        let similar_json: String = row.get(7)?;
        records.push(RawConversationRecord {
            id: parse_raw_record_id(&record_id_raw)?,
            conversation_id: row.get(1)?,
            problem: row.get(2)?,
            solution: row.get(3)?,
            extraction_confidence: row.get(4)?,
            processed: row.get(5)?,
            consolidated_into: consolidated_raw.as_deref().map(parse_entry_id).transpose()?,
            similar_records: serde_json::from_str(&similar_json)
                .context("failed to deserialize similar records")?,
            captured_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        });
    }
    Ok(records)
}

fn raw_record_exists(conn: &Connection, record_id: RawRecordId) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM raw_conversation_records WHERE record_id = ?1)",
        params![record_id.to_string()],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn load_pattern(conn: &Connection, pattern: &str) -> Result<Option<KnowledgePattern>> {
    let mut stmt = conn.prepare(
        "SELECT pattern, occurrence_count, best_entry_id, best_confidence,
                alternatives_json, updated_at
         FROM knowledge_patterns WHERE pattern = ?1",
    )?;
    let mut rows = stmt.query(params![pattern])?;
    match rows.next()? {
        Some(row) => Ok(Some(pattern_from_row(row)?)),
        None => Ok(None),
    }
}

fn pattern_from_row(row: &rusqlite::Row<'_>) -> Result<KnowledgePattern> {
    let best_raw: Option<String> = row.get(2)?;
    let alternatives_json: String = row.get(4)?;
    Ok(KnowledgePattern {
        pattern: row.get(0)?,
        occurrence_count: u64_from_row(row, 1)?,
        best_entry: best_raw.as_deref().map(parse_entry_id).transpose()?,
        best_confidence: row.get(3)?,
        alternatives: serde_json::from_str(&alternatives_json)
            .context("failed to deserialize pattern alternatives")?,
        updated_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    })
}

fn save_pattern(conn: &Connection, pattern: &KnowledgePattern) -> Result<()> {
    conn.execute(
        "INSERT INTO knowledge_patterns(pattern, occurrence_count, best_entry_id,
                                        best_confidence, alternatives_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(pattern) DO UPDATE SET
            occurrence_count = excluded.occurrence_count,
            best_entry_id = excluded.best_entry_id,
            best_confidence = excluded.best_confidence,
            alternatives_json = excluded.alternatives_json,
            updated_at = excluded.updated_at",
        params![
            pattern.pattern,
            i64::try_from(pattern.occurrence_count).context("occurrence_count out of range")?,
            pattern.best_entry.map(|id| id.to_string()),
            pattern.best_confidence,
            serde_json::to_string(&pattern.alternatives)
                .context("failed to serialize pattern alternatives")?,
            rfc3339(pattern.updated_at)?,
        ],
    )
    .context("failed to save knowledge pattern")?;
    Ok(())
}

fn load_outcome(conn: &Connection, outcome_id: OutcomeId) -> Result<Option<OutcomeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT outcome_id, conversation_id, disposition, category, entry_id,
                confidence, reason, trace_json, helpful, decided_at
         FROM decision_outcomes WHERE outcome_id = ?1",
    )?;
    let mut rows = stmt.query(params![outcome_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(outcome_from_row(row)?)),
        None => Ok(None),
    }
}

fn outcome_from_row(row: &rusqlite::Row<'_>) -> Result<OutcomeRecord> {
    let outcome_id_raw: String = row.get(0)?;
    let disposition_raw: String = row.get(2)?;
    let entry_raw: Option<String> = row.get(4)?;
    let trace_json: String = row.get(7)?;

    Ok(OutcomeRecord {
        id: parse_outcome_id(&outcome_id_raw)?,
        conversation_id: row.get(1)?,
        disposition: Disposition::parse(&disposition_raw)
            .ok_or_else(|| anyhow!("unknown disposition: {disposition_raw}"))?,
        category: row.get(3)?,
        entry_id: entry_raw.as_deref().map(parse_entry_id).transpose()?,
        confidence: row.get(5)?,
        reason: row.get(6)?,
        trace: serde_json::from_str(&trace_json)
            .context("failed to deserialize decision trace")?,
        helpful: row.get(8)?,
        decided_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
    })
}

fn u64_from_row(row: &rusqlite::Row<'_>, index: usize) -> Result<u64> {
    let value: i64 = row.get(index)?;
    u64::try_from(value).with_context(|| format!("column {index} holds negative counter {value}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "knowledge_entries")? {
        return Ok((0, false));
    }

    if table_exists(conn, "decision_outcomes")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn escape_like(value: &str) -> String {
    value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_entry_id(raw: &str) -> Result<EntryId> {
    let parsed = Ulid::from_str(raw).map_err(|_| anyhow!("invalid ULID: {raw}"))?;
    Ok(EntryId(parsed))
}

fn parse_raw_record_id(raw: &str) -> Result<RawRecordId> {
    let parsed = Ulid::from_str(raw).map_err(|_| anyhow!("invalid ULID: {raw}"))?;
    Ok(RawRecordId(parsed))
}

fn parse_outcome_id(raw: &str) -> Result<OutcomeId> {
    let parsed = Ulid::from_str(raw).map_err(|_| anyhow!("invalid ULID: {raw}"))?;
    Ok(OutcomeId(parsed))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [
        "knowledge_entries.ndjson",
        "raw_records.ndjson",
        "knowledge_patterns.ndjson",
        "decision_outcomes.ndjson",
    ] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
