//! Reconciliation engine and per-account sync orchestration.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use indexmap::IndexMap;
use ors_core::{map_order_to_row, CellValue, OrderRecord, ReportRow, ReportSchema};
use ors_drive::RemoteStore;
use ors_mongo::{ChangeLogEntry, OrderStore};
use ors_report::{ReportError, ReportWorkbook};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ors-sync";

/// Lower bound applied when an existing report has no readable watermark:
/// re-scan roughly a year rather than miss updates.
const WATERMARK_FALLBACK_DAYS: i64 = 365;

/// Audit-trail caps: the change log is a narrative aid, not a data feed.
const AUDIT_IDS_CAP: usize = 50;
const AUDIT_ENTRIES_PER_ID: usize = 3;

/// Result of merging changed rows into a previous row set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub merged: Vec<ReportRow>,
    pub created: Vec<String>,
    pub updated: Vec<String>,
}

/// Merge changed rows into the previous row set, upserting by row key.
///
/// A changed row fully replaces the previous row at its key; there is no
/// field-level merge. Rows without a key cannot be tracked and are dropped
/// (callers surface that as a data-quality warning). Merged rows come back
/// ascending by creation marker with missing markers last, ties keeping
/// their relative order; the created/updated lists carry each key once, in
/// the order the keys were first classified.
pub fn reconcile(previous: Vec<ReportRow>, changed: Vec<ReportRow>) -> ReconcileOutcome {
    let mut index: IndexMap<String, ReportRow> = IndexMap::new();
    for row in previous {
        if let Some(key) = row.key() {
            index.insert(key.to_string(), row);
        }
    }
    let previous_keys: BTreeSet<String> = index.keys().cloned().collect();

    let mut created = Vec::new();
    let mut updated = Vec::new();
    let mut seen = BTreeSet::new();
    for row in changed {
        let Some(key) = row.key().map(String::from) else {
            continue;
        };
        if seen.insert(key.clone()) {
            if previous_keys.contains(&key) {
                updated.push(key.clone());
            } else {
                created.push(key.clone());
            }
        }
        index.insert(key, row);
    }

    let mut merged: Vec<ReportRow> = index.into_values().collect();
    merged.sort_by(|a, b| match (a.created_at(), b.created_at()) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    ReconcileOutcome {
        merged,
        created,
        updated,
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mongo_uri: Option<String>,
    pub output_dir: PathBuf,
    pub account_ids: Vec<String>,
    /// Allowed `REF` prefixes; empty means no filtering.
    pub ref_prefixes: Vec<String>,
    /// Accounts exempt from the prefix filter.
    pub account_ids_no_prefix: Vec<String>,
    pub drive_client_email: Option<String>,
    pub drive_private_key: Option<String>,
    pub drive_folder_id: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            mongo_uri: std::env::var("MONGO_URI").ok(),
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./order_sync_output")),
            account_ids: csv_env("ACCOUNT_IDS"),
            ref_prefixes: csv_env("REF_PREFIXES"),
            account_ids_no_prefix: csv_env("ACCOUNT_IDS_NO_PREFIX"),
            drive_client_email: std::env::var("GOOGLE_CLIENT_EMAIL").ok(),
            drive_private_key: std::env::var("GOOGLE_PRIVATE_KEY").ok(),
            drive_folder_id: std::env::var("GOOGLE_DRIVE_FOLDER_ID").ok(),
        }
    }
}

fn csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Terminal outcome of one account's sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AccountOutcome {
    Full { created: usize },
    Incremental { created: usize, updated: usize },
    NoUpdates { since: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub accounts_processed: usize,
    pub accounts_failed: usize,
    pub rows_created: usize,
    pub rows_updated: usize,
}

/// Append-only, human-readable log of account outcomes under the output
/// directory. Logging failures warn and never abort a sync.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join("order_sync.log"),
        }
    }

    pub fn append(&self, line: &str) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(error = %err, "could not create run log directory");
                return;
            }
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            warn!(error = %err, "could not append to run log");
        }
    }
}

/// Drives fetch → map → reconcile → persist → watermark → upload per
/// account, full or incremental depending on what the remote artifact holds.
pub struct SyncPipeline {
    config: SyncConfig,
    folder_id: String,
    store: Arc<dyn OrderStore>,
    remote: Arc<dyn RemoteStore>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn OrderStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        let folder_id = config
            .drive_folder_id
            .clone()
            .context("GOOGLE_DRIVE_FOLDER_ID must be configured")?;
        Ok(Self {
            config,
            folder_id,
            store,
            remote,
        })
    }

    /// Process every configured account once. A failing account is logged
    /// and skipped; it never stops the remaining accounts.
    pub async fn run(&self) -> Result<SyncRunSummary> {
        anyhow::ensure!(
            !self.config.account_ids.is_empty(),
            "no account ids configured"
        );
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let run_log = RunLog::new(&self.config.output_dir);

        let mut accounts_failed = 0usize;
        let mut rows_created = 0usize;
        let mut rows_updated = 0usize;
        for account_id in &self.config.account_ids {
            let span = info_span!("sync_account", account = %account_id);
            match self
                .sync_account(started_at, account_id, &run_log)
                .instrument(span)
                .await
            {
                Ok(AccountOutcome::Full { created }) => rows_created += created,
                Ok(AccountOutcome::Incremental { created, updated }) => {
                    rows_created += created;
                    rows_updated += updated;
                }
                Ok(AccountOutcome::NoUpdates { .. }) => {}
                Err(err) => {
                    accounts_failed += 1;
                    warn!(account = %account_id, error = %format!("{err:#}"), "account sync failed");
                }
            }
        }

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            accounts_processed: self.config.account_ids.len(),
            accounts_failed,
            rows_created,
            rows_updated,
        })
    }

    async fn sync_account(
        &self,
        run_started: DateTime<Utc>,
        account_id: &str,
        run_log: &RunLog,
    ) -> Result<AccountOutcome> {
        let schema = ReportSchema::current();
        let display_name = self
            .store
            .fetch_account_name(account_id)
            .await?
            .unwrap_or_else(|| account_id.to_string());
        let remote_name = format!("{display_name}.xlsx");
        let workdir = tempfile::tempdir().context("creating account work directory")?;
        let book = ReportWorkbook::new(workdir.path().join(&remote_name));

        let remote_file = self.remote.find_by_name(&self.folder_id, &remote_name).await?;
        let downloaded = match &remote_file {
            Some(file) => match self.remote.download(file, book.path()).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "download failed, rebuilding from scratch");
                    false
                }
            },
            None => false,
        };

        if !downloaded || !book.has_report_sheet() {
            return self
                .full_rebuild(run_started, account_id, &display_name, &schema, &book, run_log)
                .await;
        }

        let since = book
            .read_last_sync()
            .unwrap_or_else(|| run_started - Duration::days(WATERMARK_FALLBACK_DAYS));
        let changed_ids = self.store.fetch_changed_ids_since(account_id, since).await?;
        if changed_ids.is_empty() {
            let line = format!(
                "[{}] No updates for {display_name} since {}",
                iso(run_started),
                iso(since)
            );
            info!(account = %display_name, since = %iso(since), "no updates");
            run_log.append(&line);
            return Ok(AccountOutcome::NoUpdates { since });
        }

        let records = self.store.fetch_by_ids(&changed_ids).await?;
        let changed_rows = self.map_and_filter(account_id, &records);

        let previous = match book.read_rows(&schema) {
            Ok(rows) => rows,
            Err(ReportError::SchemaMismatch { .. }) => {
                warn!("report header drifted from the expected schema, rebuilding from scratch");
                return self
                    .full_rebuild(run_started, account_id, &display_name, &schema, &book, run_log)
                    .await;
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = reconcile(previous, changed_rows);
        book.write(&schema, &outcome.merged, run_started)?;
        let line = format!(
            "[{}] Incremental for {display_name}: created={}, updated={}",
            iso(run_started),
            outcome.created.len(),
            outcome.updated.len()
        );
        info!(
            account = %display_name,
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            "incremental sync"
        );
        run_log.append(&line);

        if !outcome.updated.is_empty() {
            self.append_audit_trail(account_id, since, &outcome.updated, run_log)
                .await;
        }

        let (_, action) = self
            .remote
            .upload_or_replace(book.path(), &self.folder_id)
            .await?;
        info!(action = %action, file = %remote_name, "uploaded report");
        Ok(AccountOutcome::Incremental {
            created: outcome.created.len(),
            updated: outcome.updated.len(),
        })
    }

    async fn full_rebuild(
        &self,
        run_started: DateTime<Utc>,
        account_id: &str,
        display_name: &str,
        schema: &ReportSchema,
        book: &ReportWorkbook,
        run_log: &RunLog,
    ) -> Result<AccountOutcome> {
        let records = self.store.fetch_all(account_id).await?;
        let rows = self.map_and_filter(account_id, &records);
        book.write(schema, &rows, run_started)?;
        let line = format!(
            "[{}] Full for {display_name}: created={}, updated=0",
            iso(run_started),
            rows.len()
        );
        info!(account = %display_name, created = rows.len(), "full rebuild");
        run_log.append(&line);

        let (_, action) = self
            .remote
            .upload_or_replace(book.path(), &self.folder_id)
            .await?;
        info!(action = %action, "uploaded report");
        Ok(AccountOutcome::Full {
            created: rows.len(),
        })
    }

    fn map_and_filter(&self, account_id: &str, records: &[OrderRecord]) -> Vec<ReportRow> {
        let mut rows: Vec<ReportRow> = records.iter().map(map_order_to_row).collect();
        let missing_keys = rows.iter().filter(|row| row.key().is_none()).count();
        if missing_keys > 0 {
            warn!(count = missing_keys, "rows without a resolvable key cannot be merged");
        }
        let exempt = self
            .config
            .account_ids_no_prefix
            .iter()
            .any(|id| id == account_id);
        if !self.config.ref_prefixes.is_empty() && !exempt {
            rows.retain(|row| {
                row.get("REF")
                    .and_then(CellValue::as_text)
                    .map(|reference| {
                        self.config
                            .ref_prefixes
                            .iter()
                            .any(|prefix| reference.starts_with(prefix.as_str()))
                    })
                    .unwrap_or(false)
            });
        }
        rows
    }

    async fn append_audit_trail(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
        updated: &[String],
        run_log: &RunLog,
    ) {
        let capped = &updated[..updated.len().min(AUDIT_IDS_CAP)];
        match self
            .store
            .fetch_change_log(account_id, since, capped, AUDIT_ENTRIES_PER_ID)
            .await
        {
            Ok(changes) => {
                for (order_id, entries) in changes {
                    for entry in entries {
                        run_log.append(&render_change_entry(&order_id, &entry));
                    }
                }
            }
            Err(err) => warn!(error = %err, "change-log fetch failed, skipping audit trail"),
        }
    }
}

fn render_change_entry(order_id: &str, entry: &ChangeLogEntry) -> String {
    let date = entry.date.map(iso).unwrap_or_default();
    let action = entry.action.as_deref().unwrap_or("update");
    let changes = entry
        .changes
        .iter()
        .map(|change| {
            format!(
                "{}: {} -> {}",
                change.field.as_deref().unwrap_or("?"),
                change.old.as_deref().unwrap_or(""),
                change.new.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("  ~ {order_id} {action} @ {date}: {changes}")
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
