//! SQLite persistence for the payout engine.
//!
//! Single guarded connection in WAL mode. Multi-row writes run inside
//! explicit `BEGIN IMMEDIATE` blocks so a crash never leaves a payout
//! without its hold or its audit row. Worker claims are update-inside-
//! transaction on this one connection, which serializes dispatchers the
//! same way `FOR UPDATE SKIP LOCKED` does across replicas.

mod audit;
mod batches;
mod holds;
mod payouts;
mod sla_rules;

pub use payouts::{CreateOutcome, HoldAction, TransitionOpts};
pub use sla_rules::NewSlaRule;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS payouts (
    id TEXT PRIMARY KEY,
    external_id TEXT,
    origin_module TEXT,
    origin_entity_type TEXT,
    origin_entity_id TEXT,
    beneficiary_type TEXT NOT NULL,
    beneficiary_id TEXT NOT NULL,
    beneficiary_account TEXT,
    amount_cents INTEGER NOT NULL,
    fee_cents INTEGER NOT NULL DEFAULT 0,
    bank_fee_cents INTEGER NOT NULL DEFAULT 0,
    total_cost_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    method TEXT NOT NULL,
    priority_rank INTEGER NOT NULL DEFAULT 2,
    requested_settlement_date TEXT,
    scheduled_at INTEGER,
    connector_id TEXT,
    rail TEXT,
    bank_reference TEXT,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    next_retry_at INTEGER,
    last_error TEXT,
    last_error_code TEXT,
    sla_target_settlement_date TEXT,
    sla_cutoff_time TEXT,
    sla_violated INTEGER NOT NULL DEFAULT 0,
    sla_violation_reason TEXT,
    routing_score REAL,
    routing_reason TEXT,
    routing_predicted_hours REAL,
    tenant_type TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    country TEXT,
    compliance_status TEXT NOT NULL DEFAULT 'clear',
    hold_id TEXT,
    ledger_entry_id TEXT,
    reconciliation_id TEXT,
    metadata TEXT,
    created_by TEXT,
    approved_by TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    processed_at INTEGER,
    sent_at INTEGER,
    settled_at INTEGER,
    failed_at INTEGER,
    reversed_at INTEGER,
    cancelled_at INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_payouts_external_id
    ON payouts(external_id) WHERE external_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_payouts_lease
    ON payouts(status, priority_rank, created_at)
    WHERE status IN ('pending', 'scheduled');
CREATE INDEX IF NOT EXISTS idx_payouts_retry
    ON payouts(status, next_retry_at) WHERE status = 'failed';
CREATE INDEX IF NOT EXISTS idx_payouts_sla
    ON payouts(sla_violated, sla_target_settlement_date);
CREATE INDEX IF NOT EXISTS idx_payouts_tenant_created
    ON payouts(tenant_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_payouts_bank_reference
    ON payouts(bank_reference) WHERE bank_reference IS NOT NULL;

CREATE TABLE IF NOT EXISTS payout_holds (
    id TEXT PRIMARY KEY,
    payout_id TEXT NOT NULL REFERENCES payouts(id),
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    debit_account TEXT NOT NULL,
    credit_account TEXT NOT NULL,
    status TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    ledger_entry_id TEXT,
    created_at INTEGER NOT NULL,
    released_at INTEGER,
    reversed_at INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_holds_one_active
    ON payout_holds(payout_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_holds_expiry
    ON payout_holds(status, expires_at) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS sla_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connector_id TEXT,
    rail TEXT,
    country TEXT,
    currency TEXT,
    priority TEXT,
    cutoff_time TEXT,
    processing_days INTEGER NOT NULL DEFAULT 0,
    settlement_days INTEGER NOT NULL DEFAULT 2,
    exclude_weekends INTEGER NOT NULL DEFAULT 1,
    exclude_holidays INTEGER NOT NULL DEFAULT 0,
    base_fee_cents INTEGER NOT NULL DEFAULT 0,
    percentage_fee_bps INTEGER NOT NULL DEFAULT 0,
    min_fee_cents INTEGER NOT NULL DEFAULT 0,
    max_fee_cents INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_sla_rules_active ON sla_rules(active);

CREATE TABLE IF NOT EXISTS batches (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    batch_type TEXT NOT NULL,
    cron_expr TEXT,
    scheduled_at INTEGER,
    status TEXT NOT NULL,
    total_items INTEGER NOT NULL DEFAULT 0,
    completed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    connector_id TEXT,
    rail TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_batches_due
    ON batches(status, scheduled_at) WHERE status = 'locked';

CREATE TABLE IF NOT EXISTS batch_items (
    batch_id TEXT NOT NULL REFERENCES batches(id),
    payout_id TEXT NOT NULL REFERENCES payouts(id),
    seq INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    PRIMARY KEY (batch_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_batch_items_payout ON batch_items(payout_id);

CREATE TABLE IF NOT EXISTS retry_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payout_id TEXT NOT NULL REFERENCES payouts(id),
    attempt INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    next_retry_at INTEGER,
    backoff_secs INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_retry_log_payout ON retry_log(payout_id, attempt);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payout_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    old_status TEXT,
    new_status TEXT,
    details TEXT,
    actor_type TEXT NOT NULL DEFAULT 'system',
    actor_id TEXT,
    service TEXT NOT NULL DEFAULT 'payout-engine',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_payout ON audit_events(payout_id, id);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    payout_id TEXT,
    batch_id TEXT,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    notified INTEGER NOT NULL DEFAULT 0,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_by TEXT,
    resolution_note TEXT,
    resolved_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_resolved ON alerts(resolved, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_alerts_payout ON alerts(payout_id);
"#;

/// Payout engine storage over a single guarded SQLite connection.
pub struct PayoutDb {
    conn: Arc<Mutex<Connection>>,
}

impl Clone for PayoutDb {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

impl PayoutDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // we handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM payouts", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Payout database initialized at: {}", db_path);
        info!("💸 Existing payouts in database: {}", count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("init in-memory schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// WAL checkpoint + optimizer pass, piggybacked on slow worker loops.
    pub fn optimize(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); PRAGMA optimize;")
            .context("optimize database")?;
        Ok(())
    }

    /// Raw SQL escape hatch for tests that need to rewind clocks.
    #[cfg(test)]
    pub(crate) fn raw_execute(&self, sql: &str) -> Result<usize> {
        let conn = self.lock();
        Ok(conn.execute(sql, [])?)
    }

    pub fn payout_count(&self) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM payouts", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ComplianceStatus, HoldStatus, Payout, PayoutHold, PayoutMethod, PayoutPriority,
        PayoutStatus, PaymentRail,
    };
    use chrono::NaiveDate;

    fn payout(id: &str, status: PayoutStatus, priority: PayoutPriority) -> Payout {
        let now = now_ts();
        Payout {
            id: id.to_string(),
            external_id: None,
            origin_module: None,
            origin_entity_type: None,
            origin_entity_id: None,
            beneficiary_type: "vendor".to_string(),
            beneficiary_id: "ben-1".to_string(),
            beneficiary_account: None,
            amount_cents: 10_000,
            fee_cents: 100,
            bank_fee_cents: 0,
            total_cost_cents: 10_100,
            currency: "USD".to_string(),
            method: PayoutMethod::BankTransfer,
            priority,
            requested_settlement_date: None,
            scheduled_at: None,
            connector_id: None,
            rail: Some(PaymentRail::Ach),
            bank_reference: None,
            status,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            last_error: None,
            last_error_code: None,
            sla_target_settlement_date: None,
            sla_cutoff_time: None,
            sla_violated: false,
            sla_violation_reason: None,
            routing_score: None,
            routing_reason: None,
            routing_predicted_hours: None,
            tenant_type: "merchant".to_string(),
            tenant_id: "t1".to_string(),
            country: Some("US".to_string()),
            compliance_status: ComplianceStatus::Clear,
            hold_id: Some(format!("hold-{}", id)),
            ledger_entry_id: None,
            reconciliation_id: None,
            metadata: None,
            created_by: None,
            approved_by: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            sent_at: None,
            settled_at: None,
            failed_at: None,
            reversed_at: None,
            cancelled_at: None,
        }
    }

    fn hold_for(p: &Payout) -> PayoutHold {
        PayoutHold {
            id: p.hold_id.clone().unwrap(),
            payout_id: p.id.clone(),
            amount_cents: p.total_cost_cents,
            currency: p.currency.clone(),
            debit_account: p.tenant_balance_account(),
            credit_account: "payouts:pending".to_string(),
            status: HoldStatus::Active,
            expires_at: p.created_at + 7 * 24 * 3600,
            ledger_entry_id: Some(format!("le-{}", p.id)),
            created_at: p.created_at,
            released_at: None,
            reversed_at: None,
        }
    }

    fn insert(db: &PayoutDb, p: &Payout) {
        db.create_payout_with_hold(p, &hold_for(p)).unwrap();
    }

    #[test]
    fn duplicate_external_id_is_reported_not_raised() {
        let db = PayoutDb::open_in_memory().unwrap();
        let mut a = payout("p1", PayoutStatus::Pending, PayoutPriority::Standard);
        a.external_id = Some("K1".to_string());
        let mut b = payout("p2", PayoutStatus::Pending, PayoutPriority::Standard);
        b.external_id = Some("K1".to_string());

        assert_eq!(
            db.create_payout_with_hold(&a, &hold_for(&a)).unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            db.create_payout_with_hold(&b, &hold_for(&b)).unwrap(),
            CreateOutcome::DuplicateExternalId
        );
        // The losing transaction rolled back entirely.
        assert_eq!(db.payout_count().unwrap(), 1);
        assert_eq!(db.active_hold_count().unwrap(), 1);
    }

    #[test]
    fn lease_orders_by_priority_then_age_and_requires_active_hold() {
        let db = PayoutDb::open_in_memory().unwrap();
        insert(&db, &payout("low", PayoutStatus::Pending, PayoutPriority::Batch));
        insert(
            &db,
            &payout("high", PayoutStatus::Pending, PayoutPriority::Instant),
        );

        // A pending payout whose hold was reversed must not be leased.
        let orphan = payout("orphan", PayoutStatus::Pending, PayoutPriority::Instant);
        insert(&db, &orphan);
        db.raw_execute("UPDATE payout_holds SET status = 'reversed' WHERE payout_id = 'orphan'")
            .unwrap();

        let leased = db.lease_ready(10, true, now_ts()).unwrap();
        let ids: Vec<&str> = leased.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
        assert!(leased.iter().all(|p| p.status == PayoutStatus::Processing));

        // Leased rows are claimed: a second sweep finds nothing.
        assert!(db.lease_ready(10, true, now_ts()).unwrap().is_empty());
    }

    #[test]
    fn scheduled_rows_wait_for_their_time() {
        let db = PayoutDb::open_in_memory().unwrap();
        let mut future = payout("later", PayoutStatus::Scheduled, PayoutPriority::Standard);
        future.scheduled_at = Some(now_ts() + 3600);
        insert(&db, &future);

        assert!(db.lease_ready(10, true, now_ts()).unwrap().is_empty());
        let due = db.lease_ready(10, true, now_ts() + 7200).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn stale_processing_rows_are_rescued() {
        let db = PayoutDb::open_in_memory().unwrap();
        insert(
            &db,
            &payout("stuck", PayoutStatus::Processing, PayoutPriority::Standard),
        );
        db.raw_execute("UPDATE payouts SET updated_at = updated_at - 900 WHERE id = 'stuck'")
            .unwrap();

        let rescued = db.rescue_stale_processing(300, now_ts()).unwrap();
        assert_eq!(rescued, vec!["stuck".to_string()]);

        let p = db.get_payout("stuck").unwrap().unwrap();
        assert_eq!(p.status, PayoutStatus::Pending);

        // Fresh processing rows are left alone.
        assert!(db.rescue_stale_processing(300, now_ts()).unwrap().is_empty());
    }

    #[test]
    fn sla_flagging_is_idempotent() {
        let db = PayoutDb::open_in_memory().unwrap();
        let mut late = payout("late", PayoutStatus::Sent, PayoutPriority::Standard);
        late.sla_target_settlement_date = NaiveDate::from_ymd_opt(2024, 1, 2);
        insert(&db, &late);

        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let flagged = db.flag_sla_violations(today).unwrap();
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].sla_violated);
        assert_eq!(
            flagged[0].sla_violation_reason.as_deref(),
            Some("target_date_missed")
        );

        // Second pass finds nothing new.
        assert!(db.flag_sla_violations(today).unwrap().is_empty());
    }

    #[test]
    fn transition_rechecks_the_from_status() {
        let db = PayoutDb::open_in_memory().unwrap();
        insert(
            &db,
            &payout("p1", PayoutStatus::Pending, PayoutPriority::Standard),
        );

        let (updated, _) = db
            .apply_status_transition(
                "p1",
                PayoutStatus::Pending,
                PayoutStatus::Processing,
                &TransitionOpts::default(),
            )
            .unwrap();
        assert_eq!(updated.status, PayoutStatus::Processing);
        assert!(updated.processed_at.is_some());

        // Stale `from` is rejected.
        assert!(db
            .apply_status_transition(
                "p1",
                PayoutStatus::Pending,
                PayoutStatus::Processing,
                &TransitionOpts::default(),
            )
            .is_err());
    }

    #[test]
    fn list_filters_and_paginates() {
        let db = PayoutDb::open_in_memory().unwrap();
        for i in 0..5 {
            let mut p = payout(
                &format!("p{}", i),
                PayoutStatus::Pending,
                PayoutPriority::Standard,
            );
            p.hold_id = Some(format!("hold-p{}", i));
            if i >= 3 {
                p.tenant_id = "t2".to_string();
            }
            insert(&db, &p);
        }

        let filter = crate::models::PayoutFilter {
            tenant_id: Some("t1".to_string()),
            ..Default::default()
        };
        let (rows, total) = db.list_payouts(&filter, 2, 0).unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows.len(), 2);

        let (rest, _) = db.list_payouts(&filter, 2, 2).unwrap();
        assert_eq!(rest.len(), 1);
    }
}
