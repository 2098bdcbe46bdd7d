//! SLA rule persistence and default seeding.

use super::PayoutDb;
use crate::models::{PayoutPriority, PaymentRail, SlaRule};
use anyhow::Result;
use rusqlite::params;
use tracing::info;

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<SlaRule> {
    let rail: Option<String> = row.get(2)?;
    let priority: Option<String> = row.get(5)?;
    Ok(SlaRule {
        id: row.get(0)?,
        connector_id: row.get(1)?,
        rail: rail.and_then(|r| PaymentRail::from_str(&r)),
        country: row.get(3)?,
        currency: row.get(4)?,
        priority: priority.and_then(|p| PayoutPriority::from_str(&p)),
        cutoff_time: row.get(6)?,
        processing_days: row.get::<_, i64>(7)? as u32,
        settlement_days: row.get::<_, i64>(8)? as u32,
        exclude_weekends: row.get::<_, i64>(9)? != 0,
        exclude_holidays: row.get::<_, i64>(10)? != 0,
        base_fee_cents: row.get(11)?,
        percentage_fee_bps: row.get(12)?,
        min_fee_cents: row.get(13)?,
        max_fee_cents: row.get(14)?,
        active: row.get::<_, i64>(15)? != 0,
    })
}

const RULE_COLS: &str = "id, connector_id, rail, country, currency, priority, cutoff_time, \
     processing_days, settlement_days, exclude_weekends, exclude_holidays, base_fee_cents, \
     percentage_fee_bps, min_fee_cents, max_fee_cents, active";

/// Insert parameters for a rule; the id is assigned by the database.
#[derive(Debug, Clone, Default)]
pub struct NewSlaRule {
    pub connector_id: Option<String>,
    pub rail: Option<PaymentRail>,
    pub country: Option<String>,
    pub currency: Option<String>,
    pub priority: Option<PayoutPriority>,
    pub cutoff_time: Option<String>,
    pub processing_days: u32,
    pub settlement_days: u32,
    pub exclude_weekends: bool,
    pub exclude_holidays: bool,
    pub base_fee_cents: i64,
    pub percentage_fee_bps: i64,
    pub min_fee_cents: i64,
    pub max_fee_cents: i64,
}

impl PayoutDb {
    pub fn insert_sla_rule(&self, rule: &NewSlaRule) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sla_rules (connector_id, rail, country, currency, priority, cutoff_time,
                                    processing_days, settlement_days, exclude_weekends,
                                    exclude_holidays, base_fee_cents, percentage_fee_bps,
                                    min_fee_cents, max_fee_cents, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1)",
            params![
                rule.connector_id,
                rule.rail.map(|r| r.as_str()),
                rule.country,
                rule.currency,
                rule.priority.map(|p| p.as_str()),
                rule.cutoff_time,
                rule.processing_days as i64,
                rule.settlement_days as i64,
                rule.exclude_weekends as i64,
                rule.exclude_holidays as i64,
                rule.base_fee_cents,
                rule.percentage_fee_bps,
                rule.min_fee_cents,
                rule.max_fee_cents,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_active_sla_rules(&self) -> Result<Vec<SlaRule>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM sla_rules WHERE active = 1 ORDER BY id ASC",
            RULE_COLS
        ))?;
        let rules = stmt
            .query_map([], row_to_rule)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rules)
    }

    pub fn sla_rule_count(&self) -> Result<i64> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sla_rules", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Install the per-rail defaults on an empty table. Mirrors the rule set
    /// deployments start from before operators tune per-corridor rows.
    pub fn seed_default_sla_rules(&self) -> Result<usize> {
        if self.sla_rule_count()? > 0 {
            return Ok(0);
        }

        let defaults = [
            // rail, processing, settlement, cutoff, base, bps, min, max
            (PaymentRail::Ach, 1u32, 1u32, "16:00", 25i64, 10i64, 25i64, 500i64),
            (PaymentRail::Wire, 0, 1, "14:00", 1500, 0, 1500, 1500),
            (PaymentRail::Sepa, 0, 1, "15:00", 50, 0, 50, 50),
            (PaymentRail::FasterPayments, 0, 0, "23:00", 20, 0, 20, 20),
            (PaymentRail::MobileMoney, 0, 0, "23:00", 0, 100, 10, 1000),
            (PaymentRail::WalletCredit, 0, 0, "23:59", 0, 0, 0, 0),
        ];

        let mut inserted = 0;
        for (rail, processing, settlement, cutoff, base, bps, min, max) in defaults {
            self.insert_sla_rule(&NewSlaRule {
                rail: Some(rail),
                cutoff_time: Some(cutoff.to_string()),
                processing_days: processing,
                settlement_days: settlement,
                exclude_weekends: !matches!(
                    rail,
                    PaymentRail::FasterPayments
                        | PaymentRail::MobileMoney
                        | PaymentRail::WalletCredit
                ),
                exclude_holidays: matches!(rail, PaymentRail::Ach | PaymentRail::Wire),
                base_fee_cents: base,
                percentage_fee_bps: bps,
                min_fee_cents: min,
                max_fee_cents: max,
                ..Default::default()
            })?;
            inserted += 1;
        }

        info!("🗓️ Seeded {} default SLA rules", inserted);
        Ok(inserted)
    }
}
