//! SLA rule resolution, target settlement dates and fee computation.
//!
//! Rules are scoped by (connector, rail, country, currency, priority) with
//! nulls as wildcards. Resolution picks the active rule matching on the
//! greatest number of non-null columns; ties prefer the rule that is
//! non-null on the earlier column in that order, then the lowest rule id.

use crate::error::{PayoutError, PayoutResult};
use crate::models::{Amount, PayoutPriority, PaymentRail, SlaRule};
use crate::store::PayoutDb;
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use std::sync::Arc;

/// Holiday calendar collaborator. The engine only ever asks one question.
pub trait HolidayCalendar: Send + Sync {
    fn is_business_day(&self, date: NaiveDate, country: Option<&str>) -> bool;
}

/// Weekday-only calendar used when no holiday feed is wired up.
pub struct WeekdayCalendar;

impl HolidayCalendar for WeekdayCalendar {
    fn is_business_day(&self, date: NaiveDate, _country: Option<&str>) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// Request scope an SLA rule is resolved against.
#[derive(Debug, Clone)]
pub struct SlaScope<'a> {
    pub connector_id: Option<&'a str>,
    pub rail: Option<PaymentRail>,
    pub country: Option<&'a str>,
    pub currency: &'a str,
    pub priority: PayoutPriority,
}

pub struct SlaEngine {
    db: PayoutDb,
    calendar: Arc<dyn HolidayCalendar>,
}

impl SlaEngine {
    pub fn new(db: PayoutDb, calendar: Arc<dyn HolidayCalendar>) -> Self {
        Self { db, calendar }
    }

    /// Most specific active rule for the scope, or None.
    pub fn resolve_rule(&self, scope: &SlaScope) -> Result<Option<SlaRule>> {
        let rules = self.db.list_active_sla_rules()?;
        Ok(resolve_from(rules, scope))
    }

    /// Target settlement date: advance processing + settlement days from the
    /// creation date, skipping excluded days; submissions past the cutoff
    /// start counting the next day. No rule means T+2 business days.
    pub fn target_settlement_date(
        &self,
        rule: Option<&SlaRule>,
        created_at: DateTime<Utc>,
        country: Option<&str>,
    ) -> NaiveDate {
        let mut date = created_at.date_naive();

        let (days, skip_weekends, skip_holidays) = match rule {
            Some(r) => {
                if let Some(cutoff) = r
                    .cutoff_time
                    .as_deref()
                    .and_then(|c| NaiveTime::parse_from_str(c, "%H:%M").ok())
                {
                    if created_at.time() > cutoff {
                        date += Duration::days(1);
                    }
                }
                (
                    (r.processing_days + r.settlement_days) as i64,
                    r.exclude_weekends,
                    r.exclude_holidays,
                )
            }
            None => (2, true, false),
        };

        let excluded = |d: NaiveDate| -> bool {
            if skip_weekends && matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
                return true;
            }
            if skip_holidays && !self.calendar.is_business_day(d, country) {
                return true;
            }
            false
        };

        for _ in 0..days {
            date += Duration::days(1);
            while excluded(date) {
                date += Duration::days(1);
            }
        }
        date
    }

    /// Internal fee in minor units: clamp(base + bps × amount, min, max).
    /// A zero max means uncapped. The bank fee is unknown until the
    /// connector reports back; zero at creation.
    pub fn fee(&self, rule: Option<&SlaRule>, amount_cents: Amount) -> PayoutResult<Amount> {
        if amount_cents <= 0 {
            return Err(PayoutError::InvalidRequest(
                "amount must be positive".to_string(),
            ));
        }
        let Some(rule) = rule else {
            return Ok(0);
        };

        let mut fee = rule.base_fee_cents + amount_cents * rule.percentage_fee_bps / 10_000;
        fee = fee.max(rule.min_fee_cents);
        if rule.max_fee_cents > 0 {
            fee = fee.min(rule.max_fee_cents);
        }
        Ok(fee)
    }
}

/// Specificity: count of non-null scope columns, all of which must equal
/// the request's values. A non-null column that differs disqualifies.
fn match_specificity(rule: &SlaRule, scope: &SlaScope) -> Option<u32> {
    let mut count = 0;

    if let Some(rc) = rule.connector_id.as_deref() {
        if Some(rc) != scope.connector_id {
            return None;
        }
        count += 1;
    }
    if let Some(rr) = rule.rail {
        if Some(rr) != scope.rail {
            return None;
        }
        count += 1;
    }
    if let Some(rc) = rule.country.as_deref() {
        if Some(rc) != scope.country {
            return None;
        }
        count += 1;
    }
    if let Some(rc) = rule.currency.as_deref() {
        if rc != scope.currency {
            return None;
        }
        count += 1;
    }
    if let Some(rp) = rule.priority {
        if rp != scope.priority {
            return None;
        }
        count += 1;
    }
    Some(count)
}

/// Tie-break key: non-null flags in column order (connector first), so a
/// rule pinned on an earlier column beats one pinned on a later column;
/// the final tie goes to the lowest id.
fn tie_break_key(rule: &SlaRule) -> [bool; 5] {
    [
        rule.connector_id.is_some(),
        rule.rail.is_some(),
        rule.country.is_some(),
        rule.currency.is_some(),
        rule.priority.is_some(),
    ]
}

fn resolve_from(rules: Vec<SlaRule>, scope: &SlaScope) -> Option<SlaRule> {
    let mut best: Option<(u32, [bool; 5], i64, SlaRule)> = None;

    for rule in rules {
        let Some(specificity) = match_specificity(&rule, scope) else {
            continue;
        };
        let key = tie_break_key(&rule);
        let candidate = (specificity, key, -rule.id, rule);
        match &best {
            None => best = Some(candidate),
            Some((s, k, neg_id, _)) => {
                // Higher specificity wins; then the earlier-column key
                // (true > false lexicographically); then the lower id.
                if (candidate.0, candidate.1, candidate.2) > (*s, *k, *neg_id) {
                    best = Some(candidate);
                }
            }
        }
    }

    best.map(|(_, _, _, rule)| rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rule(id: i64) -> SlaRule {
        SlaRule {
            id,
            connector_id: None,
            rail: None,
            country: None,
            currency: None,
            priority: None,
            cutoff_time: None,
            processing_days: 1,
            settlement_days: 1,
            exclude_weekends: true,
            exclude_holidays: false,
            base_fee_cents: 25,
            percentage_fee_bps: 10,
            min_fee_cents: 25,
            max_fee_cents: 500,
            active: true,
        }
    }

    fn scope() -> SlaScope<'static> {
        SlaScope {
            connector_id: Some("conn-a"),
            rail: Some(PaymentRail::Ach),
            country: Some("US"),
            currency: "USD",
            priority: PayoutPriority::Standard,
        }
    }

    #[test]
    fn most_specific_rule_wins() {
        let mut wildcard = rule(1);
        wildcard.rail = None;

        let mut specific = rule(2);
        specific.rail = Some(PaymentRail::Ach);
        specific.currency = Some("USD".to_string());

        let resolved = resolve_from(vec![wildcard, specific], &scope()).unwrap();
        assert_eq!(resolved.id, 2);
    }

    #[test]
    fn mismatched_non_null_column_disqualifies() {
        let mut wire_only = rule(1);
        wire_only.rail = Some(PaymentRail::Wire);

        assert!(resolve_from(vec![wire_only], &scope()).is_none());
    }

    #[test]
    fn tie_breaks_on_earlier_scope_column() {
        // Both match exactly one column; connector outranks currency.
        let mut by_currency = rule(1);
        by_currency.currency = Some("USD".to_string());

        let mut by_connector = rule(2);
        by_connector.connector_id = Some("conn-a".to_string());

        let resolved = resolve_from(vec![by_currency, by_connector], &scope()).unwrap();
        assert_eq!(resolved.id, 2);
    }

    #[test]
    fn equal_keys_fall_back_to_lowest_id() {
        let mut a = rule(7);
        a.rail = Some(PaymentRail::Ach);
        let mut b = rule(3);
        b.rail = Some(PaymentRail::Ach);

        let resolved = resolve_from(vec![a, b], &scope()).unwrap();
        assert_eq!(resolved.id, 3);
    }

    fn engine() -> SlaEngine {
        let db = PayoutDb::open_in_memory().unwrap();
        SlaEngine::new(db, Arc::new(WeekdayCalendar))
    }

    #[test]
    fn target_date_skips_weekends() {
        // Friday 2024-03-01 + 2 business days lands on Tuesday.
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut r = rule(1);
        r.processing_days = 1;
        r.settlement_days = 1;
        r.cutoff_time = None;

        let target = engine().target_settlement_date(Some(&r), created, Some("US"));
        assert_eq!(target, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
    }

    #[test]
    fn missing_rule_defaults_to_two_business_days() {
        let created = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap(); // Monday
        let target = engine().target_settlement_date(None, created, None);
        assert_eq!(target, NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
    }

    #[test]
    fn past_cutoff_rolls_to_next_day() {
        let mut r = rule(1);
        r.cutoff_time = Some("16:00".to_string());
        r.processing_days = 1;
        r.settlement_days = 0;
        r.exclude_weekends = false;

        let before = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 4, 18, 0, 0).unwrap();
        let eng = engine();
        assert_eq!(
            eng.target_settlement_date(Some(&r), before, None),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
        assert_eq!(
            eng.target_settlement_date(Some(&r), after, None),
            NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()
        );
    }

    #[test]
    fn fee_is_clamped_and_rounded_to_cents() {
        let eng = engine();
        let r = rule(1); // $0.25 base + 10 bps, min $0.25, max $5.00

        // $1000.00: 25 + 100 = 125 cents.
        assert_eq!(eng.fee(Some(&r), 100_000).unwrap(), 125);
        // Tiny amount clamps up to the minimum.
        assert_eq!(eng.fee(Some(&r), 100).unwrap(), 25);
        // Huge amount clamps down to the maximum.
        assert_eq!(eng.fee(Some(&r), 100_000_000).unwrap(), 500);
        // No rule, no internal fee.
        assert_eq!(eng.fee(None, 100_000).unwrap(), 0);
    }

    #[test]
    fn fee_rejects_non_positive_amounts() {
        let eng = engine();
        assert!(eng.fee(None, 0).is_err());
        assert!(eng.fee(None, -100).is_err());
    }
}
