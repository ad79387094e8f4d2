//! Core domain model for marketplace price watching.

use chrono::{NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mpw-core";

/// One saved marketplace search: opaque key/value parameters forwarded as-is.
pub type SearchQuery = serde_json::Map<String, serde_json::Value>;

/// Flat, single-level listing row keyed by the marketplace item identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub item_id: String,
    pub title: Option<String>,
    pub price_value: Option<Decimal>,
    pub price_currency: Option<String>,
    pub item_href: Option<String>,
    pub seller_username: Option<String>,
    pub condition_display_name: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub brand: Option<String>,
    /// Naive UTC instant of the most recent ingestion touch.
    pub last_seen_utc: NaiveDateTime,
    pub ai_price_estimate: Option<Decimal>,
}

impl ListingRecord {
    /// Bare record with only the identifier populated, seen now.
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            title: None,
            price_value: None,
            price_currency: None,
            item_href: None,
            seller_username: None,
            condition_display_name: None,
            category_id: None,
            category_name: None,
            brand: None,
            last_seen_utc: utc_now_naive(),
            ai_price_estimate: None,
        }
    }

    pub fn with_estimate(mut self, estimate: Option<Decimal>) -> Self {
        self.ai_price_estimate = estimate;
        self
    }
}

pub fn utc_now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Alert threshold expressed as a multiple of the observed price.
///
/// An estimate triggers when `estimate >= price_multiple * observed`. A multiple
/// of zero makes every priced and estimated listing trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub price_multiple: Decimal,
}

impl AlertRule {
    pub fn new(price_multiple: Decimal) -> Self {
        Self { price_multiple }
    }
}

/// Outcome of comparing an estimate against the observed price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceAlert {
    pub item_id: String,
    pub title: Option<String>,
    pub observed: Decimal,
    pub currency: Option<String>,
    pub estimate: Decimal,
    /// `(estimate / observed - 1) * 100`.
    pub uplift_percent: Decimal,
    pub item_href: Option<String>,
}

impl PriceAlert {
    pub fn message(&self) -> String {
        let currency = self.currency.as_deref().unwrap_or("");
        let mut lines = vec![
            format!(
                "Price alert: {}",
                self.title.as_deref().unwrap_or(&self.item_id)
            ),
            format!("Observed: {} {}", self.observed, currency).trim_end().to_string(),
            format!("Estimate: {} {}", self.estimate, currency).trim_end().to_string(),
            format!("Uplift: {}%", self.uplift_percent.round_dp(2)),
        ];
        if let Some(href) = &self.item_href {
            lines.push(href.clone());
        }
        lines.join("\n")
    }
}

/// Relative uplift in percent, `None` when the observed price is not positive
/// or the result does not fit a `Decimal`.
pub fn uplift_percent(observed: Decimal, estimate: Decimal) -> Option<Decimal> {
    if observed <= Decimal::ZERO {
        return None;
    }
    estimate
        .checked_div(observed)?
        .checked_sub(Decimal::ONE)?
        .checked_mul(Decimal::ONE_HUNDRED)
}

/// Evaluates the alert rule for a record carrying both an observed price and an estimate.
/// Values whose arithmetic overflows never alert.
pub fn evaluate_alert(record: &ListingRecord, rule: &AlertRule) -> Option<PriceAlert> {
    let observed = record.price_value?;
    let estimate = record.ai_price_estimate?;
    let uplift = uplift_percent(observed, estimate)?;
    let threshold = rule.price_multiple.checked_mul(observed)?;
    if estimate < threshold {
        return None;
    }
    Some(PriceAlert {
        item_id: record.item_id.clone(),
        title: record.title.clone(),
        observed,
        currency: record.price_currency.clone(),
        estimate,
        uplift_percent: uplift,
        item_href: record.item_href.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn priced(price: Decimal, estimate: Option<Decimal>) -> ListingRecord {
        let mut record = ListingRecord::new("v1|123|0");
        record.title = Some("Sony WH-1000XM4".into());
        record.price_value = Some(price);
        record.price_currency = Some("GBP".into());
        record.item_href = Some("https://www.ebay.co.uk/itm/123".into());
        record.with_estimate(estimate)
    }

    #[test]
    fn alert_triggers_with_fifty_percent_uplift() {
        let record = priced(dec!(100), Some(dec!(150)));
        let alert = evaluate_alert(&record, &AlertRule::new(dec!(0.2))).expect("alert");
        assert_eq!(alert.uplift_percent, dec!(50));
        assert_eq!(alert.estimate, dec!(150));
    }

    #[test]
    fn zero_multiple_triggers_even_below_observed_price() {
        let record = priced(dec!(100), Some(dec!(40)));
        let alert = evaluate_alert(&record, &AlertRule::new(Decimal::ZERO)).expect("alert");
        assert_eq!(alert.uplift_percent, dec!(-60));
    }

    #[test]
    fn estimate_below_multiple_does_not_trigger() {
        let record = priced(dec!(100), Some(dec!(119)));
        assert!(evaluate_alert(&record, &AlertRule::new(dec!(1.2))).is_none());
    }

    #[test]
    fn missing_estimate_or_zero_price_never_triggers() {
        let rule = AlertRule::new(Decimal::ZERO);
        assert!(evaluate_alert(&priced(dec!(100), None), &rule).is_none());
        assert!(evaluate_alert(&priced(Decimal::ZERO, Some(dec!(5))), &rule).is_none());
    }

    #[test]
    fn oversized_estimate_does_not_alert_or_panic() {
        let record = priced(dec!(1), Some(dec!(9999999999999999999999999999)));
        assert_eq!(uplift_percent(dec!(1), dec!(9999999999999999999999999999)), None);
        assert!(evaluate_alert(&record, &AlertRule::new(Decimal::ZERO)).is_none());
    }

    #[test]
    fn oversized_threshold_does_not_alert_or_panic() {
        let huge = dec!(9999999999999999999999999999);
        let record = priced(huge, Some(huge));
        assert!(evaluate_alert(&record, &AlertRule::new(dec!(1000))).is_none());
    }

    #[test]
    fn message_carries_title_prices_uplift_and_link() {
        let record = priced(dec!(100), Some(dec!(133.333)));
        let alert = evaluate_alert(&record, &AlertRule::new(dec!(1))).expect("alert");
        let message = alert.message();
        assert!(message.contains("Sony WH-1000XM4"));
        assert!(message.contains("Observed: 100 GBP"));
        assert!(message.contains("Estimate: 133.333 GBP"));
        assert!(message.contains("Uplift: 33.33%"));
        assert!(message.ends_with("https://www.ebay.co.uk/itm/123"));
    }
}
