//! Price watch alerts. Notification only; never trades.

use crate::config::WatchRule;
use crate::market::MarketSnapshot;
use crate::utils::decimal::{pct_change, to_percent};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    Below,
    Above,
    LargeMove,
}

/// A triggered watch rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceAlert {
    pub symbol: String,
    pub kind: AlertKind,
    pub price: Decimal,
    pub threshold: Decimal,
    /// Change since the first bar's open, as a fraction
    pub change: Decimal,
}

impl PriceAlert {
    pub fn message(&self) -> String {
        match self.kind {
            AlertKind::Below => format!(
                "ALERT: {} below ${:.2} (now ${:.2})",
                self.symbol, self.threshold, self.price
            ),
            AlertKind::Above => format!(
                "ALERT: {} above ${:.2} (now ${:.2})",
                self.symbol, self.threshold, self.price
            ),
            AlertKind::LargeMove => format!(
                "ALERT: {} volatility high: {:+.2}% (limit {:.2}%)",
                self.symbol,
                to_percent(self.change),
                to_percent(self.threshold)
            ),
        }
    }
}

/// Evaluate one rule against a snapshot of the watched symbol.
pub fn check_rule(rule: &WatchRule, snapshot: &MarketSnapshot) -> Vec<PriceAlert> {
    let (Some(first), Some(price)) = (snapshot.bars.first(), snapshot.last_close()) else {
        return Vec::new();
    };
    let change = pct_change(first.open, price);

    let alert = |kind, threshold| PriceAlert {
        symbol: rule.symbol.clone(),
        kind,
        price,
        threshold,
        change,
    };

    let mut alerts = Vec::new();
    if let Some(below) = rule.below.filter(|b| price < *b) {
        alerts.push(alert(AlertKind::Below, below));
    }
    if let Some(above) = rule.above.filter(|a| price > *a) {
        alerts.push(alert(AlertKind::Above, above));
    }
    if let Some(limit) = rule.max_abs_change_pct.filter(|l| change.abs() > *l) {
        alerts.push(alert(AlertKind::LargeMove, limit));
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::bars_from_closes;
    use rust_decimal_macros::dec;

    fn snapshot(closes: &[Decimal]) -> MarketSnapshot {
        MarketSnapshot::new("NVDA", bars_from_closes(closes, &[dec!(100)]))
    }

    #[test]
    fn test_below_threshold_alerts() {
        let rule = WatchRule {
            symbol: "NVDA".to_string(),
            below: Some(dec!(192)),
            above: None,
            max_abs_change_pct: None,
        };

        let alerts = check_rule(&rule, &snapshot(&[dec!(195), dec!(191.5)]));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Below);
        assert!(alerts[0].message().contains("below $192.00"));

        assert!(check_rule(&rule, &snapshot(&[dec!(195), dec!(193)])).is_empty());
    }

    #[test]
    fn test_large_move_alerts_both_ways() {
        let rule = WatchRule {
            symbol: "NVDA".to_string(),
            below: None,
            above: None,
            max_abs_change_pct: Some(dec!(0.03)),
        };

        // First bar opens at its own close (100)
        let drop = check_rule(&rule, &snapshot(&[dec!(100), dec!(99), dec!(96.5)]));
        assert_eq!(drop.len(), 1);
        assert_eq!(drop[0].change, dec!(-0.035));

        assert!(check_rule(&rule, &snapshot(&[dec!(100), dec!(102)])).is_empty());
    }

    #[test]
    fn test_empty_snapshot_never_alerts() {
        let rule = WatchRule {
            symbol: "NVDA".to_string(),
            below: Some(dec!(1000)),
            above: None,
            max_abs_change_pct: None,
        };
        assert!(check_rule(&rule, &MarketSnapshot::new("NVDA", Vec::new())).is_empty());
    }
}
