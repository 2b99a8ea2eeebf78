//! Activity-based bounded-Kelly position sizing.
//!
//! Confidence is derived from a whale's normalized rank score rather than a
//! standalone edge estimate; the resulting fraction is bounded by both a
//! hard cap and a quarter-Kelly multiplier before being converted to a
//! bankroll-relative USD clamp.

use crate::config::SizingConfig;
use crate::money::{Probability, Usd};
use rust_decimal::Decimal;

/// Returns `Usd::ZERO` when the computed fraction or resulting size is
/// non-positive; callers treat zero as "skip".
pub fn kelly_size(price: Probability, rank_score_normalized: Decimal, bankroll: Usd, cfg: &SizingConfig) -> Usd {
    if !price.is_valid() || bankroll.inner() <= Decimal::ZERO {
        return Usd::ZERO;
    }

    let p = (cfg.kelly_prior + cfg.alpha * rank_score_normalized).clamp(cfg.confidence_floor, cfg.confidence_ceiling);

    let price_dec = price.inner();
    let b = (Decimal::ONE / price_dec) - Decimal::ONE;
    if b <= Decimal::ZERO {
        return Usd::ZERO;
    }

    let f_star = ((b * p - (Decimal::ONE - p)) / b).max(Decimal::ZERO);
    let f_used = (cfg.quarter_kelly_multiplier * f_star).min(cfg.kelly_fraction_cap);
    if f_used <= Decimal::ZERO {
        return Usd::ZERO;
    }

    let min_usd = bankroll.inner() * cfg.min_position_pct;
    let max_usd = bankroll.inner() * cfg.max_position_pct;
    let raw = bankroll.inner() * f_used;

    // Below the floor skips the trade rather than flooring up to it, so
    // `min_usd > max_usd` configs (or tiny computed fractions) can't be
    // clamped into an out-of-range size; this also sidesteps `Decimal::clamp`
    // panicking when `min > max`.
    if raw < min_usd {
        return Usd::ZERO;
    }
    Usd::new(raw.min(max_usd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> SizingConfig {
        SizingConfig::default()
    }

    #[test]
    fn zero_rank_uses_kelly_prior_only() {
        let size = kelly_size(Probability::new(dec!(0.40)), Decimal::ZERO, Usd::new(dec!(1000)), &cfg());
        assert!(size.inner() > Decimal::ZERO);
    }

    #[test]
    fn higher_rank_score_never_produces_a_smaller_size() {
        let low = kelly_size(Probability::new(dec!(0.40)), dec!(0.0), Usd::new(dec!(1000)), &cfg());
        let high = kelly_size(Probability::new(dec!(0.40)), dec!(1.0), Usd::new(dec!(1000)), &cfg());
        assert!(high.inner() >= low.inner());
    }

    #[test]
    fn size_never_exceeds_max_position_pct_of_bankroll() {
        let size = kelly_size(Probability::new(dec!(0.10)), dec!(1.0), Usd::new(dec!(1000)), &cfg());
        let cap = Usd::new(dec!(1000) * cfg().max_position_pct);
        assert!(size.inner() <= cap.inner());
    }

    #[test]
    fn invalid_price_yields_zero() {
        let size = kelly_size(Probability::new(dec!(0)), dec!(0.5), Usd::new(dec!(1000)), &cfg());
        assert_eq!(size, Usd::ZERO);
    }

    #[test]
    fn zero_bankroll_yields_zero() {
        let size = kelly_size(Probability::new(dec!(0.4)), dec!(0.5), Usd::ZERO, &cfg());
        assert_eq!(size, Usd::ZERO);
    }

    #[test]
    fn below_min_position_pct_is_skipped_not_floored() {
        let mut c = cfg();
        c.min_position_pct = dec!(0.50);
        let size = kelly_size(Probability::new(dec!(0.40)), dec!(0.0), Usd::new(dec!(1000)), &c);
        assert_eq!(size, Usd::ZERO);
    }
}
