use chrono::{Datelike, NaiveDate};

use crate::config::SplitStrategy;

/// Concrete split policy for one job: the strategy plus its resolved
/// chronological cutoff, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    EvenOddMonth,
    EvenOddYear,
    Chronological(NaiveDate),
}

impl SplitPolicy {
    pub fn from_config(strategy: SplitStrategy, oos_start: Option<NaiveDate>) -> Option<Self> {
        match strategy {
            SplitStrategy::EvenOddMonth => Some(SplitPolicy::EvenOddMonth),
            SplitStrategy::EvenOddYear => Some(SplitPolicy::EvenOddYear),
            SplitStrategy::Chronological => oos_start.map(SplitPolicy::Chronological),
        }
    }
}

/// Split a date series into complementary in-sample and out-of-sample masks.
/// Pure function; warm-up exclusion is applied later by the metrics kernel,
/// which drops warm-up bars from both partitions.
pub fn partition(dates: &[NaiveDate], policy: SplitPolicy) -> (Vec<bool>, Vec<bool>) {
    let is_mask: Vec<bool> = dates
        .iter()
        .map(|date| match policy {
            SplitPolicy::EvenOddMonth => date.month() % 2 == 1,
            SplitPolicy::EvenOddYear => date.year().rem_euclid(2) == 1,
            SplitPolicy::Chronological(cutoff) => *date < cutoff,
        })
        .collect();
    let oos_mask: Vec<bool> = is_mask.iter().map(|v| !v).collect();
    (is_mask, oos_mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dates(specs: &[(i32, u32, u32)]) -> Vec<NaiveDate> {
        specs
            .iter()
            .map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap())
            .collect()
    }

    #[test]
    fn even_odd_month_puts_odd_months_in_sample() {
        let dates = dates(&[(2020, 1, 15), (2020, 2, 15), (2020, 3, 15), (2020, 12, 1)]);
        let (is_mask, oos_mask) = partition(&dates, SplitPolicy::EvenOddMonth);
        assert_eq!(is_mask, vec![true, false, true, false]);
        assert_eq!(oos_mask, vec![false, true, false, true]);
    }

    #[test]
    fn even_odd_year_puts_odd_years_in_sample() {
        let dates = dates(&[(2020, 6, 1), (2021, 6, 1), (2022, 6, 1)]);
        let (is_mask, _) = partition(&dates, SplitPolicy::EvenOddYear);
        assert_eq!(is_mask, vec![false, true, false]);
    }

    #[test]
    fn chronological_cutoff_is_exclusive_on_the_is_side() {
        let cutoff = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let dates = dates(&[(2020, 12, 30), (2020, 12, 31), (2021, 1, 1), (2021, 1, 4)]);
        let (is_mask, oos_mask) = partition(&dates, SplitPolicy::Chronological(cutoff));
        assert_eq!(is_mask, vec![true, true, false, false]);
        assert_eq!(oos_mask, vec![false, false, true, true]);
    }

    #[test]
    fn masks_are_complementary_everywhere() {
        let dates: Vec<NaiveDate> = (0..400)
            .map(|i| NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Days::new(i))
            .collect();
        for policy in [
            SplitPolicy::EvenOddMonth,
            SplitPolicy::EvenOddYear,
            SplitPolicy::Chronological(NaiveDate::from_ymd_opt(2020, 7, 1).unwrap()),
        ] {
            let (is_mask, oos_mask) = partition(&dates, policy);
            for i in 0..dates.len() {
                assert!(is_mask[i] ^ oos_mask[i]);
                assert!(!(is_mask[i] && oos_mask[i]));
            }
        }
    }
}
