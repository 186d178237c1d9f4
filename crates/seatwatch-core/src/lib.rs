//! Core domain model for seatwatch: canonical observation records, the
//! opening-hours time window policy, and portable occupancy analytics.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "seatwatch-core";

/// One observed state of a seating area. The same shape backs both the
/// snapshot table (latest row per area) and the append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaObservation {
    pub area_id: String,
    pub branch_name: String,
    pub floor_name: String,
    pub area_name: String,
    pub free_count: u32,
    pub total_count: u32,
    pub observed_at: NaiveDateTime,
}

impl AreaObservation {
    /// Percentage of capacity occupied, 0.0 when the area reports no seats.
    pub fn occupation_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        let taken = self.total_count.saturating_sub(self.free_count);
        f64::from(taken) / f64::from(self.total_count) * 100.0
    }

    pub fn observed_date(&self) -> NaiveDate {
        self.observed_at.date()
    }
}

/// A library branch with its daily window and the last *computed* open flag.
///
/// `is_open` is persisted state mutated only on observed transitions; callers
/// that need the live status recompute it through [`TimeWindowPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_name: String,
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
    pub is_open: bool,
}

/// Weekday and weekend opening windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningHours {
    pub weekday_open: NaiveTime,
    pub weekday_close: NaiveTime,
    pub weekend_open: NaiveTime,
    pub weekend_close: NaiveTime,
}

/// Which days count as "weekend" for hour selection.
///
/// The classification is injected rather than hardcoded because deployments
/// disagree on it (Saturday/Sunday vs Sunday/Monday closures are both real).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekendRule {
    days: Vec<Weekday>,
}

impl WeekendRule {
    pub fn new(days: Vec<Weekday>) -> Self {
        Self { days }
    }

    pub fn saturday_sunday() -> Self {
        Self::new(vec![Weekday::Sat, Weekday::Sun])
    }

    pub fn sunday_monday() -> Self {
        Self::new(vec![Weekday::Sun, Weekday::Mon])
    }

    /// Parses a comma-separated day list such as `sat,sun` or `sun,mon`.
    pub fn parse(labels: &str) -> Option<Self> {
        let mut days = Vec::new();
        for label in labels.split(',') {
            let day = match label.trim().to_ascii_lowercase().as_str() {
                "mon" | "monday" => Weekday::Mon,
                "tue" | "tuesday" => Weekday::Tue,
                "wed" | "wednesday" => Weekday::Wed,
                "thu" | "thursday" => Weekday::Thu,
                "fri" | "friday" => Weekday::Fri,
                "sat" | "saturday" => Weekday::Sat,
                "sun" | "sunday" => Weekday::Sun,
                "" => continue,
                _ => return None,
            };
            if !days.contains(&day) {
                days.push(day);
            }
        }
        if days.is_empty() {
            None
        } else {
            Some(Self::new(days))
        }
    }

    pub fn is_weekend(&self, day: Weekday) -> bool {
        self.days.contains(&day)
    }

    pub fn days(&self) -> &[Weekday] {
        &self.days
    }
}

/// Pure open/closed decisions over a branch calendar.
///
/// Open-inclusive, close-exclusive: `open <= now < close`. The caller is
/// responsible for handing in time already shifted to the library's zone.
#[derive(Debug, Clone)]
pub struct TimeWindowPolicy {
    pub hours: OpeningHours,
    pub weekend_rule: WeekendRule,
    pub closing_window: Duration,
}

impl TimeWindowPolicy {
    pub fn new(hours: OpeningHours, weekend_rule: WeekendRule, closing_window: Duration) -> Self {
        Self {
            hours,
            weekend_rule,
            closing_window,
        }
    }

    /// Opening window applicable on the given weekday.
    pub fn window_for(&self, day: Weekday) -> (NaiveTime, NaiveTime) {
        if self.weekend_rule.is_weekend(day) {
            (self.hours.weekend_open, self.hours.weekend_close)
        } else {
            (self.hours.weekday_open, self.hours.weekday_close)
        }
    }

    pub fn is_open_at(&self, now: NaiveDateTime) -> bool {
        let (open, close) = self.window_for(now.weekday());
        let t = now.time();
        t >= open && t < close
    }

    /// True within the final minutes immediately preceding the close time,
    /// used to trigger the end-of-day capture before the window shuts.
    pub fn within_closing_window_at(&self, now: NaiveDateTime) -> bool {
        let (_, close) = self.window_for(now.weekday());
        let t = now.time();
        t < close && close - t <= self.closing_window
    }

    /// The official closing moment on the given date.
    pub fn close_instant_on(&self, date: NaiveDate) -> NaiveDateTime {
        let (_, close) = self.window_for(date.weekday());
        date.and_time(close)
    }
}

impl TimeWindowPolicy {
    /// Per-branch variant: the branch row's own window overrides the network
    /// defaults, weekend rule still decides nothing here (a branch row holds
    /// one window; weekend-specific branch rows are seeded as such).
    pub fn is_branch_open_at(branch: &Branch, now: NaiveDateTime) -> bool {
        let t = now.time();
        t >= branch.open_time && t < branch.close_time
    }

    pub fn branch_within_closing_window_at(
        branch: &Branch,
        now: NaiveDateTime,
        window: Duration,
    ) -> bool {
        let t = now.time();
        t < branch.close_time && branch.close_time - t <= window
    }
}

// ---------------------------------------------------------------------------
// Analytics: read-only aggregations over canonical records. All functions
// return empty output for empty input and ignore rows with zero capacity
// where a rate is involved.
// ---------------------------------------------------------------------------

/// Mean occupation rate for one hour of the day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyRate {
    pub hour: u32,
    pub average_rate: f64,
}

/// Mean occupation rate for one area on some date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AreaAverage {
    pub area_id: String,
    pub area_name: String,
    pub branch_name: String,
    pub floor_name: String,
    pub average_rate: f64,
}

/// The single busiest calendar day plus its peak record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusiestDay {
    pub date: NaiveDate,
    pub average_rate: f64,
    pub records: Vec<AreaObservation>,
    pub peak_rate: f64,
    pub peak_observed_at: NaiveDateTime,
}

fn rated(rows: &[AreaObservation]) -> impl Iterator<Item = &AreaObservation> {
    rows.iter().filter(|r| r.total_count > 0)
}

fn sort_desc_by_rate<T, F: Fn(&T) -> f64>(items: &mut [T], rate: F) {
    items.sort_by(|a, b| {
        rate(b)
            .partial_cmp(&rate(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// For each calendar date, the record(s) at that date's maximum rate.
pub fn daily_peaks(rows: &[AreaObservation]) -> Vec<AreaObservation> {
    let mut max_by_date: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in rated(rows) {
        let rate = row.occupation_rate();
        let entry = max_by_date.entry(row.observed_date()).or_insert(rate);
        if rate > *entry {
            *entry = rate;
        }
    }
    rated(rows)
        .filter(|row| {
            max_by_date
                .get(&row.observed_date())
                .is_some_and(|max| row.occupation_rate() >= *max)
        })
        .cloned()
        .collect()
}

/// The date with the highest mean rate, all of its rated records sorted by
/// rate descending, and the single peak record's rate and timestamp.
pub fn busiest_day(rows: &[AreaObservation]) -> Option<BusiestDay> {
    let mut sums: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for row in rated(rows) {
        let entry = sums.entry(row.observed_date()).or_insert((0.0, 0));
        entry.0 += row.occupation_rate();
        entry.1 += 1;
    }
    let (date, average_rate) = sums
        .into_iter()
        .map(|(date, (sum, n))| (date, sum / n as f64))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

    let mut records: Vec<AreaObservation> = rated(rows)
        .filter(|r| r.observed_date() == date)
        .cloned()
        .collect();
    sort_desc_by_rate(&mut records, AreaObservation::occupation_rate);

    let peak = records.first()?.clone();
    Some(BusiestDay {
        date,
        average_rate,
        peak_rate: peak.occupation_rate(),
        peak_observed_at: peak.observed_at,
        records,
    })
}

fn hourly_rates<'a, F>(rows: &'a [AreaObservation], date: NaiveDate, matches: F) -> Vec<HourlyRate>
where
    F: Fn(&'a AreaObservation) -> bool,
{
    let mut sums: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
    for row in rated(rows).filter(|r| r.observed_date() == date).filter(|r| matches(*r)) {
        let entry = sums.entry(row.observed_at.hour()).or_insert((0.0, 0));
        entry.0 += row.occupation_rate();
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(hour, (sum, n))| HourlyRate {
            hour,
            average_rate: if n == 0 { 0.0 } else { sum / n as f64 },
        })
        .collect()
}

/// Per-hour mean rate for one area on one date, busiest hours first.
pub fn busiest_hours_for_area(
    rows: &[AreaObservation],
    area_id: &str,
    date: NaiveDate,
) -> Vec<HourlyRate> {
    let mut out = hourly_rates(rows, date, |r| r.area_id == area_id);
    sort_desc_by_rate(&mut out, |h| h.average_rate);
    out
}

/// Per-hour mean rate for one branch on one date, in hour order.
///
/// The ascending-by-hour ordering (vs the area variant's descending-by-rate)
/// is intentional; the two endpoints have always disagreed and consumers
/// rely on each.
pub fn busiest_hours_for_branch(
    rows: &[AreaObservation],
    branch_name: &str,
    date: NaiveDate,
) -> Vec<HourlyRate> {
    // BTreeMap iteration already yields hour order.
    hourly_rates(rows, date, |r| r.branch_name == branch_name)
}

/// Mean rate per area on one date, busiest areas first.
pub fn average_occupation_by_area(rows: &[AreaObservation], date: NaiveDate) -> Vec<AreaAverage> {
    let mut sums: BTreeMap<&str, (f64, usize, &AreaObservation)> = BTreeMap::new();
    for row in rated(rows).filter(|r| r.observed_date() == date) {
        let entry = sums.entry(row.area_id.as_str()).or_insert((0.0, 0, row));
        entry.0 += row.occupation_rate();
        entry.1 += 1;
    }
    let mut out: Vec<AreaAverage> = sums
        .into_values()
        .map(|(sum, n, sample)| AreaAverage {
            area_id: sample.area_id.clone(),
            area_name: sample.area_name.clone(),
            branch_name: sample.branch_name.clone(),
            floor_name: sample.floor_name.clone(),
            average_rate: sum / n as f64,
        })
        .collect();
    sort_desc_by_rate(&mut out, |a| a.average_rate);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn obs(area_id: &str, free: u32, total: u32, at: &str) -> AreaObservation {
        AreaObservation {
            area_id: area_id.to_string(),
            branch_name: "Main".to_string(),
            floor_name: "3F".to_string(),
            area_name: format!("Area {area_id}"),
            free_count: free,
            total_count: total,
            observed_at: NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M:%S").unwrap(),
        }
    }

    fn hours() -> OpeningHours {
        OpeningHours {
            weekday_open: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            weekday_close: NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            weekend_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            weekend_close: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        }
    }

    #[test]
    fn occupation_rate_is_bounded_and_zero_for_empty_areas() {
        assert_eq!(obs("1", 5, 20, "2026-03-02 10:00:00").occupation_rate(), 75.0);
        assert_eq!(obs("1", 0, 0, "2026-03-02 10:00:00").occupation_rate(), 0.0);
        assert_eq!(obs("1", 99, 0, "2026-03-02 10:00:00").occupation_rate(), 0.0);
        // free > total clamps instead of going negative
        assert_eq!(obs("1", 30, 20, "2026-03-02 10:00:00").occupation_rate(), 0.0);
        for free in 0..=20 {
            let rate = obs("1", free, 20, "2026-03-02 10:00:00").occupation_rate();
            assert!((0.0..=100.0).contains(&rate));
        }
    }

    #[test]
    fn open_window_is_open_inclusive_close_exclusive() {
        let policy = TimeWindowPolicy::new(hours(), WeekendRule::saturday_sunday(), Duration::minutes(5));
        // 2026-03-02 is a Monday
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(policy.is_open_at(day.and_hms_opt(8, 30, 0).unwrap()));
        assert!(policy.is_open_at(day.and_hms_opt(20, 59, 59).unwrap()));
        assert!(!policy.is_open_at(day.and_hms_opt(21, 0, 0).unwrap()));
        assert!(!policy.is_open_at(day.and_hms_opt(8, 29, 59).unwrap()));
    }

    #[test]
    fn weekend_rule_selects_weekend_hours() {
        let policy = TimeWindowPolicy::new(hours(), WeekendRule::saturday_sunday(), Duration::minutes(5));
        // 2026-03-07 is a Saturday: weekday hours would say open at 08:30
        let sat = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert!(!policy.is_open_at(sat.and_hms_opt(8, 30, 0).unwrap()));
        assert!(policy.is_open_at(sat.and_hms_opt(9, 0, 0).unwrap()));
        assert!(!policy.is_open_at(sat.and_hms_opt(17, 0, 0).unwrap()));
    }

    #[test]
    fn sunday_monday_rule_treats_monday_as_weekend() {
        let policy = TimeWindowPolicy::new(hours(), WeekendRule::sunday_monday(), Duration::minutes(5));
        let mon = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(!policy.is_open_at(mon.and_hms_opt(8, 45, 0).unwrap()));
        assert!(policy.is_open_at(mon.and_hms_opt(9, 0, 0).unwrap()));
        let sat = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert!(policy.is_open_at(sat.and_hms_opt(8, 30, 0).unwrap()));
    }

    #[test]
    fn weekend_rule_parses_day_lists() {
        assert_eq!(WeekendRule::parse("sat,sun"), Some(WeekendRule::saturday_sunday()));
        assert_eq!(WeekendRule::parse("sun, mon"), Some(WeekendRule::sunday_monday()));
        assert_eq!(WeekendRule::parse("notaday"), None);
        assert_eq!(WeekendRule::parse(""), None);
    }

    #[test]
    fn closing_window_covers_only_final_minutes() {
        let policy = TimeWindowPolicy::new(hours(), WeekendRule::saturday_sunday(), Duration::minutes(5));
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(policy.within_closing_window_at(day.and_hms_opt(20, 55, 0).unwrap()));
        assert!(policy.within_closing_window_at(day.and_hms_opt(20, 59, 59).unwrap()));
        assert!(!policy.within_closing_window_at(day.and_hms_opt(20, 54, 59).unwrap()));
        assert!(!policy.within_closing_window_at(day.and_hms_opt(21, 0, 0).unwrap()));
    }

    #[test]
    fn close_instant_uses_the_dates_window() {
        let policy = TimeWindowPolicy::new(hours(), WeekendRule::saturday_sunday(), Duration::minutes(5));
        let mon = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let sat = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(policy.close_instant_on(mon), mon.and_hms_opt(21, 0, 0).unwrap());
        assert_eq!(policy.close_instant_on(sat), sat.and_hms_opt(17, 0, 0).unwrap());
    }

    #[test]
    fn daily_peaks_keeps_all_records_at_the_daily_max() {
        let rows = vec![
            obs("a", 10, 20, "2026-03-02 10:00:00"), // 50
            obs("b", 5, 20, "2026-03-02 11:00:00"),  // 75
            obs("c", 5, 20, "2026-03-02 12:00:00"),  // 75
            obs("a", 0, 20, "2026-03-03 10:00:00"),  // 100
            obs("z", 0, 0, "2026-03-03 11:00:00"),   // no capacity, ignored
        ];
        let peaks = daily_peaks(&rows);
        assert_eq!(peaks.len(), 3);
        assert!(peaks.iter().all(|r| r.occupation_rate() >= 75.0));
    }

    #[test]
    fn busiest_day_returns_day_records_and_peak() {
        let rows = vec![
            obs("a", 10, 20, "2026-03-02 10:00:00"), // 50
            obs("a", 15, 20, "2026-03-02 11:00:00"), // 25  (mean 37.5)
            obs("a", 2, 20, "2026-03-03 10:00:00"),  // 90
            obs("b", 10, 20, "2026-03-03 11:00:00"), // 50  (mean 70)
        ];
        let busiest = busiest_day(&rows).unwrap();
        assert_eq!(busiest.date, NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
        assert_eq!(busiest.records.len(), 2);
        assert_eq!(busiest.peak_rate, 90.0);
        assert_eq!(
            busiest.peak_observed_at,
            NaiveDateTime::parse_from_str("2026-03-03 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
        );
    }

    #[test]
    fn busiest_day_of_nothing_is_none() {
        assert!(busiest_day(&[]).is_none());
        let only_empty = vec![obs("z", 0, 0, "2026-03-02 10:00:00")];
        assert!(busiest_day(&only_empty).is_none());
    }

    #[test]
    fn area_hours_sort_by_rate_branch_hours_sort_by_hour() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let rows = vec![
            obs("a", 10, 20, "2026-03-02 09:00:00"), // 50
            obs("a", 2, 20, "2026-03-02 14:30:00"),  // 90
            obs("a", 4, 20, "2026-03-02 14:45:00"),  // 80 -> hour 14 avg 85
            obs("a", 12, 20, "2026-03-02 11:00:00"), // 40
        ];
        let by_area = busiest_hours_for_area(&rows, "a", date);
        assert_eq!(by_area[0].hour, 14);
        assert_eq!(by_area[0].average_rate, 85.0);
        assert_eq!(by_area.last().unwrap().hour, 11);

        let by_branch = busiest_hours_for_branch(&rows, "Main", date);
        let hour_order: Vec<u32> = by_branch.iter().map(|h| h.hour).collect();
        assert_eq!(hour_order, vec![9, 11, 14]);
    }

    #[test]
    fn busiest_hours_with_only_zero_capacity_rows_is_empty() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let rows = vec![
            obs("a", 0, 0, "2026-03-02 09:00:00"),
            obs("a", 3, 0, "2026-03-02 10:00:00"),
        ];
        assert!(busiest_hours_for_area(&rows, "a", date).is_empty());
        assert!(busiest_hours_for_branch(&rows, "Main", date).is_empty());
        assert!(average_occupation_by_area(&rows, date).is_empty());
    }

    #[test]
    fn area_averages_sort_descending() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let rows = vec![
            obs("a", 10, 20, "2026-03-02 09:00:00"), // 50
            obs("b", 2, 20, "2026-03-02 09:00:00"),  // 90
            obs("b", 4, 20, "2026-03-02 10:00:00"),  // 80 -> avg 85
        ];
        let averages = average_occupation_by_area(&rows, date);
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0].area_id, "b");
        assert_eq!(averages[0].average_rate, 85.0);
        assert_eq!(averages[1].area_id, "a");
    }
}
