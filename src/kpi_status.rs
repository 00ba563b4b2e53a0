use crate::models::{AgencySummary, KpiStatus, KpiSummaryRow, OverallStatus, StatusCounts, TrackerSettings};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusThresholds {
    pub green: f64,
    pub yellow: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self::from_settings(&TrackerSettings::default())
    }
}

impl StatusThresholds {
    pub fn from_settings(settings: &TrackerSettings) -> Self {
        Self {
            green: settings.threshold_green,
            yellow: settings.threshold_yellow,
        }
    }

    pub fn classify(&self, pct: f64) -> KpiStatus {
        if pct >= self.green {
            KpiStatus::Green
        } else if pct >= self.yellow {
            KpiStatus::Yellow
        } else {
            KpiStatus::Red
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KpiEvaluation {
    pub diff: f64,
    pub pct: f64,
    pub status: KpiStatus,
}

/// Compares an actual value against its target.
///
/// A zero target cannot be divided by, so it counts as fully met as soon as anything was achieved
/// and as 0% otherwise.
pub fn compute_status(target: f64, actual: f64, thresholds: &StatusThresholds) -> KpiEvaluation {
    let diff = actual - target;
    let pct = if target > 0.0 {
        actual / target * 100.0
    } else if actual > 0.0 {
        100.0
    } else {
        0.0
    };

    KpiEvaluation {
        diff,
        pct,
        status: thresholds.classify(pct),
    }
}

pub fn count_statuses(rows: &[KpiSummaryRow]) -> StatusCounts {
    rows.iter().fold(StatusCounts::default(), |mut counts, row| {
        match row.status {
            KpiStatus::Green => counts.green += 1,
            KpiStatus::Yellow => counts.yellow += 1,
            KpiStatus::Red => counts.red += 1,
        }
        counts
    })
}

pub fn average_pct(rows: &[KpiSummaryRow]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().map(|row| row.pct).sum::<f64>() / rows.len() as f64
}

pub fn overall_status(counts: StatusCounts) -> OverallStatus {
    if counts.red > 0 {
        OverallStatus::Red
    } else if counts.yellow > 0 {
        OverallStatus::Yellow
    } else if counts.green > 0 {
        OverallStatus::Green
    } else {
        OverallStatus::None
    }
}

/// Share of green KPIs, in percent with one decimal.
pub fn health_pct(counts: StatusCounts) -> f64 {
    let total = counts.total();
    if total == 0 {
        return 0.0;
    }
    round1(f64::from(counts.green) / f64::from(total) * 100.0)
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Best performers first. Ties keep their incoming order.
pub fn rank_by_performance(summaries: &mut [AgencySummary]) {
    summaries.sort_by(|left, right| right.avg_pct.total_cmp(&left.avg_pct));
}

/// Most red first, then most yellow, then fewest green.
pub fn sort_worst_first<T>(items: &mut [T], counts: impl Fn(&T) -> StatusCounts) {
    items.sort_by(|left, right| worst_first_ordering(counts(left), counts(right)));
}

fn worst_first_ordering(left: StatusCounts, right: StatusCounts) -> Ordering {
    right
        .red
        .cmp(&left.red)
        .then_with(|| right.yellow.cmp(&left.yellow))
        .then_with(|| left.green.cmp(&right.green))
}

#[cfg(test)]
mod tests {
    use super::{
        average_pct, compute_status, count_statuses, health_pct, overall_status, rank_by_performance,
        sort_worst_first, StatusThresholds,
    };
    use crate::models::{AgencySummary, KpiStatus, KpiSummaryRow, OverallStatus, StatusCounts};

    fn row(status: KpiStatus, pct: f64) -> KpiSummaryRow {
        KpiSummaryRow {
            kpi_id: 1,
            kpi_code: "CS".to_string(),
            kpi_label: None,
            kpi_unit: None,
            target: 100.0,
            actual: pct,
            diff: pct - 100.0,
            pct,
            status,
        }
    }

    fn summary(name: &str, avg_pct: f64) -> AgencySummary {
        AgencySummary {
            agency_id: 0,
            agency_name: name.to_string(),
            city: None,
            manager_name: None,
            avg_pct,
            red_count: 0,
            yellow_count: 0,
            green_count: 0,
            kpi_details: Vec::new(),
        }
    }

    #[test]
    fn percentage_is_plain_ratio_for_positive_targets() {
        let thresholds = StatusThresholds::default();
        for (target, actual) in [(100.0, 95.0), (3.0, 1.0), (7.5, 12.25), (250.0, 0.0)] {
            let evaluation = compute_status(target, actual, &thresholds);
            assert_eq!(evaluation.pct, actual / target * 100.0);
            assert_eq!(evaluation.diff, actual - target);
        }
    }

    #[test]
    fn zero_target_is_special_cased() {
        let thresholds = StatusThresholds::default();

        let nothing = compute_status(0.0, 0.0, &thresholds);
        assert_eq!(nothing.pct, 0.0);
        assert_eq!(nothing.status, KpiStatus::Red);

        let something = compute_status(0.0, 4.0, &thresholds);
        assert_eq!(something.pct, 100.0);
        assert_eq!(something.status, KpiStatus::Green);
    }

    #[test]
    fn thresholds_are_inclusive_lower_bounds() {
        let thresholds = StatusThresholds::default();
        assert_eq!(thresholds.classify(100.0), KpiStatus::Green);
        assert_eq!(thresholds.classify(90.0), KpiStatus::Yellow);
        assert_eq!(thresholds.classify(89.999), KpiStatus::Red);
        assert_eq!(thresholds.classify(140.0), KpiStatus::Green);
    }

    #[test]
    fn march_scenario_moves_between_statuses() {
        let thresholds = StatusThresholds::default();

        let yellow = compute_status(100.0, 95.0, &thresholds);
        assert_eq!(yellow.diff, -5.0);
        assert_eq!(yellow.pct, 95.0);
        assert_eq!(yellow.status, KpiStatus::Yellow);

        assert_eq!(compute_status(100.0, 100.0, &thresholds).status, KpiStatus::Green);
        assert_eq!(compute_status(100.0, 80.0, &thresholds).status, KpiStatus::Red);
    }

    #[test]
    fn custom_thresholds_are_respected() {
        let thresholds = StatusThresholds {
            green: 80.0,
            yellow: 50.0,
        };
        assert_eq!(compute_status(100.0, 85.0, &thresholds).status, KpiStatus::Green);
        assert_eq!(compute_status(100.0, 55.0, &thresholds).status, KpiStatus::Yellow);
    }

    #[test]
    fn rollups_count_and_average() {
        let rows = vec![
            row(KpiStatus::Green, 110.0),
            row(KpiStatus::Yellow, 92.0),
            row(KpiStatus::Red, 50.0),
            row(KpiStatus::Red, 60.0),
        ];
        let counts = count_statuses(&rows);
        assert_eq!(
            counts,
            StatusCounts {
                green: 1,
                yellow: 1,
                red: 2
            }
        );
        assert_eq!(average_pct(&rows), 78.0);
        assert_eq!(average_pct(&[]), 0.0);
        assert_eq!(overall_status(counts), OverallStatus::Red);
        assert_eq!(overall_status(StatusCounts::default()), OverallStatus::None);
        assert_eq!(health_pct(counts), 25.0);
    }

    #[test]
    fn ranking_sorts_by_descending_average() {
        let mut summaries = vec![summary("a", 80.0), summary("b", 120.0), summary("c", 95.5)];
        rank_by_performance(&mut summaries);
        let names = summaries.iter().map(|s| s.agency_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "c", "a"]);
    }

    #[test]
    fn worst_first_orders_by_red_then_yellow_then_green() {
        let mut items = vec![
            ("calm", StatusCounts { green: 3, yellow: 0, red: 0 }),
            ("burning", StatusCounts { green: 0, yellow: 0, red: 2 }),
            ("warm", StatusCounts { green: 1, yellow: 2, red: 0 }),
            ("warmer", StatusCounts { green: 0, yellow: 2, red: 0 }),
            ("smoking", StatusCounts { green: 2, yellow: 0, red: 1 }),
        ];
        sort_worst_first(&mut items, |item| item.1);
        let names = items.iter().map(|item| item.0).collect::<Vec<_>>();
        assert_eq!(names, vec!["burning", "smoking", "warmer", "warm", "calm"]);
    }
}
