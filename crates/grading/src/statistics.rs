//! Per-session label tallies and the day-over-day defect trend.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use strum::{Display, IntoEnumIterator};

use crate::types::{ClassificationResult, DefectStatus, Ripeness};

/// Fewest recorded items for which a trend is reported
const MIN_TREND_RECORDS: usize = 10;
/// Days forming the "recent" window of a trend
const RECENT_DAYS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRecord {
    pub timestamp: NaiveDateTime,
    pub size: String,
    pub ripeness: Ripeness,
    pub defect: DefectStatus,
    pub diameter_mm: f64,
    pub defect_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyTally {
    pub sizes: BTreeMap<String, usize>,
    pub ripeness: BTreeMap<Ripeness, usize>,
    pub defects: BTreeMap<DefectStatus, usize>,
}

impl DailyTally {
    pub fn total(&self) -> usize {
        self.sizes.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LabelShare {
    pub count: usize,
    pub percent: f64,
}

impl LabelShare {
    fn of(count: usize, total: usize) -> Self {
        let percent = if total > 0 {
            count as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self { count, percent }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total: usize,
    pub sizes: BTreeMap<String, LabelShare>,
    pub ripeness: BTreeMap<Ripeness, LabelShare>,
    pub defects: BTreeMap<DefectStatus, LabelShare>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum TrendDirection {
    Improving,
    Stable,
    Worsening,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyQuality {
    pub date: NaiveDate,
    pub mean_defect_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityTrend {
    pub days: Vec<DailyQuality>,
    pub direction: TrendDirection,
    /// Mean defect ratio of the latest day, 0 without data
    pub current_mean: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStatistics {
    daily: BTreeMap<NaiveDate, DailyTally>,
    records: Vec<ItemRecord>,
}

impl SessionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally every result under the calendar day of `timestamp`.
    pub fn record(&mut self, results: &[ClassificationResult], timestamp: NaiveDateTime) {
        let tally = self.daily.entry(timestamp.date()).or_default();
        for result in results {
            *tally.sizes.entry(result.size().to_string()).or_default() += 1;
            *tally.ripeness.entry(result.ripeness()).or_default() += 1;
            *tally.defects.entry(result.defect()).or_default() += 1;

            self.records.push(ItemRecord {
                timestamp,
                size: result.size().to_string(),
                ripeness: result.ripeness(),
                defect: result.defect(),
                diameter_mm: result.features.d_eq_mm,
                defect_ratio: result.features.defect_ratio,
            });
        }
    }

    pub fn records(&self) -> &[ItemRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn days(&self) -> impl Iterator<Item = &NaiveDate> {
        self.daily.keys()
    }

    /// Counts and percentages for one day. Every ripeness and defect label is
    /// listed, zero counts included.
    pub fn daily_summary(&self, date: NaiveDate) -> Option<DailySummary> {
        let tally = self.daily.get(&date)?;
        let total = tally.total();

        let sizes = tally
            .sizes
            .iter()
            .map(|(label, &count)| (label.clone(), LabelShare::of(count, total)))
            .collect();
        let ripeness = Ripeness::iter()
            .map(|r| (r, LabelShare::of(tally.ripeness.get(&r).copied().unwrap_or(0), total)))
            .collect();
        let defects = DefectStatus::iter()
            .map(|d| (d, LabelShare::of(tally.defects.get(&d).copied().unwrap_or(0), total)))
            .collect();

        Some(DailySummary {
            date,
            total,
            sizes,
            ripeness,
            defects,
        })
    }

    /// Mean defect ratio over the last `days` recorded days, and whether the
    /// most recent three days are worse or better than the days before them.
    pub fn quality_trend(&self, days: usize) -> QualityTrend {
        if self.records.len() < MIN_TREND_RECORDS {
            return QualityTrend {
                days: Vec::new(),
                direction: TrendDirection::InsufficientData,
                current_mean: 0.0,
            };
        }

        let mut per_day: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
        for record in &self.records {
            let entry = per_day.entry(record.timestamp.date()).or_default();
            entry.0 += record.defect_ratio;
            entry.1 += 1;
        }

        let skip = per_day.len().saturating_sub(days);
        let window: Vec<DailyQuality> = per_day
            .into_iter()
            .skip(skip)
            .map(|(date, (sum, n))| DailyQuality {
                date,
                mean_defect_ratio: sum / n as f64,
            })
            .collect();

        let current_mean = window.last().map_or(0.0, |d| d.mean_defect_ratio);
        let direction = if window.len() < RECENT_DAYS {
            TrendDirection::InsufficientData
        } else {
            let (earlier, recent) = window.split_at(window.len() - RECENT_DAYS);
            trend_direction(mean_of(recent), mean_of(earlier))
        };

        QualityTrend {
            days: window,
            direction,
            current_mean,
        }
    }
}

fn mean_of(days: &[DailyQuality]) -> Option<f64> {
    if days.is_empty() {
        return None;
    }
    Some(days.iter().map(|d| d.mean_defect_ratio).sum::<f64>() / days.len() as f64)
}

fn trend_direction(recent: Option<f64>, earlier: Option<f64>) -> TrendDirection {
    match (recent, earlier) {
        (Some(recent), Some(earlier)) if recent > earlier * 1.1 => TrendDirection::Worsening,
        (Some(recent), Some(earlier)) if recent < earlier * 0.9 => TrendDirection::Improving,
        _ => TrendDirection::Stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelMeans, Classification, FeatureSet, PixelRect};

    fn result(size: &str, ripeness: Ripeness, defect_ratio: f64) -> ClassificationResult {
        ClassificationResult {
            features: FeatureSet {
                id: 0,
                bbox: PixelRect::new(0, 0, 10, 10),
                centroid: [5.0, 5.0],
                area_px: 80.0,
                perimeter: 32.0,
                d_eq_px: 10.0,
                d_eq_mm: 60.0,
                calibrated: true,
                circularity: 0.95,
                aspect_ratio: 1.0,
                means: ChannelMeans::default(),
                color_ratios: BTreeMap::new(),
                defect_ratio,
                defect_regions: Vec::new(),
                freshness: None,
            },
            classification: Classification {
                size: size.to_string(),
                ripeness,
                defect: if defect_ratio >= 0.06 {
                    DefectStatus::Defective
                } else {
                    DefectStatus::Ok
                },
                shape_ok: None,
            },
        }
    }

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_daily_summary_percentages() {
        let mut stats = SessionStatistics::new();
        stats.record(
            &[
                result("M", Ripeness::Ripe, 0.0),
                result("M", Ripeness::Green, 0.1),
                result("L", Ripeness::Ripe, 0.0),
                result("S", Ripeness::Ripe, 0.0),
            ],
            at(1),
        );

        let summary = stats.daily_summary(at(1).date()).unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.sizes["M"], LabelShare { count: 2, percent: 50.0 });
        assert_eq!(summary.ripeness[&Ripeness::Ripe].percent, 75.0);
        assert_eq!(summary.ripeness[&Ripeness::Medium].count, 0);
        assert_eq!(summary.defects[&DefectStatus::Defective].count, 1);

        assert!(stats.daily_summary(at(2).date()).is_none());
    }

    #[test]
    fn test_trend_needs_enough_records() {
        let mut stats = SessionStatistics::new();
        for day in 1..=5 {
            stats.record(&[result("M", Ripeness::Ripe, 0.1)], at(day));
        }
        assert_eq!(stats.quality_trend(7).direction, TrendDirection::InsufficientData);
    }

    #[test]
    fn test_trend_needs_three_days() {
        let mut stats = SessionStatistics::new();
        let batch: Vec<_> = (0..6).map(|_| result("M", Ripeness::Ripe, 0.1)).collect();
        stats.record(&batch, at(1));
        stats.record(&batch, at(2));

        let trend = stats.quality_trend(7);
        assert_eq!(trend.days.len(), 2);
        assert_eq!(trend.direction, TrendDirection::InsufficientData);
    }

    #[test]
    fn test_worsening_and_improving() {
        let mut worse = SessionStatistics::new();
        let mut better = SessionStatistics::new();
        for day in 1..=6 {
            let rising = if day > 3 { 0.2 } else { 0.05 };
            let falling = if day > 3 { 0.02 } else { 0.2 };
            worse.record(&[result("M", Ripeness::Ripe, rising), result("M", Ripeness::Ripe, rising)], at(day));
            better.record(&[result("M", Ripeness::Ripe, falling), result("M", Ripeness::Ripe, falling)], at(day));
        }

        let trend = worse.quality_trend(7);
        assert_eq!(trend.direction, TrendDirection::Worsening);
        assert_eq!(trend.days.len(), 6);
        assert!((trend.current_mean - 0.2).abs() < 1e-12);

        assert_eq!(better.quality_trend(7).direction, TrendDirection::Improving);
    }

    #[test]
    fn test_window_limits_days() {
        let mut stats = SessionStatistics::new();
        for day in 1..=10 {
            stats.record(&[result("M", Ripeness::Ripe, 0.05)], at(day));
        }
        let trend = stats.quality_trend(4);
        assert_eq!(trend.days.len(), 4);
        assert_eq!(trend.days[0].date, at(7).date());
        assert_eq!(trend.direction, TrendDirection::Stable);
    }
}
