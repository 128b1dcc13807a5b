use chrono::{DateTime, Utc};

use crate::models::{
    ClassAggregate, ClassLevel, DataSource, DistributionResult, DistributionSummary, Gender,
    GenderTotals, NormalizedRecord, CLASS_COUNT,
};

pub const NO_CLASS: &str = "-";

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    total: usize,
    male: usize,
    female: usize,
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round1(part as f64 / total as f64 * 100.0)
    }
}

pub fn aggregate(records: &[NormalizedRecord], source: DataSource) -> DistributionResult {
    aggregate_at(records, source, Utc::now())
}

/// Group normalized records per class. Deterministic apart from
/// `generated_at`.
pub fn aggregate_at(
    records: &[NormalizedRecord],
    source: DataSource,
    generated_at: DateTime<Utc>,
) -> DistributionResult {
    let mut buckets = [Bucket::default(); CLASS_COUNT as usize];
    let mut gender = GenderTotals::default();

    for record in records {
        let bucket = &mut buckets[usize::from(record.class.number() - 1)];
        bucket.total += 1;
        match record.gender {
            Gender::Male => {
                bucket.male += 1;
                gender.male += 1;
            }
            Gender::Female => {
                bucket.female += 1;
                gender.female += 1;
            }
            Gender::Unknown => {}
        }
    }

    let total = records.len();
    let classes: Vec<ClassAggregate> = ClassLevel::all()
        .zip(buckets.iter())
        .filter(|(_, bucket)| bucket.total > 0)
        .map(|(class, bucket)| ClassAggregate {
            class: class.label(),
            total: bucket.total,
            male: bucket.male,
            female: bucket.female,
            percentage: percentage(bucket.total, total),
        })
        .collect();

    let mut largest_class = NO_CLASS.to_string();
    let mut smallest_class = NO_CLASS.to_string();
    let mut max_total = 0usize;
    let mut min_total = f64::INFINITY;

    for item in &classes {
        if item.total > max_total {
            max_total = item.total;
            largest_class = item.class.clone();
        }
        if (item.total as f64) < min_total {
            min_total = item.total as f64;
            smallest_class = item.class.clone();
        }
    }

    let mean_per_class = if classes.is_empty() {
        0.0
    } else {
        round1(total as f64 / classes.len() as f64)
    };

    DistributionResult {
        total,
        summary: DistributionSummary {
            class_count: classes.len(),
            mean_per_class,
            largest_class,
            smallest_class,
        },
        classes,
        gender,
        source,
        excluded: 0,
        generated_at,
    }
}
