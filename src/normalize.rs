//! Canonicalize loosely-typed student records into [`NormalizedRecord`]s.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::models::{ClassLevel, ExcludedRecord, Gender, NormalizedRecord, CLASS_PREFIX};

pub const DEMO_ID_PREFIX: &str = "demo-";

const GENDER_KEYS: [&str; 2] = ["jk", "jenis_kelamin"];
const FEMALE_TOKENS: [&str; 3] = ["perempuan", "female", "wanita"];
const MALE_TOKENS: [&str; 3] = ["laki", "male", "pria"];
const DEMO_NAMES: [&str; 10] = [
    "Andi", "Budi", "Citra", "Dewi", "Eka", "Fajar", "Gita", "Hadi", "Indra", "Joko",
];

#[derive(Debug, Default)]
pub struct Normalized {
    pub records: Vec<NormalizedRecord>,
    pub excluded: Vec<ExcludedRecord>,
}

/// Render a raw class value as a label. Numbers become `Class n`, strings
/// without the prefix get it prepended, and `Kelas n` is read as `Class n`.
pub fn normalize_class(raw: &Value) -> Option<String> {
    let text = match raw {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };

    if text.is_empty() {
        return None;
    }

    if text.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("{CLASS_PREFIX} {text}"));
    }

    if text.starts_with(CLASS_PREFIX) {
        return Some(text);
    }

    if let Some(rest) = text
        .get(..5)
        .filter(|head| head.eq_ignore_ascii_case("kelas"))
        .map(|_| text[5..].trim())
    {
        return Some(format!("{CLASS_PREFIX} {rest}"));
    }

    Some(format!("{CLASS_PREFIX} {text}"))
}

pub fn normalize_gender(raw: &str) -> Gender {
    let lower = raw.trim().to_lowercase();
    if lower.is_empty() {
        return Gender::Unknown;
    }

    if lower == "p" || FEMALE_TOKENS.iter().any(|token| lower.contains(token)) {
        Gender::Female
    } else if lower == "l" || MALE_TOKENS.iter().any(|token| lower.contains(token)) {
        Gender::Male
    } else {
        Gender::Unknown
    }
}

fn gender_field(record: &Value) -> String {
    GENDER_KEYS
        .iter()
        .filter_map(|key| record.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::String(_) | Value::Null => None,
            other => Some(other.to_string()),
        })
        .unwrap_or_default()
}

fn record_id(record: &Value) -> String {
    match record.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "-".to_string(),
    }
}

pub fn normalize_record(record: &Value) -> Result<NormalizedRecord, ExcludedRecord> {
    let id = record_id(record);
    let raw_class = record.get("kelas").cloned().unwrap_or(Value::Null);

    let Some(label) = normalize_class(&raw_class) else {
        return Err(ExcludedRecord {
            id,
            raw_class: raw_class.to_string(),
            reason: "missing class".to_string(),
        });
    };

    let Some(class) = ClassLevel::from_label(&label) else {
        return Err(ExcludedRecord {
            id,
            raw_class: raw_class.to_string(),
            reason: format!("unknown class label {label:?}"),
        });
    };

    Ok(NormalizedRecord {
        id,
        class,
        gender: normalize_gender(&gender_field(record)),
    })
}

/// Normalize every record, setting aside those without a known class.
pub fn normalize(raw: &[Value]) -> Normalized {
    let mut out = Normalized::default();

    for record in raw {
        match normalize_record(record) {
            Ok(normalized) => out.records.push(normalized),
            Err(excluded) => {
                warn!(
                    "excluding student {} from distribution: {}",
                    excluded.id, excluded.reason
                );
                out.excluded.push(excluded);
            }
        }
    }

    debug!(
        "normalized {} records, excluded {}",
        out.records.len(),
        out.excluded.len()
    );
    out
}

/// Placeholder records for an empty store: 3-7 per class, tagged with
/// [`DEMO_ID_PREFIX`]. Never persisted.
pub fn synthesize_demo<R: Rng>(rng: &mut R) -> Vec<Value> {
    let mut records = Vec::new();

    for class in ClassLevel::all() {
        let n = class.number();
        let count = rng.gen_range(3..=7);
        for i in 0..count {
            let name = DEMO_NAMES.choose(rng).copied().unwrap_or("Siswa");
            let jk = if rng.gen_bool(0.5) {
                "Laki-laki"
            } else {
                "Perempuan"
            };
            let jurusan = if class.has_track() {
                if rng.gen_bool(0.5) {
                    "IPA"
                } else {
                    "IPS"
                }
            } else {
                ""
            };

            records.push(json!({
                "id": format!("{DEMO_ID_PREFIX}{n}-{i}"),
                "nis": format!("202400{n}{i}"),
                "nama": format!("{name} {n}"),
                "kelas": n.to_string(),
                "jk": jk,
                "jurusan": jurusan,
            }));
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn numeric_class_values_get_prefix() {
        assert_eq!(normalize_class(&json!("2")), Some("Class 2".to_string()));
        assert_eq!(normalize_class(&json!(5)), Some("Class 5".to_string()));
        assert_eq!(normalize_class(&json!(" 3 ")), Some("Class 3".to_string()));
    }

    #[test]
    fn prefixed_and_alias_labels() {
        assert_eq!(normalize_class(&json!("Class 4")), Some("Class 4".to_string()));
        assert_eq!(normalize_class(&json!("Kelas 6")), Some("Class 6".to_string()));
        assert_eq!(normalize_class(&json!("kelas1")), Some("Class 1".to_string()));
        assert_eq!(normalize_class(&json!("A")), Some("Class A".to_string()));
        assert_eq!(normalize_class(&json!("")), None);
        assert_eq!(normalize_class(&Value::Null), None);
        assert_eq!(normalize_class(&json!(true)), None);
    }

    #[test]
    fn gender_codes_and_words() {
        assert_eq!(normalize_gender("L"), Gender::Male);
        assert_eq!(normalize_gender("Laki-laki"), Gender::Male);
        assert_eq!(normalize_gender("p"), Gender::Female);
        assert_eq!(normalize_gender("PEREMPUAN"), Gender::Female);
        assert_eq!(normalize_gender("female"), Gender::Female);
        assert_eq!(normalize_gender("male"), Gender::Male);
        assert_eq!(normalize_gender("unknown"), Gender::Unknown);
        assert_eq!(normalize_gender(""), Gender::Unknown);
    }

    #[test]
    fn gender_is_read_from_either_key() {
        let by_code = normalize_record(&json!({"id": 1, "kelas": "1", "jk": "L"})).unwrap();
        let by_word =
            normalize_record(&json!({"id": 2, "kelas": "1", "jenis_kelamin": "Perempuan"}))
                .unwrap();
        assert_eq!(by_code.gender, Gender::Male);
        assert_eq!(by_word.gender, Gender::Female);
    }

    #[test]
    fn out_of_range_class_is_excluded() {
        let out = normalize(&[
            json!({"id": 1, "kelas": "9", "jk": "L"}),
            json!({"id": 2, "kelas": "2", "jk": "P"}),
            json!({"id": 3, "nama": "tanpa kelas"}),
        ]);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].class, ClassLevel::new(2).unwrap());
        assert_eq!(out.excluded.len(), 2);
        assert_eq!(out.excluded[0].id, "1");
        assert_eq!(out.excluded[1].reason, "missing class");
    }

    #[test]
    fn demo_records_are_marked_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let raw = synthesize_demo(&mut rng);
        let out = normalize(&raw);

        assert!(out.excluded.is_empty());
        assert!(out.records.iter().all(|r| r.id.starts_with(DEMO_ID_PREFIX)));
        for class in ClassLevel::all() {
            let count = out.records.iter().filter(|r| r.class == class).count();
            assert!((3..=7).contains(&count), "{class} has {count}");
        }

        let lower_with_track = raw.iter().any(|r| {
            r["kelas"].as_str().and_then(|k| k.parse::<u8>().ok()).unwrap_or(0) < 4
                && r["jurusan"] != json!("")
        });
        assert!(!lower_with_track);
    }
}
