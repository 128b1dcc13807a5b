use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CLASS_PREFIX: &str = "Class";
pub const CLASS_COUNT: u8 = 6;

/// One of the six fixed grade groupings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ClassLevel(u8);

impl ClassLevel {
    pub fn new(number: u8) -> Option<Self> {
        (1..=CLASS_COUNT).contains(&number).then_some(Self(number))
    }

    pub fn all() -> impl Iterator<Item = ClassLevel> {
        (1..=CLASS_COUNT).map(ClassLevel)
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn label(self) -> String {
        format!("{CLASS_PREFIX} {}", self.0)
    }

    /// Tracks (jurusan) only apply to the upper classes.
    pub fn has_track(self) -> bool {
        self.0 >= 4
    }

    pub fn from_label(label: &str) -> Option<Self> {
        label
            .strip_prefix(CLASS_PREFIX)
            .map(str::trim)
            .and_then(|rest| rest.parse::<u8>().ok())
            .and_then(Self::new)
    }
}

impl TryFrom<u8> for ClassLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("class must be 1-{CLASS_COUNT}, got {value}"))
    }
}

impl From<ClassLevel> for u8 {
    fn from(value: ClassLevel) -> Self {
        value.0
    }
}

impl fmt::Display for ClassLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl std::str::FromStr for ClassLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid class number: {s}"))?;
        Self::try_from(number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

/// Stored identifiers are either numbers or strings ("id1700000000").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Text(String),
}

impl RecordId {
    pub fn matches(&self, query: &str) -> bool {
        self.to_string() == query.trim()
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            RecordId::Number(n) => Some(*n),
            RecordId::Text(s) => s.parse().ok(),
        }
    }
}

impl Default for RecordId {
    fn default() -> Self {
        RecordId::Text(String::new())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Number(n) => write!(f, "{n}"),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

/// Accepts strings, numbers and null for fields the page stored loosely.
pub fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Teacher {
    pub id: RecordId,
    #[serde(deserialize_with = "lenient_string")]
    pub nip: String,
    #[serde(deserialize_with = "lenient_string")]
    pub nama: String,
    #[serde(deserialize_with = "lenient_string")]
    pub jabatan: String,
    #[serde(deserialize_with = "lenient_string")]
    pub mata_pelajaran: String,
    #[serde(deserialize_with = "lenient_string")]
    pub pendidikan: String,
    #[serde(deserialize_with = "lenient_string")]
    pub email: String,
    #[serde(deserialize_with = "lenient_string")]
    pub telepon: String,
    #[serde(deserialize_with = "lenient_string")]
    pub riwayat: String,
    #[serde(deserialize_with = "lenient_string")]
    pub foto: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Student {
    pub id: RecordId,
    #[serde(deserialize_with = "lenient_string")]
    pub nis: String,
    #[serde(deserialize_with = "lenient_string")]
    pub nama: String,
    #[serde(deserialize_with = "lenient_string")]
    pub kelas: String,
    #[serde(deserialize_with = "lenient_string")]
    pub jk: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tempat_lahir: String,
    #[serde(deserialize_with = "lenient_string")]
    pub tgl_lahir: String,
    #[serde(deserialize_with = "lenient_string")]
    pub agama: String,
    #[serde(deserialize_with = "lenient_string")]
    pub alamat: String,
    #[serde(deserialize_with = "lenient_string")]
    pub ayah: String,
    #[serde(deserialize_with = "lenient_string")]
    pub ibu: String,
    #[serde(deserialize_with = "lenient_string")]
    pub telepon: String,
    #[serde(deserialize_with = "lenient_string")]
    pub email: String,
    #[serde(deserialize_with = "lenient_string")]
    pub foto: String,
    #[serde(deserialize_with = "lenient_string")]
    pub catatan: String,
    #[serde(deserialize_with = "lenient_string")]
    pub jurusan: String,
    #[serde(deserialize_with = "lenient_string")]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub id: String,
    pub class: ClassLevel,
    pub gender: Gender,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedRecord {
    pub id: String,
    pub raw_class: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Stored,
    Demo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassAggregate {
    pub class: String,
    pub total: usize,
    pub male: usize,
    pub female: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenderTotals {
    pub male: usize,
    pub female: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSummary {
    pub class_count: usize,
    pub mean_per_class: f64,
    pub largest_class: String,
    pub smallest_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionResult {
    pub total: usize,
    pub classes: Vec<ClassAggregate>,
    pub gender: GenderTotals,
    pub summary: DistributionSummary,
    pub source: DataSource,
    pub excluded: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_students: usize,
    pub total_teachers: usize,
    pub total_classes: usize,
    pub lower_grades: usize,
    pub upper_grades: usize,
    pub per_class: Vec<(ClassLevel, usize)>,
    pub recent_activities: Vec<Activity>,
}
