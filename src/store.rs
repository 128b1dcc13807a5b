//! Record store: teacher and student collections on top of a [`KvBackend`].
//!
//! Collections are JSON arrays stored whole under well-known keys. Reads
//! never fail on bad data: an absent key is an empty collection, and an
//! unparseable value is logged and treated as empty. Every record write
//! bumps a revision counter and publishes one [`StoreEvent`] so presenters
//! can subscribe instead of wrapping save/delete calls. The activity log is
//! written quietly.

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::KvBackend;
use crate::error::StoreError;
use crate::models::{Activity, ClassLevel, DashboardStats, RecordId, Student, Teacher};
use crate::normalize::normalize_record;

pub const TEACHERS_KEY: &str = "guruData";
pub const STUDENTS_KEY: &str = "siswaData";
/// Untouched copy of the combined key taken before it is split per class.
pub const LEGACY_STUDENTS_KEY: &str = "siswaData.legacy";
pub const ACTIVITIES_KEY: &str = "recentActivities";
pub const REVISION_KEY: &str = "meta.revision";
pub const REFRESH_KEY: &str = "meta.refresh";

/// Name of the broadcast collaborators raise to request recomputation.
pub const REFRESH_EVENT: &str = "updateDistribusiSiswa";

const ACTIVITY_LIMIT: usize = 100;
const ACTOR: &str = "Admin";

pub fn class_key(class: ClassLevel) -> String {
    format!("{STUDENTS_KEY}_kelas{}", class.number())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Changed { key: String },
    RefreshRequested,
}

/// Form input for teachers. `None` leaves a field untouched on update.
#[derive(Debug, Clone, Default)]
pub struct TeacherForm {
    pub nip: Option<String>,
    pub nama: Option<String>,
    pub jabatan: Option<String>,
    pub mata_pelajaran: Option<String>,
    pub pendidikan: Option<String>,
    pub email: Option<String>,
    pub telepon: Option<String>,
    pub riwayat: Option<String>,
    pub foto: Option<String>,
}

impl TeacherForm {
    fn fields(&self) -> Vec<(&'static str, &Option<String>)> {
        vec![
            ("nip", &self.nip),
            ("nama", &self.nama),
            ("jabatan", &self.jabatan),
            ("mataPelajaran", &self.mata_pelajaran),
            ("pendidikan", &self.pendidikan),
            ("email", &self.email),
            ("telepon", &self.telepon),
            ("riwayat", &self.riwayat),
            ("foto", &self.foto),
        ]
    }
}

/// Form input for students. `None` leaves a field untouched on update.
#[derive(Debug, Clone, Default)]
pub struct StudentForm {
    pub nis: Option<String>,
    pub nama: Option<String>,
    pub kelas: Option<ClassLevel>,
    pub jk: Option<String>,
    pub tempat_lahir: Option<String>,
    pub tgl_lahir: Option<String>,
    pub agama: Option<String>,
    pub alamat: Option<String>,
    pub ayah: Option<String>,
    pub ibu: Option<String>,
    pub telepon: Option<String>,
    pub email: Option<String>,
    pub foto: Option<String>,
    pub catatan: Option<String>,
    pub jurusan: Option<String>,
}

impl StudentForm {
    fn fields(&self) -> Vec<(&'static str, &Option<String>)> {
        vec![
            ("nis", &self.nis),
            ("nama", &self.nama),
            ("jk", &self.jk),
            ("tempatLahir", &self.tempat_lahir),
            ("tglLahir", &self.tgl_lahir),
            ("agama", &self.agama),
            ("alamat", &self.alamat),
            ("ayah", &self.ayah),
            ("ibu", &self.ibu),
            ("telepon", &self.telepon),
            ("email", &self.email),
            ("foto", &self.foto),
            ("catatan", &self.catatan),
            ("jurusan", &self.jurusan),
        ]
    }
}

pub struct RecordStore<B> {
    backend: B,
    events: broadcast::Sender<StoreEvent>,
    seen: std::sync::Mutex<(u64, u64)>,
}

impl<B: KvBackend> RecordStore<B> {
    pub fn new(backend: B) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            backend,
            events,
            seen: std::sync::Mutex::new((0, 0)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Raise the refresh broadcast for in-process subscribers.
    pub fn request_refresh(&self) {
        debug!("{} raised", REFRESH_EVENT);
        let _ = self.events.send(StoreEvent::RefreshRequested);
    }

    pub async fn read_collection(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(other) => {
                warn!("key {} holds {} instead of a list, treating as empty", key, kind_of(&other));
                Ok(Vec::new())
            }
            Err(err) => {
                warn!("key {} is not valid JSON, treating as empty: {}", key, err);
                Ok(Vec::new())
            }
        }
    }

    pub async fn write_collection(&self, key: &str, items: &[Value]) -> Result<(), StoreError> {
        self.put_collection(key, items).await?;
        self.announce(key).await
    }

    async fn put_collection(&self, key: &str, items: &[Value]) -> Result<(), StoreError> {
        let body = serde_json::to_string(items)?;
        self.backend.set(key, &body).await?;
        debug!("wrote {} records to {}", items.len(), key);
        Ok(())
    }

    async fn announce(&self, key: &str) -> Result<(), StoreError> {
        self.bump_counter(REVISION_KEY).await?;
        let _ = self.events.send(StoreEvent::Changed {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn read_counter(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .backend
            .get(key)
            .await?
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0))
    }

    async fn bump_counter(&self, key: &str) -> Result<u64, StoreError> {
        let next = self.read_counter(key).await? + 1;
        self.backend.set(key, &next.to_string()).await?;
        Ok(next)
    }

    /// Raise the refresh broadcast for watchers in other processes.
    pub async fn publish_refresh(&self) -> Result<u64, StoreError> {
        let marker = self.bump_counter(REFRESH_KEY).await?;
        self.request_refresh();
        Ok(marker)
    }

    /// Compare persisted counters with the last seen values and publish
    /// events for writes made by other processes. Returns true when
    /// anything changed.
    pub async fn poll_external(&self) -> Result<bool, StoreError> {
        let revision = self.read_counter(REVISION_KEY).await?;
        let refresh = self.read_counter(REFRESH_KEY).await?;

        let (changed, refreshed) = {
            let mut seen = self
                .seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = revision != seen.0;
            let refreshed = refresh != seen.1;
            *seen = (revision, refresh);
            (changed, refreshed)
        };

        if changed {
            let _ = self.events.send(StoreEvent::Changed {
                key: REVISION_KEY.to_string(),
            });
        }
        if refreshed {
            let _ = self.events.send(StoreEvent::RefreshRequested);
        }
        Ok(changed || refreshed)
    }

    /// Record the current counters as seen without publishing anything.
    pub async fn mark_seen(&self) -> Result<(), StoreError> {
        let revision = self.read_counter(REVISION_KEY).await?;
        let refresh = self.read_counter(REFRESH_KEY).await?;
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *seen = (revision, refresh);
        Ok(())
    }

    // ----- teachers -----

    pub async fn teachers(&self) -> Result<Vec<Teacher>, StoreError> {
        let raw = self.read_collection(TEACHERS_KEY).await?;
        Ok(typed(raw, "teacher"))
    }

    pub async fn find_teacher(&self, id: &str) -> Result<Teacher, StoreError> {
        self.teachers()
            .await?
            .into_iter()
            .find(|teacher| teacher.id.matches(id))
            .ok_or_else(|| not_found("teacher", id))
    }

    pub async fn search_teachers(&self, keyword: &str) -> Result<Vec<Teacher>, StoreError> {
        let q = keyword.trim().to_lowercase();
        let teachers = self.teachers().await?;
        if q.is_empty() {
            return Ok(teachers);
        }

        Ok(teachers
            .into_iter()
            .filter(|t| {
                t.nama.to_lowercase().contains(&q)
                    || t.nip.contains(&q)
                    || t.jabatan.to_lowercase().contains(&q)
            })
            .collect())
    }

    pub async fn add_teacher(&self, form: &TeacherForm) -> Result<Teacher, StoreError> {
        let nama = form.nama.as_deref().map(str::trim).unwrap_or_default();
        if nama.is_empty() {
            return Err(StoreError::invalid("teacher", "nama is required"));
        }

        let mut list = self.read_collection(TEACHERS_KEY).await?;
        let id = next_id(&list);
        let mut record = Map::new();
        record.insert("id".to_string(), Value::from(id));
        apply_fields(&mut record, form.fields());
        let record = Value::Object(record);
        let teacher: Teacher = serde_json::from_value(record.clone())?;

        list.push(record);
        self.write_collection(TEACHERS_KEY, &list).await?;
        self.record_activity(
            "guru",
            format!("Added teacher: {} (NIP {})", teacher.nama, dash(&teacher.nip)),
        )
        .await?;
        info!("added teacher {} with id {}", teacher.nama, teacher.id);
        Ok(teacher)
    }

    pub async fn update_teacher(&self, id: &str, form: &TeacherForm) -> Result<Teacher, StoreError> {
        if matches!(form.nama.as_deref().map(str::trim), Some("")) {
            return Err(StoreError::invalid("teacher", "nama cannot be empty"));
        }

        let mut list = self.read_collection(TEACHERS_KEY).await?;
        let idx = position(&list, id).ok_or_else(|| not_found("teacher", id))?;
        if let Value::Object(record) = &mut list[idx] {
            apply_fields(record, form.fields());
        }
        let teacher: Teacher = serde_json::from_value(list[idx].clone())?;

        self.write_collection(TEACHERS_KEY, &list).await?;
        self.record_activity(
            "guru",
            format!("Edited teacher: {} (NIP {})", teacher.nama, dash(&teacher.nip)),
        )
        .await?;
        Ok(teacher)
    }

    pub async fn delete_teacher(&self, id: &str) -> Result<Teacher, StoreError> {
        let mut list = self.read_collection(TEACHERS_KEY).await?;
        let idx = position(&list, id).ok_or_else(|| not_found("teacher", id))?;
        let removed: Teacher = serde_json::from_value(list.remove(idx))?;

        self.write_collection(TEACHERS_KEY, &list).await?;
        self.record_activity(
            "guru",
            format!("Deleted teacher: {} (NIP {})", removed.nama, dash(&removed.nip)),
        )
        .await?;
        Ok(removed)
    }

    // ----- students -----

    /// Raw records of one class key. Records without a class value
    /// inherit the key's class number.
    pub async fn class_records(&self, class: ClassLevel) -> Result<Vec<Value>, StoreError> {
        let mut records = self.read_collection(&class_key(class)).await?;
        records.retain(Value::is_object);
        for record in records.iter_mut() {
            if let Value::Object(map) = record {
                let missing = match map.get("kelas") {
                    None | Some(Value::Null) => true,
                    Some(Value::String(s)) => s.trim().is_empty(),
                    Some(_) => false,
                };
                if missing {
                    map.insert("kelas".to_string(), Value::from(class.number().to_string()));
                }
            }
        }
        Ok(records)
    }

    async fn has_class_keys(&self) -> Result<bool, StoreError> {
        for class in ClassLevel::all() {
            if self.backend.get(&class_key(class)).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every stored student record, loosely typed. Per-class keys win; the
    /// combined key is read only when no per-class key exists.
    pub async fn raw_students(&self) -> Result<Vec<Value>, StoreError> {
        if self.has_class_keys().await? {
            let mut all = Vec::new();
            for class in ClassLevel::all() {
                let records = self.class_records(class).await?;
                debug!("{}: {} records", class, records.len());
                all.extend(records);
            }
            return Ok(all);
        }

        self.combined_students().await
    }

    /// The combined key, either a flat list or the legacy
    /// `{"kelas1": [...], ...}` object.
    async fn combined_students(&self) -> Result<Vec<Value>, StoreError> {
        let Some(raw) = self.backend.get(STUDENTS_KEY).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => Ok(items.into_iter().filter(Value::is_object).collect()),
            Ok(Value::Object(by_class)) => {
                let mut all = Vec::new();
                for class in ClassLevel::all() {
                    let Some(Value::Array(items)) = by_class.get(&format!("kelas{}", class.number()))
                    else {
                        continue;
                    };
                    for item in items.iter().filter(|v| v.is_object()) {
                        let mut item = item.clone();
                        if let Value::Object(map) = &mut item {
                            map.entry("kelas")
                                .or_insert_with(|| Value::from(class.number().to_string()));
                        }
                        all.push(item);
                    }
                }
                Ok(all)
            }
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(other) => {
                warn!("key {} holds {}, treating as empty", STUDENTS_KEY, kind_of(&other));
                Ok(Vec::new())
            }
            Err(err) => {
                warn!("key {} is not valid JSON, treating as empty: {}", STUDENTS_KEY, err);
                Ok(Vec::new())
            }
        }
    }

    pub async fn students(&self, class: Option<ClassLevel>) -> Result<Vec<Student>, StoreError> {
        let raw = match class {
            Some(class) => self.class_records(class).await?,
            None => self.raw_students().await?,
        };
        Ok(typed(raw, "student"))
    }

    pub async fn find_student(&self, id: &str) -> Result<(ClassLevel, Student), StoreError> {
        if !self.has_class_keys().await? {
            let combined = self.combined_students().await?;
            let record = position(&combined, id)
                .map(|idx| &combined[idx])
                .ok_or_else(|| not_found("student", id))?;
            let class = normalize_record(record)
                .map(|normalized| normalized.class)
                .map_err(|excluded| StoreError::invalid("student", excluded.reason))?;
            return Ok((class, serde_json::from_value(record.clone())?));
        }

        for class in ClassLevel::all() {
            let records = self.class_records(class).await?;
            if let Some(idx) = position(&records, id) {
                let student = serde_json::from_value(records[idx].clone())?;
                return Ok((class, student));
            }
        }
        Err(not_found("student", id))
    }

    pub async fn search_students(
        &self,
        keyword: &str,
        class: Option<ClassLevel>,
    ) -> Result<Vec<Student>, StoreError> {
        let q = keyword.trim().to_lowercase();
        let students = self.students(class).await?;
        if q.is_empty() {
            return Ok(students);
        }

        Ok(students
            .into_iter()
            .filter(|s| {
                s.nama.to_lowercase().contains(&q)
                    || s.nis.contains(&q)
                    || s.ayah.to_lowercase().contains(&q)
                    || s.ibu.to_lowercase().contains(&q)
            })
            .collect())
    }

    async fn save_class(&self, class: ClassLevel, records: &[Value]) -> Result<(), StoreError> {
        self.put_collection(&class_key(class), records).await?;
        self.sync_combined().await?;
        self.announce(&class_key(class)).await
    }

    /// Rewrite the combined mirror from the per-class keys.
    async fn sync_combined(&self) -> Result<(), StoreError> {
        let mut all = Vec::new();
        for class in ClassLevel::all() {
            all.extend(self.class_records(class).await?);
        }
        self.put_collection(STUDENTS_KEY, &all).await
    }

    /// Split a combined-only store into per-class keys before the first
    /// student write. The raw combined value is kept under
    /// [`LEGACY_STUDENTS_KEY`].
    async fn ensure_class_keys(&self) -> Result<(), StoreError> {
        if self.has_class_keys().await? {
            return Ok(());
        }
        let Some(raw) = self.backend.get(STUDENTS_KEY).await? else {
            return Ok(());
        };

        let mut by_class: Vec<Vec<Value>> = ClassLevel::all().map(|_| Vec::new()).collect();
        let mut unplaced = 0;
        for record in self.combined_students().await? {
            match normalize_record(&record) {
                Ok(normalized) => {
                    by_class[usize::from(normalized.class.number()) - 1].push(record)
                }
                Err(excluded) => {
                    warn!(
                        "student {} has no usable class ({}), left in {}",
                        excluded.id, excluded.reason, LEGACY_STUDENTS_KEY
                    );
                    unplaced += 1;
                }
            }
        }

        self.backend.set(LEGACY_STUDENTS_KEY, &raw).await?;
        for (class, records) in ClassLevel::all().zip(&by_class) {
            self.put_collection(&class_key(class), records).await?;
        }
        info!(
            "split {} into per-class keys ({} unplaced)",
            STUDENTS_KEY, unplaced
        );
        Ok(())
    }

    async fn next_student_id(&self) -> Result<i64, StoreError> {
        Ok(next_id(&self.raw_students().await?))
    }

    pub async fn add_student(&self, form: &StudentForm) -> Result<Student, StoreError> {
        let class = validate_new_student(form)?;
        self.ensure_class_keys().await?;
        let id = self.next_student_id().await?;

        let mut record = Map::new();
        record.insert("id".to_string(), Value::from(id));
        record.insert("kelas".to_string(), Value::from(class.number().to_string()));
        apply_fields(&mut record, form.fields());
        enforce_track(&mut record, class);
        record.insert(
            "createdAt".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
        let record = Value::Object(record);
        let student: Student = serde_json::from_value(record.clone())?;

        let mut records = self.class_records(class).await?;
        records.push(record);
        self.save_class(class, &records).await?;
        self.record_activity(
            "siswa",
            format!(
                "Added student: {} (NIS {}) {}",
                student.nama, student.nis, class
            ),
        )
        .await?;
        info!("added student {} to {}", student.nama, class);
        Ok(student)
    }

    pub async fn update_student(&self, id: &str, form: &StudentForm) -> Result<Student, StoreError> {
        for (name, value) in [("nama", &form.nama), ("nis", &form.nis), ("jk", &form.jk)] {
            if matches!(value.as_deref().map(str::trim), Some("")) {
                return Err(StoreError::invalid("student", format!("{name} cannot be empty")));
            }
        }

        self.ensure_class_keys().await?;
        let (old_class, _) = self.find_student(id).await?;
        let new_class = form.kelas.unwrap_or(old_class);

        let mut old_records = self.class_records(old_class).await?;
        let idx = position(&old_records, id).ok_or_else(|| not_found("student", id))?;

        let updated = if new_class == old_class {
            let Value::Object(record) = &mut old_records[idx] else {
                return Err(StoreError::invalid("student", "stored record is not an object"));
            };
            apply_fields(record, form.fields());
            enforce_track(record, new_class);
            let updated = old_records[idx].clone();
            self.save_class(old_class, &old_records).await?;
            updated
        } else {
            let Value::Object(mut record) = old_records.remove(idx) else {
                return Err(StoreError::invalid("student", "stored record is not an object"));
            };
            record.insert("kelas".to_string(), Value::from(new_class.number().to_string()));
            apply_fields(&mut record, form.fields());
            enforce_track(&mut record, new_class);
            let updated = Value::Object(record);

            self.put_collection(&class_key(old_class), &old_records).await?;
            let mut new_records = self.class_records(new_class).await?;
            new_records.push(updated.clone());
            self.save_class(new_class, &new_records).await?;
            info!("moved student {} from {} to {}", id, old_class, new_class);
            updated
        };

        let student: Student = serde_json::from_value(updated)?;
        self.record_activity(
            "siswa",
            format!(
                "Edited student: {} (NIS {}) {}",
                student.nama, student.nis, new_class
            ),
        )
        .await?;
        Ok(student)
    }

    pub async fn delete_student(&self, id: &str) -> Result<Student, StoreError> {
        self.ensure_class_keys().await?;
        let (class, _) = self.find_student(id).await?;
        let mut records = self.class_records(class).await?;
        let idx = position(&records, id).ok_or_else(|| not_found("student", id))?;
        let removed: Student = serde_json::from_value(records.remove(idx))?;

        self.save_class(class, &records).await?;
        self.record_activity(
            "siswa",
            format!(
                "Deleted student: {} (NIS {}) {}",
                removed.nama, removed.nis, class
            ),
        )
        .await?;
        Ok(removed)
    }

    // ----- activity & dashboard -----

    pub async fn record_activity(&self, kind: &str, message: String) -> Result<(), StoreError> {
        let mut activities = self.read_collection(ACTIVITIES_KEY).await?;
        let activity = Activity {
            id: format!("act-{}", Uuid::new_v4()),
            time: Utc::now(),
            kind: kind.to_string(),
            actor: ACTOR.to_string(),
            message,
        };
        activities.insert(0, serde_json::to_value(&activity)?);
        activities.truncate(ACTIVITY_LIMIT);
        self.put_collection(ACTIVITIES_KEY, &activities).await
    }

    pub async fn activities(&self, limit: usize) -> Result<Vec<Activity>, StoreError> {
        let raw = self.read_collection(ACTIVITIES_KEY).await?;
        let mut activities: Vec<Activity> = typed(raw, "activity");
        activities.truncate(limit);
        Ok(activities)
    }

    pub async fn dashboard(&self) -> Result<DashboardStats, StoreError> {
        let mut per_class = Vec::new();
        if self.has_class_keys().await? {
            for class in ClassLevel::all() {
                per_class.push((class, self.class_records(class).await?.len()));
            }
        } else {
            let combined = self.combined_students().await?;
            for class in ClassLevel::all() {
                let count = combined
                    .iter()
                    .filter(|record| {
                        record
                            .get("kelas")
                            .map(|v| match v {
                                Value::String(s) => s.trim() == class.number().to_string(),
                                other => other.as_u64() == Some(u64::from(class.number())),
                            })
                            .unwrap_or(false)
                    })
                    .count();
                per_class.push((class, count));
            }
        }

        let lower_grades = per_class
            .iter()
            .filter(|(class, _)| !class.has_track())
            .map(|(_, count)| count)
            .sum();
        let upper_grades = per_class
            .iter()
            .filter(|(class, _)| class.has_track())
            .map(|(_, count)| count)
            .sum();

        Ok(DashboardStats {
            total_students: per_class.iter().map(|(_, count)| count).sum(),
            total_teachers: self.teachers().await?.len(),
            total_classes: ClassLevel::all().count(),
            lower_grades,
            upper_grades,
            per_class,
            recent_activities: self.activities(5).await?,
        })
    }

    /// Insert the default teachers and class-1 students when their keys
    /// are absent. Returns true when anything was written.
    pub async fn seed_defaults(&self) -> Result<bool, StoreError> {
        let mut seeded = false;

        if self.backend.get(TEACHERS_KEY).await?.is_none() {
            let teachers = vec![
                serde_json::json!({
                    "id": 1,
                    "nip": "001",
                    "nama": "Alifi Amalki",
                    "jabatan": "Wali Kelas 1",
                    "mataPelajaran": "Matematika, IPA",
                    "pendidikan": "S1 Pendidikan Guru Sekolah Dasar",
                    "email": "alifi.amalki@sdnusantara.sch.id",
                    "telepon": "0812-3456-7890",
                    "riwayat": "SD Nusantara (2020 - Sekarang)\nSD Harapan Bangsa (2018 - 2020)",
                }),
                serde_json::json!({
                    "id": 2,
                    "nip": "002",
                    "nama": "Nandika Dwi A",
                    "jabatan": "Wali Kelas 2",
                    "mataPelajaran": "Informatika, Bahasa Inggris",
                    "pendidikan": "S1 Pendidikan Guru Sekolah Dasar",
                    "email": "nandika.dwi@sdnusantara.sch.id",
                    "telepon": "0812-3456-7890",
                    "riwayat": "SD Nusantara (2025 - Sekarang)\nSD Harapan Bangsa (2018 - 2020)",
                }),
            ];
            self.write_collection(TEACHERS_KEY, &teachers).await?;
            seeded = true;
        }

        if !self.has_class_keys().await? && self.backend.get(STUDENTS_KEY).await?.is_none() {
            let class_one = vec![
                serde_json::json!({"id": 1, "nis": "001", "nama": "Andi", "kelas": "1", "jk": "Laki-laki"}),
                serde_json::json!({"id": 2, "nis": "002", "nama": "Siti", "kelas": "1", "jk": "Perempuan"}),
                serde_json::json!({"id": 3, "nis": "003", "nama": "Alifi", "kelas": "1", "jk": "Laki-laki"}),
            ];
            for class in ClassLevel::all() {
                let records = if class.number() == 1 {
                    class_one.clone()
                } else {
                    Vec::new()
                };
                self.write_collection(&class_key(class), &records).await?;
            }
            self.sync_combined().await?;
            seeded = true;
        }

        Ok(seeded)
    }
}

fn validate_new_student(form: &StudentForm) -> Result<ClassLevel, StoreError> {
    let required = [("nama", &form.nama), ("nis", &form.nis), ("jk", &form.jk)];
    for (name, value) in required {
        if value.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            return Err(StoreError::invalid("student", format!("{name} is required")));
        }
    }
    form.kelas
        .ok_or_else(|| StoreError::invalid("student", "kelas is required"))
}

/// Only classes 4-6 keep a track.
fn enforce_track(record: &mut Map<String, Value>, class: ClassLevel) {
    if !class.has_track() {
        record.insert("jurusan".to_string(), Value::from(""));
    }
}

fn apply_fields(record: &mut Map<String, Value>, fields: Vec<(&'static str, &Option<String>)>) {
    for (name, value) in fields {
        if let Some(value) = value {
            record.insert(name.to_string(), Value::from(value.trim()));
        }
    }
}

fn record_id(record: &Value) -> Option<RecordId> {
    record
        .get("id")
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

fn position(records: &[Value], id: &str) -> Option<usize> {
    records
        .iter()
        .position(|record| record_id(record).is_some_and(|rid| rid.matches(id)))
}

fn next_id(records: &[Value]) -> i64 {
    records
        .iter()
        .filter_map(record_id)
        .filter_map(|id| id.as_number())
        .max()
        .unwrap_or(0)
        + 1
}

fn typed<T: serde::de::DeserializeOwned>(raw: Vec<Value>, kind: &str) -> Vec<T> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("skipping unreadable {} record: {}", kind, err);
                None
            }
        })
        .collect()
}

fn not_found(kind: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn class(n: u8) -> ClassLevel {
        ClassLevel::new(n).unwrap()
    }

    fn student_form(nama: &str, kelas: u8, jk: &str) -> StudentForm {
        StudentForm {
            nis: Some(format!("NIS-{nama}")),
            nama: Some(nama.to_string()),
            kelas: Some(class(kelas)),
            jk: Some(jk.to_string()),
            jurusan: Some("IPA".to_string()),
            ..StudentForm::default()
        }
    }

    #[tokio::test]
    async fn absent_and_corrupt_keys_read_as_empty() {
        let store = RecordStore::new(MemoryBackend::new());
        assert!(store.read_collection(TEACHERS_KEY).await.unwrap().is_empty());

        store.backend().set(TEACHERS_KEY, "{broken").await.unwrap();
        assert!(store.read_collection(TEACHERS_KEY).await.unwrap().is_empty());

        store.backend().set(TEACHERS_KEY, "{\"a\": 1}").await.unwrap();
        assert!(store.teachers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn teacher_crud_cycle() {
        let store = RecordStore::new(MemoryBackend::new());
        let added = store
            .add_teacher(&TeacherForm {
                nama: Some("Alifi Amalki".to_string()),
                nip: Some("001".to_string()),
                jabatan: Some("Wali Kelas 1".to_string()),
                ..TeacherForm::default()
            })
            .await
            .unwrap();
        assert_eq!(added.id, RecordId::Number(1));

        let updated = store
            .update_teacher(
                "1",
                &TeacherForm {
                    jabatan: Some("Kepala Sekolah".to_string()),
                    ..TeacherForm::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.nama, "Alifi Amalki");
        assert_eq!(updated.jabatan, "Kepala Sekolah");

        assert_eq!(store.search_teachers("kepala").await.unwrap().len(), 1);
        assert_eq!(store.search_teachers("001").await.unwrap().len(), 1);

        store.delete_teacher("1").await.unwrap();
        assert!(matches!(
            store.find_teacher("1").await,
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(store.activities(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn teacher_requires_name() {
        let store = RecordStore::new(MemoryBackend::new());
        let result = store.add_teacher(&TeacherForm::default()).await;
        assert!(matches!(result, Err(StoreError::Invalid { .. })));
    }

    #[tokio::test]
    async fn update_preserves_unknown_fields() {
        let store = RecordStore::new(MemoryBackend::new());
        store
            .write_collection(TEACHERS_KEY, &[json!({"id": "id17", "nama": "Lama", "extra": 5})])
            .await
            .unwrap();

        store
            .update_teacher(
                "id17",
                &TeacherForm {
                    nama: Some("Baru".to_string()),
                    ..TeacherForm::default()
                },
            )
            .await
            .unwrap();

        let raw = store.read_collection(TEACHERS_KEY).await.unwrap();
        assert_eq!(raw[0]["extra"], json!(5));
        assert_eq!(raw[0]["nama"], json!("Baru"));
    }

    #[tokio::test]
    async fn student_ids_are_unique_across_classes() {
        let store = RecordStore::new(MemoryBackend::new());
        let a = store.add_student(&student_form("Andi", 1, "L")).await.unwrap();
        let b = store.add_student(&student_form("Budi", 5, "L")).await.unwrap();
        assert_eq!(a.id, RecordId::Number(1));
        assert_eq!(b.id, RecordId::Number(2));
        assert_eq!(a.jurusan, "");
        assert_eq!(b.jurusan, "IPA");
        assert!(!a.created_at.is_empty());
    }

    #[tokio::test]
    async fn student_requires_mandatory_fields() {
        let store = RecordStore::new(MemoryBackend::new());
        let mut form = student_form("Andi", 1, "L");
        form.jk = None;
        assert!(matches!(
            store.add_student(&form).await,
            Err(StoreError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn moving_student_between_classes_keeps_id() {
        let store = RecordStore::new(MemoryBackend::new());
        store.add_student(&student_form("Citra", 2, "P")).await.unwrap();

        let moved = store
            .update_student(
                "1",
                &StudentForm {
                    kelas: Some(class(4)),
                    ..StudentForm::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.id, RecordId::Number(1));
        assert_eq!(moved.kelas, "4");

        assert!(store.students(Some(class(2))).await.unwrap().is_empty());
        let (found_class, found) = store.find_student("1").await.unwrap();
        assert_eq!(found_class, class(4));
        assert_eq!(found.nama, "Citra");

        let combined = store.read_collection(STUDENTS_KEY).await.unwrap();
        assert_eq!(combined.len(), 1);
    }

    #[tokio::test]
    async fn delete_student_updates_mirror() {
        let store = RecordStore::new(MemoryBackend::new());
        store.add_student(&student_form("Dewi", 3, "P")).await.unwrap();
        store.add_student(&student_form("Eka", 3, "L")).await.unwrap();

        let removed = store.delete_student("1").await.unwrap();
        assert_eq!(removed.nama, "Dewi");
        assert_eq!(store.read_collection(STUDENTS_KEY).await.unwrap().len(), 1);
        assert!(store.delete_student("1").await.is_err());
    }

    #[tokio::test]
    async fn per_class_keys_fill_missing_class() {
        let store = RecordStore::new(MemoryBackend::new());
        store
            .write_collection(&class_key(class(3)), &[json!({"id": 9, "nama": "Gita"})])
            .await
            .unwrap();

        let raw = store.raw_students().await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0]["kelas"], json!("3"));
    }

    #[tokio::test]
    async fn combined_key_is_read_only_without_class_keys() {
        let store = RecordStore::new(MemoryBackend::new());
        store
            .write_collection(STUDENTS_KEY, &[json!({"id": 1, "kelas": "2"})])
            .await
            .unwrap();
        assert_eq!(store.raw_students().await.unwrap().len(), 1);

        store
            .write_collection(&class_key(class(1)), &[])
            .await
            .unwrap();
        assert!(store.raw_students().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_combined_object_is_flattened() {
        let store = RecordStore::new(MemoryBackend::new());
        store
            .backend()
            .set(
                STUDENTS_KEY,
                r#"{"kelas1": [{"id": 1, "nama": "Andi"}], "kelas2": [], "kelas6": [{"id": 2}]}"#,
            )
            .await
            .unwrap();

        let raw = store.raw_students().await.unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0]["kelas"], json!("1"));
        assert_eq!(raw[1]["kelas"], json!("6"));
    }

    #[tokio::test]
    async fn first_student_write_keeps_legacy_combined_records() {
        let store = RecordStore::new(MemoryBackend::new());
        let legacy = r#"{"kelas1": [{"id": 1, "nama": "Andi", "jk": "L"}, {"id": 2, "nama": "Siti", "jk": "P"}], "kelas2": []}"#;
        store.backend().set(STUDENTS_KEY, legacy).await.unwrap();

        let (found_class, found) = store.find_student("2").await.unwrap();
        assert_eq!(found_class, class(1));
        assert_eq!(found.nama, "Siti");

        let added = store.add_student(&student_form("Baru", 2, "L")).await.unwrap();
        assert_eq!(added.id, RecordId::Number(3));

        let names: Vec<String> = store
            .students(None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.nama)
            .collect();
        assert_eq!(names, ["Andi", "Siti", "Baru"]);
        assert_eq!(store.read_collection(STUDENTS_KEY).await.unwrap().len(), 3);
        assert_eq!(store.find_student("1").await.unwrap().1.nama, "Andi");
        assert_eq!(
            store.backend().get(LEGACY_STUDENTS_KEY).await.unwrap().as_deref(),
            Some(legacy)
        );

        store.delete_student("2").await.unwrap();
        assert_eq!(store.students(Some(class(1))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn student_write_publishes_one_event() {
        let store = RecordStore::new(MemoryBackend::new());
        let mut events = store.subscribe();

        store.add_student(&student_form("Andi", 2, "L")).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Changed {
                key: class_key(class(2))
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(store.activities(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn writes_publish_change_events() {
        let store = RecordStore::new(MemoryBackend::new());
        let mut events = store.subscribe();

        store.write_collection(TEACHERS_KEY, &[]).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Changed {
                key: TEACHERS_KEY.to_string()
            }
        );

        store.request_refresh();
        assert_eq!(events.recv().await.unwrap(), StoreEvent::RefreshRequested);
    }

    #[tokio::test]
    async fn poll_external_detects_foreign_writes() {
        let store = RecordStore::new(MemoryBackend::new());
        store.mark_seen().await.unwrap();
        assert!(!store.poll_external().await.unwrap());

        store.backend().set(REVISION_KEY, "7").await.unwrap();
        let mut events = store.subscribe();
        assert!(store.poll_external().await.unwrap());
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Changed { .. }));

        store.backend().set(REFRESH_KEY, "1").await.unwrap();
        assert!(store.poll_external().await.unwrap());
        assert_eq!(events.recv().await.unwrap(), StoreEvent::RefreshRequested);
    }

    #[tokio::test]
    async fn seed_is_idempotent_and_feeds_dashboard() {
        let store = RecordStore::new(MemoryBackend::new());
        assert!(store.seed_defaults().await.unwrap());
        assert!(!store.seed_defaults().await.unwrap());

        let stats = store.dashboard().await.unwrap();
        assert_eq!(stats.total_students, 3);
        assert_eq!(stats.total_teachers, 2);
        assert_eq!(stats.total_classes, 6);
        assert_eq!(stats.lower_grades, 3);
        assert_eq!(stats.upper_grades, 0);
        assert_eq!(stats.per_class[0], (class(1), 3));
    }

    #[tokio::test]
    async fn activity_log_is_capped_newest_first() {
        let store = RecordStore::new(MemoryBackend::new());
        for i in 0..(ACTIVITY_LIMIT + 5) {
            store.record_activity("siswa", format!("event {i}")).await.unwrap();
        }

        let all = store.activities(usize::MAX).await.unwrap();
        assert_eq!(all.len(), ACTIVITY_LIMIT);
        assert_eq!(all[0].message, format!("event {}", ACTIVITY_LIMIT + 4));
    }
}
