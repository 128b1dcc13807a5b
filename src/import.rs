use std::io::Read;

use tracing::warn;

use crate::backend::KvBackend;
use crate::error::StoreError;
use crate::models::ClassLevel;
use crate::store::{RecordStore, StudentForm};

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    nis: String,
    nama: String,
    kelas: String,
    jk: String,
    #[serde(default)]
    jurusan: Option<String>,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped: Vec<(usize, String)>,
}

pub async fn import_csv<B: KvBackend>(
    store: &RecordStore<B>,
    csv_path: &std::path::Path,
) -> anyhow::Result<ImportSummary> {
    let file = std::fs::File::open(csv_path)?;
    import_reader(store, file).await
}

/// Rows go through the same validation as `student add`; bad rows are
/// skipped and reported with their line number.
pub async fn import_reader<B: KvBackend, R: Read>(
    store: &RecordStore<B>,
    source: R,
) -> anyhow::Result<ImportSummary> {
    let mut reader = csv::Reader::from_reader(source);
    let mut summary = ImportSummary::default();

    let rows: Vec<(usize, Result<CsvRow, csv::Error>)> = reader
        .deserialize::<CsvRow>()
        .enumerate()
        .map(|(i, row)| (i + 2, row))
        .collect();

    for (line, result) in rows {
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                warn!("line {}: {}", line, err);
                summary.skipped.push((line, err.to_string()));
                continue;
            }
        };

        let kelas = match row.kelas.parse::<ClassLevel>() {
            Ok(kelas) => kelas,
            Err(err) => {
                warn!("line {}: {}", line, err);
                summary.skipped.push((line, err));
                continue;
            }
        };

        let form = StudentForm {
            nis: Some(row.nis),
            nama: Some(row.nama),
            kelas: Some(kelas),
            jk: Some(row.jk),
            jurusan: row.jurusan,
            ..StudentForm::default()
        };

        match store.add_student(&form).await {
            Ok(_) => summary.inserted += 1,
            Err(err @ StoreError::Invalid { .. }) => {
                warn!("line {}: {}", line, err);
                summary.skipped.push((line, err.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn imports_valid_rows_and_reports_bad_ones() {
        let store = RecordStore::new(MemoryBackend::new());
        let csv = "nis,nama,kelas,jk,jurusan\n\
                   101,Andi,1,L,\n\
                   102,Budi,5,Laki-laki,IPS\n\
                   103,Citra,9,P,\n\
                   104,,2,P,\n";

        let summary = import_reader(&store, csv.as_bytes()).await.unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.skipped.len(), 2);
        assert_eq!(summary.skipped[0].0, 4);

        let upper = store.students(ClassLevel::new(5)).await.unwrap();
        assert_eq!(upper[0].jurusan, "IPS");
    }
}
