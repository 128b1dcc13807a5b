//! Distribution presenter: mounts the report file, runs the
//! store → normalize → aggregate pipeline and renders the result.
//!
//! Lifecycle: `Uninitialized → ContainerMissing → ContainerReady →
//! Rendering → Rendered`. A removed report file sends the presenter back
//! to `ContainerMissing`; every refresh goes through `Rendering` again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::KvBackend;
use crate::config::{OutputFormat, WatchConfig};
use crate::distribution::aggregate_at;
use crate::error::RenderError;
use crate::models::{DataSource, DistributionResult};
use crate::normalize::{normalize, synthesize_demo};
use crate::report::{self, ChartRenderer};
use crate::retry::RetryPolicy;
use crate::store::{RecordStore, StoreEvent};

pub const LOADING_PLACEHOLDER: &str = "Memuat distribusi siswa...\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
    Uninitialized,
    ContainerMissing,
    ContainerReady,
    Rendering,
    Rendered,
}

/// Per-cycle context handed through one render.
#[derive(Debug)]
pub struct RenderSession {
    pub generated_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub attempts: u32,
}

impl RenderSession {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            generated_at: Utc::now(),
            cancel,
            attempts: 0,
        }
    }
}

/// Where the report file may live, in order of preference.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub file_name: String,
    pub explicit: Option<PathBuf>,
    pub anchors: Vec<PathBuf>,
}

impl MountPlan {
    /// Reuse an existing report file, otherwise create one at the first
    /// anchor that exists.
    pub async fn create_container(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            if is_file(path).await {
                return Some(path.clone());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(err) = tokio::fs::create_dir_all(parent).await {
                    warn!("cannot prepare {}: {}", parent.display(), err);
                    return None;
                }
            }
            return place(path).await;
        }

        for anchor in &self.anchors {
            let path = anchor.join(&self.file_name);
            if is_file(&path).await {
                return Some(path);
            }
        }

        for anchor in &self.anchors {
            let is_dir = tokio::fs::metadata(anchor)
                .await
                .is_ok_and(|meta| meta.is_dir());
            if is_dir {
                if let Some(path) = place(&anchor.join(&self.file_name)).await {
                    return Some(path);
                }
            }
        }
        None
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

async fn place(path: &Path) -> Option<PathBuf> {
    match tokio::fs::write(path, LOADING_PLACEHOLDER).await {
        Ok(()) => {
            info!("report container created at {}", path.display());
            Some(path.to_path_buf())
        }
        Err(err) => {
            warn!("cannot create {}: {}", path.display(), err);
            None
        }
    }
}

/// Read, normalize and aggregate the current store contents.
pub async fn load_distribution<B: KvBackend>(
    store: &RecordStore<B>,
    demo_fallback: bool,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<DistributionResult> {
    let mut raw = store
        .raw_students()
        .await
        .context("failed to read student records")?;

    let mut source = DataSource::Stored;
    if raw.is_empty() && demo_fallback {
        info!("store is empty, using demo students");
        raw = synthesize_demo(&mut rand::thread_rng());
        source = DataSource::Demo;
    }

    let normalized = normalize(&raw);
    let mut result = aggregate_at(&normalized.records, source, generated_at);
    result.excluded = normalized.excluded.len();
    Ok(result)
}

pub struct Presenter {
    state: PresenterState,
    plan: MountPlan,
    container: Option<PathBuf>,
    format: OutputFormat,
    chart: Box<dyn ChartRenderer>,
    retry: RetryPolicy,
    demo_fallback: bool,
}

impl Presenter {
    pub fn new(
        plan: MountPlan,
        format: OutputFormat,
        chart: Box<dyn ChartRenderer>,
        retry: RetryPolicy,
        demo_fallback: bool,
    ) -> Self {
        Self {
            state: PresenterState::Uninitialized,
            plan,
            container: None,
            format,
            chart,
            retry,
            demo_fallback,
        }
    }

    pub fn state(&self) -> PresenterState {
        self.state
    }

    pub fn container(&self) -> Option<&Path> {
        self.container.as_deref()
    }

    pub async fn mount(&mut self, session: &mut RenderSession) -> Result<PathBuf, RenderError> {
        self.state = PresenterState::ContainerMissing;
        let plan = &self.plan;
        let attempts = &mut session.attempts;

        let path = self
            .retry
            .run(&session.cancel, move |attempt| {
                *attempts = attempt;
                plan.create_container()
            })
            .await?;

        self.container = Some(path.clone());
        self.state = PresenterState::ContainerReady;
        Ok(path)
    }

    /// Passive check of the report file. Returns true when it was removed
    /// or still shows the loading placeholder.
    pub async fn needs_render(&mut self) -> bool {
        let Some(path) = &self.container else {
            return true;
        };

        match tokio::fs::read_to_string(path).await {
            Ok(content) => content == LOADING_PLACEHOLDER,
            Err(_) => {
                warn!("report container {} disappeared", path.display());
                self.container = None;
                self.state = PresenterState::ContainerMissing;
                true
            }
        }
    }

    /// Recompute and write the report, mounting the container first when
    /// needed.
    pub async fn refresh<B: KvBackend>(
        &mut self,
        store: &RecordStore<B>,
        session: &mut RenderSession,
    ) -> anyhow::Result<DistributionResult> {
        let path = match &self.container {
            Some(path) if is_file(path).await => path.clone(),
            _ => self.mount(session).await?,
        };

        self.state = PresenterState::Rendering;
        let result = load_distribution(store, self.demo_fallback, session.generated_at).await?;
        let body = report::render(&result, self.format, self.chart.as_ref())?;

        if let Err(err) = tokio::fs::write(&path, body).await {
            self.container = None;
            self.state = PresenterState::ContainerMissing;
            return Err(RenderError::from(err).into());
        }

        self.state = PresenterState::Rendered;
        info!(
            "rendered distribution of {} students across {} classes to {}",
            result.total,
            result.summary.class_count,
            path.display()
        );
        Ok(result)
    }

    /// One refresh whose failure is reported but never propagated.
    async fn render_cycle<B: KvBackend>(&mut self, store: &RecordStore<B>, cancel: &CancellationToken) {
        let mut session = RenderSession::new(cancel.child_token());
        match self.refresh(store, &mut session).await {
            Ok(_) => {}
            Err(err) => match err.downcast_ref::<RenderError>() {
                Some(RenderError::Cancelled) => debug!("render cancelled"),
                Some(RenderError::MissingContainer { attempts }) => {
                    error!(
                        "no report container after {} attempts; run `sekolah-admin refresh` to retry",
                        attempts
                    );
                }
                _ => error!("render failed: {:#}", err),
            },
        }
    }

    /// Keep the report current until `cancel` fires.
    pub async fn watch<B: KvBackend>(
        &mut self,
        store: &RecordStore<B>,
        config: &WatchConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut events = store.subscribe();
        store.mark_seen().await?;
        self.render_cycle(store, &cancel).await;

        let mut check = tokio::time::interval(Duration::from_secs(config.check_interval_secs.max(1)));
        let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(10)));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("watch stopped");
                    break;
                }
                event = events.recv() => match event {
                    Ok(StoreEvent::Changed { key }) => {
                        debug!("store changed ({}), re-rendering", key);
                        self.render_cycle(store, &cancel).await;
                    }
                    Ok(StoreEvent::RefreshRequested) => {
                        info!("refresh requested");
                        self.render_cycle(store, &cancel).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("skipped {} store events", skipped);
                        self.render_cycle(store, &cancel).await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = check.tick() => {
                    if self.needs_render().await {
                        self.render_cycle(store, &cancel).await;
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = store.poll_external().await {
                        warn!("failed to poll store: {}", err);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::models::ClassLevel;
    use crate::report::{NoChart, TextBarChart};
    use crate::store::StudentForm;
    use tempfile::TempDir;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn presenter(plan: MountPlan) -> Presenter {
        Presenter::new(
            plan,
            OutputFormat::Markdown,
            Box::new(TextBarChart { height: 4 }),
            fast_retry(3),
            false,
        )
    }

    fn plan(anchors: Vec<PathBuf>) -> MountPlan {
        MountPlan {
            file_name: "distribusi-siswa.md".to_string(),
            explicit: None,
            anchors,
        }
    }

    async fn add(store: &RecordStore<MemoryBackend>, nama: &str, kelas: u8, jk: &str) {
        store
            .add_student(&StudentForm {
                nis: Some(format!("N-{nama}")),
                nama: Some(nama.to_string()),
                kelas: ClassLevel::new(kelas),
                jk: Some(jk.to_string()),
                ..StudentForm::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mount_uses_first_existing_anchor() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("public");
        let main = dir.path().join("reports");
        std::fs::create_dir(&main).unwrap();

        let path = plan(vec![missing, main.clone(), dir.path().to_path_buf()])
            .create_container()
            .await
            .unwrap();
        assert_eq!(path, main.join("distribusi-siswa.md"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), LOADING_PLACEHOLDER);
    }

    #[tokio::test]
    async fn mount_reuses_existing_container() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a");
        let second = dir.path().join("b");
        std::fs::create_dir(&first).unwrap();
        std::fs::create_dir(&second).unwrap();
        std::fs::write(second.join("distribusi-siswa.md"), "old report").unwrap();

        let path = plan(vec![first, second.clone()])
            .create_container()
            .await
            .unwrap();
        assert_eq!(path, second.join("distribusi-siswa.md"));
    }

    #[tokio::test]
    async fn explicit_path_creates_parents() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("x").join("y").join("report.md");
        let mount = MountPlan {
            explicit: Some(out.clone()),
            ..plan(Vec::new())
        };
        assert_eq!(mount.create_container().await, Some(out));
    }

    #[tokio::test]
    async fn missing_anchors_exhaust_retries() {
        let dir = TempDir::new().unwrap();
        let mut presenter = presenter(plan(vec![dir.path().join("nope")]));
        let mut session = RenderSession::new(CancellationToken::new());

        let result = presenter.mount(&mut session).await;
        assert!(matches!(
            result,
            Err(RenderError::MissingContainer { attempts: 3 })
        ));
        assert_eq!(session.attempts, 3);
        assert_eq!(presenter.state(), PresenterState::ContainerMissing);
    }

    #[tokio::test]
    async fn refresh_renders_store_contents() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(MemoryBackend::new());
        add(&store, "Andi", 1, "L").await;
        add(&store, "Siti", 1, "P").await;
        add(&store, "Budi", 2, "L").await;

        let mut presenter = presenter(plan(vec![dir.path().to_path_buf()]));
        assert_eq!(presenter.state(), PresenterState::Uninitialized);

        let mut session = RenderSession::new(CancellationToken::new());
        let result = presenter.refresh(&store, &mut session).await.unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(presenter.state(), PresenterState::Rendered);

        let written = std::fs::read_to_string(presenter.container().unwrap()).unwrap();
        assert!(written.contains("**Total: 3 peserta didik**"));
        assert!(written.contains("| Class 2 | 1 | 1 | 0 |"));
    }

    #[tokio::test]
    async fn removed_container_is_recreated() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(MemoryBackend::new());
        let mut presenter = presenter(plan(vec![dir.path().to_path_buf()]));

        let mut session = RenderSession::new(CancellationToken::new());
        presenter.refresh(&store, &mut session).await.unwrap();
        let path = presenter.container().unwrap().to_path_buf();
        assert!(!presenter.needs_render().await);

        std::fs::remove_file(&path).unwrap();
        assert!(presenter.needs_render().await);
        assert_eq!(presenter.state(), PresenterState::ContainerMissing);

        let mut session = RenderSession::new(CancellationToken::new());
        presenter.refresh(&store, &mut session).await.unwrap();
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("Belum ada data siswa"));
    }

    #[tokio::test]
    async fn demo_fallback_is_opt_in() {
        let store = RecordStore::new(MemoryBackend::new());
        let at = Utc::now();

        let plain = load_distribution(&store, false, at).await.unwrap();
        assert_eq!(plain.total, 0);
        assert_eq!(plain.source, DataSource::Stored);

        let demo = load_distribution(&store, true, at).await.unwrap();
        assert!(demo.total >= 18);
        assert_eq!(demo.source, DataSource::Demo);
        assert_eq!(demo.classes.len(), 6);
    }

    #[tokio::test]
    async fn excluded_records_are_counted_not_aggregated() {
        let store = RecordStore::new(MemoryBackend::new());
        store
            .write_collection(
                crate::store::STUDENTS_KEY,
                &[
                    serde_json::json!({"id": 1, "kelas": "9", "jk": "L"}),
                    serde_json::json!({"id": 2, "kelas": 2, "jk": "p"}),
                ],
            )
            .await
            .unwrap();

        let result = load_distribution(&store, false, Utc::now()).await.unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.excluded, 1);
        assert_eq!(result.classes[0].female, 1);
    }

    #[tokio::test]
    async fn watch_rerenders_on_store_change() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(MemoryBackend::new());
        let mut presenter = Presenter::new(
            plan(vec![dir.path().to_path_buf()]),
            OutputFormat::Markdown,
            Box::new(NoChart),
            fast_retry(2),
            false,
        );
        let path = dir.path().join("distribusi-siswa.md");
        let cancel = CancellationToken::new();
        let config = WatchConfig {
            check_interval_secs: 1,
            poll_interval_ms: 10,
        };

        let driver = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            add(&store, "Joko", 5, "Laki-laki").await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            let content = std::fs::read_to_string(&path).unwrap_or_default();
            cancel.cancel();
            content
        };

        let (watched, content) = tokio::join!(presenter.watch(&store, &config, cancel.clone()), driver);
        watched.unwrap();
        assert!(content.contains("`Class 5: 1`"), "report was: {content}");
    }
}
