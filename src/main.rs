use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod backend;
mod config;
mod db;
mod distribution;
mod error;
mod import;
mod models;
mod normalize;
mod presenter;
mod report;
mod retry;
mod store;

use backend::{Backend, FileBackend, MemoryBackend};
use config::{BackendKind, Config, OutputFormat, DEFAULT_CONFIG_FILE};
use models::{ClassLevel, Student, Teacher};
use presenter::{MountPlan, Presenter, RenderSession};
use report::{ChartRenderer, TextBarChart};
use store::{RecordStore, StudentForm, TeacherForm};

#[derive(Parser)]
#[command(name = "sekolah-admin")]
#[command(about = "Teacher and student records with a per-class distribution report", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// JSON data file for the file backend
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Postgres connection string; selects the postgres backend
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default sekolah.toml
    InitConfig,
    /// Create or upgrade the Postgres schema
    InitDb,
    /// Load the default teachers and class 1 students
    Seed,
    /// Import students from a CSV file (nis,nama,kelas,jk[,jurusan])
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Manage teachers (guru)
    #[command(subcommand)]
    Teacher(TeacherCommand),
    /// Manage students (siswa)
    #[command(subcommand)]
    Student(StudentCommand),
    /// Show aggregate counts and recent activity
    Dashboard,
    /// Render the student distribution report once
    Distribution {
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        /// Explicit report path instead of the anchor search
        #[arg(long)]
        out: Option<PathBuf>,
        /// Use generated placeholder students when the store is empty
        #[arg(long)]
        demo: bool,
        /// Print the report instead of writing a file
        #[arg(long)]
        stdout: bool,
    },
    /// Ask running watchers to re-render
    Refresh,
    /// Keep the distribution report current until interrupted
    Watch {
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        demo: bool,
    },
}

#[derive(Subcommand)]
enum TeacherCommand {
    Add(TeacherFields),
    List,
    Show { id: String },
    Update {
        id: String,
        #[command(flatten)]
        fields: TeacherFields,
    },
    Delete { id: String },
    Search { keyword: String },
}

#[derive(Subcommand)]
enum StudentCommand {
    Add(StudentFields),
    List {
        #[arg(long)]
        class: Option<ClassLevel>,
    },
    Show { id: String },
    Update {
        id: String,
        #[command(flatten)]
        fields: StudentFields,
    },
    Delete { id: String },
    Search {
        keyword: String,
        #[arg(long)]
        class: Option<ClassLevel>,
    },
}

#[derive(Args)]
struct TeacherFields {
    #[arg(long)]
    nip: Option<String>,
    #[arg(long)]
    nama: Option<String>,
    #[arg(long)]
    jabatan: Option<String>,
    #[arg(long)]
    mata_pelajaran: Option<String>,
    #[arg(long)]
    pendidikan: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    telepon: Option<String>,
    #[arg(long)]
    riwayat: Option<String>,
    #[arg(long)]
    foto: Option<String>,
}

impl From<TeacherFields> for TeacherForm {
    fn from(f: TeacherFields) -> Self {
        TeacherForm {
            nip: f.nip,
            nama: f.nama,
            jabatan: f.jabatan,
            mata_pelajaran: f.mata_pelajaran,
            pendidikan: f.pendidikan,
            email: f.email,
            telepon: f.telepon,
            riwayat: f.riwayat,
            foto: f.foto,
        }
    }
}

#[derive(Args)]
struct StudentFields {
    #[arg(long)]
    nis: Option<String>,
    #[arg(long)]
    nama: Option<String>,
    /// Class number 1-6
    #[arg(long)]
    kelas: Option<ClassLevel>,
    /// Gender (L/P, Laki-laki/Perempuan)
    #[arg(long)]
    jk: Option<String>,
    #[arg(long)]
    tempat_lahir: Option<String>,
    #[arg(long)]
    tgl_lahir: Option<String>,
    #[arg(long)]
    agama: Option<String>,
    #[arg(long)]
    alamat: Option<String>,
    #[arg(long)]
    ayah: Option<String>,
    #[arg(long)]
    ibu: Option<String>,
    #[arg(long)]
    telepon: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    foto: Option<String>,
    #[arg(long)]
    catatan: Option<String>,
    /// Track for classes 4-6 (IPA/IPS)
    #[arg(long)]
    jurusan: Option<String>,
}

impl From<StudentFields> for StudentForm {
    fn from(f: StudentFields) -> Self {
        StudentForm {
            nis: f.nis,
            nama: f.nama,
            kelas: f.kelas,
            jk: f.jk,
            tempat_lahir: f.tempat_lahir,
            tgl_lahir: f.tgl_lahir,
            agama: f.agama,
            alamat: f.alamat,
            ayah: f.ayah,
            ibu: f.ibu,
            telepon: f.telepon,
            email: f.email,
            foto: f.foto,
            catatan: f.catatan,
            jurusan: f.jurusan,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig = cli.command {
        return init_config(&cli.config);
    }

    let mut config = Config::load_or_default(&cli.config)?;
    init_logging(&config, cli.verbose);
    debug!("configuration: {:?}", config);

    if let Some(path) = &cli.data {
        config.store.path = path.clone();
        config.store.backend = BackendKind::File;
    }
    if let Some(url) = &cli.database_url {
        config.store.database_url = Some(url.clone());
        config.store.backend = BackendKind::Postgres;
    }

    let backend = open_backend(&config).await?;

    if let Commands::InitDb = cli.command {
        let Backend::Postgres(pg) = &backend else {
            bail!("init-db needs the postgres backend (set DATABASE_URL)");
        };
        db::init_db(pg.pool()).await?;
        println!("Schema ready.");
        return Ok(());
    }

    let store = RecordStore::new(backend);
    let data_dir = store.backend().data_dir();

    match cli.command {
        Commands::InitConfig | Commands::InitDb => {}
        Commands::Seed => {
            if store.seed_defaults().await? {
                println!("Seed data inserted.");
            } else {
                println!("Store already has data, nothing seeded.");
            }
        }
        Commands::Import { csv } => {
            let summary = import::import_csv(&store, &csv)
                .await
                .with_context(|| format!("failed to import {}", csv.display()))?;
            println!(
                "Inserted {} students from {}.",
                summary.inserted,
                csv.display()
            );
            for (line, reason) in &summary.skipped {
                println!("- skipped line {line}: {reason}");
            }
        }
        Commands::Teacher(command) => run_teacher(&store, command).await?,
        Commands::Student(command) => run_student(&store, command).await?,
        Commands::Dashboard => {
            let stats = store.dashboard().await?;
            print!("{}", report::build_dashboard(&stats));
        }
        Commands::Distribution {
            format,
            out,
            demo,
            stdout,
        } => {
            let format = format.unwrap_or(config.report.format);
            let demo = demo || config.report.demo_fallback;

            if stdout {
                let result =
                    presenter::load_distribution(&store, demo, chrono::Utc::now()).await?;
                let chart = chart_renderer(&config);
                print!("{}", report::render(&result, format, chart.as_ref())?);
                return Ok(());
            }

            let mut presenter = Presenter::new(
                mount_plan(&config, format, out, data_dir),
                format,
                chart_renderer(&config),
                config.retry.policy(),
                demo,
            );
            let cancel = cancel_on_ctrl_c();
            let mut session = RenderSession::new(cancel.child_token());
            let result = presenter.refresh(&store, &mut session).await.context(
                "could not render the distribution; fix the report location and run `sekolah-admin refresh`",
            )?;

            debug!("presenter state: {:?}", presenter.state());
            if let Some(path) = presenter.container() {
                println!(
                    "Distribution of {} students written to {}.",
                    result.total,
                    path.display()
                );
            }
        }
        Commands::Refresh => {
            let marker = store.publish_refresh().await?;
            println!("Refresh #{marker} requested.");
        }
        Commands::Watch { format, out, demo } => {
            let format = format.unwrap_or(config.report.format);
            let mut presenter = Presenter::new(
                mount_plan(&config, format, out, data_dir),
                format,
                chart_renderer(&config),
                config.retry.policy(),
                demo || config.report.demo_fallback,
            );
            info!("watching for changes, Ctrl-C to stop");
            presenter
                .watch(&store, &config.watch, cancel_on_ctrl_c())
                .await?;
        }
    }

    Ok(())
}

fn init_config(path: &std::path::Path) -> anyhow::Result<()> {
    if path.exists() {
        bail!("{} already exists; edit it or remove it first", path.display());
    }

    std::fs::write(path, Config::default_toml())
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Created {} with default settings.", path.display());
    Ok(())
}

fn init_logging(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("logging disabled: {err}");
    }
}

async fn open_backend(config: &Config) -> anyhow::Result<Backend> {
    match config.store.backend {
        BackendKind::File => {
            debug!("using file store at {}", config.store.path.display());
            Ok(Backend::File(FileBackend::new(&config.store.path)))
        }
        BackendKind::Memory => Ok(Backend::Memory(MemoryBackend::new())),
        BackendKind::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .context("postgres backend needs DATABASE_URL or store.database_url")?;
            let pg = db::PgBackend::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            Ok(Backend::Postgres(pg))
        }
    }
}

fn chart_renderer(config: &Config) -> Box<dyn ChartRenderer> {
    Box::new(TextBarChart {
        height: config.report.chart_height,
    })
}

fn mount_plan(
    config: &Config,
    format: OutputFormat,
    out: Option<PathBuf>,
    data_dir: Option<PathBuf>,
) -> MountPlan {
    let mut anchors = vec![config.report.dir.clone(), PathBuf::from("reports")];
    anchors.extend(data_dir);
    anchors.push(PathBuf::from("."));

    MountPlan {
        file_name: format!("{}.{}", config.report.file_name, format.extension()),
        explicit: out,
        anchors,
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

async fn run_teacher<B: backend::KvBackend>(
    store: &RecordStore<B>,
    command: TeacherCommand,
) -> anyhow::Result<()> {
    match command {
        TeacherCommand::Add(fields) => {
            let teacher = store.add_teacher(&fields.into()).await?;
            println!("Added teacher {} ({}).", teacher.id, teacher.nama);
        }
        TeacherCommand::List => print_teachers(&store.teachers().await?),
        TeacherCommand::Show { id } => {
            let teacher = store.find_teacher(&id).await?;
            println!("{}", serde_json::to_string_pretty(&teacher)?);
        }
        TeacherCommand::Update { id, fields } => {
            let teacher = store.update_teacher(&id, &fields.into()).await?;
            println!("Updated teacher {} ({}).", teacher.id, teacher.nama);
        }
        TeacherCommand::Delete { id } => {
            let teacher = store.delete_teacher(&id).await?;
            println!("Deleted teacher {} ({}).", teacher.id, teacher.nama);
        }
        TeacherCommand::Search { keyword } => {
            print_teachers(&store.search_teachers(&keyword).await?)
        }
    }
    Ok(())
}

async fn run_student<B: backend::KvBackend>(
    store: &RecordStore<B>,
    command: StudentCommand,
) -> anyhow::Result<()> {
    match command {
        StudentCommand::Add(fields) => {
            let student = store.add_student(&fields.into()).await?;
            println!(
                "Added student {} ({}) to Class {}.",
                student.id, student.nama, student.kelas
            );
        }
        StudentCommand::List { class } => print_students(&store.students(class).await?),
        StudentCommand::Show { id } => {
            let (class, student) = store.find_student(&id).await?;
            println!("{class}");
            println!("{}", serde_json::to_string_pretty(&student)?);
        }
        StudentCommand::Update { id, fields } => {
            let student = store.update_student(&id, &fields.into()).await?;
            println!(
                "Updated student {} ({}), Class {}.",
                student.id, student.nama, student.kelas
            );
        }
        StudentCommand::Delete { id } => {
            let student = store.delete_student(&id).await?;
            println!("Deleted student {} ({}).", student.id, student.nama);
        }
        StudentCommand::Search { keyword, class } => {
            print_students(&store.search_students(&keyword, class).await?)
        }
    }
    Ok(())
}

fn print_teachers(teachers: &[Teacher]) {
    if teachers.is_empty() {
        println!("No teachers found.");
        return;
    }
    for t in teachers {
        println!(
            "- [{}] {} (NIP {}) {}",
            t.id,
            t.nama,
            if t.nip.is_empty() { "-" } else { t.nip.as_str() },
            t.jabatan
        );
    }
}

fn print_students(students: &[Student]) {
    if students.is_empty() {
        println!("No students found.");
        return;
    }
    for s in students {
        let track = if s.jurusan.is_empty() {
            String::new()
        } else {
            format!(" [{}]", s.jurusan)
        };
        println!(
            "- [{}] {} (NIS {}) Class {} {}{}",
            s.id, s.nama, s.nis, s.kelas, s.jk, track
        );
    }
}
