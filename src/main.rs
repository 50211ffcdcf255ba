use anyhow::{Context, Result, bail};
use citoscan_client::api::PipelineApi;
use citoscan_client::candidate::UploadCandidate;
use citoscan_client::client::HttpPipelineApi;
use citoscan_client::config::{BASE_URL_ENV, Config, ConfigFile, Overrides};
use citoscan_client::controller::{SessionController, SessionEvent, SessionSnapshot};
use citoscan_client::credentials::{CredentialStore, FileCredentials};
use citoscan_client::dto::{Blob, ResultSet, SessionId};
use citoscan_client::paths::default_config_path;
use citoscan_client::preview::{PatchPreview, PreviewHandle, PreviewRegistry};
use citoscan_client::projection::project_markers;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "citoscan")]
#[command(about = "Upload cytology slides for analysis and collect the results")]
struct Cli {
    /// Config file (default: ~/.citoscan/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, e.g. http://localhost:8080/api
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Per-request timeout for JSON and image requests
    #[arg(long, global = true, value_parser = parse_duration)]
    timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload a file, wait for the analysis and save its outputs
    Analyze(AnalyzeArgs),
    /// Print a session as JSON
    Status { id: String },
    /// Print a session's results as JSON
    Results { id: String },
    /// Download the archive for one patch
    DownloadPatch {
        id: String,
        rel_path: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Download the archive of every classified cell
    DownloadCells {
        id: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Manage the stored bearer token
    #[command(subcommand)]
    Token(TokenCommand),
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    Set { token: String },
    Clear,
}

#[derive(Debug, Args, Clone)]
struct AnalyzeArgs {
    file: PathBuf,

    #[arg(long, default_value = "citoscan-out")]
    out: PathBuf,

    /// Number of top patches to plot and save
    #[arg(long)]
    top: Option<usize>,

    #[arg(long, value_parser = parse_duration)]
    poll_every: Option<Duration>,

    /// Also save thumbnails of the top patches
    #[arg(long, action = ArgAction::SetTrue)]
    patches: bool,
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::init();
    let cli = Cli::parse();

    let mut overrides = Overrides {
        base_url: cli.base_url.clone(),
        request_timeout: cli.timeout,
        ..Overrides::default()
    };
    if let Commands::Analyze(args) = &cli.command {
        overrides.poll_interval = args.poll_every;
        overrides.display_count = args.top;
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = ConfigFile::load(&config_path)?
        .resolve(std::env::var(BASE_URL_ENV).ok(), overrides)
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(FileCredentials::new(&config.token_path));

    match cli.command {
        Commands::Analyze(args) => run_analyze(&config, credentials, args).await,
        Commands::Status { id } => {
            let api = build_api(&config, credentials)?;
            let session = api.session(&SessionId::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Results { id } => {
            let api = build_api(&config, credentials)?;
            let results = api.results(&SessionId::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::DownloadPatch { id, rel_path, out } => {
            let api = build_api(&config, credentials)?;
            let blob = api.download_patch(&SessionId::new(id), &rel_path).await?;
            let out = out.unwrap_or_else(|| {
                PathBuf::from(rel_path.rsplit('/').next().unwrap_or("patch.png"))
            });
            write_blob(&out, &blob)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::DownloadCells { id, out } => {
            let api = build_api(&config, credentials)?;
            let out = out.unwrap_or_else(|| PathBuf::from(format!("cells-{id}.zip")));
            let blob = api.download_cells(&SessionId::new(id)).await?;
            write_blob(&out, &blob)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Token(TokenCommand::Set { token }) => {
            credentials.set(&token)?;
            println!("token saved to {}", config.token_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Token(TokenCommand::Clear) => {
            credentials.clear()?;
            println!("token cleared");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_api(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Arc<dyn PipelineApi>> {
    let api = HttpPipelineApi::new(&config.base_url, config.request_timeout, credentials)
        .with_context(|| format!("failed to build client for {}", config.base_url))?;
    Ok(Arc::new(api))
}

async fn run_analyze(
    config: &Config,
    credentials: Arc<dyn CredentialStore>,
    args: AnalyzeArgs,
) -> Result<ExitCode> {
    let api = build_api(config, credentials)?;
    let registry = PreviewRegistry::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Arc::clone(&api),
        registry.clone(),
        config.poll_schedule(),
        Some(event_tx),
    )?;

    let candidate = UploadCandidate::from_path(&args.file)?;
    create_dir_all(&args.out)
        .with_context(|| format!("failed to create output directory {}", args.out.display()))?;

    if let Err(err) = controller.select_file(candidate).await {
        drain_events(&mut event_rx);
        eprintln!("file not accepted: {err}");
        return Ok(ExitCode::FAILURE);
    }
    drain_events(&mut event_rx);

    if !controller.start_analysis().await? {
        bail!("analysis could not be started");
    }

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                let done = matches!(
                    event,
                    SessionEvent::AnalysisFinished { .. } | SessionEvent::PollFailed { .. }
                );
                print_event(&event);
                if done {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, abandoning session");
                controller.clear();
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let snapshot = controller.snapshot();
    if let Some(handle) = &snapshot.preview {
        save_preview(&registry, handle, &args.out.join("preview"))?;
    }
    if let Some(results) = &snapshot.results {
        let path = args.out.join("results.json");
        std::fs::write(&path, serde_json::to_string_pretty(results)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        print_summary(results, config.display_count);

        if args.patches
            && let Some(id) = &snapshot.session_id
        {
            save_patches(&api, &registry, id, results, config.display_count, &args.out).await;
        }
    }

    report_outcome(&snapshot)
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::FileAccepted { name, kind } => println!("selected {name} ({kind:?})"),
        SessionEvent::FileRejected { message } => eprintln!("rejected: {message}"),
        SessionEvent::PreviewReady { url } => println!("preview ready: {url}"),
        SessionEvent::PreviewFailed { message } => eprintln!("preview failed: {message}"),
        SessionEvent::AnalysisStarted { id, status } => {
            println!("session {id} started ({status})")
        }
        SessionEvent::StatusChanged { id, status } => println!("session {id}: {status}"),
        SessionEvent::ResultsReady { id, patches } => {
            println!("session {id}: {patches} top patches")
        }
        SessionEvent::PollFailed { message } => eprintln!("polling stopped: {message}"),
        SessionEvent::AnalysisFinished { id, status } => println!("session {id} finished: {status}"),
        SessionEvent::Cleared => println!("cleared"),
    }
}

fn print_summary(results: &ResultSet, display_count: usize) {
    println!(
        "diagnosis: {}",
        results.possible_diagnosis.as_deref().unwrap_or("-")
    );
    let tallies = &results.tallies;
    let show = |value: Option<u64>| value.map_or_else(|| "-".to_string(), |v| v.to_string());
    println!(
        "tiles: {} (background {}, tissue {}); apto {} / no apto {}",
        show(tallies.tiles_total),
        show(tallies.background_total),
        show(tallies.not_background_total),
        show(tallies.apto_total),
        show(tallies.no_apto_total),
    );
    for marker in project_markers(results, display_count) {
        println!(
            "  #{} at ({:.3}, {:.3})",
            marker.index, marker.norm_x, marker.norm_y
        );
    }
}

async fn save_patches(
    api: &Arc<dyn PipelineApi>,
    registry: &PreviewRegistry,
    id: &SessionId,
    results: &ResultSet,
    display_count: usize,
    out: &Path,
) {
    let viewer = PatchPreview::new(Arc::clone(api), registry.clone());
    let rel_paths = results
        .top_patches
        .iter()
        .filter_map(|patch| patch.rel_path.as_deref())
        .take(display_count);
    for (idx, rel_path) in rel_paths.enumerate() {
        let target = out.join(format!("patch-{}", idx + 1));
        match viewer.show(id, rel_path).await {
            Ok(Some(handle)) => {
                if let Err(err) = save_preview(registry, &handle, &target) {
                    eprintln!("patch {rel_path}: {err:#}");
                }
            }
            Ok(None) => {}
            Err(err) => eprintln!("patch {rel_path}: {err}"),
        }
    }
    viewer.hide();
}

/// Writes the bytes behind `handle` to `stem` with an extension for its MIME type.
fn save_preview(registry: &PreviewRegistry, handle: &PreviewHandle, stem: &Path) -> Result<()> {
    let Some(bytes) = registry.resolve(handle) else {
        bail!("preview {} was already released", handle.url());
    };
    let path = stem.with_extension(extension_for(&handle.mime_type));
    std::fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
    println!("saved {}", path.display());
    Ok(())
}

fn write_blob(path: &Path, blob: &Blob) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, &blob.bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("saved {} ({} bytes)", path.display(), blob.bytes.len());
    Ok(())
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        _ => "bin",
    }
}

fn report_outcome(snapshot: &SessionSnapshot) -> Result<ExitCode> {
    match &snapshot.error {
        Some(err) => {
            eprintln!("analysis failed: {err}");
            Ok(ExitCode::FAILURE)
        }
        None if snapshot.has_results() => Ok(ExitCode::SUCCESS),
        None => {
            eprintln!("analysis ended without results");
            Ok(ExitCode::FAILURE)
        }
    }
}
