//! CircleNet - headless glomerulus detection
//!
//! The `circlenet` command hosts the CircleNet extension outside the viewer:
//! it installs the extension into an in-process host, opens the given image
//! and triggers detection, then reports what was imported.
//!
//! ## Commands
//!
//! - `detect`: Run detection for one image and optionally export the result
//! - `provision`: Download and unpack models and scripts ahead of time
//! - `layout`: Show where assets and results live

use anyhow::{Context, Result};
use circlenet_ext::telemetry::init_tracing;
use circlenet_ext::{
    ActionHandler, ActiveImage, CircleNetExtension, DetectionOrchestrator, DetectorConfig,
    HostExtension, HostHandle, PathObject, SharedHierarchy,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "circlenet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run CircleNet glomerulus detection on whole-slide images", long_about = None)]
struct Cli {
    /// Enable verbose output (includes detector output lines)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Provisioning root (default: the user's desktop)
    #[arg(long, global = true, env = "CIRCLENET_ROOT")]
    root: Option<PathBuf>,

    /// Python interpreter (default: discovered on PATH)
    #[arg(long, global = true, env = "CIRCLENET_PYTHON")]
    python: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection for an image and import the result
    Detect {
        /// Image path or host server path (`file:/data/slide1.svs`)
        #[arg(short, long)]
        image: String,

        /// Write the imported objects to this GeoJSON file
        #[arg(short, long)]
        export: Option<PathBuf>,

        /// Kill the detector after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Download models and scripts without running detection
    Provision,

    /// Print the workspace layout
    Layout,
}

/// In-process host: one open image, actions kept in memory, errors to stderr
struct HeadlessHost {
    image: String,
    hierarchy: Arc<SharedHierarchy>,
    actions: Mutex<Vec<(String, String, ActionHandler)>>,
}

impl HeadlessHost {
    fn open(image: &str) -> Self {
        HeadlessHost {
            image: image.to_string(),
            hierarchy: Arc::new(SharedHierarchy::new()),
            actions: Mutex::new(Vec::new()),
        }
    }

    fn action_count(&self) -> usize {
        self.actions.lock().map(|a| a.len()).unwrap_or_default()
    }
}

impl HostHandle for HeadlessHost {
    fn active_image(&self) -> Option<ActiveImage> {
        Some(ActiveImage {
            server_path: self.image.clone(),
            hierarchy: self.hierarchy.clone(),
        })
    }

    fn register_action(&self, menu_path: &str, label: &str, handler: ActionHandler) {
        info!(menu = menu_path, label, "Registered action");
        if let Ok(mut actions) = self.actions.lock() {
            actions.push((menu_path.to_string(), label.to_string(), handler));
        }
    }

    fn show_error(&self, title: &str, message: &str) {
        eprintln!("{}: {}", title, message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = DetectorConfig::from_env();
    if let Some(root) = &cli.root {
        config = config.with_root(root);
    }
    if let Some(python) = &cli.python {
        config = config.with_interpreter(python);
    }

    match cli.command {
        Commands::Detect {
            image,
            export,
            timeout,
        } => {
            if let Some(secs) = timeout {
                config = config.with_timeout_secs(secs);
            }
            cmd_detect(config, &image, export, cli.json).await
        }
        Commands::Provision => cmd_provision(config).await,
        Commands::Layout => cmd_layout(config, cli.json),
    }
}

/// Install the extension into a headless host and run detection once
async fn cmd_detect(
    config: DetectorConfig,
    image: &str,
    export: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let orchestrator =
        DetectionOrchestrator::new(config).context("Failed to set up detection")?;
    let extension =
        CircleNetExtension::new(Arc::new(orchestrator), tokio::runtime::Handle::current());

    let host = Arc::new(HeadlessHost::open(image));
    extension.install(host.clone());
    info!(
        extension = extension.name(),
        actions = host.action_count(),
        "Extension installed"
    );

    let mut job = extension.submit(host.clone());
    let report = tokio::select! {
        joined = &mut job => joined.context("Detection task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling detection");
            extension.shutdown();
            job.await.context("Detection task panicked")?
        }
    }
    .context("Detection failed")?;

    let objects = host.hierarchy.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Job:       {}", report.job_id);
        println!("Image:     {}", report.image_path.display());
        println!("Result:    {}", report.result_path.display());
        if report.result_missing {
            println!("Imported:  0 (detector wrote no result)");
        } else {
            println!("Imported:  {}", report.imported);
        }
        if let Some((x0, y0, x1, y1)) = union_bounds(&objects) {
            println!("Extent:    ({:.0}, {:.0}) - ({:.0}, {:.0})", x0, y0, x1, y1);
        }
        println!(
            "Duration:  {:.1}s",
            (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
        );
    }

    if let Some(path) = export {
        write_export(&path, &objects)?;
        info!(path = %path.display(), count = objects.len(), "Exported objects");
    }

    Ok(())
}

async fn cmd_provision(config: DetectorConfig) -> Result<()> {
    let orchestrator =
        DetectionOrchestrator::new(config).context("Failed to set up provisioning")?;
    let cancel = CancellationToken::new();

    let summary = tokio::select! {
        summary = orchestrator.provision(&cancel) => summary,
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("Provisioning interrupted");
        }
    }
    .context("Provisioning failed")?;

    println!(
        "Downloaded {}, already present {}, extracted {} file(s) into {}",
        summary.downloaded,
        summary.skipped,
        summary.extracted,
        orchestrator.layout().scripts_dir().display()
    );
    Ok(())
}

#[derive(Serialize)]
struct LayoutView {
    root: PathBuf,
    model_dir: PathBuf,
    archive: PathBuf,
    scripts_dir: PathBuf,
    script: PathBuf,
    demo_dir: PathBuf,
    target_dir: PathBuf,
    result_dir: PathBuf,
}

fn cmd_layout(config: DetectorConfig, json: bool) -> Result<()> {
    let layout = circlenet_ext::WorkspaceLayout::from_config(&config)
        .context("Failed to determine provisioning root")?;
    let view = LayoutView {
        root: layout.root().to_path_buf(),
        model_dir: layout.model_dir(),
        archive: layout.archive_path(),
        script: layout.scripts_dir().join(&config.script_path),
        scripts_dir: layout.scripts_dir(),
        demo_dir: layout.demo_dir(),
        result_dir: circlenet_ext::locator::result_directory(&layout.target_dir()),
        target_dir: layout.target_dir(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("Root:        {}", view.root.display());
        println!("Models:      {}", view.model_dir.display());
        println!("Archive:     {}", view.archive.display());
        println!("Scripts:     {}", view.scripts_dir.display());
        println!("Script:      {}", view.script.display());
        println!("Demo output: {}", view.demo_dir.display());
        println!("Target:      {}", view.target_dir.display());
        println!("Results:     {}", view.result_dir.display());
    }
    Ok(())
}

fn union_bounds(objects: &[PathObject]) -> Option<(f64, f64, f64, f64)> {
    objects
        .iter()
        .filter_map(|o| o.geometry.bounds())
        .reduce(|(a0, b0, a1, b1), (c0, d0, c1, d1)| {
            (a0.min(c0), b0.min(d0), a1.max(c1), b1.max(d1))
        })
}

/// GeoJSON in the same shape the importer reads
/// Write `objects` to `path` as a pretty-printed GeoJSON FeatureCollection
fn write_export(path: &Path, objects: &[PathObject]) -> Result<()> {
    let body = serde_json::to_string_pretty(&feature_collection(objects))?;
    std::fs::write(path, body).with_context(|| format!("Failed to write export to {:?}", path))
}

fn feature_collection(objects: &[PathObject]) -> Value {
    let features: Vec<Value> = objects.iter().map(feature).collect();
    json!({ "type": "FeatureCollection", "features": features })
}

fn feature(object: &PathObject) -> Value {
    let mut properties = serde_json::Map::new();
    properties.insert("objectType".to_string(), json!(object.kind));
    if let Some(class) = &object.classification {
        let mut classification = json!({ "name": class.name });
        if let Some(color) = class.color {
            classification["color"] = json!(color);
        }
        properties.insert("classification".to_string(), classification);
    }
    if let Some(name) = &object.name {
        properties.insert("name".to_string(), json!(name));
    }
    if object.locked {
        properties.insert("isLocked".to_string(), json!(true));
    }
    if !object.measurements.is_empty() {
        properties.insert("measurements".to_string(), json!(object.measurements));
    }

    let mut feature = json!({
        "type": "Feature",
        "geometry": object.geometry,
        "properties": properties,
    });
    if let Some(id) = &object.id {
        feature["id"] = json!(id);
    }
    feature
}
