use anyhow::Context;
use clap::Parser;
use flyerexport::cdp::CdpHost;
use flyerexport::{ExportConfig, ExporterBuilder, ExporterSettings, FileSink, PrintOverride};
use std::path::PathBuf;
use std::sync::Arc;

/// Render a flyer template to a print-ready PNG.
#[derive(Parser, Debug)]
#[command(name = "flyerexport", version, about)]
struct Cli {
    /// Template path or URL, resolved against the origin
    #[arg(long)]
    template: String,

    /// Link the flyer encodes (sent as the `qr` query parameter)
    #[arg(long)]
    qr: String,

    /// Origin hosting the templates (overrides the settings file)
    #[arg(long)]
    origin: Option<String>,

    /// Output filename
    #[arg(long, default_value = flyerexport::DEFAULT_FILENAME)]
    filename: String,

    /// Directory the PNG is saved into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Width override in pixels (needs --height too)
    #[arg(long)]
    width: Option<f64>,

    /// Height override in pixels (needs --width too)
    #[arg(long)]
    height: Option<f64>,

    /// Load and readiness deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut settings = match &cli.config {
        Some(path) => ExporterSettings::from_json_file(path)?,
        None => ExporterSettings::default(),
    };
    if let Some(origin) = &cli.origin {
        settings.origin = origin.clone();
    }
    if let Some(ms) = cli.timeout_ms {
        settings.readiness_timeout_ms = ms;
    }

    let host = CdpHost::launch(&settings)
        .await
        .context("failed to start headless Chrome")?;

    let exporter = ExporterBuilder::from_settings(&settings)?
        .surfaces(Arc::new(host.clone()))
        .rasterizer(Arc::new(host.rasterizer(&settings.rasterizer_src)))
        .loader(Arc::new(host.clone()))
        .sink(Arc::new(FileSink::new(&cli.out_dir)))
        .build()?;

    let mut config = ExportConfig::new(&cli.template, &cli.qr)
        .with_filename(&cli.filename)
        .with_status(|msg: &str| println!("{}", msg));
    // A lone --width or --height is handed through as NaN so the exporter
    // falls back to the full default pair.
    if cli.width.is_some() || cli.height.is_some() {
        config = config.with_print(PrintOverride::new(
            cli.width.unwrap_or(f64::NAN),
            cli.height.unwrap_or(f64::NAN),
        ));
    }

    let result = exporter.export_flyer_png(config).await;
    host.close().await?;
    result.with_context(|| format!("exporting {}", cli.template))?;
    Ok(())
}
