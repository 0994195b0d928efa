//! Flyer export
//!
//! Renders an isolated flyer template into a print-ready PNG. The template is
//! loaded into an off-screen surface sized exactly to the target resolution;
//! the snapshot is taken only once the surface has loaded and the content has
//! signalled that it is visually settled.
//!
//! # Features
//!
//! - **In-memory backend** (always available): drives the whole pipeline
//!   against in-process templates, used for tests and dry runs
//! - **CDP backend** (`cdp` feature): headless Chrome hosting the surfaces as
//!   iframes and rasterizing with html2canvas
//!
//! # Example
//!
//! ```no_run
//! use flyerexport::memory::{MemoryBackend, MemoryTemplate};
//! use flyerexport::{ExportConfig, Exporter};
//!
//! # async fn run() -> flyerexport::Result<()> {
//! let backend = MemoryBackend::new();
//! backend.add_template("/t.html", MemoryTemplate::flyer());
//!
//! let exporter = Exporter::builder(backend.origin())
//!     .surfaces(backend.surfaces())
//!     .rasterizer(backend.rasterizer())
//!     .loader(backend.loader())
//!     .sink(backend.sink())
//!     .build()?;
//!
//! exporter
//!     .export_flyer_png(
//!         ExportConfig::new("t.html", "https://x/1")
//!             .with_status(|msg: &str| println!("{}", msg)),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod delivery;
pub mod dependency;
pub mod export;
pub mod host;
pub mod memory;
pub mod readiness;
pub mod snapshot;

// Headless Chrome backend
#[cfg(feature = "cdp")]
pub mod cdp;

pub use delivery::{DeliverySink, FileSink};
pub use dependency::{DependencyLoader, DependencyRegistry, DependencySource, DependencyStatus};
pub use export::{ExportState, ExportStatus, Exporter, ExporterBuilder};
pub use host::{ElementHandle, IsolationHost, RenderSurface, SurfaceFactory, SurfaceGuard, SurfaceSpec};
pub use readiness::{Awaitable, ReadinessToken, Settled};
pub use snapshot::{EncodedImage, RasterOptions, Rasterizer, Snapshot};

/// Default output filename.
pub const DEFAULT_FILENAME: &str = "movethatcouch-flyer.png";

/// Default element id of the snapshot root inside the template.
pub const DEFAULT_ROOT_ID: &str = "flyer";

/// Print resolution the default dimensions are computed at.
pub const PRINT_DPI: u32 = 300;

/// US Letter portrait at 300 DPI.
pub const PRINT: Dimensions = Dimensions {
    width: 2550,
    height: 3300,
};

/// Exact pixel size of a surface and of the snapshot taken from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Effective export size for an optional caller override.
    ///
    /// The override is used only when both sides are finite, positive and
    /// still at least one pixel after rounding; otherwise the full print
    /// preset is returned. Sides are never mixed between the two.
    pub fn resolve(print: Option<PrintOverride>) -> Self {
        print.and_then(PrintOverride::to_dimensions).unwrap_or(PRINT)
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        PRINT
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Caller-supplied size override, in (possibly fractional) pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrintOverride {
    pub width: f64,
    pub height: f64,
}

impl PrintOverride {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    fn to_dimensions(self) -> Option<Dimensions> {
        Some(Dimensions::new(round_px(self.width)?, round_px(self.height)?))
    }
}

fn round_px(v: f64) -> Option<u32> {
    if !v.is_finite() || v <= 0.0 {
        return None;
    }
    let r = v.round();
    if r < 1.0 || r > u32::MAX as f64 {
        return None;
    }
    Some(r as u32)
}

/// Progress callback; receives human-readable status lines.
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call export request
///
/// Built once per export and not mutated afterwards.
///
/// ```
/// let cfg = flyerexport::ExportConfig::new("t.html", "https://x/1");
/// assert_eq!(cfg.output_filename, "movethatcouch-flyer.png");
/// assert!(cfg.print.is_none());
/// ```
#[derive(Clone)]
pub struct ExportConfig {
    /// Template path or URL, resolved against the host origin
    pub template_location: String,
    /// Link the flyer encodes, passed as the `qr` query parameter
    pub link: String,
    /// Name handed to the delivery sink
    pub output_filename: String,
    /// Status callback
    pub on_status: StatusCallback,
    /// Optional size override
    pub print: Option<PrintOverride>,
}

impl ExportConfig {
    pub fn new(template_location: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            template_location: template_location.into(),
            link: link.into(),
            output_filename: DEFAULT_FILENAME.to_string(),
            on_status: Arc::new(|_: &str| {}),
            print: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.output_filename = filename.into();
        self
    }

    pub fn with_status<F>(mut self, cb: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_status = Arc::new(cb);
        self
    }

    pub fn with_print(mut self, print: PrintOverride) -> Self {
        self.print = Some(print);
        self
    }

    /// Effective dimensions of this export.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::resolve(self.print)
    }
}

impl fmt::Debug for ExportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportConfig")
            .field("template_location", &self.template_location)
            .field("link", &self.link)
            .field("output_filename", &self.output_filename)
            .field("print", &self.print)
            .finish_non_exhaustive()
    }
}

/// Exporter-wide settings
///
/// Loadable from JSON; every field is optional in the file.
///
/// ```
/// let s = flyerexport::ExporterSettings::default();
/// assert_eq!(s.readiness_timeout_ms, 12000);
/// assert_eq!(s.root_element_id, "flyer");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterSettings {
    /// Base URL templates are resolved against; also the host page
    pub origin: String,
    /// Deadline for load plus readiness, in milliseconds
    pub readiness_timeout_ms: u64,
    /// Settle delay for content without a readiness signal, in milliseconds
    pub grace_ms: u64,
    /// Global name of the content's readiness signal
    pub readiness_signal: String,
    /// Id of the snapshot root element
    pub root_element_id: String,
    /// Script the rasterization engine is loaded from
    pub rasterizer_src: String,
    /// Window size of the browser hosting the surfaces
    pub host_window: Dimensions,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080/".to_string(),
            readiness_timeout_ms: host::DEFAULT_READY_TIMEOUT.as_millis() as u64,
            grace_ms: readiness::DEFAULT_GRACE.as_millis() as u64,
            readiness_signal: readiness::DEFAULT_SIGNAL_NAME.to_string(),
            root_element_id: DEFAULT_ROOT_ID.to_string(),
            rasterizer_src: dependency::HTML2CANVAS_SRC.to_string(),
            host_window: Dimensions::new(1280, 720),
        }
    }
}

impl ExporterSettings {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Config(format!("bad settings: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn origin_url(&self) -> Result<url::Url> {
        Ok(url::Url::parse(&self.origin)?)
    }
}
