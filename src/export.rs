//! Export orchestrator
//!
//! Drives one export end to end: resolve dimensions, make sure the
//! rasterizer's dependency is loaded, isolate the template in a fresh surface,
//! wait for it to settle, snapshot the root element, encode and deliver.
//! The surface is torn down on every exit path.

use crate::delivery::DeliverySink;
use crate::dependency::{DependencyLoader, DependencyRegistry};
use crate::host::{IsolationHost, ReadyPolicy, SurfaceFactory};
use crate::snapshot::{RasterOptions, Rasterizer};
use crate::{ExportConfig, ExporterSettings, Error, Result, StatusCallback, DEFAULT_ROOT_ID};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Coarse progress reported through the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    Preparing,
    Rendering,
    DownloadStarted,
}

impl ExportStatus {
    pub fn message(self) -> &'static str {
        match self {
            ExportStatus::Preparing => "Preparing…",
            ExportStatus::Rendering => "Rendering image…",
            ExportStatus::DownloadStarted => "Download started ✅",
        }
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Lifecycle of a single export.
///
/// States advance strictly in order; `Failed` is reachable from any state that
/// is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Preparing,
    Isolating,
    AwaitingReadiness,
    Rendering,
    Delivering,
    Done,
    Failed,
}

impl ExportState {
    pub fn next(self) -> Option<ExportState> {
        use ExportState::*;
        match self {
            Idle => Some(Preparing),
            Preparing => Some(Isolating),
            Isolating => Some(AwaitingReadiness),
            AwaitingReadiness => Some(Rendering),
            Rendering => Some(Delivering),
            Delivering => Some(Done),
            Done | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Done | ExportState::Failed)
    }

    pub fn can_transition(self, to: ExportState) -> bool {
        if to == ExportState::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(to)
    }
}

/// Observer of state transitions, mostly useful in tests and diagnostics.
pub type StateObserver = Arc<dyn Fn(ExportState) + Send + Sync>;

struct ExportRun<'a> {
    state: ExportState,
    on_status: &'a StatusCallback,
    on_state: Option<&'a StateObserver>,
}

impl<'a> ExportRun<'a> {
    fn new(on_status: &'a StatusCallback, on_state: Option<&'a StateObserver>) -> Self {
        Self {
            state: ExportState::Idle,
            on_status,
            on_state,
        }
    }

    fn enter(&mut self, to: ExportState) {
        debug_assert!(
            self.state.can_transition(to),
            "illegal export transition {:?} -> {:?}",
            self.state,
            to
        );
        debug!("export {:?} -> {:?}", self.state, to);
        self.state = to;
        if let Some(cb) = self.on_state {
            cb(to);
        }
    }

    fn status(&self, status: ExportStatus) {
        (self.on_status)(status.message());
    }
}

/// Exports flyer templates to PNG.
///
/// An exporter is cheap to share; concurrent exports each get their own
/// surface and only share the dependency registry.
pub struct Exporter {
    host: IsolationHost,
    rasterizer: Arc<dyn Rasterizer>,
    loader: Option<Arc<dyn DependencyLoader>>,
    sink: Arc<dyn DeliverySink>,
    registry: Arc<DependencyRegistry>,
    root_id: String,
    on_state: Option<StateObserver>,
}

impl Exporter {
    pub fn builder(origin: Url) -> ExporterBuilder {
        ExporterBuilder::new(origin)
    }

    pub fn host(&self) -> &IsolationHost {
        &self.host
    }

    pub fn registry(&self) -> &Arc<DependencyRegistry> {
        &self.registry
    }

    /// Render `config.template_location` and hand the PNG to the sink.
    ///
    /// Resolves once the sink accepted the image. Status messages are emitted
    /// in the order "Preparing…", "Rendering image…", "Download started ✅".
    pub async fn export_flyer_png(&self, config: ExportConfig) -> Result<()> {
        info!(
            "exporting {} ({}) as {}",
            config.template_location,
            config.dimensions(),
            config.output_filename
        );
        let mut run = ExportRun::new(&config.on_status, self.on_state.as_ref());
        match self.drive(&mut run, &config).await {
            Ok(()) => {
                run.enter(ExportState::Done);
                info!("export of {} finished", config.template_location);
                Ok(())
            }
            Err(e) => {
                run.enter(ExportState::Failed);
                warn!("export of {} failed: {}", config.template_location, e);
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut ExportRun<'_>, config: &ExportConfig) -> Result<()> {
        run.enter(ExportState::Preparing);
        run.status(ExportStatus::Preparing);
        let dims = config.dimensions();

        if let Some(dep) = self.rasterizer.dependency() {
            let loader = self.loader.as_deref().ok_or_else(|| Error::DependencyLoad {
                id: dep.id.clone(),
                reason: "no dependency loader configured".into(),
            })?;
            self.registry.ensure_loaded(&dep, loader).await?;
        }

        run.enter(ExportState::Isolating);
        // Dropping the guard on any early return below detaches the surface.
        let mut surface = self.host.create_surface(dims).await?;
        self.host
            .load_content(&mut surface, &config.template_location, &config.link)
            .await?;

        run.enter(ExportState::AwaitingReadiness);
        let timeout = self.host.policy().timeout;
        self.host.await_ready(&mut surface, timeout).await?;

        run.enter(ExportState::Rendering);
        run.status(ExportStatus::Rendering);
        let root = surface
            .find_element(&self.root_id)
            .await?
            .ok_or_else(|| Error::RootElementMissing(self.root_id.clone()))?;
        let options = RasterOptions::for_dimensions(dims);
        let snapshot = self.rasterizer.rasterize(&root, &options).await?;
        if snapshot.dimensions() != dims {
            return Err(Error::Render(format!(
                "snapshot is {} but the surface is {}",
                snapshot.dimensions(),
                dims
            )));
        }

        run.enter(ExportState::Delivering);
        let encoded = snapshot.encode_png()?;
        self.sink.deliver(&encoded, &config.output_filename)?;
        surface.teardown();
        run.status(ExportStatus::DownloadStarted);
        Ok(())
    }
}

/// Assembles an [`Exporter`] from its collaborators.
pub struct ExporterBuilder {
    origin: Url,
    policy: ReadyPolicy,
    root_id: String,
    surfaces: Option<Arc<dyn SurfaceFactory>>,
    rasterizer: Option<Arc<dyn Rasterizer>>,
    loader: Option<Arc<dyn DependencyLoader>>,
    sink: Option<Arc<dyn DeliverySink>>,
    registry: Option<Arc<DependencyRegistry>>,
    on_state: Option<StateObserver>,
}

impl ExporterBuilder {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            policy: ReadyPolicy::default(),
            root_id: DEFAULT_ROOT_ID.to_string(),
            surfaces: None,
            rasterizer: None,
            loader: None,
            sink: None,
            registry: None,
            on_state: None,
        }
    }

    /// Start from exporter settings (origin, deadlines, well-known names).
    pub fn from_settings(settings: &ExporterSettings) -> Result<Self> {
        Ok(Self::new(settings.origin_url()?)
            .readiness_timeout(settings.readiness_timeout())
            .grace(settings.grace())
            .signal_name(&settings.readiness_signal)
            .root_element_id(&settings.root_element_id))
    }

    pub fn surfaces(mut self, factory: Arc<dyn SurfaceFactory>) -> Self {
        self.surfaces = Some(factory);
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn DependencyLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a private registry instead of the process-wide one.
    pub fn registry(mut self, registry: Arc<DependencyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = timeout;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.policy.grace = grace;
        self
    }

    pub fn signal_name(mut self, name: &str) -> Self {
        self.policy.signal_name = name.to_string();
        self
    }

    pub fn root_element_id(mut self, id: &str) -> Self {
        self.root_id = id.to_string();
        self
    }

    pub fn on_state<F>(mut self, cb: F) -> Self
    where
        F: Fn(ExportState) + Send + Sync + 'static,
    {
        self.on_state = Some(Arc::new(cb));
        self
    }

    pub fn build(self) -> Result<Exporter> {
        let surfaces = self
            .surfaces
            .ok_or_else(|| Error::Config("no surface factory configured".into()))?;
        let rasterizer = self
            .rasterizer
            .ok_or_else(|| Error::Config("no rasterizer configured".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| Error::Config("no delivery sink configured".into()))?;
        if self.policy.timeout.is_zero() {
            return Err(Error::Config("readiness timeout must be positive".into()));
        }
        if self.root_id.is_empty() {
            return Err(Error::Config("root element id must not be empty".into()));
        }

        Ok(Exporter {
            host: IsolationHost::new(surfaces, self.origin, self.policy),
            rasterizer,
            loader: self.loader,
            sink,
            registry: self.registry.unwrap_or_else(DependencyRegistry::global),
            root_id: self.root_id,
            on_state: self.on_state,
        })
    }
}
