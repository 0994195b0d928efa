//! In-memory backend
//!
//! Implements every collaborator the exporter needs (surface factory,
//! rasterizer, dependency loader, delivery sink) without a browser. Templates
//! are registered by path with scripted load and readiness behaviour, and the
//! shared host state records what happened so tests can inspect it. It also
//! serves as a dry-run backend.

use crate::delivery::DeliverySink;
use crate::dependency::{self, DependencyLoader, DependencySource};
use crate::host::{ElementHandle, RenderSurface, SurfaceFactory, SurfaceSpec};
use crate::readiness::ReadinessToken;
use crate::snapshot::{EncodedImage, RasterOptions, Rasterizer, Snapshot};
use crate::{Dimensions, Error, Result};
use futures::future::BoxFuture;
use scraper::{Html, Selector};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

/// Origin the in-memory host serves templates from.
pub const MEMORY_ORIGIN: &str = "http://memory.test/";

/// Dependency id the in-memory rasterizer asks to have loaded.
pub const MEMORY_RASTERIZER_SRC: &str = "memory://rasterizer.js";

/// When a template's load event fires.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryLoad {
    Immediate,
    After(Duration),
    Never,
}

/// What a template publishes as its readiness signal.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryReadiness {
    /// An awaitable that resolves right away
    Resolves,
    /// An awaitable that resolves after a delay
    ResolvesAfter(Duration),
    /// An awaitable that rejects
    Rejects(String),
    /// Reading the signal fails outright
    Throws(String),
    /// A value without a `then`
    NotAwaitable,
    /// Nothing published
    Absent,
}

/// A template served by the in-memory host.
#[derive(Debug, Clone)]
pub struct MemoryTemplate {
    pub html: String,
    pub load: MemoryLoad,
    pub readiness: MemoryReadiness,
    pub cross_origin: bool,
}

impl MemoryTemplate {
    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            load: MemoryLoad::Immediate,
            readiness: MemoryReadiness::Absent,
            cross_origin: false,
        }
    }

    /// A well-formed flyer: has `#flyer` and signals readiness immediately.
    pub fn flyer() -> Self {
        Self::from_html(
            r#"<!DOCTYPE html><html><head><title>Flyer</title></head><body><div id="flyer"><h1>Move That Couch</h1><img id="qr"></div></body></html>"#,
        )
        .with_readiness(MemoryReadiness::Resolves)
    }

    pub fn with_load(mut self, load: MemoryLoad) -> Self {
        self.load = load;
        self
    }

    pub fn with_readiness(mut self, readiness: MemoryReadiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Make the content document unreachable from the host.
    pub fn cross_origin(mut self) -> Self {
        self.cross_origin = true;
        self
    }

    fn has_element(&self, id: &str) -> Result<bool> {
        let sel = Selector::parse(&format!("[id=\"{}\"]", id.replace('"', "\\\"")))
            .map_err(|e| Error::Surface(format!("bad element id {:?}: {:?}", id, e)))?;
        let document = Html::parse_document(&self.html);
        let found = document.select(&sel).next().is_some();
        Ok(found)
    }
}

/// A delivery recorded by the in-memory sink.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub filename: String,
    pub image: EncodedImage,
}

#[derive(Default)]
struct HostState {
    templates: HashMap<String, MemoryTemplate>,
    next_surface: u64,
    live: BTreeMap<u64, SurfaceSpec>,
    created: Vec<SurfaceSpec>,
    detached: usize,
    loaded_urls: Vec<Url>,
    script_insertions: Vec<String>,
    loaded_scripts: Vec<String>,
    rasterized: Vec<RasterOptions>,
    deliveries: Vec<Delivery>,
    fail_script_loads: bool,
    fail_deliveries: bool,
    raster_size: Option<Dimensions>,
}

type Shared = Arc<Mutex<HostState>>;

fn lock(state: &Shared) -> MutexGuard<'_, HostState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process host document with all collaborators attached to it.
#[derive(Clone)]
pub struct MemoryBackend {
    origin: Url,
    document: String,
    state: Shared,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_origin(Url::parse(MEMORY_ORIGIN).expect("memory origin is a valid URL"))
    }

    pub fn with_origin(origin: Url) -> Self {
        Self {
            origin,
            document: dependency::document_key("memory"),
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    pub fn origin(&self) -> Url {
        self.origin.clone()
    }

    /// Key of this backend's host document in a dependency registry.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Serve `template` for URLs whose path is `path` (query ignored).
    pub fn add_template(&self, path: &str, template: MemoryTemplate) {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        lock(&self.state).templates.insert(path, template);
    }

    pub fn fail_script_loads(&self, fail: bool) {
        lock(&self.state).fail_script_loads = fail;
    }

    pub fn fail_deliveries(&self, fail: bool) {
        lock(&self.state).fail_deliveries = fail;
    }

    /// Make the rasterizer ignore the requested size and produce `size`.
    pub fn force_raster_size(&self, size: Option<Dimensions>) {
        lock(&self.state).raster_size = size;
    }

    pub fn surfaces(&self) -> Arc<MemorySurfaceFactory> {
        Arc::new(MemorySurfaceFactory {
            state: self.state.clone(),
        })
    }

    pub fn rasterizer(&self) -> Arc<MemoryRasterizer> {
        Arc::new(MemoryRasterizer {
            state: self.state.clone(),
        })
    }

    pub fn loader(&self) -> Arc<MemoryScriptLoader> {
        Arc::new(MemoryScriptLoader {
            document: self.document.clone(),
            state: self.state.clone(),
        })
    }

    pub fn sink(&self) -> Arc<MemorySink> {
        Arc::new(MemorySink {
            state: self.state.clone(),
        })
    }

    /// Surfaces currently attached to the host document.
    pub fn live_surfaces(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Specs of every surface ever created, in order.
    pub fn created_surfaces(&self) -> Vec<SurfaceSpec> {
        lock(&self.state).created.clone()
    }

    pub fn detach_count(&self) -> usize {
        lock(&self.state).detached
    }

    pub fn loaded_urls(&self) -> Vec<Url> {
        lock(&self.state).loaded_urls.clone()
    }

    pub fn script_insertions(&self) -> Vec<String> {
        lock(&self.state).script_insertions.clone()
    }

    pub fn rasterized(&self) -> Vec<RasterOptions> {
        lock(&self.state).rasterized.clone()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.state).deliveries.clone()
    }
}

/// Creates [`MemorySurface`]s.
pub struct MemorySurfaceFactory {
    state: Shared,
}

impl SurfaceFactory for MemorySurfaceFactory {
    fn create_surface<'a>(&'a self, spec: &'a SurfaceSpec) -> BoxFuture<'a, Result<Box<dyn RenderSurface>>> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.next_surface += 1;
            let id = st.next_surface;
            st.live.insert(id, spec.clone());
            st.created.push(spec.clone());
            let surface: Box<dyn RenderSurface> = Box::new(MemorySurface {
                id,
                size: spec.size,
                state: self.state.clone(),
                template: None,
            });
            Ok(surface)
        })
    }
}

/// A surface living in the in-memory host.
pub struct MemorySurface {
    id: u64,
    size: Dimensions,
    state: Shared,
    template: Option<MemoryTemplate>,
}

impl MemorySurface {
    fn template(&self) -> Result<&MemoryTemplate> {
        self.template
            .as_ref()
            .ok_or_else(|| Error::Surface(format!("surface {} has no source", self.id)))
    }
}

impl RenderSurface for MemorySurface {
    fn size(&self) -> Dimensions {
        self.size
    }

    fn set_source<'a>(&'a mut self, url: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut st = lock(&self.state);
            st.loaded_urls.push(url.clone());
            // Unknown paths still load, just as an empty document would.
            let template = st
                .templates
                .get(url.path())
                .cloned()
                .unwrap_or_else(|| MemoryTemplate::from_html("<html><body></body></html>"));
            drop(st);
            self.template = Some(template);
            Ok(())
        })
    }

    fn wait_for_load(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.template()?.load.clone() {
                MemoryLoad::Immediate => {}
                MemoryLoad::After(d) => tokio::time::sleep(d).await,
                MemoryLoad::Never => futures::future::pending::<()>().await,
            }
            Ok(())
        })
    }

    fn readiness_signal<'a>(&'a mut self, _name: &'a str) -> BoxFuture<'a, Result<ReadinessToken>> {
        Box::pin(async move {
            let token = match self.template()?.readiness.clone() {
                MemoryReadiness::Resolves => ReadinessToken::from_future(async { Ok(()) }),
                MemoryReadiness::ResolvesAfter(d) => ReadinessToken::from_future(async move {
                    tokio::time::sleep(d).await;
                    Ok(())
                }),
                MemoryReadiness::Rejects(reason) => ReadinessToken::from_future(async move { Err(reason) }),
                MemoryReadiness::Throws(msg) => return Err(Error::Surface(msg)),
                MemoryReadiness::NotAwaitable | MemoryReadiness::Absent => ReadinessToken::Absent,
            };
            Ok(token)
        })
    }

    fn find_element<'a>(&'a mut self, id: &'a str) -> BoxFuture<'a, Result<Option<ElementHandle>>> {
        Box::pin(async move {
            let template = self.template()?;
            if template.cross_origin {
                return Err(Error::ContentDocumentUnavailable(format!(
                    "surface {} content is cross-origin",
                    self.id
                )));
            }
            if !template.has_element(id)? {
                return Ok(None);
            }
            Ok(Some(ElementHandle {
                id: id.to_string(),
                locator: format!("surface-{}#{}", self.id, id),
            }))
        })
    }

    fn detach(&mut self) {
        let mut st = lock(&self.state);
        if st.live.remove(&self.id).is_some() {
            st.detached += 1;
        }
    }
}

/// Paints the requested area with the requested background.
pub struct MemoryRasterizer {
    state: Shared,
}

impl Rasterizer for MemoryRasterizer {
    fn dependency(&self) -> Option<DependencySource> {
        Some(DependencySource::script(MEMORY_RASTERIZER_SRC))
    }

    fn rasterize<'a>(
        &'a self,
        _root: &'a ElementHandle,
        options: &'a RasterOptions,
    ) -> BoxFuture<'a, Result<Snapshot>> {
        Box::pin(async move {
            let size = {
                let mut st = lock(&self.state);
                if !st.loaded_scripts.iter().any(|s| s == MEMORY_RASTERIZER_SRC) {
                    return Err(Error::Render(format!(
                        "{} is not loaded in this document",
                        MEMORY_RASTERIZER_SRC
                    )));
                }
                st.rasterized.push(options.clone());
                st.raster_size.unwrap_or_else(|| options.dimensions())
            };
            let bg = parse_hex_color(&options.background_color)
                .ok_or_else(|| Error::Render(format!("bad background {}", options.background_color)))?;
            Ok(Snapshot::filled(size, bg))
        })
    }
}

/// Records script insertions into the host document.
pub struct MemoryScriptLoader {
    document: String,
    state: Shared,
}

impl DependencyLoader for MemoryScriptLoader {
    fn document(&self) -> &str {
        &self.document
    }

    fn load<'a>(&'a self, source: &'a DependencySource) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let fail = {
                let mut st = lock(&self.state);
                st.script_insertions.push(source.url.clone());
                st.fail_script_loads
            };
            // Script loads complete on a later tick, like a network fetch.
            tokio::time::sleep(Duration::from_millis(5)).await;
            if fail {
                return Err(Error::DependencyLoad {
                    id: source.id.clone(),
                    reason: format!("Failed to load: {}", source.url),
                });
            }
            lock(&self.state).loaded_scripts.push(source.url.clone());
            Ok(())
        })
    }
}

/// Keeps deliveries in memory.
pub struct MemorySink {
    state: Shared,
}

impl DeliverySink for MemorySink {
    fn deliver(&self, image: &EncodedImage, filename: &str) -> Result<()> {
        let mut st = lock(&self.state);
        if st.fail_deliveries {
            return Err(Error::Delivery(format!("refused {}", filename)));
        }
        st.deliveries.push(Delivery {
            filename: filename.to_string(),
            image: image.clone(),
        });
        Ok(())
    }
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
fn parse_hex_color(s: &str) -> Option<[u8; 4]> {
    let hex = s.strip_prefix('#')?;
    let digit = |i: usize, n: usize| u8::from_str_radix(hex.get(i..i + n)?, 16).ok();
    match hex.len() {
        3 => Some([digit(0, 1)? * 17, digit(1, 1)? * 17, digit(2, 1)? * 17, 255]),
        6 => Some([digit(0, 2)?, digit(2, 2)?, digit(4, 2)?, 255]),
        8 => Some([digit(0, 2)?, digit(2, 2)?, digit(4, 2)?, digit(6, 2)?]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_colors() {
        assert_eq!(parse_hex_color("#ffffff"), Some([255, 255, 255, 255]));
        assert_eq!(parse_hex_color("#fff"), Some([255, 255, 255, 255]));
        assert_eq!(parse_hex_color("#00000080"), Some([0, 0, 0, 128]));
        assert_eq!(parse_hex_color("white"), None);
        assert_eq!(parse_hex_color("#ggg"), None);
    }

    #[test]
    fn template_element_lookup() {
        let t = MemoryTemplate::flyer();
        assert!(t.has_element("flyer").unwrap());
        assert!(t.has_element("qr").unwrap());
        assert!(!t.has_element("missing").unwrap());
    }

    #[tokio::test]
    async fn surfaces_are_tracked_until_detached() {
        let backend = MemoryBackend::new();
        let factory = backend.surfaces();
        let spec = SurfaceSpec::offscreen(Dimensions::new(10, 20));
        let mut s = factory.create_surface(&spec).await.unwrap();
        assert_eq!(backend.live_surfaces(), 1);
        assert_eq!(s.size(), Dimensions::new(10, 20));
        s.detach();
        s.detach();
        assert_eq!(backend.live_surfaces(), 0);
        assert_eq!(backend.detach_count(), 1);
    }

    #[tokio::test]
    async fn unknown_template_loads_empty_document() {
        let backend = MemoryBackend::new();
        let spec = SurfaceSpec::offscreen(Dimensions::new(10, 20));
        let mut s = backend.surfaces().create_surface(&spec).await.unwrap();
        let url = backend.origin().join("nope.html").unwrap();
        s.set_source(&url).await.unwrap();
        s.wait_for_load().await.unwrap();
        assert!(s.find_element("flyer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rasterizer_needs_its_script_in_this_document() {
        let backend = MemoryBackend::new();
        let other = MemoryBackend::new();
        let root = ElementHandle {
            id: "flyer".into(),
            locator: "surface-1#flyer".into(),
        };
        let options = RasterOptions::for_dimensions(Dimensions::new(4, 4));
        let src = DependencySource::script(MEMORY_RASTERIZER_SRC);

        other.loader().load(&src).await.unwrap();
        let err = backend.rasterizer().rasterize(&root, &options).await.unwrap_err();
        assert!(matches!(err, Error::Render(_)));

        backend.loader().load(&src).await.unwrap();
        let snap = backend.rasterizer().rasterize(&root, &options).await.unwrap();
        assert_eq!(snap.dimensions(), Dimensions::new(4, 4));
        assert_ne!(backend.document(), other.document());
    }
}
