//! Chrome DevTools Protocol backend
//!
//! A headless Chrome tab is opened at the exporter origin and acts as the host
//! document. Surfaces are off-screen iframes inside it and the rasterizer is
//! html2canvas, inserted into the host page as a script.
//!
//! The browser is owned by a dedicated worker thread; async callers talk to
//! it through a command channel. Page-side promises (load events, readiness
//! signals, script loads, captures) are recorded into page globals and polled,
//! so a slow page never blocks the worker.

use crate::dependency::{self, DependencyLoader, DependencySource};
use crate::host::{ElementHandle, RenderSurface, SurfaceFactory, SurfaceSpec};
use crate::readiness::ReadinessToken;
use crate::snapshot::{EncodedImage, RasterOptions, Rasterizer, Snapshot};
use crate::{Dimensions, Error, ExporterSettings, Result};
use futures::future::BoxFuture;
use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

/// How often page-side state is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Command {
    Eval(String, oneshot::Sender<Result<Value>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Handle to the headless browser hosting the surfaces.
#[derive(Clone)]
pub struct CdpHost {
    cmd_tx: Sender<Command>,
    next_id: Arc<AtomicU64>,
    document: Arc<str>,
}

impl CdpHost {
    /// Launch headless Chrome and open the host page at `settings.origin`.
    pub async fn launch(settings: &ExporterSettings) -> Result<Self> {
        let origin = settings.origin_url()?;
        let window = settings.host_window;

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

        thread::spawn(move || {
            let (_browser, tab) = match open_host_tab(&origin, window) {
                Ok(pair) => pair,
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };
            let _ = init_tx.send(Ok(()));

            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    Command::Eval(script, resp) => {
                        let res = tab
                            .evaluate(&script, false)
                            .map(|obj| obj.value.unwrap_or(Value::Null))
                            .map_err(|e| Error::Cdp(format!("Evaluation failed: {}", e)));
                        let _ = resp.send(res);
                    }
                    Command::Close(resp) => {
                        let _ = resp.send(Ok(()));
                        break;
                    }
                }
            }
            debug!("cdp worker exiting");
        });

        init_rx
            .await
            .map_err(|e| Error::Cdp(format!("Worker init canceled: {}", e)))??;

        let document: Arc<str> = dependency::document_key("cdp").into();
        debug!("host page {} opened at {}", document, settings.origin);
        Ok(Self {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(0)),
            document,
        })
    }

    /// Shut the browser down.
    pub async fn close(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Close(tx));
        rx.await
            .map_err(|e| Error::Cdp(format!("Close canceled: {}", e)))?
    }

    /// Rasterizer that captures through html2canvas loaded from `src`.
    pub fn rasterizer(&self, src: &str) -> CdpRasterizer {
        CdpRasterizer {
            host: self.clone(),
            source: DependencySource::script(src),
        }
    }

    async fn eval(&self, script: String) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Eval(script, tx))
            .map_err(|_| Error::Cdp("browser worker is gone".into()))?;
        rx.await
            .map_err(|e| Error::Cdp(format!("Eval canceled: {}", e)))?
    }

    /// Evaluate a script that returns a JSON string and parse it.
    async fn eval_json(&self, script: String) -> Result<Value> {
        let raw = self.eval(script).await?;
        match raw.as_str() {
            Some(s) => serde_json::from_str(s)
                .map_err(|e| Error::Cdp(format!("Unexpected page reply {:?}: {}", s, e))),
            None => Ok(raw),
        }
    }

    /// Re-run `probe` until its `state` field leaves "pending".
    async fn poll(&self, probe: String) -> Result<Value> {
        loop {
            let v = self.eval_json(probe.clone()).await?;
            if v.get("state").and_then(Value::as_str) != Some("pending") {
                return Ok(v);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Send a script without waiting for the reply.
    fn eval_detached(&self, script: String) {
        let (tx, _rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Eval(script, tx)).is_err() {
            warn!("browser worker is gone; surface left behind");
        }
    }
}

fn open_host_tab(
    origin: &Url,
    window: Dimensions,
) -> Result<(Browser, Arc<Tab>)> {
    let launch_options = LaunchOptions::default_builder()
        .headless(true)
        .window_size(Some((window.width, window.height)))
        .build()
        .map_err(|e| Error::Cdp(format!("Failed to build launch options: {}", e)))?;

    let browser = Browser::new(launch_options)
        .map_err(|e| Error::Cdp(format!("Failed to launch browser: {}", e)))?;
    let tab = browser
        .new_tab()
        .map_err(|e| Error::Cdp(format!("Failed to create tab: {}", e)))?;

    tab.navigate_to(origin.as_str())
        .map_err(|e| Error::Cdp(format!("Navigation to host page failed: {}", e)))?;
    tab.wait_until_navigated()
        .map_err(|e| Error::Cdp(format!("Wait for host page failed: {}", e)))?;

    Ok((browser, tab))
}

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn reply_error(v: &Value) -> Option<String> {
    v.get("error").and_then(Value::as_str).map(str::to_string)
}

const CREATE_SURFACE: &str = r#"(function(){
    const reg = window.__flyerSurfaces || (window.__flyerSurfaces = {});
    const f = document.createElement('iframe');
    f.style.position = 'fixed';
    f.style.left = '{{LEFT}}px';
    f.style.top = '{{TOP}}px';
    f.style.width = '{{WIDTH}}px';
    f.style.height = '{{HEIGHT}}px';
    f.style.border = '{{BORDER}}px';
    f.style.opacity = '{{OPACITY}}';
    if ({{ARIA_HIDDEN}}) f.setAttribute('aria-hidden', 'true');
    const entry = { frame: f, loaded: false };
    f.addEventListener('load', function(){ entry.loaded = true; }, { once: true });
    reg[{{ID}}] = entry;
    return JSON.stringify({ state: 'created' });
})()"#;

const SET_SOURCE: &str = r#"(function(){
    const e = (window.__flyerSurfaces || {})[{{ID}}];
    if (!e) return JSON.stringify({ error: 'surface is gone' });
    e.frame.src = {{URL}};
    document.body.appendChild(e.frame);
    return JSON.stringify({ state: 'attached' });
})()"#;

const LOAD_PROBE: &str = r#"(function(){
    const e = (window.__flyerSurfaces || {})[{{ID}}];
    if (!e) return JSON.stringify({ error: 'surface is gone' });
    return JSON.stringify({ state: e.loaded ? 'loaded' : 'pending' });
})()"#;

const READINESS_READ: &str = r#"(function(){
    try {
        const e = (window.__flyerSurfaces || {})[{{ID}}];
        const w = e && e.frame.contentWindow;
        if (!w) return JSON.stringify({ error: 'no content window' });
        const s = w[{{NAME}}];
        if (s && typeof s.then === 'function') {
            e.ready = { state: 'pending' };
            s.then(
                function(){ e.ready = { state: 'resolved' }; },
                function(err){ e.ready = { state: 'rejected', reason: String(err) }; }
            );
            return JSON.stringify({ kind: 'awaitable' });
        }
        return JSON.stringify({ kind: 'absent' });
    } catch (err) {
        return JSON.stringify({ error: String(err) });
    }
})()"#;

const READINESS_PROBE: &str = r#"(function(){
    const e = (window.__flyerSurfaces || {})[{{ID}}];
    if (!e || !e.ready) return JSON.stringify({ state: 'rejected', reason: 'surface is gone' });
    return JSON.stringify(e.ready);
})()"#;

const FIND_ELEMENT: &str = r#"(function(){
    const e = (window.__flyerSurfaces || {})[{{ID}}];
    let d = null;
    try { d = e && e.frame.contentDocument; } catch (err) { d = null; }
    if (!d) return JSON.stringify({ document: false });
    return JSON.stringify({ document: true, found: !!d.getElementById({{ROOT}}) });
})()"#;

const DETACH: &str = r#"(function(){
    const reg = window.__flyerSurfaces || {};
    const e = reg[{{ID}}];
    if (e) { e.frame.remove(); delete reg[{{ID}}]; }
    return JSON.stringify({ state: 'detached' });
})()"#;

const LOAD_SCRIPT: &str = r#"(function(){
    const jobs = window.__flyerScripts || (window.__flyerScripts = {});
    const job = jobs[{{SRC}}] = { state: 'pending' };
    const s = document.createElement('script');
    s.src = {{SRC}};
    s.async = true;
    s.dataset.src = {{SRC}};
    s.onload = function(){ job.state = 'loaded'; };
    s.onerror = function(){ job.state = 'failed'; job.reason = 'Failed to load: ' + {{SRC}}; };
    document.head.appendChild(s);
    return JSON.stringify({ state: 'inserted' });
})()"#;

const SCRIPT_PROBE: &str = r#"(function(){
    const j = (window.__flyerScripts || {})[{{SRC}}];
    return JSON.stringify(j || { state: 'failed', reason: 'script job is gone' });
})()"#;

const CAPTURE: &str = r#"(function(){
    const jobs = window.__flyerCaptures || (window.__flyerCaptures = {});
    const job = jobs[{{JOB}}] = { state: 'pending' };
    try {
        const el = {{LOCATOR}};
        window.html2canvas(el, {{OPTIONS}}).then(
            function(canvas){ job.data = canvas.toDataURL('image/png'); job.state = 'done'; },
            function(err){ job.reason = String(err); job.state = 'failed'; }
        );
    } catch (err) {
        job.reason = String(err);
        job.state = 'failed';
    }
    return JSON.stringify({ state: 'started' });
})()"#;

const CAPTURE_PROBE: &str = r#"(function(){
    const jobs = window.__flyerCaptures || {};
    const j = jobs[{{JOB}}];
    if (!j) return JSON.stringify({ state: 'failed', reason: 'capture job is gone' });
    if (j.state !== 'pending') delete jobs[{{JOB}}];
    return JSON.stringify(j);
})()"#;

impl SurfaceFactory for CdpHost {
    fn create_surface<'a>(&'a self, spec: &'a SurfaceSpec) -> BoxFuture<'a, Result<Box<dyn RenderSurface>>> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let script = CREATE_SURFACE
                .replace("{{ID}}", &id.to_string())
                .replace("{{LEFT}}", &spec.left_px.to_string())
                .replace("{{TOP}}", &spec.top_px.to_string())
                .replace("{{WIDTH}}", &spec.size.width.to_string())
                .replace("{{HEIGHT}}", &spec.size.height.to_string())
                .replace("{{BORDER}}", &spec.border_px.to_string())
                .replace("{{OPACITY}}", &spec.opacity.to_string())
                .replace("{{ARIA_HIDDEN}}", if spec.aria_hidden { "true" } else { "false" });
            let reply = self.eval_json(script).await?;
            if let Some(err) = reply_error(&reply) {
                return Err(Error::Surface(err));
            }
            debug!("cdp surface {} created at {}", id, spec.size);
            let surface: Box<dyn RenderSurface> = Box::new(CdpSurface {
                host: self.clone(),
                id,
                size: spec.size,
            });
            Ok(surface)
        })
    }
}

impl DependencyLoader for CdpHost {
    fn document(&self) -> &str {
        &self.document
    }

    fn load<'a>(&'a self, source: &'a DependencySource) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let src = js_str(&source.url);
            self.eval_json(LOAD_SCRIPT.replace("{{SRC}}", &src)).await?;
            let outcome = self.poll(SCRIPT_PROBE.replace("{{SRC}}", &src)).await?;
            match outcome.get("state").and_then(Value::as_str) {
                Some("loaded") => Ok(()),
                _ => Err(Error::DependencyLoad {
                    id: source.id.clone(),
                    reason: outcome
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown failure")
                        .to_string(),
                }),
            }
        })
    }
}

/// An iframe inside the host page.
pub struct CdpSurface {
    host: CdpHost,
    id: u64,
    size: Dimensions,
}

impl CdpSurface {
    fn script(&self, template: &str) -> String {
        template.replace("{{ID}}", &self.id.to_string())
    }
}

impl RenderSurface for CdpSurface {
    fn size(&self) -> Dimensions {
        self.size
    }

    fn set_source<'a>(&'a mut self, url: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let script = self.script(SET_SOURCE).replace("{{URL}}", &js_str(url.as_str()));
            let reply = self.host.eval_json(script).await?;
            match reply_error(&reply) {
                Some(err) => Err(Error::Surface(err)),
                None => Ok(()),
            }
        })
    }

    fn wait_for_load(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let reply = self.host.poll(self.script(LOAD_PROBE)).await?;
            match reply_error(&reply) {
                Some(err) => Err(Error::Surface(err)),
                None => Ok(()),
            }
        })
    }

    fn readiness_signal<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, Result<ReadinessToken>> {
        Box::pin(async move {
            let script = self.script(READINESS_READ).replace("{{NAME}}", &js_str(name));
            let reply = self.host.eval_json(script).await?;
            if let Some(err) = reply_error(&reply) {
                return Err(Error::Surface(err));
            }
            if reply.get("kind").and_then(Value::as_str) != Some("awaitable") {
                return Ok(ReadinessToken::Absent);
            }

            let host = self.host.clone();
            let probe = self.script(READINESS_PROBE);
            Ok(ReadinessToken::from_future(async move {
                let v = host.poll(probe).await.map_err(|e| e.to_string())?;
                match v.get("state").and_then(Value::as_str) {
                    Some("resolved") => Ok(()),
                    _ => Err(v
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("rejected")
                        .to_string()),
                }
            }))
        })
    }

    fn find_element<'a>(&'a mut self, id: &'a str) -> BoxFuture<'a, Result<Option<ElementHandle>>> {
        Box::pin(async move {
            let root = js_str(id);
            let reply = self
                .host
                .eval_json(self.script(FIND_ELEMENT).replace("{{ROOT}}", &root))
                .await?;
            if reply.get("document").and_then(Value::as_bool) != Some(true) {
                return Err(Error::ContentDocumentUnavailable(format!(
                    "surface {} document is not accessible",
                    self.id
                )));
            }
            if reply.get("found").and_then(Value::as_bool) != Some(true) {
                return Ok(None);
            }
            Ok(Some(ElementHandle {
                id: id.to_string(),
                locator: format!(
                    "window.__flyerSurfaces[{}].frame.contentDocument.getElementById({})",
                    self.id, root
                ),
            }))
        })
    }

    fn detach(&mut self) {
        debug!("cdp surface {} detached", self.id);
        self.host.eval_detached(self.script(DETACH));
    }
}

/// html2canvas running in the host page.
pub struct CdpRasterizer {
    host: CdpHost,
    source: DependencySource,
}

impl Rasterizer for CdpRasterizer {
    fn dependency(&self) -> Option<DependencySource> {
        Some(self.source.clone())
    }

    fn rasterize<'a>(
        &'a self,
        root: &'a ElementHandle,
        options: &'a RasterOptions,
    ) -> BoxFuture<'a, Result<Snapshot>> {
        Box::pin(async move {
            let job = self.host.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let opts = serde_json::to_string(options)
                .map_err(|e| Error::Render(format!("Bad raster options: {}", e)))?;
            let start = CAPTURE
                .replace("{{JOB}}", &job.to_string())
                .replace("{{LOCATOR}}", &root.locator)
                .replace("{{OPTIONS}}", &opts);
            self.host.eval_json(start).await?;

            let v = self
                .host
                .poll(CAPTURE_PROBE.replace("{{JOB}}", &job.to_string()))
                .await?;
            if v.get("state").and_then(Value::as_str) != Some("done") {
                let reason = v.get("reason").and_then(Value::as_str).unwrap_or("capture failed");
                return Err(Error::Render(reason.to_string()));
            }
            let data = v
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Render("capture returned no data".into()))?;
            let png = EncodedImage::from_data_uri(data)?;
            Snapshot::from_png(&png.bytes)
        })
    }
}
