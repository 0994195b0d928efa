//! Isolation host
//!
//! Stands up one isolated rendering surface per export, loads the template
//! into it and waits until it is settled. The surface is owned by a
//! [`SurfaceGuard`] so it is detached exactly once whatever happens.

use crate::readiness::{self, ReadinessToken, Settled};
use crate::{Dimensions, Error, Result};
use futures::future::BoxFuture;
use log::debug;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Deadline for a surface to load and settle.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(12000);

/// Query parameter carrying the link the flyer encodes (as a QR code).
pub const LINK_PARAM: &str = "qr";

/// Query parameter carrying the cache-busting stamp.
pub const CACHE_BUST_PARAM: &str = "v";

/// Where and how a surface is placed in the host document.
///
/// Surfaces are moved off-screen rather than hidden: engines skip layout and
/// paint for hidden elements, which would leave nothing to capture.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceSpec {
    pub size: Dimensions,
    pub left_px: i32,
    pub top_px: i32,
    pub opacity: f32,
    pub border_px: u32,
    pub aria_hidden: bool,
}

impl SurfaceSpec {
    pub fn offscreen(size: Dimensions) -> Self {
        Self {
            size,
            left_px: -10000,
            top_px: 0,
            opacity: 0.0,
            border_px: 0,
            aria_hidden: true,
        }
    }
}

/// Handle to an element inside a surface's content document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    /// The element id that was looked up
    pub id: String,
    /// Backend-specific expression that resolves to the element
    pub locator: String,
}

/// An isolated, off-screen rendering context.
///
/// Implementations must latch the load event: a load that completes before
/// `wait_for_load` is called still resolves it.
pub trait RenderSurface: Send {
    /// Allocated pixel size; never auto-sized or scaled.
    fn size(&self) -> Dimensions;

    /// Assign the content URL and attach the surface to the host document.
    fn set_source<'a>(&'a mut self, url: &'a Url) -> BoxFuture<'a, Result<()>>;

    /// Resolve once the surface's load event has fired.
    fn wait_for_load(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Read the content's readiness global. `Err` means the read itself
    /// failed; it is treated as non-fatal by the host.
    fn readiness_signal<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, Result<ReadinessToken>>;

    /// Look up an element by id in the content document.
    ///
    /// `Err(ContentDocumentUnavailable)` when the document cannot be reached,
    /// `Ok(None)` when it can but the element is absent.
    fn find_element<'a>(&'a mut self, id: &'a str) -> BoxFuture<'a, Result<Option<ElementHandle>>>;

    /// Remove the surface from the host document. Called exactly once.
    fn detach(&mut self);
}

/// Creates surfaces inside some host document.
pub trait SurfaceFactory: Send + Sync {
    fn create_surface<'a>(&'a self, spec: &'a SurfaceSpec) -> BoxFuture<'a, Result<Box<dyn RenderSurface>>>;
}

/// Owns a surface and detaches it exactly once, on `teardown` or on drop.
pub struct SurfaceGuard {
    surface: Option<Box<dyn RenderSurface>>,
}

impl SurfaceGuard {
    pub fn new(surface: Box<dyn RenderSurface>) -> Self {
        Self {
            surface: Some(surface),
        }
    }

    pub fn teardown(mut self) {
        self.detach_once();
    }

    fn detach_once(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            debug!("detaching surface {}", surface.size());
            surface.detach();
        }
    }
}

impl Deref for SurfaceGuard {
    type Target = dyn RenderSurface;

    fn deref(&self) -> &Self::Target {
        // Only `teardown` (which consumes self) and `drop` empty the slot.
        self.surface.as_deref().expect("surface already detached")
    }
}

impl DerefMut for SurfaceGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.surface.as_deref_mut().expect("surface already detached")
    }
}

impl Drop for SurfaceGuard {
    fn drop(&mut self) {
        self.detach_once();
    }
}

/// Millisecond stamps that strictly increase, so two loads in the same
/// millisecond still get distinct URLs.
#[derive(Debug, Default)]
pub struct CacheBuster {
    last: AtomicU64,
}

static CACHE_BUSTER: CacheBuster = CacheBuster::new();

impl CacheBuster {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// The stamp source every host in the process draws from.
    pub fn global() -> &'static CacheBuster {
        &CACHE_BUSTER
    }

    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let stamp = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, stamp, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return stamp,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Readiness knobs of the host.
#[derive(Debug, Clone)]
pub struct ReadyPolicy {
    pub timeout: Duration,
    pub grace: Duration,
    pub signal_name: String,
}

impl Default for ReadyPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READY_TIMEOUT,
            grace: readiness::DEFAULT_GRACE,
            signal_name: readiness::DEFAULT_SIGNAL_NAME.to_string(),
        }
    }
}

/// Creates, loads and awaits isolated surfaces on behalf of the exporter.
#[derive(Clone)]
pub struct IsolationHost {
    factory: Arc<dyn SurfaceFactory>,
    origin: Url,
    policy: ReadyPolicy,
    cache_buster: &'static CacheBuster,
}

impl IsolationHost {
    pub fn new(factory: Arc<dyn SurfaceFactory>, origin: Url, policy: ReadyPolicy) -> Self {
        Self {
            factory,
            origin,
            policy,
            cache_buster: CacheBuster::global(),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn policy(&self) -> &ReadyPolicy {
        &self.policy
    }

    /// Allocate a fresh off-screen surface of exactly `size` pixels.
    pub async fn create_surface(&self, size: Dimensions) -> Result<SurfaceGuard> {
        let spec = SurfaceSpec::offscreen(size);
        let surface = self.factory.create_surface(&spec).await?;
        if surface.size() != size {
            // Wrap first so the mis-sized surface is still detached.
            let guard = SurfaceGuard::new(surface);
            return Err(Error::Surface(format!(
                "surface allocated at {} instead of {}",
                guard.size(),
                size
            )));
        }
        debug!("created surface {}", size);
        Ok(SurfaceGuard::new(surface))
    }

    /// Build the content URL for a template: resolved against the origin,
    /// with the link and a fresh cache-busting stamp as query parameters.
    pub fn content_url(&self, template_location: &str, link: &str) -> Result<Url> {
        let mut url = self.origin.join(template_location)?;
        let stamp = self.cache_buster.next().to_string();
        set_query_param(&mut url, LINK_PARAM, link);
        set_query_param(&mut url, CACHE_BUST_PARAM, &stamp);
        Ok(url)
    }

    /// Point the surface at the template. Returns the URL that was loaded.
    pub async fn load_content(
        &self,
        surface: &mut SurfaceGuard,
        template_location: &str,
        link: &str,
    ) -> Result<Url> {
        let url = self.content_url(template_location, link)?;
        debug!("loading {}", url);
        surface.set_source(&url).await?;
        Ok(url)
    }

    /// Wait for the load event and then the readiness signal, bounded by
    /// `timeout`. Readiness failures are swallowed; only the deadline fails.
    pub async fn await_ready(&self, surface: &mut SurfaceGuard, timeout: Duration) -> Result<Settled> {
        let grace = self.policy.grace;
        let signal_name = self.policy.signal_name.as_str();
        let wait = async {
            surface.wait_for_load().await?;
            let signal = surface.readiness_signal(signal_name).await;
            Ok::<_, Error>(readiness::settle(signal, grace).await)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => {
                let settled = res?;
                debug!("surface settled: {:?}", settled);
                Ok(settled)
            }
            Err(_) => Err(Error::RenderTimeout(timeout.as_millis() as u64)),
        }
    }
}

/// Set `key` to `value`, dropping any existing values for `key`.
fn set_query_param(url: &mut Url, key: &str, value: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &kept {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(key, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_buster_strictly_increases() {
        let cb = CacheBuster::new();
        let mut last = cb.next();
        for _ in 0..1000 {
            let n = cb.next();
            assert!(n > last);
            last = n;
        }
    }

    #[test]
    fn set_query_param_replaces_existing() {
        let mut url = Url::parse("https://site.test/t.html?qr=old&keep=1").unwrap();
        set_query_param(&mut url, "qr", "https://x/1");
        let pairs: Vec<_> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("keep".to_string(), "1".to_string()),
                ("qr".to_string(), "https://x/1".to_string())
            ]
        );
    }

    #[test]
    fn offscreen_spec_is_exactly_sized_and_invisible() {
        let spec = SurfaceSpec::offscreen(Dimensions::new(800, 600));
        assert_eq!(spec.size, Dimensions::new(800, 600));
        assert!(spec.left_px <= -800);
        assert_eq!(spec.opacity, 0.0);
        assert_eq!(spec.border_px, 0);
        assert!(spec.aria_hidden);
    }
}
