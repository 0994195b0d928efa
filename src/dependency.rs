//! Load-once registry for the rasterization engine dependency
//!
//! The rasterizer usually lives in a script that must be inserted into the
//! host document before the first snapshot. The registry maps a host document
//! and a stable dependency id to its load state so repeated and concurrent
//! exports insert it at most once per document.

use crate::{Error, Result};
use futures::future::BoxFuture;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::OnceCell;

/// Location of the html2canvas build the CDP backend inserts into the host page.
pub const HTML2CANVAS_SRC: &str =
    "https://cdn.jsdelivr.net/npm/html2canvas@1.4.1/dist/html2canvas.min.js";

/// A dependency the rasterizer needs in the host document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySource {
    /// Stable key used for load-once bookkeeping
    pub id: String,
    /// Where the dependency is fetched from
    pub url: String,
}

impl DependencySource {
    /// A script dependency keyed by its own URL.
    pub fn script(url: &str) -> Self {
        Self {
            id: url.to_string(),
            url: url.to_string(),
        }
    }
}

/// Inserts a dependency into the host document.
///
/// Implementations should not dedupe on their own; the registry decides when
/// a load is needed.
pub trait DependencyLoader: Send + Sync {
    /// Identity of the host document loads go into. Two loaders that insert
    /// into different documents must return different keys.
    fn document(&self) -> &str;

    fn load<'a>(&'a self, source: &'a DependencySource) -> BoxFuture<'a, Result<()>>;
}

static NEXT_DOCUMENT: AtomicU64 = AtomicU64::new(1);

/// A fresh document key, unique within the process.
pub fn document_key(kind: &str) -> String {
    format!("{}-{}", kind, NEXT_DOCUMENT.fetch_add(1, Ordering::Relaxed))
}

/// Observable load state of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    NotLoaded,
    Loading,
    Loaded,
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<()>,
    in_flight: AtomicBool,
}

/// Clears `in_flight` even when the loading future is dropped mid-load.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type SlotKey = (String, String);

/// Registry of dependency load states.
///
/// A load in flight is awaited by every other caller instead of being started
/// again. A failed load leaves the entry `NotLoaded`, so the next export
/// retries it.
#[derive(Default)]
pub struct DependencyRegistry {
    slots: Mutex<HashMap<SlotKey, Arc<Slot>>>,
}

static GLOBAL: OnceLock<Arc<DependencyRegistry>> = OnceLock::new();

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry shared by exporters that are not given their own.
    pub fn global() -> Arc<DependencyRegistry> {
        GLOBAL
            .get_or_init(|| Arc::new(DependencyRegistry::new()))
            .clone()
    }

    fn slot(&self, document: &str, id: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry((document.to_string(), id.to_string()))
            .or_default()
            .clone()
    }

    /// Load state of dependency `id` in host document `document`.
    pub fn status(&self, document: &str, id: &str) -> DependencyStatus {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(&(document.to_string(), id.to_string())) {
            Some(slot) if slot.cell.initialized() => DependencyStatus::Loaded,
            Some(slot) if slot.in_flight.load(Ordering::SeqCst) => DependencyStatus::Loading,
            _ => DependencyStatus::NotLoaded,
        }
    }

    /// Make sure `source` is loaded into the loader's document, loading it
    /// through `loader` if nobody has.
    pub async fn ensure_loaded(
        &self,
        source: &DependencySource,
        loader: &dyn DependencyLoader,
    ) -> Result<()> {
        let document = loader.document();
        let slot = self.slot(document, &source.id);
        if slot.cell.initialized() {
            debug!("dependency {} already loaded in {}", source.id, document);
            return Ok(());
        }

        slot.cell
            .get_or_try_init(|| async {
                debug!("loading dependency {} from {} into {}", source.id, source.url, document);
                let res = {
                    let _flag = InFlight::enter(&slot.in_flight);
                    loader.load(source).await
                };
                res.map_err(|e| match e {
                    Error::DependencyLoad { .. } => e,
                    other => Error::DependencyLoad {
                        id: source.id.clone(),
                        reason: other.to_string(),
                    },
                })
            })
            .await?;
        Ok(())
    }
}
