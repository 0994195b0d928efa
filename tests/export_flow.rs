//! End-to-end export tests against the in-memory backend

use flyerexport::memory::{MemoryBackend, MemoryLoad, MemoryReadiness, MemoryTemplate};
use flyerexport::{
    Dimensions, DependencyRegistry, Error, ExportConfig, ExportState, Exporter, PrintOverride,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn exporter_for(backend: &MemoryBackend) -> Exporter {
    Exporter::builder(backend.origin())
        .surfaces(backend.surfaces())
        .rasterizer(backend.rasterizer())
        .loader(backend.loader())
        .sink(backend.sink())
        .registry(Arc::new(DependencyRegistry::new()))
        .build()
        .expect("exporter")
}

/// Small override so tests that don't care about size stay fast.
fn small(template: &str) -> ExportConfig {
    ExportConfig::new(template, "https://x/1").with_print(PrintOverride::new(170.0, 220.0))
}

fn recorded_config(template: &str, statuses: &Arc<Mutex<Vec<String>>>) -> ExportConfig {
    let log = statuses.clone();
    ExportConfig::new(template, "https://x/1")
        .with_status(move |msg: &str| log.lock().unwrap().push(msg.to_string()))
}

#[tokio::test(start_paused = true)]
async fn exports_flyer_and_delivers_once() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    let exporter = exporter_for(&backend);

    let statuses = Arc::new(Mutex::new(Vec::new()));
    exporter
        .export_flyer_png(recorded_config("t.html", &statuses))
        .await
        .expect("export should succeed");

    assert_eq!(
        *statuses.lock().unwrap(),
        vec!["Preparing…", "Rendering image…", "Download started ✅"]
    );

    let deliveries = backend.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].filename, "movethatcouch-flyer.png");
    assert_eq!(&deliveries[0].image.bytes[0..8], b"\x89PNG\r\n\x1a\n");

    let snap = flyerexport::Snapshot::from_png(&deliveries[0].image.bytes).unwrap();
    assert_eq!(snap.dimensions(), Dimensions::new(2550, 3300));
    assert_eq!(snap.pixel(0, 0), [255, 255, 255, 255]);

    assert_eq!(backend.live_surfaces(), 0);
    assert_eq!(backend.detach_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_root_fails_before_delivery() {
    let backend = MemoryBackend::new();
    backend.add_template(
        "/t.html",
        MemoryTemplate::from_html("<html><body><div id=\"poster\"></div></body></html>")
            .with_readiness(MemoryReadiness::Resolves),
    );
    let exporter = exporter_for(&backend);

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let err = exporter
        .export_flyer_png(recorded_config("t.html", &statuses))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RootElementMissing(ref id) if id == "flyer"));
    assert_eq!(*statuses.lock().unwrap(), vec!["Preparing…", "Rendering image…"]);
    assert!(backend.deliveries().is_empty());
    assert_eq!(backend.live_surfaces(), 0);
}

#[tokio::test(start_paused = true)]
async fn load_that_never_fires_times_out_and_tears_down() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer().with_load(MemoryLoad::Never));
    let exporter = exporter_for(&backend);

    let start = tokio::time::Instant::now();
    let err = exporter
        .export_flyer_png(small("t.html"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RenderTimeout(12000)));
    assert!(start.elapsed() >= Duration::from_millis(12000));
    assert_eq!(backend.created_surfaces().len(), 1);
    assert_eq!(backend.live_surfaces(), 0);
    assert_eq!(backend.detach_count(), 1);
    assert!(backend.rasterized().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_readiness_still_exports() {
    let backend = MemoryBackend::new();
    backend.add_template(
        "/t.html",
        MemoryTemplate::flyer().with_readiness(MemoryReadiness::Rejects("font 404".into())),
    );
    let exporter = exporter_for(&backend);

    exporter
        .export_flyer_png(small("t.html"))
        .await
        .expect("readiness rejection is not fatal");
    assert_eq!(backend.deliveries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn throwing_readiness_still_exports() {
    let backend = MemoryBackend::new();
    backend.add_template(
        "/t.html",
        MemoryTemplate::flyer().with_readiness(MemoryReadiness::Throws("SecurityError".into())),
    );
    let exporter = exporter_for(&backend);

    exporter
        .export_flyer_png(small("t.html"))
        .await
        .expect("readiness throw is not fatal");
    assert_eq!(backend.deliveries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unsignaled_content_waits_grace_delay() {
    let backend = MemoryBackend::new();
    backend.add_template(
        "/t.html",
        MemoryTemplate::flyer().with_readiness(MemoryReadiness::NotAwaitable),
    );
    let exporter = exporter_for(&backend);

    let start = tokio::time::Instant::now();
    exporter
        .export_flyer_png(small("t.html"))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn slow_readiness_past_deadline_times_out() {
    let backend = MemoryBackend::new();
    backend.add_template(
        "/t.html",
        MemoryTemplate::flyer()
            .with_load(MemoryLoad::After(Duration::from_millis(200)))
            .with_readiness(MemoryReadiness::ResolvesAfter(Duration::from_secs(30))),
    );
    let exporter = Exporter::builder(backend.origin())
        .surfaces(backend.surfaces())
        .rasterizer(backend.rasterizer())
        .loader(backend.loader())
        .sink(backend.sink())
        .registry(Arc::new(DependencyRegistry::new()))
        .readiness_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let err = exporter
        .export_flyer_png(small("t.html"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RenderTimeout(2000)));
    assert_eq!(backend.live_surfaces(), 0);
}

#[tokio::test(start_paused = true)]
async fn cross_origin_document_is_reported() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer().cross_origin());
    let exporter = exporter_for(&backend);

    let err = exporter
        .export_flyer_png(small("t.html"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ContentDocumentUnavailable(_)));
    assert_eq!(backend.live_surfaces(), 0);
}

#[tokio::test(start_paused = true)]
async fn dependency_failure_never_creates_surface() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    backend.fail_script_loads(true);
    let exporter = exporter_for(&backend);

    let err = exporter
        .export_flyer_png(small("t.html"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyLoad { .. }));
    assert!(backend.created_surfaces().is_empty());

    backend.fail_script_loads(false);
    exporter
        .export_flyer_png(small("t.html"))
        .await
        .expect("a later export retries the dependency");
    assert_eq!(backend.script_insertions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn delivery_failure_tears_down() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    backend.fail_deliveries(true);
    let exporter = exporter_for(&backend);

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let err = exporter
        .export_flyer_png(
            recorded_config("t.html", &statuses).with_print(PrintOverride::new(170.0, 220.0)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Delivery(_)));
    assert!(!statuses.lock().unwrap().iter().any(|s| s.starts_with("Download")));
    assert_eq!(backend.live_surfaces(), 0);
}

#[tokio::test(start_paused = true)]
async fn mis_sized_snapshot_is_rejected() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    backend.force_raster_size(Some(Dimensions::new(100, 100)));
    let exporter = exporter_for(&backend);

    let err = exporter
        .export_flyer_png(ExportConfig::new("t.html", "https://x/1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Render(_)));
    assert!(backend.deliveries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn override_sizes_surface_and_raster_exactly() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    let exporter = exporter_for(&backend);

    for (w, h) in [(1800.0, 1200.0), (640.4, 959.6), (1.0, 1.0)] {
        exporter
            .export_flyer_png(
                ExportConfig::new("t.html", "https://x/1").with_print(PrintOverride::new(w, h)),
            )
            .await
            .unwrap();
    }

    let expected = [
        Dimensions::new(1800, 1200),
        Dimensions::new(640, 960),
        Dimensions::new(1, 1),
    ];
    let surfaces: Vec<_> = backend.created_surfaces().iter().map(|s| s.size).collect();
    assert_eq!(surfaces, expected);
    let rasters: Vec<_> = backend.rasterized().iter().map(|o| o.dimensions()).collect();
    assert_eq!(rasters, expected);
    for (delivery, dims) in backend.deliveries().iter().zip(expected) {
        let snap = flyerexport::Snapshot::from_png(&delivery.image.bytes).unwrap();
        assert_eq!(snap.dimensions(), dims);
    }
}

#[tokio::test(start_paused = true)]
async fn partial_override_uses_default_pair() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    let exporter = exporter_for(&backend);

    exporter
        .export_flyer_png(
            ExportConfig::new("t.html", "https://x/1")
                .with_print(PrintOverride::new(1800.0, f64::NAN)),
        )
        .await
        .unwrap();
    assert_eq!(backend.created_surfaces()[0].size, Dimensions::new(2550, 3300));
}

#[tokio::test(start_paused = true)]
async fn states_are_reported_in_order() {
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let exporter = Exporter::builder(backend.origin())
        .surfaces(backend.surfaces())
        .rasterizer(backend.rasterizer())
        .loader(backend.loader())
        .sink(backend.sink())
        .registry(Arc::new(DependencyRegistry::new()))
        .on_state(move |s| log.lock().unwrap().push(s))
        .build()
        .unwrap();

    exporter
        .export_flyer_png(small("t.html"))
        .await
        .unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ExportState::Preparing,
            ExportState::Isolating,
            ExportState::AwaitingReadiness,
            ExportState::Rendering,
            ExportState::Delivering,
            ExportState::Done,
        ]
    );

    seen.lock().unwrap().clear();
    let _ = exporter
        .export_flyer_png(small("missing.html"))
        .await;
    assert_eq!(seen.lock().unwrap().last(), Some(&ExportState::Failed));
}

#[tokio::test(start_paused = true)]
async fn every_host_document_gets_the_rasterizer_script() {
    let first = MemoryBackend::new();
    let second = MemoryBackend::new();
    for backend in [&first, &second] {
        backend.add_template("/t.html", MemoryTemplate::flyer());
        let exporter = Exporter::builder(backend.origin())
            .surfaces(backend.surfaces())
            .rasterizer(backend.rasterizer())
            .loader(backend.loader())
            .sink(backend.sink())
            .build()
            .unwrap();
        exporter.export_flyer_png(small("t.html")).await.unwrap();
        exporter.export_flyer_png(small("t.html")).await.unwrap();
    }

    assert_eq!(first.script_insertions().len(), 1);
    assert_eq!(second.script_insertions().len(), 1);
    assert_eq!(first.deliveries().len(), 2);
    assert_eq!(second.deliveries().len(), 2);
}
