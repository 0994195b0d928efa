use criterion::{criterion_group, criterion_main, Criterion};
use flyerexport::memory::{MemoryBackend, MemoryTemplate};
use flyerexport::{Dimensions, ExportConfig, Exporter, PrintOverride, Snapshot};

fn bench_export(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let backend = MemoryBackend::new();
    backend.add_template("/t.html", MemoryTemplate::flyer());
    let exporter = Exporter::builder(backend.origin())
        .surfaces(backend.surfaces())
        .rasterizer(backend.rasterizer())
        .loader(backend.loader())
        .sink(backend.sink())
        .build()
        .expect("exporter");

    // Quarter-size letter keeps an iteration short while still exercising
    // the full handshake and a real PNG encode.
    c.bench_function("export_flyer_png_638x825", |b| {
        b.iter(|| {
            rt.block_on(exporter.export_flyer_png(
                ExportConfig::new("t.html", "https://x/1").with_print(PrintOverride::new(637.5, 825.0)),
            ))
            .unwrap();
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    let snap = Snapshot::filled(Dimensions::new(2550, 3300), [255, 255, 255, 255]);
    c.bench_function("encode_png_letter_300dpi", |b| {
        b.iter(|| {
            let _ = snap.encode_png().unwrap();
        })
    });
}

criterion_group!(benches, bench_export, bench_encode);
criterion_main!(benches);
