use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use site_sentinel::detection::{content_drift, structural_drift};
use site_sentinel::fingerprint::Fingerprinter;
use std::collections::BTreeMap;

fn page_with_sections(sections: usize) -> String {
    let mut html = String::from("<html><head><title>Bench</title><meta name=\"description\" content=\"bench page\"></head><body>");
    for i in 0..sections {
        html.push_str(&format!(
            "<section><h2>Section {i}</h2><p>Paragraph {i} with <a href=\"/p/{i}\">a link</a>.</p><script>var x{i} = {i};</script><ul><li>one</li><li>two</li></ul></section>"
        ));
    }
    html.push_str("</body></html>");
    html
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let fingerprinter = Fingerprinter::new("v1");

    for sections in [10, 100, 1000] {
        let html = page_with_sections(sections);
        group.throughput(Throughput::Bytes(html.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sections), &html, |b, html| {
            b.iter(|| fingerprinter.fingerprint(black_box("https://site.test/"), 200, black_box(html.as_bytes())));
        });
    }

    group.finish();
}

fn tag_bag(distinct: usize, offset: u32) -> BTreeMap<String, u32> {
    (0..distinct).map(|i| (format!("tag{i}"), i as u32 + offset)).collect()
}

fn bench_drift(c: &mut Criterion) {
    let mut group = c.benchmark_group("drift");

    for distinct in [16, 128, 1024] {
        let current = tag_bag(distinct, 1);
        let baseline = tag_bag(distinct + distinct / 4, 2);
        group.bench_with_input(BenchmarkId::new("structural", distinct), &distinct, |b, _| {
            b.iter(|| structural_drift(black_box(&current), black_box(&baseline)));
        });
    }

    let current: BTreeMap<&str, String> = [("title", "Home".to_string()), ("description", "Welcome".to_string())]
        .into_iter()
        .collect();
    let baseline: BTreeMap<&str, String> = [("title", "HACKED".to_string()), ("description", "Welcome".to_string())]
        .into_iter()
        .collect();
    group.bench_function("content", |b| {
        b.iter(|| content_drift(black_box(&current), black_box(&baseline)));
    });

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_drift);
criterion_main!(benches);
