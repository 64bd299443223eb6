use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use sndb::index::query;
use sndb::metadata::{Metadata, PropertyDescriptor, Typecast};
use sndb::{Config, FindRequest, Sequence, Volume};

fn resources() -> Vec<Metadata> {
    let metadata = Metadata::new(
        "doc",
        vec![
            PropertyDescriptor::new("title", Typecast::Str)
                .slot(10)
                .prefix("T")
                .full_text()
                .localized()
                .default(json!({})),
            PropertyDescriptor::new("k", Typecast::Int)
                .slot(11)
                .prefix("K")
                .default(json!(0)),
        ],
    );
    match metadata {
        Ok(metadata) => vec![metadata],
        Err(e) => panic!("bench schema: {}", e),
    }
}

// ============================================================================
// Benchmark: Sequence Algebra
// ============================================================================

fn fragmented(ranges: u64) -> Sequence {
    let mut sequence = Sequence::new();
    for i in 0..ranges {
        sequence.include(i * 10 + 1, Some(i * 10 + 5));
    }
    sequence
}

fn bench_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_algebra");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    // Adjacent includes collapse into one range
    group.throughput(Throughput::Elements(1000));
    group.bench_function("include_adjacent_1000", |b| {
        b.iter(|| {
            let mut sequence = Sequence::new();
            for i in 1..=1000 {
                sequence.include(i, Some(i));
            }
            black_box(sequence)
        })
    });

    // Punching holes into an open range
    group.bench_function("exclude_from_open_1000", |b| {
        b.iter(|| {
            let mut sequence = Sequence::from_start(1);
            for i in 0..1000 {
                sequence.exclude(i * 3 + 1, Some(i * 3 + 1));
            }
            black_box(sequence)
        })
    });

    for size in [10u64, 100, 1000].iter() {
        let left = fragmented(*size);
        let mut right = Sequence::from_start(1);
        right.exclude_all(&fragmented(*size / 2));

        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::new("intersection", size), size, |b, _| {
            b.iter(|| black_box(left.intersection(&right)))
        });
        group.bench_with_input(BenchmarkId::new("complement", size), size, |b, _| {
            b.iter(|| black_box(left.complement()))
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Query Parsing
// ============================================================================

fn bench_query_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_parse");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    let inputs = [
        ("terms", "hello world"),
        ("property", "title:hello k:=3"),
        ("range", "k:10..20 title:\"two words\""),
    ];
    for (name, input) in inputs.iter() {
        group.bench_with_input(BenchmarkId::new("parse", name), input, |b, input| {
            b.iter(|| black_box(query::parse(input)))
        });
    }

    group.bench_function("compile_request", |b| {
        b.iter(|| {
            let request = FindRequest::default()
                .query("title:hello k:1..5")
                .filter("k", json!(3))
                .order_by("-k")
                .limit(0, 20);
            black_box(request.compile())
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: Committed Find
// ============================================================================

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_operations");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => panic!("runtime: {}", e),
    };
    let temp_dir = match TempDir::new() {
        Ok(dir) => dir,
        Err(e) => panic!("temp dir: {}", e),
    };
    let config = Config::new(temp_dir.path()).with_flush(1000, Duration::ZERO);
    let volume = match Volume::open(config, resources()) {
        Ok(volume) => volume,
        Err(e) => panic!("open volume: {}", e),
    };

    runtime.block_on(async {
        if let Ok(directory) = volume.directory("doc") {
            for i in 0..1000 {
                let props = json!({"title": {"en": format!("entry {}", i % 50)}, "k": i});
                if let Some(props) = props.as_object() {
                    let _ = directory.create(props.clone()).await;
                }
            }
        }
        let _ = volume.flush().await;
    });

    let directory = match volume.directory("doc") {
        Ok(directory) => directory.clone(),
        Err(e) => panic!("directory: {}", e),
    };

    group.throughput(Throughput::Elements(20));
    group.bench_function("find_all_first_page", |b| {
        let request = FindRequest::default().limit(0, 20);
        b.iter(|| black_box(directory.find(&request)))
    });

    group.bench_function("find_sorted_by_slot", |b| {
        let request = FindRequest::default().order_by("-k").limit(0, 20);
        b.iter(|| black_box(directory.find(&request)))
    });

    group.bench_function("find_full_text", |b| {
        let request = FindRequest::default().query("entry").limit(0, 20);
        b.iter(|| black_box(directory.find(&request)))
    });

    group.bench_function("find_slot_range", |b| {
        let request = FindRequest::default().query("k:100..200").limit(0, 20);
        b.iter(|| black_box(directory.find(&request)))
    });

    group.finish();

    let _ = runtime.block_on(volume.close());
}

criterion_group!(benches, bench_sequence, bench_query_parse, bench_find);
criterion_main!(benches);
