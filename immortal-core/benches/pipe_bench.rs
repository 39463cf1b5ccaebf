// Backed Pipe Benchmarks
//
// Measures the costs that sit on the data path:
// - Ring buffer writes (with and without eviction) and replay reads
// - Pipe writes forwarded to a live in-memory connection
// - Reconnect handshake on an idle pipe

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use immortal_core::pipe::RingBuffer;
use immortal_core::{memory_pair_with_capacity, BackedPipe, Connection, Context, Reconnected};
use std::thread;
use std::time::Duration;

// ============================================================================
// RING BUFFER BENCHMARKS
// ============================================================================

fn bench_ring_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    group.measurement_time(Duration::from_secs(2));

    for chunk in [64usize, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*chunk as u64));
        group.bench_with_input(BenchmarkId::new("write", chunk), chunk, |b, &chunk| {
            let ring = RingBuffer::new(1024 * 1024);
            let data = vec![0xabu8; chunk];
            b.iter(|| black_box(ring.write(black_box(&data))))
        });
    }

    group.bench_function("read_last_4k", |b| {
        let ring = RingBuffer::new(64 * 1024);
        ring.write(&vec![7u8; 64 * 1024]);
        b.iter(|| black_box(ring.read_last(black_box(4096))))
    });

    group.finish();
}

// ============================================================================
// PIPE DATA PATH BENCHMARKS
// ============================================================================

/// Pipe whose remote end is drained by a background thread
fn draining_pipe() -> BackedPipe {
    let reconnector = move |_: &Context, _: u64| -> anyhow::Result<Reconnected> {
        let (local, remote) = memory_pair_with_capacity(256 * 1024);
        thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            while matches!(remote.read(&mut buf), Ok(n) if n > 0) {}
        });
        // Benchmarks connect before writing, so there is never a tail to replay
        Ok(Reconnected::new(local, 0))
    };
    BackedPipe::new(&Context::background(), reconnector)
}

fn bench_pipe_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe_write");
    group.measurement_time(Duration::from_secs(3));

    for chunk in [64usize, 4096, 32 * 1024].iter() {
        group.throughput(Throughput::Bytes(*chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), chunk, |b, &chunk| {
            let pipe = draining_pipe();
            let data = vec![0x5au8; chunk];
            let _ = pipe.connect(&Context::background());
            b.iter(|| pipe.write(black_box(&data)))
        });
    }

    group.finish();
}

fn bench_reconnect(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconnect");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(50);

    group.bench_function("force_reconnect_idle", |b| {
        let pipe = draining_pipe();
        let ctx = Context::background();
        b.iter(|| black_box(pipe.force_reconnect(&ctx)))
    });

    group.finish();
}

criterion_group!(benches, bench_ring_buffer, bench_pipe_write, bench_reconnect);
criterion_main!(benches);
