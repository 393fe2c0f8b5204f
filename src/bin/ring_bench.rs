//! Ring throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin ring_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)

use std::env;

use minstant::Instant;

use handoff::sync::{mpsc, spsc};

const MPSC_CAPACITY: usize = 1024;
const MPSC_ITERATIONS: u64 = 1 << 22;

const SPSC_CAPACITY: usize = 1 << 16;
const SPSC_CHUNK: usize = 256;
const SPSC_CHUNKS: usize = 1 << 20;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn bench_mpsc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (producer, mut consumer) = mpsc::channel::<u64, MPSC_CAPACITY>();

    let consumer_thread = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);

        let mut received = 0u64;
        let mut sum = 0u64;
        while received < MPSC_ITERATIONS {
            let run = consumer.peek(MPSC_CAPACITY).expect("canceled mid-bench");
            for value in run {
                sum += value;
            }
            received += run.len() as u64;
            consumer.commit_pop();
        }
        sum
    });

    pin_to_cpu(producer_cpu);

    let start = Instant::now();
    for i in 0..MPSC_ITERATIONS {
        producer.push(i).expect("canceled mid-bench");
    }
    let sum = consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(sum, (MPSC_ITERATIONS - 1) * MPSC_ITERATIONS / 2);
    let ops_per_ms = MPSC_ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("mpsc: {} ops/ms", ops_per_ms);
}

fn bench_spsc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (mut writer, mut reader) = spsc::ring::<u8, 8>(SPSC_CAPACITY);

    let reader_thread = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);

        for _ in 0..SPSC_CHUNKS {
            let region = reader.grant_read(SPSC_CHUNK).expect("canceled mid-bench");
            std::hint::black_box(&region[..SPSC_CHUNK]);
            reader.commit_read(SPSC_CHUNK).expect("canceled mid-bench");
        }
    });

    pin_to_cpu(producer_cpu);

    let start = Instant::now();
    for i in 0..SPSC_CHUNKS {
        let region = writer.grant_write(SPSC_CHUNK).expect("canceled mid-bench");
        region[..SPSC_CHUNK].fill(i as u8);
        writer.commit_write(SPSC_CHUNK).expect("canceled mid-bench");
    }
    reader_thread.join().unwrap();
    let elapsed = start.elapsed();

    let total_bytes = (SPSC_CHUNK * SPSC_CHUNKS) as u128;
    let mib_per_s = total_bytes * 1_000_000_000 / elapsed.as_nanos() / (1024 * 1024);
    println!(
        "spsc: {} MiB/s ({} writer parks)",
        mib_per_s,
        writer.stats().wait_count
    );
}

fn main() {
    handoff::trace::init_tracing();
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!(
        "handoff rings (mpsc cap={}, iters={}; spsc cap={}, chunks={}x{}):",
        MPSC_CAPACITY, MPSC_ITERATIONS, SPSC_CAPACITY, SPSC_CHUNKS, SPSC_CHUNK
    );
    bench_mpsc(producer_cpu, consumer_cpu);
    bench_spsc(producer_cpu, consumer_cpu);
}
