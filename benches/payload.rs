//! Payload codec and polling benchmark suite.
//!
//! Benchmarks batch encoding/decoding at different scales:
//! - Batch sizes: 1, 16, 128 packets
//! - Text (ASCII and surrogate-heavy) and binary packets
//!
//! Run with: cargo bench --bench payload
//! Results saved to: target/criterion/

use std::hint::black_box;

use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::Method;
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use engineio_server::protocol::payload::{self, Frame};
use engineio_server::protocol::{Packet, PacketType};
use engineio_server::transport::{Polling, PollingOptions};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const BATCH_SIZES: &[usize] = &[1, 16, 128];

fn ascii_batch(size: usize) -> Vec<Frame> {
    (0..size)
        .map(|i| {
            (
                Packet::text(PacketType::Message),
                Bytes::from(format!("message number {i} with some ascii text")),
            )
        })
        .collect()
}

fn emoji_batch(size: usize) -> Vec<Frame> {
    (0..size)
        .map(|_| {
            (
                Packet::text(PacketType::Message),
                Bytes::from("grinning 😀 faces 😀 everywhere 😀".repeat(4)),
            )
        })
        .collect()
}

fn binary_batch(size: usize) -> Vec<Frame> {
    (0..size)
        .map(|i| {
            (
                Packet::binary(PacketType::Message),
                Bytes::from(vec![u8::try_from(i % 256).unwrap_or_default(); 64]),
            )
        })
        .collect()
}

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_payload");

    for &size in BATCH_SIZES {
        group.throughput(Throughput::Elements(size as u64));

        let ascii = ascii_batch(size);
        group.bench_with_input(BenchmarkId::new("ascii", size), &ascii, |b, batch| {
            b.iter(|| payload::encode_payload(black_box(batch), true).unwrap());
        });

        let emoji = emoji_batch(size);
        group.bench_with_input(BenchmarkId::new("emoji", size), &emoji, |b, batch| {
            b.iter(|| payload::encode_payload(black_box(batch), true).unwrap());
        });

        let binary = binary_batch(size);
        group.bench_with_input(BenchmarkId::new("binary", size), &binary, |b, batch| {
            b.iter(|| payload::encode_payload(black_box(batch), true).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("base64", size), &binary, |b, batch| {
            b.iter(|| payload::encode_payload(black_box(batch), false).unwrap());
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frames");

    for &size in BATCH_SIZES {
        group.throughput(Throughput::Elements(size as u64));

        let ascii = payload::encode_payload(&ascii_batch(size), true).unwrap().body;
        group.bench_with_input(BenchmarkId::new("ascii", size), &ascii, |b, body| {
            b.iter(|| payload::decode_frames(black_box(body)).unwrap());
        });

        let emoji = payload::encode_payload(&emoji_batch(size), true).unwrap().body;
        group.bench_with_input(BenchmarkId::new("emoji", size), &emoji, |b, body| {
            b.iter(|| payload::decode_frames(black_box(body)).unwrap());
        });

        let binary = payload::encode_payload(&binary_batch(size), true).unwrap().body;
        group.bench_with_input(BenchmarkId::new("binary", size), &binary, |b, body| {
            b.iter(|| payload::decode_frames(black_box(body)).unwrap());
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Poll Round Trip
// ============================================================================

fn bench_poll(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let polling = rt.block_on(async { Polling::new(PollingOptions::default()) });
    let polling = &polling;

    let mut group = c.benchmark_group("poll_round_trip");

    for &size in &BATCH_SIZES[..2] {
        group.bench_with_input(BenchmarkId::new("messages", size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                for (packet, data) in ascii_batch(size) {
                    polling.send(packet, data, false).await;
                }

                let request = Request::builder()
                    .method(Method::GET)
                    .uri("/engine.io/?transport=polling")
                    .body(Body::empty())
                    .unwrap();
                let response = polling.handle_request(request).await;
                to_bytes(response.into_body(), usize::MAX).await.unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_poll);
criterion_main!(benches);
