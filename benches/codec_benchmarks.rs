// ABOUTME: Benchmark suite for the wire codec: control-line parse/encode and v3 headers
// ABOUTME: Measures the per-message cost on the control plane's hot path

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use lookout::codec::{BinaryFrameHeader, ControlMessage};
use lookout::datatypes::StreamConfig;
use std::io::Cursor;
use std::time::Duration;

fn control_lines() -> Vec<(&'static str, String)> {
    vec![
        ("ping", ControlMessage::Ping { ts_ms: 1_234_567 }.encode()),
        (
            "frame_header",
            ControlMessage::Frame {
                epoch: 42,
                is_keyframe: false,
                ts_us: 123_456_789,
                size: 16_384,
            }
            .encode(),
        ),
        (
            "stream_accepted",
            ControlMessage::StreamAccepted {
                epoch: 7,
                config: StreamConfig::default(),
            }
            .encode(),
        ),
        (
            "auth_response",
            ControlMessage::AuthResponse {
                hash: "a".repeat(64),
            }
            .encode(),
        ),
    ]
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_parse");
    group.measurement_time(Duration::from_secs(5));

    for (name, line) in control_lines() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &line, |b, line| {
            b.iter(|| ControlMessage::parse(black_box(line)));
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_encode");

    let messages = vec![
        ("ping", ControlMessage::Ping { ts_ms: 1_234_567 }),
        (
            "frame_header",
            ControlMessage::Frame {
                epoch: 42,
                is_keyframe: true,
                ts_us: 123_456_789,
                size: 16_384,
            },
        ),
        (
            "stream_accepted",
            ControlMessage::StreamAccepted {
                epoch: 7,
                config: StreamConfig::default(),
            },
        ),
    ];
    for (name, message) in messages {
        group.bench_with_input(BenchmarkId::from_parameter(name), &message, |b, message| {
            b.iter(|| black_box(message).encode());
        });
    }
    group.finish();
}

fn bench_binary_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary_frame_header");

    group.bench_function("encode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(13);
            BinaryFrameHeader::for_frame(black_box(42), true, black_box(65_536)).encode(&mut buf);
            buf
        });
    });

    let mut encoded = BytesMut::new();
    BinaryFrameHeader::for_frame(42, true, 65_536).encode(&mut encoded);
    let header_bytes = encoded[1..].to_vec();
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut cursor = Cursor::new(black_box(header_bytes.as_slice()));
            BinaryFrameHeader::decode(&mut cursor)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_parse, bench_encode, bench_binary_header);
criterion_main!(benches);
