//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths of a terminal session:
//! - Envelope encoding of PTY output
//! - Envelope decoding of client input
//! - UTF-8 reassembly of PTY reads

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::session::pty::{Utf8Decoder, READ_BUFFER_SIZE};
use protocol::{decode, encode, Message};

/// Benchmark encoding of `output` envelopes.
fn bench_output_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_encoding");

    // Single keystroke echo
    let small = "a".to_string();
    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_function("echo_1B", |b| {
        b.iter(|| encode(black_box(&Message::Output(small.clone()))).unwrap());
    });

    // One full PTY read
    let chunk = "ls -la output line\r\n".repeat(READ_BUFFER_SIZE / 20);
    group.throughput(Throughput::Bytes(chunk.len() as u64));
    group.bench_function("read_chunk", |b| {
        b.iter(|| encode(black_box(&Message::Output(chunk.clone()))).unwrap());
    });

    // Escape-heavy output (colors, control characters)
    let escapes = "\x1b[1;32mok\x1b[0m\t\"quoted\"\r\n".repeat(32);
    group.throughput(Throughput::Bytes(escapes.len() as u64));
    group.bench_function("ansi_escapes", |b| {
        b.iter(|| encode(black_box(&Message::Output(escapes.clone()))).unwrap());
    });

    group.finish();
}

/// Benchmark decoding of client envelopes.
fn bench_input_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("input_decoding");

    let input = r#"{"type":"input","data":"k"}"#;
    group.bench_function("keystroke", |b| {
        b.iter(|| decode(black_box(input)).unwrap());
    });

    let resize = r#"{"type":"resize","data":{"cols":120,"rows":40}}"#;
    group.bench_function("resize", |b| {
        b.iter(|| decode(black_box(resize)).unwrap());
    });

    let paste = encode(&Message::Input("x".repeat(4096))).unwrap();
    group.throughput(Throughput::Bytes(paste.len() as u64));
    group.bench_function("paste_4KB", |b| {
        b.iter(|| decode(black_box(&paste)).unwrap());
    });

    group.finish();
}

/// Benchmark UTF-8 reassembly across PTY reads.
fn bench_utf8_decoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8_decoder");

    let ascii = vec![b'a'; READ_BUFFER_SIZE];
    group.throughput(Throughput::Bytes(ascii.len() as u64));
    group.bench_function("ascii_chunk", |b| {
        let mut decoder = Utf8Decoder::default();
        b.iter(|| decoder.push(black_box(&ascii)));
    });

    // Multi-byte text split mid-character on every read
    let text = "héllo wörld ✓ ".repeat(64);
    let bytes = text.as_bytes();
    let split = bytes.len() / 2 + 1;
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("split_multibyte", |b| {
        let mut decoder = Utf8Decoder::default();
        b.iter(|| {
            let mut out = decoder.push(black_box(&bytes[..split]));
            out.push_str(&decoder.push(black_box(&bytes[split..])));
            out
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_output_encoding,
    bench_input_decoding,
    bench_utf8_decoder
);
criterion_main!(benches);
