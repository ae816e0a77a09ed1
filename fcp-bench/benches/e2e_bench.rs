//! End-to-end client/node benchmarks over an in-memory stream.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fcp_client::{Client, ConnectionConfig};
use fcp_protocol::{Decoder, Encoder, Message};
use futures::future::join_all;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Runtime;

/// Answers every request immediately; `ClientGet` returns `size` bytes.
async fn run_node(mut stream: DuplexStream, size: usize) {
    let payload = Bytes::from(vec![0x42u8; size]);
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);

        while let Ok(Some(request)) = decoder.decode() {
            let id = request.identifier().unwrap_or_default().to_string();
            let reply = match request.name() {
                "ClientHello" => Message::new("NodeHello").with("FCPVersion", "2.0"),
                "GenerateSSK" => Message::new("SSKKeypair")
                    .with("Identifier", id)
                    .with("InsertURI", "SSK@insert/")
                    .with("RequestURI", "SSK@request/"),
                "ClientGet" => Message::new("AllData")
                    .with("Identifier", id)
                    .with_body(payload.clone()),
                _ => continue,
            };
            if stream.write_all(&Encoder::encode(&reply)).await.is_err() {
                return;
            }
        }
    }
}

fn setup_client(rt: &Runtime, size: usize) -> Client {
    let (client_side, node_side) = duplex(256 * 1024);
    rt.spawn(run_node(node_side, size));

    let client = Client::new(ConnectionConfig::default().with_client_name("bench"));
    rt.block_on(async {
        client.attach(client_side).await.unwrap();
        client.node_hello().await.unwrap();
    });
    client
}

fn bench_session_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_client(&rt, 0);

    let mut group = c.benchmark_group("e2e_session");
    group.throughput(Throughput::Elements(1));

    group.bench_function("generate_ssk", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(client.get_ssk_keypair().await.unwrap()) });
    });

    group.finish();
}

fn bench_get_direct(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("e2e_get_direct");

    for size in [1000, 64 * 1024] {
        let client = setup_client(&rt, size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &client, |b, client| {
            b.to_async(&rt)
                .iter(|| async { black_box(client.get_direct("CHK@bench").await.unwrap()) });
        });
    }

    group.finish();
}

fn bench_concurrent_sessions(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_client(&rt, 100);

    let mut group = c.benchmark_group("e2e_concurrent");

    for concurrency in [1, 10, 100] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async {
                    let gets = (0..concurrency).map(|_| client.get_direct("CHK@bench"));
                    for reply in join_all(gets).await {
                        black_box(reply.unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_session_latency,
    bench_get_direct,
    bench_concurrent_sessions,
);

criterion_main!(benches);
