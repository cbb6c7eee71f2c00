//! End-to-end client benchmarks against the in-process mock service.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hpkv_client::testing::{MockRest, MockServer};
use hpkv_client::{Client, RestClient};
use tokio::runtime::Runtime;

struct TestSetup {
    _server: MockServer,
    client: Client,
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    rt.block_on(async {
        let server = MockServer::start().await;
        let client = Client::new(server.channel_config());
        client.connect().await.unwrap();

        assert!(client.insert("user:1", r#"{"name":"John Doe","age":30}"#).await);

        TestSetup {
            _server: server,
            client,
        }
    })
}

fn bench_fetch_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_fetch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("fetch", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.fetch("user:1").await.unwrap()) });
    });

    group.bench_function("fetch_missing", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.fetch("user:404").await) });
    });

    group.finish();
}

fn bench_write_e2e(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_write");
    group.throughput(Throughput::Elements(1));

    let mut id = 0u64;
    group.bench_function("insert", |b| {
        b.to_async(&rt).iter(|| {
            id += 1;
            let client = &setup.client;
            async move {
                black_box(
                    client
                        .insert(&format!("bench:{}", id), serde_json::json!({"n": id}))
                        .await,
                )
            }
        });
    });

    group.bench_function("partial_update", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                setup
                    .client
                    .update("user:1", serde_json::json!({"age": 31}), true)
                    .await,
            )
        });
    });

    group.finish();
}

fn bench_concurrent_requests(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_concurrent");
    group.sample_size(20);

    for concurrency in [1, 10, 50] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("fetches", concurrency),
            &concurrency,
            |b, &conc| {
                b.to_async(&rt).iter(|| {
                    let client = &setup.client;
                    async move {
                        let fetches: Vec<_> = (0..conc).map(|_| client.fetch("user:1")).collect();
                        black_box(futures_util::future::join_all(fetches).await)
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_rest_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_rest, client): (MockRest, RestClient) = rt.block_on(async {
        let rest = MockRest::start().await;
        let client = rest.client();
        assert!(client.create("user:1", r#"{"name":"John Doe"}"#).await);
        (rest, client)
    });

    let mut group = c.benchmark_group("e2e_rest");
    group.throughput(Throughput::Elements(1));

    group.bench_function("read", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(client.read("user:1").await.unwrap()) });
    });

    group.bench_function("atomic_increment", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(client.atomic_increment("hits", 1).await.unwrap()) });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fetch_latency,
    bench_write_e2e,
    bench_concurrent_requests,
    bench_rest_roundtrip,
);

criterion_main!(benches);
