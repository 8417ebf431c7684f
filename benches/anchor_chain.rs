//! Anchor chain append and verification throughput.

use agidentity::anchor::{verify_chain, AnchorChain, AnchorKind};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

fn bench_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let payload = vec![0x5au8; 1024];

    c.bench_function("add_anchor_in_memory", |b| {
        let chain = AnchorChain::new();
        let (chain, payload) = (&chain, payload.as_slice());
        b.to_async(&rt).iter(|| async move {
            chain
                .add_anchor(AnchorKind::ToolUse, "bench", payload)
                .await
                .unwrap()
        });
    });
}

fn bench_verify(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("verify_chain");

    for size in [100usize, 1_000, 10_000] {
        let entries = rt.block_on(async {
            let chain = AnchorChain::new();
            for i in 0..size {
                chain
                    .add_anchor(AnchorKind::MessageReceived, "bench", i.to_string().as_bytes())
                    .await
                    .unwrap();
            }
            chain.entries().await
        });
        group.bench_with_input(BenchmarkId::from_parameter(size), &entries, |b, entries| {
            b.iter(|| verify_chain(entries));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_verify);
criterion_main!(benches);
