//! Dispatch Benchmarks
//!
//! Measures the hash primitives and a full dispatch query across the
//! balance policies that matter for per-request latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashMap;
use zoneroute::dispatch::{Dispatcher, Vhost};
use zoneroute::routing::hash::{hash_str, mix32};
use zoneroute::routing::{Balance, Node, NodeSpec, OperStatus, ServerSpec};
use zoneroute::zone::{ipv4_to_u32, ZoneIndex};

/// One vhost, one node with four servers under the given policy.
fn dispatcher(balance: Balance, weights: [&str; 4]) -> Dispatcher {
    let mut zones = ZoneIndex::new();
    let id = zones.intern("z1").unwrap();
    let base = ipv4_to_u32("10.0.0.0");
    zones.insert(base, base | 0x00ff_ffff, "z1", id);

    let servers = weights
        .iter()
        .enumerate()
        .map(|(i, w)| ServerSpec {
            ip: format!("192.0.2.{}", i + 1),
            id: i,
            weight_spec: w.to_string(),
            status: OperStatus::Up,
        })
        .collect();
    let node = Node::build(NodeSpec {
        name: "pool".to_string(),
        id: 0,
        balance,
        bw: 0,
        maxbw: 0,
        freebw: 20,
        status: OperStatus::Up,
        overflow_to: None,
        servers,
    })
    .unwrap();

    let mut vhost = Vhost::new("h1", vec![node], 0);
    vhost.map_zone(id, 0);

    let mut vhosts = HashMap::new();
    vhosts.insert("h1".to_string(), vhost);
    Dispatcher::new(zones, vhosts)
}

fn bench_hash(c: &mut Criterion) {
    c.bench_function("hash/mix32", |b| b.iter(|| mix32(black_box(0xdead_beef))));
    c.bench_function("hash/hash_str", |b| {
        b.iter(|| hash_str(black_box("/videos/clip.flv")))
    });
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/query");

    let cases = [
        ("round_robin", Balance::RoundRobin, ["", "", "", ""]),
        ("hash_ring", Balance::HashRing, ["25", "25", "25", "25"]),
        ("weighted_random", Balance::WeightedRandom, ["25", "25", "25", "25"]),
        ("arranged", Balance::Arranged, ["25", "25", "25", "25"]),
    ];

    for (name, balance, weights) in cases {
        let disp = dispatcher(balance, weights);
        group.bench_function(name, |b| {
            b.iter(|| {
                disp.query(
                    black_box("10.1.2.3"),
                    black_box("h1"),
                    black_box("/videos/clip.flv"),
                )
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hash, bench_query);
criterion_main!(benches);
