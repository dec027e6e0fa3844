use std::collections::HashSet;
use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use subseq_flowchart::algorithms::would_create_cycle;
use subseq_flowchart::layout::{LayoutOptions, layout_patches};
use subseq_flowchart::models::{Edge, Node, NodeData, NodeId, Position};

fn lcg_next(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
}

fn node_id(idx: usize) -> String {
    format!("n{idx}")
}

fn synthetic_flowchart(node_count: usize, edge_count: usize) -> (Vec<Node>, Vec<Edge>) {
    let nodes = (0..node_count)
        .map(|idx| Node::new(node_id(idx), Position::default(), NodeData::labeled("N")))
        .collect::<Vec<_>>();

    let mut state = 0x1234_5678_9abc_def0u64;
    let mut seen = HashSet::with_capacity(edge_count);
    let mut edges = Vec::with_capacity(edge_count);
    while edges.len() < edge_count {
        let a = (lcg_next(&mut state) as usize) % node_count;
        let b = (lcg_next(&mut state) as usize) % node_count;
        if a == b {
            continue;
        }
        let (from, to) = if a < b { (a, b) } else { (b, a) };
        if seen.insert((from, to)) {
            edges.push(Edge::new(
                format!("e{from}-{to}"),
                node_id(from),
                node_id(to),
            ));
        }
    }

    (nodes, edges)
}

fn bench_cycle_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_checks");
    for (nodes, edges) in [(1_000usize, 3_000usize), (3_000usize, 9_000usize)] {
        let (node_data, edge_data) = synthetic_flowchart(nodes, edges);
        let ids = node_data
            .iter()
            .map(|node| node.id.clone())
            .collect::<Vec<NodeId>>();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("would_create_cycle", format!("{nodes}n_{edges}e")),
            &(edge_data, ids),
            |b, (edges, ids)| {
                let mut seed = 42u64;
                b.iter(|| {
                    let source = &ids[(lcg_next(&mut seed) as usize) % ids.len()];
                    let target = &ids[(lcg_next(&mut seed) as usize) % ids.len()];
                    black_box(would_create_cycle(edges, source, target));
                });
            },
        );
    }
    group.finish();
}

fn bench_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout");
    group.sample_size(20);
    for (nodes, edges) in [(100usize, 200usize), (500usize, 1_000usize)] {
        let (node_data, edge_data) = synthetic_flowchart(nodes, edges);
        let options = LayoutOptions::default();

        group.throughput(Throughput::Elements(nodes as u64));
        group.bench_with_input(
            BenchmarkId::new("layout_patches", format!("{nodes}n_{edges}e")),
            &(node_data, edge_data),
            |b, (nodes, edges)| {
                b.iter(|| black_box(layout_patches(nodes, edges, &options)));
            },
        );
    }
    group.finish();
}

criterion_group!(diagram_checks, bench_cycle_checks, bench_layout);
criterion_main!(diagram_checks);
