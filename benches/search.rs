//! Throughput benchmarks for the search engine.
//!
//! Uses the constant evaluator, so these measure tree machinery (selection,
//! expansion, backup, transposition handling), not inference.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tengen::{ConstEvaluator, GridGo, Player, Search, SearchParams};

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    group.bench_function("visits_1000_9x9_single_thread", |b| {
        b.iter(|| {
            let params = SearchParams::for_testing().with_max_visits(1000);
            let game = GridGo::new(9, 9, 7.5);
            let mut search =
                Search::new(params, Arc::new(ConstEvaluator::new(9, 9)), game, "bench");
            search.run_whole_search_for_player(Player::Black, false).unwrap();
            black_box(search.root_visits())
        })
    });

    group.bench_function("visits_1000_9x9_four_threads", |b| {
        b.iter(|| {
            let params = SearchParams::for_testing().with_max_visits(1000).with_threads(4);
            let game = GridGo::new(9, 9, 7.5);
            let mut search =
                Search::new(params, Arc::new(ConstEvaluator::new(9, 9)), game, "bench-mt");
            search.run_whole_search_for_player(Player::Black, false).unwrap();
            black_box(search.root_visits())
        })
    });

    group.bench_function("tree_reuse_make_move", |b| {
        b.iter(|| {
            let params = SearchParams::for_testing().with_max_visits(400);
            let game = GridGo::new(9, 9, 7.5);
            let mut search =
                Search::new(params, Arc::new(ConstEvaluator::new(9, 9)), game, "bench-reuse");
            let mut pla = Player::Black;
            for _ in 0..4 {
                search.run_whole_search_for_player(pla, false).unwrap();
                let loc = search.get_chosen_move_loc();
                assert!(search.make_move(loc, pla));
                pla = pla.opp();
            }
            black_box(search.node_table_len())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
