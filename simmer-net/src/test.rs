use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use test_log::test;

use crate::{
    allgather, allreduce_and, allreduce_min_i32, allreduce_sum_f64, barrier, comm_split,
    join_as_spawnee, replace_world, Fabric, FabricConfig, FaultPolicy, Rank, RankCtx, RepairCfg,
    World, TAG_BUDDY, TAG_HALO,
};

type Results<T> = Arc<Mutex<HashMap<i32, T>>>;

fn record<T>(results: &Results<T>, rank: Rank, v: T) {
    results.lock().unwrap().insert(rank.0, v);
}

fn run_ranks<T: Send + 'static>(
    n: usize,
    body: impl Fn(RankCtx, World, Rank) -> Option<(Rank, T)> + Send + Sync + 'static,
) -> HashMap<i32, T> {
    let results: Results<T> = Arc::new(Mutex::new(HashMap::new()));
    let out = results.clone();
    Fabric::run(
        n,
        FabricConfig::default(),
        Arc::new(move |ctx: RankCtx| {
            let world = ctx
                .ep
                .fabric()
                .initial_world(FaultPolicy::Respawn)
                .unwrap();
            let me = world.my_rank(&ctx.ep).unwrap();
            if let Some((rank, v)) = body(ctx, world, me) {
                record(&results, rank, v);
            }
        }),
    )
    .unwrap();
    Arc::try_unwrap(out).ok().unwrap().into_inner().unwrap()
}

#[test]
fn test_send_recv_and_tag_isolation() {
    let got = run_ranks(2, |mut ctx, world, me| {
        if me == Rank(0) {
            // A buddy payload posted before the halo payload must not be
            // consumed by a halo receive.
            ctx.ep.send(&world, Rank(1), TAG_BUDDY, b"buddy").unwrap();
            ctx.ep.send(&world, Rank(1), TAG_HALO, b"halo").unwrap();
            None
        } else {
            let halo = ctx.ep.recv(&world, Rank(0), TAG_HALO).unwrap();
            let buddy = ctx.ep.recv(&world, Rank(0), TAG_BUDDY).unwrap();
            Some((me, (halo, buddy)))
        }
    });
    assert_eq!(got[&1].0, b"halo".to_vec());
    assert_eq!(got[&1].1, b"buddy".to_vec());
}

#[test]
fn test_same_tag_fifo_order() {
    let got = run_ranks(2, |mut ctx, world, me| {
        if me == Rank(0) {
            for i in 0..5u8 {
                ctx.ep.send(&world, Rank(1), TAG_HALO, &[i]).unwrap();
            }
            None
        } else {
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(ctx.ep.recv(&world, Rank(0), TAG_HALO).unwrap()[0]);
            }
            Some((me, seen))
        }
    });
    assert_eq!(got[&1], vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_collectives() {
    let got = run_ranks(4, |mut ctx, world, me| {
        let sum = allreduce_sum_f64(&world, &mut ctx.ep, me.0 as f64).unwrap();
        let min = allreduce_min_i32(&world, &mut ctx.ep, 10 - me.0).unwrap();
        let all: Vec<i32> = allgather(&world, &mut ctx.ep, &me.0).unwrap();
        let and = allreduce_and(&world, &mut ctx.ep, me.0 != 2).unwrap();
        barrier(&world, &mut ctx.ep).unwrap();
        Some((me, (sum, min, all, and)))
    });
    for r in 0..4 {
        let (sum, min, all, and) = &got[&r];
        assert_eq!(*sum, 6.0);
        assert_eq!(*min, 7);
        assert_eq!(*all, vec![0, 1, 2, 3]);
        assert!(!*and);
    }
}

#[test]
fn test_comm_split_families() {
    // 2x2 grid: column families {0,2} and {1,3}, split key = rank.
    let got = run_ranks(4, |mut ctx, world, me| {
        let ns = comm_split(&world, &mut ctx.ep, me.0 % 2, me.0, 1).unwrap();
        let my_ns = ns.my_rank(&ctx.ep).unwrap();
        // Exchange within the family to prove membership lines up.
        let peer = Rank(1 - my_ns.0);
        ctx.ep
            .send(&ns, peer, TAG_HALO, &[me.0 as u8])
            .unwrap();
        let from = ctx.ep.recv(&ns, peer, TAG_HALO).unwrap()[0] as i32;
        Some((me, (ns.size(), my_ns.0, from)))
    });
    assert_eq!(got[&0], (2, 0, 2));
    assert_eq!(got[&2], (2, 1, 0));
    assert_eq!(got[&1], (2, 0, 3));
    assert_eq!(got[&3], (2, 1, 1));
}

#[test]
fn test_repair_is_idempotent_on_healthy_world() {
    let got = run_ranks(3, |mut ctx, world, me| {
        let again = replace_world(&mut ctx.ep, &world, &RepairCfg::default()).unwrap();
        Some((me, again.epoch() == world.epoch()))
    });
    assert!(got.values().all(|same| *same));
}

#[test]
fn test_repair_respawns_dead_rank_in_original_order() {
    let results: Results<(i32, bool, Vec<i32>)> = Arc::new(Mutex::new(HashMap::new()));
    let out = results.clone();
    Fabric::run(
        4,
        FabricConfig::default(),
        Arc::new(move |mut ctx: RankCtx| {
            let fab = ctx.ep.fabric().clone();
            if ctx.spawnee {
                let adopted = join_as_spawnee(&mut ctx.ep).unwrap();
                let all: Vec<i32> =
                    allgather(&adopted.world, &mut ctx.ep, &adopted.rank.0).unwrap();
                record(&results, adopted.rank, (adopted.world.size(), true, all));
                return;
            }
            let world = fab.initial_world(FaultPolicy::Respawn).unwrap();
            let me = world.my_rank(&ctx.ep).unwrap();
            if me == Rank(2) {
                // Dies before contributing to the collective.
                ctx.ep.simulate_failure();
                return;
            }
            let restored = match allreduce_sum_f64(&world, &mut ctx.ep, 1.0) {
                Ok(_) => panic!("allreduce should have failed"),
                Err(fault) => {
                    assert!(fault.is_recoverable());
                    world.revoke();
                    replace_world(&mut ctx.ep, &world, &RepairCfg::default()).unwrap()
                }
            };
            assert_eq!(restored.my_rank(&ctx.ep).unwrap(), me);
            let all: Vec<i32> = allgather(&restored, &mut ctx.ep, &me.0).unwrap();
            record(&results, me, (restored.size(), false, all));
        }),
    )
    .unwrap();
    let got = Arc::try_unwrap(out).unwrap().into_inner().unwrap();
    assert_eq!(got.len(), 4);
    for r in 0..4 {
        let (size, spawnee, all) = &got[&r];
        assert_eq!(*size, 4);
        assert_eq!(*spawnee, r == 2);
        // Rank order restored: the allgather over the repaired world
        // comes back in original rank order.
        assert_eq!(*all, vec![0, 1, 2, 3]);
    }
}
