use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use test_log::test;

use simmer_net::{Fabric, FabricConfig, FaultPolicy, RankCtx};

use crate::{
    buddy_exchange, buddy_restore, decode_payload, encode_payload, extract_final_number,
    BuddyCkpt, Store, StoreConfig, Timers,
};

#[test]
fn test_payload_roundtrip_without_trailer() {
    let tile = vec![1.5, -2.25, 0.0, 1e300];
    let bytes = encode_payload(&tile, None);
    assert_eq!(bytes.len(), 1 + 8 * 4);
    let mut out = vec![0.0; 4];
    let timers = decode_payload(&bytes, &mut out).unwrap();
    assert_eq!(out, tile);
    assert!(timers.is_none());
}

#[test]
fn test_payload_roundtrip_with_trailer() {
    let tile = vec![3.0; 6];
    let mut t = Timers::default();
    t.total_wf_time = 12.5;
    t.complete_output = 0.25;
    let bytes = encode_payload(&tile, Some(&t));
    let mut out = vec![0.0; 6];
    let got = decode_payload(&bytes, &mut out).unwrap().unwrap();
    assert_eq!(got, t);
    // A reader hoping for timers on a trailerless payload gets None,
    // not ten doubles of garbage.
    let bare = encode_payload(&tile, None);
    assert!(decode_payload(&bare, &mut out).unwrap().is_none());
}

#[test]
fn test_payload_rejects_wrong_size() {
    let tile = vec![1.0; 4];
    let bytes = encode_payload(&tile, None);
    let mut small = vec![0.0; 3];
    assert!(decode_payload(&bytes, &mut small).is_err());
    assert!(decode_payload(&[], &mut small).is_err());
}

#[test]
fn test_timers_absorb() {
    let mut a = Timers::default();
    a.have_restart = 1.0;
    let mut b = Timers::default();
    b.have_restart = 2.0;
    b.route_file = 0.5;
    a.absorb(&b);
    assert_eq!(a.have_restart, 3.0);
    assert_eq!(a.route_file, 0.5);
}

#[test]
fn test_extract_final_number() {
    assert_eq!(extract_final_number("timestep.40"), Some(40));
    assert_eq!(extract_final_number("timestep.0"), Some(0));
    assert_eq!(extract_final_number("ckpt12step"), None);
    assert_eq!(extract_final_number("no-digits"), None);
}

fn single_rank(body: impl Fn(&mut RankCtx) + Send + Sync + 'static) {
    Fabric::run(
        1,
        FabricConfig::default(),
        Arc::new(move |mut ctx: RankCtx| body(&mut ctx)),
    )
    .unwrap();
}

#[test]
fn test_store_capture_then_restart_newest() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().to_path_buf();
    single_rank(move |ctx| {
        let world = ctx.ep.fabric().initial_world(FaultPolicy::Abort).unwrap();
        let mut store = Store::open(StoreConfig {
            prefix: prefix.clone(),
            interval: 10,
        })
        .unwrap();

        for (iter, fill) in [(10, 1.0), (20, 2.0)] {
            let name = format!("timestep.{}", iter);
            let dset = store.start_output(&name, iter).unwrap();
            assert_eq!(dset.iteration, iter);
            let payload = encode_payload(&vec![fill; 9], None);
            store.write_rank_file("rank_0.ckpt", &payload).unwrap();
            assert!(store.complete_output(&world, &mut ctx.ep, true).unwrap());
        }

        let found = store.have_restart(&world, &mut ctx.ep).unwrap().unwrap();
        assert_eq!(found.name, "timestep.20");
        assert_eq!(found.iteration, 20);
        store.start_restart(&found).unwrap();
        let mut tile = vec![0.0; 9];
        let timers = store
            .read_rank_file(&found, 0, "rank_0.ckpt", &mut tile)
            .unwrap();
        assert!(timers.is_none());
        assert_eq!(tile, vec![2.0; 9]);
        assert!(store.complete_restart(&world, &mut ctx.ep, true).unwrap());
    });
}

#[test]
fn test_store_falls_back_to_older_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().to_path_buf();
    single_rank(move |ctx| {
        let world = ctx.ep.fabric().initial_world(FaultPolicy::Abort).unwrap();
        let mut store = Store::open(StoreConfig {
            prefix: prefix.clone(),
            interval: 10,
        })
        .unwrap();

        for (iter, fill) in [(10, 1.0), (20, 2.0)] {
            let name = format!("timestep.{}", iter);
            store.start_output(&name, iter).unwrap();
            let payload = encode_payload(&vec![fill; 4], None);
            store.write_rank_file("rank_0.ckpt", &payload).unwrap();
            assert!(store.complete_output(&world, &mut ctx.ep, true).unwrap());
        }
        // Corrupt the newest payload on disk; its manifest checksum no
        // longer matches.
        std::fs::write(
            prefix.join("timestep.20").join("rank_0.ckpt"),
            b"clobbered",
        )
        .unwrap();

        let mut tile = vec![0.0; 4];
        let mut restarted = false;
        while let Some(found) = store.have_restart(&world, &mut ctx.ep).unwrap() {
            store.start_restart(&found).unwrap();
            let valid = store
                .read_rank_file(&found, 0, "rank_0.ckpt", &mut tile)
                .is_ok();
            if store
                .complete_restart(&world, &mut ctx.ep, valid)
                .unwrap()
            {
                restarted = true;
                assert_eq!(found.name, "timestep.10");
                assert_eq!(tile, vec![1.0; 4]);
                break;
            }
        }
        assert!(restarted);
    });
}

#[test]
fn test_store_sees_legacy_dataset_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().to_path_buf();
    single_rank(move |ctx| {
        let world = ctx.ep.fabric().initial_world(FaultPolicy::Abort).unwrap();
        let legacy = prefix.join("timestep.7");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(
            legacy.join("rank_0.ckpt"),
            encode_payload(&vec![7.0; 2], None),
        )
        .unwrap();

        let mut store = Store::open(StoreConfig {
            prefix: prefix.clone(),
            interval: 10,
        })
        .unwrap();
        let found = store.have_restart(&world, &mut ctx.ep).unwrap().unwrap();
        assert_eq!(found.iteration, 7);
        let mut tile = vec![0.0; 2];
        store
            .read_rank_file(&found, 0, "rank_0.ckpt", &mut tile)
            .unwrap();
        assert_eq!(tile, vec![7.0; 2]);
    });
}

#[test]
fn test_store_delegated_need_checkpoint_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(StoreConfig {
        prefix: dir.path().to_path_buf(),
        interval: 3,
    })
    .unwrap();
    let fires: Vec<bool> = (0..7).map(|_| store.need_checkpoint()).collect();
    assert_eq!(fires, vec![false, false, true, false, false, true, false]);
}

type BuddyResults = Arc<Mutex<HashMap<i32, Vec<f64>>>>;

#[test]
fn test_buddy_ring_roundtrip_with_last_dead() {
    let results: BuddyResults = Arc::new(Mutex::new(HashMap::new()));
    let out = results.clone();
    Fabric::run(
        3,
        FabricConfig::default(),
        Arc::new(move |mut ctx: RankCtx| {
            let world = ctx
                .ep
                .fabric()
                .initial_world(FaultPolicy::Respawn)
                .unwrap();
            let me = world.my_rank(&ctx.ep).unwrap();
            let mut tile = vec![me.0 as f64; 5];
            let mut buddy = BuddyCkpt::new(5);
            buddy_exchange(&world, &mut ctx.ep, &tile, &mut buddy, 40).unwrap();
            assert_eq!(buddy.iteration, 40);
            let prev = (me.0 + 2) % 3;
            assert_eq!(buddy.tile, vec![prev as f64; 5]);

            // Lose the live tiles, then run the recovery path with rank
            // 1 acting as the last dead rank.
            tile.fill(-1.0);
            buddy_restore(&world, &mut ctx.ep, &mut tile, &buddy, me.0 == 1).unwrap();
            results.lock().unwrap().insert(me.0, tile);
        }),
    )
    .unwrap();
    let got = Arc::try_unwrap(out).unwrap().into_inner().unwrap();
    // Ranks 1 and 2 get their tiles back from their successors; rank 0,
    // whose successor is the last dead rank, keeps what it has.
    assert_eq!(got[&1], vec![1.0; 5]);
    assert_eq!(got[&2], vec![2.0; 5]);
    assert_eq!(got[&0], vec![-1.0; 5]);
}
