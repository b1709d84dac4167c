use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use simmer_base::{err, RankSet256};

use crate::collective::{agree, allgather, decode, encode};
use crate::fabric::{Endpoint, Fabric, WorldKey, WorldStage};
use crate::world::{CommResult, Fault, FaultPolicy, Rank, World};
use crate::TAG_REPAIR;

// World repair. Survivors of a failed world walk through
//
//   ACTIVE -> REVOKED -> SHRINKING -> SPAWNING -> MERGING
//          -> SPLIT_REORDERING -> RESTORED
//
// and come out holding a world of the original size and rank order, in
// which every dead rank has been replaced by a freshly spawned process
// running the same program image.
//
// The lowest-ranked survivor leads each attempt: it snapshots the
// survivor set, spawns the replacements, and tells everyone else the
// shape of the attempt. Followers take the leader's word for the
// membership (a shrink must produce the same survivor list everywhere,
// and the survivors cannot vote on a list they do not agree about yet);
// if the leader dies they promote the next survivor and go again. A new
// failure mid-attempt revokes the half-built stage worlds, which
// bounces every participant back to the top of the loop. Attempts are
// capped and backed off so cascading failures fail the run instead of
// thrashing it forever.

#[derive(Clone, Copy, Debug)]
pub struct RepairCfg {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RepairCfg {
    fn default() -> Self {
        RepairCfg {
            max_attempts: 8,
            backoff: Duration::from_millis(25),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum RepairMsg {
    /// Leader -> surviving peers: the shape of this repair attempt.
    Proposal {
        parent_epoch: u64,
        attempt: u32,
        survivors: Vec<usize>,
        spawnees: Vec<usize>,
    },
    /// Leader -> one replacement: which original rank it takes over.
    Adoption {
        crank: i32,
        last_dead: bool,
        parent_epoch: u64,
        attempt: u32,
        survivors: Vec<usize>,
        spawnees: Vec<usize>,
        policy: FaultPolicy,
    },
}

/// What a replacement rank learns when a repair round adopts it.
pub struct Adopted {
    pub world: World,
    /// The original rank this replacement takes over.
    pub rank: Rank,
    /// True for the last dead rank of the failure: the one whose buddy
    /// data is gone and who therefore hands back an empty payload
    /// during a buddy restore.
    pub last_dead: bool,
}

/// Survivor entry point: turn a revoked world into a restored one of
/// the original size and rank order. Safe to call on a healthy world;
/// with nobody dead it returns the world unchanged.
pub fn replace_world(ep: &mut Endpoint, old: &World, cfg: &RepairCfg) -> CommResult<World> {
    let fab = ep.fabric().clone();
    let my_crank = old.my_rank(ep)?;
    let mut last_attempt = 0u32;
    let mut last_leader = usize::MAX;
    for tries in 1..=cfg.max_attempts {
        if tries > 1 {
            std::thread::sleep(cfg.backoff * tries);
        }
        let alive: Vec<usize> = old
            .members()
            .iter()
            .copied()
            .filter(|s| fab.slot_alive(*s))
            .collect();
        // Nobody dead means nothing to repair: an already-repaired (or
        // never-broken) world passes through unchanged, making repair
        // idempotent.
        if alive.len() == old.members().len() {
            return Ok(old.clone());
        }
        let leader = match alive.first() {
            Some(l) => *l,
            None => return Err(Fault::Fatal(err("no survivors to repair from"))),
        };
        if leader != last_leader {
            // Attempt numbers are per-leader; a promoted leader starts
            // its own sequence.
            last_leader = leader;
            last_attempt = 0;
        }

        let (attempt, survivors, spawnees) = if leader == ep.slot() {
            last_attempt += 1;
            lead_attempt(ep, &fab, old, last_attempt, &alive)?
        } else {
            match await_proposal(ep, &fab, leader, old.epoch(), last_attempt) {
                Ok((attempt, survivors, spawnees)) => {
                    last_attempt = attempt;
                    (attempt, survivors, spawnees)
                }
                // Leader died; next iteration promotes a new one.
                Err(Fault::PeerFailed(_)) => continue,
                Err(e) => return Err(e),
            }
        };

        let shape = AttemptShape {
            parent: old.epoch(),
            policy: old.policy(),
            attempt,
            survivors,
            spawnees,
        };
        match rebuild(ep, &fab, &shape, my_crank, true) {
            Ok(world) => {
                info!("done with the recovery (rank {})", my_crank);
                return Ok(world);
            }
            Err(Fault::PeerFailed(_)) | Err(Fault::Revoked) => {
                warn!("repair attempt {} failed, redo", attempt);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Fault::Fatal(err("world repair did not converge")))
}

/// Replacement entry point: wait to be adopted by a repair round, then
/// run the merge/reorder tail of the protocol. A replacement whose
/// round fails waits for the next round; one that is never adopted
/// gives up after the fabric's adoption window.
pub fn join_as_spawnee(ep: &mut Endpoint) -> CommResult<Adopted> {
    let fab = ep.fabric().clone();
    loop {
        let (_, bytes) = ep.recv_raw_any(TAG_REPAIR, fab.adopt_wait())?;
        let RepairMsg::Adoption {
            crank,
            last_dead,
            parent_epoch,
            attempt,
            survivors,
            spawnees,
            policy,
        } = decode(&bytes)?
        else {
            warn!("spawnee ignoring non-adoption repair message");
            continue;
        };
        let shape = AttemptShape {
            parent: parent_epoch,
            policy,
            attempt,
            survivors,
            spawnees,
        };
        match rebuild(ep, &fab, &shape, Rank(crank), false) {
            Ok(world) => {
                info!("spawnee adopted as rank {}", crank);
                return Ok(Adopted {
                    world,
                    rank: Rank(crank),
                    last_dead,
                });
            }
            Err(Fault::PeerFailed(_)) | Err(Fault::Revoked) => continue,
            Err(e) => return Err(e),
        }
    }
}

struct AttemptShape {
    parent: u64,
    policy: FaultPolicy,
    attempt: u32,
    survivors: Vec<usize>,
    spawnees: Vec<usize>,
}

/// Leader side of SHRINKING and SPAWNING: snapshot survivors, spawn one
/// replacement per dead rank, and tell everyone the shape of the
/// attempt.
fn lead_attempt(
    ep: &mut Endpoint,
    fab: &Fabric,
    old: &World,
    attempt: u32,
    alive: &[usize],
) -> CommResult<(u32, Vec<usize>, Vec<usize>)> {
    let nd = old.members().len() - alive.len();

    // Vacant original ranks: world \ survivors, in rank order.
    let all = RankSet256::from_ranks(0..old.size() as u8);
    let mut alive_set = RankSet256::new();
    for (r, slot) in old.members().iter().enumerate() {
        if alive.contains(slot) {
            alive_set.set(r as u8, true);
        }
    }
    let dead_ranks = all.difference(&alive_set).ranks();

    let spawnees = fab.spawn_ranks(nd)?;

    let proposal = encode(&RepairMsg::Proposal {
        parent_epoch: old.epoch(),
        attempt,
        survivors: alive.to_vec(),
        spawnees: spawnees.clone(),
    })?;
    for slot in alive.iter().skip(1) {
        match ep.send_raw(*slot, TAG_REPAIR, &proposal) {
            Ok(()) | Err(Fault::PeerFailed(_)) => {}
            Err(e) => return Err(e),
        }
    }

    for (i, crank) in dead_ranks.iter().enumerate() {
        let adoption = encode(&RepairMsg::Adoption {
            crank: *crank as i32,
            last_dead: i + 1 == nd,
            parent_epoch: old.epoch(),
            attempt,
            survivors: alive.to_vec(),
            spawnees: spawnees.clone(),
            policy: old.policy(),
        })?;
        match ep.send_raw(spawnees[i], TAG_REPAIR, &adoption) {
            Ok(()) | Err(Fault::PeerFailed(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok((attempt, alive.to_vec(), spawnees))
}

/// Follower side of SHRINKING: wait for the current leader to describe
/// the attempt. Stale proposals (attempts already tried, or some other
/// repair episode) are dropped.
fn await_proposal(
    ep: &mut Endpoint,
    fab: &Fabric,
    leader: usize,
    parent_epoch: u64,
    last_attempt: u32,
) -> CommResult<(u32, Vec<usize>, Vec<usize>)> {
    loop {
        let bytes = ep.recv_raw_from(leader, TAG_REPAIR, fab.adopt_wait())?;
        match decode(&bytes)? {
            RepairMsg::Proposal {
                parent_epoch: pe,
                attempt,
                survivors,
                spawnees,
            } if pe == parent_epoch && attempt > last_attempt => {
                return Ok((attempt, survivors, spawnees))
            }
            other => {
                warn!("ignoring stale repair message: {:?}", other);
            }
        }
    }
}

/// The agreement step every stage world goes through; a failed vote or
/// a mid-vote fault revokes the stage so no participant stays blocked
/// in it.
fn agree_or_revoke(world: &World, ep: &mut Endpoint, flag: bool) -> CommResult<()> {
    match agree(world, ep, flag) {
        Ok(true) => Ok(()),
        Ok(false) => {
            world.revoke();
            Err(Fault::Revoked)
        }
        Err(e) => {
            world.revoke();
            Err(e)
        }
    }
}

/// MERGING and SPLIT_REORDERING, shared by survivors and spawnees.
/// Survivors additionally run the survivor-world vote first (the
/// spawn-success agreement of the original protocol).
fn rebuild(
    ep: &mut Endpoint,
    fab: &Fabric,
    shape: &AttemptShape,
    my_crank: Rank,
    survivor: bool,
) -> CommResult<World> {
    if survivor {
        let scomm = fab.intern(
            WorldKey {
                parent: shape.parent,
                stage: WorldStage::Shrink,
                salt: shape.attempt as u64,
                members: shape.survivors.clone(),
            },
            None,
            shape.policy,
        )?;
        agree_or_revoke(&scomm, ep, !shape.spawnees.is_empty())?;
    }

    // MERGING: survivors and spawnees in one world, spawnees appended.
    let mut merged = shape.survivors.clone();
    merged.extend_from_slice(&shape.spawnees);
    let mcomm = fab.intern(
        WorldKey {
            parent: shape.parent,
            stage: WorldStage::Merge,
            salt: shape.attempt as u64,
            members: merged,
        },
        None,
        shape.policy,
    )?;
    agree_or_revoke(&mcomm, ep, true)?;

    // SPLIT_REORDERING: key the merged world by original rank, so every
    // survivor keeps its old position and every replacement lands on
    // the rank it was adopted for.
    let cranks: Vec<i32> = match allgather(&mcomm, ep, &my_crank.0) {
        Ok(v) => v,
        Err(e) => {
            mcomm.revoke();
            return Err(e);
        }
    };
    let mut pairs: Vec<(i32, usize)> = Vec::with_capacity(cranks.len());
    for (i, c) in cranks.iter().enumerate() {
        pairs.push((*c, mcomm.members()[i]));
    }
    pairs.sort();
    let restored = fab.intern(
        WorldKey {
            parent: shape.parent,
            stage: WorldStage::Reorder,
            salt: shape.attempt as u64,
            members: pairs.into_iter().map(|(_, s)| s).collect(),
        },
        None,
        // RESTORED worlds carry their predecessor's fault handling.
        shape.policy,
    )?;
    agree_or_revoke(&restored, ep, true)?;
    Ok(restored)
}
