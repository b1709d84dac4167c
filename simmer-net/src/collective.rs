use serde::{de::DeserializeOwned, Serialize};
use simmer_base::Error;

use crate::fabric::{Endpoint, WorldKey, WorldStage};
use crate::world::{CommResult, Fault, Rank, World};
use crate::TAG_COLL;

// Collectives are linear through logical rank 0: gather up, fold,
// broadcast down. Ordering per (src, dst, world, tag) makes back-to-back
// collectives on the same world safe without distinct tags. Any dead
// participant surfaces at the root as PeerFailed; everyone else
// unblocks when the fault handler revokes the world.

pub(crate) fn encode<T: Serialize>(v: &T) -> CommResult<Vec<u8>> {
    rmp_serde::to_vec(v).map_err(|e| Fault::Fatal(Error::new(e)))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CommResult<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Fault::Fatal(Error::new(e)))
}

/// Gather everyone's value at rank 0; `Some` there, `None` elsewhere.
pub fn gather<T: Serialize + DeserializeOwned>(
    world: &World,
    ep: &mut Endpoint,
    v: &T,
) -> CommResult<Option<Vec<T>>> {
    let me = world.my_rank(ep)?;
    if me == Rank(0) {
        let mut all = Vec::with_capacity(world.size() as usize);
        all.push(decode(&encode(v)?)?);
        for r in 1..world.size() {
            let bytes = ep.recv(world, Rank(r), TAG_COLL)?;
            all.push(decode(&bytes)?);
        }
        Ok(Some(all))
    } else {
        ep.send(world, Rank(0), TAG_COLL, &encode(v)?)?;
        Ok(None)
    }
}

/// Broadcast rank 0's value to everyone; rank 0 passes `Some`.
pub fn bcast<T: Serialize + DeserializeOwned>(
    world: &World,
    ep: &mut Endpoint,
    v: Option<T>,
) -> CommResult<T> {
    let me = world.my_rank(ep)?;
    if me == Rank(0) {
        let v = v.ok_or_else(|| Fault::Fatal(simmer_base::err("bcast root without a value")))?;
        let bytes = encode(&v)?;
        for r in 1..world.size() {
            ep.send(world, Rank(r), TAG_COLL, &bytes)?;
        }
        Ok(v)
    } else {
        let bytes = ep.recv(world, Rank(0), TAG_COLL)?;
        decode(&bytes)
    }
}

pub fn allreduce<T, F>(world: &World, ep: &mut Endpoint, v: T, f: F) -> CommResult<T>
where
    T: Serialize + DeserializeOwned + Clone,
    F: Fn(T, T) -> T,
{
    let reduced = match gather(world, ep, &v)? {
        Some(all) => {
            let mut it = all.into_iter();
            let first = it
                .next()
                .ok_or_else(|| Fault::Fatal(simmer_base::err("empty gather")))?;
            Some(it.fold(first, |a, b| f(a, b)))
        }
        None => None,
    };
    bcast(world, ep, reduced)
}

pub fn allreduce_sum_f64(world: &World, ep: &mut Endpoint, v: f64) -> CommResult<f64> {
    allreduce(world, ep, v, |a, b| a + b)
}

pub fn allreduce_min_i32(world: &World, ep: &mut Endpoint, v: i32) -> CommResult<i32> {
    allreduce(world, ep, v, |a, b| a.min(b))
}

pub fn allreduce_and(world: &World, ep: &mut Endpoint, v: bool) -> CommResult<bool> {
    allreduce(world, ep, v, |a, b| a && b)
}

pub fn allgather<T>(world: &World, ep: &mut Endpoint, v: &T) -> CommResult<Vec<T>>
where
    T: Serialize + DeserializeOwned + Clone,
{
    let gathered = gather(world, ep, v)?;
    bcast(world, ep, gathered)
}

pub fn barrier(world: &World, ep: &mut Endpoint) -> CommResult<()> {
    allreduce_and(world, ep, true).map(|_| ())
}

/// Fault-absorbing AND across the world, in the spirit of an agreement
/// collective: a participant that dies mid-protocol forces the result
/// to false instead of wedging the round, so a repair loop can observe
/// "this attempt failed somewhere" and redo. Only the death of rank 0
/// itself still surfaces as a fault.
pub fn agree(world: &World, ep: &mut Endpoint, flag: bool) -> CommResult<bool> {
    let me = world.my_rank(ep)?;
    if me == Rank(0) {
        let mut acc = flag;
        for r in 1..world.size() {
            match ep.recv(world, Rank(r), TAG_COLL) {
                Ok(bytes) => {
                    let b: bool = decode(&bytes)?;
                    acc = acc && b;
                }
                Err(Fault::PeerFailed(_)) | Err(Fault::Revoked) => acc = false,
                Err(e) => return Err(e),
            }
        }
        let bytes = encode(&acc)?;
        for r in 1..world.size() {
            match ep.send(world, Rank(r), TAG_COLL, &bytes) {
                Ok(()) | Err(Fault::PeerFailed(_)) | Err(Fault::Revoked) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(acc)
    } else {
        ep.send(world, Rank(0), TAG_COLL, &encode(&flag)?)?;
        let bytes = ep.recv(world, Rank(0), TAG_COLL)?;
        decode(&bytes)
    }
}

/// Split a world into disjoint sub-worlds by color, ordering each by
/// key (ties by current rank). Sub-worlds inherit the parent's
/// revocation: revoking the parent unblocks operations on every world
/// split from it.
pub fn comm_split(
    world: &World,
    ep: &mut Endpoint,
    color: i32,
    key: i32,
    salt: u64,
) -> CommResult<World> {
    let me = world.my_rank(ep)?;
    let mine = (color, key, me.0);
    let entries: Vec<(i32, i32, i32)> = allgather(world, ep, &mine)?;
    let mut group: Vec<(i32, i32, usize)> = Vec::new();
    for (c, k, r) in entries {
        if c == color {
            group.push((k, r, world.slot_of(Rank(r))?));
        }
    }
    group.sort();
    let members: Vec<usize> = group.into_iter().map(|(_, _, s)| s).collect();
    let wkey = WorldKey {
        parent: world.epoch(),
        stage: WorldStage::Split,
        salt: salt.wrapping_mul(0x10001).wrapping_add(color as u64),
        members,
    };
    let split = ep
        .fabric()
        .intern(wkey, Some(world), world.policy())?;
    Ok(split)
}
