// The message-passing fabric the solver runs on.
//
// A run consists of N single-threaded ranks exchanging tagged messages.
// Ranks address each other through a World: an epoch-numbered membership
// list mapping logical ranks onto fabric slots. Worlds are cheap values;
// the same logical membership interned twice yields the same shared
// world object, which is what lets every member observe one revocation
// flag.
//
// Failure model: a rank can die at any point (a real crash surfaces as
// a panicked or exited thread, an injected one via
// `Endpoint::simulate_failure`). Every fabric operation returns a
// tagged result rather than unwinding: `Fault::PeerFailed` when a
// participant is dead, `Fault::Revoked` once anyone has revoked the
// world, `Fault::Fatal` for everything else. Revocation is the
// unblocking guarantee: after it, every pending and future operation on
// that world (and on sub-worlds split from it) fails promptly, which is
// what makes the repair protocol in `repair` deadlock-free.

mod collective;
mod fabric;
mod repair;
mod world;

pub use collective::{
    agree, allgather, allreduce_and, allreduce_min_i32, allreduce_sum_f64, barrier, bcast,
    comm_split, gather,
};
pub use fabric::{Endpoint, Fabric, FabricConfig, Program, RankCtx};
pub use repair::{join_as_spawnee, replace_world, Adopted, RepairCfg};
pub use world::{CommResult, Fault, FaultPolicy, Rank, World};

/// Halo-exchange traffic.
pub const TAG_HALO: u16 = 0;
/// Repair-protocol control traffic, notably spare-rank assignment.
pub const TAG_REPAIR: u16 = 1;
/// Circular buddy-checkpoint payloads.
pub const TAG_BUDDY: u16 = 111;
/// Internal collective traffic; must stay clear of the user tags above.
pub(crate) const TAG_COLL: u16 = 1024;

#[cfg(test)]
mod test;
