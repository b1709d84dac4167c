use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use simmer_base::{err, Error};

use crate::fabric::Endpoint;

/// A logical rank within some world. The same physical rank thread can
/// carry different logical ranks in different worlds (its position in
/// the shrunken survivor world differs from its original rank), so a
/// Rank is only meaningful next to the world it was resolved against.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Rank(pub i32);

impl Rank {
    pub fn ring_next(self, n: i32) -> Rank {
        Rank((self.0 + 1) % n)
    }
    pub fn ring_prev(self, n: i32) -> Rank {
        Rank((self.0 - 1 + n) % n)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The non-success outcomes of a fabric operation. The first two are
/// recoverable by world repair; `Fatal` is not.
#[derive(Debug)]
pub enum Fault {
    /// A peer involved in the operation is dead.
    PeerFailed(Rank),
    /// The world the operation was posted on has been revoked.
    Revoked,
    /// Anything else; the program should abort.
    Fatal(Error),
}

pub type CommResult<T> = std::result::Result<T, Fault>;

impl From<Error> for Fault {
    fn from(e: Error) -> Fault {
        Fault::Fatal(e)
    }
}

impl Fault {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Fault::PeerFailed(_) | Fault::Revoked)
    }
    pub fn into_fatal(self) -> Error {
        match self {
            Fault::Fatal(e) => e,
            Fault::PeerFailed(r) => err(format!("unrecovered peer failure at rank {}", r)),
            Fault::Revoked => err("unrecovered world revocation"),
        }
    }
}

/// How faults on a world should be treated by whoever drives it.
/// Attached to the world so a repaired world can inherit the handler
/// of its predecessor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultPolicy {
    /// Any fault aborts the run.
    Abort,
    /// Recoverable faults revoke the world and trigger repair.
    Respawn,
}

pub(crate) struct WorldShared {
    pub(crate) epoch: u64,
    /// Logical rank -> fabric slot, in rank order.
    pub(crate) members: Vec<usize>,
    /// Own revocation flag first, then the flags of every ancestor
    /// world this one was split from. A revoked ancestor revokes us.
    pub(crate) revoke_flags: Vec<Arc<AtomicBool>>,
    pub(crate) policy: FaultPolicy,
}

/// A communicator epoch: the set of ranks currently cooperating. Clone
/// is cheap; all clones across all rank threads share one revocation
/// state.
#[derive(Clone)]
pub struct World {
    pub(crate) shared: Arc<WorldShared>,
}

impl World {
    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }
    pub fn size(&self) -> i32 {
        self.shared.members.len() as i32
    }
    pub fn members(&self) -> &[usize] {
        &self.shared.members
    }
    pub fn policy(&self) -> FaultPolicy {
        self.shared.policy
    }

    /// Flag the world as unusable. Every member's pending and future
    /// operations on it will return `Fault::Revoked` promptly.
    pub fn revoke(&self) {
        self.shared.revoke_flags[0].store(true, Ordering::SeqCst);
    }
    pub fn is_revoked(&self) -> bool {
        self.shared
            .revoke_flags
            .iter()
            .any(|f| f.load(Ordering::SeqCst))
    }

    pub fn slot_of(&self, r: Rank) -> CommResult<usize> {
        self.shared
            .members
            .get(r.0 as usize)
            .copied()
            .ok_or_else(|| Fault::Fatal(err(format!("rank {} outside world", r))))
    }
    pub fn rank_of_slot(&self, slot: usize) -> Option<Rank> {
        self.shared
            .members
            .iter()
            .position(|s| *s == slot)
            .map(|i| Rank(i as i32))
    }
    pub fn my_rank(&self, ep: &Endpoint) -> CommResult<Rank> {
        self.rank_of_slot(ep.slot())
            .ok_or_else(|| Fault::Fatal(err("not a member of this world")))
    }
}

impl PartialEq for World {
    fn eq(&self, other: &Self) -> bool {
        self.shared.epoch == other.shared.epoch
    }
}
impl Eq for World {}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("epoch", &self.shared.epoch)
            .field("members", &self.shared.members)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
