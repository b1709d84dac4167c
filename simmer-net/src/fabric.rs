use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info};

use simmer_base::{err, Error, Result};

use crate::world::{CommResult, Fault, FaultPolicy, Rank, World, WorldShared};

/// Messages sent outside any world (repair-protocol control traffic to
/// ranks that do not share a world yet) carry this epoch.
pub(crate) const RAW_EPOCH: u64 = 0;

#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) src_slot: usize,
    pub(crate) tag: u16,
    pub(crate) epoch: u64,
    pub(crate) payload: Box<[u8]>,
}

#[derive(Clone, Copy, Debug)]
pub struct FabricConfig {
    /// Granularity at which blocked receives re-check revocation and
    /// peer liveness.
    pub poll: Duration,
    /// How long a freshly spawned rank waits to be adopted by a repair
    /// round before giving up and exiting.
    pub adopt_wait: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            poll: Duration::from_micros(200),
            adopt_wait: Duration::from_secs(5),
        }
    }
}

/// The program image every rank runs, original and respawned alike.
pub type Program = Arc<dyn Fn(RankCtx) + Send + Sync + 'static>;

/// What a rank thread is handed at startup.
pub struct RankCtx {
    pub ep: Endpoint,
    /// True for a replacement spawned during repair: such a rank has a
    /// "parent" and must join the repair protocol instead of reading
    /// the initial world.
    pub spawnee: bool,
    /// Size of the initial world.
    pub nranks: usize,
}

struct Slot {
    alive: bool,
    tx: Sender<Envelope>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum WorldStage {
    Init,
    Split,
    Shrink,
    Merge,
    Reorder,
}

/// Identity of a world across rank threads: every participant that
/// interns the same key gets the same shared world object (and hence
/// the same revocation flag). The epoch number is assigned on first
/// intern, under the table lock, so it is consistent too.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct WorldKey {
    pub(crate) parent: u64,
    pub(crate) stage: WorldStage,
    pub(crate) salt: u64,
    pub(crate) members: Vec<usize>,
}

struct WorldTable {
    next_epoch: u64,
    by_key: HashMap<WorldKey, World>,
    by_epoch: HashMap<u64, World>,
}

struct FabricInner {
    cfg: FabricConfig,
    program: Program,
    init_n: usize,
    slots: Mutex<Vec<Slot>>,
    worlds: Mutex<WorldTable>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// The process-wide supervisor: owns the rank slots, routes envelopes,
/// interns worlds and spawns replacement ranks. Ranks themselves only
/// ever touch it through their `Endpoint`.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

fn locked<'a, T>(m: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
    m.lock().map_err(|_| err("fabric lock poisoned"))
}

impl Fabric {
    pub fn new(n: usize, cfg: FabricConfig, program: Program) -> Result<Fabric> {
        if n == 0 || n > 256 {
            return Err(err("fabric supports 1..=256 ranks"));
        }
        Ok(Fabric {
            inner: Arc::new(FabricInner {
                cfg,
                program,
                init_n: n,
                slots: Mutex::new(Vec::new()),
                worlds: Mutex::new(WorldTable {
                    next_epoch: RAW_EPOCH + 1,
                    by_key: HashMap::new(),
                    by_epoch: HashMap::new(),
                }),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the initial rank threads.
    pub fn launch(&self) -> Result<()> {
        for _ in 0..self.inner.init_n {
            self.start_rank(false)?;
        }
        Ok(())
    }

    /// Convenience: build, launch and join a whole run.
    pub fn run(n: usize, cfg: FabricConfig, program: Program) -> Result<()> {
        let fab = Fabric::new(n, cfg, program)?;
        fab.launch()?;
        fab.join()
    }

    /// Wait for every rank thread, including replacements spawned
    /// mid-run, to finish.
    pub fn join(&self) -> Result<()> {
        loop {
            let handle = locked(&self.inner.threads)?.pop();
            match handle {
                Some(h) => {
                    if h.join().is_err() {
                        error!("rank thread terminated by panic");
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// The world every original rank starts in: ranks 0..n in slot
    /// order.
    pub fn initial_world(&self, policy: FaultPolicy) -> Result<World> {
        let key = WorldKey {
            parent: RAW_EPOCH,
            stage: WorldStage::Init,
            salt: 0,
            members: (0..self.inner.init_n).collect(),
        };
        self.intern(key, None, policy)
    }

    /// Resolve a world key to the one shared world object every
    /// participant sees. First intern allocates the epoch.
    pub(crate) fn intern(
        &self,
        key: WorldKey,
        inherit: Option<&World>,
        policy: FaultPolicy,
    ) -> Result<World> {
        let mut table = locked(&self.inner.worlds)?;
        if let Some(w) = table.by_key.get(&key) {
            return Ok(w.clone());
        }
        let epoch = table.next_epoch;
        table.next_epoch += 1;
        let mut revoke_flags = vec![Arc::new(AtomicBool::new(false))];
        if let Some(parent) = inherit {
            revoke_flags.extend(parent.shared.revoke_flags.iter().cloned());
        }
        let world = World {
            shared: Arc::new(WorldShared {
                epoch,
                members: key.members.clone(),
                revoke_flags,
                policy,
            }),
        };
        table.by_key.insert(key, world.clone());
        table.by_epoch.insert(epoch, world.clone());
        Ok(world)
    }

    pub(crate) fn epoch_revoked(&self, epoch: u64) -> bool {
        if epoch == RAW_EPOCH {
            return false;
        }
        match self.inner.worlds.lock() {
            Ok(table) => table
                .by_epoch
                .get(&epoch)
                .map(|w| w.is_revoked())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Spawn `n` replacement ranks running the same program image.
    /// They show up as fresh slots; the repair protocol decides which
    /// logical ranks they take over.
    pub(crate) fn spawn_ranks(&self, n: usize) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.start_rank(true)?);
        }
        info!("spawned {} replacement ranks: {:?}", n, out);
        Ok(out)
    }

    fn start_rank(&self, spawnee: bool) -> Result<usize> {
        let (tx, rx) = unbounded();
        let slot = {
            let mut slots = locked(&self.inner.slots)?;
            slots.push(Slot { alive: true, tx });
            slots.len() - 1
        };
        let fab = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rank-slot-{}", slot))
            .spawn(move || {
                let ep = Endpoint {
                    fabric: fab.clone(),
                    slot,
                    rx,
                    pending: VecDeque::new(),
                };
                let ctx = RankCtx {
                    ep,
                    spawnee,
                    nranks: fab.inner.init_n,
                };
                let program = fab.inner.program.clone();
                let outcome = catch_unwind(AssertUnwindSafe(move || program(ctx)));
                // An exited rank is indistinguishable from a dead one to
                // anybody still trying to talk to it.
                fab.mark_dead(slot);
                if outcome.is_err() {
                    error!("rank slot {} panicked", slot);
                }
            })
            .map_err(Error::new)?;
        locked(&self.inner.threads)?.push(handle);
        Ok(slot)
    }

    pub(crate) fn slot_alive(&self, slot: usize) -> bool {
        match self.inner.slots.lock() {
            Ok(slots) => slots.get(slot).map(|s| s.alive).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub(crate) fn mark_dead(&self, slot: usize) {
        if let Ok(mut slots) = self.inner.slots.lock() {
            if let Some(s) = slots.get_mut(slot) {
                s.alive = false;
            }
        }
    }

    /// Deliver an envelope; Ok(false) means the destination is dead.
    pub(crate) fn deliver(&self, slot: usize, env: Envelope) -> Result<bool> {
        let slots = locked(&self.inner.slots)?;
        match slots.get(slot) {
            Some(s) if s.alive => Ok(s.tx.send(env).is_ok()),
            _ => Ok(false),
        }
    }

    pub(crate) fn poll(&self) -> Duration {
        self.inner.cfg.poll
    }
    pub(crate) fn adopt_wait(&self) -> Duration {
        self.inner.cfg.adopt_wait
    }
}

/// A rank's handle onto the fabric: its mailbox plus a tag-matching
/// pending queue. Single-threaded by construction; receives are where a
/// rank blocks, and they re-check revocation and peer liveness at every
/// poll tick so no failure can leave a receive stuck.
pub struct Endpoint {
    fabric: Fabric,
    slot: usize,
    rx: Receiver<Envelope>,
    pending: VecDeque<Envelope>,
}

impl Endpoint {
    pub fn slot(&self) -> usize {
        self.slot
    }
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Fault-injection hook: this rank drops dead, as if the process
    /// were killed. Peers observe the failure on their next operation
    /// involving it.
    pub fn simulate_failure(&self) {
        self.fabric.mark_dead(self.slot);
    }

    pub fn send(&self, world: &World, dst: Rank, tag: u16, payload: &[u8]) -> CommResult<()> {
        if world.is_revoked() {
            return Err(Fault::Revoked);
        }
        let dst_slot = world.slot_of(dst)?;
        let env = Envelope {
            src_slot: self.slot,
            tag,
            epoch: world.epoch(),
            payload: payload.into(),
        };
        if self.fabric.deliver(dst_slot, env)? {
            Ok(())
        } else {
            Err(Fault::PeerFailed(dst))
        }
    }

    pub fn recv(&mut self, world: &World, src: Rank, tag: u16) -> CommResult<Vec<u8>> {
        let src_slot = world.slot_of(src)?;
        let epoch = world.epoch();
        let matches =
            move |e: &Envelope| e.epoch == epoch && e.tag == tag && e.src_slot == src_slot;
        loop {
            if world.is_revoked() {
                return Err(Fault::Revoked);
            }
            self.absorb();
            if let Some(p) = self.take_pending(&matches) {
                return Ok(p);
            }
            if !self.fabric.slot_alive(src_slot) {
                // A peer's sends all precede its death, so one more
                // drain decides whether anything deliverable remains.
                self.absorb();
                if let Some(p) = self.take_pending(&matches) {
                    return Ok(p);
                }
                return Err(Fault::PeerFailed(src));
            }
            self.wait_tick()?;
        }
    }

    /// World-less send, addressed straight at a fabric slot. Only the
    /// repair protocol uses this, to reach ranks it does not share a
    /// world with yet.
    pub(crate) fn send_raw(&self, dst_slot: usize, tag: u16, payload: &[u8]) -> CommResult<()> {
        let env = Envelope {
            src_slot: self.slot,
            tag,
            epoch: RAW_EPOCH,
            payload: payload.into(),
        };
        if self.fabric.deliver(dst_slot, env)? {
            Ok(())
        } else {
            Err(Fault::PeerFailed(Rank(dst_slot as i32)))
        }
    }

    /// Receive a world-less message from a specific slot, with liveness
    /// checks against that slot.
    pub(crate) fn recv_raw_from(
        &mut self,
        src_slot: usize,
        tag: u16,
        wait: Duration,
    ) -> CommResult<Vec<u8>> {
        let deadline = Instant::now() + wait;
        let matches =
            move |e: &Envelope| e.epoch == RAW_EPOCH && e.tag == tag && e.src_slot == src_slot;
        loop {
            self.absorb();
            if let Some(p) = self.take_pending(&matches) {
                return Ok(p);
            }
            if !self.fabric.slot_alive(src_slot) {
                self.absorb();
                if let Some(p) = self.take_pending(&matches) {
                    return Ok(p);
                }
                return Err(Fault::PeerFailed(Rank(src_slot as i32)));
            }
            if Instant::now() >= deadline {
                return Err(Fault::Fatal(err("timed out waiting for control message")));
            }
            self.wait_tick()?;
        }
    }

    /// Receive a world-less message from anyone.
    pub(crate) fn recv_raw_any(&mut self, tag: u16, wait: Duration) -> CommResult<(usize, Vec<u8>)> {
        let deadline = Instant::now() + wait;
        loop {
            self.absorb();
            let mut src = None;
            if let Some(i) = self
                .pending
                .iter()
                .position(|e| e.epoch == RAW_EPOCH && e.tag == tag)
            {
                if let Some(env) = self.pending.remove(i) {
                    src = Some((env.src_slot, env.payload.into_vec()));
                }
            }
            if let Some(got) = src {
                return Ok(got);
            }
            if Instant::now() >= deadline {
                return Err(Fault::Fatal(err("timed out waiting for control message")));
            }
            self.wait_tick()?;
        }
    }

    /// Drain the mailbox without blocking, then drop anything addressed
    /// to a world that has since been revoked.
    fn absorb(&mut self) {
        while let Ok(env) = self.rx.try_recv() {
            self.pending.push_back(env);
        }
        let fab = &self.fabric;
        self.pending.retain(|e| !fab.epoch_revoked(e.epoch));
    }

    fn take_pending(&mut self, matches: impl Fn(&Envelope) -> bool) -> Option<Vec<u8>> {
        let i = self.pending.iter().position(matches)?;
        self.pending.remove(i).map(|e| e.payload.into_vec())
    }

    fn wait_tick(&mut self) -> CommResult<()> {
        match self.rx.recv_timeout(self.fabric.poll()) {
            Ok(env) => {
                self.pending.push_back(env);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Fault::Fatal(err("rank mailbox disconnected")))
            }
        }
    }
}
