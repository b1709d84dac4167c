use std::mem;
use std::time::Instant;

use ordered_float::OrderedFloat;
use tracing::{info, warn};

use simmer_base::{err, Error, Result};
use simmer_ckpt::{
    buddy_exchange, buddy_restore, encode_payload, BuddyCkpt, Store, StoreConfig, Timers,
};
use simmer_grid::{copy_ghosts, sor1, ProcGrid, TileGeom};
use simmer_net::{
    allreduce_min_i32, allreduce_sum_f64, comm_split, gather, join_as_spawnee, replace_world,
    CommResult, Endpoint, Fault, FaultPolicy, Rank, RankCtx, RepairCfg, World,
};

use crate::cloud::Cloud;
use crate::halo;

/// Test hook: a rank that exits ungracefully at a given iteration, as
/// if its process had been killed.
#[derive(Clone, Copy, Debug)]
pub struct KillPlan {
    pub rank: i32,
    pub at_iteration: i32,
}

/// Which checkpoint subsystem the driver runs on.
#[derive(Clone, Debug)]
pub enum Backend {
    /// In-memory circular buddy checkpoints every `step` iterations.
    Buddy { step: i32 },
    /// The external store; the capture cadence is the store's
    /// configured interval.
    Store(StoreConfig),
}

#[derive(Clone, Debug)]
pub struct SolveOpts {
    pub grid: ProcGrid,
    pub nb: usize,
    pub mb: usize,
    pub epsilon: f64,
    pub max_iter: i32,
    pub debug: bool,
    /// Delegate the "should I checkpoint now?" decision to the store
    /// instead of the modulo-K heuristic.
    pub use_store_need_checkpoint: bool,
    pub backend: Backend,
    pub kill: Option<KillPlan>,
    /// When set, rank 0 terminates the named cloud nodes at a third and
    /// two thirds of the run, idempotently, through this side channel.
    pub cloud: Option<Cloud>,
    pub repair: RepairCfg,
}

impl SolveOpts {
    pub fn new(grid: ProcGrid, nb: usize, mb: usize) -> SolveOpts {
        SolveOpts {
            grid,
            nb,
            mb,
            epsilon: 0.0,
            max_iter: 67,
            debug: false,
            use_store_need_checkpoint: false,
            backend: Backend::Buddy { step: 10 },
            kill: None,
            cloud: None,
            repair: RepairCfg::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Outcome {
    pub rank: Rank,
    pub iterations: i32,
    pub first_norm: f64,
    pub last_norm: f64,
    /// The iteration the run rolled back to after its first recovery,
    /// if it recovered at all.
    pub recovered_at: Option<i32>,
    /// The dataset iteration a store-backed run restarted from.
    pub restarted_from: Option<i32>,
    /// Final tile state.
    pub tile: Vec<f64>,
}

/// Long-lived per-rank driver state: everything that must survive the
/// unwind from a communication fault back to the restart point.
struct DriverCtx {
    ep: Endpoint,
    // Two world slots; repair swaps the active one and the retired slot
    // is only released once nothing references it anymore.
    worlds: [Option<World>; 2],
    worldi: usize,
    rank: Rank,
    iteration: i32,
    ckpt_iteration: i32,
    last_dead: bool,
    recovering: bool,
    recovered_at: Option<i32>,
    restarted_from: Option<i32>,
    max_iter: i32,
    repair: RepairCfg,
    timers: Timers,
}

impl DriverCtx {
    fn world(&self) -> Result<World> {
        self.worlds[self.worldi]
            .clone()
            .ok_or_else(|| err("driver has no active world"))
    }

    /// The single recovery point for communication faults: revoke the
    /// failing world, run the repair protocol, swap the world slots and
    /// roll the iteration counter back to the last checkpoint everyone
    /// holds. Loops if new faults land during the reload.
    fn recover(&mut self, fault: Fault) -> Result<()> {
        let mut fault = fault;
        loop {
            let world = self.world()?;
            if !fault.is_recoverable() || world.policy() == FaultPolicy::Abort {
                return Err(fault.into_fatal().at_rank(self.rank.0));
            }
            world.revoke();
            let restored = replace_world(&mut self.ep, &world, &self.repair)
                .map_err(|f| f.into_fatal().at_rank(self.rank.0))?;
            self.worldi = (self.worldi + 1) % 2;
            self.worlds[self.worldi] = Some(restored);
            self.worlds[(self.worldi + 1) % 2] = None;
            match self.reload() {
                Ok(()) => {
                    self.recovering = true;
                    return Ok(());
                }
                Err(f) if f.is_recoverable() => fault = f,
                Err(f) => return Err(f.into_fatal().at_rank(self.rank.0)),
            }
        }
    }

    /// Fall back to the last checkpoint every rank holds. The min is
    /// essential: some ranks may have committed one more checkpoint
    /// than others before the failure.
    fn reload(&mut self) -> CommResult<()> {
        let world = self.world()?;
        let min = allreduce_min_i32(&world, &mut self.ep, self.ckpt_iteration)?;
        if min >= self.max_iter {
            // Replacements start with ckpt_iteration at max_iter; a min
            // still up there means no participant has real progress to
            // restore from.
            return Err(Fault::Fatal(err(
                "restore impossible: no surviving rank has checkpoint progress",
            )));
        }
        self.iteration = min + 1;
        if self.recovered_at.is_none() {
            self.recovered_at = Some(self.iteration);
        }
        info!(
            "rank {} rolling back to iteration {}",
            self.rank, self.iteration
        );
        Ok(())
    }
}

fn timed<T>(debug: bool, acc: &mut f64, f: impl FnOnce() -> T) -> T {
    if !debug {
        return f();
    }
    let t = Instant::now();
    let r = f();
    *acc += t.elapsed().as_secs_f64();
    r
}

/// The restore phase of the external store: newest durable dataset
/// first, older ones as fallback, until one validates everywhere or
/// none is left. Returns the restored dataset iteration and any
/// diagnostic trailer.
fn store_restore(
    store: &mut Store,
    world: &World,
    ep: &mut Endpoint,
    rank: Rank,
    name: &str,
    tile: &mut [f64],
    debug: bool,
    timers: &mut Timers,
) -> CommResult<Option<(i32, Option<Timers>)>> {
    loop {
        if rank.0 == 0 {
            info!("checking for restart...");
        }
        let found = timed(debug, &mut timers.have_restart, || {
            store.have_restart(world, ep)
        })?;
        let Some(dataset) = found else {
            return Ok(None);
        };
        if rank.0 == 0 {
            info!("restarting from {}...", dataset.name);
        }
        timed(debug, &mut timers.start_restart, || {
            store.start_restart(&dataset)
        })?;
        let mut trailer = None;
        let valid = match timed(debug, &mut timers.route_file, || {
            store.read_rank_file(&dataset, rank.0, name, tile)
        }) {
            Ok(t) => {
                trailer = t;
                true
            }
            Err(e) => {
                warn!("could not read checkpoint from {}: {}", dataset.name, e);
                false
            }
        };
        let restarted = timed(debug, &mut timers.complete_restart, || {
            store.complete_restart(world, ep, valid)
        })?;
        if restarted {
            if rank.0 == 0 {
                info!("restarted from checkpoint {}", dataset.iteration);
            }
            return Ok(Some((dataset.iteration, trailer)));
        }
    }
}

/// The capture phase of the external store. Returns the iteration a
/// dataset was committed at, if one was.
fn store_checkpoint(
    store: &mut Store,
    world: &World,
    ep: &mut Endpoint,
    rank: Rank,
    iteration: i32,
    max_iter: i32,
    use_store_need: bool,
    name: &str,
    tile: &[f64],
    debug: bool,
    timers: &mut Timers,
) -> CommResult<Option<i32>> {
    let mut need = timed(debug, &mut timers.need_checkpoint, || {
        if use_store_need {
            store.need_checkpoint()
        } else {
            iteration != 0 && iteration % store.interval() == 0
        }
    });
    if need && iteration == max_iter - 1 {
        // The run is about to end; a checkpoint here would only teach a
        // future run to restart at the finish line.
        if rank.0 == 0 {
            info!("last iteration: will not save checkpoint");
        }
        need = false;
    }
    if !need {
        return Ok(None);
    }

    if rank.0 == 0 {
        info!("writing checkpoint {}", iteration);
    }
    let dataset_name = format!("timestep.{}", iteration);
    timed(debug, &mut timers.start_output, || {
        store.start_output(&dataset_name, iteration)
    })?;
    let payload = encode_payload(tile, if debug { Some(timers) } else { None });
    let valid = match timed(debug, &mut timers.route_file, || {
        store.write_rank_file(name, &payload)
    }) {
        Ok(()) => true,
        Err(e) => {
            warn!("could not write checkpoint {}: {}", dataset_name, e);
            false
        }
    };
    let committed = timed(debug, &mut timers.complete_output, || {
        store.complete_output(world, ep, valid)
    })?;
    Ok(committed.then_some(iteration))
}

fn print_timings(world: &World, ep: &mut Endpoint, rank: Rank, twf: f64) {
    match gather(world, ep, &twf) {
        Ok(Some(all)) => {
            let min = all.iter().copied().map(OrderedFloat).min();
            let max = all.iter().copied().map(OrderedFloat).max();
            if let (Some(min), Some(max)) = (min, max) {
                info!("##### Timings #####");
                info!("# MIN: {:13.5e} \t MAX: {:13.5e}", min.0, max.0);
            }
        }
        Ok(None) => {}
        Err(_) => warn!("rank {}: timing reduction failed", rank),
    }
}

fn print_debug_timings(world: &World, ep: &mut Endpoint, rank: Rank, timers: &Timers) {
    let arr = timers.as_array().to_vec();
    match gather(world, ep, &arr) {
        Ok(Some(all)) => {
            let n = all.len() as f64;
            let mut avg = [0.0; 10];
            for ranks in &all {
                for (i, v) in ranks.iter().enumerate().take(10) {
                    avg[i] += v / n;
                }
            }
            let t = Timers::from_array(avg);
            info!("##### Debug timings (average by rank) #####");
            info!("# store_init       (AVG): {:13.5e}", t.store_init);
            info!("# have_restart     (AVG): {:13.5e}", t.have_restart);
            info!("# start_restart    (AVG): {:13.5e}", t.start_restart);
            info!("# route_file       (AVG): {:13.5e}", t.route_file);
            info!("# complete_restart (AVG): {:13.5e}", t.complete_restart);
            info!("# need_checkpoint  (AVG): {:13.5e}", t.need_checkpoint);
            info!("# start_output     (AVG): {:13.5e}", t.start_output);
            info!("# complete_output  (AVG): {:13.5e}", t.complete_output);
        }
        Ok(None) => {}
        Err(_) => warn!("rank {}: debug timing reduction failed", rank),
    }
}

/// The SOR/Jacobi driver. Runs the iteration to convergence or
/// `max_iter`, checkpointing every K iterations, recovering from rank
/// failures by world repair plus rollback. Returns the iteration count
/// reached.
pub fn jacobi_cpu(mut rankctx: RankCtx, matrix: Vec<f64>, opts: &SolveOpts) -> Result<Outcome> {
    let geom = TileGeom::new(opts.nb, opts.mb);
    if matrix.len() != geom.len() {
        return Err(Error::config("matrix does not match tile geometry"));
    }
    if opts.grid.size() != rankctx.nranks {
        return Err(Error::config("process grid does not match world size"));
    }
    info!("starting/resuming Jacobi method...");

    let spawnee = rankctx.spawnee;
    let fabric = rankctx.ep.fabric().clone();
    let mut timers = Timers::default();

    let mut store = match &opts.backend {
        Backend::Store(cfg) => Some(timed(opts.debug, &mut timers.store_init, || {
            Store::open(cfg.clone())
        })?),
        Backend::Buddy { .. } => None,
    };

    // First run: adopt the initial world. Spare process: get the
    // repaired world (and our original rank) from the repair protocol.
    let (world0, rank, last_dead) = if !spawnee {
        let w = fabric.initial_world(FaultPolicy::Respawn)?;
        let r = w.my_rank(&rankctx.ep).map_err(Fault::into_fatal)?;
        (w, r, false)
    } else {
        let adopted = join_as_spawnee(&mut rankctx.ep).map_err(Fault::into_fatal)?;
        (adopted.world, adopted.rank, adopted.last_dead)
    };

    let mut ctx = DriverCtx {
        ep: rankctx.ep,
        worlds: [Some(world0), None],
        worldi: 0,
        rank,
        iteration: 0,
        ckpt_iteration: if spawnee { opts.max_iter } else { 0 },
        last_dead,
        // The restore step is the first thing a recovery pass or a
        // fresh store-backed run does.
        recovering: spawnee || matches!(opts.backend, Backend::Store(_)),
        recovered_at: None,
        restarted_from: None,
        max_iter: opts.max_iter,
        repair: opts.repair,
        timers,
    };
    if spawnee {
        let rank = ctx.rank.0;
        ctx.reload().map_err(|f| f.into_fatal().at_rank(rank))?;
    }
    info!(
        "rank {} is joining the execution at iteration {}",
        ctx.rank, ctx.iteration
    );

    let p = opts.grid.p as i32;
    let ckpt_name = format!("rank_{}.ckpt", ctx.rank.0);
    let cloud = opts.cloud.clone();

    let mut old = matrix;
    let mut new = vec![0.0; geom.len()];
    let mut buddy = BuddyCkpt::new(geom.len());

    let mut first_norm = None;
    let mut last_norm = 0.0;
    let start = Instant::now();

    macro_rules! comm {
        ($label:lifetime, $e:expr) => {
            match $e {
                Ok(v) => v,
                Err(fault) => {
                    ctx.recover(fault)?;
                    continue $label;
                }
            }
        };
    }

    'restart: loop {
        let world = ctx.world()?;
        // Rebuild the north/south and east/west families of this
        // world.
        let ns = comm!('restart, comm_split(&world, &mut ctx.ep, ctx.rank.0 % p, ctx.rank.0, 2));
        let ew = comm!('restart, comm_split(&world, &mut ctx.ep, ctx.rank.0 / p, ctx.rank.0, 3));

        let mut skip_comm = false;
        if ctx.recovering {
            ctx.recovering = false;
            match &opts.backend {
                Backend::Buddy { .. } => {
                    // Everybody retrieves their tile from the buddy
                    // ring, then heads straight for the sweep.
                    comm!('restart, buddy_restore(&world, &mut ctx.ep, &mut old, &buddy, ctx.last_dead));
                    skip_comm = true;
                }
                Backend::Store(_) => {
                    if let Some(store) = store.as_mut() {
                        let got = comm!('restart, store_restore(
                            store,
                            &world,
                            &mut ctx.ep,
                            ctx.rank,
                            &ckpt_name,
                            &mut old,
                            opts.debug,
                            &mut ctx.timers
                        ));
                        if let Some((it, trailer)) = got {
                            ctx.iteration = it + 1;
                            ctx.ckpt_iteration = it;
                            if ctx.restarted_from.is_none() {
                                ctx.restarted_from = Some(it);
                            }
                            if opts.debug {
                                if let Some(t) = trailer {
                                    ctx.timers.absorb(&t);
                                }
                            }
                        }
                    }
                }
            }
        }

        loop {
            if !skip_comm {
                if let Some(plan) = opts.kill {
                    if !spawnee && plan.rank == ctx.rank.0 && plan.at_iteration == ctx.iteration {
                        warn!(
                            "rank {} exiting ungracefully at iteration {}",
                            ctx.rank, ctx.iteration
                        );
                        ctx.ep.simulate_failure();
                        return Err(err("rank killed by fault plan"));
                    }
                }

                comm!('restart, halo::exchange(&geom, &ns, &ew, &mut ctx.ep, &mut old));

                if let Backend::Buddy { step } = &opts.backend {
                    if ctx.iteration != 0
                        && ctx.iteration % *step == 0
                        && ctx.iteration != ctx.max_iter - 1
                    {
                        if ctx.rank.0 == 0 {
                            info!("initiate circular buddy checkpointing");
                        }
                        comm!('restart, buddy_exchange(&world, &mut ctx.ep, &old, &mut buddy, ctx.iteration));
                        ctx.ckpt_iteration = ctx.iteration;
                    }
                }
            }
            skip_comm = false;

            // Replicate the ghost ring into the target matrix, then
            // sweep.
            copy_ghosts(&geom, &old, &mut new);
            let local = sor1(&mut new, &old, opts.nb, opts.mb);

            let diff_norm = comm!('restart, allreduce_sum_f64(&world, &mut ctx.ep, local));
            if ctx.rank.0 == 0 {
                info!("iteration {:4} norm {}", ctx.iteration, diff_norm.sqrt());
            }
            mem::swap(&mut old, &mut new);

            if matches!(opts.backend, Backend::Store(_)) {
                if let Some(store) = store.as_mut() {
                    let committed = comm!('restart, store_checkpoint(
                        store,
                        &world,
                        &mut ctx.ep,
                        ctx.rank,
                        ctx.iteration,
                        ctx.max_iter,
                        opts.use_store_need_checkpoint,
                        &ckpt_name,
                        &old,
                        opts.debug,
                        &mut ctx.timers
                    ));
                    if let Some(it) = committed {
                        ctx.ckpt_iteration = it;
                    }
                }
            }

            if first_norm.is_none() {
                first_norm = Some(diff_norm.sqrt());
            }
            last_norm = diff_norm.sqrt();
            ctx.iteration += 1;

            if let Some(cloud) = &cloud {
                if ctx.rank.0 == 0 {
                    let t = Instant::now();
                    run_termination_hook(cloud, ctx.iteration, ctx.max_iter);
                    ctx.timers.terminate_instances += t.elapsed().as_secs_f64();
                }
            }

            if !(ctx.iteration < ctx.max_iter && diff_norm.sqrt() > opts.epsilon) {
                break 'restart;
            }
        }
    }

    ctx.timers.total_wf_time += start.elapsed().as_secs_f64();

    let world = ctx.world()?;
    print_timings(&world, &mut ctx.ep, ctx.rank, ctx.timers.total_wf_time);
    if ctx.rank.0 == 0 {
        info!(
            "# terminate_instances: {:13.5e}",
            ctx.timers.terminate_instances
        );
    }
    if opts.debug && matches!(opts.backend, Backend::Store(_)) {
        print_debug_timings(&world, &mut ctx.ep, ctx.rank, &ctx.timers);
    }
    if let Some(cloud) = &cloud {
        if ctx.rank.0 == 0 {
            if let Err(e) = cloud.remove_terminated_instances_file() {
                warn!("cloud cleanup failed: {}", e);
            }
        }
    }

    Ok(Outcome {
        rank: ctx.rank,
        iterations: ctx.iteration,
        first_norm: first_norm.unwrap_or(0.0),
        last_norm,
        recovered_at: ctx.recovered_at,
        restarted_from: ctx.restarted_from,
        tile: old,
    })
}

/// Terminate the named nodes at a third and two thirds of the run. The
/// orchestrator recreates a terminated node and reruns the job, so the
/// persisted record is what keeps this from looping forever.
fn run_termination_hook(cloud: &Cloud, iteration: i32, max_iter: i32) {
    let target = if iteration == max_iter / 3 {
        Some("Node 1")
    } else if iteration == 2 * max_iter / 3 {
        Some("Node 2")
    } else {
        None
    };
    if let Some(name) = target {
        if !cloud.was_instance_already_terminated(name) {
            if let Err(e) = cloud.terminate_instance(name) {
                warn!("could not terminate {}: {}", name, e);
            }
        }
    }
}
