use std::process::exit;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use simmer::{jacobi_cpu, Backend, Cloud, SolveOpts};
use simmer_ckpt::StoreConfig;
use simmer_grid::{generate_border, init_matrix, ProcGrid, TileGeom};
use simmer_net::{Fabric, FabricConfig, RankCtx};

fn parse_int(args: &[String], i: &mut usize, flag: &str) -> i64 {
    *i += 1;
    match args.get(*i).and_then(|s| s.parse::<i64>().ok()) {
        Some(v) => v,
        None => {
            eprintln!("Bad or missing value for {}", flag);
            exit(-1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut p: i64 = -1;
    let mut q: i64 = -1;
    let mut nb: i64 = -1;
    let mut mb: i64 = -1;
    let mut debug = false;
    let mut use_scr_need_checkpoint = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-p" => p = parse_int(&args, &mut i, "-p"),
            "-q" => q = parse_int(&args, &mut i, "-q"),
            "-NB" => nb = parse_int(&args, &mut i, "-NB"),
            "-MB" => mb = parse_int(&args, &mut i, "-MB"),
            "--debug" => debug = true,
            "--use-scr-need-checkpoint" => use_scr_need_checkpoint = true,
            other => {
                eprintln!("Unknown argument {}", other);
                exit(-1);
            }
        }
        i += 1;
    }
    if p < 1 {
        eprintln!("Missing number of processes per row (-p #)");
        exit(-1);
    }
    if q < 1 {
        eprintln!("Missing number of processes per column (-q #)");
        exit(-1);
    }
    if nb < 1 {
        eprintln!("Missing the first dimension of the matrix (-NB #)");
        exit(-1);
    }
    if mb < 1 {
        mb = nb;
    }

    let grid = match ProcGrid::new(p as usize, q as usize) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Bad process grid: {}", e);
            exit(-1);
        }
    };
    let (nb, mb) = (nb as usize, mb as usize);

    // With a store configured in the environment, checkpoints go there;
    // otherwise the in-band buddy ring carries them.
    let backend = match StoreConfig::from_env() {
        Ok(cfg) => Backend::Store(cfg),
        Err(_) => Backend::Buddy { step: 10 },
    };
    let cloud = matches!(backend, Backend::Store(_))
        .then(|| std::env::current_dir().ok())
        .flatten()
        .map(Cloud::new);

    let mut opts = SolveOpts::new(grid, nb, mb);
    opts.debug = debug;
    opts.use_store_need_checkpoint = use_scr_need_checkpoint;
    opts.backend = backend;
    opts.cloud = cloud;

    let program = Arc::new(move |ctx: RankCtx| {
        let geom = TileGeom::new(opts.nb, opts.mb);
        let mut matrix = vec![0.0; geom.len()];
        if !ctx.spawnee {
            // Initial ranks build their tile from the seeded border;
            // replacements wait for the restore step instead.
            let rank = ctx.ep.slot() as u32;
            let seed = rank
                .wrapping_mul(opts.nb as u32)
                .wrapping_mul(opts.mb as u32);
            let mut border = vec![0.0; 2 * (opts.nb + 2 + opts.mb)];
            generate_border(&mut border, seed);
            init_matrix(&mut matrix, &border, opts.nb, opts.mb);
        }
        match jacobi_cpu(ctx, matrix, &opts) {
            Ok(outcome) => {
                if outcome.rank.0 == 0 {
                    info!(
                        "jacobi finished at iteration {} with norm {}",
                        outcome.iterations, outcome.last_norm
                    );
                }
            }
            Err(e) => {
                eprintln!("The CPU Jacobi failed: {}", e);
                exit(if e.is_config() { -1 } else { 1 });
            }
        }
    });

    if let Err(e) = Fabric::run(grid.size(), FabricConfig::default(), program) {
        eprintln!("fabric failed: {}", e);
        exit(1);
    }
}
