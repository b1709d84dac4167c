use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use simmer::{heat_solve, HeatParams};
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

fn parse_float(args: &[String], i: &mut usize, flag: &str) -> f64 {
    *i += 1;
    match args.get(*i).and_then(|s| s.parse::<f64>().ok()) {
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
    let mut params = HeatParams::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-x" => params.size_x = parse_int(&args, &mut i, "-x") as usize,
            "-y" => params.size_y = parse_int(&args, &mut i, "-y") as usize,
            "-p" => params.x_domains = parse_int(&args, &mut i, "-p") as usize,
            "-q" => params.y_domains = parse_int(&args, &mut i, "-q") as usize,
            "--steps" => params.max_steps = parse_int(&args, &mut i, "--steps") as i32,
            "--dt" => params.dt = parse_float(&args, &mut i, "--dt"),
            "--eps" => params.epsilon = parse_float(&args, &mut i, "--eps"),
            "--output" => {
                i += 1;
                match args.get(i) {
                    Some(p) => params.output = Some(PathBuf::from(p)),
                    None => {
                        eprintln!("Bad or missing value for --output");
                        exit(-1);
                    }
                }
            }
            other => {
                eprintln!("Unknown argument {}", other);
                exit(-1);
            }
        }
        i += 1;
    }
    if params.x_domains < 1 || params.y_domains < 1 {
        eprintln!("Domain grid dimensions must be >= 1");
        exit(-1);
    }

    let nranks = params.x_domains * params.y_domains;
    let run = params.clone();
    let program = Arc::new(move |ctx: RankCtx| match heat_solve(ctx, &run) {
        Ok(outcome) => {
            if outcome.rank.0 == 0 {
                info!(
                    "heat equation finished after {} steps, residual {}",
                    outcome.steps, outcome.result
                );
            }
        }
        Err(e) => {
            eprintln!("The heat solver failed: {}", e);
            exit(if e.is_config() { -1 } else { 1 });
        }
    });

    if let Err(e) = Fabric::run(nranks, FabricConfig::default(), program) {
        eprintln!("fabric failed: {}", e);
        exit(1);
    }
}
