use std::fmt::Write as _;
use std::io::Write as _;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info};

use simmer_base::{Error, Result};
use simmer_grid::{heat_coeffs, heat_step, init_heat_tile, CartPartition, TileGeom};
use simmer_net::{
    allreduce_sum_f64, gather, CommResult, Endpoint, Fault, FaultPolicy, Rank, RankCtx, World,
    TAG_HALO,
};

use crate::halo::{decode_strip, encode_strip};

/// Physical and numerical parameters of the heat-equation run. The
/// defaults reproduce the reference workload: a 128x128 plate split
/// into one-by-two subdomains, borders pinned warm, interior cold.
#[derive(Clone, Debug)]
pub struct HeatParams {
    pub size_x: usize,
    pub size_y: usize,
    pub x_domains: usize,
    pub y_domains: usize,
    pub max_steps: i32,
    pub dt: f64,
    pub epsilon: f64,
    pub temp1_init: f64,
    pub temp2_init: f64,
    pub k0: f64,
    /// Where rank 0 writes the gathered solution; None skips it.
    pub output: Option<PathBuf>,
}

impl Default for HeatParams {
    fn default() -> Self {
        HeatParams {
            size_x: 128,
            size_y: 128,
            x_domains: 1,
            y_domains: 2,
            max_steps: 10000,
            dt: 1.0e-1,
            epsilon: 1.0e-1,
            temp1_init: 10.0,
            temp2_init: -10.0,
            k0: 1.0,
            output: Some(PathBuf::from("output.dat")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HeatOutcome {
    pub rank: Rank,
    pub steps: i32,
    pub result: f64,
    pub elapsed: f64,
}

fn sendrecv_rows(
    world: &World,
    ep: &mut Endpoint,
    send_to: Option<i32>,
    recv_from: Option<i32>,
    tile: &mut [f64],
    send: Range<usize>,
    recv: Range<usize>,
) -> CommResult<()> {
    if let Some(d) = send_to {
        let strip = encode_strip(&tile[send])?;
        ep.send(world, Rank(d), TAG_HALO, &strip)?;
    }
    if let Some(s) = recv_from {
        let want = recv.len();
        let v = decode_strip(&ep.recv(world, Rank(s), TAG_HALO)?, want)?;
        tile[recv].copy_from_slice(&v);
    }
    Ok(())
}

/// Ghost-cell refresh against the four cartesian neighbors, as two
/// row exchanges and two strided-column exchanges.
fn update_boundaries(
    geom: &TileGeom,
    world: &World,
    ep: &mut Endpoint,
    part: &CartPartition,
    rank: Rank,
    tile: &mut [f64],
) -> CommResult<()> {
    let nb = part.neighbors(rank.0);
    // Send my boundary north, receive from south; then the reverse.
    sendrecv_rows(world, ep, nb.north, nb.south, tile, geom.send_south(), geom.recv_north())?;
    sendrecv_rows(world, ep, nb.south, nb.north, tile, geom.send_north(), geom.recv_south())?;
    // Columns travel packed through the strided descriptors.
    if let Some(d) = nb.east {
        let col = geom.send_col_east().pack(tile);
        ep.send(world, Rank(d), TAG_HALO, &encode_strip(&col)?)?;
    }
    if let Some(s) = nb.west {
        let v = decode_strip(&ep.recv(world, Rank(s), TAG_HALO)?, geom.mb)?;
        geom.ghost_col_west().unpack(tile, &v);
    }
    if let Some(d) = nb.west {
        let col = geom.send_col_west().pack(tile);
        ep.send(world, Rank(d), TAG_HALO, &encode_strip(&col)?)?;
    }
    if let Some(s) = nb.east {
        let v = decode_strip(&ep.recv(world, Rank(s), TAG_HALO)?, geom.mb)?;
        geom.ghost_col_east().unpack(tile, &v);
    }
    Ok(())
}

/// The explicit heat-equation driver: iterate to convergence or
/// `max_steps`, gather the subdomains at rank 0 and write the solution.
pub fn heat_solve(mut rankctx: RankCtx, params: &HeatParams) -> Result<HeatOutcome> {
    let part = CartPartition::new(
        params.size_x,
        params.size_y,
        params.x_domains,
        params.y_domains,
    )?;
    if part.nranks() != rankctx.nranks {
        return Err(Error::config(
            "number of ranks not equal to number of subdomains",
        ));
    }
    let fabric = rankctx.ep.fabric().clone();
    let world = fabric.initial_world(FaultPolicy::Abort)?;
    let rank = world.my_rank(&rankctx.ep).map_err(Fault::into_fatal)?;
    let fatal = |f: Fault| f.into_fatal().at_rank(rank.0);
    let ep = &mut rankctx.ep;

    // Tile rows run along x, columns along y.
    let geom = TileGeom::new(part.y_cell, part.x_cell);
    let hx = 1.0 / (params.size_x + 2) as f64;
    let hy = 1.0 / (params.size_y + 2) as f64;
    let coeffs = heat_coeffs(params.dt, hx, hy, params.k0);

    let mut x0 = init_heat_tile(&geom, params.temp1_init, params.temp2_init);
    let mut x = vec![0.0; geom.len()];

    update_boundaries(&geom, &world, ep, &part, rank, &mut x0).map_err(fatal)?;

    let start = Instant::now();
    let mut step = 0;
    let mut result = f64::MAX;
    while step < params.max_steps && result > params.epsilon {
        step += 1;
        let local = heat_step(&mut x0, &mut x, &geom, &coeffs);
        update_boundaries(&geom, &world, ep, &part, rank, &mut x0).map_err(fatal)?;
        result = allreduce_sum_f64(&world, ep, local).map_err(fatal)?.sqrt();
        if rank.0 == 0 {
            debug!("completed step {}", step);
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    // Pull out the interior, row-major, and gather in rank order.
    let mut mine = Vec::with_capacity(part.x_cell * part.y_cell);
    for row in 0..part.x_cell {
        for col in 0..part.y_cell {
            mine.push(x0[geom.idx(col + 1, row + 1)]);
        }
    }
    let gathered = gather(&world, ep, &mine).map_err(fatal)?;

    if rank.0 == 0 {
        info!("time step = {:.9e}", coeffs.dt);
        info!("convergence = {:.9} after {} steps", result, step);
        info!("problem size = {}", params.size_x * params.size_y);
        info!("wall clock = {:.9}", elapsed);
        if let (Some(path), Some(tiles)) = (&params.output, &gathered) {
            write_output(path, &part, params, tiles)?;
            info!("computed solution in {}", path.display());
        }
    }

    Ok(HeatOutcome {
        rank,
        steps: step,
        result,
        elapsed,
    })
}

/// Write the gathered solution in the extended collection layout:
/// the outer border and every per-subdomain ghost strip print the
/// border temperature, interior cells print the solution.
fn write_output(
    path: &PathBuf,
    part: &CartPartition,
    params: &HeatParams,
    tiles: &[Vec<f64>],
) -> Result<()> {
    let f = std::fs::File::create(path).map_err(Error::new)?;
    let mut w = std::io::BufWriter::new(f);
    for ej in 0..part.extended_y() {
        let mut line = String::new();
        for ei in 0..part.extended_x() {
            let v = match (part.interior_x(ei), part.interior_y(ej)) {
                (Some(gi), Some(gj)) => {
                    let (r, li, lj) = part.locate(gi, gj);
                    tiles[r as usize][li * part.y_cell + lj]
                }
                _ => params.temp1_init,
            };
            if ei + 1 == part.extended_x() {
                write!(line, "{:15.11}", v).map_err(Error::new)?;
            } else {
                write!(line, "{:15.11} ", v).map_err(Error::new)?;
            }
        }
        writeln!(w, "{}", line).map_err(Error::new)?;
    }
    w.flush().map_err(Error::new)?;
    Ok(())
}
