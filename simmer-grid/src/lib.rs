// Tile geometry and the numerical heart of the solver.
//
// A rank owns an (NB x MB) block of the global domain, stored inside an
// (NB+2) x (MB+2) row-major buffer whose outer ring is the ghost region:
// copies of neighbor borders, or pinned boundary values at the edge of
// the global domain. The ghost offsets are a fixed contract shared with
// the halo-exchange and checkpoint layers; nothing else is allowed to
// assume anything about the layout.
//
// Two stencils live here:
//
//  - `sor1`, a successive-over-relaxation sweep with the Gauss-Seidel
//    asymmetry of the original scheme (west/north read the *new* matrix,
//    east/south the old one). The asymmetry is load-bearing: it is what
//    makes the forward sweep converge at the observed rate, so it must
//    not be "fixed" into a plain Jacobi update.
//
//  - `heat_step`, a five-point explicit scheme for the 2-D heat
//    equation.
//
// Both are pure functions over ghost-filled tiles: they never touch the
// ghost ring, and they return the local squared L2 difference between
// the pre- and post-iterate tiles for the global convergence reduction.

mod partition;
mod stencil;
mod tile;

pub use partition::{CartNeighbors, CartPartition, ProcGrid};
pub use stencil::{heat_coeffs, heat_step, sor1, sor_omega, stable_dt, HeatCoeffs};
pub use tile::{
    copy_ghosts, generate_border, init_heat_tile, init_matrix, StridedCol, TileGeom,
};

#[cfg(test)]
mod test;
