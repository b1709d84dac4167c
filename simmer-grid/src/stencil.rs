use tracing::warn;

use crate::tile::TileGeom;

pub fn sor_omega(nb: usize) -> f64 {
    2.0 / (1.0 + std::f64::consts::PI / nb as f64)
}

/// One successive-over-relaxation sweep over the interior of `om`,
/// writing into `nm` and returning the squared L2 norm of the change.
///
/// The west and north neighbors read `nm` (already updated this sweep),
/// the east and south neighbors read `om`: a Gauss-Seidel forward
/// sweep. Both ghost rings must be filled before calling.
pub fn sor1(nm: &mut [f64], om: &[f64], nb: usize, mb: usize) -> f64 {
    let mut norm = 0.0;
    let w = sor_omega(nb);
    for j in 0..mb {
        for i in 0..nb {
            let pos = 1 + i + (j + 1) * (nb + 2);
            nm[pos] = (1.0 - w) * om[pos]
                + w / 4.0
                    * (nm[pos - 1] + om[pos + 1] + nm[pos - (nb + 2)] + om[pos + (nb + 2)]);
            norm += (nm[pos] - om[pos]) * (nm[pos] - om[pos]);
        }
    }
    norm
}

/// Stencil factors for the explicit five-point heat scheme:
///
///   |                                    wx * x[i-1][j]                            |
///   |                                                                              |
///   | wy * x[i][j-1]       (dx * wx + dy * wy) * x[i][j]           wy * x[i][j+1]  |
///   |                                                                              |
///   |                                    wx * x[i+1][j]                            |
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeatCoeffs {
    pub dt: f64,
    pub dx: f64,
    pub dy: f64,
    pub wx: f64,
    pub wy: f64,
}

/// Largest time step for which the explicit scheme is stable.
pub fn stable_dt(hx: f64, hy: f64, k0: f64) -> f64 {
    0.25 * (hx.min(hy) * hx.min(hy)) / k0
}

/// Derive the stencil factors for a requested time step. A step beyond
/// the stability bound gets a warning but is kept as requested; the
/// caller asked for it and silently changing the physics would be
/// worse than diverging loudly.
pub fn heat_coeffs(dt: f64, hx: f64, hy: f64, k0: f64) -> HeatCoeffs {
    if dt > stable_dt(hx, hy, k0) {
        warn!(
            "time step {} exceeds stability bound {}, keeping requested value",
            dt,
            stable_dt(hx, hy, k0)
        );
    }
    HeatCoeffs {
        dt,
        dx: -2.0 + hx * hx / (2.0 * k0 * dt),
        dy: -2.0 + hy * hy / (2.0 * k0 * dt),
        wx: k0 * dt / (hx * hx),
        wy: k0 * dt / (hy * hy),
    }
}

/// One explicit step on a ghost-filled tile: compute `x` from `x0`,
/// then fold the update back into `x0`, returning the local squared
/// difference. Row index runs along x (pairs with `dx`/`wx`), column
/// index along y.
pub fn heat_step(x0: &mut [f64], x: &mut [f64], geom: &TileGeom, c: &HeatCoeffs) -> f64 {
    let s = geom.stride();
    for j in 1..=geom.mb {
        for i in 1..=geom.nb {
            let p = j * s + i;
            x[p] = c.wx * (x0[p - s] + x0[p + s] + x0[p] * c.dx)
                + c.wy * (x0[p - 1] + x0[p + 1] + x0[p] * c.dy);
        }
    }
    let mut diff = 0.0;
    for j in 1..=geom.mb {
        for i in 1..=geom.nb {
            let p = j * s + i;
            let d = x0[p] - x[p];
            diff += d * d;
            x0[p] = x[p];
        }
    }
    diff
}
