use crate::{
    copy_ghosts, generate_border, heat_coeffs, heat_step, init_heat_tile, init_matrix, sor1,
    sor_omega, stable_dt, CartPartition, ProcGrid, TileGeom,
};
use test_log::test;

#[test]
fn test_ghost_offsets() {
    let g = TileGeom::new(4, 3);
    assert_eq!(g.len(), 6 * 5);
    assert_eq!(g.recv_north(), 1..5);
    assert_eq!(g.send_north(), 7..11);
    assert_eq!(g.send_south(), 3 * 6 + 1..3 * 6 + 5);
    assert_eq!(g.recv_south(), 4 * 6 + 1..4 * 6 + 5);
    let w = g.send_col_west();
    assert_eq!((w.first, w.stride, w.count), (7, 6, 3));
    let e = g.ghost_col_east();
    assert_eq!((e.first, e.stride, e.count), (11, 6, 3));
}

#[test]
fn test_strided_pack_unpack() {
    let g = TileGeom::new(3, 4);
    let buf: Vec<f64> = (0..g.len()).map(|x| x as f64).collect();
    let col = g.send_col_east();
    let packed = col.pack(&buf);
    assert_eq!(packed, vec![8.0, 13.0, 18.0, 23.0]);
    let mut other = vec![0.0; g.len()];
    g.ghost_col_west().unpack(&mut other, &packed);
    assert_eq!(other[5], 8.0);
    assert_eq!(other[20], 23.0);
}

#[test]
fn test_proc_grid_colors() {
    let pg = ProcGrid::new(2, 2).unwrap();
    assert_eq!(pg.size(), 4);
    // ns families are columns of the grid, ew families are rows
    assert_eq!(pg.ns_color(0), pg.ns_color(2));
    assert_eq!(pg.ns_color(1), pg.ns_color(3));
    assert_eq!(pg.ew_color(0), pg.ew_color(1));
    assert_eq!(pg.ew_color(2), pg.ew_color(3));
    assert!(ProcGrid::new(0, 1).is_err());
}

#[test]
fn test_cart_partition_extents_roundtrip() {
    let cp = CartPartition::new(8, 8, 2, 2).unwrap();
    assert_eq!(cp.nranks(), 4);
    assert_eq!(cp.extended_x(), 8 + 4 + 2);
    // First block starts at 2, each further block is cell + 2 away.
    assert_eq!(cp.extents(0), (2, 2, 5, 5));
    assert_eq!(cp.extents(1), (8, 2, 11, 5));
    assert_eq!(cp.extents(2), (2, 8, 5, 11));
    for gi in 0..8 {
        for gj in 0..8 {
            let (rank, li, lj) = cp.locate(gi, gj);
            let (xs, ys, xe, ye) = cp.extents(rank);
            assert!(xs + li <= xe && ys + lj <= ye);
            // extended coordinate of the point maps back to (gi, gj)
            assert_eq!(cp.interior_x(xs + li), Some(gi));
            assert_eq!(cp.interior_y(ys + lj), Some(gj));
        }
    }
    // Borders and ghost strips are nobody's interior.
    assert_eq!(cp.interior_x(0), None);
    assert_eq!(cp.interior_x(1), None);
    assert_eq!(cp.interior_x(6), None);
    assert_eq!(cp.interior_x(7), None);
    assert_eq!(cp.interior_x(13), None);
}

#[test]
fn test_cart_neighbors() {
    let cp = CartPartition::new(8, 8, 2, 2).unwrap();
    let n0 = cp.neighbors(0);
    assert_eq!(n0.north, Some(1));
    assert_eq!(n0.south, None);
    assert_eq!(n0.east, Some(2));
    assert_eq!(n0.west, None);
    let n3 = cp.neighbors(3);
    assert_eq!(n3.north, None);
    assert_eq!(n3.south, Some(2));
    assert_eq!(n3.east, None);
    assert_eq!(n3.west, Some(1));
}

// Reference SOR sweep on a 2-D representation, written independently of
// the flat-buffer indexing so the two can disagree if either is wrong.
fn sor_reference(om: &[f64], nb: usize, mb: usize) -> (Vec<f64>, f64) {
    let s = nb + 2;
    let mut nm = om.to_vec();
    let w = sor_omega(nb);
    let mut norm = 0.0;
    for row in 1..=mb {
        for col in 1..=nb {
            let p = row * s + col;
            let west = nm[p - 1];
            let north = nm[p - s];
            let east = om[p + 1];
            let south = om[p + s];
            nm[p] = (1.0 - w) * om[p] + w / 4.0 * (west + east + north + south);
            let d = nm[p] - om[p];
            norm += d * d;
        }
    }
    (nm, norm)
}

#[test]
fn test_sor_forward_sweep_matches_reference() {
    let (nb, mb) = (5, 4);
    let g = TileGeom::new(nb, mb);
    let mut om = vec![0.0; g.len()];
    generate_border(&mut om, 7);
    let mut nm = vec![0.0; g.len()];
    copy_ghosts(&g, &om, &mut nm);
    let norm = sor1(&mut nm, &om, nb, mb);
    let (expect, expect_norm) = sor_reference(&om, nb, mb);
    for p in 0..g.len() {
        assert!((nm[p] - expect[p]).abs() < 1e-12, "cell {} differs", p);
    }
    assert!((norm - expect_norm).abs() < 1e-12);
}

#[test]
fn test_sor_uses_updated_west_neighbor() {
    // With two interior cells in a row, the east cell must see the
    // freshly-updated west cell, not its old value. A pure Jacobi
    // update of the same tile gives a different east result.
    let (nb, mb) = (2, 1);
    let g = TileGeom::new(nb, mb);
    let mut om = vec![1.0; g.len()];
    om[g.idx(1, 1)] = 4.0;
    om[g.idx(2, 1)] = -3.0;
    let mut nm = vec![0.0; g.len()];
    copy_ghosts(&g, &om, &mut nm);
    sor1(&mut nm, &om, nb, mb);
    let w = sor_omega(nb);
    let west = (1.0 - w) * 4.0 + w / 4.0 * (1.0 + -3.0 + 1.0 + 1.0);
    let east = (1.0 - w) * -3.0 + w / 4.0 * (west + 1.0 + 1.0 + 1.0);
    assert!((nm[g.idx(1, 1)] - west).abs() < 1e-12);
    assert!((nm[g.idx(2, 1)] - east).abs() < 1e-12);
}

#[test]
fn test_sor_norm_decreases() {
    let (nb, mb) = (8, 8);
    let g = TileGeom::new(nb, mb);
    let mut om = init_heat_tile(&g, 1.0, 0.0);
    let mut nm = vec![0.0; g.len()];
    let mut norms = Vec::new();
    for _ in 0..40 {
        copy_ghosts(&g, &om, &mut nm);
        norms.push(sor1(&mut nm, &om, nb, mb).sqrt());
        std::mem::swap(&mut om, &mut nm);
    }
    assert!(norms[39] < norms[0]);
    assert!(norms[39] < 1e-2);
}

#[test]
fn test_heat_step_monotone_and_bounded() {
    // Pinned borders warmer than the interior: the maximum principle
    // keeps every interior cell between the two initial temperatures,
    // and the change norm shrinks monotonically (up to fp noise).
    let g = TileGeom::new(8, 8);
    let mut x0 = init_heat_tile(&g, 10.0, -10.0);
    let mut x = vec![0.0; g.len()];
    let hx = 1.0 / 10.0;
    let hy = 1.0 / 10.0;
    let c = heat_coeffs(0.5 * stable_dt(hx, hy, 1.0), hx, hy, 1.0);
    let mut prev = f64::MAX;
    for _ in 0..20 {
        let d = heat_step(&mut x0, &mut x, &g, &c).sqrt();
        assert!(d <= prev + 1e-12);
        prev = d;
    }
    for j in 1..=g.mb {
        for i in 1..=g.nb {
            let v = x0[g.idx(i, j)];
            assert!((-10.0..=10.0).contains(&v));
        }
    }
}

#[test]
fn test_heat_coeffs_keep_requested_dt() {
    let c = heat_coeffs(0.1, 0.1, 0.1, 1.0);
    // Unstable request: warned about, never silently reduced.
    assert_eq!(c.dt, 0.1);
    assert!((c.wx - 10.0).abs() < 1e-12);
    assert!((c.dx - (-1.95)).abs() < 1e-12);
}

#[test]
fn test_init_matrix_border_layout() {
    let (nb, mb) = (3, 2);
    let mut border = vec![0.0; 2 * (nb + 2 + mb)];
    for (i, b) in border.iter_mut().enumerate() {
        *b = i as f64;
    }
    let g = TileGeom::new(nb, mb);
    let mut m = vec![-1.0; g.len()];
    init_matrix(&mut m, &border, nb, mb);
    // top row consumes border[0..nb+2]
    assert_eq!(&m[0..5], &[0.0, 1.0, 2.0, 3.0, 4.0]);
    // west/east pairs follow, interiors zeroed
    assert_eq!(m[g.idx(0, 1)], 5.0);
    assert_eq!(m[g.idx(nb + 1, 1)], 6.0);
    assert_eq!(m[g.idx(0, 2)], 7.0);
    assert_eq!(m[g.idx(nb + 1, 2)], 8.0);
    assert_eq!(m[g.idx(1, 1)], 0.0);
    assert_eq!(m[g.idx(nb, 2)], 0.0);
    // bottom row consumes the tail
    assert_eq!(m[g.idx(0, mb + 1)], 9.0);
    assert_eq!(m[g.idx(nb + 1, mb + 1)], 13.0);
}
