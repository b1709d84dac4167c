use simmer_base::{Error, Result};

/// The SOR process grid: `p` ranks per row, `q` per column. Rank r sits
/// in column `r % p` (its north/south family) and row `r / p` (its
/// east/west family). These colors are the split keys for the two halo
/// sub-worlds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ProcGrid {
    pub p: usize,
    pub q: usize,
}

impl ProcGrid {
    pub fn new(p: usize, q: usize) -> Result<Self> {
        if p < 1 || q < 1 {
            return Err(Error::config("process grid dimensions must be >= 1"));
        }
        Ok(ProcGrid { p, q })
    }
    pub fn size(&self) -> usize {
        self.p * self.q
    }
    pub fn ns_color(&self, rank: i32) -> i32 {
        rank % self.p as i32
    }
    pub fn ew_color(&self, rank: i32) -> i32 {
        rank / self.p as i32
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CartNeighbors {
    pub north: Option<i32>,
    pub south: Option<i32>,
    pub east: Option<i32>,
    pub west: Option<i32>,
}

/// The heat-equation partitioner. The global `size_x x size_y` interior
/// splits into `x_domains x y_domains` equal cells. At gather time the
/// subdomains are laid out in an extended collection buffer that
/// interleaves a ghost strip around every subdomain, giving the
/// `size_x + 2*x_domains + 2` by `size_y + 2*y_domains + 2` shape; the
/// extents below are coordinates in that layout. This is a property of
/// the collection buffer only, not of any per-tile operation.
///
/// Rank numbering keeps the original's inverted (Ox,Oy) convention:
/// rank = cy * x_domains + cx, rows of a tile run along x (cx picks the
/// row block), columns along y (cy picks the column block).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CartPartition {
    pub size_x: usize,
    pub size_y: usize,
    pub x_domains: usize,
    pub y_domains: usize,
    pub x_cell: usize,
    pub y_cell: usize,
}

impl CartPartition {
    pub fn new(size_x: usize, size_y: usize, x_domains: usize, y_domains: usize) -> Result<Self> {
        if x_domains < 1 || y_domains < 1 {
            return Err(Error::config("domain grid dimensions must be >= 1"));
        }
        if size_x % x_domains != 0 || size_y % y_domains != 0 {
            return Err(Error::config("global size not divisible by domain grid"));
        }
        Ok(CartPartition {
            size_x,
            size_y,
            x_domains,
            y_domains,
            x_cell: size_x / x_domains,
            y_cell: size_y / y_domains,
        })
    }

    pub fn nranks(&self) -> usize {
        self.x_domains * self.y_domains
    }
    pub fn extended_x(&self) -> usize {
        self.size_x + 2 * self.x_domains + 2
    }
    pub fn extended_y(&self) -> usize {
        self.size_y + 2 * self.y_domains + 2
    }

    /// Extents `(xs, ys, xe, ye)` of a rank's interior inside the
    /// extended collection layout, inclusive on both ends.
    pub fn extents(&self, rank: i32) -> (usize, usize, usize, usize) {
        let cx = rank as usize % self.x_domains;
        let cy = rank as usize / self.x_domains;
        let xs = 2 + cx * (self.x_cell + 2);
        let ys = 2 + cy * (self.y_cell + 2);
        (xs, ys, xs + self.x_cell - 1, ys + self.y_cell - 1)
    }

    /// Owner of an interior point `(gi, gj)`, with its tile-local
    /// coordinates; the inverse of `extents`.
    pub fn locate(&self, gi: usize, gj: usize) -> (i32, usize, usize) {
        let cx = gi / self.x_cell;
        let cy = gj / self.y_cell;
        let rank = (cy * self.x_domains + cx) as i32;
        (rank, gi % self.x_cell, gj % self.y_cell)
    }

    /// Neighbors in the cartesian arrangement; edges of the grid get
    /// the null peer. North/south step along x (stride 1), east/west
    /// along y (stride x_domains).
    pub fn neighbors(&self, rank: i32) -> CartNeighbors {
        let cx = rank as usize % self.x_domains;
        let cy = rank as usize / self.x_domains;
        CartNeighbors {
            north: (cx + 1 < self.x_domains).then(|| rank + 1),
            south: (cx > 0).then(|| rank - 1),
            east: (cy + 1 < self.y_domains).then(|| rank + self.x_domains as i32),
            west: (cy > 0).then(|| rank - self.x_domains as i32),
        }
    }

    /// Map an extended-layout x index back to a global interior x, or
    /// None if it falls on the outer border or a ghost strip.
    pub fn interior_x(&self, ei: usize) -> Option<usize> {
        interior_from_extended(ei, self.x_cell, self.extended_x())
    }
    pub fn interior_y(&self, ej: usize) -> Option<usize> {
        interior_from_extended(ej, self.y_cell, self.extended_y())
    }
}

fn interior_from_extended(e: usize, cell: usize, extended: usize) -> Option<usize> {
    if e == 0 || e + 1 >= extended {
        return None;
    }
    let t = e - 1;
    let block = t / (cell + 2);
    let off = t % (cell + 2);
    if off == 0 || off == cell + 1 {
        return None;
    }
    Some(block * cell + off - 1)
}
