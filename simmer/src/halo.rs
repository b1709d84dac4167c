use simmer_base::{err, Error};
use simmer_grid::TileGeom;
use simmer_net::{CommResult, Endpoint, Fault, Rank, World, TAG_HALO};

// One halo round: refresh the four ghost strips from the neighbors in
// the north/south and east/west families. Sends are buffered and
// return immediately; the receives at the end are the wait-all of the
// round. East/west columns go through dense staging buffers (pack
// before send, unpack after receive) so the wire never sees a strided
// payload.

pub(crate) fn encode_strip(xs: &[f64]) -> CommResult<Vec<u8>> {
    rmp_serde::to_vec(xs).map_err(|e| Fault::Fatal(Error::new(e)))
}

pub(crate) fn decode_strip(bytes: &[u8], want: usize) -> CommResult<Vec<f64>> {
    let v: Vec<f64> = rmp_serde::from_slice(bytes).map_err(|e| Fault::Fatal(Error::new(e)))?;
    if v.len() != want {
        return Err(Fault::Fatal(err(format!(
            "halo strip is {} values, expected {}",
            v.len(),
            want
        ))));
    }
    Ok(v)
}

/// Refresh the ghost ring of `tile` from the four neighbors. Grid-edge
/// ranks keep their pinned ghost values on the missing sides.
pub fn exchange(
    geom: &TileGeom,
    ns: &World,
    ew: &World,
    ep: &mut Endpoint,
    tile: &mut [f64],
) -> CommResult<()> {
    let ns_rank = ns.my_rank(ep)?;
    let ns_size = ns.size();
    let ew_rank = ew.my_rank(ep)?;
    let ew_size = ew.size();

    // Post the sends.
    if ns_rank.0 != 0 {
        let strip = encode_strip(&tile[geom.send_north()])?;
        ep.send(ns, Rank(ns_rank.0 - 1), TAG_HALO, &strip)?;
    }
    if ns_rank.0 != ns_size - 1 {
        let strip = encode_strip(&tile[geom.send_south()])?;
        ep.send(ns, Rank(ns_rank.0 + 1), TAG_HALO, &strip)?;
    }
    let send_west = geom.send_col_west().pack(tile);
    let send_east = geom.send_col_east().pack(tile);
    if ew_rank.0 != ew_size - 1 {
        ep.send(ew, Rank(ew_rank.0 + 1), TAG_HALO, &encode_strip(&send_east)?)?;
    }
    if ew_rank.0 != 0 {
        ep.send(ew, Rank(ew_rank.0 - 1), TAG_HALO, &encode_strip(&send_west)?)?;
    }

    // Wait for all of them to complete.
    if ns_rank.0 != 0 {
        let v = decode_strip(&ep.recv(ns, Rank(ns_rank.0 - 1), TAG_HALO)?, geom.nb)?;
        tile[geom.recv_north()].copy_from_slice(&v);
    }
    if ns_rank.0 != ns_size - 1 {
        let v = decode_strip(&ep.recv(ns, Rank(ns_rank.0 + 1), TAG_HALO)?, geom.nb)?;
        tile[geom.recv_south()].copy_from_slice(&v);
    }
    if ew_rank.0 != ew_size - 1 {
        let v = decode_strip(&ep.recv(ew, Rank(ew_rank.0 + 1), TAG_HALO)?, geom.mb)?;
        geom.ghost_col_east().unpack(tile, &v);
    }
    if ew_rank.0 != 0 {
        let v = decode_strip(&ep.recv(ew, Rank(ew_rank.0 - 1), TAG_HALO)?, geom.mb)?;
        geom.ghost_col_west().unpack(tile, &v);
    }
    Ok(())
}
