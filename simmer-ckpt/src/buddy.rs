use simmer_base::Error;
use simmer_net::{CommResult, Endpoint, Fault, World, TAG_BUDDY};

/// The circular buddy buffer: a copy of the ring predecessor's tile,
/// and the iteration at which it was taken. Starts zeroed; it only
/// means something once the first buddy round has run.
pub struct BuddyCkpt {
    pub tile: Vec<f64>,
    pub iteration: i32,
}

impl BuddyCkpt {
    pub fn new(len: usize) -> BuddyCkpt {
        BuddyCkpt {
            tile: vec![0.0; len],
            iteration: 0,
        }
    }
}

fn encode(tile: &[f64]) -> CommResult<Vec<u8>> {
    rmp_serde::to_vec(tile).map_err(|e| Fault::Fatal(Error::new(e)))
}

fn decode(bytes: &[u8]) -> CommResult<Vec<f64>> {
    rmp_serde::from_slice(bytes).map_err(|e| Fault::Fatal(Error::new(e)))
}

/// One buddy round: send my tile to the ring successor, take the
/// predecessor's into the buddy buffer. Every rank participates
/// symmetrically, so the buffered send plus a blocking receive is all
/// the synchronization the round needs.
pub fn buddy_exchange(
    world: &World,
    ep: &mut Endpoint,
    tile: &[f64],
    buddy: &mut BuddyCkpt,
    iteration: i32,
) -> CommResult<()> {
    let n = world.size();
    let me = world.my_rank(ep)?;
    ep.send(world, me.ring_next(n), TAG_BUDDY, &encode(tile)?)?;
    let bytes = ep.recv(world, me.ring_prev(n), TAG_BUDDY)?;
    let got = decode(&bytes)?;
    if got.len() != buddy.tile.len() {
        return Err(Fault::Fatal(simmer_base::err(
            "buddy payload has the wrong tile size",
        )));
    }
    buddy.tile.copy_from_slice(&got);
    buddy.iteration = iteration;
    Ok(())
}

/// Recovery-path ring receive: my successor holds the latest copy of my
/// tile and hands it back; I hand my buddy buffer back to my
/// predecessor. The last dead rank has no predecessor data to return
/// and sends an empty payload instead; its predecessor keeps the tile
/// it already has.
pub fn buddy_restore(
    world: &World,
    ep: &mut Endpoint,
    tile: &mut [f64],
    buddy: &BuddyCkpt,
    last_dead: bool,
) -> CommResult<()> {
    let n = world.size();
    let me = world.my_rank(ep)?;
    if last_dead {
        ep.send(world, me.ring_prev(n), TAG_BUDDY, &[])?;
    } else {
        ep.send(world, me.ring_prev(n), TAG_BUDDY, &encode(&buddy.tile)?)?;
    }
    let bytes = ep.recv(world, me.ring_next(n), TAG_BUDDY)?;
    if bytes.is_empty() {
        return Ok(());
    }
    let got = decode(&bytes)?;
    if got.len() != tile.len() {
        return Err(Fault::Fatal(simmer_base::err(
            "buddy restore payload has the wrong tile size",
        )));
    }
    tile.copy_from_slice(&got);
    Ok(())
}
