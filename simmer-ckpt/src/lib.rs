// Checkpointing, both flavors.
//
// The external store keeps named datasets under a prefix directory with
// a small per-iteration state machine (have_restart / start_restart /
// route_file / complete_restart on the way in, need_checkpoint /
// start_output / route_file / complete_output on the way out). A
// dataset only becomes durable once every rank has completed its output
// successfully and the commit manifest is on disk; a crashed or
// half-written dataset is invisible to later runs.
//
// The buddy checkpoint is the in-band alternative: every K iterations
// each rank mirrors its tile to its ring successor, so a dead rank's
// state survives in its neighbor's memory and a repaired world can
// rewind without touching stable storage at all.

mod buddy;
mod fileio;
mod payload;
mod store;
mod timers;

pub use buddy::{buddy_exchange, buddy_restore, BuddyCkpt};
pub use fileio::{CkptReader, CkptWriter};
pub use payload::{decode_payload, encode_payload, payload_checksum};
pub use store::{extract_final_number, Dataset, Store, StoreConfig};
pub use timers::Timers;

#[cfg(test)]
mod test;
