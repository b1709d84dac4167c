mod error;
mod rankset;

pub use error::{err, Error, ErrorKind, Result};
pub use rankset::RankSet256;

#[cfg(test)]
mod test;
