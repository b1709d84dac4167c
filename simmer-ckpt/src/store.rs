use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use simmer_base::{err, Error, Result};
use simmer_net::{allreduce_and, bcast, gather, CommResult, Endpoint, Fault, World};

use crate::fileio::{CkptReader, CkptWriter};
use crate::payload::{decode_payload, payload_checksum};
use crate::timers::Timers;

const MANIFEST_FILE: &str = "manifest.bin";

/// Store configuration, conventionally read from the environment:
/// `SCR_PREFIX` roots the dataset tree, `SCR_CHECKPOINT_INTERVAL` is
/// the K of the modulo-K checkpoint heuristic (and the cadence of the
/// delegated `need_checkpoint` decision).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub prefix: PathBuf,
    pub interval: i32,
}

impl StoreConfig {
    pub fn from_env() -> Result<StoreConfig> {
        let prefix = std::env::var("SCR_PREFIX").map_err(|_| err("SCR_PREFIX is not set"))?;
        let interval = match std::env::var("SCR_CHECKPOINT_INTERVAL") {
            Ok(s) => s
                .parse::<i32>()
                .map_err(|_| err("SCR_CHECKPOINT_INTERVAL is not an integer"))?,
            Err(_) => 10,
        };
        Ok(StoreConfig {
            prefix: PathBuf::from(prefix),
            interval,
        })
    }
}

/// A named dataset: one directory of per-rank checkpoint files plus a
/// commit manifest. The iteration travels as structured metadata in the
/// manifest; parsing it out of the name is kept only for datasets laid
/// down by writers that predate the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub iteration: i32,
    dir: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Manifest {
    name: String,
    iteration: i32,
    ranks: i32,
    checksums: Vec<u64>,
}

/// Per-rank handle on the external checkpoint store. All ranks walk the
/// state machine in lockstep; the collective steps (`have_restart`,
/// `complete_restart`, `complete_output`) take the current world so
/// their outcomes are agreed, not guessed.
pub struct Store {
    cfg: StoreConfig,
    rejected: BTreeSet<String>,
    restarting: Option<Dataset>,
    writing: Option<(Dataset, Vec<u8>)>,
    need_calls: i32,
}

impl Store {
    pub fn open(cfg: StoreConfig) -> Result<Store> {
        std::fs::create_dir_all(&cfg.prefix).map_err(Error::new)?;
        Ok(Store {
            cfg,
            rejected: BTreeSet::new(),
            restarting: None,
            writing: None,
            need_calls: 0,
        })
    }

    pub fn interval(&self) -> i32 {
        self.cfg.interval
    }

    /// The newest durable dataset not yet rejected this run, agreed
    /// across the world (rank 0 scans, everyone hears the same answer).
    pub fn have_restart(&mut self, world: &World, ep: &mut Endpoint) -> CommResult<Option<Dataset>> {
        let me = world.my_rank(ep)?;
        let scanned: Option<(String, i32)> = if me.0 == 0 {
            match self.scan_newest() {
                Ok(found) => found,
                Err(e) => {
                    warn!("failed scanning checkpoint prefix: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let chosen = bcast(world, ep, if me.0 == 0 { Some(scanned) } else { None })?;
        Ok(chosen.map(|(name, iteration)| Dataset {
            dir: self.cfg.prefix.join(&name),
            name,
            iteration,
        }))
    }

    pub fn start_restart(&mut self, dataset: &Dataset) -> Result<()> {
        if self.restarting.is_some() {
            return Err(err("restart already in progress"));
        }
        self.restarting = Some(dataset.clone());
        Ok(())
    }

    /// Where a rank's file for `name` lives within a dataset.
    pub fn route_file(&self, dataset: &Dataset, name: &str) -> PathBuf {
        dataset.dir.join(name)
    }

    /// Read and validate this rank's slice of the dataset under
    /// restart. Checksums are verified against the manifest when there
    /// is one; legacy datasets are taken on faith, as their writers
    /// intended.
    pub fn read_rank_file(
        &self,
        dataset: &Dataset,
        rank: i32,
        name: &str,
        tile: &mut [f64],
    ) -> Result<Option<Timers>> {
        let path = self.route_file(dataset, name);
        let bytes = CkptReader::open(path).map_err(Error::new)?.read_all()?;
        if let Some(manifest) = self.read_manifest(&dataset.dir)? {
            let recorded = manifest
                .checksums
                .get(rank as usize)
                .copied()
                .ok_or_else(|| err("rank missing from dataset manifest"))?;
            if payload_checksum(&bytes) != recorded {
                return Err(err("checkpoint payload checksum mismatch"));
            }
        }
        decode_payload(&bytes, tile)
    }

    /// Close out the restart. On any rank reporting invalid data the
    /// dataset is put aside and the next `have_restart` surfaces an
    /// older one.
    pub fn complete_restart(
        &mut self,
        world: &World,
        ep: &mut Endpoint,
        valid: bool,
    ) -> CommResult<bool> {
        let dataset = self
            .restarting
            .take()
            .ok_or_else(|| Fault::Fatal(err("complete_restart without start_restart")))?;
        let all_valid = allreduce_and(world, ep, valid)?;
        if !all_valid {
            warn!("dataset {} failed restart, trying older ones", dataset.name);
            self.rejected.insert(dataset.name);
        }
        Ok(all_valid)
    }

    /// Delegated "should I checkpoint now?": fires every `interval`
    /// calls.
    pub fn need_checkpoint(&mut self) -> bool {
        self.need_calls += 1;
        if self.need_calls >= self.cfg.interval {
            self.need_calls = 0;
            true
        } else {
            false
        }
    }

    pub fn start_output(&mut self, name: &str, iteration: i32) -> Result<Dataset> {
        if self.writing.is_some() {
            return Err(err("output already in progress"));
        }
        let dataset = Dataset {
            name: name.to_string(),
            iteration,
            dir: self.cfg.prefix.join(name),
        };
        std::fs::create_dir_all(&dataset.dir).map_err(Error::new)?;
        self.writing = Some((dataset.clone(), Vec::new()));
        Ok(dataset)
    }

    /// Write this rank's payload into the open dataset. The bytes are
    /// on disk (and synced) when this returns; durability of the
    /// dataset as a whole still waits for `complete_output`.
    pub fn write_rank_file(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        let (dataset, staged) = self
            .writing
            .as_mut()
            .ok_or_else(|| err("write outside start_output"))?;
        let path = dataset.dir.join(name);
        let mut w = CkptWriter::create(path).map_err(Error::new)?;
        w.write_all(payload).map_err(Error::new)?;
        w.finish().map_err(Error::new)?;
        *staged = payload.to_vec();
        Ok(())
    }

    /// Commit or abandon the open dataset. Rank 0 writes the manifest
    /// only after every rank has agreed its payload is valid; until the
    /// manifest exists the dataset is invisible to `have_restart`.
    pub fn complete_output(
        &mut self,
        world: &World,
        ep: &mut Endpoint,
        valid: bool,
    ) -> CommResult<bool> {
        let (dataset, staged) = self
            .writing
            .take()
            .ok_or_else(|| Fault::Fatal(err("complete_output without start_output")))?;
        let checksum = payload_checksum(&staged);
        let checksums = gather(world, ep, &checksum)?;
        let all_valid = allreduce_and(world, ep, valid && !staged.is_empty())?;
        let me = world.my_rank(ep)?;
        let mut committed = all_valid;
        if me.0 == 0 && all_valid {
            if let Some(checksums) = checksums {
                if let Err(e) = self.write_manifest(&dataset, checksums) {
                    warn!("failed committing dataset {}: {}", dataset.name, e);
                    committed = false;
                }
            }
        }
        // Everyone reports the same commit outcome.
        bcast(world, ep, if me.0 == 0 { Some(committed) } else { None })
    }

    fn write_manifest(&self, dataset: &Dataset, checksums: Vec<u64>) -> Result<()> {
        let manifest = Manifest {
            name: dataset.name.clone(),
            iteration: dataset.iteration,
            ranks: checksums.len() as i32,
            checksums,
        };
        let bytes = rmp_serde::to_vec(&manifest).map_err(Error::new)?;
        let mut w = CkptWriter::create(dataset.dir.join(MANIFEST_FILE)).map_err(Error::new)?;
        w.write_all(&bytes).map_err(Error::new)?;
        w.finish().map_err(Error::new)?;
        info!("checkpoint dataset {} committed", dataset.name);
        Ok(())
    }

    fn read_manifest(&self, dir: &PathBuf) -> Result<Option<Manifest>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = CkptReader::open(path).map_err(Error::new)?.read_all()?;
        Ok(Some(rmp_serde::from_slice(&bytes).map_err(Error::new)?))
    }

    fn scan_newest(&self) -> Result<Option<(String, i32)>> {
        let mut newest: Option<(String, i32)> = None;
        for entry in std::fs::read_dir(&self.cfg.prefix).map_err(Error::new)? {
            let entry = entry.map_err(Error::new)?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.rejected.contains(&name) {
                continue;
            }
            let iteration = match self.read_manifest(&entry.path())? {
                Some(m) => m.iteration,
                // Legacy layout: no manifest, iteration parsed off the
                // dataset name, rank files taken on faith.
                None => match extract_final_number(&name) {
                    Some(n) if entry.path().join("rank_0.ckpt").exists() => n,
                    _ => continue,
                },
            };
            if newest.as_ref().map(|(_, i)| iteration > *i).unwrap_or(true) {
                newest = Some((name, iteration));
            }
        }
        Ok(newest)
    }
}

/// Trailing digits of a dataset name, e.g. `timestep.40` -> 40.
pub fn extract_final_number(s: &str) -> Option<i32> {
    let digits: String = s
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}
