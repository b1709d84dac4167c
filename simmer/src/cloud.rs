use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use tracing::{info, warn};

use simmer_base::{err, Error, Result};

const INSTANCE_ID_FILE: &str = "instance_id.txt";
const TERMINATED_INSTANCES_FILE: &str = "terminated_instances.txt";

/// The fault-injection side channel: terminate a named cloud node
/// mid-run so the orchestrator recreates it and the solver's recovery
/// path gets exercised against a real loss. Terminations are recorded
/// in an append-only file *before* they are issued, so a rerun of the
/// same logical iteration observes the record and does not kill the
/// node a second time.
#[derive(Clone, Debug)]
pub struct Cloud {
    dir: PathBuf,
    aws: String,
}

impl Cloud {
    pub fn new(dir: PathBuf) -> Cloud {
        Cloud {
            dir,
            aws: "aws".to_string(),
        }
    }

    /// Point at something other than the real `aws` CLI.
    pub fn with_command(dir: PathBuf, aws: impl Into<String>) -> Cloud {
        Cloud {
            dir,
            aws: aws.into(),
        }
    }

    fn instance_id_file(&self) -> PathBuf {
        self.dir.join(INSTANCE_ID_FILE)
    }
    fn terminated_file(&self) -> PathBuf {
        self.dir.join(TERMINATED_INSTANCES_FILE)
    }

    pub fn was_instance_already_terminated(&self, instance_name: &str) -> bool {
        match std::fs::read_to_string(self.terminated_file()) {
            Ok(s) => s.lines().any(|l| l.trim() == instance_name),
            Err(_) => false,
        }
    }

    /// Look up the running instance with the given Name tag and
    /// terminate it. No-op when the lookup comes back empty (the node
    /// is already gone or never existed).
    pub fn terminate_instance(&self, instance_name: &str) -> Result<()> {
        let out = Command::new(&self.aws)
            .args([
                "ec2",
                "describe-instances",
                "--filters",
                &format!("Name=tag:Name,Values={}", instance_name),
                "--filters",
                "Name=instance-state-name,Values=running",
                "--query",
                "Reservations[*].Instances[*].InstanceId",
                "--output",
                "text",
            ])
            .output()
            .map_err(Error::new)?;
        std::fs::write(self.instance_id_file(), &out.stdout).map_err(Error::new)?;

        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !id.is_empty() {
            // Record first: if we crash between the record and the
            // terminate call, the worst case is a node that survived,
            // not one that gets killed twice.
            self.record_termination(instance_name)?;
            info!("terminating instance {} ({})", instance_name, id);
            Command::new(&self.aws)
                .args(["ec2", "terminate-instances", "--instance-ids", &id])
                .output()
                .map_err(Error::new)?;
        } else {
            warn!("no running instance named {}", instance_name);
        }
        if let Err(e) = std::fs::remove_file(self.instance_id_file()) {
            warn!("could not remove {}: {}", INSTANCE_ID_FILE, e);
        }
        Ok(())
    }

    fn record_termination(&self, instance_name: &str) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.terminated_file())
            .map_err(Error::new)?;
        writeln!(f, "{}", instance_name).map_err(Error::new)?;
        Ok(())
    }

    /// End-of-run cleanup of the idempotence log.
    pub fn remove_terminated_instances_file(&self) -> Result<()> {
        match std::fs::remove_file(self.terminated_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(err(format!(
                "could not remove {}: {}",
                TERMINATED_INSTANCES_FILE, e
            ))),
        }
    }
}
