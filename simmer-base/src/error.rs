// Two kinds of trouble end up here: configuration mistakes (bad
// flags, a process grid that does not match the world) that should
// stop the run before it starts, and fatal runtime failures that
// abort it. Recoverable communication faults are deliberately NOT this
// type: the fabric reports those as tagged results so a driver can
// match on them and repair, and only what survives that match lands
// here. Every error takes a backtrace and a log line at creation, and
// can be stamped with the logical rank that raised it; an abort
// message from a many-rank run that does not say which rank failed is
// close to useless.

use std::borrow::Cow;
use std::fmt;

use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Wrong invocation or geometry: report and exit, no repair
    /// attempt, no world to abort.
    Config,
    /// A failure the repair protocol cannot help with: abort the run.
    Runtime,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    rank: Option<i32>,
    cause: DynBacktraceError,
}

pub type Result<T> = std::result::Result<T, Error>;

struct Text(Cow<'static, str>);
impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for Text {}

impl Error {
    fn wrap(kind: ErrorKind, err: impl std::error::Error + Send + Sync + 'static) -> Error {
        let e = Error {
            kind,
            rank: None,
            cause: DynBacktraceError::from(err),
        };
        error!(target: "simmer", "{}", e);
        e
    }

    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        Error::wrap(ErrorKind::Runtime, err)
    }

    /// A usage or geometry mistake; callers exit with the bad-argument
    /// code instead of aborting a live world.
    pub fn config(msg: impl Into<Cow<'static, str>>) -> Error {
        Error::wrap(ErrorKind::Config, Text(msg.into()))
    }

    /// Stamp the logical rank that raised this.
    pub fn at_rank(mut self, rank: i32) -> Error {
        self.rank = Some(rank);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
    pub fn is_config(&self) -> bool {
        self.kind == ErrorKind::Config
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rank {
            Some(r) => write!(f, "{:04}: {:?}", r, self.cause),
            None => write!(f, "{:?}", self.cause),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::wrap(ErrorKind::Runtime, Text(msg.into()))
}

#[test]
fn test_rank_stamp() {
    let e = err("halo strip length mismatch").at_rank(3);
    assert_eq!(e.kind(), ErrorKind::Runtime);
    assert!(format!("{}", e).starts_with("0003: "));
    assert!(!format!("{}", err("unstamped")).starts_with("0000"));
}

#[test]
fn test_config_kind() {
    let c = Error::config("missing number of processes per row");
    assert!(c.is_config());
    let r: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
    assert!(!r.is_config());
}
