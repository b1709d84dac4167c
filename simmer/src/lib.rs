// The solver executables and their iteration drivers.
//
// `driver` is the fault-tolerant SOR/Jacobi driver: halo exchange,
// sweep, convergence reduction, periodic checkpoint, and a restart
// point that communication faults unwind to. `heat` is the simpler
// heat-equation driver with a gather and an ASCII output file. `halo`
// is the eight-transfer ghost refresh they build on, and `cloud` is the
// side channel used to inject real node failures when running under a
// cloud orchestrator.

pub mod cloud;
pub mod driver;
pub mod halo;
pub mod heat;

pub use cloud::Cloud;
pub use driver::{jacobi_cpu, Backend, KillPlan, Outcome, SolveOpts};
pub use heat::{heat_solve, HeatOutcome, HeatParams};
