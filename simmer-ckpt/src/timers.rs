/// Diagnostic timers persisted across checkpoints in debug mode. The
/// field order is the trailer order in the checkpoint payload; do not
/// reorder.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timers {
    pub total_wf_time: f64,
    pub terminate_instances: f64,
    pub store_init: f64,
    pub have_restart: f64,
    pub start_restart: f64,
    pub route_file: f64,
    pub complete_restart: f64,
    pub need_checkpoint: f64,
    pub start_output: f64,
    pub complete_output: f64,
}

pub(crate) const TIMER_COUNT: usize = 10;

impl Timers {
    pub fn as_array(&self) -> [f64; TIMER_COUNT] {
        [
            self.total_wf_time,
            self.terminate_instances,
            self.store_init,
            self.have_restart,
            self.start_restart,
            self.route_file,
            self.complete_restart,
            self.need_checkpoint,
            self.start_output,
            self.complete_output,
        ]
    }

    pub fn from_array(a: [f64; TIMER_COUNT]) -> Timers {
        Timers {
            total_wf_time: a[0],
            terminate_instances: a[1],
            store_init: a[2],
            have_restart: a[3],
            start_restart: a[4],
            route_file: a[5],
            complete_restart: a[6],
            need_checkpoint: a[7],
            start_output: a[8],
            complete_output: a[9],
        }
    }

    /// Fold a restored trailer into the live accumulators, so timings
    /// survive restarts the same way the solution does.
    pub fn absorb(&mut self, other: &Timers) {
        let mine = self.as_array();
        let theirs = other.as_array();
        let mut out = [0.0; TIMER_COUNT];
        for i in 0..TIMER_COUNT {
            out[i] = mine[i] + theirs[i];
        }
        *self = Timers::from_array(out);
    }
}
