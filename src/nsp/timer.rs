use std::time::Duration;

// Persist timer backoff, indexed by the connection's backoff shift. The
// shift is reset whenever a message is received, so a healthy link always
// sits at the head of the table.
const NSP_PERSIST_MAXSHIFT: usize = 6;
const NSP_PERSIST_BACKOFF: [u64; NSP_PERSIST_MAXSHIFT + 1] = [1, 2, 4, 8, 16, 32, 64];
// NSP_PERSIST_* are all msec.
const NSP_PERSIST_BASE: u64 = 1_000;
const NSP_PERSIST_MAX: u64 = 64_000;

/// What to do when the persist timer fires. Terminal FSM transitions
/// install `Destroy` so late duplicates are still rejected cleanly before
/// the connection is reaped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PersistAction {
    #[default]
    None,
    Keepalive,
    Destroy,
}

/// Per-connection timer fields. Expiry is driven by an external timer
/// wheel; the engine only arms and clears them.
#[derive(Debug, Default)]
pub struct NspTimer {
    pub persist: Option<Duration>,
    pub persist_action: PersistAction,
    pub conn: Option<Duration>,
    pub ack_delay: Option<Duration>,
}

impl NspTimer {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn clear_persist(&mut self) {
        self.persist = None;
        self.persist_action = PersistAction::None;
    }

    /// Arm the destroy timer with a delay scaled by the link's backoff
    /// shift, so a flapping peer does not make us churn state blocks.
    pub fn fire_destroy(&mut self, rxt_shift: usize) {
        self.persist = Some(persist_delay(rxt_shift));
        self.persist_action = PersistAction::Destroy;
    }

    pub fn fire_conn(&mut self, secs: u64) {
        self.conn = Some(Duration::from_secs(secs));
    }

    pub fn clear_conn(&mut self) {
        self.conn = None;
    }

    pub fn fire_ack_delay(&mut self, delay: Duration) {
        self.ack_delay = Some(delay);
    }

    pub fn clear_ack_delay(&mut self) {
        self.ack_delay = None;
    }
}

pub fn persist_delay(rxt_shift: usize) -> Duration {
    let shift = std::cmp::min(rxt_shift, NSP_PERSIST_MAXSHIFT);
    let delta = std::cmp::min(NSP_PERSIST_BASE * NSP_PERSIST_BACKOFF[shift], NSP_PERSIST_MAX);
    Duration::from_millis(delta)
}
