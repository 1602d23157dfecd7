//! Process-wide snapshot activation with last-known-good retention.
//!
//! The activator owns the single mutable slot holding the active
//! [`RuntimeSnapshot`]. Activations are serialized; a runtime reload that
//! fails keeps the previous snapshot serving and flips the activator into a
//! degraded state until the next successful activation.

use super::snapshot::RuntimeSnapshot;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::{error, info, warn};

/// Event code: a runtime reload failed while a previous snapshot keeps serving.
pub const SECRETS_RELOADER_DEGRADED: &str = "SECRETS_RELOADER_DEGRADED";
/// Event code: a reload succeeded after the activator had degraded.
pub const SECRETS_RELOADER_RECOVERED: &str = "SECRETS_RELOADER_RECOVERED";

/// What drove an activation attempt. Startup failures are fatal to the
/// caller; reload failures degrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationTrigger {
    Startup,
    Reload,
}

type EventListener = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ActivatorState {
    active: Option<Arc<RuntimeSnapshot>>,
    degraded: bool,
}

/// Serialized owner of the active-snapshot slot.
#[derive(Default)]
pub struct SecretsActivator {
    state: Mutex<ActivatorState>,
    degraded_listeners: Mutex<Vec<EventListener>>,
    recovered_listeners: Mutex<Vec<EventListener>>,
}

/// The process-wide activator instance.
pub static SECRETS_ACTIVATOR: LazyLock<SecretsActivator> = LazyLock::new(SecretsActivator::default);

impl SecretsActivator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the active slot to `snapshot` and return the view consumers see.
    ///
    /// A snapshot older than the currently active one loses the race and is
    /// dropped. A successful swap out of the degraded state emits
    /// `SECRETS_RELOADER_RECOVERED` exactly once.
    pub fn activate(&self, snapshot: RuntimeSnapshot) -> Arc<RuntimeSnapshot> {
        let snapshot = Arc::new(snapshot);
        let (winner, recovered) = {
            let mut state = self.state.lock();
            match &state.active {
                Some(current) if snapshot.resolved_at < current.resolved_at => {
                    (current.clone(), false)
                }
                _ => {
                    state.active = Some(snapshot.clone());
                    let recovered = state.degraded;
                    state.degraded = false;
                    (snapshot, recovered)
                }
            }
        };
        if recovered {
            info!("Secrets reloader recovered; new snapshot active");
            self.emit(&self.recovered_listeners, SECRETS_RELOADER_RECOVERED);
        }
        winner
    }

    /// Record a failed activation attempt.
    ///
    /// Startup failures never degrade: no snapshot was active yet and the
    /// error propagates to the caller. A reload failure keeps the previous
    /// snapshot and emits `SECRETS_RELOADER_DEGRADED` on the first failure
    /// only; later failures while degraded just log.
    pub fn record_failure(&self, trigger: ActivationTrigger, error: &anyhow::Error) {
        if trigger == ActivationTrigger::Startup {
            return;
        }
        let newly_degraded = {
            let mut state = self.state.lock();
            if state.degraded {
                false
            } else {
                state.degraded = true;
                true
            }
        };
        if newly_degraded {
            warn!("Secrets reload failed; keeping last-known-good snapshot: {error:#}");
            self.emit(&self.degraded_listeners, SECRETS_RELOADER_DEGRADED);
        } else {
            error!("Secrets reload failed while degraded: {error:#}");
        }
    }

    /// Immutable view of the active snapshot, if any.
    pub fn active(&self) -> Option<Arc<RuntimeSnapshot>> {
        self.state.lock().active.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    /// Test-only teardown: drop the active snapshot and degraded flag.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.active = None;
        state.degraded = false;
    }

    pub fn on_degraded(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.degraded_listeners.lock().push(Box::new(listener));
    }

    pub fn on_recovered(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.recovered_listeners.lock().push(Box::new(listener));
    }

    fn emit(&self, listeners: &Mutex<Vec<EventListener>>, code: &str) {
        for listener in listeners.lock().iter() {
            listener(code);
        }
    }

    /// Activate the outcome of a snapshot build under this activator's
    /// failure policy: success swaps the slot, failure is recorded per the
    /// trigger and propagated.
    pub fn apply_build_result(
        &self,
        built: Result<RuntimeSnapshot>,
        trigger: ActivationTrigger,
    ) -> Result<Arc<RuntimeSnapshot>> {
        match built {
            Ok(snapshot) => Ok(self.activate(snapshot)),
            Err(error) => {
                self.record_failure(trigger, &error);
                Err(error)
            }
        }
    }
}
