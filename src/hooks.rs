//! Hook dispatch: a named event (`SERVICE_{START,STOP}_{IN,NOW,DONE,OUT}`)
//! fired to the plugin host. The plugin host itself is an external
//! collaborator (out of scope); this module defines the trait seam and a
//! logging no-op implementation, the usual shape for an optional
//! collaborator kept behind a trait object.

use tracing::debug;

/// Receiver of lifecycle hook events. `Sync` so a shared host can be handed
/// to concurrently-running peer starts/stops (§4.8 "parallel iff
/// `rc_parallel`").
pub trait HookHost: Sync {
    fn fire(&self, hook: &str, svc: &str);
}

/// Default hook host: logs the event and does nothing else. A real plugin
/// host is an external collaborator out of scope for this core.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHookHost;

impl HookHost for NoopHookHost {
    fn fire(&self, hook: &str, svc: &str) {
        debug!(service = svc, hook, "firing hook");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost(Mutex<Vec<String>>);

    impl HookHost for RecordingHost {
        fn fire(&self, hook: &str, _svc: &str) {
            self.0.lock().unwrap().push(hook.to_string());
        }
    }

    #[test]
    fn records_fired_hooks_in_order() {
        let host = RecordingHost::default();
        host.fire(crate::constants::hooks::SERVICE_START_IN, "svc");
        host.fire(crate::constants::hooks::SERVICE_START_NOW, "svc");
        assert_eq!(host.0.into_inner().unwrap(), vec!["SERVICE_START_IN", "SERVICE_START_NOW"]);
    }
}
