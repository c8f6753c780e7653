//! Lifecycle hooks.
//!
//! Hooks are plain closures grouped by [`HookKind`]. Registration appends,
//! never replaces, and invocation follows registration order.

use crate::cluster::ClusterInfo;
use crate::error::WatchJobError;
use std::fmt;
use std::sync::Arc;

type Callback = Arc<dyn Fn(&ClusterInfo, Option<&WatchJobError>) + Send + Sync>;

/// Lifecycle event a hook is fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// The session survived the grace period
    Succeeded,
    /// The launch failed
    Failed,
    /// The session was stopped
    Stopped,
}

/// A set of optional callbacks, one per [`HookKind`].
///
/// Callbacks run synchronously on the task calling the lifecycle operation
/// and must not panic.
///
/// ```
/// use watch_job::HookHandler;
///
/// let handler = HookHandler::new()
///     .on_succeeded(|cluster| println!("{} is watched", cluster.key))
///     .on_stopped(|cluster| println!("{} stopped", cluster.key));
/// ```
#[derive(Default)]
pub struct HookHandler {
    succeeded: Option<Box<dyn Fn(&ClusterInfo) + Send + Sync>>,
    failed: Option<Box<dyn Fn(&ClusterInfo, &WatchJobError) + Send + Sync>>,
    stopped: Option<Box<dyn Fn(&ClusterInfo) + Send + Sync>>,
}

impl HookHandler {
    /// Creates an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after a launch survives the grace period.
    #[must_use]
    pub fn on_succeeded(mut self, f: impl Fn(&ClusterInfo) + Send + Sync + 'static) -> Self {
        self.succeeded = Some(Box::new(f));
        self
    }

    /// Called with the launch error when a launch fails.
    #[must_use]
    pub fn on_failed(mut self, f: impl Fn(&ClusterInfo, &WatchJobError) + Send + Sync + 'static) -> Self {
        self.failed = Some(Box::new(f));
        self
    }

    /// Called once per stopped session.
    #[must_use]
    pub fn on_stopped(mut self, f: impl Fn(&ClusterInfo) + Send + Sync + 'static) -> Self {
        self.stopped = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for HookHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandler")
            .field("succeeded", &self.succeeded.is_some())
            .field("failed", &self.failed.is_some())
            .field("stopped", &self.stopped.is_some())
            .finish()
    }
}

/// Ordered hook lists for the three lifecycle events.
#[derive(Default, Clone)]
pub(crate) struct HookRegistry {
    succeeded: Vec<Callback>,
    failed: Vec<Callback>,
    stopped: Vec<Callback>,
}

impl HookRegistry {
    /// Appends every callback present in `handler` to its kind's list.
    pub(crate) fn register(&mut self, handler: HookHandler) {
        let HookHandler {
            succeeded,
            failed,
            stopped,
        } = handler;

        if let Some(f) = succeeded {
            self.succeeded.push(Arc::new(move |info, _| f(info)));
        }
        if let Some(f) = failed {
            self.failed.push(Arc::new(move |info, err| {
                if let Some(err) = err {
                    f(info, err);
                }
            }));
        }
        if let Some(f) = stopped {
            self.stopped.push(Arc::new(move |info, _| f(info)));
        }
    }

    /// Invokes every hook of `kind` in registration order.
    pub(crate) fn fire(&self, kind: HookKind, info: &ClusterInfo, err: Option<&WatchJobError>) {
        let hooks = match kind {
            HookKind::Succeeded => &self.succeeded,
            HookKind::Failed => &self.failed,
            HookKind::Stopped => &self.stopped,
        };
        for hook in hooks {
            hook(info, err);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::Succeeded => self.succeeded.len(),
            HookKind::Failed => self.failed.len(),
            HookKind::Stopped => self.stopped.len(),
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("succeeded", &self.succeeded.len())
            .field("failed", &self.failed.len())
            .field("stopped", &self.stopped.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_hooks_fire_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::default();

        for name in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            registry.register(HookHandler::new().on_succeeded(move |info| {
                calls.lock().unwrap().push(format!("{name}:{}", info.key));
            }));
        }

        registry.fire(HookKind::Succeeded, &ClusterInfo::new("https://a", "", "c1"), None);
        assert_eq!(*calls.lock().unwrap(), vec!["first:c1", "second:c1", "third:c1"]);
    }

    #[test]
    fn test_missing_callbacks_are_omitted() {
        let mut registry = HookRegistry::default();
        registry.register(HookHandler::new().on_stopped(|_| {}));
        registry.register(HookHandler::new().on_failed(|_, _| {}).on_stopped(|_| {}));

        assert_eq!(registry.len(HookKind::Succeeded), 0);
        assert_eq!(registry.len(HookKind::Failed), 1);
        assert_eq!(registry.len(HookKind::Stopped), 2);
    }

    #[test]
    fn test_failed_hook_receives_error() {
        let seen = Arc::new(Mutex::new(None));
        let mut registry = HookRegistry::default();
        let sink = Arc::clone(&seen);
        registry.register(HookHandler::new().on_failed(move |info, err| {
            *sink.lock().unwrap() = Some(format!("{}: {}", info.key, err));
        }));

        registry.fire(
            HookKind::Failed,
            &ClusterInfo::new("https://a", "", "c1"),
            Some(&WatchJobError::ShutDown),
        );
        assert_eq!(seen.lock().unwrap().as_deref(), Some("c1: watch job has been shut down"));
    }

    #[test]
    fn test_fire_without_hooks_is_noop() {
        let registry = HookRegistry::default();
        registry.fire(HookKind::Stopped, &ClusterInfo::new("https://a", "", "c1"), None);
    }
}
