//! Callbacks into the task-file subsystem, which lives outside the core.

use az_core::SessionId;

/// Hooks invoked at session lifecycle points.
///
/// The core treats `task_path` as opaque; the one coupling point is the
/// review post-processing callback, fired on completion of sessions whose
/// title begins with `Review:` or `Verify:`.
pub trait TaskHooks: Send + Sync + 'static {
    fn post_process_task_review(&self, session_id: &SessionId);
}

/// Default no-op hooks.
pub struct NoopHooks;

impl TaskHooks for NoopHooks {
    fn post_process_task_review(&self, _session_id: &SessionId) {}
}
