//! The host-side lifecycle state machine shared by all three server back-ends.

use crate::CoreObject;

/// The five lifecycle states every back-end transitions through.
///
/// `INITIALIZE -> RUN` on success, `-> ERROR` on failure. `RUN -> CLOSE` on
/// graceful termination, `-> ERROR` on failure. `CLOSE -> EXIT` always.
/// `close` is guaranteed to run exactly once, whether `RUN` finished cleanly
/// or jumped through `ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initialize,
    Run,
    Close,
    Error,
    Exit,
}

/// Contract shared by all three concurrency back-ends. Each method returns
/// the next lifecycle state rather than propagating an error directly, so
/// that a failure can route through `close` instead of unwinding past it.
pub trait Backend {
    fn initialize(&mut self, core: &CoreObject) -> LifecycleState;
    fn run(&mut self, core: &CoreObject) -> LifecycleState;
    fn close(&mut self, core: &CoreObject) -> LifecycleState;
}

/// Drives a back-end through its lifecycle and returns the process exit code.
///
/// `close` is invoked exactly once regardless of which state led there. The
/// exit code is non-zero iff `ERROR` was observed at any point.
pub fn run_lifecycle<B: Backend>(backend: &mut B, core: &CoreObject) -> i32 {
    let mut state = LifecycleState::Initialize;
    let mut saw_error = false;

    loop {
        state = match state {
            LifecycleState::Initialize => backend.initialize(core),
            LifecycleState::Run => backend.run(core),
            LifecycleState::Close => {
                backend.close(core);
                LifecycleState::Exit
            }
            LifecycleState::Error => {
                saw_error = true;
                LifecycleState::Close
            }
            LifecycleState::Exit => break,
        };
    }

    i32::from(saw_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::logrecord::MutexLogSink;
    use std::sync::Arc;

    struct Scripted {
        steps: Vec<LifecycleState>,
        next: usize,
        close_calls: u32,
    }

    impl Backend for Scripted {
        fn initialize(&mut self, _core: &CoreObject) -> LifecycleState {
            let s = self.steps[self.next];
            self.next += 1;
            s
        }
        fn run(&mut self, _core: &CoreObject) -> LifecycleState {
            let s = self.steps[self.next];
            self.next += 1;
            s
        }
        fn close(&mut self, _core: &CoreObject) -> LifecycleState {
            self.close_calls += 1;
            LifecycleState::Exit
        }
    }

    fn dummy_core() -> CoreObject {
        CoreObject::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MutexLogSink::in_memory()),
            Settings::default(),
        )
    }

    #[test]
    fn happy_path_never_calls_close_twice() {
        let core = dummy_core();
        let mut backend = Scripted {
            steps: vec![LifecycleState::Run, LifecycleState::Close],
            next: 0,
            close_calls: 0,
        };
        let code = run_lifecycle(&mut backend, &core);
        assert_eq!(code, 0);
        assert_eq!(backend.close_calls, 1);
    }

    #[test]
    fn error_during_run_still_closes_once_and_fails() {
        let core = dummy_core();
        let mut backend = Scripted {
            steps: vec![LifecycleState::Run, LifecycleState::Error],
            next: 0,
            close_calls: 0,
        };
        let code = run_lifecycle(&mut backend, &core);
        assert_eq!(code, 1);
        assert_eq!(backend.close_calls, 1);
    }

    #[test]
    fn error_during_initialize_routes_through_close() {
        let core = dummy_core();
        let mut backend = Scripted {
            steps: vec![LifecycleState::Error],
            next: 0,
            close_calls: 0,
        };
        let code = run_lifecycle(&mut backend, &core);
        assert_eq!(code, 1);
        assert_eq!(backend.close_calls, 1);
    }
}
