//! Run status reported to `hydra-cli` and published on the event bus.
//!
//! Precedence is fixed, not lexical: `auth_failed` always wins (a fatal
//! agent auth failure needs the operator's attention even mid-shutdown),
//! then `stopping`, then `running`, then `idle`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Stopping,
    AuthFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::AuthFailed => "auth_failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure precedence rule, factored out of `Orchestrator::run_status` so it
/// can be exercised without standing up a whole orchestrator.
pub fn resolve(fatal: bool, running: bool, shutting_down: bool) -> RunStatus {
    if fatal {
        RunStatus::AuthFailed
    } else if running {
        if shutting_down {
            RunStatus::Stopping
        } else {
            RunStatus::Running
        }
    } else {
        RunStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failed_wins_over_everything() {
        assert_eq!(resolve(true, true, true), RunStatus::AuthFailed);
        assert_eq!(resolve(true, false, false), RunStatus::AuthFailed);
    }

    #[test]
    fn stopping_only_while_still_running() {
        assert_eq!(resolve(false, true, true), RunStatus::Stopping);
        assert_eq!(resolve(false, false, true), RunStatus::Idle);
    }

    #[test]
    fn running_and_idle() {
        assert_eq!(resolve(false, true, false), RunStatus::Running);
        assert_eq!(resolve(false, false, false), RunStatus::Idle);
    }
}
