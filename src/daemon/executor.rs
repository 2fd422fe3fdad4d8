//! Recovery action dispatch.
//!
//! Actions run as detached `sh -c` children so a slow or wedged command
//! (a hanging `systemctl restart`, say) can never stall the tick loop.
//! A reaper thread waits on each child and logs its exit status; the
//! verification delay, not the exit code, decides whether the action
//! actually helped.

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use crate::core::config::CommandBindings;
use crate::core::errors::{KwdError, Result};
use crate::core::state::Action;
use crate::logger::{Event, EventLevel, EventLog};

/// Seam between the escalation plane and the host. Production uses
/// [`ShellRunner`]; tests substitute a recording fake.
pub trait CommandRunner: Send {
    /// Launch `command` for `action` without waiting for it to finish.
    /// An `Err` means the process could not even be spawned.
    fn dispatch(&mut self, action: Action, command: &str) -> Result<()>;
}

/// Spawns `sh -c <command>` detached, with a reaper thread per child.
pub struct ShellRunner {
    log: Arc<EventLog>,
}

impl ShellRunner {
    /// Build a runner that reports child exit statuses to `log`.
    #[must_use]
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }
}

impl CommandRunner for ShellRunner {
    fn dispatch(&mut self, action: Action, command: &str) -> Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| KwdError::CommandSpawn {
                action: action.name(),
                details: err.to_string(),
            })?;

        let log = Arc::clone(&self.log);
        let rendered = command.to_string();
        thread::Builder::new()
            .name(format!("kwd-reap-{action}"))
            .spawn(move || {
                let event = match child.wait() {
                    Ok(status) if status.success() => Event::new(
                        "executor",
                        EventLevel::Info,
                        "command_exited",
                        format!("{action} command exited cleanly"),
                    ),
                    Ok(status) => Event::new(
                        "executor",
                        EventLevel::Warning,
                        "command_exit_nonzero",
                        format!("{action} command exited with {status}"),
                    ),
                    Err(err) => Event::new(
                        "executor",
                        EventLevel::Warning,
                        "command_reap_failed",
                        format!("{action} command could not be reaped: {err}"),
                    ),
                };
                log.log(
                    &event
                        .with_action(action.name())
                        .with_details(serde_json::json!({ "command": rendered })),
                );
            })
            .map_err(|err| KwdError::CommandSpawn {
                action: action.name(),
                details: format!("reaper thread: {err}"),
            })?;
        Ok(())
    }
}

/// Binds actions to their configured shell commands and forwards them to a
/// [`CommandRunner`].
pub struct RecoveryExecutor<R> {
    runner: R,
    commands: CommandBindings,
}

impl<R: CommandRunner> RecoveryExecutor<R> {
    /// Build an executor over validated command bindings.
    pub const fn new(runner: R, commands: CommandBindings) -> Self {
        Self { runner, commands }
    }

    /// Dispatch the bound command for `action`.
    pub fn dispatch(&mut self, action: Action) -> Result<()> {
        // Resolve off the bindings field alone so the runner stays free
        // for the mutable dispatch call.
        let command = Self::resolve(&self.commands, action);
        self.runner.dispatch(action, command)
    }

    /// The underlying runner.
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Mutable access to the underlying runner.
    pub const fn runner_mut(&mut self) -> &mut R {
        &mut self.runner
    }

    /// Configured shell command for `action`.
    #[must_use]
    pub fn binding(&self, action: Action) -> &str {
        Self::resolve(&self.commands, action)
    }

    fn resolve(commands: &CommandBindings, action: Action) -> &str {
        match action {
            Action::SoftReload => &commands.soft_reload,
            Action::BrowserRestart => &commands.browser_restart,
            Action::SessionRestart => &commands.session_restart,
            Action::ServiceRestart => &commands.service_restart,
            Action::Reboot => &commands.reboot,
        }
    }
}
