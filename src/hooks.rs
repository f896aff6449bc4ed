//! Named extension points
//!
//! Handlers are registered per hook and invoked in registration order until
//! one reports the event as handled.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::runner::shell_command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Initialize,
    PostInitialize,
    RunCommand,
    RanCommand,
    Red,
    Green,
    AllGood,
    Waiting,
    Updated,
    Interrupt,
    Reset,
    Died,
    Quit,
}

impl Hook {
    pub const ALL: [Hook; 13] = [
        Hook::Initialize,
        Hook::PostInitialize,
        Hook::RunCommand,
        Hook::RanCommand,
        Hook::Red,
        Hook::Green,
        Hook::AllGood,
        Hook::Waiting,
        Hook::Updated,
        Hook::Interrupt,
        Hook::Reset,
        Hook::Died,
        Hook::Quit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Initialize => "initialize",
            Hook::PostInitialize => "post_initialize",
            Hook::RunCommand => "run_command",
            Hook::RanCommand => "ran_command",
            Hook::Red => "red",
            Hook::Green => "green",
            Hook::AllGood => "all_good",
            Hook::Waiting => "waiting",
            Hook::Updated => "updated",
            Hook::Interrupt => "interrupt",
            Hook::Reset => "reset",
            Hook::Died => "died",
            Hook::Quit => "quit",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hook {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hook::ALL
            .iter()
            .copied()
            .find(|hook| hook.as_str() == s)
            .ok_or_else(|| format!("unknown hook '{}'", s))
    }
}

/// An event together with the context handed to handlers
#[derive(Debug)]
pub enum HookEvent<'a> {
    Initialize,
    PostInitialize,
    RunCommand { command: &'a str },
    RanCommand { success: bool },
    Red,
    Green,
    AllGood,
    Waiting,
    Updated { files: &'a [String] },
    Interrupt,
    Reset,
    Died { error: &'a anyhow::Error },
    Quit,
}

impl HookEvent<'_> {
    pub fn hook(&self) -> Hook {
        match self {
            HookEvent::Initialize => Hook::Initialize,
            HookEvent::PostInitialize => Hook::PostInitialize,
            HookEvent::RunCommand { .. } => Hook::RunCommand,
            HookEvent::RanCommand { .. } => Hook::RanCommand,
            HookEvent::Red => Hook::Red,
            HookEvent::Green => Hook::Green,
            HookEvent::AllGood => Hook::AllGood,
            HookEvent::Waiting => Hook::Waiting,
            HookEvent::Updated { .. } => Hook::Updated,
            HookEvent::Interrupt => Hook::Interrupt,
            HookEvent::Reset => Hook::Reset,
            HookEvent::Died { .. } => Hook::Died,
            HookEvent::Quit => Hook::Quit,
        }
    }
}

/// Something that reacts to a hook. Returning `true` claims the event.
pub trait HookHandler: Send + Sync {
    fn handle(&self, event: &HookEvent<'_>) -> bool;
}

impl<F> HookHandler for F
where
    F: Fn(&HookEvent<'_>) -> bool + Send + Sync,
{
    fn handle(&self, event: &HookEvent<'_>) -> bool {
        self(event)
    }
}

#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<Hook, Vec<Box<dyn HookHandler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`ShellHook`] per `[hooks]` entry
    pub fn from_config(hooks: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for (name, command) in hooks {
            let hook: Hook = name.parse().map_err(anyhow::Error::msg)?;
            tracing::debug!(%hook, command, "registered shell hook");
            registry.add(hook, ShellHook::new(command.as_str()));
        }
        Ok(registry)
    }

    pub fn add(&mut self, hook: Hook, handler: impl HookHandler + 'static) {
        self.handlers.entry(hook).or_default().push(Box::new(handler));
    }

    /// Invoke handlers for the event's hook until one handles it.
    /// Returns `false` when nothing claimed the event.
    pub fn fire(&self, event: &HookEvent<'_>) -> bool {
        let hook = event.hook();
        tracing::trace!(%hook, "firing hook");

        self.handlers
            .get(&hook)
            .is_some_and(|handlers| handlers.iter().any(|h| h.handle(event)))
    }

    pub fn count(&self, hook: Hook) -> usize {
        self.handlers.get(&hook).map_or(0, Vec::len)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(hook, handlers)| (hook.as_str(), handlers.len()))
            .collect();
        f.debug_struct("HookRegistry").field("handlers", &counts).finish()
    }
}

/// Starts a shell command when its hook fires and lets it run in the
/// background. Never claims the event, and never blocks the run loop.
#[derive(Debug, Clone)]
pub struct ShellHook {
    command: String,
}

impl ShellHook {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

impl HookHandler for ShellHook {
    fn handle(&self, event: &HookEvent<'_>) -> bool {
        let hook = event.hook();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%hook, command = %self.command, "no runtime to run hook command on");
            return false;
        };

        let mut cmd = shell_command(&self.command);
        cmd.env("AUTOTEST_EVENT", hook.as_str());
        if let HookEvent::RunCommand { command } = event {
            cmd.env("AUTOTEST_COMMAND", command);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(%hook, command = %self.command, "could not run hook command: {}", e);
                return false;
            }
        };

        let command = self.command.clone();
        runtime.spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    tracing::warn!(%hook, %command, %status, "hook command failed");
                }
                Err(e) => tracing::warn!(%hook, %command, "hook command did not finish: {}", e),
                Ok(_) => {}
            }
        });

        false
    }
}
