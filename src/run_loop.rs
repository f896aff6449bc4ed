//! The red/green cycle
//!
//! ```text
//! Discovering -> Executing -> (red) Discovering
//!                          -> (green, full suite owed) reset -> Discovering
//!                          -> (green) AwaitingChanges -> Discovering
//! any state -> Interrupted -> Discovering | Quitting
//! ```
//!
//! A failing cycle keeps re-running the failing subset plus whatever the
//! latest edits touch. Once that subset passes, the whole suite runs once
//! more before the loop settles.

use anyhow::Result;
use chrono::Local;
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;

use crate::command::{CommandBuilder, TestCommand};
use crate::config::Config;
use crate::file_index::{Exclusions, FileIndex, Snapshot};
use crate::hooks::{HookEvent, HookRegistry};
use crate::ledger::FailureLedger;
use crate::mapping::{class_map, MappingResolver};
use crate::runner::CommandRunner;
use crate::server::{ResultServer, ResultSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Discovering,
    Executing,
    AwaitingChanges,
    Interrupted,
    Quitting,
}

/// Known test files and the class -> file table, as printed by `--debug`
#[derive(Debug, Clone, Default)]
pub struct DebugReport {
    pub test_files: Vec<String>,
    pub class_map: BTreeMap<String, String>,
}

pub struct RunLoop<'a, R: CommandRunner> {
    config: &'a Config,
    index: FileIndex,
    resolver: MappingResolver,
    hooks: HookRegistry,
    sink: Arc<ResultSink>,
    server: Option<ResultServer>,
    builder: CommandBuilder,
    runner: R,
    interrupts: mpsc::UnboundedReceiver<()>,
    snapshot: Snapshot,
    state: RunState,
    /// Armed by the first interrupt, disarmed by a green cycle
    interrupted: bool,
    /// Something failed (or only a subset ran) since the last reset
    needs_full_run: bool,
}

impl<'a, R: CommandRunner> RunLoop<'a, R> {
    pub fn new(
        config: &'a Config,
        root: &Path,
        sink: Arc<ResultSink>,
        runner: R,
        interrupts: mpsc::UnboundedReceiver<()>,
    ) -> Result<Self> {
        let mut exclusions = Exclusions::new();
        for pattern in &config.watch.exclude {
            exclusions.add(pattern.as_str());
        }
        let index = FileIndex::new(
            root,
            &config.watch.directories,
            &config.watch.extra_files,
            exclusions.compile()?,
        );

        let mut resolver = MappingResolver::with_defaults()?;
        resolver.add_configured(&config.mappings)?;

        Ok(Self {
            config,
            index,
            resolver,
            hooks: HookRegistry::new(),
            sink,
            server: None,
            builder: CommandBuilder::new(TestCommand::from_config(config), std::process::id()),
            runner,
            interrupts,
            snapshot: Snapshot::new(),
            state: RunState::Discovering,
            interrupted: false,
            needs_full_run: false,
        })
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Session id passed to children as `--server`
    pub fn with_session(mut self, session: u32) -> Self {
        self.builder = self.builder.with_session(session);
        self
    }

    /// Directory holding the child-side reporter plugin, put first on the load path
    pub fn with_reporter_lib(mut self, dir: &str) -> Self {
        self.builder = self.builder.with_lib(dir);
        self
    }

    /// Serve results for the lifetime of [`RunLoop::run`]
    pub fn with_server(mut self, server: ResultServer) -> Self {
        self.server = Some(server);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn ledger(&self) -> &FailureLedger {
        self.sink.ledger()
    }

    fn quiet(&self) -> bool {
        self.config.run.quiet
    }

    pub fn debug_report(&mut self) -> DebugReport {
        self.index.scan();
        let class_map = class_map(self.index.known(), &self.config.extra_class_map);
        let mut test_files: Vec<String> = class_map.values().cloned().collect();
        test_files.sort();
        test_files.dedup();

        DebugReport { test_files, class_map }
    }

    /// Run until the operator quits. The result server, if any, is stopped on every exit path.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(server) = self.server.as_mut() {
            server.start().await?;
        }

        let result = self.run_cycles().await;

        if let Some(server) = self.server.as_mut() {
            server.stop().await;
        }
        result
    }

    async fn run_cycles(&mut self) -> Result<()> {
        self.hooks.fire(&HookEvent::Initialize);
        self.hooks.fire(&HookEvent::PostInitialize);

        self.reset();
        if self.config.run.no_full_after_start {
            self.snapshot.set(SystemTime::now());
        }

        loop {
            match self.drive().await {
                Ok(()) => break,
                Err(error) => {
                    if !self.hooks.fire(&HookEvent::Died { error: &error }) {
                        return Err(error);
                    }
                    tracing::error!("died hook took over after: {:#}", error);
                    self.reset();
                    self.state = RunState::Discovering;
                }
            }
        }

        self.hooks.fire(&HookEvent::Quit);
        Ok(())
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            if !matches!(self.state, RunState::Interrupted | RunState::Quitting) && self.take_interrupt() {
                self.state = RunState::Interrupted;
            }

            tracing::trace!(state = ?self.state, "run loop step");
            self.state = match self.state {
                RunState::Discovering => self.discover(),
                RunState::Executing => self.execute().await?,
                RunState::AwaitingChanges => self.await_changes().await,
                RunState::Interrupted => self.handle_interrupt().await,
                RunState::Quitting => return Ok(()),
            };
        }
    }

    fn take_interrupt(&mut self) -> bool {
        self.interrupts.try_recv().is_ok()
    }

    /// Forget every failure and every file seen, so the next discovery selects the whole suite.
    /// Reports still arriving from a cancelled child are dropped until the next spawn.
    pub fn reset(&mut self) {
        tracing::debug!("reset");
        self.sink.close();
        self.ledger().clear();
        self.snapshot.reset();
        self.needs_full_run = false;
        self.hooks.fire(&HookEvent::Reset);
    }

    fn discover(&mut self) -> RunState {
        let records = self.index.scan();
        let changed: Vec<String> = self
            .snapshot
            .changed(&records)
            .into_iter()
            .map(|r| r.path.clone())
            .collect();

        if changed.is_empty() {
            return RunState::AwaitingChanges;
        }

        if !self.snapshot.is_initial() {
            tracing::info!(files = ?changed, "files changed");
            if self.config.run.verbose && !self.quiet() {
                println!("{} {}", "Files changed:".bold(), changed.join(", ").dimmed());
            }
            self.hooks.fire(&HookEvent::Updated { files: &changed });
        }

        for path in &changed {
            for test in self.resolver.resolve(path, self.index.known()) {
                self.ledger().ensure_tracked(&test);
            }
        }

        self.snapshot.advance(&records);
        RunState::Executing
    }

    async fn execute(&mut self) -> Result<RunState> {
        let ledger = self.ledger().snapshot();
        if self.config.run.debug {
            tracing::debug!(files = ?ledger.failures.keys().collect::<Vec<_>>(), "files to test");
        }

        let commands = self.builder.build(&ledger);
        let Some(line) = commands.joined() else {
            tracing::debug!("nothing to run");
            return Ok(RunState::AwaitingChanges);
        };

        if commands.is_partial() {
            self.needs_full_run = true;
        }

        self.hooks.fire(&HookEvent::RunCommand { command: &line });
        if !self.quiet() {
            println!("{}", line.dimmed());
        }

        self.sink.arm();
        let outcome = tokio::select! {
            outcome = self.runner.run(&line) => outcome?,
            Some(()) = self.interrupts.recv() => {
                tracing::info!("interrupted while tests were running");
                return Ok(RunState::Interrupted);
            }
        };

        self.hooks.fire(&HookEvent::RanCommand { success: outcome.success });

        if !self.ledger().is_all_good() {
            self.needs_full_run = true;
            self.hooks.fire(&HookEvent::Red);
            if !self.quiet() {
                println!("{} {} failing file(s)", "✗".red(), self.ledger().pending().len());
            }
            return Ok(RunState::Discovering);
        }

        if !outcome.success {
            tracing::warn!(
                code = ?outcome.code,
                "test command exited unsuccessfully but reported no failures"
            );
        }

        self.hooks.fire(&HookEvent::Green);

        if self.needs_full_run && !self.config.run.no_full_after_failed {
            tracing::info!("failures cleared, running the full suite");
            self.reset();
            return Ok(RunState::Discovering);
        }

        self.needs_full_run = false;
        self.interrupted = false;
        self.hooks.fire(&HookEvent::AllGood);
        if !self.quiet() {
            println!("{} All tests passed ({})", "✓".green(), Local::now().format("%H:%M:%S"));
        }

        Ok(RunState::AwaitingChanges)
    }

    async fn await_changes(&mut self) -> RunState {
        self.hooks.fire(&HookEvent::Waiting);
        if !self.quiet() {
            println!("{}", "Watching for changes...".dimmed());
        }

        loop {
            tokio::select! {
                Some(()) = self.interrupts.recv() => return RunState::Interrupted,
                _ = tokio::time::sleep(self.config.watch.sleep()) => {}
            }

            let records = self.index.scan();
            if !self.snapshot.changed(&records).is_empty() {
                return RunState::Discovering;
            }
        }
    }

    async fn handle_interrupt(&mut self) -> RunState {
        if self.interrupted {
            return RunState::Quitting;
        }

        if !self.hooks.fire(&HookEvent::Interrupt) {
            self.interrupted = true;
            if !self.quiet() {
                println!("\n{}", "Interrupt a second time to quit".yellow());
            }

            tokio::select! {
                Some(()) = self.interrupts.recv() => return RunState::Quitting,
                _ = tokio::time::sleep(self.config.watch.interrupt_grace()) => {}
            }
        }

        self.reset();
        RunState::Discovering
    }
}
