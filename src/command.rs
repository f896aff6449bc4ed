//! Test command synthesis
//!
//! Turns the failure ledger into at most two interpreter invocations: one that
//! requires every fully-tracked file, and one that loads the partially-tracked
//! files and filters down to the failing `Class#method` pairs.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::Config;
use crate::ledger::LedgerSnapshot;

/// Separator that runs two commands back to back in one shell session
pub const SEP: &str = if cfg!(windows) { "&" } else { ";" };

const LIB_SEP: &str = if cfg!(windows) { ";" } else { ":" };

/// Quote `arg` as a single word for the platform shell
pub fn shell_quote(arg: &str) -> String {
    if cfg!(windows) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Interpreter settings shared by both command shapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub ruby: String,
    pub libs: String,
    pub prefix: String,
    pub test_prefix: String,
    pub testlib: String,
}

impl TestCommand {
    pub fn from_config(config: &Config) -> Self {
        let ruby = if cfg!(windows) {
            config.command.ruby.replace('/', "\\")
        } else {
            config.command.ruby.clone()
        };

        Self {
            ruby,
            libs: config.libs_path(),
            prefix: config.command.prefix.clone(),
            test_prefix: config.command.test_prefix.clone(),
            testlib: config.command.testlib.clone(),
        }
    }

    fn ruby_cmd(&self) -> String {
        format!("{}{} -I{}", self.prefix, self.ruby, self.libs)
    }
}

/// The commands for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    pub full: Option<String>,
    pub partial: Option<String>,
}

impl CommandSet {
    pub fn is_empty(&self) -> bool {
        self.full.is_none() && self.partial.is_none()
    }

    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn commands(&self) -> Vec<&str> {
        self.full.iter().chain(self.partial.iter()).map(String::as_str).collect()
    }

    /// Both commands as one shell line, or `None` when there is nothing to run
    pub fn joined(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.commands().join(&format!("{} ", SEP)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    settings: TestCommand,
    session: u32,
}

impl CommandBuilder {
    /// `session` is handed to the child so it can find our result server
    pub fn new(settings: TestCommand, session: u32) -> Self {
        Self { settings, session }
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn with_session(mut self, session: u32) -> Self {
        self.session = session;
        self
    }

    /// Put `dir` first on the interpreter's load path
    pub fn with_lib(mut self, dir: &str) -> Self {
        self.settings.libs = if self.settings.libs.is_empty() {
            dir.to_string()
        } else {
            format!("{}{}{}", dir, LIB_SEP, self.settings.libs)
        };
        self
    }

    pub fn build(&self, ledger: &LedgerSnapshot) -> CommandSet {
        self.build_with_rng(ledger, &mut rand::rng())
    }

    /// File order is shuffled on every call to shake out order-dependent tests
    pub fn build_with_rng<R: Rng + ?Sized>(&self, ledger: &LedgerSnapshot, rng: &mut R) -> CommandSet {
        let mut full = ledger.full();
        let mut partial = ledger.partial();
        full.shuffle(rng);
        partial.shuffle(rng);

        let full = if full.is_empty() {
            None
        } else {
            let requires = std::iter::once(self.settings.testlib.as_str())
                .chain(full.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");

            Some(format!(
                "{} -e \"{}; %w[{}].each {{ |f| require f }}\" -- --server {}",
                self.settings.ruby_cmd(),
                self.settings.test_prefix,
                requires,
                self.session
            ))
        };

        let partial = if partial.is_empty() {
            None
        } else {
            let mut files: Vec<&str> = partial.iter().map(|(file, _)| *file).collect();
            files.sort();

            let filter = partial
                .iter()
                .flat_map(|(_, classes)| classes.iter())
                .map(|(class_name, methods)| {
                    let methods = methods.iter().map(|m| regex::escape(m)).collect::<Vec<_>>().join("|");
                    format!("{}#(?:{})", regex::escape(class_name), methods)
                })
                .collect::<Vec<_>>()
                .join("|");

            Some(format!(
                "{} -e {} -- --server {} -n {}",
                self.settings.ruby_cmd(),
                shell_quote(&format!("%w[{}].each do |f| load f; end", files.join(" "))),
                self.session,
                shell_quote(&format!("/{}/", filter))
            ))
        };

        CommandSet { full, partial }
    }
}
