//! Command registrar and the CLI service
//!
//! Services register named commands on the [`Cli`]. A command line is split at the first space:
//! the first word selects the command and the remainder, if any, is handed to it as arguments.
//! Command output is written to a text sink and returned to the caller.
//!
//! The CLI service owns a [`Cli`] and executes lines submitted through its [`CliHandle`] on its
//! own thread. The handle is published as the [`RECORD_CLI`] record.

use core::fmt::Write;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use snafu::{ResultExt, Snafu};

use crate::api_lock::ApiLock;
use crate::kernel::{get_tick, lock_state, TICK_FREQUENCY_HZ, WAIT_FOREVER};
use crate::log::LogLevel;
use crate::message_queue::MessageQueue;
use crate::thread::Thread;
use crate::{record, rhs_crash};

/// Name of the CLI record
pub const RECORD_CLI: &str = "cli";
/// Maximum number of registered commands
pub const MAX_COMMANDS: usize = 32;
/// Longest accepted command line
pub const MAX_LINE_LENGTH: usize = 64;

const CLI_STACK_SIZE: usize = 2048;
const CLI_QUEUE_LEN: usize = 4;

/// A command handler
///
/// Receives the argument string (`None` when the line held only the command name) and a sink for
/// its output.
type CliCallback = Arc<dyn Fn(Option<&str>, &mut dyn Write) + Send + Sync>;

/// Error returned by the CLI
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum CliError {
    /// A command with this name is already registered
    #[snafu(display("Command {name} already exists"))]
    DuplicateCommand {
        /// The rejected name
        name: String,
    },
    /// The command table is full
    #[snafu(display("Command table is full"))]
    TableFull,
    /// No command with this name is registered
    #[snafu(display("Unknown command {name}"))]
    UnknownCommand {
        /// The name which was looked up
        name: String,
    },
    /// The line is longer than [`MAX_LINE_LENGTH`]
    #[snafu(display("Line too long"))]
    LineTooLong,
    /// The request could not be handed to the CLI service
    #[snafu(display("CLI service unavailable: {source}"))]
    Service {
        /// The OS error
        source: crate::status::Error,
    },
}

/// Text for a command result, as printed on the console
pub fn status_text<T>(result: &Result<T, CliError>) -> &'static str {
    match result {
        Ok(_) => "Ok",
        Err(_) => "Error",
    }
}

/// The command table
pub struct Cli {
    commands: Mutex<BTreeMap<String, CliCallback>>,
}

impl core::fmt::Debug for Cli {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cli")
            .field("commands", &self.commands())
            .finish()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

impl Cli {
    /// Create an empty command table
    pub const fn new() -> Self {
        Self {
            commands: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create a command table holding the built in commands
    ///
    /// `uptime` and `log` are registered. `help` is always available.
    pub fn with_builtins() -> Self {
        let cli = Self::new();
        // The table is empty, so none of these can clash
        cli.add_command("uptime", command_uptime).ok();
        cli.add_command("log", command_log).ok();
        cli
    }

    /// Register a command
    pub fn add_command(
        &self,
        name: &str,
        callback: impl Fn(Option<&str>, &mut dyn Write) + Send + Sync + 'static,
    ) -> Result<(), CliError> {
        let mut commands = lock_state(&self.commands);
        if commands.contains_key(name) {
            log::error!(target: "cli", "Command {name} already exists");
            return DuplicateCommandSnafu { name }.fail();
        }
        if commands.len() >= MAX_COMMANDS {
            return TableFullSnafu.fail();
        }
        commands.insert(name.to_owned(), Arc::new(callback));
        Ok(())
    }

    /// Remove a command, returning true if it was registered
    pub fn delete_command(&self, name: &str) -> bool {
        lock_state(&self.commands).remove(name).is_some()
    }

    /// Names of all registered commands, sorted
    pub fn commands(&self) -> Vec<String> {
        lock_state(&self.commands).keys().cloned().collect()
    }

    /// Execute a command line, returning the command's output
    ///
    /// An empty line does nothing.
    pub fn execute(&self, line: &str) -> Result<String, CliError> {
        let line = line.trim();
        if line.len() > MAX_LINE_LENGTH {
            return LineTooLongSnafu.fail();
        }
        if line.is_empty() {
            return Ok(String::new());
        }
        let (name, args) = match line.split_once(' ') {
            Some((name, args)) => (name, Some(args.trim_start()).filter(|a| !a.is_empty())),
            None => (line, None),
        };
        let mut output = String::new();
        if name == "help" {
            output.push_str("Available commands:\r\n");
            for command in self.commands() {
                output.push_str(&command);
                output.push_str("\r\n");
            }
            return Ok(output);
        }
        let callback = lock_state(&self.commands).get(name).cloned();
        match callback {
            Some(callback) => {
                callback(args, &mut output);
                Ok(output)
            }
            None => {
                log::info!(target: "cli", "Unknown command");
                UnknownCommandSnafu { name }.fail()
            }
        }
    }
}

fn command_uptime(_args: Option<&str>, out: &mut dyn Write) {
    let uptime = get_tick() / TICK_FREQUENCY_HZ;
    write!(
        out,
        "Uptime: {}h{}m{}s\r\n",
        uptime / 60 / 60,
        uptime / 60 % 60,
        uptime % 60
    )
    .ok();
}

fn level_from_digit(arg: &str) -> Option<LogLevel> {
    let level = match arg {
        "0" => LogLevel::Default,
        "1" => LogLevel::None,
        "2" => LogLevel::Error,
        "3" => LogLevel::Warn,
        "4" => LogLevel::Info,
        "5" => LogLevel::Debug,
        "6" => LogLevel::Trace,
        _ => return None,
    };
    Some(level)
}

fn command_log(args: Option<&str>, out: &mut dyn Write) {
    let Some(args) = args else {
        write!(out, "log level is {}\r\n", crate::log::level() as u8).ok();
        return;
    };
    if let Some(level) = level_from_digit(args) {
        crate::log::set_level(level);
        write!(out, "log level is {}\r\n", crate::log::level() as u8).ok();
        return;
    }
    let (flag, value) = match args.split_once(' ') {
        Some((flag, value)) if !value.is_empty() => (flag, Some(value)),
        _ => (args, None),
    };
    match (flag, value) {
        ("-l", None) => {
            for i in 0..crate::log::count_saved() {
                if let Some(message) = crate::log::read_saved(i) {
                    write!(out, "{message}\r\n").ok();
                }
            }
        }
        ("-e", Some(tag)) => match crate::log::exclude_tag(tag) {
            Ok(()) => {
                write!(out, "TAG {tag} was excluded\r\n").ok();
            }
            Err(e) => {
                write!(out, "Failed to exclude {tag}: {e}\r\n").ok();
            }
        },
        ("-ue", Some(tag)) => {
            crate::log::unexclude_tag(tag);
            write!(out, "TAG {tag} was unexcluded\r\n").ok();
        }
        ("-s", Some(message)) => crate::log::save(message),
        _ => {
            log::error!(target: "cli", "Invalid argument");
            write!(out, "Invalid argument\r\n").ok();
        }
    }
}

struct CliRequest {
    line: String,
    reply: Arc<Mutex<Option<Result<String, CliError>>>>,
    lock: ApiLock,
}

/// Handle to a running CLI service
pub struct CliHandle {
    cli: Arc<Cli>,
    requests: Arc<MessageQueue<CliRequest>>,
    _service: Thread,
}

impl core::fmt::Debug for CliHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CliHandle").field("cli", &self.cli).finish()
    }
}

impl CliHandle {
    /// Start a CLI service with the built in commands
    ///
    /// The handle is not published; see [`spawn_service`].
    pub fn start() -> Arc<Self> {
        let cli = Arc::new(Cli::with_builtins());
        let requests = Arc::new(MessageQueue::<CliRequest>::new(CLI_QUEUE_LEN));
        let service = {
            let cli = cli.clone();
            let requests = requests.clone();
            Thread::alloc_service("Cli", CLI_STACK_SIZE, move || loop {
                let Ok(request) = requests.get(WAIT_FOREVER) else {
                    rhs_crash!("CLI request queue failed");
                };
                let result = cli.execute(&request.line);
                *lock_state(&request.reply) = Some(result);
                request.lock.unlock();
            })
        };
        service.start();
        Arc::new(Self {
            cli,
            requests,
            _service: service,
        })
    }

    /// The command table
    pub fn cli(&self) -> &Cli {
        &self.cli
    }

    /// Register a command, see [`Cli::add_command`]
    pub fn add_command(
        &self,
        name: &str,
        callback: impl Fn(Option<&str>, &mut dyn Write) + Send + Sync + 'static,
    ) -> Result<(), CliError> {
        self.cli.add_command(name, callback)
    }

    /// Remove a command, see [`Cli::delete_command`]
    pub fn delete_command(&self, name: &str) -> bool {
        self.cli.delete_command(name)
    }

    /// Execute `line` on the service thread and wait for the result
    pub fn execute_sync(&self, line: &str) -> Result<String, CliError> {
        let lock = ApiLock::new_locked();
        let reply = Arc::new(Mutex::new(None));
        self.requests
            .put(
                CliRequest {
                    line: line.to_owned(),
                    reply: reply.clone(),
                    lock: lock.clone(),
                },
                WAIT_FOREVER,
            )
            .context(ServiceSnafu)?;
        lock.wait_unlock_and_free().context(ServiceSnafu)?;
        let result = lock_state(&reply).take();
        result.unwrap_or_else(|| {
            Err(CliError::Service {
                source: crate::status::Error::Unspecified,
            })
        })
    }
}

/// Start the CLI service and publish it as [`RECORD_CLI`]
pub fn spawn_service() -> Arc<CliHandle> {
    let handle = CliHandle::start();
    record::create(RECORD_CLI, handle.clone());
    handle
}
