//! CLI types and struct definitions.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for resh_core::logging::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => resh_core::logging::LogFormat::Text,
            CliLogFormat::Json => resh_core::logging::LogFormat::Json,
        }
    }
}

/// What to run once logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAction {
    /// `-W host:port`
    StdioForward { host: String, port: u16 },
    /// `-s name`
    Subsystem(String),
    /// `-N`
    NoCommand,
    /// A command line.
    Command(String),
    /// Interactive login shell.
    Shell,
}

/// Resilient SSH client.
#[derive(Debug, Parser)]
#[command(name = "resh", version, about = "Resilient SSH client")]
pub struct Cli {
    /// Remote host (user@host or host)
    pub destination: Option<String>,

    /// Command to execute on remote host (optional)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Port to connect to on the remote host
    #[arg(short = 'p', long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Login user name (overrides user@ in destination)
    #[arg(short = 'l', long, value_name = "USER")]
    pub login: Option<String>,

    /// Identity file for public key authentication
    #[arg(short = 'i', long = "identity", action = ArgAction::Append, value_name = "FILE")]
    pub identity: Vec<PathBuf>,

    /// SSH config file
    #[arg(short = 'F', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Connect through a jump host
    #[arg(short = 'J', long = "jump", value_name = "DESTINATION")]
    pub proxy_jump: Option<String>,

    /// SSH-style options (repeatable)
    #[arg(short = 'o', value_name = "OPTION", action = ArgAction::Append)]
    pub ssh_option: Vec<String>,

    /// Do not execute a remote command
    #[arg(short = 'N')]
    pub no_command: bool,

    /// Request a subsystem on the remote system
    #[arg(short = 's')]
    pub subsystem: bool,

    /// Forward stdin and stdout to host:port over the secure channel
    #[arg(
        short = 'W',
        value_name = "HOST:PORT",
        value_parser = super::parsing::parse_stdio_forward,
        conflicts_with_all = ["no_command", "subsystem"]
    )]
    pub stdio_forward: Option<(String, u16)>,

    /// Go to background after authentication
    #[arg(short = 'f')]
    pub background: bool,

    /// Force pseudo-terminal allocation
    #[arg(short = 't', conflicts_with = "disable_pty")]
    pub force_pty: bool,

    /// Disable pseudo-terminal allocation
    #[arg(short = 'T')]
    pub disable_pty: bool,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Use the reconnectable UDP transport
    #[arg(long = "udp", visible_alias = "reconnect")]
    pub udp: bool,

    /// Upload a local file to the remote working directory before the shell starts
    #[arg(long = "upload-file", action = ArgAction::Append, value_name = "PATH")]
    pub upload_file: Vec<PathBuf>,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}
