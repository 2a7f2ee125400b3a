use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tandem_core::Peer;

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    about = "Hand biometric capture between a desktop and a mobile peer",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "TANDEM_REDIS_URL",
        help = "Redis URL of the shared session store"
    )]
    pub redis_url: Option<String>,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "TANDEM_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long = "bookmark",
        global = true,
        value_name = "PATH",
        env = "TANDEM_BOOKMARK",
        help = "Where to remember the last joined session"
    )]
    pub bookmark: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a session as the desktop host and follow it until Ctrl-C
    Host(HostArgs),
    /// Join a session by code and take over capture
    Join(JoinArgs),
    /// Rejoin the last remembered session
    Resume(ResumeArgs),
    /// Print the current session record
    Status { code: String },
    /// Stop and close a session
    Terminate { code: String },
    /// Seal a payload the way frames are sealed
    Encrypt {
        /// JSON value to seal; plain text is sealed as a string
        payload: String,
    },
    /// Open a sealed payload, falling back to the input as-is
    Decrypt { payload: String },
}

#[derive(Args, Debug)]
pub struct HostArgs {
    #[arg(long, env = "TANDEM_HOST_ID", default_value = "desktop")]
    pub host_id: String,

    #[arg(long, help = "Start capturing on this desktop right away")]
    pub capture: bool,

    #[arg(long, help = "Leave the session open when exiting")]
    pub keep_open: bool,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    pub code: String,

    #[command(flatten)]
    pub peer: PeerArgs,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    #[command(flatten)]
    pub peer: PeerArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    #[arg(long, default_value = "mobile", help = "Which peer this process plays (web or mobile)")]
    pub peer: Peer,

    #[arg(long, help = "Follow the session without claiming capture")]
    pub watch: bool,

    #[arg(long, help = "Terminate the session when exiting")]
    pub terminate_on_exit: bool,
}
