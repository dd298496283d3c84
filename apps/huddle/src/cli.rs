use clap::{Parser, Subcommand, ValueEnum};
use huddle_core::transport::Backend;

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Mesh room signaling core and in-process demo")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run several in-process peers over local brokers
    Demo {
        /// Number of peers to start
        #[arg(long, default_value_t = 3)]
        peers: usize,

        /// Number of redundant brokers
        #[arg(long, default_value_t = 2)]
        brokers: usize,

        /// Room name (defaults to HUDDLE_ROOM)
        #[arg(long, env = "HUDDLE_ROOM")]
        room: Option<String>,

        /// Disconnect the first broker halfway through
        #[arg(long)]
        drop_broker: bool,

        /// Peer connection implementation
        #[arg(long, value_enum, env = "HUDDLE_BACKEND", default_value_t = BackendArg::Mock)]
        backend: BackendArg,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    Mock,
    Webrtc,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Mock => Backend::Mock,
            BackendArg::Webrtc => Backend::WebRtc,
        }
    }
}
