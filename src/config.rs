use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "ot-pad", version, about = "Collaborative plain text editing server")]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short, long, default_value_t = 4000)]
    pub port: u16,

    /// Where snapshots and the commit log live.
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// How often queued edits are applied.
    #[arg(long, default_value_t = 250)]
    pub update_interval_ms: u64,

    /// Write a snapshot every this many update cycles.
    #[arg(long, default_value_t = 100)]
    pub snapshot_every: u64,

    #[arg(long, default_value_t = 30)]
    pub prune_interval_secs: u64,

    /// Edits beyond this many waiting to be applied are refused.
    #[arg(long, default_value_t = 10_000)]
    pub max_pending: usize,

    #[arg(long, default_value_t = 60)]
    pub read_timeout_secs: u64,

    #[arg(long, default_value_t = 15)]
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub update_interval: Duration,
    pub snapshot_every: u64,
    pub prune_interval: Duration,
    pub max_pending: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Without the `.json` / `.tmp` extension.
    pub snapshot_path: PathBuf,
    pub log_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            update_interval: Duration::from_millis(250),
            snapshot_every: 100,
            prune_interval: Duration::from_secs(30),
            max_pending: 10_000,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(15),
            snapshot_path: PathBuf::from("snapshot"),
            log_path: PathBuf::from("commit.log"),
        }
    }
}

impl From<&Args> for ServerConfig {
    fn from(args: &Args) -> Self {
        ServerConfig {
            update_interval: Duration::from_millis(args.update_interval_ms),
            snapshot_every: args.snapshot_every.max(1),
            prune_interval: Duration::from_secs(args.prune_interval_secs),
            max_pending: args.max_pending,
            read_timeout: Duration::from_secs(args.read_timeout_secs),
            write_timeout: Duration::from_secs(args.write_timeout_secs),
            snapshot_path: args.data_dir.join(format!("snapshot-{}-{}", args.host, args.port)),
            log_path: args.data_dir.join(format!("commit-{}-{}.log", args.host, args.port)),
        }
    }
}
