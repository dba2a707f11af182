mod types;
mod error;
mod ot;
mod protocol;
mod doc_state;
mod commit_log;
mod config;
mod server;
mod persist;
mod session;
mod frames;
mod http;

use std::fs;
use std::process;
use std::sync::Arc;

use async_std::{channel, task};
use clap::Parser;
use log::{error, info};

use crate::config::{Args, ServerConfig};
use crate::commit_log::FileLogStore;
use crate::error::PersistError;
use crate::server::Updater;

async fn run(args: Args) -> Result<(), PersistError> {
    let config = ServerConfig::from(&args);
    fs::create_dir_all(&args.data_dir)?;

    let store = FileLogStore::open(&config.log_path)?;
    let server = Arc::new(persist::recover(config, &store)?);
    info!("recovered {} documents", server.docs().await.len());

    let (stop, stopped) = channel::bounded(1);
    let updater = task::spawn(Updater::new(server.clone(), Box::new(store)).run(stopped));

    let hosted = http::host(server, format!("{}:{}", args.host, args.port)).await;
    drop(stop);
    updater.await;
    hosted?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = task::block_on(run(args)) {
        error!("fatal ({:?}): {}", e.severity(), e);
        process::exit(1);
    }
}
