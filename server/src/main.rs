// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use anyhow::Result;
use statelink_server::Opt;
use structopt::StructOpt;

#[tokio::main]
async fn main() -> Result<()> {
    let mut opt = Opt::from_args();
    if let Some(config) = opt.config.clone() {
        opt = Opt::from_file(&config).await?;
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(opt.log_filter()))
        .init();
    statelink_server::server::run(opt).await
}
