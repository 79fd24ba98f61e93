use clap::Parser;

use ssh_hostca::{CliArgs, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    run(args).await
}
