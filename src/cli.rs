use clap::{Parser, Subcommand};

mod check;
mod serve;
mod stat;
mod update;

#[derive(Debug, Parser)]
#[command(
    name = "mirrorlist",
    version,
    about = "Mirror-selection service for package distribution networks"
)]
struct MirrorlistCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP frontend
    Serve(serve::ServeArgs),
    /// Run one mirror-validation cycle and commit the result
    Update,
    /// Validate the service config and every mirror declaration
    Check(check::CheckArgs),
    /// Export request statistics from frontend access logs
    Stat(stat::StatArgs),
}

pub async fn run() -> crate::Result<()> {
    let cli = <MirrorlistCli as clap::Parser>::parse();
    match cli.command {
        Command::Serve(args) => serve::serve_main(args).await,
        Command::Update => update::update_main().await,
        Command::Check(args) => check::check_main(args).await,
        Command::Stat(args) => stat::stat_main(args).await,
    }
}
