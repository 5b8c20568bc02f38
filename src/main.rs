use color_eyre::{
    Result,
    config::{HookBuilder, Theme},
};

#[tokio::main]
async fn main() -> Result<()> {
    yansi::whenever(yansi::Condition::TTY_AND_COLOR);
    if yansi::is_enabled() {
        color_eyre::install()?;
    } else {
        HookBuilder::default().theme(Theme::new()).install()?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "mirrorlist=info".into()))
        .with_writer(std::io::stderr)
        .init();

    cli::run().await
}

mod app;
mod cli;
mod server;
mod types;

pub use app::App;
pub use types::*;
