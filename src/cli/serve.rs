use std::net::SocketAddr;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::Context as _;

use crate::{App, server};

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address the frontend listens on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

pub async fn serve_main(args: ServeArgs) -> crate::Result<()> {
    let app = Arc::new(App::init().await.wrap_err("Failed to initialize service")?);
    server::serve(app, args.bind)
        .await
        .wrap_err("HTTP frontend failed")
}
