use color_eyre::eyre::Context as _;

use crate::App;
use crate::app::processor;

pub async fn update_main() -> crate::Result<()> {
    let app = App::init().await.wrap_err("Failed to initialize service")?;
    let message = processor::run_update(&app)
        .await
        .wrap_err("Mirror update cycle failed")?;
    println!("{message}");
    Ok(())
}
