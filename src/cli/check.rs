//! Offline validation of the service config and the per-mirror
//! declarations, for CI and for mirror maintainers.

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use yansi::Paint;

use crate::app::config;

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Root of the YAML configuration tree
    #[arg(long, env = "CONFIG_ROOT", default_value = ".")]
    config_root: PathBuf,
}

pub async fn check_main(args: CheckArgs) -> crate::Result<()> {
    let service_path = args.config_root.join("config.yml");
    let service = match config::load_service_config(&service_path).await {
        Ok(service) => {
            println!("{} {}", "ok".green(), service_path.display());
            service
        }
        Err(err) => {
            println!("{} {}: {err:#}", "fail".red(), service_path.display());
            return Err(eyre!("Service config is invalid"));
        }
    };

    let mirrors_dir = args.config_root.join(&service.mirrors_dir);
    let mut failures = 0usize;
    let files = config::mirror_files(&mirrors_dir);
    for path in &files {
        let label = path.display().to_string();
        let outcome = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| crate::types::CfgErr::NotFound(label.clone(), err))
            .and_then(|yaml| config::parse_mirror_decl(&label, &yaml));
        match outcome {
            Ok(decl) if !decl.satisfies_protocols(&service.required_protocols) => {
                failures += 1;
                println!(
                    "{} {label}: no address with protocols {:?}",
                    "fail".red(),
                    service.required_protocols,
                );
            }
            Ok(_) => println!("{} {label}", "ok".green()),
            Err(err) => {
                failures += 1;
                println!("{} {label}: {err:#}", "fail".red());
            }
        }
    }

    println!("{} mirror configs, {failures} invalid", files.len());
    if failures > 0 {
        return Err(eyre!("{failures} mirror configs are invalid"));
    }
    Ok(())
}
