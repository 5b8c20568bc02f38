//! Request statistics from frontend access logs: unique clients per
//! (version, repository) and per ISO (arch, version), exported in the
//! node-exporter textfile format or as JSON.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use clap::Args;
use color_eyre::eyre::Context as _;
use regex::Regex;
use serde::Serialize;

static ACCESS_LOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?P<address>(?:[0-9]{1,3}\.){3}[0-9]{1,3}).*GET ",
        r"((/mirrorlist/(?P<dnf_version>[\d][\w.-]*)/(?P<dnf_variant>\w+))",
        r"|(/isos/(?P<isos_arch>\w+)/(?P<isos_version>[\d][\w.-]*)))",
    ))
    .expect("static regex")
});

#[derive(Debug, Clone, Serialize)]
pub struct Label {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    name: String,
    value: usize,
    labels: Vec<Label>,
}

impl Metric {
    fn render(&self) -> String {
        let labels = self
            .labels
            .iter()
            .map(|label| format!("{}={}", label.name, label.value))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{labels}}} {}", self.name, self.value)
    }
}

/// Count unique client addresses per request kind over raw log lines.
pub fn collect_metrics(metric_name: &str, log_lines: &str) -> Vec<Metric> {
    let mut dnf: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
    let mut isos: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
    for line in log_lines.lines() {
        let Some(captures) = ACCESS_LOG_RE.captures(line) else {
            continue;
        };
        let address = captures["address"].to_string();
        match (
            captures.name("dnf_version"),
            captures.name("dnf_variant"),
            captures.name("isos_arch"),
            captures.name("isos_version"),
        ) {
            (Some(version), Some(variant), _, _) => {
                dnf.entry((
                    version.as_str().to_lowercase(),
                    variant.as_str().to_lowercase(),
                ))
                .or_default()
                .insert(address);
            }
            (_, _, Some(arch), Some(version)) => {
                isos.entry((
                    version.as_str().to_lowercase(),
                    arch.as_str().to_lowercase(),
                ))
                .or_default()
                .insert(address);
            }
            _ => {}
        }
    }

    let mut metrics = Vec::new();
    for ((version, arch), addresses) in isos {
        metrics.push(Metric {
            name: metric_name.to_string(),
            value: addresses.len(),
            labels: vec![
                Label {
                    name: "type".to_string(),
                    value: "isos".to_string(),
                },
                Label {
                    name: "version".to_string(),
                    value: version,
                },
                Label {
                    name: "arch".to_string(),
                    value: arch,
                },
            ],
        });
    }
    for ((version, variant), addresses) in dnf {
        metrics.push(Metric {
            name: metric_name.to_string(),
            value: addresses.len(),
            labels: vec![
                Label {
                    name: "type".to_string(),
                    value: "dnf".to_string(),
                },
                Label {
                    name: "version".to_string(),
                    value: version,
                },
                Label {
                    name: "variant".to_string(),
                    value: variant,
                },
            ],
        });
    }
    metrics
}

#[derive(Debug, Args)]
pub struct StatArgs {
    /// Access log file to analyze
    #[arg(long)]
    access_log: PathBuf,

    /// Metric name written to the textfile
    #[arg(long, default_value = "mirrors_stat_hourly")]
    metric_name: String,

    /// Directory with the stat files for node exporter
    #[arg(long, default_value = "/var/run/node_exporter")]
    stat_dir: PathBuf,

    /// Print the statistics as JSON instead of writing the stat file
    #[arg(long)]
    dry_run: bool,
}

pub async fn stat_main(args: StatArgs) -> crate::Result<()> {
    let log_lines = tokio::fs::read_to_string(&args.access_log)
        .await
        .wrap_err_with(|| format!("Failed to read {}", args.access_log.display()))?;
    let metrics = collect_metrics(&args.metric_name, &log_lines);

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }
    tokio::fs::create_dir_all(&args.stat_dir)
        .await
        .wrap_err("Failed to create the stat directory")?;
    let stat_file = args.stat_dir.join(format!("{}.prom", args.metric_name));
    let rendered = metrics
        .iter()
        .map(Metric::render)
        .collect::<Vec<_>>()
        .join("\n");
    tokio::fs::write(&stat_file, format!("{rendered}\n"))
        .await
        .wrap_err_with(|| format!("Failed to write {}", stat_file.display()))?;
    println!("Wrote {} metrics to {}", metrics.len(), stat_file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"
198.51.100.7 - - [27/Jul/2026:10:00:01 +0000] "GET /mirrorlist/9/BaseOS HTTP/1.1" 200 512
198.51.100.7 - - [27/Jul/2026:10:00:02 +0000] "GET /mirrorlist/9/BaseOS HTTP/1.1" 200 512
203.0.113.4 - - [27/Jul/2026:10:00:03 +0000] "GET /mirrorlist/9/BaseOS HTTP/1.1" 200 512
203.0.113.4 - - [27/Jul/2026:10:01:00 +0000] "GET /isos/x86_64/9 HTTP/1.1" 200 1024
192.0.2.77 - - [27/Jul/2026:10:02:00 +0000] "GET / HTTP/1.1" 200 4096
"#;

    #[test]
    fn unique_clients_are_counted_per_request_kind() {
        let metrics = collect_metrics("mirrors_stat_hourly", LOG);
        assert_eq!(metrics.len(), 2);
        let isos = &metrics[0];
        assert_eq!(isos.value, 1);
        assert!(isos.labels.iter().any(|l| l.name == "type" && l.value == "isos"));
        let dnf = &metrics[1];
        assert_eq!(dnf.value, 2);
        assert!(dnf.labels.iter().any(|l| l.name == "variant" && l.value == "baseos"));
    }

    #[test]
    fn metrics_render_in_textfile_format() {
        let metrics = collect_metrics("mirrors_stat_daily", LOG);
        let rendered = metrics[1].render();
        assert_eq!(
            rendered,
            "mirrors_stat_daily{type=dnf,version=9,variant=baseos} 2"
        );
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let metrics = collect_metrics("mirrors_stat_hourly", "no requests here\n");
        assert!(metrics.is_empty());
    }
}
