//! Service and per-mirror configuration loading.
//!
//! Every YAML file declares a `config_version` (default 1) which selects the
//! typed schema it is decoded against. Mirrors that do not expose at least
//! one URL in a required protocol are dropped at load time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::types::{CfgErr, CloudType, GeoLocation, Sponsor};

const TARGET: &str = "mirrorlist::config";

/// Default great-circle radius within which near-equivalent mirrors are
/// shuffled to spread load.
const DEFAULT_RANDOMIZE_WITHIN_KM: u32 = 500;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    /// Repository path below `<base>/<version>/`, may contain `$basearch`
    pub path: String,
    /// Override of the global arch list, empty means inherit
    #[serde(default)]
    pub arches: Vec<String>,
    /// Restriction of the version list, empty means all active versions
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub vault: bool,
}

/// Global service declaration, decoded from `$CONFIG_ROOT/config.yml`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub allowed_outdate: Duration,
    /// Ordered list of currently served versions
    pub versions: Vec<String>,
    /// Archived versions served only from the vault mirror
    pub vault_versions: Vec<String>,
    /// Client-facing alias -> canonical version
    pub duplicated_versions: BTreeMap<String, String>,
    /// module -> versions the module exists for
    pub optional_module_versions: BTreeMap<String, Vec<String>>,
    /// version -> allowed arches
    pub arches: BTreeMap<String, Vec<String>>,
    /// Ordered protocol preference, a mirror must serve at least one
    pub required_protocols: Vec<String>,
    pub repos: Vec<RepoConfig>,
    pub vault_mirror: String,
    pub mirrors_dir: PathBuf,
    pub randomize_within_km: u32,
}

#[derive(Debug, Deserialize)]
struct ServiceConfigV1 {
    allowed_outdate: String,
    versions: Vec<serde_yaml::Value>,
    #[serde(default)]
    vault_versions: Vec<serde_yaml::Value>,
    #[serde(default)]
    duplicated_versions: BTreeMap<String, String>,
    #[serde(default)]
    optional_module_versions: BTreeMap<String, Vec<serde_yaml::Value>>,
    arches: BTreeMap<String, Vec<String>>,
    required_protocols: Vec<String>,
    repos: Vec<RepoConfig>,
    vault_mirror: String,
    mirrors_dir: PathBuf,
    #[serde(default)]
    randomize_within_km: Option<u32>,
}

/// YAML version numbers come through as numbers or strings depending on how
/// the author quoted them; normalize both to strings.
fn version_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

impl ServiceConfigV1 {
    fn into_config(self, label: &str) -> Result<ServiceConfig, CfgErr> {
        let allowed_outdate = humantime::parse_duration(&self.allowed_outdate).map_err(|e| {
            CfgErr::Invalid(
                label.to_string(),
                format!("allowed_outdate {:?}: {e}", self.allowed_outdate),
            )
        })?;
        let versions: Vec<String> = self.versions.iter().map(version_string).collect();
        let vault_versions: Vec<String> = self.vault_versions.iter().map(version_string).collect();

        let known_arches: Vec<&String> = self.arches.values().flatten().collect();
        for repo in &self.repos {
            for arch in &repo.arches {
                if !known_arches.contains(&arch) {
                    return Err(CfgErr::Invalid(
                        label.to_string(),
                        format!("repo {:?} declares unknown arch {arch:?}", repo.name),
                    ));
                }
            }
            for version in &repo.versions {
                if !versions.contains(version) && !vault_versions.contains(version) {
                    return Err(CfgErr::Invalid(
                        label.to_string(),
                        format!("repo {:?} declares unknown version {version:?}", repo.name),
                    ));
                }
            }
        }
        for (alias, target) in &self.duplicated_versions {
            if !versions.contains(alias) {
                tracing::warn!(
                    target: TARGET,
                    "duplicated version alias {alias:?} -> {target:?} is not an active version"
                );
            }
        }

        Ok(ServiceConfig {
            allowed_outdate,
            versions,
            vault_versions,
            duplicated_versions: self.duplicated_versions,
            optional_module_versions: self
                .optional_module_versions
                .into_iter()
                .map(|(module, versions)| (module, versions.iter().map(version_string).collect()))
                .collect(),
            arches: self.arches,
            required_protocols: self.required_protocols,
            repos: self.repos,
            vault_mirror: self.vault_mirror,
            mirrors_dir: self.mirrors_dir,
            randomize_within_km: self
                .randomize_within_km
                .unwrap_or(DEFAULT_RANDOMIZE_WITHIN_KM),
        })
    }
}

impl ServiceConfig {
    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    /// Active versions that are probed directly: everything listed minus
    /// client-facing aliases (their targets are probed instead).
    pub fn probe_versions(&self) -> impl Iterator<Item = &String> {
        self.versions
            .iter()
            .filter(|version| !self.duplicated_versions.contains_key(*version))
    }

    /// Arch list for a version. Module versions like `10-kitten` fall back
    /// to the longest plain version they start with.
    pub fn arches_for_version(&self, version: &str) -> Option<&[String]> {
        if let Some(arches) = self.arches.get(version) {
            return Some(arches);
        }
        self.arches
            .iter()
            .filter(|(known, _)| version.starts_with(known.as_str()))
            .max_by_key(|(known, _)| known.len())
            .map(|(_, arches)| arches.as_slice())
    }

    /// Arch used for `$basearch` substitution when the client did not name
    /// one: the first arch of the version, else the first configured arch.
    pub fn default_arch(&self, version: &str) -> Option<String> {
        self.arches_for_version(version)
            .and_then(|arches| arches.first().cloned())
            .or_else(|| self.arches.values().flatten().next().cloned())
    }

    pub fn is_vault_version(&self, version: &str) -> bool {
        self.vault_versions.iter().any(|v| v == version)
    }

    pub fn is_active_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }
}

/// Validated mirror declaration, before probing.
#[derive(Debug, Clone)]
pub struct MirrorDecl {
    pub name: String,
    pub sponsor: Sponsor,
    pub email: String,
    pub update_frequency: String,
    pub urls: BTreeMap<String, String>,
    pub module_urls: BTreeMap<String, BTreeMap<String, String>>,
    pub subnets: Vec<IpNet>,
    /// Set when `subnets` was declared as a URL; resolved by the loader
    pub subnets_url: Option<String>,
    pub asn: Vec<u32>,
    pub cloud_type: CloudType,
    pub cloud_regions: Vec<String>,
    pub geolocation: GeoLocation,
    pub private: bool,
    pub monopoly: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubnetsField {
    Inline(Vec<IpNet>),
    Remote(String),
}

impl Default for SubnetsField {
    fn default() -> Self {
        SubnetsField::Inline(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AsnField {
    One(u32),
    Many(Vec<u32>),
}

impl Default for AsnField {
    fn default() -> Self {
        AsnField::Many(Vec::new())
    }
}

fn default_email() -> String {
    "unknown".to_string()
}

#[derive(Debug, Deserialize)]
struct MirrorDeclV1 {
    name: String,
    sponsor: Sponsor,
    #[serde(default = "default_email")]
    email: String,
    update_frequency: String,
    urls: BTreeMap<String, String>,
    #[serde(default)]
    module_urls: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    subnets: SubnetsField,
    #[serde(default)]
    asn: AsnField,
    #[serde(default)]
    cloud_type: CloudType,
    #[serde(default)]
    cloud_regions: Vec<String>,
    #[serde(default)]
    geolocation: GeoLocation,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    monopoly: bool,
}

impl From<MirrorDeclV1> for MirrorDecl {
    fn from(raw: MirrorDeclV1) -> Self {
        let (subnets, subnets_url) = match raw.subnets {
            SubnetsField::Inline(list) => (list, None),
            SubnetsField::Remote(url) => (Vec::new(), Some(url)),
        };
        MirrorDecl {
            name: raw.name,
            sponsor: raw.sponsor,
            email: raw.email,
            update_frequency: raw.update_frequency,
            urls: raw.urls,
            module_urls: raw.module_urls,
            subnets,
            subnets_url,
            asn: match raw.asn {
                AsnField::One(asn) => vec![asn],
                AsnField::Many(list) => list,
            },
            cloud_type: raw.cloud_type,
            cloud_regions: raw.cloud_regions,
            geolocation: raw.geolocation,
            private: raw.private,
            monopoly: raw.monopoly,
        }
    }
}

impl MirrorDecl {
    /// Base URL selected by protocol preference order.
    pub fn preferred_url(&self, required_protocols: &[String]) -> Option<&str> {
        required_protocols
            .iter()
            .find_map(|proto| self.urls.get(proto))
            .map(String::as_str)
    }

    /// A mirror must expose at least one required protocol to be loaded.
    pub fn satisfies_protocols(&self, required_protocols: &[String]) -> bool {
        self.preferred_url(required_protocols).is_some()
    }
}

fn declared_version(value: &serde_yaml::Value) -> u64 {
    value
        .get("config_version")
        .and_then(serde_yaml::Value::as_u64)
        .unwrap_or(1)
}

/// Decode the service config, dispatching on its declared `config_version`.
pub fn parse_service_config(label: &str, yaml: &str) -> Result<ServiceConfig, CfgErr> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| CfgErr::ParseFail(label.to_string(), e))?;
    match declared_version(&value) {
        1 => serde_yaml::from_value::<ServiceConfigV1>(value)
            .map_err(|e| CfgErr::ParseFail(label.to_string(), e))?
            .into_config(label),
        version => Err(CfgErr::UnsupportedVersion(label.to_string(), version)),
    }
}

/// Decode one mirror declaration, dispatching on its `config_version`.
pub fn parse_mirror_decl(label: &str, yaml: &str) -> Result<MirrorDecl, CfgErr> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| CfgErr::ParseFail(label.to_string(), e))?;
    match declared_version(&value) {
        1 => serde_yaml::from_value::<MirrorDeclV1>(value)
            .map(MirrorDecl::from)
            .map_err(|e| CfgErr::ParseFail(label.to_string(), e)),
        version => Err(CfgErr::UnsupportedVersion(label.to_string(), version)),
    }
}

pub async fn load_service_config(path: &Path) -> Result<ServiceConfig, CfgErr> {
    let label = path.display().to_string();
    let yaml = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CfgErr::NotFound(label.clone(), e))?;
    parse_service_config(&label, &yaml)
}

/// All mirror declaration files below a directory.
pub fn mirror_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yml" | "yaml")
            )
        })
        .collect();
    files.sort();
    files
}

/// Load every mirror declaration below `mirrors_dir`. Parse failures and
/// protocol violations drop the mirror with an error log; a failing remote
/// subnet list degrades to an empty list but keeps the mirror.
pub async fn load_mirror_decls(
    client: &reqwest::Client,
    config: &ServiceConfig,
    mirrors_dir: &Path,
) -> Vec<MirrorDecl> {
    let mut decls = Vec::new();
    for path in mirror_files(mirrors_dir) {
        let label = path.display().to_string();
        let yaml = match tokio::fs::read_to_string(&path).await {
            Ok(yaml) => yaml,
            Err(err) => {
                tracing::error!(target: TARGET, "Cannot read mirror config {label}: {err}");
                continue;
            }
        };
        let mut decl = match parse_mirror_decl(&label, &yaml) {
            Ok(decl) => decl,
            Err(err) => {
                tracing::error!(target: TARGET, "Mirror config {label} is invalid: {err}");
                continue;
            }
        };
        if !decl.satisfies_protocols(&config.required_protocols) {
            tracing::error!(
                target: TARGET,
                "Mirror {:?} has no address with protocols {:?}",
                decl.name,
                config.required_protocols,
            );
            continue;
        }
        if let Some(url) = decl.subnets_url.clone() {
            decl.subnets = fetch_remote_subnets(client, &decl.name, &url).await;
        }
        decls.push(decl);
    }
    decls
}

/// Fetch a mirror's subnet list from its declared URL. Returns an empty
/// list on any failure so the mirror still loads.
async fn fetch_remote_subnets(client: &reqwest::Client, mirror: &str, url: &str) -> Vec<IpNet> {
    let result = async {
        let response = client
            .get(url)
            .timeout(Duration::from_secs(
                super::constants::HTTP_CONNECT_TIMEOUT_SECS,
            ))
            .send()
            .await?
            .error_for_status()?;
        response.json::<Vec<String>>().await
    }
    .await;
    match result {
        Ok(raw) => raw
            .iter()
            .filter_map(|cidr| match cidr.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(err) => {
                    tracing::warn!(
                        target: TARGET,
                        "Mirror {mirror:?} subnet {cidr:?} is not a valid CIDR: {err}"
                    );
                    None
                }
            })
            .collect(),
        Err(err) => {
            tracing::error!(
                target: TARGET,
                "Cannot get subnets of mirror {mirror:?} by url {url:?} because {err}"
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE_YAML: &str = r#"
config_version: 1
allowed_outdate: 6h
versions: ["8", "9"]
vault_versions: ["7"]
duplicated_versions:
  "8": "8.9"
arches:
  "8": [x86_64, aarch64]
  "9": [x86_64, aarch64]
required_protocols: [https, http]
repos:
  - name: BaseOS
    path: BaseOS/$basearch/os
  - name: vault-extras
    path: extras/$basearch/os
    vault: true
vault_mirror: https://vault.example
mirrors_dir: mirrors
"#;

    const MIRROR_YAML: &str = r#"
name: mirror.example.org
sponsor:
  name: Example Org
  url: https://example.org
email: admin@example.org
update_frequency: 1h
urls:
  http: http://mirror.example.org/alma
  https: https://mirror.example.org/alma
subnets:
  - 192.0.2.0/24
asn: 64500
geolocation:
  country: DE
  state_province: Bavaria
  city: Munich
"#;

    #[test]
    fn service_config_parses() {
        let config = parse_service_config("test", SERVICE_YAML).unwrap();
        assert_eq!(config.allowed_outdate, Duration::from_secs(6 * 3600));
        assert_eq!(config.versions, vec!["8", "9"]);
        assert_eq!(config.duplicated_versions.get("8").unwrap(), "8.9");
        assert_eq!(config.randomize_within_km, 500);
        assert!(config.is_vault_version("7"));
        assert!(config.repo("vault-extras").unwrap().vault);
        assert_eq!(
            config.probe_versions().collect::<Vec<_>>(),
            vec![&"9".to_string()]
        );
    }

    #[test]
    fn arches_fall_back_to_longest_version_prefix() {
        let config = parse_service_config("test", SERVICE_YAML).unwrap();
        assert_eq!(
            config.arches_for_version("9-kitten").unwrap(),
            &["x86_64".to_string(), "aarch64".to_string()]
        );
        assert!(config.arches_for_version("12").is_none());
    }

    #[test]
    fn unknown_repo_arch_is_rejected() {
        let yaml = SERVICE_YAML.replace(
            "  - name: BaseOS\n    path: BaseOS/$basearch/os",
            "  - name: BaseOS\n    path: BaseOS/$basearch/os\n    arches: [sparc]",
        );
        assert!(matches!(
            parse_service_config("test", &yaml),
            Err(CfgErr::Invalid(..))
        ));
    }

    #[test]
    fn unsupported_config_version_is_rejected() {
        let yaml = SERVICE_YAML.replace("config_version: 1", "config_version: 9");
        assert!(matches!(
            parse_service_config("test", &yaml),
            Err(CfgErr::UnsupportedVersion(_, 9))
        ));
    }

    #[test]
    fn mirror_decl_parses_inline_subnets_and_scalar_asn() {
        let decl = parse_mirror_decl("test", MIRROR_YAML).unwrap();
        assert_eq!(decl.name, "mirror.example.org");
        assert_eq!(decl.subnets.len(), 1);
        assert!(decl.subnets_url.is_none());
        assert_eq!(decl.asn, vec![64500]);
        assert_eq!(decl.geolocation.city, "Munich");
        assert!(!decl.private);
        assert!(decl.satisfies_protocols(&["https".to_string()]));
        assert_eq!(
            decl.preferred_url(&["https".to_string(), "http".to_string()]),
            Some("https://mirror.example.org/alma")
        );
    }

    #[test]
    fn mirror_decl_subnets_url_is_deferred() {
        let yaml = MIRROR_YAML.replace(
            "subnets:\n  - 192.0.2.0/24",
            "subnets: https://mirror.example.org/subnets.json",
        );
        let decl = parse_mirror_decl("test", &yaml).unwrap();
        assert!(decl.subnets.is_empty());
        assert_eq!(
            decl.subnets_url.as_deref(),
            Some("https://mirror.example.org/subnets.json")
        );
    }

    #[test]
    fn mirror_without_required_protocol_fails_invariant() {
        let yaml = MIRROR_YAML.replace(
            "urls:\n  http: http://mirror.example.org/alma\n  https: https://mirror.example.org/alma",
            "urls:\n  rsync: rsync://mirror.example.org/alma",
        );
        let decl = parse_mirror_decl("test", &yaml).unwrap();
        assert!(!decl.satisfies_protocols(&["https".to_string(), "http".to_string()]));
    }
}
