//! Per-mirror validation pipeline and the update-cycle driver.
//!
//! Each mirror runs the step sequence of one top-level task: DNS, status
//! probing (reachability, freshness, repo coverage), cloud subnet tagging,
//! IPv6 capability, offline geodata, ISO-set inventory, online geocoding
//! and optional-module probes. Fan-out probes are bounded by small
//! semaphores and cancel their siblings on the first negative result.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use super::App;
use super::cache::{self, Cache};
use super::clouds::{self, RegionSubnets};
use super::config::{self, MirrorDecl, ServiceConfig};
use super::constants::{
    CACHE_EXPIRED_TIME, DNS_ATTEMPTS, DNS_TIMEOUT_SECS, HTTP_RETRY_ATTEMPTS, ISO_FILE_TEMPLATES,
    ISO_PROBES_IN_FLIGHT, MIRRORS_IN_FLIGHT, NOMINATIM_URL, REPO_PROBES_IN_FLIGHT,
    WHITELIST_MIRRORS,
};
use super::geo::GeoResolver;
use super::join_url;
use crate::types::{
    CloudType, GeoLocation, Location, MirrorState, MirrorStatus, MirrorsError, UNKNOWN,
};

const TARGET: &str = "mirrorlist::processor";

pub struct MirrorProcessor {
    client: reqwest::Client,
    resolver: TokioAsyncResolver,
    geo: Arc<GeoResolver>,
    cache: Cache,
    config: Arc<ServiceConfig>,
    /// Instant of the last geocoder call; held across the request to
    /// serialize calls and keep them at least a second apart.
    geocoder_gate: Mutex<Option<Instant>>,
    nominatim_url: String,
}

impl MirrorProcessor {
    pub fn new(
        client: reqwest::Client,
        geo: Arc<GeoResolver>,
        cache: Cache,
        config: Arc<ServiceConfig>,
    ) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(DNS_TIMEOUT_SECS);
        opts.attempts = DNS_ATTEMPTS;
        MirrorProcessor {
            client,
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            geo,
            cache,
            config,
            geocoder_gate: Mutex::new(None),
            nominatim_url: NOMINATIM_URL.to_string(),
        }
    }

    /// Run the whole step sequence for one mirror.
    pub async fn process(
        &self,
        decl: MirrorDecl,
        clouds: &HashMap<CloudType, RegionSubnets>,
        iso_uris: &[String],
    ) -> MirrorState {
        let mut mirror = state_from_decl(decl, &self.config.required_protocols);

        self.resolve_ip(&mut mirror).await;
        if mirror.has_resolved_ip() {
            self.probe_status(&mut mirror).await;
        }
        if !mirror.status.is_reachable() || !mirror.has_resolved_ip() {
            return mirror;
        }

        self.apply_cloud_subnets(&mut mirror, clouds);
        self.probe_ipv6(&mut mirror).await;
        self.offline_geodata(&mut mirror);
        if !mirror.private && !mirror.cloud_type.is_cloud() {
            self.probe_iso_set(&mut mirror, iso_uris).await;
        }
        self.online_geocode(&mut mirror).await;
        self.probe_optional_modules(&mut mirror).await;
        mirror
    }

    async fn resolve_ip(&self, mirror: &mut MirrorState) {
        tracing::debug!(target: TARGET, "Set IPs for mirror {:?}", mirror.name);
        match self.resolver.ipv4_lookup(mirror.name.as_str()).await {
            Ok(lookup) => {
                mirror.ip = lookup
                    .iter()
                    .map(|record| record.0.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                if mirror.ip.is_empty() {
                    mirror.ip = UNKNOWN.to_string();
                }
            }
            Err(err) => {
                let err = crate::types::NetErr::Dns(err);
                tracing::warn!(target: TARGET, "Can not get IP of mirror {:?}: {err}", mirror.name);
                mirror.ip = UNKNOWN.to_string();
                mirror.status = MirrorStatus::Unavailable(format!("Unknown IP ({err})"));
            }
        }
    }

    /// Reachability, freshness and repo coverage, with the flap cache
    /// short-circuiting mirrors that failed recently.
    async fn probe_status(&self, mirror: &mut MirrorState) {
        if mirror.private || WHITELIST_MIRRORS.contains(&mirror.name.as_str()) {
            tracing::debug!(
                target: TARGET,
                "Mirror {:?} is private or in exclusion list",
                mirror.name,
            );
            mirror.status = MirrorStatus::Ok;
            return;
        }
        if let Some(reason) = self.cache.flap_reason(&mirror.name).await {
            tracing::info!(target: TARGET, "Mirror {:?} flapped recently: {reason}", mirror.name);
            mirror.status = MirrorStatus::Unavailable(reason);
            return;
        }
        if let Err(reason) = url_available(&self.client, &mirror.mirror_url, false).await {
            tracing::info!(target: TARGET, "Mirror {:?} is not available: {reason}", mirror.name);
            self.cache.set_flapped(&mirror.name, &reason).await;
            mirror.status = MirrorStatus::Unavailable(reason);
            return;
        }
        if self.is_expired(mirror).await {
            tracing::info!(target: TARGET, "Mirror {:?} is expired", mirror.name);
            mirror.status = MirrorStatus::Expired;
            self.cache.clear_flapped(&mirror.name).await;
            return;
        }
        let probe_urls = repo_probe_urls(&self.config, mirror.cloud_type.is_cloud(), &mirror.mirror_url);
        match check_all(&self.client, probe_urls, REPO_PROBES_IN_FLIGHT, false).await {
            Ok(()) => {
                tracing::debug!(target: TARGET, "Mirror {:?} is actual", mirror.name);
                mirror.status = MirrorStatus::Ok;
                self.cache.clear_flapped(&mirror.name).await;
            }
            Err(reason) => {
                tracing::info!(
                    target: TARGET,
                    "Mirror {:?} has unavailable repositories: {reason}",
                    mirror.name,
                );
                self.cache.set_flapped(&mirror.name, &reason).await;
                mirror.status = MirrorStatus::Unavailable(reason);
            }
        }
    }

    async fn is_expired(&self, mirror: &MirrorState) -> bool {
        let url = join_url(&mirror.mirror_url, "TIME");
        let body = async {
            self.client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        }
        .await;
        match body {
            Ok(text) => match text.trim().parse::<f64>() {
                Ok(stamp) => timestamp_is_expired(stamp, self.config.allowed_outdate),
                Err(_) => {
                    tracing::warn!(
                        target: TARGET,
                        "Mirror {:?} has broken timestamp file by url {url:?}",
                        mirror.name,
                    );
                    true
                }
            },
            Err(err) => {
                tracing::warn!(
                    target: TARGET,
                    "Mirror {:?} has no timestamp file by url {url:?} because {err}",
                    mirror.name,
                );
                true
            }
        }
    }

    fn apply_cloud_subnets(
        &self,
        mirror: &mut MirrorState,
        clouds: &HashMap<CloudType, RegionSubnets>,
    ) {
        if !mirror.cloud_type.is_cloud() {
            return;
        }
        tracing::debug!(target: TARGET, "Set subnets for mirror {:?}", mirror.name);
        let Some(regions) = clouds.get(&mirror.cloud_type) else {
            return;
        };
        let subnets = mirror
            .cloud_regions
            .iter()
            .filter_map(|region| regions.get(&region.to_lowercase()))
            .flatten()
            .copied()
            .collect();
        mirror.set_subnets(subnets);
    }

    async fn probe_ipv6(&self, mirror: &mut MirrorState) {
        mirror.ipv6 = match self.resolver.ipv6_lookup(mirror.name.as_str()).await {
            Ok(lookup) => lookup.iter().next().is_some(),
            Err(_) => false,
        };
    }

    /// Geodata of the first resolvable address, merged write-once under the
    /// declared YAML values, with the country normalized to alpha-2.
    fn offline_geodata(&self, mirror: &mut MirrorState) {
        tracing::debug!(target: TARGET, "Set geodata for mirror {:?} from offline DB", mirror.name);
        let resolved = mirror
            .ip
            .split(',')
            .find_map(|address| self.geo.geo_str(address));
        match resolved {
            Some(geodata) => {
                mirror.location = Some(Location {
                    latitude: geodata.latitude,
                    longitude: geodata.longitude,
                });
                mirror.geolocation.merge(&GeoLocation {
                    continent: geodata.continent,
                    country: geodata.country,
                    state_province: geodata.state_province.unwrap_or_default(),
                    city: geodata.city.unwrap_or_default(),
                });
            }
            None => {
                tracing::warn!(
                    target: TARGET,
                    "Mirror {:?} does not have geo data for any of its IPs",
                    mirror.name,
                );
            }
        }
        if let Some(country) = self.geo.normalize_country(&mirror.geolocation.country) {
            mirror.geolocation.country = country;
        }
        if mirror.geolocation.continent.is_empty()
            && let Some(continent) = self.geo.continent_for(&mirror.geolocation.country)
        {
            mirror.geolocation.continent = continent.to_string();
        }
    }

    async fn probe_iso_set(&self, mirror: &mut MirrorState, iso_uris: &[String]) {
        tracing::debug!(target: TARGET, "Check the full ISO set of mirror {:?}", mirror.name);
        let urls = iso_uris
            .iter()
            .map(|uri| join_url(&mirror.mirror_url, uri))
            .collect();
        match check_all(&self.client, urls, ISO_PROBES_IN_FLIGHT, true).await {
            Ok(()) => mirror.has_full_iso_set = true,
            Err(reason) => {
                tracing::debug!(
                    target: TARGET,
                    "Mirror {:?} has an incomplete ISO set: {reason}",
                    mirror.name,
                );
            }
        }
    }

    /// Refine coordinates through the public geocoder, cached per
    /// (country, state, city) and rate-limited to one call per second
    /// across the whole update cycle.
    async fn online_geocode(&self, mirror: &mut MirrorState) {
        if !mirror.status.is_ok() || !mirror.geolocation.mandatory_fields_set() {
            return;
        }
        let geolocation = &mirror.geolocation;
        let key = cache::geolocation_key(
            &geolocation.country,
            &geolocation.state_province,
            &geolocation.city,
        );
        if let Some(location) = self.cache.get_json::<Location>(&key).await {
            mirror.location = Some(location);
            return;
        }
        tracing::debug!(target: TARGET, "Set geodata for mirror {:?} from online DB", mirror.name);
        let mut gate = self.geocoder_gate.lock().await;
        if let Some(last) = *gate {
            let elapsed = last.elapsed();
            if elapsed < Duration::from_secs(1) {
                tokio::time::sleep(Duration::from_secs(1) - elapsed).await;
            }
        }
        let result = self.geocode_request(geolocation).await;
        *gate = Some(Instant::now());
        drop(gate);

        match result {
            Ok(Some(location)) => {
                self.cache.set_json(&key, &location, CACHE_EXPIRED_TIME).await;
                mirror.location = Some(location);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target: TARGET,
                    "Cannot get geodata for mirror {:?} from online DB because {err}",
                    mirror.name,
                );
            }
        }
    }

    async fn geocode_request(
        &self,
        geolocation: &GeoLocation,
    ) -> Result<Option<Location>, reqwest::Error> {
        #[derive(serde::Deserialize)]
        struct Place {
            lat: String,
            lon: String,
        }
        let places: Vec<Place> = self
            .client
            .get(format!("{}/search", self.nominatim_url))
            .query(&[
                ("city", geolocation.city.as_str()),
                ("state", geolocation.state_province.as_str()),
                ("country", geolocation.country.as_str()),
                ("format", "json"),
                ("limit", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(places.first().and_then(|place| {
            Some(Location {
                latitude: place.lat.parse().ok()?,
                longitude: place.lon.parse().ok()?,
            })
        }))
    }

    /// One repodata probe per (module version, arch); a module counts only
    /// when every combination answers.
    async fn probe_optional_modules(&self, mirror: &mut MirrorState) {
        if !mirror.status.is_ok() {
            return;
        }
        let repo_path = self
            .config
            .repos
            .iter()
            .find(|repo| !repo.vault)
            .map(|repo| repo.path.clone());
        let Some(repo_path) = repo_path else {
            return;
        };
        let declared: Vec<String> = mirror.module_urls.keys().cloned().collect();
        for module in declared {
            let Some(versions) = self.config.optional_module_versions.get(&module) else {
                continue;
            };
            let Some(base) = mirror.module_base_url(&module, None).map(str::to_string) else {
                continue;
            };
            let mut urls = Vec::new();
            for version in versions {
                let module_version = format!("{version}-{module}");
                let Some(arches) = self.config.arches_for_version(version) else {
                    continue;
                };
                for arch in arches {
                    let path = repo_path.replace("$basearch", arch);
                    urls.push(join_url(
                        &base,
                        &format!("{module_version}/{path}/repodata/repomd.xml"),
                    ));
                }
            }
            match check_all(&self.client, urls, REPO_PROBES_IN_FLIGHT, false).await {
                Ok(()) => mirror.has_optional_modules.push(module),
                Err(reason) => {
                    tracing::debug!(
                        target: TARGET,
                        "Mirror {:?} does not serve module {module:?}: {reason}",
                        mirror.name,
                    );
                }
            }
        }
    }
}

/// Seed a mirror state from its declaration, before any probing.
pub fn state_from_decl(decl: MirrorDecl, required_protocols: &[String]) -> MirrorState {
    let mirror_url = decl
        .preferred_url(required_protocols)
        .unwrap_or_default()
        .to_string();
    let iso_url = join_url(&mirror_url, "%s/isos/%s");
    let mut mirror = MirrorState {
        name: decl.name,
        sponsor: decl.sponsor,
        email: decl.email,
        update_frequency: decl.update_frequency,
        urls: decl.urls,
        module_urls: decl.module_urls,
        subnets: Vec::new(),
        subnets_int: Vec::new(),
        asn: decl.asn,
        cloud_type: decl.cloud_type,
        cloud_regions: decl.cloud_regions,
        private: decl.private,
        monopoly: decl.monopoly,
        ip: UNKNOWN.to_string(),
        ipv6: false,
        mirror_url,
        iso_url,
        location: None,
        geolocation: decl.geolocation,
        status: MirrorStatus::Ok,
        has_full_iso_set: false,
        has_optional_modules: Vec::new(),
    };
    mirror.set_subnets(decl.subnets);
    mirror
}

/// A mirror is stale when its published timestamp is older than the
/// allowed lag, or unreadable.
pub fn timestamp_is_expired(stamp: f64, allowed_outdate: Duration) -> bool {
    if !stamp.is_finite() {
        return true;
    }
    let now = chrono::Utc::now().timestamp() as f64;
    now - stamp > allowed_outdate.as_secs_f64()
}

/// Availability of one URL, with a bounded retry on transport errors.
/// The error carries the reason used for `status` and the flap memo.
pub async fn url_available(
    client: &reqwest::Client,
    url: &str,
    head: bool,
) -> Result<(), String> {
    let mut last_error = String::new();
    for attempt in 0..HTTP_RETRY_ATTEMPTS {
        let request = if head { client.head(url) } else { client.get(url) };
        match request.send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                return Err(format!("url {url:?} returned status {}", response.status()));
            }
            Err(err) if err.is_timeout() || err.is_connect() => {
                last_error = format!("url {url:?} is not available because {err}");
                if attempt + 1 < HTTP_RETRY_ATTEMPTS {
                    continue;
                }
            }
            Err(err) => {
                return Err(format!("url {url:?} is not available because {err}"));
            }
        }
    }
    Err(last_error)
}

/// Probe a batch of URLs under a bounded fan-out. The first negative
/// result cancels every sibling and becomes the returned reason.
pub async fn check_all(
    client: &reqwest::Client,
    urls: Vec<String>,
    limit: usize,
    head: bool,
) -> Result<(), String> {
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut tasks: JoinSet<Result<(), String>> = JoinSet::new();
    for url in urls {
        let client = client.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| "probe cancelled".to_string())?;
            url_available(&client, &url, head).await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                tasks.abort_all();
                return Err(reason);
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                tasks.abort_all();
                return Err(err.to_string());
            }
        }
    }
    Ok(())
}

/// Cross-product of repodata URLs a public mirror must answer: every
/// probed version, every non-vault repo after version/arch restriction.
/// Cloud mirrors do not carry beta versions.
pub fn repo_probe_urls(config: &ServiceConfig, cloud: bool, base: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for version in config.probe_versions() {
        if cloud && version.contains("beta") {
            continue;
        }
        for repo in config.repos.iter().filter(|repo| !repo.vault) {
            if !repo.versions.is_empty() && !repo.versions.contains(version) {
                continue;
            }
            let arches: &[String] = if repo.arches.is_empty() {
                config.arches_for_version(version).unwrap_or(&[])
            } else {
                &repo.arches
            };
            for arch in arches {
                let path = repo.path.replace("$basearch", arch);
                urls.push(join_url(
                    base,
                    &format!("{version}/{path}/repodata/repomd.xml"),
                ));
            }
        }
    }
    urls
}

/// Relative URIs of the full ISO artefact set, per probed version and arch.
pub fn iso_uris(config: &ServiceConfig) -> Vec<String> {
    let mut uris = Vec::new();
    for version in config.probe_versions() {
        let Some(arches) = config.arches_for_version(version) else {
            continue;
        };
        let iso_version = if version.contains("beta") {
            format!("{version}-1")
        } else {
            version.clone()
        };
        for arch in arches {
            for template in ISO_FILE_TEMPLATES {
                let file = template
                    .replace("{version}", &iso_version)
                    .replace("{arch}", arch);
                uris.push(format!("{version}/isos/{arch}/{file}"));
            }
        }
    }
    uris
}

/// Guard on `MIRRORS_UPDATE_PID` so only one update cycle runs at a time.
struct UpdateLock {
    path: Option<PathBuf>,
}

impl UpdateLock {
    fn acquire() -> Result<Self, MirrorsError> {
        let Some(path) = std::env::var_os("MIRRORS_UPDATE_PID") else {
            return Ok(UpdateLock { path: None });
        };
        let path = PathBuf::from(path);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(UpdateLock { path: Some(path) })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(MirrorsError::UpdateLocked(path.display().to_string()))
            }
            Err(err) => Err(MirrorsError::Io(err)),
        }
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// One full update cycle: reload configuration, probe every mirror under
/// the top-level fan-out limit, swap the store in one transaction and
/// rebuild the filtered-list caches. Returns the elapsed time rendered
/// for the update endpoint.
pub async fn run_update(app: &App) -> Result<String, MirrorsError> {
    let _lock = UpdateLock::acquire()?;
    let started = Instant::now();

    let config = Arc::new(
        config::load_service_config(&app.service_config_path())
            .await
            .map_err(MirrorsError::Config)?,
    );
    app.replace_config(config.clone()).await;
    let decls =
        config::load_mirror_decls(&app.client, &config, &app.mirrors_dir(&config)).await;
    tracing::info!(
        target: TARGET,
        "Update of the mirrors list is started, {} mirrors",
        decls.len(),
    );

    let mut cloud_catalogues: HashMap<CloudType, RegionSubnets> = HashMap::new();
    for cloud_type in decls.iter().map(|decl| decl.cloud_type) {
        if cloud_type.is_cloud() && !cloud_catalogues.contains_key(&cloud_type) {
            let catalogue = clouds::provider_subnets(&app.client, &app.cache, cloud_type).await;
            cloud_catalogues.insert(cloud_type, catalogue);
        }
    }
    let cloud_catalogues = Arc::new(cloud_catalogues);
    let iso_uris = Arc::new(iso_uris(&config));

    let processor = Arc::new(MirrorProcessor::new(
        app.client.clone(),
        app.geo.clone(),
        app.cache.clone(),
        config.clone(),
    ));
    let semaphore = Arc::new(Semaphore::new(MIRRORS_IN_FLIGHT));
    let mut tasks = JoinSet::new();
    for decl in decls {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let processor = processor.clone();
        let cloud_catalogues = cloud_catalogues.clone();
        let iso_uris = iso_uris.clone();
        tasks.spawn(async move {
            let _permit = permit;
            processor.process(decl, &cloud_catalogues, &iso_uris).await
        });
    }
    let mut mirrors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(mirror) => mirrors.push(mirror),
            Err(err) => tracing::error!(target: TARGET, "Mirror task failed: {err}"),
        }
    }
    mirrors.sort_by(|a, b| a.name.cmp(&b.name));

    app.store.swap(&mirrors).await.map_err(MirrorsError::Store)?;
    app.store
        .refresh_filter_caches()
        .await
        .map_err(MirrorsError::Store)?;

    let elapsed = Duration::from_secs(started.elapsed().as_secs());
    let message = format!(
        "Update of the mirrors list is finished in {}",
        humantime::format_duration(elapsed),
    );
    tracing::info!(target: TARGET, "{message}");
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::parse_service_config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERVICE_YAML: &str = r#"
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
  - name: AppStream
    path: AppStream/$basearch/os
    versions: ["9"]
  - name: vault-extras
    path: extras/$basearch/os
    vault: true
vault_mirror: https://vault.example
mirrors_dir: mirrors
"#;

    fn service_config() -> ServiceConfig {
        parse_service_config("test", SERVICE_YAML).unwrap()
    }

    #[test]
    fn repo_probe_urls_cross_product() {
        let config = service_config();
        let urls = repo_probe_urls(&config, false, "https://a.example/alma");
        // Probed version is only "9" ("8" is an alias): BaseOS has two
        // arches, AppStream is restricted to 9 with two arches.
        assert_eq!(urls.len(), 4);
        assert!(urls.contains(
            &"https://a.example/alma/9/BaseOS/x86_64/os/repodata/repomd.xml".to_string()
        ));
        assert!(urls.contains(
            &"https://a.example/alma/9/AppStream/aarch64/os/repodata/repomd.xml".to_string()
        ));
        assert!(!urls.iter().any(|url| url.contains("extras")));
        assert!(!urls.iter().any(|url| url.contains("$basearch")));
    }

    #[test]
    fn cloud_mirrors_skip_beta_versions() {
        let yaml = SERVICE_YAML
            .replace(r#"versions: ["8", "9"]"#, r#"versions: ["9", "9-beta"]"#)
            .replace(
                "arches:\n  \"8\": [x86_64, aarch64]",
                "arches:\n  \"9-beta\": [x86_64]",
            )
            .replace("duplicated_versions:\n  \"8\": \"8.9\"\n", "");
        let config = parse_service_config("test", &yaml).unwrap();
        let public = repo_probe_urls(&config, false, "https://a.example");
        let cloud = repo_probe_urls(&config, true, "https://a.example");
        assert!(public.iter().any(|url| url.contains("9-beta")));
        assert!(!cloud.iter().any(|url| url.contains("9-beta")));
    }

    #[test]
    fn iso_uris_enumerate_the_artefact_set() {
        let config = service_config();
        let uris = iso_uris(&config);
        // One probed version, two arches, seven artefacts each.
        assert_eq!(uris.len(), 14);
        assert!(uris.contains(&"9/isos/x86_64/AlmaLinux-9-x86_64-dvd.iso".to_string()));
        assert!(uris.contains(&"9/isos/aarch64/CHECKSUM".to_string()));
    }

    #[test]
    fn beta_iso_files_carry_the_release_suffix() {
        let yaml = SERVICE_YAML
            .replace(r#"versions: ["8", "9"]"#, r#"versions: ["9-beta"]"#)
            .replace(
                "arches:\n  \"8\": [x86_64, aarch64]\n  \"9\": [x86_64, aarch64]",
                "arches:\n  \"9-beta\": [x86_64]",
            )
            .replace("duplicated_versions:\n  \"8\": \"8.9\"\n", "")
            .replace("    versions: [\"9\"]\n", "");
        let config = parse_service_config("test", &yaml).unwrap();
        let uris = iso_uris(&config);
        assert!(
            uris.contains(&"9-beta/isos/x86_64/AlmaLinux-9-beta-1-x86_64-boot.iso".to_string())
        );
    }

    #[test]
    fn stale_and_broken_timestamps_expire() {
        let allowed = Duration::from_secs(6 * 3600);
        let now = chrono::Utc::now().timestamp() as f64;
        assert!(!timestamp_is_expired(now - 60.0, allowed));
        assert!(timestamp_is_expired(now - 7.0 * 3600.0, allowed));
        assert!(timestamp_is_expired(f64::NAN, allowed));
        assert!(timestamp_is_expired(f64::INFINITY, allowed));
    }

    #[test]
    fn state_from_decl_selects_preferred_url() {
        let decl = crate::app::config::parse_mirror_decl(
            "test",
            r#"
name: mirror.example.org
sponsor: {name: Example, url: "https://example.org"}
update_frequency: 1h
urls:
  http: http://mirror.example.org/alma
  https: https://mirror.example.org/alma
subnets: ["192.0.2.0/24"]
"#,
        )
        .unwrap();
        let mirror = state_from_decl(decl, &["https".to_string(), "http".to_string()]);
        assert_eq!(mirror.mirror_url, "https://mirror.example.org/alma");
        assert_eq!(mirror.iso_url, "https://mirror.example.org/alma/%s/isos/%s");
        assert_eq!(mirror.subnets_int.len(), 1);
        assert_eq!(mirror.status, MirrorStatus::Ok);
        assert_eq!(mirror.ip, UNKNOWN);
    }

    #[tokio::test]
    async fn url_available_reports_status_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = reqwest::Client::new();
        assert!(
            url_available(&client, &format!("{}/ok", server.uri()), false)
                .await
                .is_ok()
        );
        let err = url_available(&client, &format!("{}/missing", server.uri()), false)
            .await
            .unwrap_err();
        assert!(err.contains("404"));
    }

    #[tokio::test]
    async fn check_all_passes_when_every_artefact_answers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let client = reqwest::Client::new();
        let urls = (0..8).map(|i| format!("{}/file-{i}", server.uri())).collect();
        assert!(check_all(&client, urls, 3, true).await.is_ok());
    }

    #[tokio::test]
    async fn check_all_cancels_on_first_failure() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file-3"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let client = reqwest::Client::new();
        let urls = (0..20).map(|i| format!("{}/file-{i}", server.uri())).collect();
        let err = check_all(&client, urls, 3, true).await.unwrap_err();
        assert!(err.contains("file-3"), "got {err}");
    }
}
