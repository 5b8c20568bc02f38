//! Request-time mirror selection: version/arch/repo validation, the vault
//! short-circuit, network-affinity and geographic candidate passes, and
//! URL rendering.

use std::collections::BTreeMap;
use std::net::IpAddr;

use rand::seq::SliceRandom;

use super::App;
use super::cache;
use super::config::ServiceConfig;
use super::constants::{CACHE_EXPIRED_TIME, LENGTH_CLOUD_MIRRORS_LIST, LENGTH_GEO_MIRRORS_LIST};
use super::geo::{GeoData, haversine_km};
use super::join_url;
use super::store::MirrorFilter;
use crate::types::{ApiError, MirrorState};

/// One mirrorlist/isolist request after HTTP decoding.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub ip: Option<IpAddr>,
    pub version: String,
    pub repository: Option<String>,
    pub arch: Option<String>,
    pub protocol: Option<String>,
    pub country: Option<String>,
    pub module: Option<String>,
    pub iso_list: bool,
}

/// Normalize a requested version onto the canonical version list.
pub fn normalize_version(config: &ServiceConfig, version: &str) -> Result<String, ApiError> {
    if config.is_active_version(version) {
        if let Some(target) = config.duplicated_versions.get(version) {
            return Ok(target.clone());
        }
        return Ok(version.to_string());
    }
    if config.is_vault_version(version) {
        return Ok(version.to_string());
    }
    if module_from_version(config, version).is_some() {
        return Ok(version.to_string());
    }
    // Point minors of an alias normalize onto its target; the longest
    // matching alias wins.
    let prefix_match = config
        .duplicated_versions
        .iter()
        .filter(|(alias, _)| version.starts_with(alias.as_str()))
        .max_by_key(|(alias, _)| alias.len())
        .map(|(_, target)| target.clone());
    if let Some(target) = prefix_match {
        return Ok(target);
    }
    let mut allowed: Vec<&str> = config
        .versions
        .iter()
        .chain(config.vault_versions.iter())
        .map(String::as_str)
        .collect();
    let optional: Vec<String> = optional_versions(config);
    allowed.extend(optional.iter().map(String::as_str));
    Err(ApiError::UnknownRepoAttribute(format!(
        "Unknown version {version:?}. Allowed list of versions \"{}\"",
        allowed.join(", "),
    )))
}

/// Versions of the shape `<base>-<module>` for every optional module.
fn optional_versions(config: &ServiceConfig) -> Vec<String> {
    config
        .optional_module_versions
        .iter()
        .flat_map(|(module, versions)| {
            versions
                .iter()
                .map(move |version| format!("{version}-{module}"))
        })
        .collect()
}

/// The module encoded in a `<base>-<module>` version, if any.
pub fn module_from_version(config: &ServiceConfig, version: &str) -> Option<String> {
    for (module, versions) in &config.optional_module_versions {
        for base in versions {
            if version == format!("{base}-{module}") {
                return Some(module.clone());
            }
        }
    }
    None
}

/// `arch` must be allowed for the (possibly normalized) version.
pub fn validate_arch(config: &ServiceConfig, version: &str, arch: &str) -> Result<(), ApiError> {
    let arches = config.arches_for_version(version).ok_or_else(|| {
        ApiError::UnknownRepoAttribute(format!("Unknown version {version:?}"))
    })?;
    if arches.iter().any(|allowed| allowed == arch) {
        Ok(())
    } else {
        Err(ApiError::UnknownRepoAttribute(format!(
            "Unknown architecture {arch:?}. Allowed list of arches \"{}\"",
            arches.join(", "),
        )))
    }
}

/// Mirrorlist entry point: returns the ordered list of base URLs composed
/// with `<version>/<repo_path>`.
pub async fn mirrorlist(app: &App, request: &SelectionRequest) -> Result<Vec<String>, ApiError> {
    let config = app.service_config().await;

    let repo = match (request.iso_list, request.repository.as_deref()) {
        (true, _) => None,
        (false, repository) => {
            let repository = repository.unwrap_or_default();
            Some(config.repo(repository).ok_or_else(|| {
                ApiError::UnknownRepoAttribute(format!(
                    "Unknown repository {repository:?}. Allowed list of repositories \"{}\"",
                    config
                        .repos
                        .iter()
                        .map(|repo| repo.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                ))
            })?)
        }
    };

    let version = normalize_version(&config, &request.version)?;
    let arch = match request.arch.as_deref() {
        Some(arch) => {
            validate_arch(&config, &version, arch)?;
            Some(arch.to_string())
        }
        None => config.default_arch(&version),
    };
    let module = request
        .module
        .clone()
        .or_else(|| module_from_version(&config, &version));

    let repo_path = match repo {
        Some(repo) => repo.path.clone(),
        None => format!("isos/{}", arch.as_deref().unwrap_or_default()),
    };

    // Vault versions and vault repos are served from the single vault base.
    if config.is_vault_version(&version) || repo.is_some_and(|repo| repo.vault) {
        let mut path = repo_path;
        if let Some(arch) = arch.as_deref() {
            path = path.replace("$basearch", arch);
        }
        return Ok(vec![join_url(
            &config.vault_mirror,
            &format!("{version}/{path}"),
        )]);
    }

    let selected = cached_selection(app, &config, request, module.as_deref()).await?;
    Ok(render_urls(
        &selected,
        &version,
        &repo_path,
        arch.as_deref(),
        request.protocol.as_deref(),
        module.as_deref(),
    ))
}

/// Selection with the per-client cache in front of the candidate passes.
async fn cached_selection(
    app: &App,
    config: &ServiceConfig,
    request: &SelectionRequest,
    module: Option<&str>,
) -> Result<Vec<MirrorState>, ApiError> {
    let cache_key = request.ip.map(|ip| {
        cache::selection_key(
            ip,
            request.protocol.as_deref(),
            request.country.as_deref(),
            module,
        )
    });
    if let Some(key) = &cache_key
        && let Some(cached) = app.cache.get_json::<Vec<MirrorState>>(key).await
    {
        return Ok(cached);
    }
    let selected = nearest_mirrors(
        app,
        config,
        MirrorFilter::mirrorlist(request.iso_list),
        request.ip,
        request.protocol.as_deref(),
        request.country.as_deref(),
        module,
    )
    .await?;
    if let Some(key) = &cache_key {
        app.cache.set_json(key, &selected, CACHE_EXPIRED_TIME).await;
    }
    Ok(selected)
}

/// Candidate selection: network affinity first, geography as fallback.
pub async fn nearest_mirrors(
    app: &App,
    config: &ServiceConfig,
    filter: MirrorFilter,
    ip: Option<IpAddr>,
    protocol: Option<&str>,
    country: Option<&str>,
    module: Option<&str>,
) -> Result<Vec<MirrorState>, ApiError> {
    let Some(ip) = ip else {
        return all_filtered(app, filter, protocol, country, module).await;
    };

    let mirrors = all_filtered(app, filter, protocol, country, module).await?;
    let geodata = app.geo.geo(ip);
    let client_asn = app.geo.asn(ip);
    let by_network = select_by_network(
        &mirrors,
        ip,
        client_asn,
        geodata.as_ref(),
        config.randomize_within_km,
    );
    if !by_network.is_empty() {
        return Ok(by_network);
    }

    // Private and cloud mirrors are only reachable through network
    // affinity; the geographic fallback excludes them.
    let geo_filter = MirrorFilter {
        without_private: true,
        without_cloud: true,
        ..filter
    };
    let candidates = all_filtered(app, geo_filter, protocol, country, module).await?;
    Ok(select_by_geo(
        candidates,
        geodata.as_ref(),
        config.randomize_within_km,
    ))
}

/// Filtered mirror list with the per-request constraints applied, in
/// random order.
async fn all_filtered(
    app: &App,
    filter: MirrorFilter,
    protocol: Option<&str>,
    country: Option<&str>,
    module: Option<&str>,
) -> Result<Vec<MirrorState>, ApiError> {
    let list = app
        .store
        .list(filter)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    let mut mirrors = apply_request_filters(&list, protocol, country, module);
    mirrors.shuffle(&mut rand::rng());
    Ok(mirrors)
}

/// Protocol, country and module constraints from the query string.
pub fn apply_request_filters(
    mirrors: &[MirrorState],
    protocol: Option<&str>,
    country: Option<&str>,
    module: Option<&str>,
) -> Vec<MirrorState> {
    mirrors
        .iter()
        .filter(|mirror| match protocol {
            Some(protocol) => mirror.urls.contains_key(protocol),
            None => true,
        })
        .filter(|mirror| match country {
            Some(country) => mirror.geolocation.country.eq_ignore_ascii_case(country),
            None => true,
        })
        .filter(|mirror| match module {
            Some(module) => mirror
                .has_optional_modules
                .iter()
                .any(|declared| declared == module),
            None => true,
        })
        .cloned()
        .collect()
}

/// Mirrors in the same subnet or autonomous system as the client. A
/// matching monopoly mirror is returned alone; a short match list is
/// padded with nearby public mirrors.
pub fn select_by_network(
    mirrors: &[MirrorState],
    ip: IpAddr,
    client_asn: Option<u32>,
    geodata: Option<&GeoData>,
    randomize_within_km: u32,
) -> Vec<MirrorState> {
    let mut suitable: Vec<MirrorState> = Vec::new();
    for mirror in mirrors {
        if !mirror.status.is_ok() {
            continue;
        }
        let asn_match =
            client_asn.is_some_and(|asn| mirror.asn.iter().any(|declared| *declared == asn));
        if asn_match || mirror.contains_ip(ip) {
            if mirror.monopoly {
                return vec![mirror.clone()];
            }
            suitable.push(mirror.clone());
        }
    }
    if !suitable.is_empty()
        && suitable.len() < LENGTH_CLOUD_MIRRORS_LIST
        && let Some(geodata) = geodata
    {
        let additional: Vec<MirrorState> = mirrors
            .iter()
            .filter(|mirror| {
                mirror.status.is_ok()
                    && !mirror.private
                    && !mirror.cloud_type.is_cloud()
                    && !suitable.iter().any(|chosen| chosen.name == mirror.name)
            })
            .cloned()
            .collect();
        let sorted = sort_by_distance_and_country(
            additional,
            (geodata.latitude, geodata.longitude),
            &geodata.country,
        );
        let padded = randomize_within_radius(sorted, &geodata.country, randomize_within_km);
        let deficit = LENGTH_CLOUD_MIRRORS_LIST - suitable.len();
        suitable.extend(padded.into_iter().take(deficit));
    }
    suitable.truncate(LENGTH_CLOUD_MIRRORS_LIST);
    suitable
}

/// Geographic pass: nearest-K with in-radius randomization, or the list
/// as-is (already shuffled) when the client has no usable geodata.
pub fn select_by_geo(
    mirrors: Vec<MirrorState>,
    geodata: Option<&GeoData>,
    randomize_within_km: u32,
) -> Vec<MirrorState> {
    let ordered = match geodata {
        Some(geodata) if geodata.has_locality() => {
            let sorted = sort_by_distance_and_country(
                mirrors,
                (geodata.latitude, geodata.longitude),
                &geodata.country,
            );
            randomize_within_radius(sorted, &geodata.country, randomize_within_km)
        }
        // Coordinates without any locality are too coarse for a distance
        // sort; spread the load instead.
        _ => mirrors,
    };
    ordered
        .into_iter()
        .take(LENGTH_GEO_MIRRORS_LIST)
        .collect()
}

/// Sort by `(country mismatch, great-circle distance)`. Mirrors without
/// coordinates sort last within their country bucket.
pub fn sort_by_distance_and_country(
    mirrors: Vec<MirrorState>,
    origin: (f64, f64),
    country: &str,
) -> Vec<(u32, MirrorState)> {
    let mut keyed: Vec<(u32, MirrorState)> = mirrors
        .into_iter()
        .map(|mirror| {
            let distance = mirror
                .location
                .map(|location| {
                    haversine_km(origin, (location.latitude, location.longitude)) as u32
                })
                .unwrap_or(u32::MAX);
            (distance, mirror)
        })
        .collect();
    keyed.sort_by_key(|(distance, mirror)| (mirror.geolocation.country != country, *distance));
    keyed
}

/// Shuffle the mirrors within the radius so the single nearest mirror does
/// not absorb a whole city's load, keeping the four-bucket order:
/// in-country near, in-country far, out-of-country near, out-of-country far.
pub fn randomize_within_radius(
    sorted: Vec<(u32, MirrorState)>,
    country: &str,
    radius_km: u32,
) -> Vec<MirrorState> {
    let mut in_country_near = Vec::new();
    let mut in_country_far = Vec::new();
    let mut other_near = Vec::new();
    let mut other_far = Vec::new();
    for (distance, mirror) in sorted {
        match (mirror.geolocation.country == country, distance <= radius_km) {
            (true, true) => in_country_near.push(mirror),
            (true, false) => in_country_far.push(mirror),
            (false, true) => other_near.push(mirror),
            (false, false) => other_far.push(mirror),
        }
    }
    let mut rng = rand::rng();
    in_country_near.shuffle(&mut rng);
    other_near.shuffle(&mut rng);

    let mut ordered = in_country_near;
    ordered.append(&mut in_country_far);
    ordered.append(&mut other_near);
    ordered.append(&mut other_far);
    ordered
}

/// Compose the response URLs: `<base>/<version>/<repo_path>` with
/// `$basearch` substituted, over the module URL mapping when a module is
/// requested.
pub fn render_urls(
    mirrors: &[MirrorState],
    version: &str,
    repo_path: &str,
    arch: Option<&str>,
    protocol: Option<&str>,
    module: Option<&str>,
) -> Vec<String> {
    mirrors
        .iter()
        .filter_map(|mirror| {
            let base = match module {
                Some(module) => mirror.module_base_url(module, protocol),
                None => mirror.base_url(protocol),
            }?;
            let mut url = join_url(base, &format!("{version}/{repo_path}"));
            if let Some(arch) = arch {
                url = url.replace("$basearch", arch);
            }
            Some(url)
        })
        .collect()
}

/// Public working mirrors with full ISO sets, grouped by country, plus the
/// nearest selection for the requesting client.
pub async fn isos_by_countries(
    app: &App,
    ip: Option<IpAddr>,
) -> Result<(BTreeMap<String, Vec<MirrorState>>, Vec<MirrorState>), ApiError> {
    let config = app.service_config().await;
    let filter = MirrorFilter::isos_by_country();
    let all = app
        .store
        .list(filter)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    let mut by_country: BTreeMap<String, Vec<MirrorState>> = BTreeMap::new();
    for mirror in all.iter() {
        by_country
            .entry(mirror.geolocation.country.clone())
            .or_default()
            .push(mirror.clone());
    }
    let nearest = nearest_mirrors(app, &config, filter, ip, None, None, None).await?;
    Ok((by_country, nearest))
}

/// arch -> client-facing versions shown on the ISO landing page.
pub fn main_isos_table(config: &ServiceConfig) -> BTreeMap<String, Vec<String>> {
    let mut table: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (version, arches) in &config.arches {
        if let Some(target) = config.duplicated_versions.get(version) {
            for arch in arches {
                table.entry(arch.clone()).or_default().push(target.clone());
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::parse_service_config;
    use crate::types::{CloudType, GeoLocation, Location, MirrorStatus, Sponsor};

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
optional_module_versions:
  kitten: ["10"]
repos:
  - name: BaseOS
    path: BaseOS/$basearch/os
  - name: vault-extras
    path: extras/$basearch/os
    vault: true
vault_mirror: https://vault.example
mirrors_dir: mirrors
"#;

    fn config() -> ServiceConfig {
        parse_service_config("test", SERVICE_YAML).unwrap()
    }

    fn mirror(name: &str, country: &str, location: (f64, f64)) -> MirrorState {
        let mut urls = std::collections::BTreeMap::new();
        urls.insert("http".to_string(), format!("http://{name}"));
        urls.insert("https".to_string(), format!("https://{name}"));
        MirrorState {
            name: name.to_string(),
            sponsor: Sponsor {
                name: "Example".to_string(),
                url: "https://example.org".to_string(),
            },
            email: "unknown".to_string(),
            update_frequency: "1h".to_string(),
            urls,
            module_urls: std::collections::BTreeMap::new(),
            subnets: Vec::new(),
            subnets_int: Vec::new(),
            asn: Vec::new(),
            cloud_type: CloudType::None,
            cloud_regions: Vec::new(),
            private: false,
            monopoly: false,
            ip: "192.0.2.1".to_string(),
            ipv6: false,
            mirror_url: format!("https://{name}"),
            iso_url: format!("https://{name}/%s/isos/%s"),
            location: Some(Location {
                latitude: location.0,
                longitude: location.1,
            }),
            geolocation: GeoLocation {
                continent: "Europe".to_string(),
                country: country.to_string(),
                state_province: "".to_string(),
                city: "".to_string(),
            },
            status: MirrorStatus::Ok,
            has_full_iso_set: false,
            has_optional_modules: Vec::new(),
        }
    }

    fn geodata(country: &str, location: (f64, f64)) -> GeoData {
        GeoData {
            continent: "Europe".to_string(),
            country: country.to_string(),
            state_province: Some("Berlin".to_string()),
            city: Some("Berlin".to_string()),
            latitude: location.0,
            longitude: location.1,
        }
    }

    #[test]
    fn version_normalization_rules() {
        let config = config();
        // Alias key among active versions.
        assert_eq!(normalize_version(&config, "8").unwrap(), "8.9");
        // Plain active and vault versions pass through.
        assert_eq!(normalize_version(&config, "9").unwrap(), "9");
        assert_eq!(normalize_version(&config, "7").unwrap(), "7");
        // Point minor of an alias key.
        assert_eq!(normalize_version(&config, "8.4").unwrap(), "8.9");
        // Optional module versions are accepted as-is.
        assert_eq!(normalize_version(&config, "10-kitten").unwrap(), "10-kitten");
        assert!(matches!(
            normalize_version(&config, "6"),
            Err(ApiError::UnknownRepoAttribute(_))
        ));
    }

    #[test]
    fn alias_target_resolves_even_when_versions_list_only_has_the_alias() {
        let yaml = SERVICE_YAML
            .replace(r#"versions: ["8", "9"]"#, r#"versions: ["9"]"#)
            .replace("\"8\": \"8.9\"", "\"9\": \"9.5\"");
        let config = parse_service_config("test", &yaml).unwrap();
        assert_eq!(normalize_version(&config, "9.5").unwrap(), "9.5");
        assert_eq!(normalize_version(&config, "9").unwrap(), "9.5");
    }

    #[test]
    fn module_is_derived_from_version() {
        let config = config();
        assert_eq!(
            module_from_version(&config, "10-kitten").as_deref(),
            Some("kitten")
        );
        assert_eq!(module_from_version(&config, "9"), None);
    }

    #[test]
    fn arch_validation() {
        let config = config();
        assert!(validate_arch(&config, "9", "x86_64").is_ok());
        assert!(validate_arch(&config, "8.9", "aarch64").is_ok());
        assert!(matches!(
            validate_arch(&config, "9", "sparc"),
            Err(ApiError::UnknownRepoAttribute(_))
        ));
    }

    #[test]
    fn request_filters_constrain_protocol_country_and_module() {
        let mut only_http = mirror("http-only.example", "DE", (52.5, 13.4));
        only_http.urls.remove("https");
        let mut with_module = mirror("module.example", "FR", (48.8, 2.3));
        with_module.has_optional_modules.push("kitten".to_string());
        let mirrors = vec![only_http, with_module];

        // No protocol constraint keeps the http-only mirror.
        let unconstrained = apply_request_filters(&mirrors, None, None, None);
        assert_eq!(unconstrained.len(), 2);
        let https_only = apply_request_filters(&mirrors, Some("https"), None, None);
        assert_eq!(https_only.len(), 1);
        assert_eq!(https_only[0].name, "module.example");
        let german = apply_request_filters(&mirrors, None, Some("de"), None);
        assert_eq!(german.len(), 1);
        assert_eq!(german[0].name, "http-only.example");
        let with_kitten = apply_request_filters(&mirrors, None, None, Some("kitten"));
        assert_eq!(with_kitten.len(), 1);
        assert_eq!(with_kitten[0].name, "module.example");
    }

    #[test]
    fn network_pass_matches_subnets_and_asn() {
        let berlin = (52.5, 13.4);
        let mut in_subnet = mirror("subnet.example", "DE", berlin);
        in_subnet.set_subnets(vec!["198.51.100.0/24".parse().unwrap()]);
        let mut by_asn = mirror("asn.example", "DE", berlin);
        by_asn.asn = vec![64500];
        let unrelated = mirror("far.example", "US", (40.7, -74.0));
        let mirrors = vec![in_subnet, by_asn, unrelated];

        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let selected = select_by_network(&mirrors, ip, Some(64500), None, 500);
        let names: Vec<&str> = selected.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"subnet.example"));
        assert!(names.contains(&"asn.example"));
        assert!(!names.contains(&"far.example"));
    }

    #[test]
    fn broadcast_address_is_in_network() {
        let mut in_subnet = mirror("subnet.example", "DE", (52.5, 13.4));
        in_subnet.set_subnets(vec!["198.51.100.0/24".parse().unwrap()]);
        let ip: IpAddr = "198.51.100.255".parse().unwrap();
        let selected = select_by_network(&[in_subnet], ip, None, None, 500);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn monopoly_match_is_terminal() {
        let mut monopolist = mirror("captive.example", "US", (40.7, -74.0));
        monopolist.monopoly = true;
        monopolist.set_subnets(vec!["198.51.100.0/24".parse().unwrap()]);
        let other = mirror("near.example", "US", (40.7, -74.1));
        let mirrors = vec![other, monopolist];

        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let selected =
            select_by_network(&mirrors, ip, None, Some(&geodata("US", (40.7, -74.0))), 500);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "captive.example");
    }

    #[test]
    fn monopoly_mirror_that_is_not_ok_is_ineligible() {
        let mut monopolist = mirror("captive.example", "US", (40.7, -74.0));
        monopolist.monopoly = true;
        monopolist.status = MirrorStatus::Expired;
        monopolist.set_subnets(vec!["198.51.100.0/24".parse().unwrap()]);

        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let selected = select_by_network(&[monopolist], ip, None, None, 500);
        assert!(selected.is_empty());
    }

    #[test]
    fn short_network_match_is_padded_with_nearby_public_mirrors() {
        let berlin = (52.5, 13.4);
        let mut matched = mirror("subnet.example", "DE", berlin);
        matched.set_subnets(vec!["198.51.100.0/24".parse().unwrap()]);
        let mut cloud = mirror("cloud.example", "DE", berlin);
        cloud.cloud_type = CloudType::Aws;
        let mut private = mirror("private.example", "DE", berlin);
        private.private = true;
        let nearby = mirror("nearby.example", "DE", (52.4, 13.5));
        let far = mirror("far.example", "US", (40.7, -74.0));
        let mirrors = vec![matched, cloud, private, nearby, far];

        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let selected =
            select_by_network(&mirrors, ip, None, Some(&geodata("DE", berlin)), 500);
        let names: Vec<&str> = selected.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names[0], "subnet.example");
        // Padding skips cloud and private mirrors and keeps country-first
        // distance order.
        assert!(names.contains(&"nearby.example"));
        assert!(names.contains(&"far.example"));
        assert!(!names.contains(&"cloud.example"));
        assert!(!names.contains(&"private.example"));
        assert!(selected.len() <= LENGTH_CLOUD_MIRRORS_LIST);
    }

    #[test]
    fn network_pass_is_capped() {
        let mirrors: Vec<MirrorState> = (0..15)
            .map(|i| {
                let mut m = mirror(&format!("m{i}.example"), "DE", (52.5, 13.4));
                m.set_subnets(vec!["198.51.100.0/24".parse().unwrap()]);
                m
            })
            .collect();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let selected = select_by_network(&mirrors, ip, None, None, 500);
        assert_eq!(selected.len(), LENGTH_CLOUD_MIRRORS_LIST);
    }

    #[test]
    fn geo_pass_sorts_by_country_then_distance() {
        let berlin = (52.52, 13.405);
        let mirrors = vec![
            mirror("paris.example", "FR", (48.85, 2.35)),
            mirror("hamburg.example", "DE", (53.55, 9.99)),
            mirror("newyork.example", "US", (40.7, -74.0)),
            mirror("munich.example", "DE", (48.13, 11.57)),
        ];
        // Radius 0 disables shuffling so the order is deterministic.
        let selected = select_by_geo(mirrors, Some(&geodata("DE", berlin)), 0);
        let names: Vec<&str> = selected.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hamburg.example",
                "munich.example",
                "paris.example",
                "newyork.example"
            ]
        );
    }

    #[test]
    fn geo_pass_truncates_to_the_limit() {
        let berlin = (52.52, 13.405);
        let mirrors: Vec<MirrorState> = (0..25)
            .map(|i| mirror(&format!("m{i}.example"), "DE", (50.0 + i as f64 * 0.1, 10.0)))
            .collect();
        let selected = select_by_geo(mirrors.clone(), Some(&geodata("DE", berlin)), 0);
        assert_eq!(selected.len(), LENGTH_GEO_MIRRORS_LIST);
        // Without geodata the list is passed through truncated.
        let fallback = select_by_geo(mirrors, None, 0);
        assert_eq!(fallback.len(), LENGTH_GEO_MIRRORS_LIST);
    }

    #[test]
    fn radius_randomization_keeps_bucket_order() {
        let berlin = (52.52, 13.405);
        let mirrors = vec![
            mirror("berlin.example", "DE", (52.5, 13.4)),
            mirror("potsdam.example", "DE", (52.4, 13.06)),
            mirror("munich.example", "DE", (48.13, 11.57)),
            mirror("paris.example", "FR", (48.85, 2.35)),
            mirror("newyork.example", "US", (40.7, -74.0)),
        ];
        let sorted = sort_by_distance_and_country(mirrors, berlin, "DE");
        let ordered = randomize_within_radius(sorted, "DE", 100);
        let names: Vec<&str> = ordered.iter().map(|m| m.name.as_str()).collect();
        // The two Berlin-area mirrors fill the first two slots in either
        // order, Munich stays third, foreign mirrors keep distance order.
        assert!(names[..2].contains(&"berlin.example"));
        assert!(names[..2].contains(&"potsdam.example"));
        assert_eq!(names[2], "munich.example");
        assert_eq!(names[3..], ["paris.example", "newyork.example"]);
    }

    #[test]
    fn distance_sort_is_stable_across_calls() {
        let berlin = (52.52, 13.405);
        let mirrors = vec![
            mirror("a.example", "DE", (52.5, 13.4)),
            mirror("b.example", "FR", (48.85, 2.35)),
            mirror("c.example", "DE", (48.13, 11.57)),
        ];
        let first: Vec<String> = sort_by_distance_and_country(mirrors.clone(), berlin, "DE")
            .into_iter()
            .map(|(_, m)| m.name)
            .collect();
        let second: Vec<String> = sort_by_distance_and_country(mirrors, berlin, "DE")
            .into_iter()
            .map(|(_, m)| m.name)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn urls_are_rendered_with_arch_substitution() {
        let mirrors = vec![mirror("a.example", "DE", (52.5, 13.4))];
        let urls = render_urls(
            &mirrors,
            "9",
            "BaseOS/$basearch/os",
            Some("x86_64"),
            None,
            None,
        );
        assert_eq!(urls, vec!["http://a.example/9/BaseOS/x86_64/os"]);
        assert!(!urls[0].contains("$basearch"));

        let https = render_urls(
            &mirrors,
            "9",
            "BaseOS/$basearch/os",
            Some("x86_64"),
            Some("https"),
            None,
        );
        assert_eq!(https, vec!["https://a.example/9/BaseOS/x86_64/os"]);
    }

    #[test]
    fn module_urls_take_precedence_when_module_is_requested() {
        let mut with_module = mirror("a.example", "DE", (52.5, 13.4));
        let mut module_urls = std::collections::BTreeMap::new();
        module_urls.insert(
            "https".to_string(),
            "https://a.example/kitten".to_string(),
        );
        with_module
            .module_urls
            .insert("kitten".to_string(), module_urls);
        let urls = render_urls(
            &[with_module],
            "10-kitten",
            "BaseOS/$basearch/os",
            Some("x86_64"),
            None,
            Some("kitten"),
        );
        assert_eq!(urls, vec!["https://a.example/kitten/10-kitten/BaseOS/x86_64/os"]);
    }

    #[test]
    fn isos_landing_table_lists_alias_targets_per_arch() {
        let config = config();
        let table = main_isos_table(&config);
        assert_eq!(table["x86_64"], vec!["8.9"]);
        assert_eq!(table["aarch64"], vec!["8.9"]);
    }

    #[test]
    fn mirrors_without_location_sort_last() {
        let berlin = (52.52, 13.405);
        let mut unplaced = mirror("unplaced.example", "DE", (0.0, 0.0));
        unplaced.location = None;
        let placed = mirror("placed.example", "DE", (52.5, 13.4));
        let sorted = sort_by_distance_and_country(vec![unplaced, placed], berlin, "DE");
        assert_eq!(sorted[0].1.name, "placed.example");
        assert_eq!(sorted[1].0, u32::MAX);
    }
}
