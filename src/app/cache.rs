//! Shared key-value cache (redis) carrying the filtered mirror lists,
//! per-IP selections, geocoder results, cloud-subnet catalogues and the
//! flap memos of failed mirrors.
//!
//! Every read treats a cache failure as a miss: the service keeps working
//! against the relational store if redis is degraded.

use std::net::IpAddr;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::constants::FLAP_EXPIRED_TIME;
use crate::types::NetErr;

const TARGET: &str = "mirrorlist::cache";

#[derive(Clone)]
pub struct Cache {
    rw: ConnectionManager,
    ro: ConnectionManager,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl Cache {
    /// Connect the writer endpoint and, when configured, a separate
    /// read-only replica endpoint.
    pub async fn connect(uri: &str, ro_uri: Option<&str>) -> Result<Self, NetErr> {
        let rw = ConnectionManager::new(redis::Client::open(uri).map_err(NetErr::Redis)?)
            .await
            .map_err(NetErr::Redis)?;
        let ro = match ro_uri {
            Some(ro_uri) if ro_uri != uri => {
                ConnectionManager::new(redis::Client::open(ro_uri).map_err(NetErr::Redis)?)
                    .await
                    .map_err(NetErr::Redis)?
            }
            _ => rw.clone(),
        };
        Ok(Cache { rw, ro })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.ro.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(target: TARGET, "Discarding undecodable cache entry {key:?}: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(target: TARGET, "Cache read of {key:?} failed, treating as miss: {err}");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(target: TARGET, "Cannot encode cache entry {key:?}: {err}");
                return;
            }
        };
        let mut conn = self.rw.clone();
        if let Err(err) = conn.set_ex::<_, _, ()>(key, raw, ttl_secs).await {
            tracing::warn!(target: TARGET, "Cache write of {key:?} failed: {err}");
        }
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        let mut conn = self.ro.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(target: TARGET, "Cache read of {key:?} failed, treating as miss: {err}");
                None
            }
        }
    }

    pub async fn set_string(&self, key: &str, value: &str, ttl_secs: u64) {
        let mut conn = self.rw.clone();
        if let Err(err) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            tracing::warn!(target: TARGET, "Cache write of {key:?} failed: {err}");
        }
    }

    pub async fn delete(&self, key: &str) {
        let mut conn = self.rw.clone();
        if let Err(err) = conn.del::<_, ()>(key).await {
            tracing::warn!(target: TARGET, "Cache delete of {key:?} failed: {err}");
        }
    }

    /// Failure memo of a recently flapping mirror, if present.
    pub async fn flap_reason(&self, mirror: &str) -> Option<String> {
        self.get_string(&flap_key(mirror)).await
    }

    /// Remember a probe failure so the next cycles skip this mirror.
    pub async fn set_flapped(&self, mirror: &str, reason: &str) {
        self.set_string(&flap_key(mirror), reason, FLAP_EXPIRED_TIME)
            .await;
    }

    /// A successful probe clears the memo.
    pub async fn clear_flapped(&self, mirror: &str) {
        self.delete(&flap_key(mirror)).await;
    }
}

pub fn flap_key(mirror: &str) -> String {
    format!("mirror_offline_{mirror}")
}

/// Per-client selection cache key. Protocol, country and module constraints
/// select different lists and therefore different keys.
pub fn selection_key(
    ip: IpAddr,
    protocol: Option<&str>,
    country: Option<&str>,
    module: Option<&str>,
) -> String {
    let mut key = format!("mirrorlist_{ip}");
    if let Some(protocol) = protocol {
        key.push('_');
        key.push_str(protocol);
    }
    if let Some(country) = country {
        key.push('_');
        key.push_str(&country.to_lowercase());
    }
    if let Some(module) = module {
        key.push('_');
        key.push_str(module);
    }
    key
}

/// Geocoder result cache key for one (country, state, city) triple.
pub fn geolocation_key(country: &str, state_province: &str, city: &str) -> String {
    format!("geolocation_{country}_{state_province}_{city}")
}

pub fn cloud_subnets_key(provider: crate::types::CloudType) -> String {
    format!("{provider}_subnets")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CloudType;

    #[test]
    fn selection_keys_distinguish_constraints() {
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        assert_eq!(selection_key(ip, None, None, None), "mirrorlist_198.51.100.7");
        assert_eq!(
            selection_key(ip, Some("https"), Some("DE"), None),
            "mirrorlist_198.51.100.7_https_de"
        );
        assert_ne!(
            selection_key(ip, Some("http"), None, None),
            selection_key(ip, Some("https"), None, None)
        );
        assert_eq!(
            selection_key(ip, None, None, Some("kitten")),
            "mirrorlist_198.51.100.7_kitten"
        );
    }

    #[test]
    fn flap_and_subnet_keys() {
        assert_eq!(flap_key("mirror.example.org"), "mirror_offline_mirror.example.org");
        assert_eq!(cloud_subnets_key(CloudType::Aws), "aws_subnets");
        assert_eq!(
            geolocation_key("DE", "Bavaria", "Munich"),
            "geolocation_DE_Bavaria_Munich"
        );
    }
}
