//! Canonical mirror state as produced by the update pipeline and consumed
//! by the selector.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Value a geolocation field carries before anything resolved it.
pub const UNKNOWN: &str = "Unknown";

/// Probe outcome of a mirror. Anything other than `Ok`/`Expired` carries
/// the failure reason verbatim; downstream filters treat it as unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MirrorStatus {
    #[default]
    Ok,
    Expired,
    Unavailable(String),
}

impl MirrorStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, MirrorStatus::Ok)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, MirrorStatus::Expired)
    }

    /// Reachability probes succeeded, even if the content is stale.
    pub fn is_reachable(&self) -> bool {
        matches!(self, MirrorStatus::Ok | MirrorStatus::Expired)
    }

    pub fn as_str(&self) -> &str {
        match self {
            MirrorStatus::Ok => "ok",
            MirrorStatus::Expired => "expired",
            MirrorStatus::Unavailable(reason) => reason,
        }
    }
}

impl From<&str> for MirrorStatus {
    fn from(s: &str) -> Self {
        match s {
            "ok" => MirrorStatus::Ok,
            "expired" => MirrorStatus::Expired,
            reason => MirrorStatus::Unavailable(reason.to_string()),
        }
    }
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MirrorStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MirrorStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MirrorStatus::from(s.as_str()))
    }
}

/// Cloud provider hosting a mirror, if any. Cloud mirrors get their subnets
/// from the provider's published ranges instead of the mirror declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudType {
    #[default]
    #[serde(rename = "", alias = "none")]
    None,
    Aws,
    Azure,
    Gcp,
    Oci,
}

impl CloudType {
    pub fn is_cloud(&self) -> bool {
        !matches!(self, CloudType::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudType::None => "",
            CloudType::Aws => "aws",
            CloudType::Azure => "azure",
            CloudType::Gcp => "gcp",
            CloudType::Oci => "oci",
        }
    }
}

impl From<&str> for CloudType {
    fn from(s: &str) -> Self {
        match s {
            "aws" => CloudType::Aws,
            "azure" => CloudType::Azure,
            "gcp" => CloudType::Gcp,
            "oci" => CloudType::Oci,
            _ => CloudType::None,
        }
    }
}

impl fmt::Display for CloudType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sponsor {
    pub name: String,
    pub url: String,
}

/// Mirror coordinates resolved from the offline GeoIP database or the
/// online geocoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Human-readable placement of a mirror. Fields are write-once: a value that
/// is already set (non-empty and not `Unknown`) is never overwritten by a
/// later resolution step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoLocation {
    #[serde(default)]
    pub continent: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state_province: String,
    #[serde(default)]
    pub city: String,
}

impl GeoLocation {
    fn field_is_set(value: &str) -> bool {
        !value.is_empty() && value != UNKNOWN
    }

    /// Fill unset fields from `other`, keeping anything already resolved.
    pub fn merge(&mut self, other: &GeoLocation) {
        if !Self::field_is_set(&self.continent) && !other.continent.is_empty() {
            self.continent = other.continent.clone();
        }
        if !Self::field_is_set(&self.country) && !other.country.is_empty() {
            self.country = other.country.clone();
        }
        if !Self::field_is_set(&self.state_province) && !other.state_province.is_empty() {
            self.state_province = other.state_province.clone();
        }
        if !Self::field_is_set(&self.city) && !other.city.is_empty() {
            self.city = other.city.clone();
        }
    }

    /// The online geocoder needs city, state and country to be meaningful.
    pub fn mandatory_fields_set(&self) -> bool {
        Self::field_is_set(&self.city)
            && Self::field_is_set(&self.state_province)
            && Self::field_is_set(&self.country)
    }
}

/// Inclusive integer range covered by one subnet. IPv4 addresses are indexed
/// in the IPv4-mapped IPv6 space so both families share one `u128` index and
/// a v4 client can never fall inside a low v6 range. The bounds serialize as
/// decimal strings; v6 values do not fit a JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRange {
    #[serde(with = "u128_string")]
    pub start: u128,
    #[serde(with = "u128_string")]
    pub end: u128,
}

mod u128_string {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(D::Error::custom)
    }
}

impl SubnetRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        let index = ip_index(ip);
        self.start <= index && index <= self.end
    }
}

impl From<&IpNet> for SubnetRange {
    fn from(net: &IpNet) -> Self {
        SubnetRange {
            start: ip_index(net.network()),
            end: ip_index(net.broadcast()),
        }
    }
}

/// Numeric index of an address in the shared v4/v6 space.
pub fn ip_index(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Fully processed mirror record, as committed to the store after an update
/// cycle and served to the selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorState {
    pub name: String,
    pub sponsor: Sponsor,
    pub email: String,
    pub update_frequency: String,
    /// protocol -> base URL
    pub urls: BTreeMap<String, String>,
    /// module -> protocol -> base URL
    #[serde(default)]
    pub module_urls: BTreeMap<String, BTreeMap<String, String>>,
    pub subnets: Vec<IpNet>,
    /// Kept in lockstep with `subnets`, see [`MirrorState::set_subnets`]
    pub subnets_int: Vec<SubnetRange>,
    #[serde(default)]
    pub asn: Vec<u32>,
    #[serde(default)]
    pub cloud_type: CloudType,
    #[serde(default)]
    pub cloud_regions: Vec<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub monopoly: bool,
    /// Comma-joined resolved A records, or `Unknown`
    pub ip: String,
    #[serde(default)]
    pub ipv6: bool,
    /// Base URL selected by required-protocol preference
    pub mirror_url: String,
    /// `<base>/%s/isos/%s`, formatted with version and arch downstream
    pub iso_url: String,
    pub location: Option<Location>,
    pub geolocation: GeoLocation,
    pub status: MirrorStatus,
    #[serde(default)]
    pub has_full_iso_set: bool,
    #[serde(default)]
    pub has_optional_modules: Vec<String>,
}

impl MirrorState {
    pub fn has_resolved_ip(&self) -> bool {
        self.ip != UNKNOWN && !self.ip.is_empty()
    }

    /// Replace the subnet list, recomputing the integer ranges in lockstep.
    pub fn set_subnets(&mut self, subnets: Vec<IpNet>) {
        self.subnets_int = subnets.iter().map(SubnetRange::from).collect();
        self.subnets = subnets;
    }

    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.subnets_int.iter().any(|range| range.contains(ip))
    }

    /// Base URL for rendering: the requested protocol, else http, else https.
    pub fn base_url(&self, protocol: Option<&str>) -> Option<&str> {
        let urls = &self.urls;
        match protocol {
            Some(proto) => urls.get(proto).map(String::as_str),
            None => urls
                .get("http")
                .or_else(|| urls.get("https"))
                .map(String::as_str),
        }
    }

    /// Like [`MirrorState::base_url`] but over a module's URL mapping.
    pub fn module_base_url(&self, module: &str, protocol: Option<&str>) -> Option<&str> {
        let urls = self.module_urls.get(module)?;
        match protocol {
            Some(proto) => urls.get(proto).map(String::as_str),
            None => urls
                .get("http")
                .or_else(|| urls.get("https"))
                .map(String::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(MirrorStatus::from("ok"), MirrorStatus::Ok);
        assert_eq!(MirrorStatus::from("expired"), MirrorStatus::Expired);
        let broken = MirrorStatus::from("Unknown IP (no A records)");
        assert_eq!(broken.as_str(), "Unknown IP (no A records)");
        assert!(!broken.is_reachable());
        assert!(MirrorStatus::Expired.is_reachable());
    }

    #[test]
    fn subnet_range_includes_network_and_broadcast() {
        let net: IpNet = "192.0.2.0/24".parse().unwrap();
        let range = SubnetRange::from(&net);
        assert!(range.contains("192.0.2.0".parse().unwrap()));
        assert!(range.contains("192.0.2.255".parse().unwrap()));
        assert!(range.contains("192.0.2.17".parse().unwrap()));
        assert!(!range.contains("192.0.3.0".parse().unwrap()));
    }

    #[test]
    fn v6_subnet_ranges_survive_json_values() {
        let net: IpNet = "2001:db8::/32".parse().unwrap();
        let range = SubnetRange::from(&net);
        let value = serde_json::to_value(range).unwrap();
        let back: SubnetRange = serde_json::from_value(value).unwrap();
        assert_eq!(range, back);
    }

    #[test]
    fn v4_client_never_matches_low_v6_subnet() {
        let net: IpNet = "::/16".parse().unwrap();
        let range = SubnetRange::from(&net);
        assert!(!range.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn geolocation_merge_is_write_once() {
        let mut geo = GeoLocation {
            continent: String::new(),
            country: "DE".to_string(),
            state_province: UNKNOWN.to_string(),
            city: "Berlin".to_string(),
        };
        geo.merge(&GeoLocation {
            continent: "Europe".to_string(),
            country: "FR".to_string(),
            state_province: "Berlin".to_string(),
            city: "Paris".to_string(),
        });
        assert_eq!(geo.continent, "Europe");
        assert_eq!(geo.country, "DE");
        assert_eq!(geo.state_province, "Berlin");
        assert_eq!(geo.city, "Berlin");
    }

    #[test]
    fn cloud_type_parses_lowercase_names() {
        assert_eq!(CloudType::from("aws"), CloudType::Aws);
        assert_eq!(CloudType::from(""), CloudType::None);
        assert!(!CloudType::None.is_cloud());
        assert!(CloudType::Oci.is_cloud());
    }
}
