//! Offline IP geolocation: GeoIP city and ASN databases plus a small
//! continent/country table used to normalize country names to ISO alpha-2
//! and to fill continents the city database does not know.
//!
//! The readers are opened once at startup and are read-only afterwards.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use color_eyre::Report;
use color_eyre::eyre::WrapErr;
use maxminddb::{Reader, geoip2};
use serde::Serialize;

const TARGET: &str = "mirrorlist::geo";

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Result of a client or mirror IP lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoData {
    pub continent: String,
    /// ISO 3166-1 alpha-2
    pub country: String,
    pub state_province: Option<String>,
    pub city: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoData {
    /// Coarse lookups carry coordinates but none of the locality fields;
    /// those clients get a shuffled list instead of a distance sort.
    pub fn has_locality(&self) -> bool {
        !self.country.is_empty()
            || self.state_province.is_some()
            || self.city.is_some()
    }
}

/// `continent,iso2,name` rows loaded from `CONTINENT_PATH`.
#[derive(Debug, Default)]
pub struct ContinentTable {
    continent_by_iso: HashMap<String, String>,
    iso_by_name: HashMap<String, String>,
}

impl ContinentTable {
    pub fn parse(content: &str) -> Self {
        let mut table = ContinentTable::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.splitn(3, ',');
            let (Some(continent), Some(iso), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                tracing::warn!(target: TARGET, "Skipping malformed continent table row {line:?}");
                continue;
            };
            let iso = iso.trim().to_uppercase();
            table
                .continent_by_iso
                .insert(iso.clone(), continent.trim().to_string());
            table.iso_by_name.insert(name.trim().to_lowercase(), iso);
        }
        table
    }

    pub fn continent_for(&self, iso2: &str) -> Option<&str> {
        self.continent_by_iso
            .get(&iso2.to_uppercase())
            .map(String::as_str)
    }

    /// Normalize a country value to alpha-2: two letters are upcased, full
    /// names are resolved through the table. `Unknown` stays as-is.
    pub fn normalize_country(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || raw == crate::types::UNKNOWN {
            return None;
        }
        if raw.len() == 2 && raw.chars().all(|c| c.is_ascii_alphabetic()) {
            return Some(raw.to_uppercase());
        }
        self.iso_by_name.get(&raw.to_lowercase()).cloned()
    }
}

/// Process-wide offline geo resolver.
pub struct GeoResolver {
    city: Reader<Vec<u8>>,
    asn: Reader<Vec<u8>>,
    continents: ContinentTable,
}

impl std::fmt::Debug for GeoResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoResolver").finish_non_exhaustive()
    }
}

impl GeoResolver {
    pub fn open(
        geoip_path: &Path,
        asn_path: &Path,
        continent_path: &Path,
    ) -> Result<Self, Report> {
        let city = Reader::open_readfile(geoip_path)
            .wrap_err_with(|| format!("Failed to open GeoIP database {}", geoip_path.display()))?;
        let asn = Reader::open_readfile(asn_path)
            .wrap_err_with(|| format!("Failed to open ASN database {}", asn_path.display()))?;
        let continent_raw = std::fs::read_to_string(continent_path).wrap_err_with(|| {
            format!("Failed to read continent table {}", continent_path.display())
        })?;
        Ok(GeoResolver {
            city,
            asn,
            continents: ContinentTable::parse(&continent_raw),
        })
    }

    /// Full geodata for an address, `None` when the database has no record
    /// or the record lacks coordinates.
    pub fn geo(&self, ip: IpAddr) -> Option<GeoData> {
        let record: geoip2::City = self.city.lookup(ip).ok()?;
        let location = record.location?;
        let (latitude, longitude) = (location.latitude?, location.longitude?);

        let country = record
            .country
            .as_ref()
            .and_then(|country| country.iso_code)
            .map(str::to_uppercase)
            .unwrap_or_default();
        let continent = record
            .continent
            .as_ref()
            .and_then(|continent| {
                continent
                    .names
                    .as_ref()
                    .and_then(|names| names.get("en").copied())
            })
            .map(str::to_string)
            .or_else(|| self.continents.continent_for(&country).map(str::to_string))
            .unwrap_or_default();
        let state_province = record
            .subdivisions
            .as_ref()
            .and_then(|subdivisions| subdivisions.first())
            .and_then(|subdivision| {
                subdivision
                    .names
                    .as_ref()
                    .and_then(|names| names.get("en").copied())
                    .or(subdivision.iso_code)
            })
            .map(str::to_string);
        let city = record
            .city
            .as_ref()
            .and_then(|city| city.names.as_ref())
            .and_then(|names| names.get("en").copied())
            .map(str::to_string);

        Some(GeoData {
            continent,
            country,
            state_province,
            city,
            latitude,
            longitude,
        })
    }

    /// Like [`GeoResolver::geo`] but over a textual address; malformed
    /// input is a miss, not an error.
    pub fn geo_str(&self, ip: &str) -> Option<GeoData> {
        ip.trim().parse().ok().and_then(|ip| self.geo(ip))
    }

    pub fn asn(&self, ip: IpAddr) -> Option<u32> {
        let record: geoip2::Asn = self.asn.lookup(ip).ok()?;
        record.autonomous_system_number
    }

    pub fn normalize_country(&self, raw: &str) -> Option<String> {
        self.continents.normalize_country(raw)
    }

    pub fn continent_for(&self, iso2: &str) -> Option<&str> {
        self.continents.continent_for(iso2)
    }
}

/// Great-circle distance between two `(latitude, longitude)` pairs.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = a;
    let (lat2, lon2) = b;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
# continent,iso2,name
Europe,DE,Germany
Europe,FR,France
North America,US,United States
";

    #[test]
    fn continent_table_lookups() {
        let table = ContinentTable::parse(TABLE);
        assert_eq!(table.continent_for("de"), Some("Europe"));
        assert_eq!(table.continent_for("US"), Some("North America"));
        assert_eq!(table.continent_for("JP"), None);
    }

    #[test]
    fn country_normalization() {
        let table = ContinentTable::parse(TABLE);
        assert_eq!(table.normalize_country("de"), Some("DE".to_string()));
        assert_eq!(table.normalize_country("Germany"), Some("DE".to_string()));
        assert_eq!(
            table.normalize_country("united states"),
            Some("US".to_string())
        );
        assert_eq!(table.normalize_country("Unknown"), None);
        assert_eq!(table.normalize_country(""), None);
        assert_eq!(table.normalize_country("Atlantis"), None);
    }

    #[test]
    fn haversine_berlin_to_paris() {
        let berlin = (52.5200, 13.4050);
        let paris = (48.8566, 2.3522);
        let km = haversine_km(berlin, paris);
        assert!((km - 878.0).abs() < 10.0, "got {km}");
    }

    #[test]
    fn haversine_zero_distance() {
        let p = (40.0, -74.0);
        assert!(haversine_km(p, p) < 1e-9);
    }
}
