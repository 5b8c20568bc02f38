//! Materialized mirror store: the relational tables the update pipeline
//! swaps atomically, fronted by an in-process list cache and the shared
//! key-value cache.
//!
//! Writers (the update pipeline) replace the whole set inside one
//! transaction; readers either see the previous snapshot or the new one.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};

use super::cache::Cache;
use super::constants::MIRRORS_LIST_EXPIRED_TIME;
use crate::types::{
    CloudType, GeoLocation, Location, MirrorState, MirrorStatus, Sponsor, SubnetRange,
};

const TARGET: &str = "mirrorlist::store";

/// Boolean filter axes over the mirror set. Every combination has a stable
/// cache key shared between the in-process and the key-value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MirrorFilter {
    /// status == ok
    pub working: bool,
    /// status == expired
    pub expired: bool,
    pub without_cloud: bool,
    pub without_private: bool,
    pub with_full_iso_set: bool,
}

impl MirrorFilter {
    /// Filter used for mirrorlist and isolist responses.
    pub fn mirrorlist(iso_list: bool) -> Self {
        MirrorFilter {
            working: true,
            expired: false,
            without_cloud: iso_list,
            without_private: iso_list,
            with_full_iso_set: iso_list,
        }
    }

    /// Filter used for the ISO-by-country listings.
    pub fn isos_by_country() -> Self {
        MirrorFilter {
            working: true,
            expired: false,
            without_cloud: true,
            without_private: true,
            with_full_iso_set: true,
        }
    }

    pub fn cache_key(&self) -> String {
        let mut suffixes = Vec::new();
        if self.working {
            suffixes.push("actual");
        }
        if self.expired {
            suffixes.push("expired");
        }
        if self.without_cloud {
            suffixes.push("no_cloud");
        }
        if self.without_private {
            suffixes.push("no_private");
        }
        if self.with_full_iso_set {
            suffixes.push("iso");
        }
        suffixes.sort_unstable();
        if suffixes.is_empty() {
            "mirrors_list_full".to_string()
        } else {
            format!("mirrors_list_{}", suffixes.join(","))
        }
    }

    /// All 32 combinations, for cache invalidation and warming.
    pub fn all_combinations() -> Vec<MirrorFilter> {
        let mut combinations = Vec::with_capacity(32);
        for bits in 0u8..32 {
            combinations.push(MirrorFilter {
                working: bits & 1 != 0,
                expired: bits & 2 != 0,
                without_cloud: bits & 4 != 0,
                without_private: bits & 8 != 0,
                with_full_iso_set: bits & 16 != 0,
            });
        }
        combinations
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    /// In-process copy of the filtered lists; the shared cache sits behind it
    memory: moka::future::Cache<String, Arc<Vec<MirrorState>>>,
    cache: Option<Cache>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS mirrors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        continent TEXT NOT NULL,
        country TEXT NOT NULL,
        state_province TEXT,
        city TEXT,
        ip TEXT NOT NULL,
        ipv6 INTEGER NOT NULL DEFAULT 0,
        latitude REAL,
        longitude REAL,
        status TEXT NOT NULL,
        update_frequency TEXT NOT NULL,
        sponsor_name TEXT NOT NULL,
        sponsor_url TEXT NOT NULL,
        email TEXT NOT NULL,
        mirror_url TEXT NOT NULL,
        iso_url TEXT NOT NULL,
        asn TEXT,
        cloud_type TEXT NOT NULL DEFAULT '',
        cloud_regions TEXT,
        private INTEGER NOT NULL DEFAULT 0,
        monopoly INTEGER NOT NULL DEFAULT 0,
        has_full_iso_set INTEGER NOT NULL DEFAULT 0,
        has_optional_modules TEXT
    )",
    "CREATE TABLE IF NOT EXISTS urls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL,
        type TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS module_urls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        module TEXT NOT NULL,
        url TEXT NOT NULL,
        type TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS subnets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subnet TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS subnets_int (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        range_start TEXT NOT NULL,
        range_end TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS mirrors_urls (
        mirror_id INTEGER REFERENCES mirrors(id) ON DELETE CASCADE,
        url_id INTEGER REFERENCES urls(id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS mirrors_module_urls (
        mirror_id INTEGER REFERENCES mirrors(id) ON DELETE CASCADE,
        module_url_id INTEGER REFERENCES module_urls(id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS mirrors_subnets (
        mirror_id INTEGER REFERENCES mirrors(id) ON DELETE CASCADE,
        subnet_id INTEGER REFERENCES subnets(id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS mirrors_subnets_int (
        mirror_id INTEGER REFERENCES mirrors(id) ON DELETE CASCADE,
        subnet_int_id INTEGER REFERENCES subnets_int(id) ON DELETE CASCADE
    )",
];

impl Store {
    pub async fn open(path: &str, cache: Option<Cache>) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, cache).await
    }

    /// In-memory store for tests. One connection, or every handle would see
    /// its own empty database.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, None).await
    }

    async fn with_pool(pool: SqlitePool, cache: Option<Cache>) -> Result<Self, sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Store {
            pool,
            memory: moka::future::Cache::builder()
                .max_capacity(64)
                .time_to_live(Duration::from_secs(MIRRORS_LIST_EXPIRED_TIME))
                .build(),
            cache,
        })
    }

    /// Replace the whole mirror set in one transaction.
    pub async fn swap(&self, mirrors: &[MirrorState]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "mirrors_urls",
            "mirrors_module_urls",
            "mirrors_subnets",
            "mirrors_subnets_int",
            "mirrors",
            "urls",
            "module_urls",
            "subnets",
            "subnets_int",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        for mirror in mirrors {
            insert_mirror(&mut tx, mirror).await?;
        }
        tx.commit().await?;
        tracing::info!(target: TARGET, "Committed {} mirrors", mirrors.len());
        Ok(())
    }

    /// Filtered list through the cache hierarchy: memory, shared cache, SQL.
    pub async fn list(&self, filter: MirrorFilter) -> Result<Arc<Vec<MirrorState>>, sqlx::Error> {
        let key = filter.cache_key();
        if let Some(hit) = self.memory.get(&key).await {
            return Ok(hit);
        }
        if let Some(cache) = &self.cache
            && let Some(cached) = cache.get_json::<Vec<MirrorState>>(&key).await
        {
            let list = Arc::new(cached);
            self.memory.insert(key, list.clone()).await;
            return Ok(list);
        }
        let mirrors = self.query_filtered(filter).await?;
        if let Some(cache) = &self.cache {
            cache
                .set_json(&key, &mirrors, MIRRORS_LIST_EXPIRED_TIME)
                .await;
        }
        let list = Arc::new(mirrors);
        self.memory.insert(key, list.clone()).await;
        Ok(list)
    }

    /// Drop and re-populate every filter-combination cache entry. Called
    /// after a successful swap.
    pub async fn refresh_filter_caches(&self) -> Result<(), sqlx::Error> {
        for filter in MirrorFilter::all_combinations() {
            let key = filter.cache_key();
            self.memory.invalidate(&key).await;
            if let Some(cache) = &self.cache {
                cache.delete(&key).await;
            }
            self.list(filter).await?;
        }
        Ok(())
    }

    async fn query_filtered(&self, filter: MirrorFilter) -> Result<Vec<MirrorState>, sqlx::Error> {
        let mut conditions: Vec<&str> = Vec::new();
        if filter.without_private {
            conditions.push("private = 0");
        }
        if filter.with_full_iso_set {
            conditions.push("has_full_iso_set = 1");
        }
        if filter.without_cloud {
            conditions.push("cloud_type = ''");
        }
        match (filter.working, filter.expired) {
            (true, true) => conditions.push("status IN ('ok', 'expired')"),
            (true, false) => conditions.push("status = 'ok'"),
            (false, true) => conditions.push("status = 'expired'"),
            (false, false) => {}
        }
        let mut sql = "SELECT * FROM mirrors".to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY continent, country");

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let urls = self.load_urls().await?;
        let module_urls = self.load_module_urls().await?;
        let subnets = self.load_subnets().await?;
        let subnet_ranges = self.load_subnet_ranges().await?;

        let mut mirrors = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            mirrors.push(mirror_from_row(
                &row,
                urls.get(&id).cloned().unwrap_or_default(),
                module_urls.get(&id).cloned().unwrap_or_default(),
                subnets.get(&id).cloned().unwrap_or_default(),
                subnet_ranges.get(&id).cloned().unwrap_or_default(),
            ));
        }
        Ok(mirrors)
    }

    async fn load_urls(&self) -> Result<HashMap<i64, Vec<(String, String)>>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT mu.mirror_id, u.type, u.url
             FROM urls u JOIN mirrors_urls mu ON mu.url_id = u.id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut map: HashMap<i64, Vec<(String, String)>> = HashMap::new();
        for row in rows {
            map.entry(row.get("mirror_id"))
                .or_default()
                .push((row.get("type"), row.get("url")));
        }
        Ok(map)
    }

    async fn load_module_urls(
        &self,
    ) -> Result<HashMap<i64, Vec<(String, String, String)>>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT mmu.mirror_id, mu.module, mu.type, mu.url
             FROM module_urls mu JOIN mirrors_module_urls mmu ON mmu.module_url_id = mu.id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut map: HashMap<i64, Vec<(String, String, String)>> = HashMap::new();
        for row in rows {
            map.entry(row.get("mirror_id")).or_default().push((
                row.get("module"),
                row.get("type"),
                row.get("url"),
            ));
        }
        Ok(map)
    }

    async fn load_subnets(&self) -> Result<HashMap<i64, Vec<String>>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT ms.mirror_id, s.subnet
             FROM subnets s JOIN mirrors_subnets ms ON ms.subnet_id = s.id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut map: HashMap<i64, Vec<String>> = HashMap::new();
        for row in rows {
            map.entry(row.get("mirror_id"))
                .or_default()
                .push(row.get("subnet"));
        }
        Ok(map)
    }

    async fn load_subnet_ranges(
        &self,
    ) -> Result<HashMap<i64, Vec<(String, String)>>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT msi.mirror_id, si.range_start, si.range_end
             FROM subnets_int si JOIN mirrors_subnets_int msi ON msi.subnet_int_id = si.id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut map: HashMap<i64, Vec<(String, String)>> = HashMap::new();
        for row in rows {
            map.entry(row.get("mirror_id"))
                .or_default()
                .push((row.get("range_start"), row.get("range_end")));
        }
        Ok(map)
    }
}

async fn insert_mirror(
    tx: &mut Transaction<'_, Sqlite>,
    mirror: &MirrorState,
) -> Result<(), sqlx::Error> {
    let asn = mirror
        .asn
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let result = sqlx::query(
        "INSERT INTO mirrors (
            name, continent, country, state_province, city, ip, ipv6,
            latitude, longitude, status, update_frequency, sponsor_name,
            sponsor_url, email, mirror_url, iso_url, asn, cloud_type,
            cloud_regions, private, monopoly, has_full_iso_set,
            has_optional_modules
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&mirror.name)
    .bind(&mirror.geolocation.continent)
    .bind(&mirror.geolocation.country)
    .bind(&mirror.geolocation.state_province)
    .bind(&mirror.geolocation.city)
    .bind(&mirror.ip)
    .bind(mirror.ipv6)
    .bind(mirror.location.map(|location| location.latitude))
    .bind(mirror.location.map(|location| location.longitude))
    .bind(mirror.status.as_str())
    .bind(&mirror.update_frequency)
    .bind(&mirror.sponsor.name)
    .bind(&mirror.sponsor.url)
    .bind(&mirror.email)
    .bind(&mirror.mirror_url)
    .bind(&mirror.iso_url)
    .bind(asn)
    .bind(mirror.cloud_type.as_str())
    .bind(mirror.cloud_regions.join(","))
    .bind(mirror.private)
    .bind(mirror.monopoly)
    .bind(mirror.has_full_iso_set)
    .bind(mirror.has_optional_modules.join(","))
    .execute(&mut **tx)
    .await?;
    let mirror_id = result.last_insert_rowid();

    for (protocol, url) in &mirror.urls {
        let url_id = sqlx::query("INSERT INTO urls (url, type) VALUES (?, ?)")
            .bind(url)
            .bind(protocol)
            .execute(&mut **tx)
            .await?
            .last_insert_rowid();
        sqlx::query("INSERT INTO mirrors_urls (mirror_id, url_id) VALUES (?, ?)")
            .bind(mirror_id)
            .bind(url_id)
            .execute(&mut **tx)
            .await?;
    }
    for (module, urls) in &mirror.module_urls {
        for (protocol, url) in urls {
            let module_url_id =
                sqlx::query("INSERT INTO module_urls (module, url, type) VALUES (?, ?, ?)")
                    .bind(module)
                    .bind(url)
                    .bind(protocol)
                    .execute(&mut **tx)
                    .await?
                    .last_insert_rowid();
            sqlx::query(
                "INSERT INTO mirrors_module_urls (mirror_id, module_url_id) VALUES (?, ?)",
            )
            .bind(mirror_id)
            .bind(module_url_id)
            .execute(&mut **tx)
            .await?;
        }
    }
    for subnet in &mirror.subnets {
        let subnet_id = sqlx::query("INSERT INTO subnets (subnet) VALUES (?)")
            .bind(subnet.to_string())
            .execute(&mut **tx)
            .await?
            .last_insert_rowid();
        sqlx::query("INSERT INTO mirrors_subnets (mirror_id, subnet_id) VALUES (?, ?)")
            .bind(mirror_id)
            .bind(subnet_id)
            .execute(&mut **tx)
            .await?;
    }
    for range in &mirror.subnets_int {
        let range_id =
            sqlx::query("INSERT INTO subnets_int (range_start, range_end) VALUES (?, ?)")
                .bind(range.start.to_string())
                .bind(range.end.to_string())
                .execute(&mut **tx)
                .await?
                .last_insert_rowid();
        sqlx::query("INSERT INTO mirrors_subnets_int (mirror_id, subnet_int_id) VALUES (?, ?)")
            .bind(mirror_id)
            .bind(range_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn mirror_from_row(
    row: &sqlx::sqlite::SqliteRow,
    urls: Vec<(String, String)>,
    module_urls: Vec<(String, String, String)>,
    subnets: Vec<String>,
    subnet_ranges: Vec<(String, String)>,
) -> MirrorState {
    let latitude: Option<f64> = row.get("latitude");
    let longitude: Option<f64> = row.get("longitude");
    let status: String = row.get("status");
    let asn: String = row.get::<Option<String>, _>("asn").unwrap_or_default();
    let cloud_type: String = row.get("cloud_type");
    let cloud_regions: String = row
        .get::<Option<String>, _>("cloud_regions")
        .unwrap_or_default();
    let has_optional_modules: String = row
        .get::<Option<String>, _>("has_optional_modules")
        .unwrap_or_default();

    let mut module_url_map = std::collections::BTreeMap::new();
    for (module, protocol, url) in module_urls {
        module_url_map
            .entry(module)
            .or_insert_with(std::collections::BTreeMap::new)
            .insert(protocol, url);
    }

    MirrorState {
        name: row.get("name"),
        sponsor: Sponsor {
            name: row.get("sponsor_name"),
            url: row.get("sponsor_url"),
        },
        email: row.get("email"),
        update_frequency: row.get("update_frequency"),
        urls: urls.into_iter().collect(),
        module_urls: module_url_map,
        subnets: subnets
            .iter()
            .filter_map(|subnet| subnet.parse().ok())
            .collect(),
        subnets_int: subnet_ranges
            .iter()
            .filter_map(|(start, end)| {
                Some(SubnetRange {
                    start: start.parse().ok()?,
                    end: end.parse().ok()?,
                })
            })
            .collect(),
        asn: asn
            .split(',')
            .filter_map(|asn| asn.trim().parse().ok())
            .collect(),
        cloud_type: CloudType::from(cloud_type.as_str()),
        cloud_regions: split_csv(&cloud_regions),
        private: row.get("private"),
        monopoly: row.get("monopoly"),
        ip: row.get("ip"),
        ipv6: row.get("ipv6"),
        mirror_url: row.get("mirror_url"),
        iso_url: row.get("iso_url"),
        location: match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            _ => None,
        },
        geolocation: GeoLocation {
            continent: row.get("continent"),
            country: row.get("country"),
            state_province: row
                .get::<Option<String>, _>("state_province")
                .unwrap_or_default(),
            city: row.get::<Option<String>, _>("city").unwrap_or_default(),
        },
        status: MirrorStatus::from(status.as_str()),
        has_full_iso_set: row.get("has_full_iso_set"),
        has_optional_modules: split_csv(&has_optional_modules),
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
