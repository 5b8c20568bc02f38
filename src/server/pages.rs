//! HTML catalogue pages, rendered from embedded templates. The rows are
//! precomputed here so the templates stay free of lookups.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use serde_json::json;
use tera::{Context, Tera};

use crate::types::{ApiError, MirrorState};

static TEMPLATES: LazyLock<Tera> = LazyLock::new(|| {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![
        ("mirrors.html", include_str!("templates/mirrors.html")),
        ("isos_main.html", include_str!("templates/isos_main.html")),
        ("isos.html", include_str!("templates/isos.html")),
    ])
    .expect("embedded templates compile");
    tera
});

fn render(template: &str, context: &Context) -> Result<String, ApiError> {
    TEMPLATES
        .render(template, context)
        .map_err(|err| ApiError::Internal(err.into()))
}

fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M UTC").to_string()
}

/// The public mirror table served at `/`.
pub fn mirrors_table_page(mirrors: &[MirrorState]) -> Result<String, ApiError> {
    let url_types: BTreeSet<String> = mirrors
        .iter()
        .flat_map(|mirror| mirror.urls.keys().cloned())
        .collect();
    let mut column_names = vec![
        "Name".to_string(),
        "Sponsor".to_string(),
        "Status".to_string(),
        "Continent".to_string(),
        "Region".to_string(),
    ];
    column_names.extend(url_types.iter().map(|t| t.to_uppercase()));
    column_names.push("IPv6".to_string());

    let rows: Vec<serde_json::Value> = mirrors
        .iter()
        .map(|mirror| {
            let urls: Vec<String> = url_types
                .iter()
                .map(|t| mirror.urls.get(t).cloned().unwrap_or_default())
                .collect();
            json!({
                "name": mirror.name,
                "sponsor_name": mirror.sponsor.name,
                "sponsor_url": mirror.sponsor.url,
                "status": mirror.status.as_str(),
                "continent": mirror.geolocation.continent,
                "region": mirror.geolocation.country,
                "urls": urls,
                "ipv6": if mirror.ipv6 { "yes" } else { "no" },
            })
        })
        .collect();

    let mut context = Context::new();
    context.insert("main_title", "Mirrors");
    context.insert("now", &now_utc());
    context.insert("column_names", &column_names);
    context.insert("mirrors", &rows);
    render("mirrors.html", &context)
}

/// ISO landing page: arch -> client-facing versions.
pub fn isos_main_page(table: &BTreeMap<String, Vec<String>>) -> Result<String, ApiError> {
    let mut context = Context::new();
    context.insert("main_title", "ISO links");
    context.insert("now", &now_utc());
    context.insert("isos_list", table);
    render("isos_main.html", &context)
}

fn iso_directory_url(mirror: &MirrorState, version: &str, arch: &str) -> String {
    mirror
        .iso_url
        .replacen("%s", version, 1)
        .replacen("%s", arch, 1)
}

/// Per-(arch, version) ISO listing: the nearest selection first, then
/// every carrying mirror grouped by country.
pub fn isos_listing_page(
    arch: &str,
    version: &str,
    by_country: &BTreeMap<String, Vec<MirrorState>>,
    nearest: &[MirrorState],
) -> Result<String, ApiError> {
    let link = |mirror: &MirrorState| {
        json!({
            "name": mirror.name,
            "url": iso_directory_url(mirror, version, arch),
        })
    };
    let nearest_rows: Vec<serde_json::Value> = nearest.iter().map(link).collect();
    let country_rows: Vec<serde_json::Value> = by_country
        .iter()
        .map(|(country, mirrors)| {
            json!({
                "country": country,
                "mirrors": mirrors.iter().map(link).collect::<Vec<_>>(),
            })
        })
        .collect();

    let mut context = Context::new();
    context.insert("main_title", "ISO links");
    context.insert("now", &now_utc());
    context.insert("arch", arch);
    context.insert("version", version);
    context.insert("nearest_mirrors", &nearest_rows);
    context.insert("mirrors_by_country", &country_rows);
    render("isos.html", &context)
}
