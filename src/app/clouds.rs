//! Published IP-range catalogues of the supported cloud providers,
//! parsed into `region -> [CIDR]` and cached in the shared cache for 24 h.
//!
//! A fetch failure degrades to whatever the cache still holds, or to an
//! empty catalogue on a cold start; affected cloud mirrors then simply
//! carry no subnets for this cycle.

use std::collections::BTreeMap;

use ipnet::IpNet;
use regex::Regex;
use serde::Deserialize;

use super::cache::{Cache, cloud_subnets_key};
use super::constants::{
    AWS_IP_RANGES_URL, AZURE_DOWNLOAD_PAGE_URL, CLOUD_SUBNETS_EXPIRED_TIME, GCP_IP_RANGES_URL,
    OCI_IP_RANGES_URL,
};
use crate::types::{CloudType, NetErr};

const TARGET: &str = "mirrorlist::clouds";

pub type RegionSubnets = BTreeMap<String, Vec<IpNet>>;

/// Region catalogue for one provider, cache-first.
pub async fn provider_subnets(
    client: &reqwest::Client,
    cache: &Cache,
    provider: CloudType,
) -> RegionSubnets {
    if !provider.is_cloud() {
        return RegionSubnets::new();
    }
    let key = cloud_subnets_key(provider);
    if let Some(cached) = cache.get_json::<RegionSubnets>(&key).await {
        return cached;
    }
    let fetched = match provider {
        CloudType::Aws => fetch_aws(client).await,
        CloudType::Azure => fetch_azure(client).await,
        CloudType::Gcp => fetch_gcp(client).await,
        CloudType::Oci => fetch_oci(client).await,
        CloudType::None => unreachable!(),
    };
    match fetched {
        Ok(subnets) => {
            cache
                .set_json(&key, &subnets, CLOUD_SUBNETS_EXPIRED_TIME)
                .await;
            subnets
        }
        Err(err) => {
            tracing::error!(
                target: TARGET,
                "Cannot get {provider} subnet catalogue, degrading to empty: {err}"
            );
            RegionSubnets::new()
        }
    }
}

fn insert_cidr(subnets: &mut RegionSubnets, region: &str, cidr: &str) {
    let net: IpNet = match cidr.parse() {
        Ok(net) => net,
        Err(err) => {
            tracing::warn!(target: TARGET, "Skipping invalid CIDR {cidr:?} in region {region:?}: {err}");
            return;
        }
    };
    let entry = subnets.entry(region.to_lowercase()).or_default();
    if !entry.contains(&net) {
        entry.push(net);
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, NetErr> {
    let response = client.get(url).send().await.map_err(NetErr::Reqwest)?;
    if !response.status().is_success() {
        return Err(NetErr::HttpStatus(response.status()));
    }
    response.text().await.map_err(NetErr::Reqwest)
}

#[derive(Debug, Deserialize)]
struct AwsRanges {
    #[serde(default)]
    prefixes: Vec<AwsPrefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<AwsIpv6Prefix>,
}

#[derive(Debug, Deserialize)]
struct AwsPrefix {
    ip_prefix: String,
    region: String,
}

#[derive(Debug, Deserialize)]
struct AwsIpv6Prefix {
    ipv6_prefix: String,
    region: String,
}

pub fn parse_aws(raw: &str) -> Result<RegionSubnets, NetErr> {
    let ranges: AwsRanges = serde_json::from_str(raw).map_err(NetErr::JsonParse)?;
    let mut subnets = RegionSubnets::new();
    for prefix in &ranges.prefixes {
        insert_cidr(&mut subnets, &prefix.region, &prefix.ip_prefix);
    }
    for prefix in &ranges.ipv6_prefixes {
        insert_cidr(&mut subnets, &prefix.region, &prefix.ipv6_prefix);
    }
    Ok(subnets)
}

async fn fetch_aws(client: &reqwest::Client) -> Result<RegionSubnets, NetErr> {
    parse_aws(&fetch_text(client, AWS_IP_RANGES_URL).await?)
}

#[derive(Debug, Deserialize)]
struct GcpRanges {
    prefixes: Vec<GcpPrefix>,
}

#[derive(Debug, Deserialize)]
struct GcpPrefix {
    #[serde(rename = "ipv4Prefix")]
    ipv4_prefix: Option<String>,
    #[serde(rename = "ipv6Prefix")]
    ipv6_prefix: Option<String>,
    scope: String,
}

pub fn parse_gcp(raw: &str) -> Result<RegionSubnets, NetErr> {
    let ranges: GcpRanges = serde_json::from_str(raw).map_err(NetErr::JsonParse)?;
    let mut subnets = RegionSubnets::new();
    for prefix in &ranges.prefixes {
        let cidr = prefix.ipv4_prefix.as_deref().or(prefix.ipv6_prefix.as_deref());
        if let Some(cidr) = cidr {
            insert_cidr(&mut subnets, &prefix.scope, cidr);
        }
    }
    Ok(subnets)
}

async fn fetch_gcp(client: &reqwest::Client) -> Result<RegionSubnets, NetErr> {
    parse_gcp(&fetch_text(client, GCP_IP_RANGES_URL).await?)
}

#[derive(Debug, Deserialize)]
struct OciRanges {
    regions: Vec<OciRegion>,
}

#[derive(Debug, Deserialize)]
struct OciRegion {
    region: String,
    cidrs: Vec<OciCidr>,
}

#[derive(Debug, Deserialize)]
struct OciCidr {
    cidr: String,
}

pub fn parse_oci(raw: &str) -> Result<RegionSubnets, NetErr> {
    let ranges: OciRanges = serde_json::from_str(raw).map_err(NetErr::JsonParse)?;
    let mut subnets = RegionSubnets::new();
    for region in &ranges.regions {
        for cidr in &region.cidrs {
            insert_cidr(&mut subnets, &region.region, &cidr.cidr);
        }
    }
    Ok(subnets)
}

async fn fetch_oci(client: &reqwest::Client) -> Result<RegionSubnets, NetErr> {
    parse_oci(&fetch_text(client, OCI_IP_RANGES_URL).await?)
}

#[derive(Debug, Deserialize)]
struct AzureTags {
    values: Vec<AzureValue>,
}

#[derive(Debug, Deserialize)]
struct AzureValue {
    name: String,
    properties: AzureProperties,
}

#[derive(Debug, Deserialize)]
struct AzureProperties {
    #[serde(default)]
    region: String,
    #[serde(rename = "addressPrefixes", default)]
    address_prefixes: Vec<String>,
}

/// The Azure catalogue sits behind a download page; the service-tags JSON
/// link is the only `ServiceTags_Public` href on it.
pub fn azure_json_url(html: &str) -> Option<String> {
    let pattern =
        Regex::new(r#"href="(https://download\.microsoft\.com/download/[^"]*ServiceTags_Public[^"]*\.json)""#)
            .expect("static regex");
    pattern
        .captures(html)
        .map(|captures| captures[1].to_string())
}

pub fn parse_azure(raw: &str) -> Result<RegionSubnets, NetErr> {
    let tags: AzureTags = serde_json::from_str(raw).map_err(NetErr::JsonParse)?;
    let mut subnets = RegionSubnets::new();
    for value in &tags.values {
        // Regional entries only; the bare AzureCloud aggregate has no region.
        if !value.name.starts_with("AzureCloud.") || value.properties.region.is_empty() {
            continue;
        }
        for cidr in &value.properties.address_prefixes {
            insert_cidr(&mut subnets, &value.properties.region, cidr);
        }
    }
    Ok(subnets)
}

async fn fetch_azure(client: &reqwest::Client) -> Result<RegionSubnets, NetErr> {
    let page = fetch_text(client, AZURE_DOWNLOAD_PAGE_URL).await?;
    let url = azure_json_url(&page).ok_or_else(|| {
        NetErr::Other(color_eyre::eyre::eyre!(
            "No ServiceTags_Public download link on the Azure ranges page"
        ))
    })?;
    parse_azure(&fetch_text(client, &url).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_ranges_parse_and_dedupe() {
        let raw = r#"{
            "prefixes": [
                {"ip_prefix": "3.5.140.0/22", "region": "us-east-1", "service": "AMAZON"},
                {"ip_prefix": "3.5.140.0/22", "region": "us-east-1", "service": "EC2"},
                {"ip_prefix": "15.230.56.104/31", "region": "eu-central-1", "service": "AMAZON"}
            ],
            "ipv6_prefixes": [
                {"ipv6_prefix": "2600:1f69:7400::/40", "region": "us-east-1", "service": "AMAZON"}
            ]
        }"#;
        let subnets = parse_aws(raw).unwrap();
        assert_eq!(subnets["us-east-1"].len(), 2);
        assert_eq!(subnets["eu-central-1"].len(), 1);
    }

    #[test]
    fn gcp_ranges_parse_both_families() {
        let raw = r#"{
            "prefixes": [
                {"ipv4Prefix": "8.8.4.0/24", "scope": "global"},
                {"ipv6Prefix": "2600:1900:4000::/44", "scope": "us-central1"},
                {"service": "Google Cloud", "scope": "us-central1"}
            ]
        }"#;
        let subnets = parse_gcp(raw).unwrap();
        assert_eq!(subnets["global"].len(), 1);
        assert_eq!(subnets["us-central1"].len(), 1);
    }

    #[test]
    fn oci_ranges_parse() {
        let raw = r#"{
            "regions": [
                {"region": "us-ashburn-1", "cidrs": [
                    {"cidr": "129.146.0.0/21", "tags": ["OCI"]},
                    {"cidr": "not-a-cidr", "tags": ["OCI"]}
                ]}
            ]
        }"#;
        let subnets = parse_oci(raw).unwrap();
        assert_eq!(subnets["us-ashburn-1"].len(), 1);
    }

    #[test]
    fn azure_tags_filter_to_regional_cloud_entries() {
        let raw = r#"{
            "values": [
                {"name": "AzureCloud", "properties": {"region": "", "addressPrefixes": ["10.0.0.0/8"]}},
                {"name": "AzureCloud.westeurope", "properties": {"region": "westeurope", "addressPrefixes": ["13.69.0.0/17"]}},
                {"name": "Storage.westeurope", "properties": {"region": "westeurope", "addressPrefixes": ["52.239.0.0/18"]}}
            ]
        }"#;
        let subnets = parse_azure(raw).unwrap();
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets["westeurope"].len(), 1);
    }

    #[test]
    fn azure_download_link_is_scraped() {
        let html = r#"<a class="dlcdetail__download-btn"
            href="https://download.microsoft.com/download/7/1/d/ServiceTags_Public_20260727.json"
            >Download</a>"#;
        assert_eq!(
            azure_json_url(html).as_deref(),
            Some("https://download.microsoft.com/download/7/1/d/ServiceTags_Public_20260727.json")
        );
        assert_eq!(azure_json_url("<html></html>"), None);
    }
}
