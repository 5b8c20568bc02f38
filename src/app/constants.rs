pub const AWS_IP_RANGES_URL: &'static str = "https://ip-ranges.amazonaws.com/ip-ranges.json";
pub const GCP_IP_RANGES_URL: &'static str = "https://www.gstatic.com/ipranges/cloud.json";
pub const OCI_IP_RANGES_URL: &'static str =
    "https://docs.oracle.com/en-us/iaas/tools/public_ip_ranges.json";
pub const AZURE_DOWNLOAD_PAGE_URL: &'static str =
    "https://www.microsoft.com/en-us/download/details.aspx?id=56519";

pub const NOMINATIM_URL: &'static str = "https://nominatim.openstreetmap.org";

/// Mirrors which are always treated as available and skip probing
pub const WHITELIST_MIRRORS: &[&str] = &["repo.almalinux.org"];

pub const LENGTH_GEO_MIRRORS_LIST: usize = 10;
pub const LENGTH_CLOUD_MIRRORS_LIST: usize = 10;

/// Per-IP selection cache and geocoder cache lifetime
pub const CACHE_EXPIRED_TIME: u64 = 60 * 60;
/// How long a failed mirror is kept out of probing
pub const FLAP_EXPIRED_TIME: u64 = 3 * 60 * 60;
/// Filtered mirror-list cache lifetime
pub const MIRRORS_LIST_EXPIRED_TIME: u64 = 2 * 60 * 60;
/// Cloud provider range catalogues change rarely
pub const CLOUD_SUBNETS_EXPIRED_TIME: u64 = 24 * 60 * 60;

/// Update pipeline fan-out limits
pub const MIRRORS_IN_FLIGHT: usize = 100;
pub const ISO_PROBES_IN_FLIGHT: usize = 3;
pub const REPO_PROBES_IN_FLIGHT: usize = 5;

/// HTTP client limits shared by every probe
pub const HTTP_TIMEOUT_SECS: u64 = 15;
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const HTTP_POOL_MAX_TOTAL: usize = 10_000;
pub const HTTP_POOL_MAX_PER_HOST: usize = 20;
pub const HTTP_RETRY_ATTEMPTS: u32 = 2;

pub const DNS_TIMEOUT_SECS: u64 = 5;
pub const DNS_ATTEMPTS: usize = 2;

pub const USER_AGENT: &'static str =
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/56.0.2924.76 Safari/537.36";

/// ISO artefact set a mirror must carry per (version, arch) to advertise
/// a full ISO set. `CHECKSUM` is listed once per directory.
pub const ISO_FILE_TEMPLATES: &[&str] = &[
    "AlmaLinux-{version}-{arch}-boot.iso",
    "AlmaLinux-{version}-{arch}-dvd.iso",
    "AlmaLinux-{version}-{arch}-minimal.iso",
    "AlmaLinux-{version}-{arch}-boot.iso.manifest",
    "AlmaLinux-{version}-{arch}-dvd.iso.manifest",
    "AlmaLinux-{version}-{arch}-minimal.iso.manifest",
    "CHECKSUM",
];
