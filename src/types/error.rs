use color_eyre::Report;

#[derive(thiserror::Error, Debug)]
/// Service error type
pub enum MirrorsError {
    /// Configuration is missing or invalid
    #[error("Failed to load configuration")]
    Config(#[source] CfgErr),

    /// Network error
    #[error("Network error")]
    Network(#[source] NetErr),

    /// Relational store failure
    #[error("Mirror store error")]
    Store(#[source] sqlx::Error),

    /// GeoIP databases could not be opened
    #[error("GeoIP database error")]
    Geo(#[source] Report),

    /// Io related errors
    #[error("I/O Error")]
    Io(#[source] std::io::Error),

    /// An update cycle holds the pid lockfile
    #[error("Mirror update is already running, lockfile: {0}")]
    UpdateLocked(String),

    /// Catch-all for general errors
    #[error(transparent)]
    General(#[from] Report),
}

#[derive(thiserror::Error, Debug)]
pub enum NetErr {
    #[error("Reqwest error: {0}")]
    Reqwest(#[source] reqwest::Error),

    #[error("HTTP request failed with status: {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("DNS resolution error: {0}")]
    Dns(#[source] hickory_resolver::error::ResolveError),

    #[error("JSON parse error: {0}")]
    JsonParse(#[source] serde_json::Error),

    #[error("Cache error: {0}")]
    Redis(#[source] redis::RedisError),

    #[error(transparent)]
    Other(#[from] Report),
}

#[derive(thiserror::Error, Debug)]
/// Configuration error type
pub enum CfgErr {
    /// Failure to read a config file
    #[error("Config file not found or unreadable: {0}")]
    NotFound(String, #[source] std::io::Error),

    /// Failure to parse a config file
    #[error("Config file {0} contains invalid YAML")]
    ParseFail(String, #[source] serde_yaml::Error),

    /// The declared config_version has no registered schema
    #[error("Config file {0} declares unsupported config_version {1}")]
    UnsupportedVersion(String, u64),

    /// Structurally valid YAML that violates a service constraint
    #[error("Invalid config {0}: {1}")]
    Invalid(String, String),
}

#[derive(thiserror::Error, Debug)]
/// Request-path error taxonomy, mapped onto HTTP status codes by the server
pub enum ApiError {
    /// Unknown version, arch, repository, protocol or country
    #[error("{0}")]
    UnknownRepoAttribute(String),

    /// Missing or wrong update key
    #[error("Authentication failed")]
    Unauthorized,

    /// Programming error or resource exhaustion
    #[error("Internal server error")]
    Internal(#[source] Report),
}
