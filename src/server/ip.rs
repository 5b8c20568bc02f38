//! Client address extraction: `TEST_IP_ADDRESS` override, then the first
//! non-private hop of `X-Forwarded-For`, then `X-Real-Ip`, then the
//! socket peer.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> Option<IpAddr> {
    let test_override = std::env::var("TEST_IP_ADDRESS")
        .ok()
        .and_then(|raw| raw.trim().parse().ok());
    extract_client_ip(test_override, headers, peer)
}

pub(crate) fn extract_client_ip(
    test_override: Option<IpAddr>,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Option<IpAddr> {
    if let Some(ip) = test_override {
        return Some(ip);
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        for hop in forwarded.split(',') {
            if let Ok(ip) = hop.trim().parse::<IpAddr>()
                && !is_private_ip(ip)
            {
                return Some(ip);
            }
        }
    }
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
    {
        return Some(ip);
    }
    Some(peer.ip())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}
