//! Client address resolution.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Key shared by every request whose address cannot be determined.
pub const UNKNOWN_CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Extract IP address from request.
///
/// Forwarding headers are read only when the socket peer falls inside `trusted_proxies`:
/// X-Real-IP first, then the first X-Forwarded-For entry. Otherwise the peer address from
/// `ConnectInfo` is the client.
pub fn extract_ip_from_request(
    req: &Request<Body>,
    trusted_proxies: &[IpNetwork],
) -> Option<IpAddr> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let from_proxy = peer
        .map(|ip| trusted_proxies.iter().any(|network| network.contains(ip)))
        .unwrap_or(false);
    if !from_proxy {
        return peer;
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse() {
                return Some(ip);
            }
        }
    }

    if let Some(forwarded_for) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded_for.to_str() {
            // Take the first IP in the list
            if let Some(ip_str) = value.split(',').next() {
                if let Ok(ip) = ip_str.trim().parse() {
                    return Some(ip);
                }
            }
        }
    }

    peer
}
