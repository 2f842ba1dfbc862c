//! Client address normalization.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::http::HeaderMap;

/// Resolved client address, stored in request extensions by the sensor
/// middleware so handlers can read it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Pick the client address for a request.
///
/// Priority when `trust_proxy_headers` is set:
/// 1. First entry of `X-Forwarded-For`
/// 2. `X-Real-IP`
/// 3. The socket peer
///
/// Falls back to `0.0.0.0` when nothing usable is present. IPv4-mapped IPv6
/// addresses are reported in their IPv4 form.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> IpAddr {
    let from_headers = if trust_proxy_headers {
        forwarded_for(headers).or_else(|| real_ip(headers))
    } else {
        None
    };

    let ip = from_headers
        .or_else(|| peer.map(|p| p.ip()))
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    normalize(ip)
}

/// Strip the `::ffff:` prefix from IPv4-mapped IPv6 addresses.
pub fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    parse_addr(value.split(',').next()?)
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    parse_addr(headers.get("x-real-ip")?.to_str().ok()?)
}

/// Accepts a bare address or an address with a port (`1.2.3.4:80`, `[::1]:80`).
fn parse_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
}
