//! Client IP resolution for rate-limit keys.
//!
//! # IP Spoofing
//!
//! `X-Forwarded-For` and `X-Real-IP` are plain request headers: any client
//! can send them. Using them unconditionally lets an attacker rotate spoofed
//! addresses to bypass per-IP limits, or frame an innocent address to get it
//! locked out. They are therefore only honoured when the **peer address of
//! the TCP connection** lies inside a configured trusted-proxy range. With no
//! ranges configured, forwarded headers are never trusted.
//!
//! The peer address comes from Axum's `ConnectInfo<SocketAddr>` extension,
//! which is present when the app is served with
//! `into_make_service_with_connect_info::<SocketAddr>()`.
//!
//! # Resolution Order
//!
//! ```text
//!   peer known? ──no──► "unknown"
//!       │yes
//!   peer trusted? ──no──► peer IP
//!       │yes
//!   X-Forwarded-For (first entry) ─► X-Real-IP ─► peer IP
//! ```

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback key when no client IP can be determined.
///
/// All requests without an identifiable peer share this key.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is accepted as a single-host range (/32 or /128).
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let Some((addr, prefix)) = cidr.split_once('/') else {
            let network: IpAddr = cidr.parse().ok()?;
            return Some(Self {
                network,
                prefix_len: max_prefix(&network),
            });
        };

        let network: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;
        if prefix_len > max_prefix(&network) {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    ///
    /// IPv4-mapped IPv6 peers (`::ffff:10.0.0.1`) are matched against IPv4
    /// ranges, since dual-stack listeners report IPv4 clients that way.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(*ip, IpAddr::V4),
            IpAddr::V4(_) => *ip,
        };

        match (&self.network, &ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Allow-list of reverse proxies whose forwarded headers may be trusted.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build the allow-list from CIDR strings.
    ///
    /// Invalid entries are logged as warnings and skipped rather than
    /// failing construction.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid trusted proxy range, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    /// Whether any valid range is configured.
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `ip` belongs to a trusted proxy. Always `false` when no
    /// ranges are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Where a forwarded client IP was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    /// First entry of X-Forwarded-For.
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

/// Read the forwarded client IP from headers, without any trust decision.
#[inline]
fn extract_ip_from_headers<B>(req: &Request<B>) -> ExtractedIp<'_> {
    // "client, proxy1, proxy2" - the first entry is the original client
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

/// IP address of the connected peer, if the server recorded it.
#[inline]
pub fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Peer IP as a key, or [`UNKNOWN_IP`].
///
/// The port is deliberately dropped: clients open a new ephemeral port per
/// connection, and keying on it would give every connection its own bucket.
pub fn peer_key<B>(req: &Request<B>) -> Cow<'static, str> {
    match peer_ip(req) {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

/// Resolve the client IP, honouring forwarded headers only from trusted peers.
pub fn client_ip_with_trusted_proxies<B>(
    req: &Request<B>,
    trusted_proxies: &TrustedProxyConfig,
) -> Cow<'static, str> {
    let forwarded = extract_ip_from_headers(req);

    let Some(peer) = peer_ip(req) else {
        if forwarded != ExtractedIp::NotFound {
            debug!("Forwarded header ignored: peer address unavailable");
        }
        return Cow::Borrowed(UNKNOWN_IP);
    };

    if !trusted_proxies.is_trusted(&peer) {
        if forwarded != ExtractedIp::NotFound {
            debug!(peer = %peer, "Forwarded header from untrusted peer ignored");
        }
        return Cow::Owned(peer.to_string());
    }

    match forwarded {
        ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) => Cow::Owned(ip.to_string()),
        ExtractedIp::NotFound => Cow::Owned(peer.to_string()),
    }
}
