//! Best-effort geolocation of client addresses.
//!
//! Lookups never fail: a miss yields [`GeoInfo::unknown()`]. Addresses that
//! cannot be routed on the public internet (private, loopback, link-local,
//! unspecified) are never looked up.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;
use tripwire_core::{GeoInfo, GeoPoint};

use crate::error::{Error, Result};

/// Source of location data for an address.
pub trait GeoResolver: Send + Sync {
    /// Return the location of `ip`, or `None` on a miss.
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Resolve `ip`, substituting the unknown placeholder on a miss.
pub fn resolve(resolver: &dyn GeoResolver, ip: IpAddr) -> GeoInfo {
    if !is_public(ip) {
        return GeoInfo::unknown();
    }
    resolver.lookup(ip).unwrap_or_else(GeoInfo::unknown)
}

/// Whether `ip` may have a public location.
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public(IpAddr::V4(v4)),
            None => {
                !(v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local())
            }
        },
    }
}

/// Resolver that never knows anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeo;

impl GeoResolver for NoGeo {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoInfo> {
        None
    }
}

/// One row of the geo table file.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoRange {
    pub start: IpAddr,
    pub end: IpAddr,
    pub country: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone)]
struct Entry {
    start: u128,
    end: u128,
    info: GeoInfo,
}

/// Address-range table answered by binary search.
///
/// Ranges must not overlap. IPv4 ranges are stored in the IPv4-mapped IPv6
/// space so both families share one sorted table.
#[derive(Debug, Clone, Default)]
pub struct GeoTable {
    entries: Vec<Entry>,
}

fn key(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

impl GeoTable {
    /// Build a table from ranges, validating order and overlap.
    pub fn from_ranges(ranges: Vec<GeoRange>) -> Result<Self> {
        let mut entries = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.start.is_ipv4() != range.end.is_ipv4() {
                return Err(Error::Geo(format!(
                    "range {} - {} mixes address families",
                    range.start, range.end
                )));
            }
            let (start, end) = (key(range.start), key(range.end));
            if start > end {
                return Err(Error::Geo(format!(
                    "range {} - {} is inverted",
                    range.start, range.end
                )));
            }
            entries.push(Entry {
                start,
                end,
                info: GeoInfo {
                    country: range.country,
                    city: range.city,
                    ll: GeoPoint {
                        lat: range.lat,
                        lon: range.lon,
                    },
                },
            });
        }

        entries.sort_by_key(|e| e.start);
        if let Some(pair) = entries.windows(2).find(|w| w[1].start <= w[0].end) {
            return Err(Error::Geo(format!(
                "ranges starting at {:#x} and {:#x} overlap",
                pair[0].start, pair[1].start
            )));
        }

        Ok(Self { entries })
    }

    /// Parse a JSON array of `{start, end, country, city, lat, lon}`.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let ranges: Vec<GeoRange> = serde_json::from_slice(bytes)?;
        Self::from_ranges(ranges)
    }

    /// Load a table from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let table = Self::from_json(&bytes)?;
        tracing::info!(path = %path.display(), ranges = table.len(), "loaded geo table");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoResolver for GeoTable {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        let k = key(ip);
        // Index of the first entry starting after k; the candidate is the one before.
        let idx = self.entries.partition_point(|e| e.start <= k);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        (k <= entry.end).then(|| entry.info.clone())
    }
}
