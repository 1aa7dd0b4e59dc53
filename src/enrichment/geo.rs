//! Source address → geo-location lookup over a CIDR table, with a bounded cache.

use super::GeoLocation;
use crate::config::GeoConfig;
use crate::error::ConfigError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

pub trait GeoResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// One row of the geo table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoNetwork {
    pub cidr: IpNet,
    pub country: String,
    #[serde(default)]
    pub city: Option<String>,
}

/// Longest-prefix-match table.
#[derive(Debug, Clone, Default)]
pub struct CidrGeoTable {
    networks: Vec<GeoNetwork>,
}

impl CidrGeoTable {
    pub fn new(mut networks: Vec<GeoNetwork>) -> Self {
        // Most specific first; stable so equal prefixes keep file order.
        networks.sort_by(|a, b| b.cidr.prefix_len().cmp(&a.cidr.prefix_len()));
        Self { networks }
    }

    /// Inline networks from config plus the optional JSON table file.
    pub fn load(config: &GeoConfig) -> Result<Self, ConfigError> {
        let mut networks = config.networks.clone();
        if let Some(path) = &config.table_path {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let rows: Vec<GeoNetwork> =
                serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            networks.extend(rows);
        }
        Ok(Self::new(networks))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl GeoResolver for CidrGeoTable {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        // IPv4-mapped IPv6 addresses match IPv4 rows.
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.networks
            .iter()
            .find(|n| n.cidr.contains(&ip))
            .map(|n| GeoLocation {
                country: n.country.clone(),
                city: n.city.clone(),
            })
    }
}

/// Memoises lookups of an inner resolver. Cleared wholesale when full.
pub struct CachedGeoResolver<R> {
    inner: R,
    capacity: usize,
    cache: Mutex<HashMap<IpAddr, Option<GeoLocation>>>,
}

impl<R: GeoResolver> CachedGeoResolver<R> {
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<R: GeoResolver> GeoResolver for CachedGeoResolver<R> {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        if let Some(hit) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(&ip) {
            return hit.clone();
        }
        let resolved = self.inner.lookup(ip);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= self.capacity {
            cache.clear();
        }
        cache.insert(ip, resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn net(cidr: &str, country: &str) -> GeoNetwork {
        GeoNetwork {
            cidr: cidr.parse().unwrap(),
            country: country.into(),
            city: None,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let t = CidrGeoTable::new(vec![net("10.0.0.0/8", "Wide"), net("10.1.0.0/16", "Narrow")]);
        assert_eq!(t.lookup("10.1.2.3".parse().unwrap()).unwrap().country, "Narrow");
        assert_eq!(t.lookup("10.2.2.3".parse().unwrap()).unwrap().country, "Wide");
        assert!(t.lookup("11.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn ipv6_and_mapped_ipv4() {
        let t = CidrGeoTable::new(vec![net("2001:db8::/32", "Six"), net("192.0.2.0/24", "Four")]);
        assert_eq!(t.lookup("2001:db8::1".parse().unwrap()).unwrap().country, "Six");
        assert_eq!(t.lookup("::ffff:192.0.2.7".parse().unwrap()).unwrap().country, "Four");
    }

    #[test]
    fn load_merges_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.json");
        std::fs::write(
            &path,
            r#"[{"cidr": "198.51.100.0/24", "country": "Fileland", "city": "Filetown"}]"#,
        )
        .unwrap();
        let config = GeoConfig {
            table_path: Some(path),
            networks: vec![net("192.0.2.0/24", "Inline")],
            cache_capacity: 16,
        };
        let t = CidrGeoTable::load(&config).unwrap();
        assert_eq!(t.len(), 2);
        let loc = t.lookup("198.51.100.20".parse().unwrap()).unwrap();
        assert_eq!(loc.city.as_deref(), Some("Filetown"));
    }

    struct Counting(AtomicUsize);

    impl GeoResolver for Counting {
        fn lookup(&self, _ip: IpAddr) -> Option<GeoLocation> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn cache_memoises_misses_and_stays_bounded() {
        let r = CachedGeoResolver::new(Counting(AtomicUsize::new(0)), 2);
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        r.lookup(a);
        r.lookup(a);
        assert_eq!(r.inner.0.load(Ordering::SeqCst), 1);

        r.lookup("192.0.2.2".parse().unwrap());
        r.lookup("192.0.2.3".parse().unwrap());
        assert!(r.cached_entries() <= 2);
    }
}
