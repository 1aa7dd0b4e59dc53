//! Contextual enrichment of raw events: geo-location and time-of-day bucket.

mod geo;

pub use geo::{CachedGeoResolver, CidrGeoTable, GeoNetwork, GeoResolver};

use crate::events::RawEvent;
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Night,
    Morning,
    Afternoon,
    Evening,
}

impl TimeBucket {
    /// 00-05 night, 06-11 morning, 12-17 afternoon, 18-23 evening.
    pub fn from_hour(hour: u32) -> Self {
        match hour % 24 {
            0..=5 => TimeBucket::Night,
            6..=11 => TimeBucket::Morning,
            12..=17 => TimeBucket::Afternoon,
            _ => TimeBucket::Evening,
        }
    }
}

/// Result of [`Enricher::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub geo: Option<GeoLocation>,
    pub time_bucket: TimeBucket,
}

pub struct Enricher {
    geo: Arc<dyn GeoResolver>,
}

impl Enricher {
    pub fn new(geo: Arc<dyn GeoResolver>) -> Self {
        Self { geo }
    }

    /// Never fails: an unparsable or unmapped address just yields no geo.
    /// A `geoip` block attached by the sensor pipeline takes precedence over
    /// the resolver.
    pub fn resolve(&self, event: &RawEvent) -> Enrichment {
        let geo = sensor_geo(event).or_else(|| match event.source_ip.trim().parse::<IpAddr>() {
            Ok(ip) => self.geo.lookup(ip),
            Err(_) => {
                tracing::debug!(event_id = %event.id, source_ip = %event.source_ip, "unparsable source address");
                None
            }
        });
        Enrichment {
            geo,
            time_bucket: TimeBucket::from_hour(event.timestamp.hour()),
        }
    }
}

/// Filebeat's `geoip` object (`country_name`, optional `city_name`). Anything
/// without a usable country name is ignored.
fn sensor_geo(event: &RawEvent) -> Option<GeoLocation> {
    let geoip = event.payload.get("geoip")?.as_object()?;
    let country = geoip
        .get("country_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())?;
    let city = geoip
        .get("city_name")
        .and_then(Value::as_str)
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string);
    Some(GeoLocation {
        country: country.to_string(),
        city,
    })
}
