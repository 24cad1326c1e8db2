//! Per-instance scan results.

use serde::{Deserialize, Serialize};

/// Version value recorded when the version API answers 403.
pub const API_PROTECTED: &str = "API Protected";

/// Geolocation of an instance's IP address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "as")]
    pub as_name: String,
    pub isp: String,
    pub city: String,
    #[serde(rename = "regionName")]
    pub region: String,
    pub country: String,
    #[serde(rename = "countryCode")]
    pub country_code: String,
    pub lat: f64,
    pub lon: f64,
}

/// Everything learned about one instance ID.
///
/// Only the probe that owns a record can fill it in, and each field can be
/// set once. Consumers get read-only access.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceRecord {
    #[serde(rename = "instance")]
    id: u64,
    /// `None` until the liveness check has run.
    active: Option<bool>,
    ip_address: Option<String>,
    version: Option<String>,
    hostname: Option<String>,
    location: Option<Location>,
}

impl InstanceRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            active: None,
            ip_address: None,
            version: None,
            hostname: None,
            location: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn active(&self) -> Option<bool> {
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active == Some(true)
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub(crate) fn mark_active(&mut self, active: bool) {
        if self.active.is_none() {
            self.active = Some(active);
        }
    }

    pub(crate) fn set_ip_address(&mut self, ip: String) {
        self.ip_address.get_or_insert(ip);
    }

    pub(crate) fn set_version(&mut self, version: String) {
        self.version.get_or_insert(version);
    }

    pub(crate) fn set_hostname(&mut self, hostname: String) {
        self.hostname.get_or_insert(hostname);
    }

    pub(crate) fn set_location(&mut self, location: Location) {
        self.location.get_or_insert(location);
    }
}

#[cfg(test)]
pub(crate) fn atlanta() -> Location {
    Location {
        as_name: "AS33517 DYNDNS".to_string(),
        isp: "Dynamic Network Services Inc.".to_string(),
        city: "Atlanta".to_string(),
        region: "Georgia".to_string(),
        country: "United States".to_string(),
        country_code: "US".to_string(),
        lat: 33.749,
        lon: -84.388,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_are_set_once() {
        let mut record = InstanceRecord::new(40);
        record.set_ip_address("205.139.50.61".to_string());
        record.set_ip_address("10.0.0.1".to_string());
        record.mark_active(false);
        record.mark_active(true);

        assert_eq!(record.ip_address(), Some("205.139.50.61"));
        assert_eq!(record.active(), Some(false));
        assert!(!record.is_active());
    }

    #[test]
    fn test_serializes_with_output_keys() {
        let mut record = InstanceRecord::new(138);
        record.mark_active(true);
        record.set_location(atlanta());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["instance"], 138);
        assert_eq!(value["active"], true);
        assert!(value["ip_address"].is_null());
        assert_eq!(value["location"]["as"], "AS33517 DYNDNS");
        assert_eq!(value["location"]["regionName"], "Georgia");
        assert_eq!(value["location"]["countryCode"], "US");
    }

    #[test]
    fn test_unknown_activity_serializes_as_null() {
        let value = serde_json::to_value(InstanceRecord::new(0)).unwrap();
        assert!(value["active"].is_null());
    }
}
