//! Extractors for the values the probe reads out of HTTP responses.
//!
//! Each extractor is best-effort: a mismatch is reported as a
//! [`StageError`] and the caller leaves the field unset.

use super::record::Location;
use crate::error::StageError;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::LazyLock;

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(AirWatch|VMware Workspace ONE UEM);(.*)").expect("valid version regex")
});

static LOGIN_HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https://([^/]+)/(AirWatch|IdentityService)").expect("valid hostname regex")
});

#[derive(Debug, Deserialize)]
struct HelpManifest {
    #[serde(default)]
    apis: Vec<HelpApi>,
}

#[derive(Debug, Deserialize)]
struct HelpApi {
    #[serde(default)]
    products: Vec<String>,
}

/// Strip the vendor prefix from a product string such as
/// `VMware Workspace ONE UEM;9.6`.
pub fn strip_vendor_prefix(product: &str) -> Option<String> {
    let captures = VERSION_PATTERN.captures(product)?;
    let version = captures.get(2)?.as_str().trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

/// Pull the version out of a help manifest (`apis[0].products[0]`).
pub fn extract_version(body: &str) -> Result<String, StageError> {
    let manifest: HelpManifest =
        serde_json::from_str(body).map_err(|e| StageError::Parse(e.to_string()))?;

    let product = manifest
        .apis
        .first()
        .and_then(|api| api.products.first())
        .ok_or_else(|| StageError::Parse("manifest lists no products".to_string()))?;

    strip_vendor_prefix(product)
        .ok_or_else(|| StageError::Parse(format!("unrecognised product string {:?}", product)))
}

/// Company hostname from a post-redirect URL, or the URL itself when it is
/// not a recognised login page (SAML/SSO providers).
pub fn extract_hostname(final_url: &str) -> String {
    LOGIN_HOST_PATTERN
        .captures(final_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| final_url.to_string())
}

/// Request path and response layout of the geolocation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeoStyle {
    /// `GET /json/<ip>` (ip-api.com)
    #[default]
    IpApi,
    /// `GET /<ip>/json` (ipapi.co)
    PathSuffix,
}

impl GeoStyle {
    pub fn path_for(&self, ip: &str) -> String {
        match self {
            GeoStyle::IpApi => format!("/json/{}", ip),
            GeoStyle::PathSuffix => format!("/{}/json", ip),
        }
    }
}

impl fmt::Display for GeoStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoStyle::IpApi => write!(f, "ip-api"),
            GeoStyle::PathSuffix => write!(f, "path-suffix"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: Option<String>,
    message: Option<String>,
    #[serde(rename = "as", default)]
    as_name: String,
    #[serde(default)]
    isp: String,
    #[serde(default)]
    city: String,
    #[serde(rename = "regionName", default)]
    region: String,
    #[serde(default)]
    country: String,
    #[serde(rename = "countryCode", default)]
    country_code: String,
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PathSuffixResponse {
    #[serde(default)]
    error: bool,
    reason: Option<String>,
    #[serde(default)]
    asn: String,
    #[serde(default)]
    org: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    country_name: String,
    #[serde(default)]
    country_code: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Parse a geolocation response. Commas are removed from the AS and ISP
/// names so flat output stays one field per value.
pub fn parse_location(style: GeoStyle, body: &str) -> Result<Location, StageError> {
    let unavailable = |msg: String| StageError::GeolocationUnavailable(msg);

    let location = match style {
        GeoStyle::IpApi => {
            let resp: IpApiResponse =
                serde_json::from_str(body).map_err(|e| unavailable(e.to_string()))?;
            if resp.status.as_deref() == Some("fail") {
                return Err(unavailable(
                    resp.message.unwrap_or_else(|| "lookup failed".to_string()),
                ));
            }
            let (Some(lat), Some(lon)) = (resp.lat, resp.lon) else {
                return Err(unavailable("response has no coordinates".to_string()));
            };
            Location {
                as_name: resp.as_name,
                isp: resp.isp,
                city: resp.city,
                region: resp.region,
                country: resp.country,
                country_code: resp.country_code,
                lat,
                lon,
            }
        }
        GeoStyle::PathSuffix => {
            let resp: PathSuffixResponse =
                serde_json::from_str(body).map_err(|e| unavailable(e.to_string()))?;
            if resp.error {
                return Err(unavailable(
                    resp.reason.unwrap_or_else(|| "lookup failed".to_string()),
                ));
            }
            let (Some(lat), Some(lon)) = (resp.latitude, resp.longitude) else {
                return Err(unavailable("response has no coordinates".to_string()));
            };
            Location {
                as_name: format!("{} {}", resp.asn, resp.org).trim().to_string(),
                isp: resp.org,
                city: resp.city,
                region: resp.region,
                country: resp.country_name,
                country_code: resp.country_code,
                lat,
                lon,
            }
        }
    };

    Ok(Location {
        as_name: location.as_name.replace(',', ""),
        isp: location.isp.replace(',', ""),
        ..location
    })
}
