//! Output renderings of [`InstanceRecord`]s.
//!
//! Every renderer turns one record into one line so records can be written
//! as soon as they arrive.

use crate::scanner::InstanceRecord;
use std::fmt;

/// Column order of the flat rendering; `location` is flattened inline.
pub const CSV_COLUMNS: [&str; 13] = [
    "instance",
    "active",
    "ip_address",
    "version",
    "hostname",
    "as",
    "isp",
    "city",
    "regionName",
    "country",
    "countryCode",
    "lat",
    "lon",
];

/// Formats records for output.
pub trait Renderer: Send + Sync {
    /// Line printed once before any record.
    fn header(&self) -> Option<String> {
        None
    }

    fn render(&self, record: &InstanceRecord) -> String;
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
    Text,
}

impl OutputFormat {
    pub fn renderer(self) -> Box<dyn Renderer> {
        match self {
            OutputFormat::Csv => Box::new(CsvRenderer),
            OutputFormat::Json => Box::new(JsonRenderer),
            OutputFormat::Text => Box::new(TextRenderer),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

/// Comma-separated values; unset fields are empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRenderer;

impl Renderer for CsvRenderer {
    fn header(&self) -> Option<String> {
        Some(CSV_COLUMNS.join(","))
    }

    fn render(&self, record: &InstanceRecord) -> String {
        let mut fields = vec![
            record.id().to_string(),
            record.active().map(|a| a.to_string()).unwrap_or_default(),
            record.ip_address().unwrap_or_default().to_string(),
            record.version().unwrap_or_default().to_string(),
            record.hostname().unwrap_or_default().to_string(),
        ];

        match record.location() {
            Some(loc) => fields.extend([
                loc.as_name.clone(),
                loc.isp.clone(),
                loc.city.clone(),
                loc.region.clone(),
                loc.country.clone(),
                loc.country_code.clone(),
                loc.lat.to_string(),
                loc.lon.to_string(),
            ]),
            None => fields.extend(std::iter::repeat_n(String::new(), 8)),
        }

        fields
            .iter()
            .map(|f| escape_csv(f))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// One JSON object per line with `location` nested.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn render(&self, record: &InstanceRecord) -> String {
        serde_json::to_string(record).unwrap_or_else(|e| {
            serde_json::json!({ "instance": record.id(), "error": e.to_string() }).to_string()
        })
    }
}

/// Aligned columns for reading in a terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRenderer;

impl Renderer for TextRenderer {
    fn render(&self, record: &InstanceRecord) -> String {
        let state = match record.active() {
            Some(true) => "active",
            Some(false) => "inactive",
            None => "unknown",
        };
        let mut line = format!(
            "{:>6}  {:8}  {:15}  {:14}  {}",
            record.id(),
            state,
            record.ip_address().unwrap_or("-"),
            record.version().unwrap_or("-"),
            record.hostname().unwrap_or("-"),
        );
        if let Some(loc) = record.location() {
            line.push_str(&format!("  ({}, {}, {})", loc.city, loc.region, loc.country));
        }
        line
    }
}
