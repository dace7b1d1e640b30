//! Pricing-document sniffing and structural validation.
//!
//! The sniff is a guess about user intent: it only decides whether an upload is offered as the
//! session's pricing context. An explicit context selection always overrides it.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Extensions accepted by the upload surface.
pub const UPLOAD_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Extensions that may be adopted as pricing context automatically.
pub const PRICING_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

pub const PRICING_MARKERS: [&str; 8] = [
    "saasName",
    "syntaxVersion",
    "version",
    "createdAt",
    "currency",
    "plans",
    "features",
    "addOns",
];

pub const MARKER_QUORUM: usize = 3;

pub const REQUIRED_KEYS: [&str; 3] = ["saasName", "version", "plans"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub missing_fields: Vec<String>,
    pub reason: Option<String>,
}

impl ValidationReport {
    fn valid() -> Self {
        Self { is_valid: true, missing_fields: Vec::new(), reason: None }
    }

    fn invalid(reason: impl Into<String>, missing_fields: Vec<String>) -> Self {
        Self { is_valid: false, missing_fields, reason: Some(reason.into()) }
    }
}

pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name).extension().and_then(|ext| ext.to_str()).map(|ext| ext.to_ascii_lowercase())
}

pub fn is_allowed_upload(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| UPLOAD_EXTENSIONS.contains(&ext.as_str()))
}

pub fn has_pricing_extension(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| PRICING_EXTENSIONS.contains(&ext.as_str()))
}

/// Top-level keys of a YAML/JSON document. Falls back to a line scan when the
/// document does not parse, so half-broken uploads can still be recognised.
pub fn top_level_keys(content: &str) -> BTreeSet<String> {
    match serde_yaml::from_str::<Value>(content) {
        Ok(Value::Mapping(mapping)) => mapping
            .keys()
            .filter_map(|key| key.as_str().map(ToString::to_string))
            .collect(),
        _ => scan_top_level_keys(content),
    }
}

fn scan_top_level_keys(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter(|line| !line.starts_with('#') && !line.starts_with('-'))
        .filter_map(|line| line.split_once(':').map(|(key, _)| key))
        .map(|key| key.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

pub fn marker_count(content: &str) -> usize {
    let keys = top_level_keys(content);
    PRICING_MARKERS.iter().filter(|marker| keys.contains(**marker)).count()
}

pub fn looks_like_pricing_document(name: &str, content: &str) -> bool {
    has_pricing_extension(name) && marker_count(content) >= MARKER_QUORUM
}

pub fn validate_document(content: &str) -> ValidationReport {
    let document = match serde_yaml::from_str::<Value>(content) {
        Ok(document) => document,
        Err(error) => {
            return ValidationReport::invalid(
                format!("document is not valid YAML: {error}"),
                Vec::new(),
            )
        }
    };

    let Value::Mapping(mapping) = document else {
        return ValidationReport::invalid("document root must be a mapping", Vec::new());
    };

    let missing_fields = REQUIRED_KEYS
        .iter()
        .filter(|key| !mapping.contains_key(**key))
        .map(|key| (*key).to_string())
        .collect::<Vec<_>>();

    if missing_fields.is_empty() {
        ValidationReport::valid()
    } else {
        ValidationReport::invalid(
            format!("missing required top-level keys: {}", missing_fields.join(", ")),
            missing_fields,
        )
    }
}
