//! Requirements manifest reader.
//!
//! A manifest holds one requirement per line:
//! `name[extra,...]<constraint>; <marker>`, where only the name is mandatory.
//! Blank lines and `#` comments are skipped; everything else must parse or
//! the whole manifest is rejected.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::ManifestError;

/// A package name plus optional extras, version constraint and environment
/// marker, e.g. `numpy>=1.24` or `tomli>=2.0; python_version < "3.11"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSpecifier {
    name: String,
    extras: Vec<String>,
    version_constraint: Option<String>,
    marker: Option<String>,
}

impl PackageSpecifier {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extras(&self) -> &[String] {
        &self.extras
    }

    pub fn version_constraint(&self) -> Option<&str> {
        self.version_constraint.as_deref()
    }

    /// Environment marker, passed to pip untouched.
    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    /// PEP 503 form of the name, used for duplicate detection and artifact matching.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

impl fmt::Display for PackageSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(constraint) = &self.version_constraint {
            f.write_str(constraint)?;
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for PackageSpecifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_specifier(s)
    }
}

/// Lowercase the name and collapse runs of `-`, `_` and `.` into a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.extend(c.to_lowercase());
            in_separator = false;
        }
    }
    out
}

fn specifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[(?P<extras>\s*[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?\s*(?:,\s*[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?\s*)*)\]\s*)?(?P<constraint>(?:===|==|!=|<=|>=|~=|<|>)\s*[A-Za-z0-9.*+!_-]+(?:\s*,\s*(?:===|==|!=|<=|>=|~=|<|>)\s*[A-Za-z0-9.*+!_-]+)*)?$",
        )
        .expect("specifier pattern is valid")
    })
}

fn parse_specifier(text: &str) -> Result<PackageSpecifier, String> {
    if text.starts_with('-') {
        return Err("pip options are not supported in the manifest".to_string());
    }
    let (requirement, marker) = match text.split_once(';') {
        Some((requirement, marker)) => {
            let marker = marker.trim();
            if marker.is_empty() {
                return Err("empty environment marker after `;`".to_string());
            }
            (requirement.trim(), Some(marker.to_string()))
        }
        None => (text, None),
    };
    let caps = specifier_pattern().captures(requirement).ok_or_else(|| {
        "expected `name[extras]` optionally followed by a version constraint".to_string()
    })?;
    let extras = caps
        .name("extras")
        .map(|m| m.as_str().split(',').map(|e| e.trim().to_string()).collect())
        .unwrap_or_default();
    let version_constraint = caps.name("constraint").map(|m| {
        m.as_str()
            .split(',')
            .map(|clause| clause.split_whitespace().collect::<String>())
            .collect::<Vec<_>>()
            .join(",")
    });
    Ok(PackageSpecifier {
        name: caps["name"].to_string(),
        extras,
        version_constraint,
        marker,
    })
}

/// Drop a trailing ` # comment`; a `#` glued to other text is kept.
fn strip_inline_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

/// Parse manifest text into specifiers in file order.
pub fn parse_manifest(text: &str) -> Result<Vec<PackageSpecifier>, ManifestError> {
    let mut specifiers = Vec::new();
    let mut seen = HashSet::new();

    for (index, raw) in text.lines().enumerate() {
        let line_number = index + 1;
        let content = strip_inline_comment(raw).trim();
        if content.is_empty() {
            continue;
        }

        let specifier = parse_specifier(content).map_err(|reason| ManifestError::Parse {
            line_number,
            line: raw.to_string(),
            reason,
        })?;

        // The same package may appear once per distinct marker.
        let key = (specifier.normalized_name(), specifier.marker.clone());
        if !seen.insert(key) {
            return Err(ManifestError::Parse {
                line_number,
                line: raw.to_string(),
                reason: format!("duplicate package {}", specifier.name()),
            });
        }
        debug!(line_number, specifier = %specifier, "Parsed specifier");
        specifiers.push(specifier);
    }

    Ok(specifiers)
}

/// Read and parse the manifest at `path`.
pub fn read_manifest(path: &Path) -> Result<Vec<PackageSpecifier>, ManifestError> {
    info!(path = %path.display(), "Reading requirements manifest");
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!(path = %path.display(), "Manifest not found");
            return Err(ManifestError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => {
            error!(error = ?e, path = %path.display(), "Failed to read manifest");
            return Err(ManifestError::Read {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let specifiers = parse_manifest(&text).inspect_err(|e| {
        error!(error = %e, path = %path.display(), "Failed to parse manifest");
    })?;
    info!(count = specifiers.len(), "Manifest loaded");
    Ok(specifiers)
}
