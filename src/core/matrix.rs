//! Matrix expansion
//!
//! A job template with a matrix becomes one instance per axis combination.
//! Combinations are produced in declaration order, first axis varying slowest.

use crate::core::config::MatrixSpec;
use crate::core::error::ConfigError;
use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

/// A bound matrix coordinate, axis order preserved
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Coordinate(Vec<(String, String)>);

impl Coordinate {
    pub fn new(values: Vec<(String, String)>) -> Self {
        Self(values)
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == axis)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0.iter().cloned().collect()
    }

    /// Every key of `partial` is bound to the same value here
    fn matches(&self, partial: &BTreeMap<String, String>) -> bool {
        partial.iter().all(|(k, v)| self.get(k) == Some(v.as_str()))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl Serialize for Coordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Display name of a job instance: `rust (os=ubuntu-latest)`
pub fn display_name(job: &str, coordinate: &Coordinate) -> String {
    if coordinate.is_empty() {
        job.to_string()
    } else {
        format!("{} ({})", job, coordinate)
    }
}

/// Axis names a condition or placeholder may reference
pub fn declared_axes(spec: &MatrixSpec) -> BTreeSet<String> {
    spec.axes
        .iter()
        .map(|(name, _)| name.clone())
        .chain(spec.include.iter().flat_map(|entry| entry.keys().cloned()))
        .collect()
}

/// Expand a matrix into its coordinates.
///
/// No axes gives a single empty coordinate; an axis without values gives
/// none. `exclude` entries remove every combination they partially match,
/// then `include` entries not already present are appended.
pub fn expand(spec: &MatrixSpec) -> Vec<Coordinate> {
    if spec.axes.is_empty() && spec.include.is_empty() {
        return vec![Coordinate::default()];
    }

    let mut combinations: Vec<Vec<(String, String)>> = vec![Vec::new()];
    if spec.axes.is_empty() {
        combinations.clear();
    }
    for (axis, values) in &spec.axes {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combo in &combinations {
            for value in values {
                let mut extended = combo.clone();
                extended.push((axis.clone(), value.clone()));
                next.push(extended);
            }
        }
        combinations = next;
    }

    let mut coordinates: Vec<Coordinate> = combinations
        .into_iter()
        .map(Coordinate)
        .filter(|c| !spec.exclude.iter().any(|ex| c.matches(ex)))
        .collect();

    for entry in &spec.include {
        let coordinate = ordered_entry(spec, entry);
        if !coordinates.contains(&coordinate) {
            coordinates.push(coordinate);
        }
    }

    coordinates
}

/// Order an include entry by axis declaration, extra keys last
fn ordered_entry(spec: &MatrixSpec, entry: &BTreeMap<String, String>) -> Coordinate {
    let mut values: Vec<(String, String)> = spec
        .axes
        .iter()
        .filter_map(|(axis, _)| entry.get(axis).map(|v| (axis.clone(), v.clone())))
        .collect();
    for (k, v) in entry {
        if !spec.axes.iter().any(|(axis, _)| axis == k) {
            values.push((k.clone(), v.clone()));
        }
    }
    Coordinate(values)
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\{\s*matrix\.([A-Za-z_][A-Za-z0-9_-]*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Axis names referenced by `${{ matrix.<axis> }}` placeholders in `text`
pub fn placeholders(text: &str) -> Vec<String> {
    placeholder_pattern()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Reject placeholders naming axes the job does not declare
pub fn check_placeholders(
    job: &str,
    text: &str,
    axes: &BTreeSet<String>,
) -> Result<(), ConfigError> {
    match placeholders(text).into_iter().find(|a| !axes.contains(a)) {
        Some(axis) => Err(ConfigError::UnknownMatrixAxis {
            job: job.to_string(),
            axis,
        }),
        None => Ok(()),
    }
}

/// Substitute `${{ matrix.<axis> }}` placeholders with bound values
pub fn substitute(text: &str, coordinate: &Coordinate) -> String {
    placeholder_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            coordinate.get(&caps[1]).unwrap_or_default().to_string()
        })
        .into_owned()
}
