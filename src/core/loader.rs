//! Parsing configuration files into key/value trees and writing them back.

use crate::error::{ConfigError, Result};
use config::{FileFormat, Map, Value, ValueKind};
use std::path::Path;

/// The root of a parsed configuration document.
pub type Table = Map<String, Value>;

/// Format tag of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension.
    ///
    /// - `yaml`, `yml` -> YAML
    /// - `toml` -> TOML
    /// - `json` -> JSON
    pub fn from_extension(extension: &str) -> Result<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Detect the format of a path from its extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.display().to_string()))?;
        Self::from_extension(extension)
    }

    fn file_format(self) -> FileFormat {
        match self {
            Self::Yaml => FileFormat::Yaml,
            Self::Toml => FileFormat::Toml,
            Self::Json => FileFormat::Json,
        }
    }
}

/// Read and parse a configuration file.
///
/// # Errors
///
/// - [`ConfigError::NotFound`] if the file does not exist
/// - [`ConfigError::Parse`] if the content is not valid `format`
pub(crate) fn parse_file(path: &Path, format: ConfigFormat) -> Result<Table> {
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
        _ => ConfigError::Io(e),
    })?;
    parse_str(&content, format, path)
}

/// Parse configuration text in the given format.
pub(crate) fn parse_str(content: &str, format: ConfigFormat, path: &Path) -> Result<Table> {
    let parse_error = |e: config::ConfigError| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    config::Config::builder()
        .add_source(config::File::from_str(content, format.file_format()))
        .build()
        .map_err(parse_error)?
        .try_deserialize::<Table>()
        .map_err(parse_error)
}

/// Serialize a tree back into text of the given format.
pub(crate) fn render(table: &Table, format: ConfigFormat) -> Result<String> {
    let json = table_to_json(table);
    match format {
        ConfigFormat::Yaml => {
            serde_yaml::to_string(&json).map_err(|e| ConfigError::Write(e.to_string()))
        }
        ConfigFormat::Toml => {
            toml::to_string_pretty(&json).map_err(|e| ConfigError::Write(e.to_string()))
        }
        ConfigFormat::Json => {
            serde_json::to_string_pretty(&json).map_err(|e| ConfigError::Write(e.to_string()))
        }
    }
}

/// Walk `segments` through nested tables (and array indices).
pub(crate) fn lookup<'a, 'k, I>(table: &'a Table, mut segments: I) -> Option<&'a Value>
where
    I: Iterator<Item = &'k str>,
{
    let mut current = table.get(segments.next()?)?;
    for segment in segments {
        current = match &current.kind {
            ValueKind::Table(map) => map.get(segment)?,
            ValueKind::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set `value` at `segments`, replacing scalars on the way with tables.
pub(crate) fn insert(table: &mut Table, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = table;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::new(None, ValueKind::Table(Map::new())));
        if !matches!(entry.kind, ValueKind::Table(_)) {
            entry.kind = ValueKind::Table(Map::new());
        }
        let ValueKind::Table(map) = &mut entry.kind else {
            return;
        };
        current = map;
    }
    current.insert((*last).to_string(), value);
}

fn table_to_json(table: &Table) -> serde_json::Value {
    serde_json::Value::Object(
        table
            .iter()
            .map(|(key, value)| (key.clone(), value_to_json(value)))
            .collect(),
    )
}

fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match &value.kind {
        ValueKind::Nil => Json::Null,
        ValueKind::Boolean(b) => Json::Bool(*b),
        ValueKind::I64(i) => Json::from(*i),
        ValueKind::I128(i) => i64::try_from(*i)
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(i.to_string())),
        ValueKind::U64(u) => Json::from(*u),
        ValueKind::U128(u) => u64::try_from(*u)
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(u.to_string())),
        ValueKind::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        ValueKind::String(s) => Json::String(s.clone()),
        ValueKind::Table(map) => table_to_json(map),
        ValueKind::Array(items) => Json::Array(items.iter().map(value_to_json).collect()),
    }
}
