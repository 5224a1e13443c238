use serde::Deserialize;
use std::fmt;

/// Where the rows of a dataset come from at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum DatasetSource {
    Parquet {
        path: String,
    },
    Csv {
        path: String,
        #[serde(default = "default_has_header")]
        has_header: bool,
    },
}

fn default_has_header() -> bool {
    true
}

impl DatasetSource {
    pub fn path(&self) -> &str {
        match self {
            DatasetSource::Parquet { path } | DatasetSource::Csv { path, .. } => path,
        }
    }
}

impl fmt::Display for DatasetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetSource::Parquet { path } => write!(f, "parquet:{}", path),
            DatasetSource::Csv { path, .. } => write!(f, "csv:{}", path),
        }
    }
}

/// A named dataset as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetDef {
    pub name: String,
    #[serde(flatten)]
    pub source: DatasetSource,
}

impl DatasetDef {
    pub fn new(name: impl Into<String>, source: DatasetSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

/// Returns true if `name` can be used unquoted as a table name in SQL.
///
/// Dataset names end up verbatim in `SELECT * FROM <name>`, so only plain
/// identifiers are accepted.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
