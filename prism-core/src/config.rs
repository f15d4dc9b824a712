//! Configuration loading (YAML work-package definitions).

use std::fmt;
use std::path::Path;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::Deserialize;

use crate::error::{PrismError, Result};

/// A scalar filter value as it appears in YAML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(v) => write!(f, "{}", v),
        }
    }
}

impl ToSql for Scalar {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Scalar::Int(v) => Ok(ToSqlOutput::Owned(Value::Integer(*v))),
            Scalar::Float(v) => Ok(ToSqlOutput::Owned(Value::Real(*v))),
            Scalar::Text(v) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes()))),
        }
    }
}

/// The per-package filter argument: a single scalar, a list of scalars,
/// or (under the geometry method) a WKT string carried as a text scalar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

/// How rows of a table are matched against a package's filter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FilterMethod {
    #[serde(rename = "filter-column")]
    Column,
    #[serde(rename = "filter-geometry")]
    Geometry,
}

impl fmt::Display for FilterMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMethod::Column => write!(f, "filter-column"),
            FilterMethod::Geometry => write!(f, "filter-geometry"),
        }
    }
}

/// A single work package: the filename stem, the filter argument, and the
/// hosting project reference used only by external publishers.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkPackage {
    pub name: String,
    pub value: FilterValue,
    #[serde(rename = "mergin-project")]
    pub project: String,
}

/// How a single table is filtered into work packages.
#[derive(Debug, Clone, Deserialize)]
pub struct TableFilter {
    pub name: String,
    pub method: FilterMethod,
    #[serde(rename = "filter-column-name")]
    pub filter_column: Option<String>,
}

/// Full configuration of the split/merge run.
#[derive(Debug, Clone, Deserialize)]
pub struct PrismConfig {
    /// Relative path of the master container within the hosting project.
    #[serde(rename = "file")]
    pub master_file: String,
    #[serde(rename = "work-packages")]
    pub work_packages: Vec<WorkPackage>,
    pub tables: Vec<TableFilter>,
}

impl PrismConfig {
    /// Load and validate a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PrismError::ConfigError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    /// Parse and validate a configuration from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: PrismConfig = serde_yaml::from_str(content)
            .map_err(|e| PrismError::ConfigError(format!("Failed to parse config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for wp in &self.work_packages {
            if wp.name.is_empty() {
                return Err(PrismError::ConfigError(
                    "Work package with empty name".to_string(),
                ));
            }
            if wp.name == "master" {
                return Err(PrismError::ConfigError(
                    "'master' is reserved and cannot be used as a work package name".to_string(),
                ));
            }
            if !seen.insert(wp.name.as_str()) {
                return Err(PrismError::ConfigError(format!(
                    "Duplicate work package name '{}'",
                    wp.name
                )));
            }
            if let FilterValue::List(values) = &wp.value {
                if values.is_empty() {
                    return Err(PrismError::ConfigError(format!(
                        "Work package '{}' has an empty value list",
                        wp.name
                    )));
                }
            }
        }

        for table in &self.tables {
            match (table.method, &table.filter_column) {
                (FilterMethod::Column, None) => {
                    return Err(PrismError::ConfigError(format!(
                        "Table '{}' uses filter-column but has no filter-column-name",
                        table.name
                    )));
                }
                (FilterMethod::Geometry, Some(_)) => {
                    return Err(PrismError::ConfigError(format!(
                        "Table '{}' uses filter-geometry and must not set filter-column-name",
                        table.name
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
file: survey.gpkg
work-packages:
  - name: Team_A
    value: A
    mergin-project: company/survey-team-a
  - name: Team_B
    value: [B, 7]
    mergin-project: company/survey-team-b
tables:
  - name: sites
    method: filter-column
    filter-column-name: survey_team
  - name: zones
    method: filter-geometry
"#;

    #[test]
    fn test_parse_basic() {
        let config = PrismConfig::from_str(BASIC).unwrap();
        assert_eq!(config.master_file, "survey.gpkg");
        assert_eq!(config.work_packages.len(), 2);
        assert_eq!(config.work_packages[0].name, "Team_A");
        assert_eq!(
            config.work_packages[0].value,
            FilterValue::Scalar(Scalar::Text("A".to_string()))
        );
        assert_eq!(config.work_packages[0].project, "company/survey-team-a");
        assert_eq!(
            config.work_packages[1].value,
            FilterValue::List(vec![Scalar::Text("B".to_string()), Scalar::Int(7)])
        );
        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.tables[0].method, FilterMethod::Column);
        assert_eq!(config.tables[0].filter_column.as_deref(), Some("survey_team"));
        assert_eq!(config.tables[1].method, FilterMethod::Geometry);
        assert!(config.tables[1].filter_column.is_none());
    }

    #[test]
    fn test_parse_numeric_values() {
        let yaml = r#"
file: data.gpkg
work-packages:
  - name: North
    value: 4
    mergin-project: org/north
  - name: South
    value: 2.5
    mergin-project: org/south
tables:
  - name: plots
    method: filter-column
    filter-column-name: region_id
"#;
        let config = PrismConfig::from_str(yaml).unwrap();
        assert_eq!(
            config.work_packages[0].value,
            FilterValue::Scalar(Scalar::Int(4))
        );
        assert_eq!(
            config.work_packages[1].value,
            FilterValue::Scalar(Scalar::Float(2.5))
        );
    }

    #[test]
    fn test_missing_required_key() {
        let yaml = r#"
file: data.gpkg
tables: []
"#;
        assert!(matches!(
            PrismConfig::from_str(yaml),
            Err(PrismError::ConfigError(_))
        ));
    }

    #[test]
    fn test_filter_column_requires_column_name() {
        let yaml = r#"
file: data.gpkg
work-packages: []
tables:
  - name: plots
    method: filter-column
"#;
        let err = PrismConfig::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("filter-column-name"));
    }

    #[test]
    fn test_filter_geometry_rejects_column_name() {
        let yaml = r#"
file: data.gpkg
work-packages: []
tables:
  - name: plots
    method: filter-geometry
    filter-column-name: owner
"#;
        assert!(PrismConfig::from_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let yaml = r#"
file: data.gpkg
work-packages: []
tables:
  - name: plots
    method: filter-rows
"#;
        assert!(PrismConfig::from_str(yaml).is_err());
    }

    #[test]
    fn test_duplicate_package_name_rejected() {
        let yaml = r#"
file: data.gpkg
work-packages:
  - name: North
    value: 1
    mergin-project: org/a
  - name: North
    value: 2
    mergin-project: org/b
tables: []
"#;
        let err = PrismConfig::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_master_name_reserved() {
        let yaml = r#"
file: data.gpkg
work-packages:
  - name: master
    value: 1
    mergin-project: org/a
tables: []
"#;
        assert!(PrismConfig::from_str(yaml).is_err());
    }
}
