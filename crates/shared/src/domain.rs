use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of the orchestrations list as returned by the backend.
///
/// Only the columns the monitor filters or sorts on are typed. Everything else
/// the backend sends is kept in `extra` so that no column is lost on the way
/// to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRecord {
    pub instance_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub runtime_status: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub custom_status: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OrchestrationRecord {
    /// Looks a column up by its wire name, typed or not.
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "instanceId" => Value::String(self.instance_id.clone()),
            "name" => self.name.clone().map(Value::String)?,
            "entityType" => self.entity_type.clone().map(Value::String)?,
            "runtimeStatus" => self.runtime_status.clone().map(Value::String)?,
            "createdTime" => Value::String(self.created_time?.to_rfc3339()),
            "lastUpdatedTime" => Value::String(self.last_updated_time?.to_rfc3339()),
            "lastEvent" => self.last_event.clone().map(Value::String)?,
            "input" => self.input.clone(),
            "output" => self.output.clone(),
            "customStatus" => self.custom_status.clone(),
            other => self.extra.get(other)?.clone(),
        };
        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Which kind of instances the list shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityTypeFilter {
    #[default]
    #[serde(rename = "ShowBoth")]
    Both,
    OrchestrationsOnly,
    #[serde(rename = "DurableEntitiesOnly")]
    EntitiesOnly,
}

impl EntityTypeFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Both => "ShowBoth",
            Self::OrchestrationsOnly => "OrchestrationsOnly",
            Self::EntitiesOnly => "DurableEntitiesOnly",
        }
    }

    /// The `entityType` column value this filter selects, if any.
    pub fn entity_type(self) -> Option<&'static str> {
        match self {
            Self::Both => None,
            Self::OrchestrationsOnly => Some("Orchestration"),
            Self::EntitiesOnly => Some("DurableEntity"),
        }
    }
}

impl fmt::Display for EntityTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityTypeFilter {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ShowBoth" | "Both" => Ok(Self::Both),
            "OrchestrationsOnly" => Ok(Self::OrchestrationsOnly),
            "DurableEntitiesOnly" | "EntitiesOnly" => Ok(Self::EntitiesOnly),
            other => Err(UnknownVariant::new("entity type filter", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterOperator {
    #[default]
    Equals,
    StartsWith,
    Contains,
}

impl FilterOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "Equals",
            Self::StartsWith => "StartsWith",
            Self::Contains => "Contains",
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOperator {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Equals" => Ok(Self::Equals),
            "StartsWith" => Ok(Self::StartsWith),
            "Contains" => Ok(Self::Contains),
            other => Err(UnknownVariant::new("filter operator", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

impl OrderDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderDirection {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Ascending),
            "desc" => Ok(Self::Descending),
            other => Err(UnknownVariant::new("order direction", other)),
        }
    }
}

/// Connection details of a running backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendProperties {
    pub backend_url: String,
    pub account_name: String,
    pub hub_name: String,
}
