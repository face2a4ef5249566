//! Builds `/orchestrations` requests from typed predicates.
//!
//! User-supplied values only ever reach the `$filter` expression as quoted
//! OData string literals, and column names must be plain identifiers, so a
//! filter value cannot change the shape of the expression.

use chrono::{DateTime, Utc};
use shared::domain::{FilterOperator, OrderDirection};
use thiserror::Error;
use url::form_urlencoded::byte_serialize;

use crate::time::to_iso_string;

/// Records requested per page.
pub const PAGE_SIZE: usize = 50;

pub const ORCHESTRATIONS_PATH: &str = "/orchestrations";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("invalid column name '{0}'")]
    InvalidColumn(String),
}

/// A column reference that is safe to splice into a `$filter` or `$orderby`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column(String);

impl Column {
    pub fn new(name: &str) -> Result<Self, QueryError> {
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if valid_start && valid_rest {
            Ok(Self(name.to_string()))
        } else {
            Err(QueryError::InvalidColumn(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Literal {
    fn render(&self) -> String {
        let raw = match self {
            Self::Text(text) => text.clone(),
            Self::Timestamp(value) => to_iso_string(*value),
        };
        format!("'{}'", raw.replace('\'', "''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ge,
    Le,
}

impl Comparison {
    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ge => "ge",
            Self::Le => "le",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare {
        column: Column,
        comparison: Comparison,
        value: Literal,
    },
    StartsWith {
        column: Column,
        value: Literal,
    },
    Contains {
        column: Column,
        value: Literal,
    },
}

impl Predicate {
    pub fn compare(column: Column, comparison: Comparison, value: Literal) -> Self {
        Self::Compare {
            column,
            comparison,
            value,
        }
    }

    /// Single-column text filter as selected in the UI.
    pub fn text_filter(column: Column, operator: FilterOperator, value: &str) -> Self {
        let value = Literal::Text(value.to_string());
        match operator {
            FilterOperator::Equals => Self::compare(column, Comparison::Eq, value),
            FilterOperator::StartsWith => Self::StartsWith { column, value },
            FilterOperator::Contains => Self::Contains { column, value },
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Compare {
                column,
                comparison,
                value,
            } => format!(
                "{} {} {}",
                column.as_str(),
                comparison.as_str(),
                value.render()
            ),
            Self::StartsWith { column, value } => {
                format!("startswith({}, {})", column.as_str(), value.render())
            }
            Self::Contains { column, value } => {
                format!("contains({}, {})", column.as_str(), value.render())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: Column,
    pub direction: OrderDirection,
}

/// One page request against `/orchestrations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationsQuery {
    pub top: usize,
    pub skip: usize,
    pub filter: Vec<Predicate>,
    pub order_by: Option<OrderBy>,
    pub hidden_columns: Vec<String>,
}

impl OrchestrationsQuery {
    /// A page of instances created between `from` and `till`, inclusive.
    pub fn created_between(from: DateTime<Utc>, till: DateTime<Utc>) -> Self {
        let created_time = Column("createdTime".to_string());
        Self {
            top: PAGE_SIZE,
            skip: 0,
            filter: vec![
                Predicate::compare(
                    created_time.clone(),
                    Comparison::Ge,
                    Literal::Timestamp(from),
                ),
                Predicate::compare(created_time, Comparison::Le, Literal::Timestamp(till)),
            ],
            order_by: None,
            hidden_columns: Vec::new(),
        }
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_entity_type(mut self, entity_type: Option<&str>) -> Self {
        if let Some(entity_type) = entity_type {
            self.filter.push(Predicate::compare(
                Column("entityType".to_string()),
                Comparison::Eq,
                Literal::Text(entity_type.to_string()),
            ));
        }
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.filter.push(predicate);
        self
    }

    pub fn with_order_by(mut self, column: Column, direction: OrderDirection) -> Self {
        self.order_by = Some(OrderBy { column, direction });
        self
    }

    pub fn with_hidden_columns(mut self, hidden_columns: &[String]) -> Self {
        self.hidden_columns = hidden_columns.to_vec();
        self
    }

    pub fn filter_expression(&self) -> String {
        self.filter
            .iter()
            .map(Predicate::render)
            .collect::<Vec<_>>()
            .join(" and ")
    }

    /// Request path including the encoded query string.
    pub fn to_path(&self) -> String {
        let mut path = format!(
            "{ORCHESTRATIONS_PATH}?$top={}&$skip={}",
            self.top, self.skip
        );

        if !self.filter.is_empty() {
            path.push_str("&$filter=");
            path.push_str(&encode(&self.filter_expression()));
        }

        if let Some(order_by) = &self.order_by {
            path.push_str("&$orderby=");
            path.push_str(&encode(&format!(
                "{} {}",
                order_by.column.as_str(),
                order_by.direction.as_str()
            )));
        }

        if !self.hidden_columns.is_empty() {
            path.push_str("&hidden-columns=");
            path.push_str(&encode(&self.hidden_columns.join("|")));
        }

        path
    }
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}
