//! Policy agent abstraction (§4.4, §4.5).
//!
//! A [`PolicyAgent`] decides two things for the rewriter: which row
//! filters apply to a `SELECT` against a given table (`select_filters`),
//! and whether a DDL statement kind is allowed at all (`ddl_allowed`).
//! Two implementations exist: [`opa::OpaAgent`] (backed by an Open Policy
//! Agent `/v1/compile` endpoint) and [`http_agent::HttpAgent`] (a simpler
//! bespoke HTTP contract). Both present the same `(whereFilters,
//! joinFilters)` shape to the rewriter regardless of how each computes it
//! internally — the OPA agent's `exists`-wrapping happens entirely inside
//! its own compiler and is handed back as a single opaque WHERE string.

pub mod http_agent;
pub mod opa;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PolicyError;

/// A cross-table join filter the rewriter cannot yet splice in (§4.6 Open
/// Question, resolved as a hard error wherever one is returned).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinFilter {
    pub table_name: String,
    pub conditions: String,
}

/// The row-filtering decision for one table reference in a `SELECT`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectFilters {
    pub where_filters: Vec<String>,
    pub join_filters: Vec<JoinFilter>,
}

impl SelectFilters {
    pub fn is_empty(&self) -> bool {
        self.where_filters.is_empty() && self.join_filters.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DdlKind {
    Create,
    Update,
    Delete,
}

impl DdlKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DdlKind::Create => "create",
            DdlKind::Update => "update",
            DdlKind::Delete => "delete",
        }
    }
}

#[async_trait]
pub trait PolicyAgent: Send + Sync {
    /// Compute the row filters that must be spliced into a SELECT
    /// against `table` (optionally aliased), for the given userinfo.
    async fn select_filters(
        &self,
        table: &str,
        alias: Option<&str>,
        userinfo: &Value,
    ) -> Result<SelectFilters, PolicyError>;

    /// Whether `kind` is allowed to run at all, for the given userinfo.
    async fn ddl_allowed(&self, kind: DdlKind, userinfo: &Value) -> Result<bool, PolicyError>;
}
