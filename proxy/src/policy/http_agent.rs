//! Bespoke HTTP policy agent (§4.5): a simpler alternative to the OPA
//! compiler, with the agent doing its own filter compilation server-side
//! and handing the proxy a ready-made `{allowed, filters}` shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyError;
use crate::policy::{DdlKind, JoinFilter, PolicyAgent, SelectFilters};

#[derive(Debug, Serialize)]
struct DdlRequest<'a> {
    #[serde(rename = "userInfo")]
    user_info: &'a Value,
    operation: &'a str,
}

#[derive(Debug, Deserialize)]
struct DdlResponse {
    allowed: bool,
}

#[derive(Debug, Serialize)]
struct SelectRequest<'a> {
    #[serde(rename = "userInfo")]
    user_info: &'a Value,
    #[serde(rename = "tableName")]
    table_name: &'a str,
    #[serde(rename = "tableAlias")]
    table_alias: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SelectResponse {
    allowed: bool,
    #[serde(default)]
    filters: Option<SelectResponseFilters>,
}

#[derive(Debug, Deserialize, Default)]
struct SelectResponseFilters {
    #[serde(default, rename = "whereFilters")]
    where_filters: Vec<String>,
    #[serde(default, rename = "joinFilters")]
    join_filters: Vec<SelectResponseJoinFilter>,
}

#[derive(Debug, Deserialize)]
struct SelectResponseJoinFilter {
    #[serde(rename = "tableName")]
    table_name: String,
    conditions: String,
}

pub struct HttpAgent {
    http: reqwest::Client,
    ddl_endpoint: String,
    select_endpoint: String,
}

impl HttpAgent {
    pub fn new(ddl_endpoint: String, select_endpoint: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            ddl_endpoint,
            select_endpoint,
        }
    }
}

#[async_trait::async_trait]
impl PolicyAgent for HttpAgent {
    async fn select_filters(
        &self,
        table: &str,
        alias: Option<&str>,
        userinfo: &Value,
    ) -> Result<SelectFilters, PolicyError> {
        let request = SelectRequest {
            user_info: userinfo,
            table_name: table,
            table_alias: alias,
        };
        let response = self
            .http
            .post(&self.select_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::UnexpectedHttpStatus(status.as_u16()));
        }

        let body: SelectResponse = response
            .json()
            .await
            .map_err(|e| PolicyError::TermDecode(e.to_string()))?;

        if !body.allowed {
            return Err(PolicyError::PermissionDenied(table.to_string()));
        }

        let filters = body.filters.unwrap_or_default();
        Ok(SelectFilters {
            where_filters: filters.where_filters,
            join_filters: filters
                .join_filters
                .into_iter()
                .map(|f| JoinFilter {
                    table_name: f.table_name,
                    conditions: f.conditions,
                })
                .collect(),
        })
    }

    async fn ddl_allowed(&self, kind: DdlKind, userinfo: &Value) -> Result<bool, PolicyError> {
        let request = DdlRequest {
            user_info: userinfo,
            operation: kind.as_str(),
        };
        let response = self
            .http
            .post(&self.ddl_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::UnexpectedHttpStatus(status.as_u16()));
        }

        let body: DdlResponse = response
            .json()
            .await
            .map_err(|e| PolicyError::TermDecode(e.to_string()))?;
        Ok(body.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_response_filters_default_to_empty_when_missing() {
        let raw = r#"{"allowed": true}"#;
        let parsed: SelectResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.allowed);
        assert!(parsed.filters.is_none());
    }

    #[test]
    fn select_response_parses_join_filters() {
        let raw = r#"{
            "allowed": true,
            "filters": {
                "whereFilters": ["a = 1"],
                "joinFilters": [{"tableName": "other", "conditions": "other.id = t.id"}]
            }
        }"#;
        let parsed: SelectResponse = serde_json::from_str(raw).unwrap();
        let filters = parsed.filters.unwrap();
        assert_eq!(filters.where_filters, vec!["a = 1".to_string()]);
        assert_eq!(filters.join_filters.len(), 1);
        assert_eq!(filters.join_filters[0].table_name, "other");
    }
}
