//! SQL rewriter (§4.6): parse every client statement, gate DDL kinds by
//! permission, and splice policy-agent-derived row filters into every
//! `SELECT`'s `WHERE` clause.
//!
//! The output is always the parser's own `Display`/`to_string()`
//! rendering of the (possibly modified) AST, never hand-assembled text —
//! this is what makes the pretty-printed output deterministic and
//! test-pinnable (§8).

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use sqlparser::ast::{
    BinaryOperator, Expr, Join, Query, Select, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{PolicyError, RewriteError};
use crate::policy::{DdlKind, PolicyAgent};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Classify a parsed statement into one of the three DDL permission
/// classes the policy agent understands, or `None` if it is a `SELECT`
/// (or anything else the rewriter leaves untouched).
fn classify_ddl(stmt: &Statement, raw_sql: &str) -> Option<DdlKind> {
    match stmt {
        Statement::CreateTable { .. } | Statement::CreateIndex { .. } | Statement::CreateView { .. } => {
            Some(DdlKind::Create)
        }
        Statement::Insert(_) | Statement::Update { .. } | Statement::AlterTable { .. } => {
            Some(DdlKind::Update)
        }
        Statement::Delete(_) | Statement::Drop { .. } => Some(DdlKind::Delete),
        Statement::Query(_) => None,
        _ => classify_ddl_keyword(raw_sql),
    }
}

/// Recognize DDL kinds with no dedicated `sqlparser` AST variant —
/// `STATS`/`CHANGEFEED` are CockroachDB-flavored extensions to the
/// Postgres dialect — by matching leading keywords ahead of full parsing.
/// Also backstops the handful of `CREATE`/`ALTER`/`DROP` targets
/// (`DATABASE`, `ROLE`, `SCHEMA`, `SEQUENCE`, `INDEX`) the AST match above
/// doesn't enumerate by name.
fn classify_ddl_keyword(sql: &str) -> Option<DdlKind> {
    let upper = sql.trim_start().to_uppercase();
    let starts = |kw: &str| upper.starts_with(kw);

    if starts("CREATE DATABASE")
        || starts("CREATE ROLE")
        || starts("CREATE SCHEMA")
        || starts("CREATE SEQUENCE")
        || starts("CREATE STATS")
        || starts("CREATE CHANGEFEED")
    {
        Some(DdlKind::Create)
    } else if starts("ALTER ROLE")
        || starts("ALTER SEQUENCE")
        || starts("ALTER CHANGEFEED")
        || starts("ALTER INDEX")
    {
        Some(DdlKind::Update)
    } else if starts("DROP TABLE")
        || starts("DROP INDEX")
        || starts("DROP DATABASE")
        || starts("DROP ROLE")
        || starts("DROP SEQUENCE")
        || starts("DROP VIEW")
        || starts("CANCEL CHANGEFEED")
    {
        Some(DdlKind::Delete)
    } else {
        None
    }
}

/// Unwrap a single `FROM`-list entry (and its joins) into flat
/// `(table_name, alias)` pairs, recursing through parenthesized joins.
fn flatten_table_factor(factor: &TableFactor, out: &mut Vec<(String, Option<String>)>) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            out.push((name.to_string(), alias.as_ref().map(|a| a.name.value.clone())));
        }
        TableFactor::NestedJoin { table_with_joins, alias } => {
            flatten_table_with_joins(table_with_joins, out);
            if let Some(alias) = alias {
                if let Some(last) = out.last_mut() {
                    last.1 = Some(alias.name.value.clone());
                }
            }
        }
        _ => {}
    }
}

fn flatten_joins(joins: &[Join], out: &mut Vec<(String, Option<String>)>) {
    for join in joins {
        flatten_table_factor(&join.relation, out);
    }
}

fn flatten_table_with_joins(twj: &TableWithJoins, out: &mut Vec<(String, Option<String>)>) {
    flatten_table_factor(&twj.relation, out);
    flatten_joins(&twj.joins, out);
}

/// Parses SQL, gates DDL, and splices policy-agent filters into SELECTs.
pub struct Rewriter {
    agent: Arc<dyn PolicyAgent>,
}

impl Rewriter {
    pub fn new(agent: Arc<dyn PolicyAgent>) -> Self {
        Self { agent }
    }

    /// Rewrite one (possibly `;`-separated) batch of SQL statements.
    /// On any policy denial or predicate-parse failure, aborts and
    /// returns the error; the caller is expected to keep using the
    /// original, unmodified SQL text in that case.
    pub async fn rewrite(&self, sql: &str, userinfo: &Value) -> Result<String, RewriteError> {
        let dialect = PostgreSqlDialect {};
        let mut statements =
            Parser::parse_sql(&dialect, sql).map_err(|e| RewriteError::Parse(e.to_string()))?;

        for stmt in statements.iter_mut() {
            if let Some(kind) = classify_ddl(stmt, sql) {
                let allowed = self
                    .agent
                    .ddl_allowed(kind, userinfo)
                    .await
                    .map_err(RewriteError::from)?;
                if !allowed {
                    return Err(RewriteError::Policy(PolicyError::DdlNotAllowed {
                        kind: kind.as_str().to_string(),
                    }));
                }
                continue;
            }

            if let Statement::Query(query) = stmt {
                let mut cte_aliases = HashSet::new();
                self.rewrite_query(query, &mut cte_aliases, userinfo).await?;
            }
        }

        Ok(statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; "))
    }

    fn rewrite_query<'b>(
        &'b self,
        query: &'b mut Query,
        cte_aliases: &'b mut HashSet<String>,
        userinfo: &'b Value,
    ) -> BoxFuture<'b, Result<(), RewriteError>> {
        Box::pin(async move {
            if let Some(with) = &query.with {
                for cte in &with.cte_tables {
                    cte_aliases.insert(cte.alias.name.value.clone());
                }
            }
            if let Some(with) = &mut query.with {
                for cte in &mut with.cte_tables {
                    let mut nested = cte_aliases.clone();
                    self.rewrite_query(&mut cte.query, &mut nested, userinfo).await?;
                }
            }
            self.rewrite_set_expr(&mut query.body, cte_aliases, userinfo).await
        })
    }

    fn rewrite_set_expr<'b>(
        &'b self,
        set_expr: &'b mut SetExpr,
        cte_aliases: &'b HashSet<String>,
        userinfo: &'b Value,
    ) -> BoxFuture<'b, Result<(), RewriteError>> {
        Box::pin(async move {
            match set_expr {
                SetExpr::Select(select) => self.rewrite_select(select, cte_aliases, userinfo).await,
                SetExpr::Query(nested) => {
                    let mut nested_aliases = cte_aliases.clone();
                    self.rewrite_query(nested, &mut nested_aliases, userinfo).await
                }
                SetExpr::SetOperation { left, right, .. } => {
                    self.rewrite_set_expr(left, cte_aliases, userinfo).await?;
                    self.rewrite_set_expr(right, cte_aliases, userinfo).await
                }
                _ => Ok(()),
            }
        })
    }

    async fn rewrite_select(
        &self,
        select: &mut Select,
        cte_aliases: &HashSet<String>,
        userinfo: &Value,
    ) -> Result<(), RewriteError> {
        let mut pairs = Vec::new();
        for twj in &select.from {
            flatten_table_with_joins(twj, &mut pairs);
        }

        for (name, alias) in pairs {
            let bare_name = name.rsplit('.').next().unwrap_or(&name);
            if cte_aliases.contains(&name) || cte_aliases.contains(bare_name) {
                continue;
            }

            let filters = self
                .agent
                .select_filters(&name, alias.as_deref(), userinfo)
                .await
                .map_err(RewriteError::from)?;

            if !filters.join_filters.is_empty() {
                return Err(RewriteError::Policy(PolicyError::JoinFiltersUnsupported));
            }
            if filters.where_filters.is_empty() {
                continue;
            }

            let joined_predicate = filters.where_filters.join(" AND ");
            let new_expr = parse_predicate(&name, &joined_predicate)?;

            select.selection = Some(match select.selection.take() {
                None => new_expr,
                Some(existing) => Expr::Nested(Box::new(Expr::BinaryOp {
                    left: Box::new(new_expr),
                    op: BinaryOperator::And,
                    right: Box::new(existing),
                })),
            });
        }

        Ok(())
    }
}

/// Recover a well-typed `WHERE` expression from a predicate string by
/// parsing it as a throwaway `SELECT * FROM <table> WHERE <predicate>`
/// and lifting the `selection` back out.
fn parse_predicate(table: &str, predicate: &str) -> Result<Expr, RewriteError> {
    let dialect = PostgreSqlDialect {};
    let probe_sql = format!("select * from {table} where {predicate}");
    let mut parsed =
        Parser::parse_sql(&dialect, &probe_sql).map_err(|e| RewriteError::Parse(e.to_string()))?;

    let stmt = parsed
        .pop()
        .ok_or_else(|| RewriteError::Parse("predicate probe produced no statement".to_string()))?;

    match stmt {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => select
                .selection
                .ok_or_else(|| RewriteError::Parse("predicate probe lost its WHERE clause".to_string())),
            _ => Err(RewriteError::Parse("predicate probe was not a SELECT".to_string())),
        },
        _ => Err(RewriteError::Parse("predicate probe was not a query".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SelectFilters;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// A policy agent driven entirely by a fixed table->filters map, for
    /// exercising the rewriter in isolation from any real agent transport.
    struct FakeAgent {
        filters: HashMap<String, SelectFilters>,
        ddl_allowed: Mutex<HashMap<DdlKind, bool>>,
    }

    impl FakeAgent {
        fn new() -> Self {
            Self {
                filters: HashMap::new(),
                ddl_allowed: Mutex::new(HashMap::new()),
            }
        }

        fn with_filter(mut self, table: &str, filters: SelectFilters) -> Self {
            self.filters.insert(table.to_string(), filters);
            self
        }

        fn with_ddl(self, kind: DdlKind, allowed: bool) -> Self {
            self.ddl_allowed.try_lock().unwrap().insert(kind, allowed);
            self
        }
    }

    #[async_trait]
    impl PolicyAgent for FakeAgent {
        async fn select_filters(
            &self,
            table: &str,
            _alias: Option<&str>,
            _userinfo: &Value,
        ) -> Result<SelectFilters, PolicyError> {
            Ok(self.filters.get(table).cloned().unwrap_or_default())
        }

        async fn ddl_allowed(&self, kind: DdlKind, _userinfo: &Value) -> Result<bool, PolicyError> {
            Ok(*self.ddl_allowed.lock().await.get(&kind).unwrap_or(&true))
        }
    }

    fn userinfo() -> Value {
        serde_json::json!({})
    }

    #[tokio::test]
    async fn simple_select_with_no_alias() {
        let agent = FakeAgent::new().with_filter(
            "pets",
            SelectFilters {
                where_filters: vec!["((pets.owners >= 23))".to_string()],
                join_filters: vec![],
            },
        );
        let rewriter = Rewriter::new(Arc::new(agent));
        let out = rewriter.rewrite("select * from pets", &userinfo()).await.unwrap();
        assert_eq!(out, "SELECT * FROM pets WHERE ((pets.owners >= 23))");
    }

    #[tokio::test]
    async fn select_with_alias() {
        let agent = FakeAgent::new().with_filter(
            "pets",
            SelectFilters {
                where_filters: vec!["((p.owners >= 23))".to_string()],
                join_filters: vec![],
            },
        );
        let rewriter = Rewriter::new(Arc::new(agent));
        let out = rewriter
            .rewrite("select * from pets p", &userinfo())
            .await
            .unwrap();
        assert_eq!(out, "SELECT * FROM pets AS p WHERE ((p.owners >= 23))");
    }

    #[tokio::test]
    async fn no_agent_configured_means_sql_is_unchanged() {
        let agent = FakeAgent::new();
        let rewriter = Rewriter::new(Arc::new(agent));
        let out = rewriter.rewrite("select * from pets", &userinfo()).await.unwrap();
        assert_eq!(out, "SELECT * FROM pets");
    }

    #[tokio::test]
    async fn disallowed_ddl_is_rejected_and_leaves_no_sql() {
        let agent = FakeAgent::new().with_ddl(DdlKind::Create, false);
        let rewriter = Rewriter::new(Arc::new(agent));
        let err = rewriter
            .rewrite("CREATE TABLE test(id INT8)", &userinfo())
            .await
            .unwrap_err();
        match err {
            RewriteError::Policy(PolicyError::DdlNotAllowed { kind }) => assert_eq!(kind, "create"),
            other => panic!("expected DdlNotAllowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn alter_index_is_gated_as_update_ddl() {
        let agent = FakeAgent::new().with_ddl(DdlKind::Update, false);
        let rewriter = Rewriter::new(Arc::new(agent));
        let err = rewriter
            .rewrite("ALTER INDEX pets_owner_idx RENAME TO pets_owner_id_idx", &userinfo())
            .await
            .unwrap_err();
        match err {
            RewriteError::Policy(PolicyError::DdlNotAllowed { kind }) => assert_eq!(kind, "update"),
            other => panic!("expected DdlNotAllowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_filters_are_an_explicit_unsupported_error() {
        let agent = FakeAgent::new().with_filter(
            "pets",
            SelectFilters {
                where_filters: vec![],
                join_filters: vec![crate::policy::JoinFilter {
                    table_name: "owners".to_string(),
                    conditions: "owners.id = pets.owner_id".to_string(),
                }],
            },
        );
        let rewriter = Rewriter::new(Arc::new(agent));
        let err = rewriter.rewrite("select * from pets", &userinfo()).await.unwrap_err();
        assert!(matches!(
            err,
            RewriteError::Policy(PolicyError::JoinFiltersUnsupported)
        ));
    }

    #[tokio::test]
    async fn cte_aliases_are_not_filtered() {
        let agent = FakeAgent::new().with_filter(
            "pets",
            SelectFilters {
                where_filters: vec!["((pets.owners >= 23))".to_string()],
                join_filters: vec![],
            },
        );
        let rewriter = Rewriter::new(Arc::new(agent));
        let out = rewriter
            .rewrite("with pets as (select 1) select * from pets", &userinfo())
            .await
            .unwrap();
        assert!(!out.contains("WHERE"));
    }
}
