//! Open Policy Agent `/v1/compile` compiler (§4.4).
//!
//! This is the hardest single piece of the rewriter pipeline: OPA's
//! partial-evaluation response is a tree of typed terms, not a ready-made
//! SQL fragment. [`compile_response`] walks that tree and produces either
//! an allow-everything/deny-everything verdict or a single SQL boolean
//! expression (already `exists`-wrapped when it reaches across tables).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::PolicyError;
use crate::policy::{DdlKind, PolicyAgent, SelectFilters};

/// A term decoded from an OPA partial-evaluation response.
#[derive(Debug, Clone, PartialEq)]
enum Term {
    Operator(String),
    Value(String),
    TableRef(String),
    UnknownMarker,
}

/// Result of compiling one `{result: {queries: [...]}}` response.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    AllowAll,
    DenyAll,
    Filter(String),
}

fn decode_term(
    term: &Value,
    escape: Option<char>,
    target_table: &str,
    alias: Option<&str>,
) -> Result<Term, PolicyError> {
    let obj = term
        .as_object()
        .ok_or_else(|| PolicyError::TermDecode("term is not a JSON object".to_string()))?;
    let type_ = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PolicyError::TermDecode("term has no 'type' field".to_string()))?;
    let value = obj
        .get("value")
        .ok_or_else(|| PolicyError::TermDecode("term has no 'value' field".to_string()))?;

    match type_ {
        "boolean" => {
            let b = value
                .as_bool()
                .ok_or_else(|| PolicyError::TermDecode("boolean term value is not a bool".to_string()))?;
            Ok(Term::Value(b.to_string()))
        }
        "number" => Ok(Term::Value(value.to_string())),
        "string" => {
            let s = value
                .as_str()
                .ok_or_else(|| PolicyError::TermDecode("string term value is not a string".to_string()))?;
            match escape {
                Some(c) => Ok(Term::Value(format!("{c}{s}{c}"))),
                None => Ok(Term::Value(s.to_string())),
            }
        }
        "var" => {
            let s = value
                .as_str()
                .ok_or_else(|| PolicyError::TermDecode("var term value is not a string".to_string()))?;
            match s {
                "eq" | "equal" => Ok(Term::Operator("=".to_string())),
                "neq" => Ok(Term::Operator("!=".to_string())),
                "lt" => Ok(Term::Operator("<".to_string())),
                "lte" => Ok(Term::Operator("<=".to_string())),
                "gt" => Ok(Term::Operator(">".to_string())),
                "gte" => Ok(Term::Operator(">=".to_string())),
                "data" => Ok(Term::UnknownMarker),
                other => Err(PolicyError::TermDecode(format!("unrecognized var term: {other}"))),
            }
        }
        "ref" => {
            let list = value
                .as_array()
                .ok_or_else(|| PolicyError::TermDecode("ref term value is not an array".to_string()))?;
            if list.is_empty() {
                return Err(PolicyError::TermDecode("ref term has no entries".to_string()));
            }
            let mut inner = Vec::with_capacity(list.len());
            for item in list {
                inner.push(decode_term(item, None, target_table, alias)?);
            }
            match &inner[0] {
                Term::Operator(op) => {
                    if inner.len() != 1 {
                        return Err(PolicyError::TermDecode(
                            "operator ref must contain exactly one entry".to_string(),
                        ));
                    }
                    Ok(Term::Operator(op.clone()))
                }
                Term::UnknownMarker => {
                    if inner.len() < 3 {
                        return Err(PolicyError::TermDecode(
                            "unknown-marker ref must contain at least 3 entries".to_string(),
                        ));
                    }
                    let second = match &inner[1] {
                        Term::Value(v) => v,
                        _ => {
                            return Err(PolicyError::TermDecode(
                                "second ref entry must be the literal 'tables'".to_string(),
                            ))
                        }
                    };
                    if second != "tables" {
                        return Err(PolicyError::TermDecode(format!(
                            "expected second ref entry 'tables', got '{second}'"
                        )));
                    }
                    let third = match &inner[2] {
                        Term::Value(v) => v.clone(),
                        _ => {
                            return Err(PolicyError::TermDecode(
                                "third ref entry must be the source table name".to_string(),
                            ))
                        }
                    };
                    let resolved_table = if third == target_table {
                        alias.unwrap_or(&third).to_string()
                    } else {
                        third
                    };
                    let mut columns = Vec::with_capacity(inner.len().saturating_sub(3));
                    for item in &inner[3..] {
                        match item {
                            Term::Value(v) => columns.push(v.clone()),
                            _ => {
                                return Err(PolicyError::TermDecode(
                                    "column path entries must be literal values".to_string(),
                                ))
                            }
                        }
                    }
                    Ok(Term::TableRef(format!("{resolved_table}.{}", columns.join("."))))
                }
                _ => Err(PolicyError::TermDecode(
                    "ref term must begin with an operator or the unknown marker".to_string(),
                )),
            }
        }
        other => Err(PolicyError::TermDecode(format!("unrecognized term type: {other}"))),
    }
}

/// Fill `positions[slot]`, or fail if it was already assigned.
fn place(positions: &mut [Option<String>; 3], slot: usize, text: String) -> Result<(), PolicyError> {
    if positions[slot].is_some() {
        return Err(PolicyError::QueryCompile(format!(
            "two terms assigned to position {slot}"
        )));
    }
    positions[slot] = Some(text);
    Ok(())
}

fn assign_positions(terms: [Term; 3]) -> Result<[String; 3], PolicyError> {
    let has_value = terms.iter().any(|t| matches!(t, Term::Value(_)));
    let mut positions: [Option<String>; 3] = [None, None, None];
    let mut table_refs_seen = 0usize;

    for term in terms {
        match term {
            Term::Operator(op) => place(&mut positions, 1, op)?,
            Term::Value(v) => place(&mut positions, 2, v)?,
            Term::TableRef(r) => {
                if has_value {
                    place(&mut positions, 0, r)?;
                } else if table_refs_seen == 0 {
                    place(&mut positions, 2, r)?;
                    table_refs_seen += 1;
                } else {
                    place(&mut positions, 0, r)?;
                    table_refs_seen += 1;
                }
            }
            Term::UnknownMarker => {
                return Err(PolicyError::QueryCompile(
                    "unknown-marker term cannot stand alone in a query".to_string(),
                ))
            }
        }
    }

    let [p0, p1, p2] = positions;
    Ok([
        p0.ok_or_else(|| PolicyError::QueryCompile("position 0 unfilled".to_string()))?,
        p1.ok_or_else(|| PolicyError::QueryCompile("position 1 unfilled".to_string()))?,
        p2.ok_or_else(|| PolicyError::QueryCompile("position 2 unfilled".to_string()))?,
    ])
}

/// Compile one three-term query into (sql-fragment, foreign-tables-referenced).
fn compile_query(
    terms_json: &[Value],
    negated: bool,
    escape: char,
    target_table: &str,
    alias: Option<&str>,
) -> Result<(String, Vec<String>), PolicyError> {
    if terms_json.len() != 3 {
        return Err(PolicyError::QueryCompile(format!(
            "expected exactly 3 terms, got {}",
            terms_json.len()
        )));
    }

    let mut decoded: Vec<Term> = Vec::with_capacity(3);
    let mut extra_tables: Vec<String> = Vec::new();
    for t in terms_json {
        let term = decode_term(t, Some(escape), target_table, alias)?;
        if let Term::TableRef(r) = &term {
            if let Some(table_part) = r.split('.').next() {
                let is_local = table_part == target_table || Some(table_part) == alias;
                if !is_local && !extra_tables.iter().any(|t| t == table_part) {
                    extra_tables.push(table_part.to_string());
                }
            }
        }
        decoded.push(term);
    }

    let positions = assign_positions([decoded[0].clone(), decoded[1].clone(), decoded[2].clone()])?;
    let joined = format!("{} {} {}", positions[0], positions[1], positions[2]);
    let compiled = if negated { format!("NOT ({joined})") } else { joined };
    Ok((compiled, extra_tables))
}

/// Compile one inner list (conjunction of queries) into a single SQL
/// fragment, `exists`-wrapping it when it references foreign tables.
fn compile_conjunction(
    queries: &[Value],
    escape: char,
    target_table: &str,
    alias: Option<&str>,
) -> Result<String, PolicyError> {
    let mut wrapped = Vec::with_capacity(queries.len());
    let mut extra_tables: Vec<String> = Vec::new();

    for query in queries {
        let obj = query
            .as_object()
            .ok_or_else(|| PolicyError::QueryCompile("query entry is not a JSON object".to_string()))?;
        let negated = obj.get("negated").and_then(|v| v.as_bool()).unwrap_or(false);
        let terms = obj
            .get("terms")
            .and_then(|v| v.as_array())
            .ok_or_else(|| PolicyError::QueryCompile("query entry has no 'terms' array".to_string()))?;

        let (compiled, tables) = compile_query(terms, negated, escape, target_table, alias)?;
        wrapped.push(format!("({compiled})"));
        for t in tables {
            if !extra_tables.iter().any(|e| e == &t) {
                extra_tables.push(t);
            }
        }
    }

    let group_inner = format!("({})", wrapped.join(" AND "));
    if extra_tables.is_empty() {
        Ok(group_inner)
    } else {
        Ok(format!(
            "(exists (select 1 from {} where {}))",
            extra_tables.join(", "),
            group_inner
        ))
    }
}

/// Compile a full `{result: {queries: [...]}}` response body.
pub fn compile_response(
    queries: &[Value],
    escape: char,
    target_table: &str,
    alias: Option<&str>,
) -> Result<CompileOutcome, PolicyError> {
    if queries.is_empty() {
        return Ok(CompileOutcome::DenyAll);
    }

    let mut groups = Vec::with_capacity(queries.len());
    for group in queries {
        let arr = group
            .as_array()
            .ok_or_else(|| PolicyError::QueryCompile("conjunction entry is not an array".to_string()))?;
        if arr.is_empty() {
            return Ok(CompileOutcome::AllowAll);
        }
        groups.push(compile_conjunction(arr, escape, target_table, alias)?);
    }

    Ok(CompileOutcome::Filter(groups.join(" OR ")))
}

fn render_select_template(template: &str, table_name: &str) -> String {
    template.replace("{{.TableName}}", table_name)
}

#[derive(Debug, Serialize)]
struct CompileRequest<'a> {
    query: &'a str,
    unknowns: [&'a str; 1],
    input: CompileInput<'a>,
}

#[derive(Debug, Serialize)]
struct CompileInput<'a> {
    userinfo: &'a Value,
}

#[derive(Debug, Deserialize, Default)]
struct CompileResponseBody {
    result: Option<CompileResult>,
}

#[derive(Debug, Deserialize, Default)]
struct CompileResult {
    #[serde(default)]
    queries: Vec<Value>,
}

/// Policy agent backed by an OPA `/v1/compile` endpoint (§4.4).
pub struct OpaAgent {
    http: reqwest::Client,
    base_url: String,
    select_template: String,
    create_query: String,
    update_query: String,
    delete_query: String,
    escape_char: char,
    create_allowed: RwLock<Option<bool>>,
    update_allowed: RwLock<Option<bool>>,
    delete_allowed: RwLock<Option<bool>>,
}

impl OpaAgent {
    pub fn new(
        base_url: String,
        select_template: String,
        create_query: String,
        update_query: String,
        delete_query: String,
        escape_char: char,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            select_template,
            create_query,
            update_query,
            delete_query,
            escape_char,
            create_allowed: RwLock::new(None),
            update_allowed: RwLock::new(None),
            delete_allowed: RwLock::new(None),
        }
    }

    async fn compile(&self, query: &str, userinfo: &Value) -> Result<CompileOutcome, PolicyError> {
        self.compile_for_table(query, userinfo, "", None).await
    }

    async fn compile_for_table(
        &self,
        query: &str,
        userinfo: &Value,
        target_table: &str,
        alias: Option<&str>,
    ) -> Result<CompileOutcome, PolicyError> {
        let request = CompileRequest {
            query,
            unknowns: ["data.tables"],
            input: CompileInput { userinfo },
        };

        let url = format!("{}/v1/compile", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::UnexpectedOpaStatus(status.as_u16()));
        }

        let body: CompileResponseBody = response
            .json()
            .await
            .map_err(|e| PolicyError::TermDecode(e.to_string()))?;
        let queries = body.result.unwrap_or_default().queries;
        compile_response(&queries, self.escape_char, target_table, alias)
    }

    async fn cached_ddl_flag(
        &self,
        cache: &RwLock<Option<bool>>,
        query: &str,
        userinfo: &Value,
    ) -> Result<bool, PolicyError> {
        if let Some(v) = *cache.read().await {
            return Ok(v);
        }
        let outcome = self.compile(query, userinfo).await?;
        let allowed = matches!(outcome, CompileOutcome::AllowAll);
        *cache.write().await = Some(allowed);
        Ok(allowed)
    }
}

#[async_trait::async_trait]
impl PolicyAgent for OpaAgent {
    async fn select_filters(
        &self,
        table: &str,
        alias: Option<&str>,
        userinfo: &Value,
    ) -> Result<SelectFilters, PolicyError> {
        let query = render_select_template(&self.select_template, table);
        match self.compile_for_table(&query, userinfo, table, alias).await? {
            CompileOutcome::DenyAll => Err(PolicyError::PermissionDenied(table.to_string())),
            CompileOutcome::AllowAll => Ok(SelectFilters::default()),
            CompileOutcome::Filter(sql) => Ok(SelectFilters {
                where_filters: vec![sql],
                join_filters: vec![],
            }),
        }
    }

    async fn ddl_allowed(&self, kind: DdlKind, userinfo: &Value) -> Result<bool, PolicyError> {
        match kind {
            DdlKind::Create => {
                self.cached_ddl_flag(&self.create_allowed, &self.create_query.clone(), userinfo)
                    .await
            }
            DdlKind::Update => {
                self.cached_ddl_flag(&self.update_allowed, &self.update_query.clone(), userinfo)
                    .await
            }
            DdlKind::Delete => {
                self.cached_ddl_flag(&self.delete_allowed, &self.delete_query.clone(), userinfo)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value_term(type_: &str, value: Value) -> Value {
        json!({"type": type_, "value": value})
    }

    fn var_term(name: &str) -> Value {
        value_term("var", json!(name))
    }

    fn ref_term(table: &str, columns: &[&str]) -> Value {
        let mut entries = vec![var_term("data"), value_term("string", json!("tables")), value_term("string", json!(table))];
        for c in columns {
            entries.push(value_term("string", json!(*c)));
        }
        value_term("ref", json!(entries))
    }

    #[test]
    fn simple_select_with_no_alias() {
        let query = json!({
            "negated": false,
            "terms": [ref_term("pets", &["owners"]), var_term("gte"), value_term("number", json!(23))]
        });
        let outcome = compile_response(&[json!([query])], '\'', "pets", None).unwrap();
        assert_eq!(
            outcome,
            CompileOutcome::Filter("((pets.owners >= 23))".to_string())
        );
    }

    #[test]
    fn select_with_alias_substitutes_alias() {
        let query = json!({
            "negated": false,
            "terms": [ref_term("pets", &["owners"]), var_term("gte"), value_term("number", json!(23))]
        });
        let outcome = compile_response(&[json!([query])], '\'', "pets", Some("p")).unwrap();
        assert_eq!(
            outcome,
            CompileOutcome::Filter("((p.owners >= 23))".to_string())
        );
    }

    #[test]
    fn multi_table_reference_needs_exists_wrap() {
        let query = json!({
            "negated": false,
            "terms": [
                ref_term("secondtablename", &["id"]),
                var_term("eq"),
                ref_term("tablename", &["id"]),
            ]
        });
        let outcome = compile_response(&[json!([query])], '\'', "othertable", Some("o")).unwrap();
        assert_eq!(
            outcome,
            CompileOutcome::Filter(
                "(exists (select 1 from secondtablename, tablename where ((tablename.id = secondtablename.id))))".to_string()
            )
        );
    }

    #[test]
    fn compound_disjunction_with_not() {
        let q1 = json!({
            "negated": false,
            "terms": [ref_term("tablename", &["columnname1"]), var_term("eq"), value_term("string", json!("val1"))]
        });
        let q2 = json!({
            "negated": true,
            "terms": [ref_term("tablename", &["columnname2"]), var_term("eq"), value_term("string", json!("val2"))]
        });
        let q3 = json!({
            "negated": false,
            "terms": [ref_term("tablename", &["columnname3"]), var_term("gte"), value_term("number", json!(12))]
        });
        let outcome = compile_response(&[json!([q1, q2]), json!([q3])], '\'', "tablename", Some("t")).unwrap();
        assert_eq!(
            outcome,
            CompileOutcome::Filter(
                "((t.columnname1 = 'val1') AND (NOT (t.columnname2 = 'val2'))) OR ((t.columnname3 >= 12))".to_string()
            )
        );
    }

    #[test]
    fn empty_outer_list_denies_everything() {
        let outcome = compile_response(&[], '\'', "pets", None).unwrap();
        assert_eq!(outcome, CompileOutcome::DenyAll);
    }

    #[test]
    fn empty_inner_list_allows_everything() {
        let outcome = compile_response(&[json!([])], '\'', "pets", None).unwrap();
        assert_eq!(outcome, CompileOutcome::AllowAll);
    }

    #[test]
    fn position_collision_is_a_compile_error() {
        let query = json!({
            "negated": false,
            "terms": [var_term("eq"), var_term("gte"), value_term("number", json!(1))]
        });
        let err = compile_response(&[json!([query])], '\'', "pets", None).unwrap_err();
        assert!(matches!(err, PolicyError::QueryCompile(_)));
    }

    #[test]
    fn unrecognized_var_is_a_decode_error() {
        let query = json!({
            "negated": false,
            "terms": [ref_term("pets", &["owners"]), var_term("nonsense"), value_term("number", json!(1))]
        });
        let err = compile_response(&[json!([query])], '\'', "pets", None).unwrap_err();
        assert!(matches!(err, PolicyError::TermDecode(_)));
    }

    #[test]
    fn render_select_template_substitutes_table_name() {
        let rendered = render_select_template("data.tables.allow with input.table as {{.TableName}}", "pets");
        assert_eq!(rendered, "data.tables.allow with input.table as pets");
    }
}
