// crates/store/src/render.rs
//! Renders the closed pipeline algebra to SQL and decodes result rows.
//!
//! A facet pipeline becomes one SELECT per arm over a shared base CTE: the
//! base stages (match / sort / limit, optionally the fact join) filter and
//! budget the input rows, each arm then applies its own predicate, record
//! limit and grouping accumulators. Aggregates without GROUP BY always
//! yield exactly one row, which is the arm's group document.

use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, TypeInfo, ValueRef};

use tally_core::pipeline::{Accumulator, Collection, Expr, ProjectPick, Stage};
use tally_core::predicate::{CmpOp, Predicate};
use tally_core::value::{format_timestamp, Value};

use crate::{Store, StoreError, StoreResult};

/// A positional bind argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

/// One output column of an arm query.
#[derive(Debug, Clone)]
pub struct ArmColumn {
    pub name: String,
    /// Column holds a JSON-encoded distinct set.
    pub set: bool,
}

/// One renderable facet arm.
#[derive(Debug, Clone)]
pub struct RenderedArm {
    pub name: String,
    pub sql: String,
    pub args: Vec<SqlArg>,
    pub columns: Vec<ArmColumn>,
}

struct RenderCtx {
    collection: Collection,
    joined: bool,
}

impl RenderCtx {
    /// Logical field path → SQL expression over the normalized base row.
    /// Returns the expression and whether it is an epoch-ms time column.
    fn column(&self, field: &str) -> (String, bool) {
        let field = field.strip_prefix("data.").unwrap_or(field);
        match (self.collection, field) {
            (Collection::Facts, "id") => ("id".into(), false),
            (Collection::Facts, "type") => ("\"type\"".into(), false),
            (Collection::Facts, "createdAt") => ("created_at".into(), true),
            (Collection::IndexEntries, "hash") => ("hash".into(), false),
            (Collection::IndexEntries, "id" | "factId") => ("fact_id".into(), false),
            (Collection::IndexEntries, "factTime") => ("fact_time".into(), true),
            (Collection::IndexEntries, "createdAt") => ("created_at".into(), true),
            (Collection::IndexEntries, "indexType") => ("index_type".into(), false),
            (Collection::IndexEntries, "indexEncoding") => ("index_encoding".into(), false),
            (Collection::IndexEntries, "fieldValue") => ("field_value".into(), false),
            (Collection::IndexEntries, "type") if self.joined => ("\"type\"".into(), false),
            _ => (format!("json_extract(data, '$.{field}')"), false),
        }
    }
}

/// Encode a bind value. Time values become epoch-ms integers against the
/// meta time columns and RFC-3339 text everywhere else (the shape the JSON
/// payload stores them in).
fn encode_value(value: &Value, time_column: bool) -> SqlArg {
    match value {
        Value::Null => SqlArg::Null,
        Value::Bool(b) => SqlArg::Int(i64::from(*b)),
        Value::Int(i) => SqlArg::Int(*i),
        Value::Float(f) => SqlArg::Float(*f),
        Value::Text(s) => SqlArg::Text(s.clone()),
        Value::Time(t) => {
            if time_column {
                SqlArg::Int(t.timestamp_millis())
            } else {
                SqlArg::Text(format_timestamp(t))
            }
        }
        // Unsubstituted placeholders were already warned about by the
        // planner; they hit storage in their literal text form.
        Value::Placeholder(name) => SqlArg::Text(format!("$${name}")),
        Value::Array(_) | Value::Object(_) => SqlArg::Text(value.to_json().to_string()),
    }
}

fn render_predicate(
    predicate: &Predicate,
    ctx: &RenderCtx,
    sql: &mut String,
    args: &mut Vec<SqlArg>,
) -> StoreResult<()> {
    match predicate {
        Predicate::All => sql.push_str("1=1"),
        Predicate::And(parts) | Predicate::Or(parts) => {
            if parts.is_empty() {
                sql.push_str("1=1");
                return Ok(());
            }
            let sep = if matches!(predicate, Predicate::And(_)) {
                " AND "
            } else {
                " OR "
            };
            sql.push('(');
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    sql.push_str(sep);
                }
                render_predicate(part, ctx, sql, args)?;
            }
            sql.push(')');
        }
        Predicate::Cmp { field, op, value } => {
            let (col, time_column) = ctx.column(field);
            match (op, value) {
                (CmpOp::Eq, Value::Null) => sql.push_str(&format!("{col} IS NULL")),
                (CmpOp::Ne, Value::Null) => sql.push_str(&format!("{col} IS NOT NULL")),
                (CmpOp::Ne, v) => {
                    // Missing fields satisfy "not equal", as in the
                    // backend's match semantics.
                    sql.push_str(&format!("({col} <> ? OR {col} IS NULL)"));
                    args.push(encode_value(v, time_column));
                }
                (op, v) => {
                    let op_sql = match op {
                        CmpOp::Eq => "=",
                        CmpOp::Gt => ">",
                        CmpOp::Gte => ">=",
                        CmpOp::Lt => "<",
                        CmpOp::Lte => "<=",
                        CmpOp::Ne => unreachable!("handled above"),
                    };
                    sql.push_str(&format!("{col} {op_sql} ?"));
                    args.push(encode_value(v, time_column));
                }
            }
        }
        Predicate::In {
            field,
            values,
            negated,
        } => {
            let (col, time_column) = ctx.column(field);
            if values.is_empty() {
                sql.push_str(if *negated { "1=1" } else { "0=1" });
                return Ok(());
            }
            let marks = vec!["?"; values.len()].join(", ");
            if *negated {
                sql.push_str(&format!("({col} NOT IN ({marks}) OR {col} IS NULL)"));
            } else {
                sql.push_str(&format!("{col} IN ({marks})"));
            }
            for v in values {
                args.push(encode_value(v, time_column));
            }
        }
        Predicate::Exists { field, exists } => {
            let (col, _) = ctx.column(field);
            sql.push_str(&format!(
                "{col} IS {} NULL",
                if *exists { "NOT" } else { "" }
            ));
        }
    }
    Ok(())
}

fn expr_sql(expr: &Expr, ctx: &RenderCtx, args: &mut Vec<SqlArg>) -> String {
    match expr {
        Expr::Field(path) => ctx.column(path).0,
        Expr::Const(v) => {
            args.push(encode_value(v, false));
            "?".into()
        }
    }
}

/// Render a facet pipeline into one SQL statement per arm.
pub fn render_pipeline(collection: Collection, stages: &[Stage]) -> StoreResult<Vec<RenderedArm>> {
    let mut base_match: Vec<Predicate> = Vec::new();
    let mut base_sort: Option<(String, bool)> = None;
    let mut base_limit: Option<u32> = None;
    let mut joined = false;
    let mut facet: Option<&BTreeMap<String, Vec<Stage>>> = None;

    for stage in stages {
        if facet.is_some() {
            return Err(StoreError::Render(
                "facet must be the final stage".into(),
            ));
        }
        match stage {
            Stage::Match(p) => base_match.push(p.clone()),
            Stage::Sort { field, descending } => base_sort = Some((field.clone(), *descending)),
            Stage::Limit(n) => base_limit = Some(*n),
            Stage::LookupFacts => {
                if collection != Collection::IndexEntries {
                    return Err(StoreError::Render(
                        "fact lookup requires the index collection".into(),
                    ));
                }
                joined = true;
            }
            Stage::Unwind => {
                if !joined {
                    return Err(StoreError::Render("unwind without a preceding lookup".into()));
                }
            }
            Stage::Facet(arms) => facet = Some(arms),
            Stage::Group { .. } | Stage::Project { .. } => {
                return Err(StoreError::Render(
                    "group outside a facet arm is not supported".into(),
                ));
            }
        }
    }
    let Some(arms) = facet else {
        return Err(StoreError::Render("pipeline has no facet stage".into()));
    };

    let ctx = RenderCtx { collection, joined };
    let base_select = match (collection, joined) {
        (Collection::Facts, _) => "SELECT id, \"type\", created_at, data FROM facts".to_string(),
        (Collection::IndexEntries, false) => {
            "SELECT hash, fact_id, fact_time, created_at, index_type, index_encoding, \
             field_value, data FROM index_entries"
                .to_string()
        }
        (Collection::IndexEntries, true) => {
            "SELECT e.hash, e.fact_id, e.fact_time, e.created_at, e.index_type, \
             e.index_encoding, e.field_value, f.\"type\" AS \"type\", f.data AS data \
             FROM index_entries e JOIN facts f ON f.id = e.fact_id"
                .to_string()
        }
    };

    // Shared base: WITH base AS (...), filtered AS (SELECT * FROM base ...)
    let mut rendered = Vec::with_capacity(arms.len());
    for (arm_name, arm_stages) in arms {
        let mut args: Vec<SqlArg> = Vec::new();
        let mut sql = format!("WITH base AS ({base_select}), filtered AS (SELECT * FROM base");
        if !base_match.is_empty() {
            sql.push_str(" WHERE ");
            render_predicate(&Predicate::and(base_match.clone()), &ctx, &mut sql, &mut args)?;
        }
        if let Some((field, descending)) = &base_sort {
            let (col, _) = ctx.column(field);
            sql.push_str(&format!(
                " ORDER BY {col} {}",
                if *descending { "DESC" } else { "ASC" }
            ));
        }
        if let Some(n) = base_limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlArg::Int(n as i64));
        }
        sql.push(')');

        let arm = render_arm(arm_name, arm_stages, &ctx, sql, args)?;
        rendered.push(arm);
    }
    Ok(rendered)
}

fn render_arm(
    name: &str,
    stages: &[Stage],
    ctx: &RenderCtx,
    mut sql: String,
    mut args: Vec<SqlArg>,
) -> StoreResult<RenderedArm> {
    let mut arm_match: Vec<Predicate> = Vec::new();
    let mut arm_limit: Option<u32> = None;
    let mut accumulators: Option<&BTreeMap<String, Accumulator>> = None;
    let mut picks: Option<&BTreeMap<String, ProjectPick>> = None;

    for stage in stages {
        match stage {
            Stage::Match(p) => arm_match.push(p.clone()),
            Stage::Limit(n) => arm_limit = Some(*n),
            Stage::Group { accumulators: acc } => accumulators = Some(acc),
            Stage::Project { picks: p } => picks = Some(p),
            other => {
                return Err(StoreError::Render(format!(
                    "unsupported stage inside facet arm '{name}': {other:?}"
                )));
            }
        }
    }
    let Some(accumulators) = accumulators else {
        return Err(StoreError::Render(format!(
            "facet arm '{name}' has no group stage"
        )));
    };

    // Select list first: bind order must follow the final SQL text, and the
    // select list precedes the arm's inner subquery.
    sql.push_str(" SELECT ");
    let mut columns = Vec::with_capacity(accumulators.len());
    let mut first = true;
    for (out_name, acc) in accumulators {
        if !first {
            sql.push_str(", ");
        }
        first = false;

        let pick = picks.and_then(|p| p.get(out_name));
        let set_size = matches!(pick, Some(ProjectPick::SetSize(_)));
        let (select, set) = accumulator_sql(acc, set_size, ctx, &mut args);
        sql.push_str(&format!("{select} AS \"{out_name}\""));
        columns.push(ArmColumn {
            name: out_name.clone(),
            set,
        });
    }

    sql.push_str(" FROM (SELECT * FROM filtered");
    if !arm_match.is_empty() {
        sql.push_str(" WHERE ");
        render_predicate(&Predicate::and(arm_match), ctx, &mut sql, &mut args)?;
    }
    if let Some(n) = arm_limit {
        sql.push_str(" LIMIT ?");
        args.push(SqlArg::Int(n as i64));
    }
    sql.push(')');

    Ok(RenderedArm {
        name: name.to_string(),
        sql,
        args,
        columns,
    })
}

fn accumulator_sql(
    acc: &Accumulator,
    set_size: bool,
    ctx: &RenderCtx,
    args: &mut Vec<SqlArg>,
) -> (String, bool) {
    match acc {
        Accumulator::Sum(e) => (format!("COALESCE(SUM({}), 0)", expr_sql(e, ctx, args)), false),
        Accumulator::Count => ("COUNT(*)".into(), false),
        Accumulator::Min(e) => (format!("MIN({})", expr_sql(e, ctx, args)), false),
        Accumulator::Max(e) => (format!("MAX({})", expr_sql(e, ctx, args)), false),
        Accumulator::Avg(e) => (format!("AVG({})", expr_sql(e, ctx, args)), false),
        Accumulator::AddToSet(e) if set_size => {
            (format!("COUNT(DISTINCT {})", expr_sql(e, ctx, args)), false)
        }
        Accumulator::AddToSet(e) => {
            let inner = expr_sql(e, ctx, args);
            let filter = expr_sql(e, ctx, args);
            (
                format!(
                    "COALESCE(json_group_array(DISTINCT {inner}) \
                     FILTER (WHERE {filter} IS NOT NULL), '[]')"
                ),
                true,
            )
        }
    }
}

fn bind<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    args: &'q [SqlArg],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlArg::Null => query.bind(Option::<i64>::None),
            SqlArg::Int(i) => query.bind(*i),
            SqlArg::Float(f) => query.bind(*f),
            SqlArg::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow, columns: &[ArmColumn]) -> StoreResult<Value> {
    let mut out = BTreeMap::new();
    for (i, column) in columns.iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::Int(row.try_get::<i64, _>(i)?),
                "REAL" => Value::Float(row.try_get::<f64, _>(i)?),
                _ => {
                    let text: String = row.try_get(i)?;
                    if column.set {
                        let parsed: serde_json::Value = serde_json::from_str(&text)?;
                        Value::from_json(parsed)
                    } else {
                        Value::Text(text)
                    }
                }
            }
        };
        out.insert(column.name.clone(), value);
    }
    Ok(Value::Object(out))
}

impl Store {
    /// Execute a facet pipeline and return its result documents (one row,
    /// keyed by arm name, each arm holding its group document).
    pub async fn run_pipeline(
        &self,
        collection: Collection,
        stages: &[Stage],
    ) -> StoreResult<Vec<Value>> {
        let arms = render_pipeline(collection, stages)?;

        let queries = arms.iter().map(|arm| async move {
            let row = bind(sqlx::query(&arm.sql), &arm.args)
                .fetch_one(self.read_pool())
                .await?;
            let doc = decode_row(&row, &arm.columns)?;
            Ok::<(String, Value), StoreError>((arm.name.clone(), doc))
        });

        let results = futures_util::future::try_join_all(queries).await?;
        let doc: BTreeMap<String, Value> = results.into_iter().collect();
        Ok(vec![Value::Object(doc)])
    }
}
