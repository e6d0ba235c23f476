//! Compile [`Filter`]s, ACL checks and sorts into SQL over a JSONB column.
//!
//! Equality goes through `jsonb_path_exists` in lax mode, which unwraps
//! arrays along the path the same way the in-memory matcher fans out.

use serde_json::json;
use sqlx::{Postgres, QueryBuilder};

use crate::model::{Identity, Right};
use crate::store::{Filter, Order, Sort, SortKind};

/// `$."a"."b"` for the dotted path `a.b`.
pub fn json_path(path: &str) -> String {
    let mut out = String::from("$");
    for segment in path.split('.') {
        out.push_str(".\"");
        for c in segment.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
    }
    out
}

fn text_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

pub fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, column: &str, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Eq(path, value) if value.is_object() || value.is_array() => {
            qb.push(format!("({column} #> "));
            qb.push_bind(text_path(path));
            qb.push("::text[] = ");
            qb.push_bind(value.clone());
            qb.push(")");
        }
        Filter::Eq(path, value) => {
            qb.push(format!("jsonb_path_exists({column}, "));
            qb.push_bind(format!("{} ? (@ == $v)", json_path(path)));
            qb.push("::jsonpath, ");
            qb.push_bind(json!({ "v": value }));
            qb.push(")");
        }
        Filter::Lte(path, bound) => {
            qb.push(format!("(nullif({column} #>> "));
            qb.push_bind(text_path(path));
            qb.push("::text[], '')::timestamptz <= ");
            qb.push_bind(*bound);
            qb.push(")");
        }
        Filter::Missing(path) => {
            qb.push(format!("NOT jsonb_path_exists({column}, "));
            qb.push_bind(format!("{} ? (@ != null)", json_path(path)));
            qb.push("::jsonpath)");
        }
        Filter::And(parts) => {
            qb.push("(");
            for (index, part) in parts.iter().enumerate() {
                if index > 0 {
                    qb.push(" AND ");
                }
                push_filter(qb, column, part);
            }
            qb.push(")");
        }
    }
}

fn push_ace_exists(qb: &mut QueryBuilder<'_, Postgres>, column: &str, identity: &Identity, right: Right, deny: bool) {
    qb.push(format!(
        "EXISTS (SELECT 1 FROM jsonb_array_elements(CASE WHEN jsonb_typeof({column}->'_acl') = 'array' \
         THEN {column}->'_acl' ELSE '[]'::jsonb END) ace WHERE ace->>'_id' = ANY("
    ));
    qb.push_bind(identity.principal_ids());
    qb.push(") AND ((ace->>'rights')::bigint & ");
    qb.push_bind(i64::from(right.bit()));
    qb.push(format!(
        ") <> 0 AND {}coalesce((ace->>'deny')::boolean, false))",
        if deny { "" } else { "NOT " }
    ));
}

/// Require `right` on the document's `_acl`: one covering allow and no
/// covering deny. Root passes unconditionally.
pub fn push_acl(qb: &mut QueryBuilder<'_, Postgres>, column: &str, identity: &Identity, right: Right) {
    if identity.is_root() {
        qb.push("TRUE");
        return;
    }
    qb.push("(NOT ");
    push_ace_exists(qb, column, identity, right, true);
    qb.push(" AND ");
    push_ace_exists(qb, column, identity, right, false);
    qb.push(")");
}

pub fn push_order(qb: &mut QueryBuilder<'_, Postgres>, column: &str, sort: &[Sort]) {
    if sort.is_empty() {
        return;
    }
    qb.push(" ORDER BY ");
    for (index, key) in sort.iter().enumerate() {
        if index > 0 {
            qb.push(", ");
        }
        let cast = match key.kind {
            SortKind::Number => "float8",
            SortKind::Time => "timestamptz",
            SortKind::Text => "text",
        };
        qb.push(format!("nullif({column} #>> "));
        qb.push_bind(text_path(&key.path));
        qb.push(format!("::text[], '')::{cast}"));
        // Missing values sort first ascending, matching the in-memory store.
        qb.push(match key.order {
            Order::Asc => " ASC NULLS FIRST",
            Order::Desc => " DESC NULLS LAST",
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Query;

    #[test]
    fn json_paths_quote_segments() {
        assert_eq!(json_path("members._id"), "$.\"members\".\"_id\"");
        assert_eq!(json_path("we\"ird"), "$.\"we\\\"ird\"");
    }

    #[test]
    fn filters_compile_to_bound_sql() {
        let filter = Filter::eq("_type", "workitem")
            .and(Filter::missing("userid"))
            .and(Filter::lte("nextrun", chrono::Utc::now()));
        let mut qb = QueryBuilder::<Postgres>::new("SELECT doc FROM documents WHERE ");
        push_filter(&mut qb, "doc", &filter);
        let sql = qb.sql();
        assert!(sql.contains("jsonb_path_exists(doc, $1::jsonpath, $2)"));
        assert!(sql.contains("NOT jsonb_path_exists(doc, $3::jsonpath)"));
        assert!(sql.contains("::timestamptz <= $5"));
    }

    #[test]
    fn root_skips_acl() {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_acl(&mut qb, "doc", &Identity::root(), Right::Read);
        assert_eq!(qb.sql(), "TRUE");

        let mut qb = QueryBuilder::<Postgres>::new("");
        push_acl(&mut qb, "doc", &Identity::new("u1", "alice", "alice"), Right::Read);
        assert!(qb.sql().starts_with("(NOT EXISTS"));
    }

    #[test]
    fn sorts_put_missing_first() {
        let query = Query::new(Filter::All).sort(Sort::asc("priority", SortKind::Number));
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_order(&mut qb, "doc", &query.sort);
        assert!(qb.sql().contains("::float8 ASC NULLS FIRST"));
    }
}
