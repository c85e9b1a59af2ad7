//! `$olap` — validates an analytical query against this backend's supported
//! shape but never executes it: there is no embedded OLAP engine here, so
//! execution always fails naming the engine that would have run it.
use bson::{Bson, Document};

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OlapEngine {
    Auto,
    R2sql,
    Clickhouse,
}

impl OlapEngine {
    fn name(self) -> &'static str {
        match self {
            OlapEngine::Auto => "auto",
            OlapEngine::R2sql => "r2sql",
            OlapEngine::Clickhouse => "clickhouse",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OlapQuery {
    Sql(String),
    Structured {
        select: Vec<String>,
        from: String,
        filter: Option<String>,
        group_by: Vec<String>,
        having: Option<String>,
        order_by: Vec<String>,
        limit: Option<i64>,
        offset: Option<i64>,
    },
}

#[derive(Debug, Clone)]
pub struct OlapSpec {
    pub engine: OlapEngine,
    pub query: OlapQuery,
}

impl OlapSpec {
    pub fn parse(value: &Bson) -> anyhow::Result<Self> {
        let doc = value
            .as_document()
            .ok_or_else(|| anyhow::anyhow!("$olap value must be a document"))?;

        let engine = match doc.get_str("engine").unwrap_or("auto") {
            "auto" => OlapEngine::Auto,
            "r2sql" => OlapEngine::R2sql,
            "clickhouse" => OlapEngine::Clickhouse,
            other => return Err(anyhow::anyhow!("Unsupported $olap engine: {}", other)),
        };

        let query = if let Ok(sql) = doc.get_str("sql") {
            validate_sql(sql)?;
            OlapQuery::Sql(sql.to_string())
        } else if let Ok(query_doc) = doc.get_document("query") {
            parse_structured(query_doc)?
        } else {
            return Err(anyhow::anyhow!("$olap requires either sql or query"));
        };

        Ok(Self { engine, query })
    }
}

fn validate_sql(sql: &str) -> anyhow::Result<()> {
    if sql.trim().is_empty() {
        return Err(anyhow::anyhow!("$olap sql must not be empty"));
    }
    let statement_count = sql.split(';').filter(|s| !s.trim().is_empty()).count();
    if statement_count > 1 {
        return Err(anyhow::anyhow!("$olap sql must contain a single statement"));
    }
    let upper = sql.to_uppercase();
    for keyword in FORBIDDEN_KEYWORDS {
        if contains_keyword(&upper, keyword) {
            return Err(anyhow::anyhow!(
                "$olap sql must be a read-only query; found forbidden keyword {}",
                keyword
            ));
        }
    }
    Ok(())
}

fn contains_keyword(upper_sql: &str, keyword: &str) -> bool {
    upper_sql
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|tok| tok == *keyword)
}

fn parse_structured(doc: &Document) -> anyhow::Result<OlapQuery> {
    let select = doc
        .get_array("select")
        .map_err(|_| anyhow::anyhow!("$olap query requires select"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("$olap query.select entries must be strings"))
        })
        .collect::<anyhow::Result<Vec<String>>>()?;
    let from = doc
        .get_str("from")
        .map_err(|_| anyhow::anyhow!("$olap query requires from"))?
        .to_string();
    let filter = doc.get_str("where").ok().map(str::to_string);
    let group_by = doc
        .get_array("groupBy")
        .ok()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let having = doc.get_str("having").ok().map(str::to_string);
    let order_by = doc
        .get_array("orderBy")
        .ok()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let limit = doc.get_i64("limit").ok().or_else(|| doc.get_i32("limit").ok().map(i64::from));
    let offset = doc
        .get_i64("offset")
        .ok()
        .or_else(|| doc.get_i32("offset").ok().map(i64::from));

    for clause in std::iter::once(filter.as_deref())
        .chain(having.as_deref().map(Some))
        .flatten()
    {
        validate_sql_fragment(clause)?;
    }

    Ok(OlapQuery::Structured {
        select,
        from,
        filter,
        group_by,
        having,
        order_by,
        limit,
        offset,
    })
}

fn validate_sql_fragment(fragment: &str) -> anyhow::Result<()> {
    let upper = fragment.to_uppercase();
    for keyword in FORBIDDEN_KEYWORDS {
        if contains_keyword(&upper, keyword) {
            return Err(anyhow::anyhow!(
                "$olap query clause must be read-only; found forbidden keyword {}",
                keyword
            ));
        }
    }
    Ok(())
}

/// Always fails: there is no embedded analytical engine to dispatch to.
/// Validation above is real and complete; this stage exists so pipelines can
/// be authored and optimized against a stable `$olap` contract ahead of a
/// real engine being wired in.
pub async fn execute(spec: &OlapSpec) -> anyhow::Result<Vec<Document>> {
    Err(anyhow::anyhow!(
        "$olap engine '{}' is not available in this deployment",
        spec.engine.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn rejects_multi_statement_sql() {
        let spec = doc! { "sql": "SELECT 1; SELECT 2" };
        assert!(OlapSpec::parse(&Bson::Document(spec)).is_err());
    }

    #[test]
    fn rejects_mutating_keywords() {
        for bad in ["DROP TABLE foo", "DELETE FROM foo", "UPDATE foo SET x=1"] {
            let spec = doc! { "sql": bad };
            assert!(OlapSpec::parse(&Bson::Document(spec)).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn accepts_read_only_sql() {
        let spec = doc! { "sql": "SELECT count(*) FROM events GROUP BY day" };
        let parsed = OlapSpec::parse(&Bson::Document(spec)).unwrap();
        matches!(parsed.query, OlapQuery::Sql(_));
    }

    #[test]
    fn parses_structured_query() {
        let spec = doc! {
            "engine": "clickhouse",
            "query": {
                "select": ["day", "count(*) as n"],
                "from": "events",
                "groupBy": ["day"],
                "limit": 10i64,
            }
        };
        let parsed = OlapSpec::parse(&Bson::Document(spec)).unwrap();
        assert_eq!(parsed.engine, OlapEngine::Clickhouse);
        match parsed.query {
            OlapQuery::Structured { from, limit, .. } => {
                assert_eq!(from, "events");
                assert_eq!(limit, Some(10));
            }
            _ => panic!("expected structured query"),
        }
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let spec = doc! { "engine": "magic", "sql": "SELECT 1" };
        assert!(OlapSpec::parse(&Bson::Document(spec)).is_err());
    }
}
