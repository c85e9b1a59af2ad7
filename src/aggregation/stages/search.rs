//! `$search` — compiles a Lucene-style operator tree into an FTS5 MATCH
//! expression evaluated against the collection's `<coll>_fts` virtual table.
use bson::{Bson, Document};

const FTS_METACHARS: &[char] = &['&', '|', '(', ')', '^', '~', '*', ':', '"'];

fn escape_term(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if FTS_METACHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone)]
pub enum SearchOperator {
    Text {
        query: String,
        path: Option<String>,
    },
    Phrase {
        query: String,
        path: Option<String>,
    },
    Wildcard {
        query: String,
        path: Option<String>,
    },
    Autocomplete {
        query: String,
        path: Option<String>,
        token_order: Option<String>,
    },
    Compound {
        must: Vec<SearchOperator>,
        should: Vec<SearchOperator>,
        must_not: Vec<SearchOperator>,
        filter: Vec<SearchOperator>,
        minimum_should_match: Option<i64>,
    },
}

#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub index: Option<String>,
    pub operator: SearchOperator,
    pub return_score: bool,
}

impl SearchSpec {
    pub fn parse(value: &Bson) -> anyhow::Result<Self> {
        let doc = value
            .as_document()
            .ok_or_else(|| anyhow::anyhow!("$search value must be a document"))?;
        let index = doc.get_str("index").ok().map(|s| s.to_string());
        let operator = parse_operator(doc)?;
        Ok(Self {
            index,
            operator,
            return_score: true,
        })
    }
}

fn parse_operator(doc: &Document) -> anyhow::Result<SearchOperator> {
    if let Ok(sub) = doc.get_document("text") {
        return Ok(SearchOperator::Text {
            query: sub
                .get_str("query")
                .map_err(|_| anyhow::anyhow!("text operator requires query"))?
                .to_string(),
            path: sub.get_str("path").ok().map(|s| s.to_string()),
        });
    }
    if let Ok(sub) = doc.get_document("phrase") {
        return Ok(SearchOperator::Phrase {
            query: sub
                .get_str("query")
                .map_err(|_| anyhow::anyhow!("phrase operator requires query"))?
                .to_string(),
            path: sub.get_str("path").ok().map(|s| s.to_string()),
        });
    }
    if let Ok(sub) = doc.get_document("wildcard") {
        return Ok(SearchOperator::Wildcard {
            query: sub
                .get_str("query")
                .map_err(|_| anyhow::anyhow!("wildcard operator requires query"))?
                .to_string(),
            path: sub.get_str("path").ok().map(|s| s.to_string()),
        });
    }
    if let Ok(sub) = doc.get_document("autocomplete") {
        return Ok(SearchOperator::Autocomplete {
            query: sub
                .get_str("query")
                .map_err(|_| anyhow::anyhow!("autocomplete operator requires query"))?
                .to_string(),
            path: sub.get_str("path").ok().map(|s| s.to_string()),
            token_order: sub.get_str("tokenOrder").ok().map(|s| s.to_string()),
        });
    }
    if let Ok(sub) = doc.get_document("compound") {
        let parse_list = |key: &str| -> anyhow::Result<Vec<SearchOperator>> {
            match sub.get_array(key) {
                Ok(arr) => arr
                    .iter()
                    .map(|v| {
                        v.as_document()
                            .ok_or_else(|| anyhow::anyhow!("compound clause must be a document"))
                            .and_then(parse_operator)
                    })
                    .collect(),
                Err(_) => Ok(Vec::new()),
            }
        };
        return Ok(SearchOperator::Compound {
            must: parse_list("must")?,
            should: parse_list("should")?,
            must_not: parse_list("mustNot")?,
            filter: parse_list("filter")?,
            minimum_should_match: sub.get_i64("minimumShouldMatch").ok(),
        });
    }
    Err(anyhow::anyhow!(
        "$search operator must be one of text, phrase, wildcard, autocomplete, compound"
    ))
}

/// Compiles an operator tree into an FTS5 MATCH expression string.
pub fn compile(op: &SearchOperator) -> String {
    match op {
        SearchOperator::Text { query, path } => {
            let terms: Vec<String> = query
                .split_whitespace()
                .map(|t| {
                    let escaped = escape_term(t);
                    match path {
                        Some(p) => format!("{p}:{escaped}"),
                        None => escaped,
                    }
                })
                .collect();
            terms.join(" ")
        }
        SearchOperator::Phrase { query, path } => {
            let escaped = escape_term(query);
            let quoted = format!("\"{escaped}\"");
            match path {
                Some(p) => format!("{p}:{quoted}"),
                None => quoted,
            }
        }
        SearchOperator::Wildcard { query, path } => {
            let base = query.strip_suffix('*').unwrap_or(query);
            let escaped = escape_term(base);
            let term = format!("{escaped}*");
            match path {
                Some(p) => format!("{p}:{term}"),
                None => term,
            }
        }
        SearchOperator::Autocomplete {
            query,
            path,
            token_order: _,
        } => {
            // Sequential token order would need phrase-prefix semantics, which FTS5
            // doesn't support; both orderings degrade to space-joined prefix terms.
            let terms: Vec<String> = query
                .split_whitespace()
                .map(|t| {
                    let escaped = escape_term(t);
                    let term = format!("{escaped}*");
                    match path {
                        Some(p) => format!("{p}:{term}"),
                        None => term,
                    }
                })
                .collect();
            terms.join(" ")
        }
        SearchOperator::Compound {
            must,
            should,
            must_not,
            filter,
            minimum_should_match: _,
        } => {
            let mut clauses = Vec::new();

            let and_group: Vec<String> = must.iter().chain(filter.iter()).map(compile).collect();
            if !and_group.is_empty() {
                clauses.push(join_clauses(&and_group, " AND "));
            }

            if !should.is_empty() {
                let should_clauses: Vec<String> = should.iter().map(compile).collect();
                clauses.push(join_clauses(&should_clauses, " OR "));
            }

            for op in must_not {
                clauses.push(format!("NOT {}", parenthesize(&compile(op))));
            }

            if clauses.is_empty() {
                return "*".to_string();
            }

            join_clauses(&clauses, " AND ")
        }
    }
}

fn join_clauses(clauses: &[String], sep: &str) -> String {
    if clauses.len() == 1 {
        clauses[0].clone()
    } else {
        format!("({})", clauses.join(sep))
    }
}

fn parenthesize(expr: &str) -> String {
    if expr.contains(' ') {
        format!("({expr})")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_metacharacters() {
        assert_eq!(escape_term("a&b"), "a\\&b");
        assert_eq!(escape_term("\"quoted\""), "\\\"quoted\\\"");
    }

    #[test]
    fn text_joins_terms_with_implicit_and() {
        let op = SearchOperator::Text {
            query: "red shoes".to_string(),
            path: Some("description".to_string()),
        };
        assert_eq!(compile(&op), "description:red description:shoes");
    }

    #[test]
    fn wildcard_strips_and_reappends_star() {
        let op = SearchOperator::Wildcard {
            query: "hel*".to_string(),
            path: None,
        };
        assert_eq!(compile(&op), "hel*");
    }

    #[test]
    fn phrase_is_quoted() {
        let op = SearchOperator::Phrase {
            query: "quick brown fox".to_string(),
            path: None,
        };
        assert_eq!(compile(&op), "\"quick brown fox\"");
    }

    #[test]
    fn compound_must_and_joins_two_text_clauses() {
        let op = SearchOperator::Compound {
            must: vec![
                SearchOperator::Text { query: "mongo".to_string(), path: Some("title".to_string()) },
                SearchOperator::Text { query: "db".to_string(), path: Some("body".to_string()) },
            ],
            should: Vec::new(),
            must_not: Vec::new(),
            filter: Vec::new(),
            minimum_should_match: None,
        };
        assert_eq!(compile(&op), "(title:mongo AND body:db)");
    }

    #[test]
    fn compound_with_no_clauses_matches_everything() {
        let op = SearchOperator::Compound {
            must: Vec::new(),
            should: Vec::new(),
            must_not: Vec::new(),
            filter: Vec::new(),
            minimum_should_match: None,
        };
        assert_eq!(compile(&op), "*");
    }
}
