//! SQL retriever
//!
//! Runs a declared, parameterized SQL template against an embedded
//! SQLite datasource. Placeholders are a closed set: `{query}` and
//! `{top_k}` are built in, anything else must be declared in the
//! template's parameter schema and supplied through retrieval filters.
//! Values are always bound, never interpolated.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{types::Value as SqlValue, Connection};

use orbit_config::{AdapterTuning, SqlParamType, SqlTemplate};
use orbit_core::{
    Document, FilterOp, HealthStatus, Result, RetrieveOptions, Retriever,
};

use crate::reranker::lexical_overlap;
use crate::RetrievalError;

/// Retriever over a templated SQL query.
pub struct SqlRetriever {
    name: String,
    source: String,
    conn: Arc<Mutex<Connection>>,
    rendered_sql: String,
    param_names: Vec<String>,
    template: SqlTemplate,
    tuning: AdapterTuning,
}

impl SqlRetriever {
    pub fn open(
        name: &str,
        source: &str,
        path: impl AsRef<Path>,
        template: SqlTemplate,
        tuning: AdapterTuning,
    ) -> Result<Self> {
        let (rendered_sql, param_names) = render_template(&template)?;

        let conn = Connection::open(path.as_ref())
            .map_err(|e| RetrievalError::Datasource(e.to_string()).into_core(name))?;

        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            rendered_sql,
            param_names,
            template,
            tuning,
        })
    }

    fn bind_values(&self, query: &str, options: &RetrieveOptions) -> Result<Vec<SqlValue>> {
        let mut values = Vec::with_capacity(self.param_names.len());
        for name in &self.param_names {
            let value = match name.as_str() {
                "query" => SqlValue::Text(query.to_string()),
                "top_k" => SqlValue::Integer(self.tuning.max_results as i64),
                other => {
                    let decl = self
                        .template
                        .params
                        .iter()
                        .find(|p| p.name == other)
                        .ok_or_else(|| {
                            RetrievalError::Template(format!("undeclared parameter '{other}'"))
                                .into_core(&self.name)
                        })?;
                    let supplied = options
                        .filters
                        .iter()
                        .find(|f| f.field == *other && matches!(f.op, FilterOp::Equals))
                        .ok_or_else(|| {
                            RetrievalError::Template(format!(
                                "parameter '{other}' has no bound value"
                            ))
                            .into_core(&self.name)
                        })?;
                    coerce(decl.param_type, &supplied.value).ok_or_else(|| {
                        RetrievalError::Template(format!(
                            "parameter '{other}' does not match its declared type"
                        ))
                        .into_core(&self.name)
                    })?
                }
            };
            values.push(value);
        }
        Ok(values)
    }
}

/// Convert `{name}` placeholders to positional binds, collecting names
/// in order of appearance. Undeclared names are rejected up front.
fn render_template(template: &SqlTemplate) -> Result<(String, Vec<String>)> {
    let mut sql = String::with_capacity(template.query.len());
    let mut names = Vec::new();
    let mut rest = template.query.as_str();

    while let Some(open) = rest.find('{') {
        sql.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            orbit_core::Error::Config("unterminated placeholder in SQL template".into())
        })?;
        let name = &after[..close];

        let valid = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(orbit_core::Error::Config(format!(
                "invalid SQL template placeholder '{{{name}}}'"
            )));
        }
        let declared = name == "query"
            || name == "top_k"
            || template.params.iter().any(|p| p.name == name);
        if !declared {
            return Err(orbit_core::Error::Config(format!(
                "SQL template placeholder '{{{name}}}' is not declared"
            )));
        }

        names.push(name.to_string());
        sql.push_str(&format!("?{}", names.len()));
        rest = &after[close + 1..];
    }
    sql.push_str(rest);
    Ok((sql, names))
}

fn coerce(param_type: SqlParamType, value: &serde_json::Value) -> Option<SqlValue> {
    match param_type {
        SqlParamType::Text => value.as_str().map(|s| SqlValue::Text(s.to_string())),
        SqlParamType::Integer => value.as_i64().map(SqlValue::Integer),
        SqlParamType::Real => value.as_f64().map(SqlValue::Real),
    }
}

#[async_trait]
impl Retriever for SqlRetriever {
    async fn get_relevant_documents(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<Document>> {
        let values = self.bind_values(query, options)?;
        let conn = Arc::clone(&self.conn);
        let sql = self.rendered_sql.clone();
        let template = self.template.clone();
        let name = self.name.clone();
        let source = self.source.clone();
        let query_owned = query.to_string();
        let tuning = self.tuning.clone();

        let mut documents = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let mut stmt = guard
                .prepare(&sql)
                .map_err(|e| RetrievalError::Datasource(e.to_string()))?;

            for (index, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(index + 1, value)
                    .map_err(|e| RetrievalError::Datasource(e.to_string()))?;
            }

            let mut rows = stmt.raw_query();
            let mut documents = Vec::new();
            while let Some(row) = rows.next().map_err(|e| RetrievalError::Datasource(e.to_string()))? {
                let content: String = row
                    .get::<_, Option<String>>(template.content_column.as_str())
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                let answer: Option<String> = template
                    .answer_column
                    .as_deref()
                    .and_then(|col| row.get::<_, Option<String>>(col).ok().flatten());
                let question: Option<String> = template
                    .question_column
                    .as_deref()
                    .and_then(|col| row.get::<_, Option<String>>(col).ok().flatten());

                // Lexical relevance against the matched question when
                // present, otherwise the content body.
                let basis = question.as_deref().unwrap_or(&content);
                let score = lexical_overlap(&query_owned, basis);

                let mut doc = Document::new(content, score).with_source(&source);
                doc.metadata.answer = answer;
                doc.metadata.question = question;
                doc.metadata.confidence = Some(score);
                documents.push(doc);
            }
            Ok::<_, RetrievalError>(documents)
        })
        .await
        .map_err(|e| RetrievalError::Datasource(format!("blocking task failed: {e}")).into_core(&name))?
        .map_err(|e| e.into_core(&self.name))?;

        documents.retain(|d| d.score >= tuning.confidence_threshold);
        documents.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        documents.truncate(tuning.return_results);
        Ok(documents)
    }

    async fn health_check(&self) -> HealthStatus {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            guard.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        })
        .await;

        match result {
            Ok(Ok(_)) => HealthStatus::Ok,
            _ => HealthStatus::Down,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_config::SqlParamDecl;

    fn qa_template() -> SqlTemplate {
        SqlTemplate {
            query: "SELECT question, answer, content FROM qa \
                    WHERE question LIKE '%' || {query} || '%' LIMIT {top_k}"
                .into(),
            params: Vec::new(),
            answer_column: Some("answer".into()),
            question_column: Some("question".into()),
            content_column: "content".into(),
        }
    }

    fn seeded_retriever(tuning: AdapterTuning) -> SqlRetriever {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE qa (question TEXT, answer TEXT, content TEXT);
             INSERT INTO qa VALUES
               ('What is the city population?', '1,234,567', 'Census summary'),
               ('What is the city budget?', '$2.1B', 'Budget overview');",
        )
        .unwrap();

        let (rendered_sql, param_names) = render_template(&qa_template()).unwrap();
        SqlRetriever {
            name: "qa-sql".into(),
            source: "city_qa".into(),
            conn: Arc::new(Mutex::new(conn)),
            rendered_sql,
            param_names,
            template: qa_template(),
            tuning,
        }
    }

    #[test]
    fn test_render_template_positional() {
        let (sql, names) = render_template(&qa_template()).unwrap();
        assert!(sql.contains("?1"));
        assert!(sql.contains("?2"));
        assert_eq!(names, vec!["query", "top_k"]);
    }

    #[test]
    fn test_undeclared_placeholder_rejected() {
        let template = SqlTemplate {
            query: "SELECT * FROM t WHERE c = {mystery}".into(),
            params: Vec::new(),
            answer_column: None,
            question_column: None,
            content_column: "content".into(),
        };
        assert!(render_template(&template).is_err());
    }

    #[test]
    fn test_declared_parameter_accepted() {
        let template = SqlTemplate {
            query: "SELECT * FROM t WHERE category = {category}".into(),
            params: vec![SqlParamDecl { name: "category".into(), param_type: SqlParamType::Text }],
            answer_column: None,
            question_column: None,
            content_column: "content".into(),
        };
        let (_, names) = render_template(&template).unwrap();
        assert_eq!(names, vec!["category"]);
    }

    #[tokio::test]
    async fn test_qa_lookup_returns_answer() {
        let retriever = seeded_retriever(AdapterTuning {
            confidence_threshold: 0.3,
            ..Default::default()
        });

        let docs = retriever
            .get_relevant_documents("What is the city population?", &RetrieveOptions::default())
            .await
            .unwrap();

        assert!(!docs.is_empty());
        assert_eq!(docs[0].metadata.answer.as_deref(), Some("1,234,567"));
        assert!(docs[0].qualifies_as_direct_answer(0.5));
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_fabricated() {
        let retriever = seeded_retriever(AdapterTuning {
            confidence_threshold: 0.5,
            ..Default::default()
        });

        let docs = retriever
            .get_relevant_documents("unrelated gibberish zzz", &RetrieveOptions::default())
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_health_check() {
        let retriever = seeded_retriever(AdapterTuning::default());
        assert_eq!(retriever.health_check().await, HealthStatus::Ok);
    }
}
