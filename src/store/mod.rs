// Document store used by the pipeline: named tables of JSON documents, grouped per dataset

mod file;
mod memory;
mod session;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use session::{DatasetSession, Sessions};

use crate::error::{AtlasError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

pub type Document = Map<String, Value>;

/// Rejects anything that could escape a data directory or confuse a table file name.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(AtlasError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    dataset: String,
    table: String,
}

impl TableRef {
    pub fn new(dataset: &str, table: &str) -> Result<Self> {
        validate_name(dataset)?;
        validate_name(table)?;
        Ok(TableRef {
            dataset: dataset.to_string(),
            table: table.to_string(),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.table)
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Eq(String, Value),
    In(String, Vec<Value>),
}

/// Conjunction of equality / membership clauses with an optional ascending sort.
#[derive(Debug, Clone, Default)]
pub struct Query {
    clauses: Vec<Clause>,
    sort_by: Option<String>,
}

impl Query {
    pub fn all() -> Self {
        Query::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.to_string(), value.into()));
        self
    }

    pub fn within(mut self, field: &str, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::In(field.to_string(), values));
        self
    }

    pub fn sort_by(mut self, field: &str) -> Self {
        self.sort_by = Some(field.to_string());
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(field, value) => doc.get(field) == Some(value),
            Clause::In(field, values) => doc
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
        })
    }

    /// Filters and sorts a borrowed table, cloning only the matching documents.
    pub fn apply<'a, I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut matched: Vec<Document> = docs
            .into_iter()
            .filter(|doc| self.matches(doc))
            .cloned()
            .collect();

        if let Some(field) = &self.sort_by {
            // stable, so equal keys keep storage order
            matched.sort_by(|a, b| compare_values(a.get(field), b.get(field)));
        }

        matched
    }
}

/// Numbers ascending, then strings, then everything else; missing values sort last.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            Some(Value::Number(_)) => 0,
            Some(Value::String(_)) => 1,
            Some(_) => 2,
            None => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Shared `insert_if_absent` semantics for stores that hold a table as a `Vec`.
pub(crate) fn push_if_absent(docs: &mut Vec<Document>, query: &Query, doc: Document) -> bool {
    if docs.iter().any(|existing| query.matches(existing)) {
        return false;
    }
    docs.push(doc);
    true
}

/// Shared `update_one` semantics for stores that hold a table as a `Vec`.
pub(crate) fn apply_update(docs: &mut Vec<Document>, query: &Query, fields: Document, upsert: bool) {
    if let Some(existing) = docs.iter_mut().find(|doc| query.matches(doc)) {
        existing.extend(fields);
        return;
    }
    if !upsert {
        return;
    }

    let mut inserted = Document::new();
    for clause in &query.clauses {
        if let Clause::Eq(field, value) = clause {
            inserted.insert(field.clone(), value.clone());
        }
    }
    inserted.extend(fields);
    docs.push(inserted);
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, table: &TableRef, query: &Query) -> Result<Vec<Document>>;

    async fn find_one(&self, table: &TableRef, query: &Query) -> Result<Option<Document>> {
        Ok(self.find(table, query).await?.into_iter().next())
    }

    /// Distinct values of `field` among matching documents, in first-seen order.
    async fn distinct(&self, table: &TableRef, field: &str, query: &Query) -> Result<Vec<Value>> {
        let mut values: Vec<Value> = Vec::new();
        for doc in self.find(table, query).await? {
            if let Some(value) = doc.get(field) {
                if !value.is_null() && !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        Ok(values)
    }

    /// Returns the number of removed documents.
    async fn delete_all(&self, table: &TableRef) -> Result<usize>;

    async fn insert_many(&self, table: &TableRef, docs: Vec<Document>) -> Result<()>;

    /// Inserts `doc` unless a document matches `query`; the check and the insert are one write.
    /// Returns whether the document was inserted.
    async fn insert_if_absent(&self, table: &TableRef, query: &Query, doc: Document) -> Result<bool>;

    /// Merges `fields` into the first matching document, inserting one when
    /// nothing matches and `upsert` is set. Atomic with respect to other writers.
    async fn update_one(
        &self,
        table: &TableRef,
        query: &Query,
        fields: Document,
        upsert: bool,
    ) -> Result<()>;
}
