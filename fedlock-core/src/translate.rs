use crate::config::{Config, Engine, StorageConfig, TableSchema};
use crate::lock::{LockMode, LockTarget};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    pub fn required_mode(self) -> LockMode {
        match self {
            StatementKind::Select => LockMode::Shared,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete => {
                LockMode::Exclusive
            }
        }
    }
}

/// Final text to run on one storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatement {
    pub storage: String,
    pub text: String,
}

/// What one statement locks and what it runs once the locks are granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementPlan {
    pub kind: StatementKind,
    pub targets: Vec<LockTarget>,
    pub mode: LockMode,
    pub statements: Vec<BackendStatement>,
}

/// Rewrites an original statement into per-backend statements.
pub trait Translator: Send + Sync {
    fn translate(&self, sql: &str) -> Result<StatementPlan>;
}

/// Translator for single-table statements, routed by the configured schema.
///
/// Handles `SELECT .. FROM db.t`, `INSERT INTO db.t (..) VALUES (..)`,
/// `UPDATE db.t SET ..` and `DELETE FROM db.t`, each with an optional
/// `WHERE <primary key> = <literal>` that narrows the lock to one record.
pub struct SchemaTranslator {
    config: Config,
}

impl SchemaTranslator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn resolve(&self, name: &str) -> Result<(String, String, &StorageConfig, &TableSchema)> {
        let (db, table) = name
            .split_once('.')
            .ok_or_else(|| Error::Translate(format!("table {name} is not qualified as db.table")))?;
        let (storage, schema) = self
            .config
            .locate(db, table)
            .ok_or_else(|| Error::Translate(format!("unknown table {db}.{table}")))?;
        Ok((db.to_owned(), table.to_owned(), storage, schema))
    }
}

impl Translator for SchemaTranslator {
    fn translate(&self, sql: &str) -> Result<StatementPlan> {
        let sql = sql.trim().trim_end_matches(';').trim();
        let tokens: Vec<&str> = sql.split_whitespace().collect();
        let keyword = |i: usize, kw: &str| tokens.get(i).map_or(false, |t| t.eq_ignore_ascii_case(kw));
        let position = |kw: &str| tokens.iter().position(|t| t.eq_ignore_ascii_case(kw));

        let (kind, table_at) = if keyword(0, "select") {
            let from = position("from")
                .ok_or_else(|| Error::Translate(format!("SELECT without FROM: {sql}")))?;
            (StatementKind::Select, from + 1)
        } else if keyword(0, "insert") && keyword(1, "into") {
            (StatementKind::Insert, 2)
        } else if keyword(0, "update") {
            (StatementKind::Update, 1)
        } else if keyword(0, "delete") && keyword(1, "from") {
            (StatementKind::Delete, 2)
        } else {
            return Err(Error::Translate(format!("unsupported statement: {sql}")));
        };

        let name = tokens
            .get(table_at)
            .copied()
            .map(|t| t.split('(').next().unwrap_or_default())
            .ok_or_else(|| Error::Translate(format!("missing table name: {sql}")))?;
        let (db, table, storage, schema) = self.resolve(name)?;

        let predicate = position("where").map(|i| tokens[i + 1..].join(" "));
        let key = match kind {
            StatementKind::Insert => insert_row(sql)
                .and_then(|row| row.get(&schema.primary_key).cloned())
                .map(|v| literal_text(&v)),
            _ => predicate
                .as_deref()
                .and_then(|p| key_equality(p, &schema.primary_key)),
        };
        let target = match &key {
            Some(id) => LockTarget::record(db.as_str(), table.as_str(), id.as_str()),
            None => LockTarget::table(db.as_str(), table.as_str()),
        };

        let text = match storage.engine {
            Engine::Mysql => sql.to_owned(),
            Engine::Mongodb => {
                let mut filter = Map::new();
                if let Some(id) = &key {
                    filter.insert(schema.primary_key.clone(), literal(id));
                }
                let filter = Value::Object(filter);
                let command = match kind {
                    StatementKind::Select => json!({ "find": table, "filter": filter, "$db": db }),
                    StatementKind::Insert => {
                        let row = insert_row(sql).ok_or_else(|| {
                            Error::Translate(format!("cannot read inserted row: {sql}"))
                        })?;
                        json!({ "insert": table, "documents": [row], "$db": db })
                    }
                    StatementKind::Update => {
                        let set = update_assignments(sql).ok_or_else(|| {
                            Error::Translate(format!("cannot read SET clause: {sql}"))
                        })?;
                        json!({
                            "update": table,
                            "updates": [{ "q": filter, "u": { "$set": set }, "multi": key.is_none() }],
                            "$db": db,
                        })
                    }
                    StatementKind::Delete => json!({
                        "delete": table,
                        "deletes": [{ "q": filter, "limit": 0 }],
                        "$db": db,
                    }),
                };
                command.to_string()
            }
        };

        Ok(StatementPlan {
            kind,
            targets: vec![target],
            mode: kind.required_mode(),
            statements: vec![BackendStatement {
                storage: storage.id.clone(),
                text,
            }],
        })
    }
}

/// `<key> = <literal>` and nothing else.
fn key_equality(predicate: &str, key: &str) -> Option<String> {
    let (column, value) = predicate.split_once('=')?;
    let value = value.trim();
    let simple = !value.is_empty()
        && !value.contains(char::is_whitespace)
        && !column.contains(['<', '>', '!']);
    if column.trim().eq_ignore_ascii_case(key) && simple {
        Some(unquote(value).to_owned())
    } else {
        None
    }
}

/// Column -> value of `INSERT INTO t (a, b) VALUES (1, 'x')`.
fn insert_row(sql: &str) -> Option<Map<String, Value>> {
    let lower = sql.to_ascii_lowercase();
    let values_at = lower.find("values")?;
    let columns = between_parens(&sql[..values_at])?;
    let values = between_parens(&sql[values_at..])?;
    let columns: Vec<&str> = columns.split(',').map(str::trim).collect();
    let values: Vec<&str> = values.split(',').map(str::trim).collect();
    if columns.len() != values.len() {
        return None;
    }
    Some(
        columns
            .into_iter()
            .zip(values)
            .map(|(c, v)| (c.to_owned(), literal(v)))
            .collect(),
    )
}

/// Column -> value of the `SET a = 1, b = 'x'` clause.
fn update_assignments(sql: &str) -> Option<Map<String, Value>> {
    let lower = sql.to_ascii_lowercase();
    let start = lower.find(" set ")? + " set ".len();
    let end = lower.find(" where ").unwrap_or(sql.len());
    sql.get(start..end)?
        .split(',')
        .map(|assign| {
            let (column, value) = assign.split_once('=')?;
            Some((column.trim().to_owned(), literal(value.trim())))
        })
        .collect()
}

fn between_parens(s: &str) -> Option<&str> {
    let open = s.find('(')?;
    let close = s.rfind(')')?;
    s.get(open + 1..close)
}

fn unquote(s: &str) -> &str {
    s.trim_matches(|c| c == '\'' || c == '"')
}

fn literal(s: &str) -> Value {
    if s.starts_with('\'') || s.starts_with('"') {
        return Value::String(unquote(s).to_owned());
    }
    if let Ok(i) = s.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return json!(f);
    }
    Value::String(s.to_owned())
}

fn literal_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn translator() -> SchemaTranslator {
        let config: Config = serde_json::from_str(
            r#"{
                "storages": [
                    { "id": "mysql0", "engine": "mysql" },
                    { "id": "mongo0", "engine": "mongodb" }
                ],
                "schemas": [
                    { "storage": "mysql0", "database": "shop",
                      "tables": [ { "name": "users", "primary_key": "id" } ] },
                    { "storage": "mongo0", "database": "shop",
                      "tables": [ { "name": "events", "primary_key": "id" } ] }
                ]
            }"#,
        )
        .unwrap();
        SchemaTranslator::new(config)
    }

    #[test]
    fn select_by_key_locks_record() {
        let plan = translator()
            .translate("SELECT name FROM shop.users WHERE id = 5;")
            .unwrap();
        assert_eq!(plan.kind, StatementKind::Select);
        assert_eq!(plan.mode, LockMode::Shared);
        assert_eq!(plan.targets, vec![LockTarget::record("shop", "users", "5")]);
        assert_eq!(plan.statements[0].storage, "mysql0");
        assert_eq!(plan.statements[0].text, "SELECT name FROM shop.users WHERE id = 5");
    }

    #[test]
    fn unkeyed_write_locks_table() {
        let plan = translator()
            .translate("update shop.users set name = 'x' where name = 'y'")
            .unwrap();
        assert_eq!(plan.mode, LockMode::Exclusive);
        assert_eq!(plan.targets, vec![LockTarget::table("shop", "users")]);
    }

    #[test]
    fn insert_into_document_store() {
        let plan = translator()
            .translate("INSERT INTO shop.events (id, kind) VALUES (7, 'login')")
            .unwrap();
        assert_eq!(plan.targets, vec![LockTarget::record("shop", "events", "7")]);
        assert_eq!(plan.statements[0].storage, "mongo0");
        let command: Value = serde_json::from_str(&plan.statements[0].text).unwrap();
        assert_eq!(command["insert"], "events");
        assert_eq!(command["documents"][0]["kind"], "login");
        assert_eq!(command["documents"][0]["id"], 7);
    }

    #[test]
    fn delete_from_document_store() {
        let plan = translator()
            .translate("DELETE FROM shop.events WHERE id = 'abc'")
            .unwrap();
        assert_eq!(plan.targets, vec![LockTarget::record("shop", "events", "abc")]);
        let command: Value = serde_json::from_str(&plan.statements[0].text).unwrap();
        assert_eq!(command["deletes"][0]["q"]["id"], "abc");
    }

    #[test]
    fn reject_unknown_statements() {
        let t = translator();
        assert!(matches!(t.translate("DROP TABLE shop.users"), Err(Error::Translate(_))));
        assert!(matches!(t.translate("SELECT * FROM users"), Err(Error::Translate(_))));
        assert!(matches!(t.translate("SELECT * FROM shop.nothing"), Err(Error::Translate(_))));
    }
}
