use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Database,
    Table,
    Record,
}

/// A resource at exactly one of three granularities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawTarget", into = "RawTarget")]
pub enum LockTarget {
    Database(String),
    Table(String, String),
    Record(String, String, String),
}

impl LockTarget {
    pub fn database(db: impl Into<String>) -> Self {
        Self::Database(db.into())
    }

    pub fn table(db: impl Into<String>, table: impl Into<String>) -> Self {
        Self::Table(db.into(), table.into())
    }

    pub fn record(db: impl Into<String>, table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Record(db.into(), table.into(), id.into())
    }

    /// Derive the granularity from whichever components are present.
    pub fn from_parts(
        db: Option<String>,
        table: Option<String>,
        record: Option<String>,
    ) -> Result<Self> {
        let target = match (db, table, record) {
            (Some(db), None, None) => Self::Database(db),
            (Some(db), Some(table), None) => Self::Table(db, table),
            (Some(db), Some(table), Some(id)) => Self::Record(db, table, id),
            (None, None, None) => {
                return Err(Error::InvalidLockLevel(
                    "target names no database, table or record".to_owned(),
                ))
            }
            (db, table, record) => {
                return Err(Error::InvalidLockLevel(format!(
                    "incomplete target path: database={db:?} table={table:?} record={record:?}"
                )))
            }
        };
        target.validate()?;
        Ok(target)
    }

    /// Reject targets with empty components.
    pub fn validate(&self) -> Result<()> {
        let empty = match self {
            Self::Database(db) => db.is_empty(),
            Self::Table(db, table) => db.is_empty() || table.is_empty(),
            Self::Record(db, table, id) => db.is_empty() || table.is_empty() || id.is_empty(),
        };
        if empty {
            return Err(Error::InvalidLockLevel(format!("empty component in {self}")));
        }
        Ok(())
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Self::Database(_) => Granularity::Database,
            Self::Table(..) => Granularity::Table,
            Self::Record(..) => Granularity::Record,
        }
    }

    pub fn database_name(&self) -> &str {
        match self {
            Self::Database(db) | Self::Table(db, _) | Self::Record(db, _, _) => db,
        }
    }

    /// The enclosing resource, `None` for a database.
    pub fn parent(&self) -> Option<LockTarget> {
        match self {
            Self::Database(_) => None,
            Self::Table(db, _) => Some(Self::Database(db.clone())),
            Self::Record(db, table, _) => Some(Self::Table(db.clone(), table.clone())),
        }
    }

    /// Every target from the database down to `self`.
    pub fn path(&self) -> Vec<LockTarget> {
        let mut path = vec![self.clone()];
        while let Some(parent) = path.last().and_then(|t| t.parent()) {
            path.push(parent);
        }
        path.reverse();
        path
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(db) => write!(f, "{db}"),
            Self::Table(db, table) => write!(f, "{db}.{table}"),
            Self::Record(db, table, id) => write!(f, "{db}.{table}#{id}"),
        }
    }
}

/// Wire shape of a target: optional components, granularity implied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTarget {
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
}

impl TryFrom<RawTarget> for LockTarget {
    type Error = Error;

    fn try_from(raw: RawTarget) -> Result<Self> {
        LockTarget::from_parts(raw.database, raw.table, raw.record)
    }
}

impl From<LockTarget> for RawTarget {
    fn from(target: LockTarget) -> Self {
        match target {
            LockTarget::Database(db) => RawTarget {
                database: Some(db),
                table: None,
                record: None,
            },
            LockTarget::Table(db, table) => RawTarget {
                database: Some(db),
                table: Some(table),
                record: None,
            },
            LockTarget::Record(db, table, id) => RawTarget {
                database: Some(db),
                table: Some(table),
                record: Some(id),
            },
        }
    }
}
