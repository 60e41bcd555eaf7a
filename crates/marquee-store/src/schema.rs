// ABOUTME: Versioned record schemas and the migration stages that link them into one chain.
// ABOUTME: The chain is validated on construction; gaps or stray stages are configuration errors.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use thiserror::Error;

/// Errors in the declared chain, or between the chain and the file on disk.
/// None of these are recoverable at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationChainError {
    #[error("schema chain declares no versions")]
    Empty,

    #[error("schema versions must ascend: v{prev} is followed by v{next}")]
    Unordered { prev: u32, next: u32 },

    #[error("no migration stage links v{from} to v{to}")]
    Gap { from: u32, to: u32 },

    #[error("stage v{from} -> v{to} does not connect adjacent declared versions")]
    StrayStage { from: u32, to: u32 },

    #[error("on-disk schema v{0} is not declared in the chain")]
    UnknownVersion(u32),

    #[error("on-disk schema v{found} is newer than the latest declared v{latest}")]
    NewerOnDisk { found: u32, latest: u32 },
}

/// Error a custom transform may return for a single record.
pub type TransformError = Box<dyn StdError + Send + Sync>;

/// Per-record data transform used by custom stages.
pub type Transform = Arc<dyn Fn(Value) -> Result<Value, TransformError> + Send + Sync>;

/// One field of a record shape. Fields with a default can be added by a
/// lightweight stage.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: &'static str,
    pub default: Option<Value>,
}

impl FieldDef {
    pub fn required(name: &'static str) -> Self {
        Self {
            name,
            default: None,
        }
    }

    pub fn with_default(name: &'static str, default: Value) -> Self {
        Self {
            name,
            default: Some(default),
        }
    }
}

/// The full record shape at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub version: u32,
    pub fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(version: u32, fields: Vec<FieldDef>) -> Self {
        Self { version, fields }
    }

    fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check that `record` is an object carrying every declared field.
    pub fn check(&self, record: &Value) -> Result<(), String> {
        let obj = record
            .as_object()
            .ok_or_else(|| "record is not a JSON object".to_string())?;
        for field in &self.fields {
            if !obj.contains_key(field.name) {
                return Err(format!("missing field `{}` for v{}", field.name, self.version));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub enum StageKind {
    /// Structural change: add fields with their defaults, drop undeclared ones.
    Lightweight,
    /// Arbitrary per-record transform.
    Custom(Transform),
}

impl fmt::Debug for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Lightweight => "lightweight",
            StageKind::Custom(_) => "custom",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationStage {
    pub from: u32,
    pub to: u32,
    pub kind: StageKind,
}

impl MigrationStage {
    pub fn lightweight(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            kind: StageKind::Lightweight,
        }
    }

    pub fn custom<F>(from: u32, to: u32, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        Self {
            from,
            to,
            kind: StageKind::Custom(Arc::new(transform)),
        }
    }

    /// Transform one record from `from` to `target`, then check it against
    /// the target shape.
    pub fn apply(&self, record: Value, target: &Schema) -> Result<Value, String> {
        let migrated = match &self.kind {
            StageKind::Lightweight => conform(record, target)?,
            StageKind::Custom(transform) => transform(record).map_err(|e| e.to_string())?,
        };
        target.check(&migrated)?;
        Ok(migrated)
    }
}

fn conform(record: Value, target: &Schema) -> Result<Value, String> {
    let Value::Object(obj) = record else {
        return Err("record is not a JSON object".to_string());
    };

    let mut out = Map::new();
    for (key, value) in obj {
        if target.field(&key).is_some() {
            out.insert(key, value);
        }
    }
    for field in &target.fields {
        if out.contains_key(field.name) {
            continue;
        }
        match &field.default {
            Some(default) => {
                out.insert(field.name.to_string(), default.clone());
            }
            None => {
                return Err(format!(
                    "field `{}` is new in v{} but has no default",
                    field.name, target.version
                ));
            }
        }
    }
    Ok(Value::Object(out))
}

/// Declared schemas in ascending version order plus the stages between them.
#[derive(Debug, Clone)]
pub struct SchemaChain {
    schemas: Vec<Schema>,
    stages: Vec<MigrationStage>,
}

impl SchemaChain {
    /// Validate and build a chain. Stage i must lead from the i-th declared
    /// version to the next one.
    pub fn new(
        schemas: Vec<Schema>,
        stages: Vec<MigrationStage>,
    ) -> Result<Self, MigrationChainError> {
        if schemas.is_empty() {
            return Err(MigrationChainError::Empty);
        }
        for pair in schemas.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(MigrationChainError::Unordered {
                    prev: pair[0].version,
                    next: pair[1].version,
                });
            }
        }

        let mut ordered = Vec::with_capacity(schemas.len() - 1);
        for pair in schemas.windows(2) {
            let (from, to) = (pair[0].version, pair[1].version);
            let stage = stages
                .iter()
                .find(|s| s.from == from && s.to == to)
                .ok_or(MigrationChainError::Gap { from, to })?;
            ordered.push(stage.clone());
        }
        if let Some(stray) = stages
            .iter()
            .find(|s| !ordered.iter().any(|o| o.from == s.from && o.to == s.to))
        {
            return Err(MigrationChainError::StrayStage {
                from: stray.from,
                to: stray.to,
            });
        }
        for (i, stage) in stages.iter().enumerate() {
            // A link declared twice.
            if stages[..i].iter().any(|s| s.from == stage.from && s.to == stage.to) {
                return Err(MigrationChainError::StrayStage {
                    from: stage.from,
                    to: stage.to,
                });
            }
        }

        Ok(Self {
            schemas,
            stages: ordered,
        })
    }

    pub fn latest(&self) -> &Schema {
        // Non-empty by construction.
        &self.schemas[self.schemas.len() - 1]
    }

    pub fn schema(&self, version: u32) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.version == version)
    }

    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }

    /// The stages still to run for a file tagged with `version`, in order.
    pub fn pending_stages(&self, version: u32) -> Result<&[MigrationStage], MigrationChainError> {
        let latest = self.latest().version;
        if version > latest {
            return Err(MigrationChainError::NewerOnDisk {
                found: version,
                latest,
            });
        }
        let index = self
            .schemas
            .iter()
            .position(|s| s.version == version)
            .ok_or(MigrationChainError::UnknownVersion(version))?;
        self.stages
            .get(index..)
            .ok_or(MigrationChainError::UnknownVersion(version))
    }
}

/// v1: id, title, cast.
pub fn movie_schema_v1() -> Schema {
    Schema::new(
        1,
        vec![
            FieldDef::required("id"),
            FieldDef::required("title"),
            FieldDef::required("cast"),
        ],
    )
}

/// v2 adds `favorite`, defaulting to false.
pub fn movie_schema_v2() -> Schema {
    Schema::new(
        2,
        vec![
            FieldDef::required("id"),
            FieldDef::required("title"),
            FieldDef::required("cast"),
            FieldDef::with_default("favorite", json!(false)),
        ],
    )
}

/// The chain the catalog ships with, validated like any other chain.
pub fn movie_schema_chain() -> Result<SchemaChain, MigrationChainError> {
    SchemaChain::new(
        vec![movie_schema_v1(), movie_schema_v2()],
        vec![MigrationStage::lightweight(1, 2)],
    )
}
