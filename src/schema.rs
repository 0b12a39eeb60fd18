use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

use crate::{Error, Result};

/// How a relation relates its owner to its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BelongsToOne,
    HasOne,
    HasMany,
    ManyToMany,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

impl RelationKind {
    pub fn cardinality(self) -> Cardinality {
        match self {
            RelationKind::BelongsToOne | RelationKind::HasOne => Cardinality::One,
            RelationKind::HasMany | RelationKind::ManyToMany => Cardinality::Many,
        }
    }
}

/// Join table of a many-to-many relation. `from` matches the owner's column,
/// `to` matches the target's column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Through {
    pub table: String,
    pub from: String,
    pub to: String,
}

impl Through {
    pub fn new(table: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub target: String,
    pub kind: RelationKind,
    /// Column on the owner side.
    pub from: String,
    /// Column on the target side.
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub through: Option<Through>,
}

impl Relation {
    pub fn belongs_to_one(
        target: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::direct(RelationKind::BelongsToOne, target, from, to)
    }

    pub fn has_one(target: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::direct(RelationKind::HasOne, target, from, to)
    }

    pub fn has_many(
        target: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::direct(RelationKind::HasMany, target, from, to)
    }

    pub fn many_to_many(
        target: impl Into<String>,
        from: impl Into<String>,
        through: Through,
        to: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            kind: RelationKind::ManyToMany,
            from: from.into(),
            to: to.into(),
            through: Some(through),
        }
    }

    fn direct(
        kind: RelationKind,
        target: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            kind,
            from: from.into(),
            to: to.into(),
            through: None,
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        self.kind.cardinality()
    }
}

fn default_id_column() -> String {
    "id".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Optional allow-list. When empty, any column name is accepted.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Postgres types of columns, e.g. `"id": "bigint"`. String operands
    /// compared against a typed column are cast to its type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub types: BTreeMap<String, String>,
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: default_id_column(),
            columns: Vec::new(),
            types: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn column_type(mut self, column: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.types.insert(column.into(), sql_type.into());
        self
    }

    /// Declared or loaded Postgres type of `column`.
    pub fn type_of(&self, column: &str) -> Option<&str> {
        self.types.get(column).map(String::as_str)
    }

    pub fn relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.is_empty() || self.columns.iter().any(|c| c == column)
    }

    /// Checks that `column` may be referenced on this entity. `path` is the
    /// user-facing property path used in the error.
    pub(crate) fn check_column(&self, column: &str, path: &str) -> Result<()> {
        if column.is_empty() {
            return Err(Error::path(path, "empty property name"));
        }
        if !self.has_column(column) {
            return Err(Error::path(
                path,
                format!("`{}` has no column `{}`", self.name, column),
            ));
        }
        Ok(())
    }
}

/// Read-only model metadata: tables, primary keys and declared relations.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: EntitySchema) -> &mut Self {
        self.entities.insert(entity.name.clone(), Arc::new(entity));
        self
    }

    pub fn with(mut self, entity: EntitySchema) -> Self {
        self.register(entity);
        self
    }

    /// Loads a JSON array of entity descriptors and validates the graph.
    pub fn from_json(input: &str) -> Result<Self> {
        let entities: Vec<EntitySchema> = serde_json::from_str(input)?;
        let mut registry = Self::new();
        for entity in entities {
            registry.register(entity);
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        for entity in self.entities.values() {
            for (column, sql_type) in &entity.types {
                if !is_type_name(sql_type) {
                    return Err(Error::InvalidSchema(format!(
                        "column `{}.{}` has an unusable type `{}`",
                        entity.name, column, sql_type
                    )));
                }
            }
            for (name, relation) in &entity.relations {
                if !self.entities.contains_key(&relation.target) {
                    return Err(Error::InvalidSchema(format!(
                        "relation `{}.{}` targets unknown entity `{}`",
                        entity.name, name, relation.target
                    )));
                }
                match (relation.kind, &relation.through) {
                    (RelationKind::ManyToMany, None) => {
                        return Err(Error::InvalidSchema(format!(
                            "many-to-many relation `{}.{}` needs a `through` table",
                            entity.name, name
                        )));
                    }
                    (RelationKind::ManyToMany, Some(_)) | (_, None) => {}
                    (_, Some(_)) => {
                        return Err(Error::InvalidSchema(format!(
                            "relation `{}.{}` declares `through` but is not many-to-many",
                            entity.name, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fills in column types from the database catalog for every column whose
    /// type is not declared already. Tables that do not exist are skipped.
    pub async fn load_column_types(&mut self, pool: &PgPool) -> Result<()> {
        for entity in self.entities.values_mut() {
            let rows: Vec<(String, String)> = sqlx::query_as(
                "select a.attname::text, format_type(a.atttypid, a.atttypmod) \
                 from pg_attribute a \
                 where a.attrelid = to_regclass($1) and a.attnum > 0 and not a.attisdropped",
            )
            .bind(quote_ident(&entity.table))
            .fetch_all(pool)
            .await?;
            debug!(entity = %entity.name, columns = rows.len(), "loaded column types");
            let entity = Arc::make_mut(entity);
            for (column, sql_type) in rows {
                if is_type_name(&sql_type) {
                    entity.types.entry(column).or_insert(sql_type);
                }
            }
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Result<Arc<EntitySchema>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Looks up `name` on `owner` and returns the relation with its target entity.
    pub fn relation(
        &self,
        owner: &EntitySchema,
        name: &str,
        path: &str,
    ) -> Result<(Relation, Arc<EntitySchema>)> {
        let relation = owner.relations.get(name).ok_or_else(|| {
            Error::path(
                path,
                format!("`{}` has no relation `{}`", owner.name, name),
            )
        })?;
        let target = self.entity(&relation.target)?;
        Ok((relation.clone(), target))
    }

    /// Walks `segments` from `root` and returns the entity reached.
    pub fn walk<S: AsRef<str>>(
        &self,
        root: &Arc<EntitySchema>,
        segments: &[S],
        path: &str,
    ) -> Result<Arc<EntitySchema>> {
        let mut current = root.clone();
        for segment in segments {
            let (_, target) = self.relation(&current, segment.as_ref(), path)?;
            current = target;
        }
        Ok(current)
    }
}

/// Type names are rendered into `cast(.. as <type>)`. Accepts names such as
/// `bigint`, `timestamp(3) with time zone`, `public."Mood"` or `uuid[]`.
/// Parentheses may only hold numeric modifiers.
pub(crate) fn is_type_name(value: &str) -> bool {
    let mut in_modifier = false;
    let mut in_quotes = false;
    let mut seen = false;
    for c in value.chars() {
        match c {
            '"' if !in_modifier => in_quotes = !in_quotes,
            '(' if !in_modifier && !in_quotes => in_modifier = true,
            ')' if in_modifier => in_modifier = false,
            c if in_modifier => {
                if !(c.is_ascii_digit() || c == ',' || c == ' ') {
                    return false;
                }
            }
            c if c.is_alphanumeric() || c == '_' => seen = true,
            ' ' | '.' | '[' | ']' => {}
            _ => return false,
        }
    }
    seen && !in_modifier && !in_quotes
}

pub fn qualified_name(table: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(table), quote_ident(column))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}
