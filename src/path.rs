use std::fmt;

/// A dotted property reference split into the relation path leading to an
/// entity and the property on that entity. `"movies.category.name"` becomes
/// relation `["movies", "category"]` and property `"name"`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PropertyPath {
    relation: Vec<String>,
    property: String,
}

impl PropertyPath {
    pub fn new(relation: Vec<String>, property: impl Into<String>) -> Self {
        Self {
            relation,
            property: property.into(),
        }
    }

    pub fn relation(&self) -> &[String] {
        &self.relation
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    /// Dotted relation path, empty for root properties.
    pub fn relation_path(&self) -> String {
        self.relation.join(".")
    }

    pub fn is_root(&self) -> bool {
        self.relation.is_empty()
    }
}

impl From<&str> for PropertyPath {
    fn from(value: &str) -> Self {
        match value.rsplit_once('.') {
            Some((relation, property)) => Self {
                relation: relation.split('.').map(str::to_string).collect(),
                property: property.to_string(),
            },
            None => Self {
                relation: Vec::new(),
                property: value.to_string(),
            },
        }
    }
}

impl From<String> for PropertyPath {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.relation {
            write!(f, "{segment}.")?;
        }
        f.write_str(&self.property)
    }
}
