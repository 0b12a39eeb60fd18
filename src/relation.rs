use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Deduplicated tree of relation paths. Each relation appears at most once
/// under a given prefix, no matter how many paths mention it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationExpression {
    children: BTreeMap<String, RelationExpression>,
}

impl RelationExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut expression = Self::new();
        for path in paths {
            expression.insert_path(path.as_ref());
        }
        expression
    }

    /// Inserts a dotted path, reusing existing nodes for shared prefixes.
    /// The empty path (root) is ignored.
    pub fn insert_path(&mut self, path: &str) {
        if path.is_empty() {
            return;
        }
        let mut node = self;
        for segment in path.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    pub fn merge(&mut self, other: RelationExpression) {
        for (name, child) in other.children {
            self.children.entry(name).or_default().merge(child);
        }
    }

    pub fn contains_path<S: AsRef<str>>(&self, segments: &[S]) -> bool {
        let mut node = self;
        for segment in segments {
            match node.children.get(segment.as_ref()) {
                Some(child) => node = child,
                None => return false,
            }
        }
        true
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &RelationExpression)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Every node as a dotted path, parents before children.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, child) in &self.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            out.push(path.clone());
            child.collect_paths(&path, out);
        }
    }

    /// Parses an eager expression such as `[movies.category, parent.[movies, pets]]`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        };
        let mut expression = Self::new();
        parser.skip_ws();
        if parser.peek() == Some(b'[') {
            parser.list(&mut expression)?;
        } else if parser.peek().is_some() {
            parser.item(&mut expression)?;
        }
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expression)
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (name, child)) in self.children.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            child.fmt_child(name, f)?;
        }
        f.write_str("]")
    }

    fn fmt_child(&self, name: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(name)?;
        let mut iter = self.children.iter();
        match (iter.next(), iter.next()) {
            (None, _) => Ok(()),
            (Some((child_name, child)), None) => {
                f.write_str(".")?;
                child.fmt_child(child_name, f)
            }
            _ => {
                f.write_str(".")?;
                self.fmt_node(f)
            }
        }
    }
}

impl fmt::Display for RelationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f)
    }
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, reason: &str) -> Error {
        Error::shape(format!(
            "eager expression `{}`: {} at offset {}",
            self.input, reason, self.pos
        ))
    }

    fn list(&mut self, target: &mut RelationExpression) -> Result<()> {
        // caller checked the opening bracket
        self.pos += 1;
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(());
        }
        loop {
            self.item(target)?;
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    self.skip_ws();
                }
                Some(b']') => {
                    self.pos += 1;
                    return Ok(());
                }
                _ => return Err(self.error("expected `,` or `]`")),
            }
        }
    }

    fn item(&mut self, target: &mut RelationExpression) -> Result<()> {
        let name = self.name()?;
        let child = target.children.entry(name).or_default();
        self.skip_ws();
        if self.peek() == Some(b'.') {
            self.pos += 1;
            self.skip_ws();
            if self.peek() == Some(b'[') {
                self.list(child)?;
            } else {
                self.item(child)?;
            }
        }
        Ok(())
    }

    fn name(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a relation name"));
        }
        Ok(self.input[start..self.pos].to_string())
    }
}
