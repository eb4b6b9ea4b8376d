use crate::types::TypeSpec;

/// Consumed input to the resolver (§3 "Table Metadata"). Read-only for the
/// resolver's lifetime (§5).
#[derive(Debug, Clone)]
pub struct TableMetadata {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    pub constraints: Vec<Constraint>,
    pub indexes: Vec<Index>,
}

impl TableMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_spec: TypeSpec,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey { references_table: String, references_columns: Vec<String> },
    Unique,
    Check,
}

#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}
