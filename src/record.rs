use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DEFAULT_EDGE_LABEL: &str = "connects";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[value(name = "vertices", alias = "vertex")]
    Vertex,
    #[value(name = "edges", alias = "edge")]
    Edge,
}

impl EntityKind {
    pub fn singular(self) -> &'static str {
        match self {
            EntityKind::Vertex => "vertex",
            EntityKind::Edge => "edge",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            EntityKind::Vertex => "vertices",
            EntityKind::Edge => "edges",
        }
    }

    fn identity_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Vertex => &["id"],
            EntityKind::Edge => &["out", "in"],
        }
    }

    fn aliases(self) -> &'static [(&'static str, &'static str)] {
        match self {
            EntityKind::Vertex => &[("ID", "id"), ("Label", "label")],
            EntityKind::Edge => &[
                ("source", "out"),
                ("OutV", "out"),
                ("target", "in"),
                ("InV", "in"),
                ("edge_detail", "label"),
                ("Label", "label"),
            ],
        }
    }
}

/// One input row with uniform, by-name field access. Missing and null-like
/// values read as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, String>,
}

impl Record {
    pub fn from_pairs<'a, 'b>(pairs: impl IntoIterator<Item = (&'a str, &'b str)>) -> Self {
        let mut record = Record::default();
        for (name, value) in pairs {
            record.set(name, value);
        }
        record
    }

    pub fn get(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.fields
            .insert(name.to_string(), normalize_cell(value).to_string());
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &String)> {
        self.fields.iter()
    }

    fn from_json_row(row: &Map<String, Value>) -> Self {
        let mut record = Record::default();
        for (name, value) in row {
            record.set(name, &value_as_string(Some(value)).unwrap_or_default());
        }
        record
    }

    /// Renames the column spellings seen in exported tables to the canonical
    /// field names. Canonical names win when both are present.
    fn canonicalize(mut self, kind: EntityKind) -> Self {
        for (alias, canonical) in kind.aliases() {
            if let Some(value) = self.fields.remove(*alias) {
                if self.get(canonical).is_empty() {
                    self.fields.insert((*canonical).to_string(), value);
                }
            }
        }
        if kind == EntityKind::Edge && self.get("label").is_empty() {
            self.fields
                .insert("label".to_string(), DEFAULT_EDGE_LABEL.to_string());
        }
        self
    }
}

fn normalize_cell(value: &str) -> &str {
    let trimmed = value.trim();
    if ["nan", "none", "null"]
        .iter()
        .any(|marker| trimmed.eq_ignore_ascii_case(marker))
    {
        ""
    } else {
        trimmed
    }
}

pub fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Null) => Some(String::new()),
        _ => None,
    }
}

/// Which fields make up an entity's identity and how they are joined.
///
/// The same projection keys input records and remote rows, so the loader and
/// the uploader always agree about what "already exists" means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProjection {
    kind: EntityKind,
    fields: Vec<String>,
    delimiter: String,
}

impl KeyProjection {
    pub fn new(kind: EntityKind, fields: Vec<String>, delimiter: impl Into<String>) -> Self {
        Self {
            kind,
            fields,
            delimiter: delimiter.into(),
        }
    }

    pub fn default_fields(kind: EntityKind) -> Vec<String> {
        let fields: &[&str] = match kind {
            EntityKind::Vertex => &["id", "label", "entity_type", "entity_category"],
            EntityKind::Edge => &["out", "label", "in"],
        };
        fields.iter().map(|f| f.to_string()).collect()
    }

    pub fn default_for(kind: EntityKind) -> Self {
        Self::new(kind, Self::default_fields(kind), "|")
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The segment of `key` holding `field`, when the projection has it.
    pub fn segment<'k>(&self, key: &'k str, field: &str) -> Option<&'k str> {
        let index = self.fields.iter().position(|f| f == field)?;
        key.split(self.delimiter.as_str()).nth(index)
    }

    /// Rebuilds the key fields of a record from its composite key. `None`
    /// when a value contains the delimiter and the segments no longer line up.
    pub fn record_from_key(&self, key: &str) -> Option<Record> {
        let segments: Vec<&str> = key.split(self.delimiter.as_str()).collect();
        if segments.len() != self.fields.len() {
            return None;
        }
        Some(Record::from_pairs(
            self.fields.iter().map(String::as_str).zip(segments),
        ))
    }

    /// The composite key, or `None` when the identity part is blank.
    pub fn key_for(&self, record: &Record) -> Option<String> {
        self.join(|field| record.get(field).to_string())
    }

    /// The composite key of a projected remote row.
    pub fn key_from_row(&self, row: &Map<String, Value>) -> Option<String> {
        self.join(|field| {
            value_as_string(row.get(field))
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        })
    }

    fn join(&self, lookup: impl Fn(&str) -> String) -> Option<String> {
        let segments: Vec<String> = self.fields.iter().map(|f| lookup(f)).collect();
        let required: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, field)| self.kind.identity_fields().contains(&field.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        let blank = if required.is_empty() {
            segments.iter().all(String::is_empty)
        } else {
            required.iter().any(|idx| segments[*idx].is_empty())
        };
        if blank {
            return None;
        }
        Some(segments.join(&self.delimiter))
    }
}

/// Reads records from a CSV table (by extension) or from JSON Lines objects.
pub fn read_records(path: &Path, kind: EntityKind) -> Result<Vec<Record>> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    let records = if is_csv {
        read_csv_records(path)?
    } else {
        read_jsonl_records(path)?
    };
    Ok(records
        .into_iter()
        .map(|record| record.canonicalize(kind))
        .collect())
}

fn read_csv_records(path: &Path) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open input {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header row of {}", path.display()))?
        .clone();

    let mut records = Vec::new();
    for (row_index, row) in reader.records().enumerate() {
        let row =
            row.with_context(|| format!("invalid CSV in {} at row {}", path.display(), row_index + 2))?;
        let mut record = Record::default();
        for (name, value) in headers.iter().zip(row.iter()) {
            record.set(name, value);
        }
        records.push(record);
    }
    Ok(records)
}

fn read_jsonl_records(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("failed to open input {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (line_index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).with_context(|| {
            format!("invalid JSON in {} at line {}", path.display(), line_index + 1)
        })?;
        let Value::Object(row) = value else {
            bail!(
                "expected a JSON object in {} at line {}",
                path.display(),
                line_index + 1
            );
        };
        records.push(Record::from_json_row(&row));
    }
    Ok(records)
}
