use serde_json::{Map, Value};

use crate::record::{EntityKind, KeyProjection, Record};

/// Name every page row carries its sort-key value under.
pub const CURSOR_FIELD: &str = "__cursor";

/// A Gremlin script plus its bindings. Values never appear in the script text;
/// each one is bound to a generated `_pN` name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GremlinQuery {
    text: String,
    bindings: Map<String, Value>,
}

impl GremlinQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bindings: Map::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn bindings(&self) -> &Map<String, Value> {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Binds `value` and returns the placeholder to splice into the script.
    pub fn bind(&mut self, value: impl Into<Value>) -> String {
        let name = format!("_p{}", self.bindings.len());
        self.bindings.insert(name.clone(), value.into());
        name
    }

    pub fn push(mut self, fragment: &str) -> Self {
        self.text.push_str(fragment);
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        let key = self.bind(key);
        let value = self.bind(value);
        self.text.push_str(&format!(".property({key}, {value})"));
        self
    }

    #[cfg(test)]
    pub fn binds_str(&self, value: &str) -> bool {
        self.bindings.values().any(|v| v.as_str() == Some(value))
    }
}

fn traversal_source(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Vertex => "g.V()",
        EntityKind::Edge => "g.E()",
    }
}

pub fn count_query(kind: EntityKind) -> GremlinQuery {
    GremlinQuery::new(format!("{}.count()", traversal_source(kind)))
}

fn projection_step(query: &mut GremlinQuery, field: &str) -> String {
    match field {
        "id" => ".by(id())".to_string(),
        "label" => ".by(label())".to_string(),
        "out" => ".by(outV().id())".to_string(),
        "in" => ".by(inV().id())".to_string(),
        other => {
            let name = query.bind(other);
            format!(".by(values({name}).fold().coalesce(unfold(), constant('')))")
        }
    }
}

fn push_projection(query: &mut GremlinQuery, projection: &KeyProjection, cursor_key: Option<&str>) {
    let mut names = Vec::with_capacity(projection.fields().len() + 1);
    for field in projection.fields() {
        names.push(query.bind(field.as_str()));
    }
    if cursor_key.is_some() {
        names.push(query.bind(CURSOR_FIELD));
    }
    query
        .text
        .push_str(&format!(".project({})", names.join(", ")));

    for field in projection.fields() {
        let step = projection_step(query, field);
        query.text.push_str(&step);
    }
    if let Some(key) = cursor_key {
        query.text.push_str(&format!(".by(values({key}))"));
    }
}

/// One keyset page: entities ordered by `sort_key`, strictly after `cursor`
/// when there is one, projecting the composite-key fields plus the sort key.
pub fn page_query(
    projection: &KeyProjection,
    sort_key: &str,
    page_size: usize,
    cursor: Option<&Value>,
) -> GremlinQuery {
    let mut query = GremlinQuery::new(traversal_source(projection.kind()));
    let key = query.bind(sort_key);
    query.text.push_str(&format!(".has({key})"));
    if let Some(cursor) = cursor {
        let value = query.bind(cursor.clone());
        query.text.push_str(&format!(".has({key}, gt({value}))"));
    }
    let limit = query.bind(page_size as u64);
    query
        .text
        .push_str(&format!(".order().by({key}).limit({limit})"));
    push_projection(&mut query, projection, Some(key.as_str()));
    query
}

/// Unordered projection of every entity. The server pages it through
/// continuation tokens.
pub fn scan_query(projection: &KeyProjection) -> GremlinQuery {
    let mut query = GremlinQuery::new(traversal_source(projection.kind()));
    push_projection(&mut query, projection, None);
    query
}

fn is_identity_field(kind: EntityKind, field: &str) -> bool {
    match kind {
        EntityKind::Vertex => matches!(field, "id" | "label"),
        EntityKind::Edge => matches!(field, "out" | "in" | "label"),
    }
}

/// `g.addV(label)` with the id, the sort key and every non-empty key field.
pub fn insert_vertex(record: &Record, projection: &KeyProjection, sort_key: &str) -> GremlinQuery {
    let mut query = GremlinQuery::default();
    let label = query.bind(record.get("label"));
    query.text = format!("g.addV({label})");
    let id = record.get("id");
    let mut query = query.property("id", id).property(sort_key, id);
    for field in projection.fields() {
        if is_identity_field(EntityKind::Vertex, field) || field == sort_key {
            continue;
        }
        let value = record.get(field);
        if !value.is_empty() {
            query = query.property(field, value);
        }
    }
    query
}

/// `g.V(out).addE(label).to(g.V(in))` keyed by `key` under the sort key, with
/// every remaining non-empty field as a property.
pub fn insert_edge(record: &Record, key: &str, sort_key: &str) -> GremlinQuery {
    let mut query = GremlinQuery::default();
    let out = query.bind(record.get("out"));
    let label = query.bind(record.get("label"));
    let inbound = query.bind(record.get("in"));
    query.text = format!("g.V({out}).addE({label}).to(g.V({inbound}))");
    let mut query = query.property(sort_key, key);
    for (field, value) in record.fields() {
        if is_identity_field(EntityKind::Edge, field) || field == sort_key || value.is_empty() {
            continue;
        }
        query = query.property(field, value.as_str());
    }
    query
}

pub fn drop_vertex(record: &Record) -> GremlinQuery {
    let mut query = GremlinQuery::default();
    let id = query.bind(record.get("id"));
    query.text = format!("g.V({id}).drop()");
    query
}

pub fn drop_edge(key: &str, sort_key: &str) -> GremlinQuery {
    let mut query = GremlinQuery::default();
    let name = query.bind(sort_key);
    let value = query.bind(key);
    query.text = format!("g.E().has({name}, {value}).drop()");
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vertex(pairs: &[(&str, &str)]) -> Record {
        Record::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn first_page_has_no_cursor_filter() {
        let projection = KeyProjection::default_for(EntityKind::Vertex);
        let query = page_query(&projection, "graph_id", 500, None);
        assert!(query.text().starts_with("g.V().has(_p0).order().by(_p0).limit(_p1)"));
        assert!(!query.text().contains("gt("));
        assert_eq!(query.binding("_p0"), Some(&json!("graph_id")));
        assert_eq!(query.binding("_p1"), Some(&json!(500)));
        assert!(query.text().contains(".by(id()).by(label())"));
        assert!(query.text().ends_with(".by(values(_p0))"));
        assert!(query.binds_str(CURSOR_FIELD));
        assert!(query.binds_str("entity_category"));
    }

    #[test]
    fn later_pages_filter_strictly_after_cursor() {
        let projection = KeyProjection::default_for(EntityKind::Edge);
        let query = page_query(&projection, "graph_id", 100, Some(&json!("a|knows|b")));
        assert!(query.text().starts_with("g.E().has(_p0).has(_p0, gt(_p1))"));
        assert_eq!(query.binding("_p1"), Some(&json!("a|knows|b")));
        assert!(query.text().contains(".by(outV().id()).by(label()).by(inV().id())"));
    }

    #[test]
    fn scan_projects_without_ordering() {
        let projection = KeyProjection::default_for(EntityKind::Edge);
        let query = scan_query(&projection);
        assert_eq!(
            query.text(),
            "g.E().project(_p0, _p1, _p2).by(outV().id()).by(label()).by(inV().id())"
        );
        assert_eq!(query.binding("_p1"), Some(&json!("label")));
        assert!(!query.binds_str(CURSOR_FIELD));
    }

    #[test]
    fn values_never_reach_the_script_text() {
        let record = vertex(&[
            ("id", "o'brien"),
            ("label", "Person') .drop() //"),
            ("entity_type", "x|y"),
        ]);
        let projection = KeyProjection::default_for(EntityKind::Vertex);
        let query = insert_vertex(&record, &projection, "graph_id");
        assert!(!query.text().contains("o'brien"));
        assert!(!query.text().contains("drop"));
        assert!(query.binds_str("o'brien"));
        assert!(query.binds_str("Person') .drop() //"));
        assert!(query.binds_str("x|y"));
        assert!(!query.binds_str("entity_category"));
    }

    #[test]
    fn edge_insert_copies_extra_fields() {
        let record = vertex(&[
            ("out", "a"),
            ("in", "b"),
            ("label", "knows"),
            ("since", "2019"),
            ("note", ""),
        ]);
        let query = insert_edge(&record, "a|knows|b", "graph_id");
        assert!(query.text().starts_with("g.V(_p0).addE(_p1).to(g.V(_p2))"));
        assert!(query.binds_str("a|knows|b"));
        assert!(query.binds_str("since"));
        assert!(query.binds_str("2019"));
        assert!(!query.binds_str("note"));
    }

    #[test]
    fn drop_queries_bind_identity() {
        let record = vertex(&[("id", "v1")]);
        assert_eq!(drop_vertex(&record).text(), "g.V(_p0).drop()");
        let edge = drop_edge("a|knows|b", "graph_id");
        assert_eq!(edge.text(), "g.E().has(_p0, _p1).drop()");
        assert_eq!(edge.binding("_p1"), Some(&json!("a|knows|b")));
    }
}
