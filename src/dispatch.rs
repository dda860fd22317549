use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::query::GremlinQuery;
use crate::record::Record;

pub type Augment = Arc<dyn Fn(&Record, GremlinQuery) -> GremlinQuery + Send + Sync>;

/// Per-label hooks that extend a base write query. Labels without a hook pass
/// the query through unchanged.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Augment>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels: Vec<&String> = self.handlers.keys().collect();
        labels.sort();
        f.debug_struct("Dispatcher").field("labels", &labels).finish()
    }
}

impl Dispatcher {
    pub fn register(
        &mut self,
        label: impl Into<String>,
        handler: impl Fn(&Record, GremlinQuery) -> GremlinQuery + Send + Sync + 'static,
    ) {
        self.handlers.insert(label.into(), Arc::new(handler));
    }

    /// Builds property-copy hooks: for each label, `{property: field}` sets
    /// `property` to the record's `field` when that field is non-empty.
    pub fn from_property_map(config: &BTreeMap<String, BTreeMap<String, String>>) -> Self {
        let mut dispatcher = Dispatcher::default();
        for (label, properties) in config {
            let properties: Vec<(String, String)> = properties
                .iter()
                .map(|(property, field)| (property.clone(), field.clone()))
                .collect();
            dispatcher.register(label.clone(), move |record, mut query| {
                for (property, field) in &properties {
                    let value = record.get(field);
                    if !value.is_empty() {
                        query = query.property(property, value);
                    }
                }
                query
            });
        }
        dispatcher
    }

    pub fn apply(&self, record: &Record, base: GremlinQuery) -> GremlinQuery {
        match self.handlers.get(record.get("label")) {
            Some(handler) => handler(record, base),
            None => base,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
