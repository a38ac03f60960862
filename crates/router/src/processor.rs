//! Local processing of events and choosing which processor gets them.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::event::Event;

/// Error returned by a [`Processor`].
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Consumes events delivered to this node.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Name selectors refer to this processor by.
    fn name(&self) -> &str;

    /// Handle one event.
    async fn process(&self, event: Event) -> Result<(), ProcessError>;
}

/// Chooses the processor for an event.
pub trait ProcessorSelector: Send + Sync + 'static {
    /// Processor out of `processors` that should handle `event`.
    fn select(&self, event: &Event, processors: &[Arc<dyn Processor>])
    -> Option<Arc<dyn Processor>>;
}

fn find_named(processors: &[Arc<dyn Processor>], name: &str) -> Option<Arc<dyn Processor>> {
    processors
        .iter()
        .find(|processor| processor.name() == name)
        .cloned()
}

/// Maps source names to processor names. The mapping is fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticSourceSelector {
    routes: HashMap<String, String>,
}

impl StaticSourceSelector {
    /// Selector built from `(source name, processor name)` pairs.
    pub fn new<I, S, P>(routes: I) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<String>,
    {
        Self {
            routes: routes
                .into_iter()
                .map(|(source, processor)| (source.into(), processor.into()))
                .collect(),
        }
    }
}

impl ProcessorSelector for StaticSourceSelector {
    fn select(
        &self,
        event: &Event,
        processors: &[Arc<dyn Processor>],
    ) -> Option<Arc<dyn Processor>> {
        let name = self.routes.get(&event.source_name)?;
        find_named(processors, name)
    }
}

/// Maps data types to processor names. The mapping can be replaced while
/// the router is running, for example when routing rules change.
#[derive(Debug, Default)]
pub struct DataTypeSelector {
    routes: RwLock<HashMap<String, String>>,
}

impl DataTypeSelector {
    /// Empty selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole mapping.
    pub fn set_mappings<I, D, P>(&self, routes: I)
    where
        I: IntoIterator<Item = (D, P)>,
        D: Into<String>,
        P: Into<String>,
    {
        let routes: HashMap<String, String> = routes
            .into_iter()
            .map(|(data_type, processor)| (data_type.into(), processor.into()))
            .collect();
        debug!("Data type selector now maps {} types", routes.len());
        *self.routes.write() = routes;
    }

    /// Map `data_type` to `processor`.
    pub fn insert(&self, data_type: impl Into<String>, processor: impl Into<String>) {
        self.routes.write().insert(data_type.into(), processor.into());
    }

    /// Processor mapped to `data_type`.
    #[must_use]
    pub fn get(&self, data_type: &str) -> Option<String> {
        self.routes.read().get(data_type).cloned()
    }

    /// Number of mapped data types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether no data type is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Forget the mapping for `data_type`.
    pub fn remove(&self, data_type: &str) -> Option<String> {
        self.routes.write().remove(data_type)
    }
}

impl ProcessorSelector for DataTypeSelector {
    fn select(
        &self,
        event: &Event,
        processors: &[Arc<dyn Processor>],
    ) -> Option<Arc<dyn Processor>> {
        let name = self.get(&event.data_type)?;
        find_named(processors, &name)
    }
}
