//! Routing rules distributed through the coordination service.
//!
//! Every child of `{root}/{cluster}/rule` holds one JSON [`Rule`]. The
//! [`RuleWatcher`] keeps a [`DataTypeSelector`] mapped from each declared
//! data type to the processor of the rule declaring it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use relay_coordination::{ChildData, ClusterPaths, CoordinationClient, WatchEvent, WatchStream};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::processor::DataTypeSelector;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A data type a rule consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// Data type of the events the rule reads.
    pub data_type: String,
    /// Field names and their declared types.
    #[serde(default)]
    pub field_map: serde_json::Map<String, serde_json::Value>,
}

/// A rule as stored under the rule path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Unique id of the rule.
    pub statement_id: String,
    /// Name of the processor that runs the rule.
    pub processor_type: String,
    /// Rule text, opaque to the router.
    #[serde(default)]
    pub statement: String,
    /// Data types the rule consumes.
    #[serde(default)]
    pub definitions: Vec<Definition>,
}

impl Rule {
    /// Decode a rule from its stored JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRule`] if `data` is not a rule.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::InvalidRule(e.to_string()))
    }

    /// Encode the rule for storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRule`] if serialization fails.
    pub fn to_json(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::InvalidRule(e.to_string()))
    }
}

/// `(data type, processor)` pairs declared by `rules`.
///
/// When two rules declare the same data type the later one wins.
#[must_use]
pub fn mappings(rules: &[Rule]) -> Vec<(String, String)> {
    rules
        .iter()
        .flat_map(|rule| {
            rule.definitions
                .iter()
                .map(|definition| (definition.data_type.clone(), rule.processor_type.clone()))
        })
        .collect()
}

fn decode(children: &[ChildData]) -> Vec<Rule> {
    children
        .iter()
        .filter_map(|child| match Rule::from_json(&child.data) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!("Skipping undecodable rule {}: {}", child.path, e);
                None
            }
        })
        .collect()
}

struct Shared<C> {
    client: C,
    path: String,
    selector: Arc<DataTypeSelector>,
}

impl<C> Shared<C>
where
    C: CoordinationClient,
{
    async fn reload(&self) -> Result<usize> {
        let children = self
            .client
            .get_children(&self.path)
            .await
            .map_err(Error::coordination)?;
        let rules = decode(&children);
        self.selector.set_mappings(mappings(&rules));
        debug!("Loaded {} rules from {}", rules.len(), self.path);
        Ok(rules.len())
    }
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps a [`DataTypeSelector`] in step with the rules of one cluster.
pub struct RuleWatcher<C>
where
    C: CoordinationClient,
{
    shared: Arc<Shared<C>>,
    task: Mutex<Option<WatchTask>>,
}

impl<C> RuleWatcher<C>
where
    C: CoordinationClient,
{
    /// Watcher feeding `selector` from the rule path of `paths`.
    pub fn new(client: C, paths: &ClusterPaths, selector: Arc<DataTypeSelector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                path: paths.rule(),
                selector,
            }),
            task: Mutex::new(None),
        }
    }

    /// Load the current rules and start following changes.
    ///
    /// # Errors
    ///
    /// Returns an error if already started or if the coordination service fails.
    pub async fn start(&self) -> Result<()> {
        if self.task.lock().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let shared = &self.shared;
        shared
            .client
            .create_persistent(&shared.path, Bytes::new())
            .await
            .map_err(Error::coordination)?;
        let events = shared
            .client
            .watch_children(&shared.path)
            .await
            .map_err(Error::coordination)?;
        let count = shared.reload().await?;
        info!("Following {} with {} rules", shared.path, count);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_loop(Arc::clone(shared), events, cancel.clone()));
        *self.task.lock() = Some(WatchTask { cancel, handle });
        Ok(())
    }

    /// Stop following changes and clear the selector.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(WatchTask { cancel, handle }) = task {
            cancel.cancel();
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Rule watch task completed"),
                Ok(Err(e)) => warn!("Rule watch task failed: {}", e),
                Err(_) => warn!("Rule watch task timed out"),
            }
        }
        self.shared.selector.set_mappings(Vec::<(String, String)>::new());
    }

    /// Whether the watch task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl<C> Drop for RuleWatcher<C>
where
    C: CoordinationClient,
{
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
        }
    }
}

async fn watch_loop<C>(shared: Arc<Shared<C>>, mut events: WatchStream, cancel: CancellationToken)
where
    C: CoordinationClient,
{
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };

        let Some(event) = event else {
            warn!("Rule watch on {} ended", shared.path);
            break;
        };
        debug!("Rule event: {:?}", event);

        if event == WatchEvent::Suspended {
            warn!("Coordination connection suspended; rules may be stale");
            continue;
        }

        if let Err(e) = shared.reload().await {
            error!("Failed to reload rules: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_shape() {
        let rule = Rule::from_json(
            br#"{
                "statementId": "rule1",
                "processorType": "cep",
                "statement": "select count(*) from Apple1",
                "definitions": [{"dataType": "Apple1", "fieldMap": {"price": "int"}}]
            }"#,
        )
        .unwrap();

        assert_eq!(rule.statement_id, "rule1");
        assert_eq!(rule.definitions[0].data_type, "Apple1");
        assert_eq!(rule.definitions[0].field_map["price"], "int");
        assert_eq!(Rule::from_json(&rule.to_json().unwrap()).unwrap(), rule);
    }

    #[test]
    fn test_minimal_rule_and_garbage() {
        let rule = Rule::from_json(br#"{"statementId": "r", "processorType": "p"}"#).unwrap();
        assert!(rule.definitions.is_empty());
        assert!(matches!(
            Rule::from_json(b"not a rule"),
            Err(Error::InvalidRule(_))
        ));
    }

    #[test]
    fn test_mappings_later_rule_wins() {
        let rule = |id: &str, processor: &str, types: &[&str]| Rule {
            statement_id: id.to_string(),
            processor_type: processor.to_string(),
            statement: String::new(),
            definitions: types
                .iter()
                .map(|data_type| Definition {
                    data_type: (*data_type).to_string(),
                    field_map: serde_json::Map::new(),
                })
                .collect(),
        };

        let pairs = mappings(&[rule("a", "cep", &["x", "y"]), rule("b", "outlier", &["y"])]);
        let selector = DataTypeSelector::new();
        selector.set_mappings(pairs);

        assert_eq!(selector.get("x").as_deref(), Some("cep"));
        assert_eq!(selector.get("y").as_deref(), Some("outlier"));
    }
}
