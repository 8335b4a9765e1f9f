//! Result model and incremental result delivery.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{CacheValue, CycleId};
use crate::graph::NodeId;
use crate::value::ValueSpecification;

/// A piece of a cycle's results, delivered as soon as it is available.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultFragment {
    /// Market data loaded into a configuration's cache.
    MarketData {
        /// Calculation configuration name.
        configuration: String,
        /// Loaded values, sentinels included.
        values: Vec<(ValueSpecification, CacheValue)>,
    },
    /// Terminal outputs of one node became available.
    Computed {
        /// Calculation configuration name.
        configuration: String,
        /// The producing node.
        node: NodeId,
        /// Terminal outputs of the node.
        values: Vec<(ValueSpecification, CacheValue)>,
    },
}

/// Terminal results of a cycle, with timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultModel {
    cycle: CycleId,
    view: String,
    started_at: SystemTime,
    completed_at: Option<SystemTime>,
    duration: Option<Duration>,
    market_data: BTreeMap<ValueSpecification, CacheValue>,
    values: BTreeMap<String, BTreeMap<ValueSpecification, CacheValue>>,
}

impl ResultModel {
    pub(crate) fn new(cycle: CycleId, view: impl Into<String>) -> Self {
        Self {
            cycle,
            view: view.into(),
            started_at: SystemTime::now(),
            completed_at: None,
            duration: None,
            market_data: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    pub(crate) fn apply(&mut self, fragment: &ResultFragment) {
        match fragment {
            ResultFragment::MarketData { values, .. } => {
                self.market_data.extend(values.iter().cloned());
            }
            ResultFragment::Computed {
                configuration,
                values,
                ..
            } => {
                self.values
                    .entry(configuration.clone())
                    .or_default()
                    .extend(values.iter().cloned());
            }
        }
    }

    pub(crate) fn complete(&mut self) {
        let now = SystemTime::now();
        self.duration = Some(now.duration_since(self.started_at).unwrap_or_default());
        self.completed_at = Some(now);
    }

    /// The cycle these results belong to.
    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    /// Name of the view.
    pub fn view_name(&self) -> &str {
        &self.view
    }

    /// When the cycle was created.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// When the cycle finished, once post-execution has run.
    pub fn completed_at(&self) -> Option<SystemTime> {
        self.completed_at
    }

    /// Wall-clock duration, once post-execution has run.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Returns `true` once post-execution has run.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Market data loaded across all configurations.
    pub fn market_data(&self) -> &BTreeMap<ValueSpecification, CacheValue> {
        &self.market_data
    }

    /// Configurations with at least one terminal value.
    pub fn configurations(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Terminal values of `configuration`.
    pub fn values(&self, configuration: &str) -> Option<&BTreeMap<ValueSpecification, CacheValue>> {
        self.values.get(configuration)
    }

    /// One terminal value.
    pub fn value(&self, configuration: &str, spec: &ValueSpecification) -> Option<&CacheValue> {
        self.values.get(configuration)?.get(spec)
    }
}

/// Receives results as a cycle progresses.
///
/// Called from the cycle's result-streaming thread. A panicking listener is
/// logged and otherwise ignored.
pub trait ResultListener: Send + Sync {
    /// A fragment of results is available.
    fn fragment(&self, cycle: CycleId, fragment: &ResultFragment);

    /// The cycle finished and its result model is final.
    #[inline]
    fn completed(&self, _cycle: CycleId, _model: &ResultModel) {}
}

/// A notification delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEvent {
    /// See [`ResultListener::fragment`].
    Fragment {
        /// Cycle id.
        cycle: CycleId,
        /// The fragment.
        fragment: ResultFragment,
    },
    /// See [`ResultListener::completed`].
    Completed {
        /// Cycle id.
        cycle: CycleId,
        /// The final model.
        model: ResultModel,
    },
}

/// Forwards notifications to a channel.
///
/// # Example
///
/// ```ignore
/// let (listener, events) = ChannelResultListener::new();
/// let cycle = SingleComputationCycle::new(id, view, engine, snapshot)
///     .with_listener(Arc::new(listener));
/// thread::spawn(move || for event in events { render(event) });
/// ```
pub struct ChannelResultListener {
    sender: Mutex<Sender<ResultEvent>>,
}

impl ChannelResultListener {
    /// Create a listener and the receiving end of its channel.
    pub fn new() -> (Self, Receiver<ResultEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }

    fn send(&self, event: ResultEvent) {
        if self.sender.lock().send(event).is_err() {
            debug!("result receiver dropped");
        }
    }
}

impl ResultListener for ChannelResultListener {
    fn fragment(&self, cycle: CycleId, fragment: &ResultFragment) {
        self.send(ResultEvent::Fragment {
            cycle,
            fragment: fragment.clone(),
        });
    }

    fn completed(&self, cycle: CycleId, model: &ResultModel) {
        self.send(ResultEvent::Completed {
            cycle,
            model: model.clone(),
        });
    }
}

/// Accumulates notifications for later inspection.
#[derive(Debug, Default)]
pub struct ResultCollector {
    events: Mutex<Vec<ResultEvent>>,
}

impl ResultCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected events.
    pub fn events(&self) -> Vec<ResultEvent> {
        self.events.lock().clone()
    }

    /// Collected fragments, in arrival order.
    pub fn fragments(&self) -> Vec<ResultFragment> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ResultEvent::Fragment { fragment, .. } => Some(fragment.clone()),
                ResultEvent::Completed { .. } => None,
            })
            .collect()
    }

    /// Final models of completed cycles.
    pub fn completed_models(&self) -> Vec<ResultModel> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ResultEvent::Completed { model, .. } => Some(model.clone()),
                ResultEvent::Fragment { .. } => None,
            })
            .collect()
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Take collected events, clearing the collector.
    pub fn take(&self) -> Vec<ResultEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of collected events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if no events have been collected.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl ResultListener for ResultCollector {
    fn fragment(&self, cycle: CycleId, fragment: &ResultFragment) {
        self.events.lock().push(ResultEvent::Fragment {
            cycle,
            fragment: fragment.clone(),
        });
    }

    fn completed(&self, cycle: CycleId, model: &ResultModel) {
        self.events.lock().push(ResultEvent::Completed {
            cycle,
            model: model.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NotCalculated;
    use crate::value::{TargetSpec, Value, ValueProperties};

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, TargetSpec::new("SECURITY", "T"), ValueProperties::none())
    }

    #[test]
    fn test_model_accumulates_fragments() {
        let mut model = ResultModel::new(CycleId(1), "View");
        model.apply(&ResultFragment::MarketData {
            configuration: "Default".into(),
            values: vec![(spec("MarketRate"), NotCalculated::MissingMarketData.into())],
        });
        model.apply(&ResultFragment::Computed {
            configuration: "Default".into(),
            node: NodeId(0),
            values: vec![(spec("PV"), CacheValue::Value(Value::new(1.5_f64)))],
        });
        assert!(!model.is_complete());
        model.complete();
        assert!(model.is_complete());
        assert!(model.duration().is_some());
        assert_eq!(model.market_data().len(), 1);
        assert_eq!(
            model.value("Default", &spec("PV")),
            Some(&CacheValue::Value(Value::new(1.5_f64)))
        );
        assert_eq!(model.configurations().collect::<Vec<_>>(), vec!["Default"]);
    }

    #[test]
    fn test_channel_listener_forwards() {
        let (listener, events) = ChannelResultListener::new();
        let fragment = ResultFragment::MarketData {
            configuration: "Default".into(),
            values: vec![],
        };
        listener.fragment(CycleId(7), &fragment);
        assert_eq!(
            events.try_recv().unwrap(),
            ResultEvent::Fragment {
                cycle: CycleId(7),
                fragment
            }
        );
    }

    #[test]
    fn test_collector_take_clears() {
        let collector = ResultCollector::new();
        collector.completed(CycleId(1), &ResultModel::new(CycleId(1), "View"));
        assert_eq!(collector.completed_models().len(), 1);
        assert_eq!(collector.take().len(), 1);
        assert!(collector.is_empty());
    }
}
