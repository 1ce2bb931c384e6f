//! Control-side channel selector node.
//!
//! [`ChannelSelector`] is what applications hold. It tracks the lifecycle,
//! owns the requested parameter values and forwards writes to the render-side
//! [`ChannelSelectorUnit`] through a lock-free queue once the unit exists.
//!
//! ```
//! use std::time::Duration;
//! use kanalwahl::{ChannelSelector, InProcessProvider, NodeState, ParameterObservationHub, Settings};
//!
//! let hub = ParameterObservationHub::new();
//! let mut selector = ChannelSelector::new(&Settings::default(), 0.0, &InProcessProvider, &hub).unwrap();
//!
//! // writes before the unit arrives are kept and replayed
//! selector.set_channel_source(-1.0).unwrap();
//!
//! assert!(selector.wait_until_ready(Duration::from_secs(5)));
//! assert_eq!(selector.channel_source(), -1.0);
//!
//! selector.start().unwrap();
//! assert_eq!(selector.state(), NodeState::Started);
//! ```

use std::sync::Arc;
use std::time::Duration;

use rtrb::Producer;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::Settings;
use crate::dsp::{CHANNEL_SOURCE, CHANNEL_SOURCE_INFO};
use crate::node::NodeId;
use crate::observe::{Notifier, ObserverToken, ParameterChange, ParameterObservationHub};
use crate::param::{Parameter, ParameterAddress, ParameterError, ParameterTree};
use crate::unit::{
    Acquisition, ChannelSelectorUnit, ComponentDescription, PendingUnit, SelectorMessage,
    StreamFormat, UnitProvider, UnitStatus, REQUIRED_CHANNELS,
};

/// Lifecycle of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    /// Waiting for the processing unit
    Instantiating,
    /// Unit acquired, not processing
    Ready,
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("channel selector needs {expected} channels, configuration offers {actual}")]
    InvalidChannelCount { expected: u16, actual: u16 },

    #[error("node is {0:?}, operation needs an acquired processing unit")]
    NotReady(NodeState),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("control queue of node {0:?} is full")]
    QueueFull(NodeId),

    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
}

/// Where the render half currently lives.
enum Backing {
    /// Waiting on the provider. `pending` is gone once acquisition failed.
    Acquiring {
        pending: Option<PendingUnit>,
        writes: Vec<SelectorMessage>,
    },
    /// Acquired, not in any graph yet
    Detached(ChannelSelectorUnit),
    /// Owned by a graph, reachable through its queue
    Attached(Producer<SelectorMessage>),
}

/// Routes the selected input channel(s), in equal part, to both outputs.
///
/// - channel source -1: `[L, R]` in, `[L, L]` out
/// - channel source 0: `[L, R]` in, `[(L+R)/2, (L+R)/2]` out
/// - channel source 1: `[L, R]` in, `[R, R]` out
pub struct ChannelSelector {
    id: NodeId,
    state: NodeState,
    format: StreamFormat,
    parameters: ParameterTree,
    ramp_duration: f64,
    backing: Backing,
    status: Option<Arc<UnitStatus>>,
    notifier: Option<Notifier>,
    hub: ParameterObservationHub,
    token: Option<ObserverToken>,
    input: Option<NodeId>,
}

impl ChannelSelector {
    /// Create a node and start acquiring its processing unit.
    ///
    /// Fails if `settings` doesn't describe a stereo stream. Otherwise the node
    /// comes back `Instantiating` (or already `Ready` if the provider was quick).
    pub fn new(
        settings: &Settings,
        channel_source: f64,
        provider: &dyn UnitProvider,
        hub: &ParameterObservationHub,
    ) -> Result<Self, NodeError> {
        let format = settings.stream_format();
        if format.channels != REQUIRED_CHANNELS {
            error!(channels = format.channels, "rejecting channel selector configuration");
            return Err(NodeError::InvalidChannelCount {
                expected: REQUIRED_CHANNELS,
                actual: format.channels,
            });
        }

        let id = NodeId::next();
        let mut node = Self {
            id,
            state: NodeState::Uninitialized,
            format,
            parameters: ParameterTree::new(vec![Parameter::new(CHANNEL_SOURCE_INFO)]),
            ramp_duration: 0.0,
            backing: Backing::Acquiring {
                pending: None,
                writes: Vec::new(),
            },
            status: None,
            notifier: Some(hub.channel(id, settings.notification_queue_size)),
            hub: hub.clone(),
            token: Some(hub.subscribe(id, move |change: ParameterChange| {
                trace!(node = ?id, ?change, "parameter changed");
            })),
            input: None,
        };

        node.transition(NodeState::Instantiating);
        let pending = provider.instantiate(ComponentDescription::CHANNEL_SELECTOR, format);
        if let Backing::Acquiring { pending: slot, .. } = &mut node.backing {
            *slot = Some(pending);
        }

        node.set_ramp_duration(settings.ramp_duration)?;
        node.set_immediate(CHANNEL_SOURCE, channel_source)?;
        node.poll();
        Ok(node)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.state == NodeState::Started
    }

    /// Whether the processing unit has been acquired.
    #[inline]
    pub fn is_ready(&self) -> bool {
        !matches!(self.state, NodeState::Uninitialized | NodeState::Instantiating)
    }

    /// Upstream node feeding this one, if connected
    #[inline]
    pub fn input(&self) -> Option<NodeId> {
        self.input
    }

    /// Output may be written over the input buffers.
    #[inline]
    pub fn can_process_in_place(&self) -> bool {
        true
    }

    #[inline]
    pub fn channel_count(&self) -> u16 {
        REQUIRED_CHANNELS
    }

    #[inline]
    pub fn token(&self) -> Option<ObserverToken> {
        self.token
    }

    /// Values most recently requested through this node.
    pub fn parameters(&self) -> &ParameterTree {
        &self.parameters
    }

    /// Current effective value of a parameter.
    ///
    /// Once the unit exists this is what the render context last published
    /// (mid-ramp values included); before that it's the requested value.
    pub fn parameter_value(&self, address: ParameterAddress) -> Option<f64> {
        match &self.status {
            Some(status) => status.value(address),
            None => self.parameters.get(address).map(Parameter::value),
        }
    }

    pub fn channel_source(&self) -> f64 {
        self.parameter_value(CHANNEL_SOURCE)
            .unwrap_or(CHANNEL_SOURCE_INFO.default)
    }

    /// How many blocks the DSP has rendered (bypassed blocks don't count).
    pub fn rendered_blocks(&self) -> u64 {
        self.status.as_ref().map_or(0, |s| s.rendered_blocks())
    }

    #[inline]
    pub fn ramp_duration(&self) -> f64 {
        self.ramp_duration
    }

    /// Check whether the processing unit has arrived.
    pub fn poll(&mut self) -> NodeState {
        let outcome = match &self.backing {
            Backing::Acquiring { pending: Some(pending), .. } => pending.poll(),
            _ => return self.state,
        };
        self.resolve(outcome);
        self.state
    }

    /// Block until the unit arrives or `timeout` passes.
    ///
    /// A failed acquisition is never retried, so callers use this to notice
    /// nodes stuck in `Instantiating`.
    pub fn wait_until_ready(&mut self, timeout: Duration) -> bool {
        let outcome = match &self.backing {
            Backing::Acquiring { pending: Some(pending), .. } => pending.wait(timeout),
            _ => return self.is_ready(),
        };
        self.resolve(outcome);
        self.is_ready()
    }

    fn resolve(&mut self, outcome: Acquisition) {
        let mut unit = match outcome {
            Acquisition::Pending => return,
            Acquisition::Ready(unit) => unit,
            Acquisition::Failed(err) => {
                error!(node = ?self.id, %err, "processing unit acquisition failed, node stays instantiating");
                if let Backing::Acquiring { pending, .. } = &mut self.backing {
                    *pending = None;
                }
                return;
            }
        };

        if unit.channel_count() != self.format.channels {
            error!(
                node = ?self.id,
                unit = unit.channel_count(),
                format = self.format.channels,
                "processing unit channel count doesn't match the stream"
            );
            if let Backing::Acquiring { pending, .. } = &mut self.backing {
                *pending = None;
            }
            return;
        }

        let writes = match &mut self.backing {
            Backing::Acquiring { writes, .. } => std::mem::take(writes),
            _ => return,
        };

        if let Some(notifier) = self.notifier.take() {
            unit.set_notifier(notifier);
        }
        unit.apply(SelectorMessage::SetToken(self.token));
        let replayed = writes.len();
        for msg in writes {
            unit.apply(msg);
        }

        self.status = Some(unit.status());
        self.backing = Backing::Detached(unit);
        self.transition(NodeState::Ready);
        info!(node = ?self.id, replayed, "processing unit ready");
    }

    fn transition(&mut self, next: NodeState) {
        debug!(node = ?self.id, from = ?self.state, to = ?next, "state change");
        self.state = next;
    }

    /// Begin rendering. Idempotent while started.
    pub fn start(&mut self) -> Result<(), NodeError> {
        match self.state {
            NodeState::Started => Ok(()),
            NodeState::Ready | NodeState::Stopped => {
                if let Some(status) = &self.status {
                    status.set_started(true);
                }
                self.transition(NodeState::Started);
                Ok(())
            }
            state => {
                warn!(node = ?self.id, ?state, "start before the processing unit is ready");
                Err(NodeError::NotReady(state))
            }
        }
    }

    /// Stop rendering; the unit bypasses from the next block on.
    pub fn stop(&mut self) {
        if self.state != NodeState::Started {
            return;
        }
        if let Some(status) = &self.status {
            status.set_started(false);
        }
        self.transition(NodeState::Stopped);
    }

    fn send(&mut self, msg: SelectorMessage) -> Result<(), NodeError> {
        let id = self.id;
        match &mut self.backing {
            // acquisition failed, nothing will ever replay these
            Backing::Acquiring { pending: None, .. } => Ok(()),
            Backing::Acquiring { writes, .. } => {
                writes.push(msg);
                Ok(())
            }
            Backing::Detached(unit) => {
                unit.apply(msg);
                Ok(())
            }
            Backing::Attached(sender) => sender.push(msg).map_err(|_| {
                warn!(node = ?id, ?msg, "control queue full");
                NodeError::QueueFull(id)
            }),
        }
    }

    /// Fail early if a message couldn't be queued right now.
    fn reserve(&self) -> Result<(), NodeError> {
        match &self.backing {
            Backing::Attached(sender) if sender.is_full() => {
                warn!(node = ?self.id, "control queue full");
                Err(NodeError::QueueFull(self.id))
            }
            _ => Ok(()),
        }
    }

    /// Clamped value a write to `address` would store.
    fn clamped(&self, address: ParameterAddress, value: f64) -> Result<f64, NodeError> {
        let param = self
            .parameters
            .get(address)
            .ok_or(ParameterError::UnknownAddress(address))?;
        if value.is_nan() {
            return Err(ParameterError::NotANumber(param.info().identifier).into());
        }
        Ok(param.info().range.clamp(value))
    }

    /// Record a requested value once the render side has it.
    fn commit(&mut self, address: ParameterAddress, value: f64) {
        if let Some(param) = self.parameters.get_mut(address) {
            param.set_immediate(value);
        }
    }

    /// Write a parameter now, clamped to its range, cancelling any ramp.
    ///
    /// Valid in every state; before the unit exists the write is queued and
    /// replayed in order once it does. A rejected write leaves the requested
    /// value unchanged.
    pub fn set_immediate(&mut self, address: ParameterAddress, value: f64) -> Result<(), NodeError> {
        let value = self.clamped(address, value)?;
        self.send(SelectorMessage::SetImmediate { address, value })?;
        self.commit(address, value);
        Ok(())
    }

    /// Ramp a parameter toward `value` over the node's ramp duration.
    ///
    /// Only ramps while started and subscribed; otherwise it is a
    /// [`set_immediate`](Self::set_immediate).
    pub fn set_ramped(&mut self, address: ParameterAddress, value: f64) -> Result<(), NodeError> {
        if self.state != NodeState::Started || self.token.is_none() {
            return self.set_immediate(address, value);
        }
        let value = self.clamped(address, value)?;
        self.send(SelectorMessage::SetRamped { address, value })?;
        self.commit(address, value);
        Ok(())
    }

    /// Strict, identifier-keyed write used by hosts and automation.
    ///
    /// Out-of-range values are rejected and the previous value kept.
    /// Re-requesting the current value does nothing.
    pub fn set_parameter(&mut self, identifier: &str, value: f64) -> Result<(), NodeError> {
        let param = self
            .parameters
            .by_identifier(identifier)
            .ok_or_else(|| ParameterError::UnknownIdentifier(identifier.to_owned()))?;
        let value = param.validate(value)?;
        if param.value() == value {
            return Ok(());
        }
        let address = param.address();
        self.set_ramped(address, value)
    }

    /// -1 selects left only, 1 right only, 0 both left & right.
    pub fn set_channel_source(&mut self, value: f64) -> Result<(), NodeError> {
        self.set_parameter(CHANNEL_SOURCE_INFO.identifier, value)
    }

    /// Seconds future ramps take. Negative or non-finite values mean immediate.
    pub fn set_ramp_duration(&mut self, seconds: f64) -> Result<(), NodeError> {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        self.send(SelectorMessage::SetRampDuration(seconds))?;
        self.ramp_duration = seconds;
        Ok(())
    }

    /// Replace this node's observer with `listener`.
    ///
    /// On error the previous observer stays registered.
    pub fn subscribe<F>(&mut self, listener: F) -> Result<ObserverToken, NodeError>
    where
        F: FnMut(ParameterChange) + Send + 'static,
    {
        self.reserve()?;
        let token = self.hub.subscribe(self.id, listener);
        self.send(SelectorMessage::SetToken(Some(token)))?;
        self.token = Some(token);
        Ok(token)
    }

    /// Drop the observer; ramped writes fall back to immediate ones.
    pub fn unsubscribe(&mut self) -> Result<(), NodeError> {
        let Some(token) = self.token else {
            return Ok(());
        };
        self.send(SelectorMessage::SetToken(None))?;
        self.hub.unsubscribe(token);
        self.token = None;
        Ok(())
    }

    /// Hand the unit to a graph. `install` adds it and returns its queue.
    pub(crate) fn attach_with<F>(&mut self, install: F) -> Result<(), NodeError>
    where
        F: FnOnce(NodeId, ChannelSelectorUnit) -> Producer<SelectorMessage>,
    {
        let placeholder = Backing::Acquiring {
            pending: None,
            writes: Vec::new(),
        };
        match std::mem::replace(&mut self.backing, placeholder) {
            Backing::Detached(unit) => {
                let sender = install(self.id, unit);
                self.backing = Backing::Attached(sender);
                debug!(node = ?self.id, "attached to graph");
                Ok(())
            }
            attached @ Backing::Attached(_) => {
                self.backing = attached;
                Ok(())
            }
            acquiring => {
                self.backing = acquiring;
                Err(NodeError::NotReady(self.state))
            }
        }
    }

    pub(crate) fn set_input(&mut self, upstream: NodeId) {
        if self.input != Some(upstream) {
            debug!(node = ?self.id, from = ?self.input, to = ?upstream, "input rewired");
        }
        self.input = Some(upstream);
    }
}

impl Drop for ChannelSelector {
    fn drop(&mut self) {
        if let Some(status) = &self.status {
            status.set_started(false);
        }
        self.hub.remove_node(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitFulfiller;
    use std::cell::RefCell;

    /// Provider whose units are handed out by the test.
    #[derive(Default)]
    struct ManualProvider {
        fulfillers: RefCell<Vec<UnitFulfiller>>,
    }

    impl ManualProvider {
        fn complete(&self, format: StreamFormat) {
            let fulfiller = self.fulfillers.borrow_mut().pop().unwrap();
            fulfiller.complete(ChannelSelectorUnit::new(format).unwrap());
        }
    }

    impl UnitProvider for ManualProvider {
        fn instantiate(&self, _component: ComponentDescription, _format: StreamFormat) -> PendingUnit {
            let (fulfiller, pending) = PendingUnit::channel();
            self.fulfillers.borrow_mut().push(fulfiller);
            pending
        }
    }

    fn new_selector(provider: &ManualProvider) -> ChannelSelector {
        ChannelSelector::new(&Settings::default(), 0.0, provider, &ParameterObservationHub::new()).unwrap()
    }

    #[test]
    fn construction_enters_instantiating() {
        let provider = ManualProvider::default();
        let selector = new_selector(&provider);
        assert_eq!(selector.state(), NodeState::Instantiating);
        assert!(!selector.is_ready());
        assert!(selector.token().is_some());
    }

    #[test]
    fn start_requires_unit() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        assert_eq!(
            selector.start(),
            Err(NodeError::NotReady(NodeState::Instantiating))
        );
        assert_eq!(selector.state(), NodeState::Instantiating);
    }

    #[test]
    fn strict_write_rejects_out_of_range() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        selector.set_channel_source(0.5).unwrap();

        let err = selector.set_channel_source(1.5).unwrap_err();
        assert!(matches!(err, NodeError::Parameter(ParameterError::OutOfRange { .. })));
        assert_eq!(selector.channel_source(), 0.5);
    }

    #[test]
    fn unknown_parameters_are_errors() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        assert_eq!(
            selector.set_parameter("gain", 0.0),
            Err(NodeError::Parameter(ParameterError::UnknownIdentifier("gain".into())))
        );
        assert_eq!(
            selector.set_immediate(9, 0.0),
            Err(NodeError::Parameter(ParameterError::UnknownAddress(9)))
        );
    }

    #[test]
    fn nan_is_rejected_everywhere() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        assert!(selector.set_immediate(CHANNEL_SOURCE, f64::NAN).is_err());
        assert!(selector.set_ramped(CHANNEL_SOURCE, f64::NAN).is_err());
        assert!(selector.set_channel_source(f64::NAN).is_err());
    }

    #[test]
    fn immediate_writes_clamp() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        selector.set_immediate(CHANNEL_SOURCE, -4.0).unwrap();
        assert_eq!(selector.channel_source(), -1.0);
    }

    #[test]
    fn buffered_writes_replay_in_order() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);

        selector.set_immediate(CHANNEL_SOURCE, 0.9).unwrap();
        selector.set_ramped(CHANNEL_SOURCE, -0.2).unwrap();
        selector.set_immediate(CHANNEL_SOURCE, 0.5).unwrap();

        provider.complete(selector.format);
        assert_eq!(selector.poll(), NodeState::Ready);
        assert_eq!(selector.channel_source(), 0.5);
    }

    #[test]
    fn failed_acquisition_stays_instantiating() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        drop(provider);

        assert_eq!(selector.poll(), NodeState::Instantiating);
        assert!(!selector.wait_until_ready(Duration::from_millis(10)));
        assert!(selector.start().is_err());
    }

    #[test]
    fn dead_node_stops_buffering() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        drop(provider);
        selector.poll();

        for i in 0..100 {
            selector.set_immediate(CHANNEL_SOURCE, i as f64 / 100.0).unwrap();
        }
        match &selector.backing {
            Backing::Acquiring { pending: None, writes } => assert!(writes.is_empty()),
            _ => panic!("expected a failed acquisition"),
        }
        assert_eq!(selector.channel_source(), 0.99);
    }

    #[test]
    fn stop_outside_started_is_noop() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        selector.stop();
        assert_eq!(selector.state(), NodeState::Instantiating);

        provider.complete(selector.format);
        selector.poll();
        selector.stop();
        assert_eq!(selector.state(), NodeState::Ready);
    }

    #[test]
    fn ramp_duration_is_sanitised() {
        let provider = ManualProvider::default();
        let mut selector = new_selector(&provider);
        selector.set_ramp_duration(-3.0).unwrap();
        assert_eq!(selector.ramp_duration(), 0.0);
        selector.set_ramp_duration(0.05).unwrap();
        assert_eq!(selector.ramp_duration(), 0.05);
    }
}
