//! Render-side processing unit and its acquisition.
//!
//! A [`ChannelSelectorUnit`] is what actually sits in the audio graph. It is
//! obtained asynchronously from a [`UnitProvider`]: the provider hands back a
//! [`PendingUnit`] immediately and resolves it later from any thread.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use dasp_graph::{Buffer, Input};
use thiserror::Error;
use tracing::error;

use crate::dsp::{ChannelSelectorDsp, CHANNEL_SOURCE};
use crate::node::{AudioNode, ProcessContext};
use crate::observe::{Notifier, ObserverToken};
use crate::param::ParameterAddress;

/// The only channel layout a channel selector accepts
pub const REQUIRED_CHANNELS: u16 = 2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquisitionError {
    #[error("no processing unit available for component {0}")]
    ComponentNotFound(ComponentDescription),

    #[error("processing unit needs {expected} channels, format offers {actual}")]
    ChannelMismatch { expected: u16, actual: u16 },

    #[error("provider went away before resolving the unit")]
    Abandoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Effect,
    Mixer,
}

/// Identifies a kind of processing unit to a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComponentDescription {
    pub kind: ComponentKind,
    pub subtype: [u8; 4],
}

impl ComponentDescription {
    pub const CHANNEL_SELECTOR: Self = Self::effect(*b"chmx");

    pub const fn effect(subtype: [u8; 4]) -> Self {
        Self {
            kind: ComponentKind::Effect,
            subtype,
        }
    }
}

impl fmt::Display for ComponentDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ComponentKind::Effect => "aufx",
            ComponentKind::Mixer => "aumx",
        };
        write!(f, "{}:{}", kind, String::from_utf8_lossy(&self.subtype))
    }
}

/// Stream format offered by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

type UnitResult = Result<ChannelSelectorUnit, AcquisitionError>;

/// Outcome of polling a [`PendingUnit`].
pub enum Acquisition {
    Pending,
    Ready(ChannelSelectorUnit),
    Failed(AcquisitionError),
}

/// A unit that a provider has promised but not yet delivered.
pub struct PendingUnit {
    receiver: Receiver<UnitResult>,
}

/// Resolves a [`PendingUnit`]. Dropping it unresolved abandons the unit.
pub struct UnitFulfiller {
    sender: Sender<UnitResult>,
}

impl PendingUnit {
    pub fn channel() -> (UnitFulfiller, PendingUnit) {
        let (sender, receiver) = channel::bounded(1);
        (UnitFulfiller { sender }, PendingUnit { receiver })
    }

    /// Check without blocking.
    pub fn poll(&self) -> Acquisition {
        match self.receiver.try_recv() {
            Ok(Ok(unit)) => Acquisition::Ready(unit),
            Ok(Err(err)) => Acquisition::Failed(err),
            Err(TryRecvError::Empty) => Acquisition::Pending,
            Err(TryRecvError::Disconnected) => Acquisition::Failed(AcquisitionError::Abandoned),
        }
    }

    /// Block for up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Acquisition {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(unit)) => Acquisition::Ready(unit),
            Ok(Err(err)) => Acquisition::Failed(err),
            Err(RecvTimeoutError::Timeout) => Acquisition::Pending,
            Err(RecvTimeoutError::Disconnected) => Acquisition::Failed(AcquisitionError::Abandoned),
        }
    }
}

impl UnitFulfiller {
    pub fn resolve(self, result: UnitResult) {
        // the node may have been dropped while we were working
        let _ = self.sender.send(result);
    }

    pub fn complete(self, unit: ChannelSelectorUnit) {
        self.resolve(Ok(unit));
    }

    pub fn fail(self, err: AcquisitionError) {
        self.resolve(Err(err));
    }
}

/// Source of processing units.
pub trait UnitProvider {
    /// Begin acquiring a unit for `component` in `format`.
    ///
    /// Must return promptly; the unit arrives through the [`PendingUnit`].
    fn instantiate(&self, component: ComponentDescription, format: StreamFormat) -> PendingUnit;
}

/// Builds units on a short-lived worker thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessProvider;

impl UnitProvider for InProcessProvider {
    fn instantiate(&self, component: ComponentDescription, format: StreamFormat) -> PendingUnit {
        let (fulfiller, pending) = PendingUnit::channel();
        let spawned = thread::Builder::new()
            .name("kanalwahl-instantiate".into())
            .spawn(move || {
                if component == ComponentDescription::CHANNEL_SELECTOR {
                    fulfiller.resolve(ChannelSelectorUnit::new(format));
                } else {
                    fulfiller.fail(AcquisitionError::ComponentNotFound(component));
                }
            });
        if let Err(err) = spawned {
            // the fulfiller went down with the closure, so the node sees Abandoned
            error!(%component, %err, "could not spawn instantiation thread");
        }
        pending
    }
}

/// Control messages for a [`ChannelSelectorUnit`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SelectorMessage {
    SetImmediate { address: ParameterAddress, value: f64 },
    SetRamped { address: ParameterAddress, value: f64 },
    SetRampDuration(f64),
    SetToken(Option<ObserverToken>),
}

/// State the render context publishes for the control context.
#[derive(Debug)]
pub(crate) struct UnitStatus {
    started: AtomicBool,
    channel_source: AtomicU64,
    rendered_blocks: AtomicU64,
}

impl UnitStatus {
    fn new(channel_source: f64) -> Self {
        Self {
            started: AtomicBool::new(false),
            channel_source: AtomicU64::new(channel_source.to_bits()),
            rendered_blocks: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Release);
    }

    #[inline]
    pub fn value(&self, address: ParameterAddress) -> Option<f64> {
        match address {
            CHANNEL_SOURCE => Some(f64::from_bits(self.channel_source.load(Ordering::Relaxed))),
            _ => None,
        }
    }

    #[inline]
    fn publish(&self, address: ParameterAddress, value: f64) {
        if address == CHANNEL_SOURCE {
            self.channel_source.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn rendered_blocks(&self) -> u64 {
        self.rendered_blocks.load(Ordering::Relaxed)
    }
}

/// The render-side half of a channel selector.
///
/// While its node is not started the unit bypasses: input is copied to
/// output unchanged and ramps stay frozen.
pub struct ChannelSelectorUnit {
    dsp: ChannelSelectorDsp,
    status: Arc<UnitStatus>,
    notifier: Option<Notifier>,
    token: Option<ObserverToken>,
    last_notified: f64,
}

impl ChannelSelectorUnit {
    /// Build a unit for `format`. Only stereo formats are accepted.
    pub fn new(format: StreamFormat) -> Result<Self, AcquisitionError> {
        if format.channels != REQUIRED_CHANNELS {
            return Err(AcquisitionError::ChannelMismatch {
                expected: REQUIRED_CHANNELS,
                actual: format.channels,
            });
        }
        let dsp = ChannelSelectorDsp::new(format.sample_rate);
        let value = dsp.channel_source();
        Ok(Self {
            dsp,
            status: Arc::new(UnitStatus::new(value)),
            notifier: None,
            token: None,
            last_notified: value,
        })
    }

    #[inline]
    pub fn channel_count(&self) -> u16 {
        REQUIRED_CHANNELS
    }

    #[inline]
    pub fn channel_source(&self) -> f64 {
        self.dsp.channel_source()
    }

    pub(crate) fn status(&self) -> Arc<UnitStatus> {
        self.status.clone()
    }

    pub(crate) fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }

    /// Apply one control message. Allocation-free.
    pub(crate) fn apply(&mut self, msg: SelectorMessage) {
        match msg {
            SelectorMessage::SetImmediate { address, value } => {
                if let Some(p) = self.dsp.parameters_mut().get_mut(address) {
                    p.set_immediate(value);
                    self.status.publish(address, p.value());
                }
            }
            SelectorMessage::SetRamped { address, value } => {
                if let Some(p) = self.dsp.parameters_mut().get_mut(address) {
                    p.set_ramped(value);
                    self.status.publish(address, p.value());
                }
            }
            SelectorMessage::SetRampDuration(seconds) => {
                self.dsp
                    .parameters_mut()
                    .iter_mut()
                    .for_each(|p| p.set_ramp_duration(seconds));
            }
            SelectorMessage::SetToken(token) => self.token = token,
        }
    }

    fn publish_and_notify(&mut self) {
        let value = self.dsp.channel_source();
        self.status.publish(CHANNEL_SOURCE, value);

        if value == self.last_notified {
            return;
        }
        self.last_notified = value;
        if let (Some(notifier), Some(token)) = (self.notifier.as_mut(), self.token) {
            // dropped changes are fine, the next block publishes again
            notifier.notify(token, CHANNEL_SOURCE, value);
        }
    }
}

impl AudioNode for ChannelSelectorUnit {
    type Message = SelectorMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = SelectorMessage>,
        inputs: &[Input],
        outputs: &mut [Buffer],
    ) {
        for msg in messages {
            self.apply(msg);
        }

        let (out_l, out_r) = match outputs {
            [l, r, ..] => (l, r),
            _ => return,
        };

        let buffers = inputs.first().map_or(&[][..], |input| input.buffers());
        let (in_l, in_r) = match buffers {
            [l, r] => (l, r),
            // unconnected; connect only accepts stereo inputs
            _ => {
                out_l.iter_mut().for_each(|s| *s = 0.0);
                out_r.iter_mut().for_each(|s| *s = 0.0);
                return;
            }
        };

        if !self.status.is_started() {
            out_l.copy_from_slice(in_l);
            out_r.copy_from_slice(in_r);
            return;
        }

        if self.dsp.sample_rate() != ctx.sample_rate {
            self.dsp.set_sample_rate(ctx.sample_rate);
        }
        self.dsp.render(in_l, in_r, out_l, out_r);
        self.status.rendered_blocks.fetch_add(1, Ordering::Relaxed);
        self.publish_and_notify();
    }

    #[inline]
    fn num_inputs(&self) -> usize { REQUIRED_CHANNELS as usize }

    #[inline]
    fn num_outputs(&self) -> usize { REQUIRED_CHANNELS as usize }

    #[inline]
    fn can_process_in_place(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> StreamFormat {
        StreamFormat {
            sample_rate: 48000,
            channels: 2,
        }
    }

    #[test]
    fn rejects_non_stereo_formats() {
        for channels in [1, 3, 6] {
            let format = StreamFormat { channels, ..stereo() };
            assert!(matches!(
                ChannelSelectorUnit::new(format),
                Err(AcquisitionError::ChannelMismatch { expected: 2, actual }) if actual == channels
            ));
        }
    }

    #[test]
    fn reports_render_contract() {
        let unit = ChannelSelectorUnit::new(stereo()).unwrap();
        assert!(unit.can_process_in_place());
        assert_eq!(unit.num_inputs(), 2);
        assert_eq!(unit.num_outputs(), 2);
        assert_eq!(unit.channel_count(), 2);
    }

    #[test]
    fn messages_publish_values() {
        let mut unit = ChannelSelectorUnit::new(stereo()).unwrap();
        let status = unit.status();
        unit.apply(SelectorMessage::SetImmediate {
            address: CHANNEL_SOURCE,
            value: -0.25,
        });
        assert_eq!(status.value(CHANNEL_SOURCE), Some(-0.25));
        assert_eq!(status.value(7), None);

        // unknown addresses are ignored
        unit.apply(SelectorMessage::SetImmediate { address: 7, value: 1.0 });
        assert_eq!(unit.channel_source(), -0.25);
    }

    #[test]
    fn fulfiller_resolves_pending_unit() {
        let (fulfiller, pending) = PendingUnit::channel();
        assert!(matches!(pending.poll(), Acquisition::Pending));
        fulfiller.complete(ChannelSelectorUnit::new(stereo()).unwrap());
        assert!(matches!(pending.poll(), Acquisition::Ready(_)));
    }

    #[test]
    fn dropped_fulfiller_abandons() {
        let (fulfiller, pending) = PendingUnit::channel();
        drop(fulfiller);
        assert!(matches!(
            pending.poll(),
            Acquisition::Failed(AcquisitionError::Abandoned)
        ));
    }

    #[test]
    fn in_process_provider_builds_selector() {
        let pending = InProcessProvider.instantiate(ComponentDescription::CHANNEL_SELECTOR, stereo());
        assert!(matches!(pending.wait(Duration::from_secs(5)), Acquisition::Ready(_)));
    }

    #[test]
    fn in_process_provider_rejects_unknown_components() {
        let other = ComponentDescription::effect(*b"dely");
        let pending = InProcessProvider.instantiate(other, stereo());
        match pending.wait(Duration::from_secs(5)) {
            Acquisition::Failed(AcquisitionError::ComponentNotFound(c)) => assert_eq!(c, other),
            _ => panic!("expected ComponentNotFound"),
        }
    }

    #[test]
    fn component_display() {
        assert_eq!(ComponentDescription::CHANNEL_SELECTOR.to_string(), "aufx:chmx");
    }
}
