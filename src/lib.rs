//! Kanalwahl - stereo channel selector node with ramped parameter automation
//!
//! Design principles:
//! - The render context only ever sees lock-free queues and atomics
//! - Parameter writes made before the processing unit exists are replayed, not lost
//! - Observers are keyed by token; a new subscription silently retires the old one
//! - One graph per host, at a fixed sample rate

mod node;
mod graph;
mod param;
mod dsp;
mod observe;
mod unit;
mod selector;
mod host;
mod config;
pub mod device;

pub use node::{AudioNode, ProcessContext, NodeId};
pub use param::{Parameter, ParameterAddress, ParameterError, ParameterInfo, ParameterRange, ParameterTree};
pub use dsp::{select, select_block, select_block_in_place, ChannelSelectorDsp, CHANNEL_SOURCE, CHANNEL_SOURCE_INFO, RAMP_INTERVAL};
pub use observe::{Dispatcher, Notifier, ObserverToken, ParameterChange, ParameterObservationHub};
pub use unit::{
    Acquisition, AcquisitionError, ChannelSelectorUnit, ComponentDescription, ComponentKind,
    InProcessProvider, PendingUnit, SelectorMessage, StreamFormat, UnitFulfiller, UnitProvider,
    REQUIRED_CHANNELS,
};
pub use selector::{ChannelSelector, NodeError, NodeState};
pub use host::{Handle, Host};
pub use config::{ConfigError, Settings};
pub use device::{DeviceId, DeviceIdentity};
