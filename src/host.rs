//! Minimal render host: a graph at a fixed rate plus the plumbing that moves
//! channel selectors into it.

use core::marker::PhantomData;

use dasp_graph::Buffer;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::graph::AudioGraph;
use crate::node::{AudioNode, NodeId};
use crate::selector::{ChannelSelector, NodeError};
use crate::unit::REQUIRED_CHANNELS;

/// A handle for sending messages to a node added with [`Host::add`].
///
/// Messages are buffered in a lock-free ring buffer and processed at the start
/// of each block. If the buffer is full, [`Handle::send`] returns `Err(msg)`
/// with the message that couldn't be sent.
pub struct Handle<M: Send + 'static> {
    pub(crate) node_id: NodeId,
    pub(crate) sender: rtrb::Producer<M>,
    pub(crate) _marker: PhantomData<M>,
}

impl<M: Send + 'static> Handle<M> {
    #[inline]
    pub fn id(&self) -> NodeId {
        self.node_id
    }

    /// Send a message to the node. Lock-free.
    pub fn send(&mut self, msg: M) -> Result<(), M> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }
}

/// Owns the audio graph and drives it one block at a time.
///
/// ```
/// use std::time::Duration;
/// use kanalwahl::{ChannelSelector, Host, InProcessProvider, ParameterObservationHub, Settings};
/// # use kanalwahl::{AudioNode, ProcessContext};
/// # use dasp_graph::{Buffer, Input};
/// # struct Stereo;
/// # impl AudioNode for Stereo {
/// #     type Message = ();
/// #     fn process(&mut self, _: &ProcessContext, _: impl Iterator<Item = ()>, _: &[Input], out: &mut [Buffer]) {
/// #         out[0].iter_mut().for_each(|s| *s = 1.0);
/// #         out[1].iter_mut().for_each(|s| *s = -1.0);
/// #     }
/// #     fn num_outputs(&self) -> usize { 2 }
/// # }
///
/// let settings = Settings::default();
/// let hub = ParameterObservationHub::new();
/// let mut host = Host::new(&settings);
///
/// let source = host.add(Stereo);
/// let mut selector = ChannelSelector::new(&settings, 0.0, &InProcessProvider, &hub).unwrap();
/// selector.wait_until_ready(Duration::from_secs(5));
/// selector.start().unwrap();
///
/// host.connect(source.id(), &mut selector).unwrap();
/// host.output(&mut selector).unwrap();
/// host.process();
///
/// let out = host.output_buffers(selector.id()).unwrap();
/// assert!(out[0].iter().all(|&s| s == 0.0));
/// ```
pub struct Host {
    graph: AudioGraph,
    queue_size: usize,
    blocks_processed: u64,
}

impl Host {
    pub fn new(settings: &Settings) -> Self {
        Self {
            graph: AudioGraph::new(settings.sample_rate),
            queue_size: settings.message_queue_size,
            blocks_processed: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn blocks_processed(&self) -> u64 {
        self.blocks_processed
    }

    /// Add a node to the graph.
    pub fn add<N: AudioNode>(&mut self, node: N) -> Handle<N::Message> {
        let handle = self.graph.add(NodeId::next(), node, self.queue_size);
        Handle {
            node_id: handle.id,
            sender: handle.sender,
            _marker: PhantomData,
        }
    }

    /// Move the selector's processing unit into the graph.
    ///
    /// Does nothing if it is already there. Fails while the unit is still
    /// being acquired.
    pub fn attach(&mut self, selector: &mut ChannelSelector) -> Result<(), NodeError> {
        if self.graph.contains(selector.id()) {
            return Ok(());
        }
        let graph = &mut self.graph;
        let queue_size = self.queue_size;
        selector.attach_with(|id, unit| graph.add(id, unit, queue_size).sender)
    }

    /// Feed `upstream` into the selector, replacing its current input.
    ///
    /// `upstream` must produce exactly two channels. Takes effect from the
    /// next [`process`](Self::process) call.
    pub fn connect(&mut self, upstream: NodeId, selector: &mut ChannelSelector) -> Result<(), NodeError> {
        if !selector.is_ready() {
            return Err(NodeError::NotReady(selector.state()));
        }
        let channels = self
            .graph
            .num_outputs(upstream)
            .ok_or(NodeError::UnknownNode(upstream))?;
        if channels != REQUIRED_CHANNELS as usize {
            warn!(node = ?selector.id(), upstream = ?upstream, channels, "rejecting non-stereo input");
            return Err(NodeError::InvalidChannelCount {
                expected: REQUIRED_CHANNELS,
                actual: u16::try_from(channels).unwrap_or(u16::MAX),
            });
        }
        self.attach(selector)?;
        if !self.graph.set_input(upstream, selector.id()) {
            return Err(NodeError::UnknownNode(selector.id()));
        }
        selector.set_input(upstream);
        Ok(())
    }

    /// Make the selector the node each block is pulled through.
    pub fn output(&mut self, selector: &mut ChannelSelector) -> Result<(), NodeError> {
        self.attach(selector)?;
        self.set_terminal(selector.id())
    }

    /// Pull blocks through any node in the graph.
    pub fn set_terminal(&mut self, id: NodeId) -> Result<(), NodeError> {
        if !self.graph.set_terminal(id) {
            return Err(NodeError::UnknownNode(id));
        }
        debug!(node = ?id, "terminal set");
        Ok(())
    }

    /// Render one block ([`Buffer::LEN`] frames).
    pub fn process(&mut self) {
        self.graph.process();
        self.blocks_processed += 1;
    }

    /// Buffers `id` produced during the last block.
    pub fn output_buffers(&self, id: NodeId) -> Option<&[Buffer]> {
        self.graph.output(id)
    }
}
