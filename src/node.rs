//! Core node trait and context types.

use std::sync::atomic::{AtomicU32, Ordering};

use dasp_graph::{Buffer, Input};

/// Information available during audio processing.
///
/// Passed to every [`AudioNode::process`] call.
#[derive(Clone, Copy, Debug)]
pub struct ProcessContext {
    /// Sample rate of the graph in Hz (e.g., 44100, 48000)
    pub sample_rate: u32,
    /// Number of frames per block (always [`Buffer::LEN`])
    pub buffer_size: usize,
}

impl ProcessContext {
    /// Duration of one block in seconds.
    #[inline]
    pub fn block_duration(&self) -> f64 {
        self.buffer_size as f64 / self.sample_rate as f64
    }
}

/// Unique identifier for a node.
///
/// Ids are allocated process-wide so a node can be named (and observed)
/// before any graph has seen it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(0);

impl NodeId {
    pub(crate) fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The core trait for audio processing nodes.
///
/// Nodes receive parameter updates as messages drained at the start of each
/// block, never through shared mutable state:
///
/// ```
/// use kanalwahl::{AudioNode, ProcessContext};
/// use dasp_graph::{Buffer, Input};
///
/// /// Writes a constant value on both channels.
/// struct Dc {
///     level: f32,
/// }
///
/// impl AudioNode for Dc {
///     type Message = f32;
///
///     fn process(
///         &mut self,
///         _ctx: &ProcessContext,
///         messages: impl Iterator<Item = f32>,
///         _inputs: &[Input],
///         outputs: &mut [Buffer],
///     ) {
///         for level in messages {
///             self.level = level;
///         }
///         for buffer in outputs.iter_mut() {
///             buffer.iter_mut().for_each(|s| *s = self.level);
///         }
///     }
///
///     fn num_outputs(&self) -> usize { 2 }
/// }
/// ```
pub trait AudioNode: Send + 'static {
    /// Message type for parameter updates (use `()` if none needed)
    type Message: Send + 'static;

    /// Process one block of audio.
    ///
    /// Runs on the render context: must not block, allocate, or lock.
    /// 1. Drain and handle all pending messages
    /// 2. Read from `inputs` (if any)
    /// 3. Write to `outputs`
    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = Self::Message>,
        inputs: &[Input],
        outputs: &mut [Buffer],
    );

    /// Number of audio input channels (0 for sources).
    fn num_inputs(&self) -> usize { 0 }

    /// Number of audio output channels.
    fn num_outputs(&self) -> usize { 1 }

    /// Whether the output buffers may alias the input buffers.
    fn can_process_in_place(&self) -> bool { false }
}
