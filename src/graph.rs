//! Audio graph - owns nodes and message queues

use core::marker::PhantomData;

use dasp_graph::{Buffer, Input, NodeData, Processor};
use hashbrown::HashMap;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::node::{AudioNode, NodeId, ProcessContext};

/// Internal handle to send messages to a node in an AudioGraph
pub(crate) struct NodeHandle<M: Send + 'static> {
    pub(crate) id: NodeId,
    pub(crate) sender: Producer<M>,
    pub(crate) _marker: PhantomData<M>,
}

// Type-erased wrapper so we can store heterogeneous nodes
trait ErasedNode: Send {
    fn process_erased(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]);
}

struct NodeWrapper<N: AudioNode> {
    node: N,
    receiver: Consumer<N::Message>,
}

impl<N: AudioNode> ErasedNode for NodeWrapper<N> {
    fn process_erased(&mut self, ctx: &ProcessContext, inputs: &[Input], outputs: &mut [Buffer]) {
        // Split borrow to avoid conflict between receiver and node
        let receiver = &mut self.receiver;
        let node = &mut self.node;

        // Draining iterator straight off the consumer - no allocation
        let messages = core::iter::from_fn(|| receiver.pop().ok());
        node.process(ctx, messages, inputs, outputs);
    }
}

// Adapter for dasp_graph
struct DaspAdapter {
    node: Box<dyn ErasedNode>,
    ctx: ProcessContext,
}

impl dasp_graph::Node for DaspAdapter {
    fn process(&mut self, inputs: &[Input], outputs: &mut [Buffer]) {
        self.node.process_erased(&self.ctx, inputs, outputs);
    }
}

type InnerGraph = petgraph::graph::Graph<NodeData<DaspAdapter>, ()>;

/// An audio processing graph at a fixed sample rate
pub(crate) struct AudioGraph {
    graph: InnerGraph,
    processor: Processor<InnerGraph>,
    ctx: ProcessContext,

    node_indices: HashMap<NodeId, NodeIndex>,
    num_outputs: HashMap<NodeId, usize>,

    terminal: Option<NodeIndex>,
}

impl AudioGraph {
    /// Create a new graph with the given sample rate
    pub fn new(sample_rate: u32) -> Self {
        Self {
            graph: InnerGraph::with_capacity(64, 64),
            processor: Processor::with_capacity(64),
            ctx: ProcessContext {
                sample_rate,
                buffer_size: Buffer::LEN,
            },
            node_indices: HashMap::new(),
            num_outputs: HashMap::new(),
            terminal: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.ctx.sample_rate
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node_indices.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Output channel count a node reported when it was added
    pub fn num_outputs(&self, id: NodeId) -> Option<usize> {
        self.num_outputs.get(&id).copied()
    }

    /// Add a node under `id`, returns a handle for sending messages
    pub fn add<N: AudioNode>(&mut self, id: NodeId, node: N, queue_size: usize) -> NodeHandle<N::Message> {
        let (producer, consumer) = RingBuffer::new(queue_size.max(1));

        let num_outputs = node.num_outputs();
        let wrapper = NodeWrapper { node, receiver: consumer };
        let adapter = DaspAdapter {
            node: Box::new(wrapper),
            ctx: self.ctx,
        };

        let node_data = match num_outputs {
            1 => NodeData::new1(adapter),
            2 => NodeData::new2(adapter),
            // 0 outputs = sink, but dasp_graph still needs a buffer for inputs
            _ => NodeData::new1(adapter),
        };

        let idx = self.graph.add_node(node_data);
        self.node_indices.insert(id, idx);
        self.num_outputs.insert(id, num_outputs);

        NodeHandle {
            id,
            sender: producer,
            _marker: PhantomData,
        }
    }

    /// Make `from` the only input of `to`. Returns false if either is unknown.
    ///
    /// Edges only change between calls to [`process`](Self::process), so a
    /// rewire always lands on a block boundary.
    pub fn set_input(&mut self, from: NodeId, to: NodeId) -> bool {
        let (Some(&from_idx), Some(&to_idx)) = (self.node_indices.get(&from), self.node_indices.get(&to)) else {
            return false;
        };

        // remove_edge reshuffles edge indices, so re-query each time
        while let Some(edge) = self.graph.first_edge(to_idx, Direction::Incoming) {
            self.graph.remove_edge(edge);
        }

        self.graph.add_edge(from_idx, to_idx, ());
        true
    }

    /// Set which node to process to
    pub fn set_terminal(&mut self, id: NodeId) -> bool {
        match self.node_indices.get(&id) {
            Some(&idx) => {
                self.terminal = Some(idx);
                true
            }
            None => false,
        }
    }

    /// Output buffers a node produced during the last block
    pub fn output(&self, id: NodeId) -> Option<&[Buffer]> {
        let idx = *self.node_indices.get(&id)?;
        Some(&self.graph[idx].buffers[..])
    }

    /// Process one block of audio through the graph
    pub fn process(&mut self) {
        if let Some(terminal) = self.terminal {
            self.processor.process(&mut self.graph, terminal);
        }
    }
}
