//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Tracks, for every node of the expanded list, the latest physical node it has to wait for.
//!
//! In serial mode every node simply waits for its predecessor. In concurrent mode a node only
//! waits for the latest producer of its inputs. Producers from earlier batches are not known
//! when a batch is recorded; such nodes are queued as "missing" and resolved once, at
//! finalization, through a tensor -> producer map that is sorted exactly once.

use std::rc::Rc;

use smallvec::{SmallVec, smallvec};
use thin_vec::ThinVec;

use crate::config::{EagerConfig, ParallelExecPolicy};
use crate::define_index_type;
use crate::node::{NodeHandle, OpNode};
use crate::reorder::TopologyReorder;
use crate::tensor::TensorId;
use crate::util::index_vec::IndexVec;
use crate::util::latch::Latch;

//--------------------------------------------------------------------------------------------------

define_index_type!(NodeOrdinal);

/// Concurrent-execution state of one scheduler. It only ever moves forward:
/// `Pending -> Enabled -> Foreclosed` or `Pending -> Foreclosed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParallelState {
	/// Serial for now, may still be switched to concurrent once.
	Pending,

	Enabled,

	/// Serial for the rest of the list's life.
	Foreclosed,
}

impl ParallelState {
	#[track_caller]
	fn advance(&mut self, to: Self) {
		assert!(*self <= to, "parallel execution state cannot go from {self:?} back to {to:?}");
		*self = to;
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ProducedTensor {
	tensor: TensorId,
	producer: NodeOrdinal,
}

/// Tensor -> producer map. Filled unsorted, sorted once before the first query.
#[derive(Default)]
struct ProducedTensorsMap {
	entries: Vec<ProducedTensor>,
	sorted: Latch,
}

impl ProducedTensorsMap {
	#[track_caller]
	fn add(&mut self, tensor: TensorId, producer: NodeOrdinal) {
		assert!(!self.sorted.is_set(), "cannot add producers to a sorted tensor map");
		self.entries.push(ProducedTensor { tensor, producer });
	}

	fn sort(&mut self) {
		self.sorted.set_once("sorting the tensor map");
		self.entries.sort_unstable();
	}

	/// The latest producer of `tensor` that comes before `consumer`.
	#[track_caller]
	fn find_producer(&self, tensor: TensorId, consumer: NodeOrdinal) -> Option<NodeOrdinal> {
		assert!(self.sorted.is_set(), "tensor map queried before sorting");
		let key = ProducedTensor { tensor, producer: consumer };
		let end = self.entries.partition_point(|e| *e < key);
		let candidate = end.checked_sub(1).and_then(|i| self.entries.get(i))?;
		(candidate.tensor == tensor).then_some(candidate.producer)
	}

	fn len(&self) -> usize {
		self.entries.len()
	}
}

struct MissingProducer {
	node: Rc<OpNode>,
	ordinal: NodeOrdinal,
}

/// Counters of the work done by `resolve_missing()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveStats {
	pub nodes_resolved: usize,
	pub inputs_scanned: usize,
	pub map_lookups: usize,
}

//--------------------------------------------------------------------------------------------------

pub struct GlobalDependencies {
	state: ParallelState,
	producers: IndexVec<NodeOrdinal, Option<NodeOrdinal>>,
	produced: ProducedTensorsMap,
	missing: ThinVec<MissingProducer>,
	stats: ResolveStats,
	finalized: Latch,
}

impl GlobalDependencies {
	pub fn new(config: &EagerConfig) -> Self {
		let state = if !config.is_parallel_exec_possible() {
			ParallelState::Foreclosed
		} else if config.parallel_policy == ParallelExecPolicy::Enable {
			ParallelState::Enabled
		} else {
			ParallelState::Pending
		};
		Self {
			state,
			producers: IndexVec::new(),
			produced: ProducedTensorsMap::default(),
			missing: ThinVec::new(),
			stats: ResolveStats::default(),
			finalized: Latch::new(),
		}
	}

	pub fn state(&self) -> ParallelState {
		self.state
	}

	pub fn is_parallel_enabled(&self) -> bool {
		self.state == ParallelState::Enabled
	}

	/// True while the one-time switch to concurrent mode is still possible.
	pub fn can_enable_parallel(&self) -> bool {
		self.state == ParallelState::Pending
	}

	#[track_caller]
	pub fn enable_parallel(&mut self) {
		assert!(self.producers.is_empty(), "concurrent mode must be chosen before nodes are recorded");
		self.state.advance(ParallelState::Enabled);
		log::debug!("concurrent execution enabled");
	}

	/// Switches to serial mode for good. Anything recorded for concurrent mode is dropped, so
	/// the caller has to rebuild the producers with `redo_serial()` if nodes were recorded.
	pub fn foreclose_parallel(&mut self) {
		if self.state == ParallelState::Enabled {
			log::debug!("concurrent execution abandoned, falling back to serial");
			self.produced = ProducedTensorsMap::default();
			self.missing.clear();
		}
		self.state.advance(ParallelState::Foreclosed);
	}

	pub fn len(&self) -> usize {
		self.producers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.producers.is_empty()
	}

	/// `producers()[i]` is the latest physical node that node `i` waits for, `None` for roots.
	/// Only final after `finalize()`.
	pub fn producers(&self) -> &[Option<NodeOrdinal>] {
		&self.producers.raw
	}

	pub fn producer_of(&self, node: NodeOrdinal) -> Option<NodeOrdinal> {
		self.producers.get(node).copied().flatten()
	}

	pub fn missing_nr(&self) -> usize {
		self.missing.len()
	}

	pub fn produced_tensors_nr(&self) -> usize {
		self.produced.len()
	}

	pub fn resolve_stats(&self) -> ResolveStats {
		self.stats
	}

	pub fn is_finalized(&self) -> bool {
		self.finalized.is_set()
	}

	//----------------------------------------------------------------------------------------------

	pub fn process_single_node(&mut self, node: &NodeHandle) {
		if self.is_parallel_enabled() {
			self.add_parallel(node);
		} else {
			self.add_serial();
		}
	}

	/// `second_depends_on_first` is known by the caller from the two-node ordering.
	pub fn process_two_nodes(
		&mut self,
		first: &NodeHandle,
		second: &NodeHandle,
		second_depends_on_first: bool,
	) {
		if self.is_parallel_enabled() {
			self.add_parallel(first);
			if second_depends_on_first {
				self.add_serial();
			} else {
				self.add_parallel(second);
			}
		} else {
			self.add_serial();
			self.add_serial();
		}
	}

	/// Records a reordered batch of 3 or more nodes, using what `reorder` found out about it.
	#[allow(clippy::indexing_slicing)]
	pub fn process_batch(&mut self, nodes: &[NodeHandle], reorder: &TopologyReorder) {
		let sequence = reorder.sequence();
		assert!(nodes.len() >= 3, "batch needs at least 3 nodes");
		assert_eq!(nodes.len(), sequence.len(), "inconsistent sequencing info");

		if !self.is_parallel_enabled() {
			for _ in nodes {
				self.add_serial();
			}
			return;
		}

		// consumption info uses positions from before the reordering
		let mut inv_sequence: SmallVec<[usize; 16]> = smallvec![0; nodes.len()];
		for (new, &old) in sequence.iter().enumerate() {
			inv_sequence[old] = new;
		}
		let existing = self.producers.len();
		let ordinal = |old: usize| NodeOrdinal::new(inv_sequence[old] + existing);

		for (i, node) in nodes.iter().enumerate() {
			// the first node in the sequence is always a local root
			let producer = if i == 0 {
				None
			} else {
				let old = sequence[i];
				node.inputs().filter_map(|input| reorder.input_producer(old, input)).map(ordinal).max()
			};
			self.add_node(node, producer);
		}

		for c in reorder.consumption() {
			self.produced.add(c.tensor, ordinal(c.producer));
		}
	}

	fn add_serial(&mut self) {
		let previous = self.producers.len().checked_sub(1).map(NodeOrdinal::new);
		self.producers.push(previous);
	}

	fn add_parallel(&mut self, node: &NodeHandle) {
		let ordinal = self.producers.next_index();
		for output in node.outputs() {
			self.produced.add(output, ordinal);
		}
		self.add_node(node, None);
	}

	/// A node without a known producer is a root only if it is the very first one.
	/// Otherwise its producer may be in an earlier batch and is looked up at finalization.
	/// `producer` may point to a logical node; `fix_logical_producers()` takes care of that.
	fn add_node(&mut self, node: &NodeHandle, producer: Option<NodeOrdinal>) {
		let ordinal = self.producers.push(producer);
		if producer.is_none() && ordinal.raw > 0 {
			self.missing.push(MissingProducer { node: node.node().clone(), ordinal });
		}
	}

	//----------------------------------------------------------------------------------------------

	/// Resolves the producers of all queued nodes. Costs one sort of the tensor map plus one
	/// lookup per input of every missing node; recorded nodes are not scanned again.
	pub fn resolve_missing(&mut self) {
		assert!(!self.missing.is_empty(), "nothing to resolve");
		self.produced.sort();
		let missing = std::mem::take(&mut self.missing);
		for info in &missing {
			debug_assert!(self.producers.get(info.ordinal).is_some_and(Option::is_none));
			let mut closest = None;
			for input in info.node.inputs.iter().filter_map(|t| *t) {
				self.stats.inputs_scanned += 1;
				self.stats.map_lookups += 1;
				// latest wins
				closest = closest.max(self.produced.find_producer(input, info.ordinal));
			}
			if let Some(slot) = self.producers.get_mut(info.ordinal) {
				*slot = closest;
			}
			self.stats.nodes_resolved += 1;
		}
	}

	/// A node must not wait for a logical node. It waits for whatever that logical node waits
	/// for instead.
	///
	/// One hop is enough: producers always precede their consumers and nodes are fixed in
	/// order, so the producer of a logical predecessor has already been fixed up itself.
	#[allow(clippy::indexing_slicing)]
	pub fn fix_logical_producers(&mut self, nodes: &[NodeHandle]) {
		assert_eq!(self.producers.len(), nodes.len(), "invalid physical producers info");
		for i in 0..self.producers.raw.len() {
			let Some(producer) = self.producers.raw[i] else {
				continue;
			};
			debug_assert!(producer.raw < i, "producer {producer} doesn't precede node {i}");
			if nodes[producer.raw].is_logical() {
				let inherited = self.producers.raw[producer.raw];
				debug_assert!(inherited.is_none_or(|p| nodes[p.raw].is_physical()));
				self.producers.raw[i] = inherited;
			}
		}
	}

	/// Produces the final dependencies. `nodes` is the whole expanded list.
	#[track_caller]
	pub fn finalize(&mut self, nodes: &[NodeHandle]) {
		self.finalized.set_once("finalizing dependencies");
		if self.producers.len() <= 1 {
			return;
		}
		if !self.missing.is_empty() {
			self.resolve_missing();
		}
		self.fix_logical_producers(nodes);
	}

	/// Rebuilds the whole record as a serial chain of `total` nodes.
	/// Used after nodes were injected into the list behind the tracker's back.
	#[track_caller]
	pub fn redo_serial(&mut self, total: usize) {
		assert_eq!(self.state, ParallelState::Foreclosed, "serial rebuild requires serial mode");
		assert!(total >= self.producers.len(), "serial rebuild is expected after nodes were added");
		self.producers = (0..total).map(|i| i.checked_sub(1).map(NodeOrdinal::new)).collect::<Vec<_>>().into();
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::node::{NodeId, OpKind};

	fn t(raw: usize) -> TensorId {
		TensorId::new(raw)
	}

	fn ord(raw: usize) -> Option<NodeOrdinal> {
		Some(NodeOrdinal::new(raw))
	}

	fn node(id: u64, kind: OpKind, inputs: &[TensorId], outputs: &[TensorId]) -> NodeHandle {
		NodeHandle::new(OpNode::new(NodeId(id), format!("n{id}"), kind, inputs, outputs).into_rc())
	}

	fn parallel() -> GlobalDependencies {
		GlobalDependencies::new(&EagerConfig::new().with_parallel_policy(ParallelExecPolicy::Enable))
	}

	fn serial() -> GlobalDependencies {
		GlobalDependencies::new(&EagerConfig::new().with_parallel_policy(ParallelExecPolicy::Auto))
	}

	#[test]
	fn test_initial_state_follows_config() {
		// concurrent from the start when the device can do it
		assert_eq!(GlobalDependencies::new(&EagerConfig::new()).state(), ParallelState::Enabled);

		let auto = serial();
		assert_eq!(auto.state(), ParallelState::Pending);
		assert!(auto.can_enable_parallel());

		assert_eq!(parallel().state(), ParallelState::Enabled);

		let disabled =
			GlobalDependencies::new(&EagerConfig::new().with_parallel_policy(ParallelExecPolicy::Disable));
		assert_eq!(disabled.state(), ParallelState::Foreclosed);

		let no_threshold = GlobalDependencies::new(
			&EagerConfig::new()
				.with_parallel_policy(ParallelExecPolicy::Enable)
				.with_parallel_size_threshold(None),
		);
		assert_eq!(no_threshold.state(), ParallelState::Foreclosed);
	}

	#[test]
	#[should_panic(expected = "cannot go from")]
	fn test_foreclosed_cannot_be_enabled() {
		let mut deps = serial();
		deps.foreclose_parallel();
		deps.enable_parallel();
	}

	#[test]
	fn test_serial_chain() {
		let mut deps = serial();
		let a = node(0, OpKind::Kernel, &[], &[t(0)]);
		let b = node(1, OpKind::Kernel, &[], &[t(1)]);
		deps.process_single_node(&a);
		deps.process_two_nodes(&a, &b, false);
		assert_eq!(deps.producers(), &[None, ord(0), ord(1)]);
		assert_eq!(deps.missing_nr(), 0);
	}

	#[test]
	fn test_parallel_single_nodes_resolve_through_map() {
		let mut deps = parallel();
		let n0 = node(0, OpKind::Kernel, &[], &[t(0)]);
		let n1 = node(1, OpKind::MatMul, &[t(9)], &[t(1)]);
		let n2 = node(2, OpKind::Kernel, &[t(0), t(1)], &[t(2)]);
		let nodes = [n0, n1, n2];
		for n in &nodes {
			deps.process_single_node(n);
		}
		assert_eq!(deps.missing_nr(), 2);
		deps.finalize(&nodes);
		// n1 is independent; n2 waits for the latest of its producers
		assert_eq!(deps.producers(), &[None, None, ord(1)]);
		assert_eq!(deps.missing_nr(), 0);
	}

	#[test]
	fn test_parallel_two_nodes_with_dependency() {
		let mut deps = parallel();
		let n0 = node(0, OpKind::Kernel, &[], &[t(0)]);
		let n1 = node(1, OpKind::Memcpy, &[t(0)], &[t(1)]);
		deps.process_two_nodes(&n0, &n1, true);
		assert_eq!(deps.producers(), &[None, ord(0)]);
		assert_eq!(deps.missing_nr(), 0);
		assert_eq!(deps.produced_tensors_nr(), 1);
	}

	#[test]
	fn test_resolution_picks_latest_earlier_producer() {
		let mut deps = parallel();
		// t0 is written by n0 and again by n2; n1 must see n0, n3 must see n2
		let nodes = [
			node(0, OpKind::Kernel, &[], &[t(0)]),
			node(1, OpKind::Memcpy, &[t(0)], &[t(1)]),
			node(2, OpKind::Kernel, &[t(1)], &[t(0)]),
			node(3, OpKind::Memcpy, &[t(0)], &[t(3)]),
		];
		for n in &nodes {
			deps.process_single_node(n);
		}
		deps.finalize(&nodes);
		assert_eq!(deps.producers(), &[None, ord(0), ord(1), ord(2)]);
	}

	#[test]
	fn test_batch_with_rewritten_tensor() {
		let mut deps = parallel();
		let mut nodes = [
			node(2, OpKind::MatMul, &[t(1)], &[t(0)]),
			node(0, OpKind::Kernel, &[], &[t(0)]),
			node(1, OpKind::Memcpy, &[t(0)], &[t(1)]),
		];
		let mut reorder = TopologyReorder::new();
		reorder.reorder(&mut nodes).unwrap();
		deps.process_batch(&nodes, &reorder);
		deps.finalize(&nodes);
		assert_eq!(deps.producers(), &[None, ord(0), ord(1)]);
	}

	#[test]
	fn test_logical_producer_is_skipped() {
		let mut deps = parallel();
		let nodes = [
			node(0, OpKind::Kernel, &[], &[t(0)]),
			node(1, OpKind::Logical, &[t(0)], &[t(1)]),
			node(2, OpKind::Logical, &[t(1)], &[t(2)]),
			node(3, OpKind::MatMul, &[t(2)], &[t(3)]),
		];
		for n in &nodes {
			deps.process_single_node(n);
		}
		deps.finalize(&nodes);
		// naive producers are [-, 0, 1, 2]; 2 and 3 inherit through the logical chain
		assert_eq!(deps.producers(), &[None, ord(0), ord(0), ord(0)]);
		for p in deps.producers().iter().flatten() {
			assert!(nodes[p.raw].is_physical());
		}
	}

	#[test]
	fn test_logical_root_producer_becomes_none() {
		let mut deps = serial();
		let nodes = [
			node(0, OpKind::Logical, &[t(9)], &[t(0)]),
			node(1, OpKind::Kernel, &[t(0)], &[t(1)]),
		];
		deps.process_two_nodes(&nodes[0], &nodes[1], true);
		deps.finalize(&nodes);
		assert_eq!(deps.producers(), &[None, None]);
	}

	#[test]
	fn test_redo_serial_rebuilds_whole_record() {
		let mut deps = parallel();
		let n0 = node(0, OpKind::Kernel, &[], &[t(0)]);
		let n1 = node(1, OpKind::Kernel, &[], &[t(1)]);
		deps.process_single_node(&n0);
		deps.process_single_node(&n1);
		assert_eq!(deps.missing_nr(), 1);

		deps.foreclose_parallel();
		assert_eq!(deps.missing_nr(), 0);
		deps.redo_serial(4);
		assert_eq!(deps.producers(), &[None, ord(0), ord(1), ord(2)]);
	}

	#[test]
	#[should_panic(expected = "requires serial mode")]
	fn test_redo_serial_in_parallel_mode_panics() {
		let mut deps = parallel();
		deps.redo_serial(2);
	}

	#[test]
	#[should_panic(expected = "cannot add producers to a sorted tensor map")]
	fn test_insert_after_sort_panics() {
		let mut map = ProducedTensorsMap::default();
		map.add(t(0), NodeOrdinal::new(0));
		map.sort();
		map.add(t(1), NodeOrdinal::new(1));
	}

	#[test]
	fn test_map_lookup() {
		let mut map = ProducedTensorsMap::default();
		map.add(t(5), NodeOrdinal::new(3));
		map.add(t(2), NodeOrdinal::new(0));
		map.add(t(5), NodeOrdinal::new(1));
		map.sort();
		assert_eq!(map.find_producer(t(5), NodeOrdinal::new(10)), ord(3));
		assert_eq!(map.find_producer(t(5), NodeOrdinal::new(3)), ord(1));
		assert_eq!(map.find_producer(t(5), NodeOrdinal::new(1)), None);
		assert_eq!(map.find_producer(t(2), NodeOrdinal::new(1)), ord(0));
		assert_eq!(map.find_producer(t(7), NodeOrdinal::new(10)), None);
	}
}
