//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! In-place topological reordering of a range of node handles (Kahn's algorithm).

use smallvec::SmallVec;

use crate::node::NodeHandle;
use crate::tensor::TensorId;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScheduleError {
	CycleDetected,
}

#[cold]
#[inline(never)]
pub(crate) fn cycle_error(stage: &str) -> ErrPack<ScheduleError> {
	log::error!("{stage}: cycle was detected in the graph");
	ErrPack::new(ScheduleError::CycleDetected, format!("{stage}: cycle was detected in the graph"))
}

//--------------------------------------------------------------------------------------------------

/// A tensor produced inside the reordered range.
///
/// `producer` and `consumers` are positions in the range *before* reordering.
#[derive(Clone, Debug)]
pub struct TensorConsumption {
	pub tensor: TensorId,
	pub producer: usize,
	pub consumers: SmallVec<[usize; 4]>,
}

/// Reusable topological sorter.
///
/// All scratch buffers survive between calls, so sorting many small ranges doesn't allocate
/// once the buffers reached their working size.
#[derive(Default)]
pub struct TopologyReorder {
	in_degree: SmallVec<[u32; 16]>,

	/// `sequence[new_position] == old_position`.
	/// The front part doubles as the FIFO queue of roots: `head..sequence.len()` are the roots
	/// not processed yet.
	sequence: SmallVec<[usize; 16]>,
	head: usize,

	consumption: Vec<TensorConsumption>,
}

impl TopologyReorder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reorders `nodes` so that every node comes after the producers of its inputs.
	///
	/// Inputs produced outside of `nodes` are graph inputs and impose no order. The range must
	/// have at least 3 nodes; smaller ranges are handled by the scheduler directly.
	///
	/// After a successful call, `sequence()` and `consumption()` describe what was found.
	pub fn reorder(&mut self, nodes: &mut [NodeHandle]) -> Result<(), ErrPack<ScheduleError>> {
		assert!(nodes.len() >= 3, "topology reorder needs at least 3 nodes");
		let n = nodes.len();
		self.in_degree.clear();
		self.in_degree.resize(n, 0);
		self.sequence.clear();
		self.head = 0;

		if !self.init_consumption(nodes) {
			// nothing is produced, so there are no dependencies and any order is valid
			self.sequence.extend(0..n);
			return Ok(());
		}
		self.fill_consumption(nodes);
		self.init_roots()?;
		if self.sequence.len() == n {
			// all nodes are roots
			return Ok(());
		}
		self.complete_reordering(nodes)?;
		permute_in_place(nodes, &self.sequence);
		Ok(())
	}

	/// Final order of the last reordered range, `sequence()[new_position] == old_position`.
	pub fn sequence(&self) -> &[usize] {
		&self.sequence
	}

	/// Tensors produced inside the last reordered range, with positions before reordering.
	pub fn consumption(&self) -> &[TensorConsumption] {
		&self.consumption
	}

	/// The entry of the first node in the range that writes `tensor`.
	pub fn find_consumption(&self, tensor: TensorId) -> Option<&TensorConsumption> {
		self.consumption.iter().find(|c| c.tensor == tensor)
	}

	/// Position (before reordering) of the node whose version of `tensor` is read by the node
	/// at position `consumer`. `None` if the tensor comes from outside of the range.
	pub fn input_producer(&self, consumer: usize, tensor: TensorId) -> Option<usize> {
		self.bind(consumer, tensor).and_then(|entry| self.consumption.get(entry)).map(|c| c.producer)
	}

	/// Finds the entry that `consumer` reads `tensor` from.
	///
	/// A tensor may be written by several nodes of the range. The reader gets the latest writer
	/// placed before it; if every writer is placed after it, the earliest of them. A node never
	/// reads its own output.
	fn bind(&self, consumer: usize, tensor: TensorId) -> Option<usize> {
		let mut after = None;
		let mut before = None;
		for (entry, c) in self.consumption.iter().enumerate() {
			if c.tensor != tensor || c.producer == consumer {
				continue;
			}
			if c.producer < consumer {
				before = Some(entry);
			} else if after.is_none() {
				after = Some(entry);
			}
		}
		before.or(after)
	}

	/// Entries are pushed in node order, so the outputs of one producer are contiguous.
	fn entries_of(&self, producer: usize) -> std::ops::Range<usize> {
		let start = self.consumption.partition_point(|c| c.producer < producer);
		let end = self.consumption.partition_point(|c| c.producer <= producer);
		start..end
	}

	// Step 1: one entry per produced tensor, no consumers yet.
	// Returns false if nothing is produced.
	fn init_consumption(&mut self, nodes: &[NodeHandle]) -> bool {
		self.consumption.clear();
		for (i, node) in nodes.iter().enumerate() {
			for output in node.outputs() {
				self.consumption.push(TensorConsumption {
					tensor: output,
					producer: i,
					consumers: SmallVec::new(),
				});
			}
		}
		!self.consumption.is_empty()
	}

	#[allow(clippy::indexing_slicing)]
	fn add_consumer(&mut self, consumer: usize, producer_entry: usize) {
		self.in_degree[consumer] += 1;
		self.consumption[producer_entry].consumers.push(consumer);
	}

	// Step 2: edges and in-degrees.
	#[allow(clippy::indexing_slicing)]
	fn fill_consumption(&mut self, nodes: &[NodeHandle]) {
		for (i, node) in nodes.iter().enumerate() {
			if !node.is_reduction() || node.is_invalidated() {
				for input in node.inputs() {
					if let Some(entry) = self.bind(i, input) {
						self.add_consumer(i, entry);
					}
				}
				continue;
			}

			// Reduction: the producer of input 0 must run before the producers of the other
			// inputs, not just before the reduction itself.
			let slots = node.input_slots();
			assert!(
				slots.len() >= 2 && node.output_slots().len() == 1,
				"invalid reduction node '{}'",
				node.name()
			);
			let first_entry = slots.first().copied().flatten().and_then(|t| self.bind(i, t));
			let Some(first_entry) = first_entry else {
				// input 0 comes from outside of the range, the rest are regular inputs
				for input in slots.iter().skip(1).filter_map(|t| *t) {
					if let Some(entry) = self.bind(i, input) {
						self.add_consumer(i, entry);
					}
				}
				continue;
			};

			// Inputs written by the producer of input 0 get no artificial edge, it would be a self-loop.
			// Every other producer waits for the producer of input 0.
			self.add_consumer(i, first_entry);
			let first_producer = self.consumption[first_entry].producer;
			for input in slots.iter().skip(1).filter_map(|t| *t) {
				let Some(entry) = self.bind(i, input) else {
					continue;
				};
				let producer = self.consumption[entry].producer;
				if producer != first_producer {
					// artificial edge: input-0 producer -> input-j producer
					self.add_consumer(producer, first_entry);
				}
				self.add_consumer(i, entry);
			}
		}
	}

	// Step 3: seed the queue with all nodes that depend on nothing, in original order.
	fn init_roots(&mut self) -> Result<(), ErrPack<ScheduleError>> {
		for (i, &degree) in self.in_degree.iter().enumerate() {
			if degree == 0 {
				self.sequence.push(i);
			}
		}
		if self.sequence.is_empty() {
			cold_path();
			return Err(cycle_error("TopologyReorder::init_roots()"));
		}
		Ok(())
	}

	// Step 4: Kahn's main loop. The queue order is the execution order.
	#[allow(clippy::indexing_slicing)]
	fn complete_reordering(&mut self, nodes: &[NodeHandle]) -> Result<(), ErrPack<ScheduleError>> {
		let n = nodes.len();
		for _ in 0..n {
			let Some(&root) = self.sequence.get(self.head) else {
				// queue ran dry before every node was scheduled
				cold_path();
				return Err(cycle_error("TopologyReorder::complete_reordering()"));
			};
			self.head += 1;

			for entry in self.entries_of(root) {
				for c in 0..self.consumption[entry].consumers.len() {
					let consumer = self.consumption[entry].consumers[c];
					let degree = &mut self.in_degree[consumer];
					if *degree == 0 {
						cold_path();
						return Err(cycle_error("TopologyReorder::complete_reordering()"));
					}
					*degree -= 1;
					if *degree == 0 {
						self.sequence.push(consumer);
					}
				}
			}
		}
		debug_assert!(self.head == self.sequence.len(), "invalid in-degree calculation");
		if self.sequence.len() != n {
			cold_path();
			return Err(cycle_error("TopologyReorder::complete_reordering()"));
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

/// Rearranges `items` so that `items[i]` becomes the element that was at `sequence[i]`.
///
/// No auxiliary buffer is used. Positions are visited exactly once, in increasing order. When
/// position `i` is reached, `0..i` already hold their final elements, so the element wanted at
/// `i` is either still at its original position or was pushed out by one of the earlier swaps.
/// In the latter case it went to where `sequence[original]` was at that time, which is found by
/// following `sequence` until the position is not below `i`.
///
/// `sequence` must be a permutation of `0..items.len()`.
#[allow(clippy::indexing_slicing)]
pub fn permute_in_place<T>(items: &mut [T], sequence: &[usize]) {
	debug_assert_eq!(items.len(), sequence.len());
	for i in 0..items.len() {
		let mut src = sequence[i];
		while src < i {
			src = sequence[src];
		}
		if src != i {
			items.swap(i, src);
		}
	}
}

//--------------------------------------------------------------------------------------------------
