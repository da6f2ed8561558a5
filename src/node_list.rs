//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use bit_set::BitSet;
use smallvec::SmallVec;

use crate::node::{EngineKind, NodeHandle, NodeId};
use crate::tensor::TensorArena;
use crate::tensor_set::TensorSet;
use crate::util::latch::Latch;

//--------------------------------------------------------------------------------------------------

pub const INLINE_NODES: usize = 16;

pub type NodeVec = SmallVec<[NodeHandle; INLINE_NODES]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListRole {
	/// Nodes as the user added them.
	Original,

	/// Nodes produced by decomposing the original ones.
	Expanded,
}

/// An ordered list of node handles plus statistics that are kept up to date as it grows.
pub struct NodeList {
	role: ListRole,
	handles: NodeVec,
	tensors: TensorSet,
	physical_nr: usize,
	engines: BitSet,
	parallel_size_threshold: Option<u64>,
	closed: Latch,
}

impl NodeList {
	/// `parallel_size_threshold` is only used by expanded lists.
	pub fn new(role: ListRole, parallel_size_threshold: Option<u64>) -> Self {
		Self {
			role,
			handles: SmallVec::new(),
			tensors: TensorSet::new(role),
			physical_nr: 0,
			engines: BitSet::new(),
			parallel_size_threshold,
			closed: Latch::new(),
		}
	}

	pub fn role(&self) -> ListRole {
		self.role
	}

	#[track_caller]
	pub fn push(&mut self, handle: NodeHandle, arena: &TensorArena) {
		assert!(!self.closed.is_set(), "node list is closed for insertion");
		self.account(&handle, arena);
		self.handles.push(handle);
	}

	/// Inserts every `(index, handle)` pair before the node that was at `index` before the call.
	/// An index equal to the length appends. Pairs with the same index keep their relative order.
	#[track_caller]
	pub fn inject(&mut self, mut nodes: Vec<(usize, NodeHandle)>, arena: &TensorArena) {
		assert!(!self.closed.is_set(), "node list is closed for insertion");
		nodes.sort_by_key(|(index, _)| *index);
		for (_, handle) in &nodes {
			self.account(handle, arena);
		}

		let old = std::mem::take(&mut self.handles);
		let mut result = NodeVec::with_capacity(old.len() + nodes.len());
		let mut injected = nodes.into_iter().peekable();
		for (i, handle) in old.into_iter().enumerate() {
			while let Some((_, new_handle)) = injected.next_if(|(index, _)| *index <= i) {
				result.push(new_handle);
			}
			result.push(handle);
		}
		result.extend(injected.map(|(_, handle)| handle));
		self.handles = result;
	}

	fn account(&mut self, handle: &NodeHandle, arena: &TensorArena) {
		if handle.is_physical() {
			self.physical_nr += 1;
			self.engines.insert(handle.engine().bit());
		}
		match (self.role, self.parallel_size_threshold) {
			(ListRole::Expanded, Some(threshold)) => {
				self.tensors.register_and_check_parallel(handle, arena, threshold);
			},
			_ => self.tensors.register(handle),
		}
	}

	/// Freezes the tensor set and computes the graph inputs. No nodes can be added afterwards.
	#[track_caller]
	pub fn close_for_insertion(&mut self, arena: &TensorArena) {
		self.closed.set_once("closing a node list");
		self.tensors.freeze(arena);
		self.tensors.compute_graph_inputs(&self.handles, arena);
	}

	pub fn is_closed(&self) -> bool {
		self.closed.is_set()
	}

	pub fn len(&self) -> usize {
		self.handles.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handles.is_empty()
	}

	pub fn get(&self, index: usize) -> Option<&NodeHandle> {
		self.handles.get(index)
	}

	/// Only the flags of a handle can change this way, not the node it refers to.
	pub fn get_mut(&mut self, index: usize) -> Option<&mut NodeHandle> {
		self.handles.get_mut(index)
	}

	pub fn iter(&self) -> std::slice::Iter<'_, NodeHandle> {
		self.handles.iter()
	}

	/// Handles that were not invalidated.
	pub fn iter_valid(&self) -> impl Iterator<Item = &NodeHandle> {
		self.handles.iter().filter(|h| !h.is_invalidated())
	}

	pub fn as_slice(&self) -> &[NodeHandle] {
		&self.handles
	}

	/// Reordering permutes handles in place; it never adds or drops any.
	pub(crate) fn as_mut_slice(&mut self) -> &mut [NodeHandle] {
		&mut self.handles
	}

	/// Linear search, lists are expected to hold a few dozen nodes at most.
	pub fn find_by_id(&self, id: NodeId) -> Option<&NodeHandle> {
		self.handles.iter().find(|h| h.id() == id)
	}

	pub fn position_of(&self, id: NodeId) -> Option<usize> {
		self.handles.iter().position(|h| h.id() == id)
	}

	/// Marks a node as dropped. Nodes are never removed, so other indices stay valid.
	pub fn invalidate(&mut self, index: usize) {
		if let Some(handle) = self.get_mut(index) {
			handle.invalidate();
		}
	}

	pub fn tensors(&self) -> &TensorSet {
		&self.tensors
	}

	pub fn physical_nr(&self) -> usize {
		self.physical_nr
	}

	pub fn engines_nr(&self) -> usize {
		self.engines.len()
	}

	pub fn uses_engine(&self, engine: EngineKind) -> bool {
		self.engines.contains(engine.bit())
	}

	pub fn are_multiple_engines_used(&self) -> bool {
		self.engines.len() >= 2
	}

	pub fn has_logical_nodes(&self) -> bool {
		self.physical_nr < self.handles.len()
	}

	pub fn is_parallel_exec_possible(&self) -> bool {
		self.tensors.is_parallel_size_reached()
	}

	pub fn log_sequence(&self, arena: &TensorArena) {
		if !log::log_enabled!(log::Level::Debug) {
			return;
		}
		log::debug!("{:?} node execution sequence:", self.role);
		for (i, handle) in self.handles.iter().enumerate() {
			let kind = if handle.is_logical() { "logical" } else { "physical" };
			let dropped = if handle.is_invalidated() { " (invalidated)" } else { "" };
			log::debug!("  {i}) \"{}\" [{:?}, {kind}]{dropped}", handle.name(), handle.node().kind);
			for input in handle.inputs() {
				log::debug!("       i: {}", arena.name(input));
			}
			for output in handle.outputs() {
				log::debug!("       o: {}", arena.name(output));
			}
		}
	}
}

impl std::ops::Index<usize> for NodeList {
	type Output = NodeHandle;

	#[allow(clippy::indexing_slicing)]
	fn index(&self, index: usize) -> &NodeHandle {
		&self.handles[index]
	}
}

impl<'a> IntoIterator for &'a NodeList {
	type Item = &'a NodeHandle;
	type IntoIter = std::slice::Iter<'a, NodeHandle>;
	fn into_iter(self) -> Self::IntoIter {
		self.handles.iter()
	}
}

//--------------------------------------------------------------------------------------------------
