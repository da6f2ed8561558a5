//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

use crate::node::NodeHandle;
use crate::node_list::ListRole;
use crate::tensor::{TensorArena, TensorId};
use crate::util::latch::Latch;

//--------------------------------------------------------------------------------------------------

const INLINE_TENSORS: usize = 32;

/// All distinct tensors touched by the nodes of one `NodeList`.
///
/// The set is filled while nodes are appended and then frozen. Freezing sorts and deduplicates
/// the tensors, which makes `index_of()` a binary search. Queries before freezing are a bug
/// in the caller and panic.
pub struct TensorSet {
	role: ListRole,
	tensors: SmallVec<[TensorId; INLINE_TENSORS]>,

	/// Parallel to `tensors`. Filled by `compute_graph_inputs()`.
	graph_inputs: SmallVec<[bool; INLINE_TENSORS]>,

	persistent_nr: usize,
	persistent_graph_inputs_nr: usize,

	frozen: Latch,
	graph_inputs_known: Latch,
	unsupported: Latch,
	parallel_size_reached: Latch,
}

impl TensorSet {
	pub fn new(role: ListRole) -> Self {
		Self {
			role,
			tensors: SmallVec::new(),
			graph_inputs: SmallVec::new(),
			persistent_nr: 0,
			persistent_graph_inputs_nr: 0,
			frozen: Latch::new(),
			graph_inputs_known: Latch::new(),
			unsupported: Latch::new(),
			parallel_size_reached: Latch::new(),
		}
	}

	pub fn role(&self) -> ListRole {
		self.role
	}

	pub fn is_frozen(&self) -> bool {
		self.frozen.is_set()
	}

	/// Number of entries. Before freezing, duplicates are counted.
	pub fn len(&self) -> usize {
		self.tensors.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tensors.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = TensorId> + '_ {
		self.tensors.iter().copied()
	}

	#[track_caller]
	pub fn register(&mut self, node: &NodeHandle) {
		assert!(!self.frozen.is_set(), "cannot register tensors of a frozen tensor set");
		self.tensors.extend(node.inputs());
		self.tensors.extend(node.outputs());
	}

	/// Like `register()`, but also remembers whether any of the tensors is large enough to
	/// make concurrent execution worthwhile. Once that happens, the flag stays set and the
	/// sizes of further tensors are not looked at.
	#[track_caller]
	pub fn register_and_check_parallel(
		&mut self,
		node: &NodeHandle,
		arena: &TensorArena,
		threshold: u64,
	) {
		let first_new = self.tensors.len();
		self.register(node);
		if self.parallel_size_reached.is_set() {
			return;
		}
		#[allow(clippy::indexing_slicing)]
		let large = self.tensors[first_new..].iter().any(|&t| arena[t].byte_size >= threshold);
		if large {
			log::debug!("node '{}' has a tensor of at least {threshold} bytes", node.name());
			self.parallel_size_reached.set();
		}
	}

	/// Sorts and deduplicates the tensors and counts the persistent ones.
	///
	/// For the original (user) list, persistent tensors that need dynamic shapes, host-side
	/// descriptors or scratch memory mark the set as unsupported. This is not an error;
	/// the owner of the list polls `has_unsupported_tensors()` and falls back.
	#[track_caller]
	pub fn freeze(&mut self, arena: &TensorArena) {
		self.frozen.set_once("freezing a tensor set");
		self.tensors.sort_unstable();
		self.tensors.dedup();

		for &t in &self.tensors {
			let desc = &arena[t];
			if !desc.persistent {
				continue;
			}
			self.persistent_nr += 1;
			if self.role == ListRole::Original
				&& desc.has_unsupported_persistence()
				&& self.unsupported.set()
			{
				log::warn!("persistent tensor '{}' is not supported by the eager path", desc.name);
			}
		}
	}

	/// Position of `tensor` in the frozen set.
	#[track_caller]
	pub fn index_of(&self, tensor: TensorId) -> Option<usize> {
		assert!(self.frozen.is_set(), "tensor set queried before freezing");
		self.tensors.binary_search(&tensor).ok()
	}

	pub fn contains(&self, tensor: TensorId) -> bool {
		self.index_of(tensor).is_some()
	}

	/// Marks every tensor that none of `nodes` produces as a graph input.
	#[track_caller]
	pub fn compute_graph_inputs(&mut self, nodes: &[NodeHandle], arena: &TensorArena) {
		assert!(self.frozen.is_set(), "graph inputs require a frozen tensor set");
		self.graph_inputs.clear();
		self.graph_inputs.resize(self.tensors.len(), true);
		for node in nodes {
			for output in node.outputs() {
				if let Some(i) = self.index_of(output)
					&& let Some(is_input) = self.graph_inputs.get_mut(i)
				{
					*is_input = false;
				}
			}
		}
		self.persistent_graph_inputs_nr = self
			.tensors
			.iter()
			.zip(&self.graph_inputs)
			.filter(|&(&t, &is_input)| is_input && arena[t].persistent)
			.count();
		self.graph_inputs_known.set();
	}

	#[track_caller]
	pub fn is_graph_input(&self, tensor: TensorId) -> bool {
		assert!(self.graph_inputs_known.is_set(), "graph inputs were not computed");
		match self.index_of(tensor) {
			Some(i) => self.graph_inputs.get(i).copied().unwrap_or(true),
			// not touched by this list at all, so nothing here produces it
			None => true,
		}
	}

	/// True if every input of `node` is a graph input or absent.
	pub fn is_root(&self, node: &NodeHandle) -> bool {
		node.inputs().all(|input| self.is_graph_input(input))
	}

	pub fn persistent_nr(&self) -> usize {
		self.persistent_nr
	}

	pub fn persistent_graph_inputs_nr(&self) -> usize {
		self.persistent_graph_inputs_nr
	}

	pub fn has_unsupported_tensors(&self) -> bool {
		self.unsupported.is_set()
	}

	pub fn is_parallel_size_reached(&self) -> bool {
		self.parallel_size_reached.is_set()
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::node::{NodeId, OpKind, OpNode};
	use crate::tensor::TensorDesc;

	fn handle(id: u64, inputs: &[TensorId], outputs: &[TensorId]) -> NodeHandle {
		NodeHandle::new(OpNode::new(NodeId(id), format!("n{id}"), OpKind::Kernel, inputs, outputs).into_rc())
	}

	#[test]
	fn test_freeze_sorts_and_dedups() {
		let mut arena = TensorArena::new();
		let a = arena.add(TensorDesc::new("a", 16));
		let b = arena.add(TensorDesc::new("b", 16));
		let c = arena.add(TensorDesc::new("c", 16));

		let mut set = TensorSet::new(ListRole::Expanded);
		set.register(&handle(0, &[c, a], &[b]));
		set.register(&handle(1, &[b, a], &[c]));
		assert_eq!(set.len(), 6);

		set.freeze(&arena);
		assert_eq!(set.iter().collect::<Vec<_>>(), vec![a, b, c]);
		assert_eq!(set.index_of(a), Some(0));
		assert_eq!(set.index_of(c), Some(2));
		assert_eq!(set.index_of(TensorId::new(99)), None);
	}

	#[test]
	#[should_panic(expected = "freezing a tensor set may only happen once")]
	fn test_freeze_twice_is_rejected() {
		let arena = TensorArena::new();
		let mut set = TensorSet::new(ListRole::Expanded);
		set.freeze(&arena);
		set.freeze(&arena);
	}

	#[test]
	#[should_panic(expected = "queried before freezing")]
	fn test_index_of_before_freeze_panics() {
		let set = TensorSet::new(ListRole::Expanded);
		let _ = set.index_of(TensorId::new(0));
	}

	#[test]
	#[should_panic(expected = "frozen tensor set")]
	fn test_register_after_freeze_panics() {
		let arena = TensorArena::new();
		let mut set = TensorSet::new(ListRole::Expanded);
		set.freeze(&arena);
		set.register(&handle(0, &[], &[TensorId::new(0)]));
	}

	#[test]
	fn test_graph_inputs_and_roots() {
		let mut arena = TensorArena::new();
		let x = arena.add(TensorDesc::new("x", 16).persistent());
		let y = arena.add(TensorDesc::new("y", 16));
		let z = arena.add(TensorDesc::new("z", 16).persistent());

		let n0 = handle(0, &[x], &[y]);
		let n1 = handle(1, &[y], &[z]);
		let mut set = TensorSet::new(ListRole::Original);
		set.register(&n0);
		set.register(&n1);
		set.freeze(&arena);
		set.compute_graph_inputs(&[n0.clone(), n1.clone()], &arena);

		assert!(set.is_graph_input(x));
		assert!(!set.is_graph_input(y));
		assert!(!set.is_graph_input(z));
		assert!(set.is_root(&n0));
		assert!(!set.is_root(&n1));
		assert_eq!(set.persistent_nr(), 2);
		assert_eq!(set.persistent_graph_inputs_nr(), 1);
	}

	#[test]
	fn test_unsupported_persistent_tensor_only_flags_original_list() {
		let mut arena = TensorArena::new();
		let x = arena.add(TensorDesc::new("x", 16).persistent().with_dynamic_shape());
		let y = arena.add(TensorDesc::new("y", 16));
		let s = arena.add(TensorDesc::new("s", 16).in_scratch());

		let n = handle(0, &[x, s], &[y]);

		let mut original = TensorSet::new(ListRole::Original);
		original.register(&n);
		original.freeze(&arena);
		assert!(original.has_unsupported_tensors());

		let mut expanded = TensorSet::new(ListRole::Expanded);
		expanded.register(&n);
		expanded.freeze(&arena);
		assert!(!expanded.has_unsupported_tensors());
	}

	#[test]
	fn test_non_persistent_scratch_tensor_is_fine() {
		let mut arena = TensorArena::new();
		let s = arena.add(TensorDesc::new("s", 16).in_scratch());
		let mut set = TensorSet::new(ListRole::Original);
		set.register(&handle(0, &[], &[s]));
		set.freeze(&arena);
		assert!(!set.has_unsupported_tensors());
	}

	#[test]
	fn test_parallel_size_flag_is_monotonic() {
		let mut arena = TensorArena::new();
		let small = arena.add(TensorDesc::new("small", 10));
		let big = arena.add(TensorDesc::new("big", 1000));
		let tiny = arena.add(TensorDesc::new("tiny", 1));

		let mut set = TensorSet::new(ListRole::Expanded);
		set.register_and_check_parallel(&handle(0, &[small], &[small]), &arena, 1000);
		assert!(!set.is_parallel_size_reached());
		set.register_and_check_parallel(&handle(1, &[small], &[big]), &arena, 1000);
		assert!(set.is_parallel_size_reached());
		set.register_and_check_parallel(&handle(2, &[big], &[tiny]), &arena, 1000);
		assert!(set.is_parallel_size_reached());
	}
}
