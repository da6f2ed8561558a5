//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use crate::node::{NodeId, OpNode, TensorSlots};
use crate::node_list::NodeList;
use crate::tensor::{TensorArena, TensorId};

//--------------------------------------------------------------------------------------------------

/// `(original, clone)` pairs. Graphs duplicated this way are small, so lookups are linear.
#[derive(Clone, Debug, Default)]
pub struct TensorDuplicationMap {
	pairs: Vec<(TensorId, TensorId)>,
}

impl TensorDuplicationMap {
	pub fn new() -> Self {
		Self::default()
	}

	#[track_caller]
	pub fn insert(&mut self, original: TensorId, clone: TensorId) {
		assert!(self.clone_of(original).is_none(), "tensor {original} is already duplicated");
		self.pairs.push((original, clone));
	}

	pub fn clone_of(&self, original: TensorId) -> Option<TensorId> {
		self.pairs.iter().find(|(o, _)| *o == original).map(|&(_, c)| c)
	}

	pub fn original_of(&self, clone: TensorId) -> Option<TensorId> {
		self.pairs.iter().find(|(_, c)| *c == clone).map(|&(o, _)| o)
	}

	pub fn len(&self) -> usize {
		self.pairs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pairs.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (TensorId, TensorId)> + '_ {
		self.pairs.iter().copied()
	}

	fn remap(&self, slots: &[Option<TensorId>]) -> TensorSlots {
		slots.iter().map(|slot| slot.and_then(|t| self.clone_of(t))).collect()
	}
}

pub struct DuplicatedGraph {
	/// Same order as the list that was duplicated.
	pub nodes: Vec<Rc<OpNode>>,
	pub tensors: TensorDuplicationMap,
}

/// Clones the nodes of a closed list. Every tensor of the list is cloned into `arena` and the
/// node clones get consecutive ids starting at `first_id`.
///
/// Invalidated handles are skipped: they have no clone and use up no id.
#[track_caller]
pub fn duplicate_nodes(list: &NodeList, arena: &mut TensorArena, first_id: NodeId) -> DuplicatedGraph {
	assert!(list.is_closed(), "only a closed list can be duplicated");
	let mut tensors = TensorDuplicationMap::new();
	for original in list.tensors().iter() {
		let Some(desc) = arena.get(original) else {
			continue;
		};
		let mut desc = desc.clone();
		desc.name.push_str("_dup");
		let clone = arena.add(desc);
		tensors.insert(original, clone);
	}

	let nodes: Vec<Rc<OpNode>> = list
		.iter_valid()
		.zip(first_id.0..)
		.map(|(handle, id)| {
			let node = handle.node();
			OpNode::with_slots(
				NodeId(id),
				format!("{}_dup", node.name),
				node.kind,
				tensors.remap(&node.inputs),
				tensors.remap(&node.outputs),
			)
			.into_rc()
		})
		.collect();

	log::debug!("duplicated {} node(s) and {} tensor(s)", nodes.len(), tensors.len());
	DuplicatedGraph { nodes, tensors }
}

//--------------------------------------------------------------------------------------------------
