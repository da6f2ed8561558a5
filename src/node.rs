//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use smallvec::SmallVec;

use crate::tensor::TensorId;

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineKind {
	/// Logical operation, no hardware engine runs it.
	None,
	Matrix,
	Vector,
	Dma,
	Rotator,
}

impl EngineKind {
	#[inline]
	pub fn is_physical(self) -> bool {
		self != Self::None
	}

	#[inline]
	pub fn bit(self) -> usize {
		self as usize
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
	MatMul,
	Conv,
	Kernel,
	/// Physical reduction: input 0 must be fully produced before the other inputs.
	Reduction,
	Memcpy,
	Memset,
	Transpose,
	Rotate,
	/// Reshape, view, split, concat and similar metadata-only operations.
	Logical,
	/// Logical insert of inputs 1.. into the view given by input 0.
	StridedInsert,
}

impl OpKind {
	pub fn engine(self) -> EngineKind {
		match self {
			Self::MatMul | Self::Conv => EngineKind::Matrix,
			Self::Kernel | Self::Reduction => EngineKind::Vector,
			Self::Memcpy | Self::Memset | Self::Transpose => EngineKind::Dma,
			Self::Rotate => EngineKind::Rotator,
			Self::Logical | Self::StridedInsert => EngineKind::None,
		}
	}

	pub fn is_reduction(self) -> bool {
		matches!(self, Self::Reduction | Self::StridedInsert)
	}
}

//--------------------------------------------------------------------------------------------------

/// Identifier issued by the caller. Stays the same while the node moves between lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

pub type TensorSlots = SmallVec<[Option<TensorId>; 4]>;

/// An operator node. Immutable once created; owned by the surrounding compiler.
#[derive(Clone, Debug)]
pub struct OpNode {
	pub id: NodeId,
	pub name: String,
	pub kind: OpKind,
	pub inputs: TensorSlots,
	pub outputs: TensorSlots,
}

impl OpNode {
	pub fn new<S: Into<String>>(
		id: NodeId,
		name: S,
		kind: OpKind,
		inputs: &[TensorId],
		outputs: &[TensorId],
	) -> Self {
		Self {
			id,
			name: name.into(),
			kind,
			inputs: inputs.iter().copied().map(Some).collect(),
			outputs: outputs.iter().copied().map(Some).collect(),
		}
	}

	/// Like `new()`, but allows absent tensors in any slot.
	pub fn with_slots<S: Into<String>>(
		id: NodeId,
		name: S,
		kind: OpKind,
		inputs: TensorSlots,
		outputs: TensorSlots,
	) -> Self {
		Self { id, name: name.into(), kind, inputs, outputs }
	}

	pub fn into_rc(self) -> Rc<Self> {
		Rc::new(self)
	}
}

//--------------------------------------------------------------------------------------------------

/// A reference to an `OpNode` plus metadata cached when the handle is created.
#[derive(Clone, Debug)]
pub struct NodeHandle {
	node: Rc<OpNode>,
	engine: EngineKind,
	invalidated: bool,
	skip_adjustment: bool,
}

impl NodeHandle {
	pub fn new(node: Rc<OpNode>) -> Self {
		let engine = node.kind.engine();
		Self {
			node,
			engine,
			invalidated: false,
			skip_adjustment: false,
		}
	}

	#[inline]
	pub fn node(&self) -> &Rc<OpNode> {
		&self.node
	}

	#[inline]
	pub fn id(&self) -> NodeId {
		self.node.id
	}

	#[inline]
	pub fn name(&self) -> &str {
		&self.node.name
	}

	#[inline]
	pub fn engine(&self) -> EngineKind {
		self.engine
	}

	#[inline]
	pub fn is_physical(&self) -> bool {
		self.engine.is_physical()
	}

	#[inline]
	pub fn is_logical(&self) -> bool {
		!self.engine.is_physical()
	}

	#[inline]
	pub fn is_reduction(&self) -> bool {
		self.node.kind.is_reduction()
	}

	#[inline]
	pub fn is_invalidated(&self) -> bool {
		self.invalidated
	}

	/// The node was dropped by an optimization. It keeps its position in the list,
	/// but none of its tensors are visible anymore.
	pub fn invalidate(&mut self) {
		self.invalidated = true;
	}

	#[inline]
	pub fn skips_further_adjustment(&self) -> bool {
		self.skip_adjustment
	}

	pub fn set_skip_further_adjustment(&mut self) {
		self.skip_adjustment = true;
	}

	/// Input slots, including absent tensors. Empty for invalidated nodes.
	#[inline]
	pub fn input_slots(&self) -> &[Option<TensorId>] {
		if self.invalidated { &[] } else { self.node.inputs.as_slice() }
	}

	/// Output slots, including absent tensors. Empty for invalidated nodes.
	#[inline]
	pub fn output_slots(&self) -> &[Option<TensorId>] {
		if self.invalidated { &[] } else { self.node.outputs.as_slice() }
	}

	pub fn inputs(&self) -> impl Iterator<Item = TensorId> + '_ {
		self.input_slots().iter().filter_map(|t| *t)
	}

	pub fn outputs(&self) -> impl Iterator<Item = TensorId> + '_ {
		self.output_slots().iter().filter_map(|t| *t)
	}

	/// True if `self` consumes none of the outputs of `other`,
	/// i.e. `self` may be placed before `other` in the execution sequence.
	pub fn may_precede(&self, other: &Self) -> bool {
		self.inputs().all(|input| other.outputs().all(|output| output != input))
	}
}

//--------------------------------------------------------------------------------------------------
