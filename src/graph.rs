//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! The eager graph: collects user nodes, decides whether the eager path applies, and drives
//! the expansion and scheduling of the nodes when it does.

use std::rc::Rc;

use crate::config::EagerConfig;
use crate::dependency::NodeOrdinal;
use crate::duplicate::{DuplicatedGraph, duplicate_nodes};
use crate::node::{NodeHandle, NodeId, OpNode};
use crate::node_list::{ListRole, NodeList};
use crate::reorder::ScheduleError;
use crate::scheduler::ExecScheduler;
use crate::tensor::{TensorArena, TensorDesc, TensorId};
use crate::util::latch::Latch;
use crate::{ErrExtra, ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

/// Errors reported by collaborators. They are kept as the nested error of an `ErrPack`.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
	Cycle,
	ExpansionFailed,
	LogicalPassFailed,
	TransposeFusionFailed,
	InvalidState,
}

impl From<ScheduleError> for GraphError {
	#[cold]
	#[inline(never)]
	fn from(err: ScheduleError) -> Self {
		match err {
			ScheduleError::CycleDetected => Self::Cycle,
		}
	}
}

impl From<ErrPack<ScheduleError>> for ErrPack<GraphError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<ScheduleError>) -> Self {
		Self {
			code: err.code.into(),
			extra: Some(Box::new(ErrExtra {
				message: err.message().to_owned().into(),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandoffError {
	AddNodeFailed,
}

#[cold]
#[inline(never)]
fn collaborator_error<Code: Copy + std::fmt::Debug>(
	code: Code,
	message: String,
	nested: CollaboratorError,
) -> ErrPack<Code> {
	log::error!("{message}: {nested}");
	ErrPack {
		code,
		extra: Some(Box::new(ErrExtra { message: message.into(), nested: Some(nested) })),
	}
}

//--------------------------------------------------------------------------------------------------

/// Where the expansion of one user node goes.
pub struct Expansion<'a> {
	pub arena: &'a mut TensorArena,
	list: &'a mut NodeList,
}

impl<'a> Expansion<'a> {
	pub fn add_tensor(&mut self, desc: TensorDesc) -> TensorId {
		self.arena.add(desc)
	}

	pub fn push(&mut self, node: Rc<OpNode>) {
		self.list.push(NodeHandle::new(node), self.arena);
	}

	pub fn push_handle(&mut self, handle: NodeHandle) {
		self.list.push(handle, self.arena);
	}

	/// Nodes expanded so far, including the ones of earlier user nodes.
	pub fn list(&self) -> &NodeList {
		self.list
	}
}

/// What the logical pass can work with. Injected nodes must go through `inject()`, so that
/// the dependencies stay in sync with the list.
pub struct LogicalPass<'a> {
	pub arena: &'a mut TensorArena,
	pub list: &'a mut NodeList,
	scheduler: &'a mut ExecScheduler,
}

impl<'a> LogicalPass<'a> {
	pub fn inject(&mut self, nodes: Vec<(usize, NodeHandle)>) -> Result<(), ErrPack<ScheduleError>> {
		self.scheduler.inject_nodes(self.list, nodes, self.arena)
	}
}

/// Turns user nodes into nodes the device can execute.
pub trait Decomposer {
	fn is_node_supported(&self, node: &NodeHandle) -> bool;

	/// Appends zero or more nodes for `node`.
	fn expand(&mut self, node: &NodeHandle, out: &mut Expansion<'_>) -> Result<(), CollaboratorError>;

	fn run_transpose_fusion(&mut self, _list: &mut NodeList) -> Result<(), CollaboratorError> {
		Ok(())
	}

	/// Only called if the expansion produced logical nodes.
	fn run_logical_pass(&mut self, _pass: &mut LogicalPass<'_>) -> Result<(), CollaboratorError> {
		Ok(())
	}
}

/// The full graph compiler, used for graphs the eager path cannot handle.
pub trait GeneralCompiler {
	fn add_node(&mut self, node: &Rc<OpNode>, arena: &TensorArena) -> Result<(), CollaboratorError>;

	fn remove_node(&mut self, id: NodeId);
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphState {
	Collecting,
	Sorted,
	Extracting,
	LogicalPass,
	Finalized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileOutcome {
	/// The expanded list and its producers are ready.
	Eager,

	/// The graph must be handed off to the general compiler.
	Fallback,
}

pub struct EagerGraph<D: Decomposer> {
	config: EagerConfig,
	decomposer: D,
	state: GraphState,
	original: NodeList,
	expanded: NodeList,
	scheduler: ExecScheduler,
	ineligible: Latch,
}

impl<D: Decomposer> EagerGraph<D> {
	pub fn new(config: EagerConfig, decomposer: D) -> Self {
		Self {
			original: NodeList::new(ListRole::Original, None),
			expanded: NodeList::new(ListRole::Expanded, config.parallel_size_threshold),
			scheduler: ExecScheduler::new(&config),
			config,
			decomposer,
			state: GraphState::Collecting,
			ineligible: Latch::new(),
		}
	}

	pub fn config(&self) -> &EagerConfig {
		&self.config
	}

	pub fn decomposer(&self) -> &D {
		&self.decomposer
	}

	pub fn state(&self) -> GraphState {
		self.state
	}

	pub fn original(&self) -> &NodeList {
		&self.original
	}

	pub fn expanded(&self) -> &NodeList {
		&self.expanded
	}

	pub fn scheduler(&self) -> &ExecScheduler {
		&self.scheduler
	}

	/// Final dependencies of the expanded nodes.
	pub fn producers(&self) -> Option<&[Option<NodeOrdinal>]> {
		(self.state == GraphState::Finalized).then(|| self.scheduler.producers())
	}

	pub fn find_by_id(&self, id: NodeId) -> Option<&NodeHandle> {
		self.original.find_by_id(id)
	}

	/// Records a user node. Nodes are recorded even after the graph became ineligible,
	/// so that all of them can be handed off.
	#[track_caller]
	pub fn add_node(&mut self, node: Rc<OpNode>, arena: &TensorArena) {
		assert_eq!(self.state, GraphState::Collecting, "nodes can only be added while collecting");
		let handle = NodeHandle::new(node);
		let supported = self.decomposer.is_node_supported(&handle);
		self.original.push(handle.clone(), arena);

		if !supported && self.ineligible.set() {
			log::debug!("node '{}' is not supported by the eager path", handle.name());
		}
		if self.original.len() > self.config.max_nodes && self.ineligible.set() {
			log::debug!("more than {} nodes, the eager path doesn't apply", self.config.max_nodes);
		}
	}

	/// False once any node was unsupported or there were too many of them. Unsupported tensors
	/// are only known after `lock_and_sort()`.
	pub fn is_eligible(&self) -> bool {
		!self.ineligible.is_set() && !self.original.tensors().has_unsupported_tensors()
	}

	/// Closes the list of user nodes and sorts it. Does nothing if already done.
	pub fn lock_and_sort(&mut self, arena: &TensorArena) -> Result<(), ErrPack<GraphError>> {
		if self.state != GraphState::Collecting {
			return Ok(());
		}
		if self.original.is_closed() {
			cold_path();
			return Err(ErrPack::new(GraphError::InvalidState, "sorting the graph failed before"));
		}
		self.original.close_for_insertion(arena);
		self.scheduler.reorder_all(&mut self.original)?;
		self.state = GraphState::Sorted;
		Ok(())
	}

	/// Runs the eager path, or tells the caller to fall back to the general compiler.
	///
	/// A cycle is an error, not a reason to fall back.
	pub fn compile(&mut self, arena: &mut TensorArena) -> Result<CompileOutcome, ErrPack<GraphError>> {
		self.lock_and_sort(arena)?;
		if !self.is_eligible() {
			log::debug!("graph with {} node(s) falls back to the general compiler", self.original.len());
			return Ok(CompileOutcome::Fallback);
		}
		if self.state != GraphState::Sorted {
			cold_path();
			return Err(ErrPack::new(GraphError::InvalidState, format!("cannot compile in {:?} state", self.state)));
		}

		self.state = GraphState::Extracting;
		self.extract(arena)?;

		self.decomposer.run_transpose_fusion(&mut self.expanded).map_err(|e| {
			collaborator_error(GraphError::TransposeFusionFailed, "transpose fusion failed".into(), e)
		})?;

		if self.expanded.has_logical_nodes() {
			self.state = GraphState::LogicalPass;
			let mut pass = LogicalPass {
				arena: &mut *arena,
				list: &mut self.expanded,
				scheduler: &mut self.scheduler,
			};
			self.decomposer.run_logical_pass(&mut pass).map_err(|e| {
				collaborator_error(GraphError::LogicalPassFailed, "logical pass failed".into(), e)
			})?;
			self.scheduler.redo_serial(self.expanded.len());
		}

		self.expanded.close_for_insertion(arena);
		self.scheduler.finalize(&self.expanded);
		self.state = GraphState::Finalized;
		self.expanded.log_sequence(arena);
		Ok(CompileOutcome::Eager)
	}

	fn extract(&mut self, arena: &mut TensorArena) -> Result<(), ErrPack<GraphError>> {
		for i in 0..self.original.len() {
			let Some(handle) = self.original.get(i).cloned() else {
				break;
			};
			let mut out = Expansion { arena: &mut *arena, list: &mut self.expanded };
			self.decomposer.expand(&handle, &mut out).map_err(|e| {
				collaborator_error(GraphError::ExpansionFailed, format!("expansion of '{}' failed", handle.name()), e)
			})?;
			self.scheduler.reorder_last(&mut self.expanded)?;
		}
		Ok(())
	}

	/// Adds the sorted user nodes to `compiler`. If any of them is rejected, the ones added
	/// so far are removed again.
	#[track_caller]
	pub fn hand_off<C: GeneralCompiler>(
		&self,
		compiler: &mut C,
		arena: &TensorArena,
	) -> Result<(), ErrPack<HandoffError>> {
		assert!(self.state != GraphState::Collecting, "the graph must be sorted before handoff");
		for (i, handle) in self.original.iter().enumerate() {
			if let Err(e) = compiler.add_node(handle.node(), arena) {
				cold_path();
				for added in self.original.iter().take(i).rev() {
					compiler.remove_node(added.id());
				}
				return Err(collaborator_error(
					HandoffError::AddNodeFailed,
					format!("general compiler rejected node '{}'", handle.name()),
					e,
				));
			}
		}
		log::debug!("{} node(s) handed off to the general compiler", self.original.len());
		Ok(())
	}

	/// Clones the sorted user nodes together with their tensors.
	pub fn duplicate(
		&mut self,
		arena: &mut TensorArena,
		first_id: NodeId,
	) -> Result<DuplicatedGraph, ErrPack<GraphError>> {
		self.lock_and_sort(arena)?;
		Ok(duplicate_nodes(&self.original, arena, first_id))
	}
}
