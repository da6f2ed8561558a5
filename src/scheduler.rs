//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::config::EagerConfig;
use crate::dependency::{GlobalDependencies, NodeOrdinal, ParallelState};
use crate::node::NodeHandle;
use crate::node_list::NodeList;
use crate::reorder::{ScheduleError, TopologyReorder, cycle_error};
use crate::tensor::TensorArena;
use crate::util::latch::Latch;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PairOrder {
	InOrder,
	Swapped,
}

/// Keeps node lists in execution order and records the dependencies of the expanded list.
///
/// One scheduler belongs to one graph: `reorder_all()` is used once on the list of user nodes,
/// `reorder_last()` after every batch appended to the expanded list.
pub struct ExecScheduler {
	reorder: TopologyReorder,
	dependencies: GlobalDependencies,

	/// Length of the expanded list when `reorder_last()` saw it the last time.
	prev_len: usize,

	reordered_all: Latch,
}

impl ExecScheduler {
	pub fn new(config: &EagerConfig) -> Self {
		Self {
			reorder: TopologyReorder::new(),
			dependencies: GlobalDependencies::new(config),
			prev_len: 0,
			reordered_all: Latch::new(),
		}
	}

	pub fn dependencies(&self) -> &GlobalDependencies {
		&self.dependencies
	}

	pub fn producers(&self) -> &[Option<NodeOrdinal>] {
		self.dependencies.producers()
	}

	pub fn parallel_state(&self) -> ParallelState {
		self.dependencies.state()
	}

	pub fn is_parallel_enabled(&self) -> bool {
		self.dependencies.is_parallel_enabled()
	}

	/// Sorts the whole list. Used once, on the closed list of user nodes.
	///
	/// A list whose nodes all run on one engine cannot gain anything from concurrent execution,
	/// so it is ruled out here for good.
	#[track_caller]
	pub fn reorder_all(&mut self, list: &mut NodeList) -> Result<(), ErrPack<ScheduleError>> {
		self.reordered_all.set_once("reordering a whole list");
		if !list.are_multiple_engines_used() && self.dependencies.state() != ParallelState::Foreclosed {
			log::debug!("{} engine(s) used, concurrent execution is off", list.engines_nr());
			self.dependencies.foreclose_parallel();
		}
		match list.len() {
			0 | 1 => Ok(()),
			2 => {
				assert!(list.is_closed(), "two-node ordering needs a closed list");
				order_pair_by_roots(list)
			},
			_ => self.reorder.reorder(list.as_mut_slice()),
		}
	}

	/// Sorts and records the nodes appended since the last call.
	pub fn reorder_last(&mut self, list: &mut NodeList) -> Result<(), ErrPack<ScheduleError>> {
		let len = list.len();
		if len == 0 || len == self.prev_len {
			return Ok(());
		}
		assert!(len > self.prev_len, "nodes were removed from the list");
		let prev = std::mem::replace(&mut self.prev_len, len);

		// the very first batch may switch on concurrent execution, once
		if prev == 0
			&& list.physical_nr() >= 2
			&& self.dependencies.can_enable_parallel()
			&& list.is_parallel_exec_possible()
		{
			self.dependencies.enable_parallel();
		}

		#[allow(clippy::indexing_slicing)]
		let batch = &mut list.as_mut_slice()[prev..];
		match batch.len() {
			1 => {
				if let Some(single) = batch.first() {
					self.dependencies.process_single_node(single);
				}
			},
			2 => {
				let order = order_pair_by_aliasing(batch)?;
				if let [first, second] = &*batch {
					self.dependencies.process_two_nodes(first, second, order == PairOrder::Swapped);
				}
			},
			_ => {
				self.reorder.reorder(batch)?;
				self.dependencies.process_batch(batch, &self.reorder);
			},
		}
		Ok(())
	}

	/// Inserts each `(index, node)` before the node that was at `index`, re-sorts the list if
	/// that is needed to keep reductions valid, and rebuilds the dependencies serially.
	pub fn inject_nodes(
		&mut self,
		list: &mut NodeList,
		nodes: Vec<(usize, NodeHandle)>,
		arena: &TensorArena,
	) -> Result<(), ErrPack<ScheduleError>> {
		if nodes.is_empty() {
			return Ok(());
		}
		let injected = nodes.len();
		list.inject(nodes, arena);
		log::debug!("injected {injected} node(s), the list has {} now", list.len());

		if list.len() > 2 && list.iter().any(NodeHandle::is_reduction) {
			self.reorder.reorder(list.as_mut_slice())?;
		}
		self.redo_serial(list.len());
		Ok(())
	}

	/// Drops to serial execution and rebuilds the whole dependency record for `total` nodes.
	pub fn redo_serial(&mut self, total: usize) {
		self.dependencies.foreclose_parallel();
		self.dependencies.redo_serial(total);
		self.prev_len = total;
	}

	/// Resolves the deferred producers and fixes up logical ones. `list` is the whole expanded
	/// list, after its last batch was recorded.
	pub fn finalize(&mut self, list: &NodeList) {
		assert_eq!(list.len(), self.prev_len, "the last batch was not recorded");
		self.dependencies.finalize(list.as_slice());
	}
}

//--------------------------------------------------------------------------------------------------

/// The first node goes first if it only consumes graph inputs, otherwise the second has to.
fn order_pair_by_roots(list: &mut NodeList) -> Result<(), ErrPack<ScheduleError>> {
	let tensors = list.tensors();
	let swap = match list.as_slice() {
		[first, second] => {
			if tensors.is_root(first) {
				false
			} else if tensors.is_root(second) {
				true
			} else {
				cold_path();
				return Err(cycle_error("ExecScheduler::reorder_all()"));
			}
		},
		_ => panic!("expected a pair of nodes"),
	};
	if swap {
		list.as_mut_slice().swap(0, 1);
	}
	Ok(())
}

/// Only looks at the two nodes themselves: the first may go first if it doesn't consume
/// anything the second produces.
fn order_pair_by_aliasing(pair: &mut [NodeHandle]) -> Result<PairOrder, ErrPack<ScheduleError>> {
	let order = match &*pair {
		[first, second] => {
			if first.may_precede(second) {
				PairOrder::InOrder
			} else if second.may_precede(first) {
				PairOrder::Swapped
			} else {
				cold_path();
				return Err(cycle_error("ExecScheduler::reorder_last()"));
			}
		},
		_ => panic!("expected a pair of nodes"),
	};
	if order == PairOrder::Swapped {
		pair.swap(0, 1);
	}
	Ok(order)
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ParallelExecPolicy;
	use crate::node::{NodeId, OpKind, OpNode};
	use crate::node_list::ListRole;
	use crate::tensor::{TensorDesc, TensorId};

	const THRESHOLD: u64 = 1024;

	fn handle(id: u64, kind: OpKind, inputs: &[TensorId], outputs: &[TensorId]) -> NodeHandle {
		NodeHandle::new(OpNode::new(NodeId(id), format!("n{id}"), kind, inputs, outputs).into_rc())
	}

	fn ids(list: &NodeList) -> Vec<u64> {
		list.iter().map(|h| h.id().0).collect()
	}

	fn ord(raw: usize) -> Option<NodeOrdinal> {
		Some(NodeOrdinal::new(raw))
	}

	fn arena_with(sizes: &[u64]) -> (TensorArena, Vec<TensorId>) {
		let mut arena = TensorArena::new();
		let ids = sizes.iter().enumerate().map(|(i, &s)| arena.add(TensorDesc::new(format!("t{i}"), s))).collect();
		(arena, ids)
	}

	/// Starts serial, so that the first-batch upgrade can be observed.
	fn config() -> EagerConfig {
		EagerConfig::new()
			.with_parallel_size_threshold(Some(THRESHOLD))
			.with_parallel_policy(ParallelExecPolicy::Auto)
	}

	#[test]
	fn test_reorder_all_two_nodes_swaps_non_root() {
		let (arena, t) = arena_with(&[4, 4, 4]);
		let mut list = NodeList::new(ListRole::Original, None);
		list.push(handle(1, OpKind::Kernel, &[t[0]], &[t[1]]), &arena);
		list.push(handle(0, OpKind::MatMul, &[t[2]], &[t[0]]), &arena);
		list.close_for_insertion(&arena);

		let mut scheduler = ExecScheduler::new(&config());
		scheduler.reorder_all(&mut list).unwrap();
		assert_eq!(ids(&list), vec![0, 1]);
		assert_eq!(scheduler.parallel_state(), ParallelState::Pending);
	}

	#[test]
	fn test_reorder_all_two_node_cycle_fails() {
		let (arena, t) = arena_with(&[4, 4]);
		let mut list = NodeList::new(ListRole::Original, None);
		list.push(handle(0, OpKind::Kernel, &[t[1]], &[t[0]]), &arena);
		list.push(handle(1, OpKind::MatMul, &[t[0]], &[t[1]]), &arena);
		list.close_for_insertion(&arena);

		let err = ExecScheduler::new(&config()).reorder_all(&mut list).unwrap_err();
		assert_eq!(err.code, ScheduleError::CycleDetected);
	}

	#[test]
	fn test_reorder_all_single_engine_forecloses_parallel() {
		let (arena, t) = arena_with(&[4, 4, 4, 4]);
		let mut list = NodeList::new(ListRole::Original, None);
		list.push(handle(2, OpKind::Kernel, &[t[2]], &[t[3]]), &arena);
		list.push(handle(1, OpKind::Kernel, &[t[1]], &[t[2]]), &arena);
		list.push(handle(0, OpKind::Reduction, &[t[0], t[0]], &[t[1]]), &arena);
		list.close_for_insertion(&arena);

		let mut scheduler =
			ExecScheduler::new(&config().with_parallel_policy(ParallelExecPolicy::Enable));
		assert!(scheduler.is_parallel_enabled());
		scheduler.reorder_all(&mut list).unwrap();
		assert_eq!(ids(&list), vec![0, 1, 2]);
		assert_eq!(scheduler.parallel_state(), ParallelState::Foreclosed);
	}

	#[test]
	fn test_reorder_last_two_nodes_swaps_and_records() {
		let (arena, t) = arena_with(&[4, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		list.push(handle(1, OpKind::Kernel, &[t[0]], &[t[1]]), &arena);
		list.push(handle(0, OpKind::Memcpy, &[], &[t[0]]), &arena);

		let mut scheduler = ExecScheduler::new(&config());
		scheduler.reorder_last(&mut list).unwrap();
		assert_eq!(ids(&list), vec![0, 1]);
		assert_eq!(scheduler.producers(), &[None, ord(0)]);
	}

	#[test]
	fn test_reorder_last_two_node_cycle_fails() {
		let (arena, t) = arena_with(&[4, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		list.push(handle(0, OpKind::Kernel, &[t[1]], &[t[0]]), &arena);
		list.push(handle(1, OpKind::Memcpy, &[t[0]], &[t[1]]), &arena);

		let err = ExecScheduler::new(&config()).reorder_last(&mut list).unwrap_err();
		assert_eq!(err.code, ScheduleError::CycleDetected);
	}

	#[test]
	fn test_reorder_last_only_touches_new_suffix() {
		let (arena, t) = arena_with(&[4, 4, 4, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		let mut scheduler = ExecScheduler::new(&config());

		list.push(handle(0, OpKind::Kernel, &[], &[t[0]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		// nothing new
		scheduler.reorder_last(&mut list).unwrap();
		assert_eq!(scheduler.producers().len(), 1);

		list.push(handle(3, OpKind::Kernel, &[t[2]], &[t[3]]), &arena);
		list.push(handle(2, OpKind::Kernel, &[t[1]], &[t[2]]), &arena);
		list.push(handle(1, OpKind::Kernel, &[t[0]], &[t[1]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		assert_eq!(ids(&list), vec![0, 1, 2, 3]);
		assert_eq!(scheduler.producers(), &[None, ord(0), ord(1), ord(2)]);
	}

	#[test]
	fn test_upgrade_to_parallel_on_first_batch() {
		let (arena, t) = arena_with(&[4, 2 * THRESHOLD, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		let mut scheduler = ExecScheduler::new(&config());

		// two independent physical nodes on different engines
		list.push(handle(0, OpKind::MatMul, &[t[0]], &[t[1]]), &arena);
		list.push(handle(1, OpKind::Kernel, &[t[0]], &[t[2]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		assert!(scheduler.is_parallel_enabled());

		scheduler.finalize(&list);
		assert_eq!(scheduler.producers(), &[None, None]);
	}

	#[test]
	fn test_no_upgrade_after_first_batch() {
		let (arena, t) = arena_with(&[4, 2 * THRESHOLD, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		let mut scheduler = ExecScheduler::new(&config());

		list.push(handle(0, OpKind::MatMul, &[t[0]], &[t[2]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		list.push(handle(1, OpKind::Kernel, &[t[0]], &[t[1]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		assert!(!scheduler.is_parallel_enabled());
		assert_eq!(scheduler.parallel_state(), ParallelState::Pending);
	}

	#[test]
	fn test_no_upgrade_for_small_tensors() {
		let (arena, t) = arena_with(&[4, 4, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		let mut scheduler = ExecScheduler::new(&config());
		list.push(handle(0, OpKind::MatMul, &[t[0]], &[t[1]]), &arena);
		list.push(handle(1, OpKind::Kernel, &[t[0]], &[t[2]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		assert!(!scheduler.is_parallel_enabled());
		assert_eq!(scheduler.producers(), &[None, ord(0)]);
	}

	#[test]
	fn test_parallel_batch_records_local_and_deferred_producers() {
		let (arena, t) = arena_with(&[2 * THRESHOLD, 4, 4, 4, 4, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		let mut scheduler = ExecScheduler::new(&config());

		// batch 1: two independent producers
		list.push(handle(0, OpKind::MatMul, &[], &[t[0]]), &arena);
		list.push(handle(1, OpKind::Kernel, &[], &[t[1]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		assert!(scheduler.is_parallel_enabled());

		// batch 2: 4 and 5 consume 3 (local), 3 consumes t1 from batch 1
		list.push(handle(4, OpKind::Memcpy, &[t[3]], &[t[4]]), &arena);
		list.push(handle(3, OpKind::Kernel, &[t[1]], &[t[3]]), &arena);
		list.push(handle(5, OpKind::Kernel, &[t[3]], &[t[5]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		assert_eq!(ids(&list), vec![0, 1, 3, 4, 5]);

		scheduler.finalize(&list);
		assert_eq!(scheduler.producers(), &[None, None, ord(1), ord(2), ord(2)]);
		assert_eq!(scheduler.dependencies().resolve_stats().nodes_resolved, 2);
	}

	#[test]
	fn test_inject_nodes_rebuilds_serial() {
		let (arena, t) = arena_with(&[2 * THRESHOLD, 4, 4]);
		let mut list = NodeList::new(ListRole::Expanded, Some(THRESHOLD));
		let mut scheduler = ExecScheduler::new(&config());
		list.push(handle(0, OpKind::MatMul, &[], &[t[0]]), &arena);
		list.push(handle(1, OpKind::Kernel, &[], &[t[1]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();
		assert!(scheduler.is_parallel_enabled());

		let copy = handle(7, OpKind::Memcpy, &[t[0]], &[t[2]]);
		scheduler.inject_nodes(&mut list, vec![(1, copy)], &arena).unwrap();
		assert_eq!(ids(&list), vec![0, 7, 1]);
		assert_eq!(scheduler.parallel_state(), ParallelState::Foreclosed);
		assert_eq!(scheduler.producers(), &[None, ord(0), ord(1)]);

		scheduler.finalize(&list);
		assert_eq!(scheduler.producers(), &[None, ord(0), ord(1)]);
	}

	#[test]
	fn test_inject_next_to_reduction_resorts() {
		let (arena, t) = arena_with(&[4, 4, 4, 4]);
		let mut list = NodeList::new(ListRole::Expanded, None);
		let mut scheduler = ExecScheduler::new(&config());
		list.push(handle(0, OpKind::Kernel, &[], &[t[0]]), &arena);
		list.push(handle(1, OpKind::Reduction, &[t[0], t[1]], &[t[2]]), &arena);
		scheduler.reorder_last(&mut list).unwrap();

		// the producer of the second reduction input is injected after the reduction
		let producer = handle(2, OpKind::Kernel, &[t[3]], &[t[1]]);
		scheduler.inject_nodes(&mut list, vec![(2, producer)], &arena).unwrap();
		assert_eq!(ids(&list), vec![0, 2, 1]);
		assert_eq!(scheduler.producers().len(), 3);
	}
}
