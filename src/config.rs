//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//--------------------------------------------------------------------------------------------------

/// Whether the scheduler may let physical nodes run on several engines at the same time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParallelExecPolicy {
	/// Start in concurrent mode whenever the device supports it.
	/// A graph whose user nodes touch a single engine still falls back to serial.
	#[default]
	Enable,

	/// Always serial.
	Disable,

	/// Start serial. The first expansion batch may switch to concurrent mode once, if it has
	/// at least two physical nodes and a tensor reaches the size threshold.
	Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EagerConfig {
	/// Graphs with more user nodes than this go to the general compiler.
	pub max_nodes: usize,

	/// A tensor at least this large (in bytes) makes concurrent execution worthwhile.
	/// `None` means the device does not support the check, which forces serial execution.
	pub parallel_size_threshold: Option<u64>,

	pub parallel_policy: ParallelExecPolicy,
}

impl EagerConfig {
	pub const DEFAULT_MAX_NODES: usize = 16;
	pub const DEFAULT_PARALLEL_SIZE_THRESHOLD: u64 = 1 << 20;

	pub fn new() -> Self {
		Self {
			max_nodes: Self::DEFAULT_MAX_NODES,
			parallel_size_threshold: Some(Self::DEFAULT_PARALLEL_SIZE_THRESHOLD),
			parallel_policy: ParallelExecPolicy::Enable,
		}
	}

	pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
		self.max_nodes = max_nodes;
		self
	}

	pub fn with_parallel_size_threshold(mut self, threshold: Option<u64>) -> Self {
		self.parallel_size_threshold = threshold;
		self
	}

	pub fn with_parallel_policy(mut self, policy: ParallelExecPolicy) -> Self {
		self.parallel_policy = policy;
		self
	}

	/// Concurrent execution can only ever be considered if the policy allows it
	/// and the device supports the size check.
	pub fn is_parallel_exec_possible(&self) -> bool {
		self.parallel_policy != ParallelExecPolicy::Disable && self.parallel_size_threshold.is_some()
	}
}

impl Default for EagerConfig {
	fn default() -> Self {
		Self::new()
	}
}

//--------------------------------------------------------------------------------------------------
