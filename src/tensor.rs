//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Tensors are owned by the surrounding compiler. The scheduler never copies them; it only
//! refers to them by `TensorId`, a stable index into the `TensorArena`.

use crate::define_index_type;
use crate::util::index_vec::IndexVec;

//--------------------------------------------------------------------------------------------------

define_index_type!(TensorId);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
	pub name: String,

	/// Size in bytes of the dense representation.
	pub byte_size: u64,

	/// Backed by user-visible memory that outlives the compiled program.
	pub persistent: bool,

	pub dynamic_shape: bool,

	/// The shape descriptor lives in host memory.
	pub host_descriptor: bool,

	/// Resides in on-chip scratch memory.
	pub in_scratch: bool,
}

impl TensorDesc {
	pub fn new<S: Into<String>>(name: S, byte_size: u64) -> Self {
		Self {
			name: name.into(),
			byte_size,
			persistent: false,
			dynamic_shape: false,
			host_descriptor: false,
			in_scratch: false,
		}
	}

	pub fn persistent(mut self) -> Self {
		self.persistent = true;
		self
	}

	pub fn with_dynamic_shape(mut self) -> Self {
		self.dynamic_shape = true;
		self
	}

	pub fn with_host_descriptor(mut self) -> Self {
		self.host_descriptor = true;
		self
	}

	pub fn in_scratch(mut self) -> Self {
		self.in_scratch = true;
		self
	}

	/// True if a persistent tensor with these properties cannot go through the eager path.
	pub fn has_unsupported_persistence(&self) -> bool {
		self.persistent && (self.dynamic_shape || self.host_descriptor || self.in_scratch)
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct TensorArena {
	tensors: IndexVec<TensorId, TensorDesc>,
}

impl TensorArena {
	pub fn new() -> Self {
		Self { tensors: IndexVec::new() }
	}

	pub fn add(&mut self, desc: TensorDesc) -> TensorId {
		self.tensors.push(desc)
	}

	pub fn get(&self, id: TensorId) -> Option<&TensorDesc> {
		self.tensors.get(id)
	}

	pub fn len(&self) -> usize {
		self.tensors.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tensors.is_empty()
	}

	pub fn name(&self, id: TensorId) -> &str {
		self.get(id).map_or("<unknown>", |t| t.name.as_str())
	}
}

impl std::ops::Index<TensorId> for TensorArena {
	type Output = TensorDesc;

	fn index(&self, index: TensorId) -> &TensorDesc {
		&self.tensors[index]
	}
}

//--------------------------------------------------------------------------------------------------
