//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//--------------------------------------------------------------------------------------------------

/// A sticky flag. It starts cleared and can only ever go from cleared to set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Latch {
	set: bool,
}

impl Latch {
	pub const fn new() -> Self {
		Self { set: false }
	}

	#[inline]
	pub fn is_set(&self) -> bool {
		self.set
	}

	/// Sets the latch. Returns `true` if this call is the one that tripped it.
	#[inline]
	pub fn set(&mut self) -> bool {
		let tripped = !self.set;
		self.set = true;
		tripped
	}

	/// Sets the latch, panicking if it was already set.
	///
	/// Used for operations that may run at most once per object lifetime.
	#[track_caller]
	pub fn set_once(&mut self, what: &str) {
		assert!(!self.set, "{what} may only happen once");
		self.set = true;
	}
}

//--------------------------------------------------------------------------------------------------
