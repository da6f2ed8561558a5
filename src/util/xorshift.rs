//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//--------------------------------------------------------------------------------------------------

/// Small deterministic generator for the fuzz-style tests.
pub struct XorShift {
	state: u64,
}

impl XorShift {
	pub fn new(seed: u64) -> Self {
		// zero is a fixed point of xorshift
		Self { state: seed | 1 }
	}

	pub fn next_u64(&mut self) -> u64 {
		let mut x = self.state;
		x ^= x << 13;
		x ^= x >> 7;
		x ^= x << 17;
		self.state = x;
		x
	}

	#[allow(clippy::cast_possible_truncation)]
	pub fn below(&mut self, bound: usize) -> usize {
		(self.next_u64() % (bound as u64)) as usize
	}

	/// Fisher-Yates
	pub fn shuffle<T>(&mut self, items: &mut [T]) {
		for i in (1..items.len()).rev() {
			let j = self.below(i + 1);
			items.swap(i, j);
		}
	}
}

//--------------------------------------------------------------------------------------------------
