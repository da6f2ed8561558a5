//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

//! Incremental dependency scheduler for the eager (fast-path) compiler.
//!
//! User nodes are collected into an original `NodeList`, sorted once, expanded by an external
//! `Decomposer` into physical / logical nodes, and every expansion batch is reordered and
//! recorded by the `ExecScheduler`. After finalization, every expanded node knows its most
//! recent physical producer (or that it is an execution root).

#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]
// clippy
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::indexing_slicing)]
#![warn(clippy::panic_in_result_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::elidable_lifetime_names)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::let_and_return)]
#![allow(clippy::inline_always)]
#![allow(clippy::needless_lifetimes)]
#![allow(unused_parens)]
#![allow(clippy::tabs_in_doc_comments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::if_not_else)]
#![allow(clippy::useless_let_if_seq)]
#![allow(clippy::module_name_repetitions)]

use std::borrow::Cow;

pub mod config;
pub mod dependency;
pub mod duplicate;
pub mod graph;
pub mod node;
pub mod node_list;
pub mod reorder;
pub mod scheduler;
pub mod tensor;
pub mod tensor_set;
pub mod util;


pub use config::{EagerConfig, ParallelExecPolicy};
pub use graph::{CompileOutcome, Decomposer, EagerGraph, GeneralCompiler};
pub use node::{EngineKind, NodeHandle, NodeId, OpKind, OpNode};
pub use node_list::{ListRole, NodeList};
pub use scheduler::ExecScheduler;
pub use tensor::{TensorArena, TensorDesc, TensorId};

//--------------------------------------------------------------------------------------------------

/// Marks the branch that calls it as unlikely.
#[cold]
#[inline(never)]
pub(crate) fn cold_path() {}

#[derive(Debug)]
pub struct ErrExtra {
	pub message: Cow<'static, str>,
	pub nested: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ErrPack<Code: Copy + std::fmt::Debug> {
	pub code: Code,
	pub extra: Option<Box<ErrExtra>>,
}

impl<Code: Copy + std::fmt::Debug> ErrPack<Code> {
	#[cold]
	#[inline(never)]
	pub fn new<M: Into<Cow<'static, str>>>(code: Code, message: M) -> Self {
		Self {
			code,
			extra: Some(Box::new(ErrExtra { message: message.into(), nested: None })),
		}
	}

	pub fn message(&self) -> &str {
		self.extra.as_ref().map_or("", |extra| extra.message.as_ref())
	}
}

impl<Code: Copy + std::fmt::Debug> std::error::Error for ErrPack<Code> {
}

impl<Code: Copy + std::fmt::Debug> std::fmt::Display for ErrPack<Code> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let code = self.code;
		write!(f, "(ErrPack: code={code:?}")?;
		if let Some(ref extra) = self.extra {
			let msg = extra.message.as_ref();
			if !msg.is_empty() {
				write!(f, ", message={msg}")?;
			}
			if let Some(nested) = &extra.nested {
				write!(f, ", nested={nested:?}")?;
			}
		}
		write!(f, ")")
	}
}
