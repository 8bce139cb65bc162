//! # Ember — a meta-tracing JIT control plane
//!
//! Ember decides *when* to record an execution trace of an interpreted
//! portal program, *how* to turn a recorded trace into a compiled
//! procedure, *how* to attach bridges to runtime guard failures, and *how*
//! to keep virtualizable objects coherent between interpreted and compiled
//! execution.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DispatchState                          │
//! │  ┌──────────┐ ┌────────────┐ ┌───────────┐ ┌──────────────┐ │
//! │  │HotCounter│ │DispatchCell│ │ TokenArena│ │ ResumeDescrs │ │
//! │  └──────────┘ └────────────┘ └───────────┘ └──────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//!        │ maybe_compile_and_run          │ handle_guard_failure
//!        ▼                                ▼
//! ┌──────────────┐   traces    ┌─────────────────────┐
//! │   Recorder   │ ──────────▶ │ Compilation pipeline │
//! └──────────────┘             └─────────────────────┘
//!        │ residual calls                │ tokens
//!        ▼                               ▼
//! ┌──────────────┐             ┌─────────────────────┐
//! │ Slow interp  │ ◀────────── │  ExecutionBackend   │
//! └──────────────┘  deopt      └─────────────────────┘
//! ```
//!
//! The actual code generator lives behind the [`backend::ExecutionBackend`]
//! trait; the `ember-backend` crate provides a reference implementation
//! that evaluates trace IR directly.
//!
//! ## Key components
//!
//! - [`dispatch::maybe_compile_and_run`]: the loop-header entry point.
//! - [`dispatch::handle_guard_failure`]: bridge compilation or fallback.
//! - [`recorder`]: the trace-recording interpreter.
//! - [`interp`]: the slow-path interpreter (normal execution and deopt).
//! - [`virtualizable`]: the field unboxing / escape-marker protocol.
//!
//! There are no process globals: the embedding owns a
//! [`state::DispatchState`] and passes it into every call.

pub mod backend;
pub mod bytecode;
pub mod cell;
pub mod compile;
pub mod config;
pub mod counter;
pub mod dispatch;
pub mod errors;
pub mod eval;
pub mod interp;
pub mod ir;
pub mod metrics;
pub mod recorder;
pub mod resume;
pub mod snapshot;
pub mod state;
pub mod tokens;
pub mod value;
pub mod virtualizable;

pub use backend::{DeadFrame, ExecutionBackend, ExitDescr};
pub use bytecode::{Function, FunctionBuilder, HostFunction, Program};
pub use config::EngineConfig;
pub use dispatch::{EnterResult, handle_guard_failure, maybe_compile_and_run};
pub use errors::{AbortReason, CompileError, TraceError, VmError};
pub use interp::run_call;
pub use state::DispatchState;
pub use value::{Outcome, Value};
