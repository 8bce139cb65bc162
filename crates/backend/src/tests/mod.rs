//! Integration tests driving the full engine through the reference
//! backend: warm-up, tracing, compilation, guard failures, bridges,
//! virtualizables, recursion, and the pipeline failure paths.

mod exceptions;
mod pipeline;
mod virtualizable;
