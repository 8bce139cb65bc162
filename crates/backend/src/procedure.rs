//! Stored compiled form of a trace: the inputs and the operation list,
//! exactly as the pipeline handed them over.
//!
//! A loop procedure starts with a `Label` (its single jump target) and
//! ends with a back-edge `Jump`; a finish-shaped procedure ends in
//! `Finish`; a bridge ends in either. The label carries an implicit weak
//! back-reference to its owning token through the engine's token arena —
//! jumps name the owning token and the arena decides liveness.

use ember_engine::ir::{IrOp, Trace, VarId};

#[derive(Debug, Clone)]
pub struct Procedure {
    pub inputs: Vec<VarId>,
    pub ops: Vec<IrOp>,
}

impl Procedure {
    pub fn from_trace(trace: &Trace) -> Self {
        Self {
            inputs: trace.inputs.clone(),
            ops: trace.ops.clone(),
        }
    }
}
