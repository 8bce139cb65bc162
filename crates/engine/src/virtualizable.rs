//! Virtualizable support: the unboxing protocol that keeps a designated
//! heap object's fields in trace-local values while JIT-controlled code
//! runs, synchronizing them back whenever anything else might look.
//!
//! The escape marker is the heart of the protocol. An object carries at
//! most one marker at a time:
//!
//! ```text
//! Absent ──begin_residual_call──▶ TracingResidualCall ──untouched──▶ Absent
//!                                        │
//!                                        └──forced──▶ Absent (fields synced)
//! Absent ──enter_backend_frame──▶ BackendFrame(token) ──leave──▶ Absent
//! ```
//!
//! Double-forcing, or entering a state from anywhere but its legal
//! predecessor, is an engine bug and asserts.

use crate::errors::VmError;
use crate::value::Value;

/// Declared field layout of a virtualizable: `scalars` scalar fields
/// followed by `arrays` array fields, flattened in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtLayout {
    pub scalars: usize,
    pub arrays: usize,
}

impl VtLayout {
    /// Flat slot count for an object with the given array lengths.
    pub fn flat_len(&self, array_lens: &[usize]) -> usize {
        self.scalars + array_lens.iter().sum::<usize>()
    }
}

/// Who, if anyone, currently owns the object's unboxed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeMarker {
    Absent,
    /// A residual call is in flight during tracing.
    TracingResidualCall,
    /// Compiled code identified by the token index is executing.
    BackendFrame(u32),
}

/// The virtualizable carrier object.
#[derive(Debug, Clone, PartialEq)]
pub struct VtObject {
    pub scalars: Vec<Value>,
    pub arrays: Vec<Vec<Value>>,
    marker: EscapeMarker,
}

impl VtObject {
    pub fn new(scalars: Vec<Value>, arrays: Vec<Vec<Value>>) -> Self {
        Self {
            scalars,
            arrays,
            marker: EscapeMarker::Absent,
        }
    }

    pub fn marker(&self) -> EscapeMarker {
        self.marker
    }

    /// Whether the object's shape matches its declaration.
    pub fn matches_layout(&self, layout: &VtLayout) -> bool {
        self.scalars.len() == layout.scalars && self.arrays.len() == layout.arrays
    }

    /// Unbox every declared field into a flat list: scalars first, then
    /// each array's elements, in declaration order.
    pub fn read_fields(&self) -> Vec<Value> {
        let mut out = self.scalars.clone();
        for arr in &self.arrays {
            out.extend(arr.iter().cloned());
        }
        out
    }

    /// Inverse of [`read_fields`](Self::read_fields). The value list must
    /// have exactly the object's flat length; a partial write-back would
    /// leave the object incoherent.
    pub fn write_fields(&mut self, values: &[Value]) {
        let flat = self.scalars.len() + self.arrays.iter().map(Vec::len).sum::<usize>();
        assert_eq!(values.len(), flat, "partial virtualizable write-back");
        let mut it = values.iter();
        for slot in self.scalars.iter_mut() {
            *slot = it.next().expect("length checked above").clone();
        }
        for arr in self.arrays.iter_mut() {
            for slot in arr.iter_mut() {
                *slot = it.next().expect("length checked above").clone();
            }
        }
    }

    /// Flat slot index for scalar field `field`.
    pub fn scalar_slot(&self, field: u8) -> Result<usize, VmError> {
        if (field as usize) < self.scalars.len() {
            Ok(field as usize)
        } else {
            Err(VmError::VtFieldOutOfRange(field))
        }
    }

    /// Flat slot index for element `index` of array field `field`.
    pub fn array_slot(&self, field: u8, index: i64) -> Result<usize, VmError> {
        let field = field as usize;
        let arr = self
            .arrays
            .get(field)
            .ok_or(VmError::VtFieldOutOfRange(field as u8))?;
        if index < 0 || index as usize >= arr.len() {
            return Err(VmError::VtIndexOutOfBounds(index));
        }
        let before: usize = self.arrays[..field].iter().map(Vec::len).sum();
        Ok(self.scalars.len() + before + index as usize)
    }

    // Marker transitions. Each asserts its legal predecessor.

    pub fn begin_residual_call(&mut self) {
        assert_eq!(
            self.marker,
            EscapeMarker::Absent,
            "residual call with a marker already set"
        );
        self.marker = EscapeMarker::TracingResidualCall;
    }

    /// The residual call returned and nothing observed the object.
    pub fn end_residual_call_untouched(&mut self) {
        assert_eq!(
            self.marker,
            EscapeMarker::TracingResidualCall,
            "unbalanced residual-call marker"
        );
        self.marker = EscapeMarker::Absent;
    }

    /// The residual call made the object escape: synchronize the heap
    /// fields wholesale and clear the marker. Forcing an object that is
    /// not mid-residual-call is a double force.
    pub fn force_from_residual(&mut self, values: &[Value]) {
        assert_eq!(
            self.marker,
            EscapeMarker::TracingResidualCall,
            "double force of a virtualizable"
        );
        self.write_fields(values);
        self.marker = EscapeMarker::Absent;
    }

    pub fn enter_backend_frame(&mut self, token_index: u32) {
        assert_eq!(
            self.marker,
            EscapeMarker::Absent,
            "virtualizable already owned while entering compiled code"
        );
        self.marker = EscapeMarker::BackendFrame(token_index);
    }

    pub fn leave_backend_frame(&mut self) {
        assert!(
            matches!(self.marker, EscapeMarker::BackendFrame(_)),
            "leaving compiled code without owning the virtualizable"
        );
        self.marker = EscapeMarker::Absent;
    }
}
