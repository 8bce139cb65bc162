//! Dispatch cache entries ("jit cells"): per-specialization-key state
//! tracking tracing-in-progress, long-term flags, and the weak reference to
//! the compiled procedure, if any.
//!
//! Cells are created lazily, the first time a site's hotness counter
//! reaches the compile threshold, and removed lazily by chain cleanup once
//! their token is dead and no flag keeps them alive.

use crate::ir::SpecKey;
use crate::tokens::{TokenArena, TokenHandle};

/// We are currently tracing the loop from this key.
pub const CELL_TRACING: u8 = 0x01;
/// Do not inline calls into this function; also a hint to trace this entry
/// as soon as possible. Set when a trace aborts for being too long.
pub const CELL_DONT_TRACE_HERE: u8 = 0x02;
/// The token is a placeholder procedure that calls back into the
/// interpreter (not-yet-compiled recursive call target).
pub const CELL_TEMPORARY: u8 = 0x04;
/// `CELL_TRACING` was set at least once.
pub const CELL_TRACING_OCCURRED: u8 = 0x08;

/// Identity of a dispatch cell: the loop head plus the concrete green
/// values. Compared structurally, never by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub func: u16,
    pub head: u16,
    pub greens: SpecKey,
}

/// One dispatch cache entry.
#[derive(Debug, Clone)]
pub struct DispatchCell {
    pub key: CellKey,
    pub flags: u8,
    token: Option<TokenHandle>,
}

impl DispatchCell {
    pub fn new(key: CellKey) -> Self {
        Self {
            key,
            flags: 0,
            token: None,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    /// The live compiled procedure for this cell, following redirects.
    /// `None` once the token died or was invalidated.
    pub fn procedure_token(&self, arena: &TokenArena) -> Option<TokenHandle> {
        arena.resolve(self.token?)
    }

    /// Whether a token was ever attached, dead or alive. Distinguishes
    /// "never compiled" from "compiled once, since reclaimed".
    pub fn has_seen_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn set_token(&mut self, token: TokenHandle, temporary: bool) {
        self.token = Some(token);
        if temporary {
            self.set_flag(CELL_TEMPORARY);
        } else {
            self.clear_flag(CELL_TEMPORARY);
        }
    }

    /// Lazy-removal policy: a cell goes away once it has no live token, is
    /// not being traced, and — if it carries `DONT_TRACE_HERE` — has in
    /// fact produced a token at least once before dying (otherwise the
    /// flag must survive as a tracing hint).
    pub fn should_remove(&self, arena: &TokenArena) -> bool {
        if self.procedure_token(arena).is_some() {
            return false;
        }
        if self.has_flag(CELL_TRACING) {
            return false;
        }
        if self.has_flag(CELL_DONT_TRACE_HERE) {
            return self.has_seen_token();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn key() -> CellKey {
        CellKey {
            func: 0,
            head: 0,
            greens: vec![Value::Int(0)],
        }
    }

    #[test]
    fn test_flags() {
        let mut cell = DispatchCell::new(key());
        assert!(!cell.has_flag(CELL_TRACING));
        cell.set_flag(CELL_TRACING | CELL_TRACING_OCCURRED);
        assert!(cell.has_flag(CELL_TRACING));
        cell.clear_flag(CELL_TRACING);
        assert!(!cell.has_flag(CELL_TRACING));
        assert!(cell.has_flag(CELL_TRACING_OCCURRED));
    }

    #[test]
    fn test_token_liveness() {
        let mut arena = TokenArena::new();
        let mut cell = DispatchCell::new(key());
        assert!(cell.procedure_token(&arena).is_none());
        assert!(!cell.has_seen_token());

        let t = arena.allocate(false);
        cell.set_token(t, false);
        assert_eq!(cell.procedure_token(&arena), Some(t));

        arena.free(t);
        assert!(cell.procedure_token(&arena).is_none());
        assert!(cell.has_seen_token());
    }

    #[test]
    fn test_should_remove() {
        let mut arena = TokenArena::new();
        let mut cell = DispatchCell::new(key());

        // Fresh cell with no token and no flags: removable.
        assert!(cell.should_remove(&arena));

        // Tracing keeps it alive.
        cell.set_flag(CELL_TRACING);
        assert!(!cell.should_remove(&arena));
        cell.clear_flag(CELL_TRACING);

        // A live token keeps it alive.
        let t = arena.allocate(false);
        cell.set_token(t, false);
        assert!(!cell.should_remove(&arena));

        // Dead token: removable again.
        arena.free(t);
        assert!(cell.should_remove(&arena));
    }

    #[test]
    fn test_dont_trace_here_survives_until_token_seen() {
        let mut arena = TokenArena::new();
        let mut cell = DispatchCell::new(key());
        cell.set_flag(CELL_DONT_TRACE_HERE);

        // Never produced a token: the flag is a tracing hint, keep it.
        assert!(!cell.should_remove(&arena));

        // Produced one that died: now removable.
        let t = arena.allocate(false);
        cell.set_token(t, false);
        arena.free(t);
        assert!(cell.should_remove(&arena));
    }

    #[test]
    fn test_structural_key_equality() {
        let a = CellKey {
            func: 1,
            head: 0,
            greens: vec![Value::Int(7), Value::Int(1)],
        };
        let b = CellKey {
            func: 1,
            head: 0,
            greens: vec![Value::Int(7), Value::Int(1)],
        };
        let c = CellKey {
            func: 1,
            head: 0,
            greens: vec![Value::Int(8), Value::Int(1)],
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
