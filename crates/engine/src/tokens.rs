//! Procedure tokens: backend-opaque handles for compiled loops and bridges.
//!
//! Tokens live in an arena of generation-checked slots. A "weak" reference
//! is simply a [`TokenHandle`] held somewhere: dereferencing re-checks the
//! slot's generation, so once the token is freed every outstanding handle
//! reads as dead. This keeps all cross-references between tokens acyclic
//! liveness-graph edges with no host weak pointers involved.

use crate::errors::VmError;

/// Generation-checked handle to a procedure token. Holding one never keeps
/// the token alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenHandle {
    pub index: u32,
    pub generation: u32,
}

/// Per-token bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct TokenInfo {
    /// Placeholder procedure that calls back into the interpreter,
    /// installed for a not-yet-compiled recursive call target.
    pub temporary: bool,
    /// An invalidated token is treated as dead by cell lookup even while
    /// its slot is still allocated.
    pub invalidated: bool,
    /// Forwarding installed when a recompile replaced this procedure.
    pub redirect: Option<TokenHandle>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    live: bool,
    info: TokenInfo,
}

/// Arena of procedure tokens.
#[derive(Debug, Default)]
pub struct TokenArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl TokenArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, temporary: bool) -> TokenHandle {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.live = true;
        slot.info = TokenInfo {
            temporary,
            ..TokenInfo::default()
        };
        TokenHandle {
            index,
            generation: slot.generation,
        }
    }

    fn slot(&self, handle: TokenHandle) -> Option<&Slot> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.live && slot.generation == handle.generation).then_some(slot)
    }

    fn slot_mut(&mut self, handle: TokenHandle) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        (slot.live && slot.generation == handle.generation).then_some(slot)
    }

    /// Weak dereference: `Some` only while the token has not been freed.
    pub fn info(&self, handle: TokenHandle) -> Option<&TokenInfo> {
        self.slot(handle).map(|s| &s.info)
    }

    pub fn is_live(&self, handle: TokenHandle) -> bool {
        self.slot(handle).is_some()
    }

    /// Follow the redirect chain from `handle` to the current procedure.
    /// `None` once the chain ends in a freed or invalidated token.
    pub fn resolve(&self, handle: TokenHandle) -> Option<TokenHandle> {
        let mut current = handle;
        // Redirect chains are short; the bound only guards against a
        // corrupted cyclic chain.
        for _ in 0..self.slots.len() + 1 {
            let info = self.info(current)?;
            match info.redirect {
                Some(next) => current = next,
                None => return (!info.invalidated).then_some(current),
            }
        }
        None
    }

    pub fn invalidate(&mut self, handle: TokenHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.info.invalidated = true;
        }
    }

    /// Install `old → new` forwarding so callers holding the old handle
    /// reach the replacement without recompiling already-running code.
    pub fn set_redirect(&mut self, old: TokenHandle, new: TokenHandle) -> Result<(), VmError> {
        if !self.is_live(new) {
            return Err(VmError::DeadToken);
        }
        match self.slot_mut(old) {
            Some(slot) => {
                slot.info.redirect = Some(new);
                Ok(())
            }
            None => Err(VmError::DeadToken),
        }
    }

    pub fn set_temporary(&mut self, handle: TokenHandle, temporary: bool) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.info.temporary = temporary;
        }
    }

    /// Free the token: bump the generation so every outstanding handle
    /// reads as dead. The memory manager for the compiled code itself is
    /// external.
    pub fn free(&mut self, handle: TokenHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.live = false;
            slot.generation = slot.generation.wrapping_add(1);
            slot.info = TokenInfo::default();
            self.free.push(handle.index);
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn clear(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.live {
                slot.live = false;
                slot.generation = slot.generation.wrapping_add(1);
                slot.info = TokenInfo::default();
                self.free.push(i as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_goes_stale_on_free() {
        let mut arena = TokenArena::new();
        let t = arena.allocate(false);
        assert!(arena.is_live(t));
        arena.free(t);
        assert!(!arena.is_live(t));
        assert!(arena.info(t).is_none());

        // The slot can be reused; the old handle stays dead.
        let t2 = arena.allocate(false);
        assert_eq!(t2.index, t.index);
        assert_ne!(t2.generation, t.generation);
        assert!(!arena.is_live(t));
        assert!(arena.is_live(t2));
    }

    #[test]
    fn test_resolve_follows_redirects() {
        let mut arena = TokenArena::new();
        let a = arena.allocate(false);
        let b = arena.allocate(false);
        let c = arena.allocate(false);
        arena.set_redirect(a, b).unwrap();
        arena.set_redirect(b, c).unwrap();
        assert_eq!(arena.resolve(a), Some(c));
        assert_eq!(arena.resolve(b), Some(c));
        assert_eq!(arena.resolve(c), Some(c));
    }

    #[test]
    fn test_resolve_dead_or_invalidated() {
        let mut arena = TokenArena::new();
        let a = arena.allocate(false);
        let b = arena.allocate(false);
        arena.set_redirect(a, b).unwrap();
        arena.invalidate(b);
        assert_eq!(arena.resolve(a), None);
        arena.free(a);
        assert_eq!(arena.resolve(a), None);
    }

    #[test]
    fn test_redirect_to_dead_token_rejected() {
        let mut arena = TokenArena::new();
        let a = arena.allocate(false);
        let b = arena.allocate(false);
        arena.free(b);
        assert_eq!(arena.set_redirect(a, b), Err(VmError::DeadToken));
    }

    #[test]
    fn test_temporary_flag() {
        let mut arena = TokenArena::new();
        let t = arena.allocate(true);
        assert!(arena.info(t).unwrap().temporary);
        arena.set_temporary(t, false);
        assert!(!arena.info(t).unwrap().temporary);
    }
}
