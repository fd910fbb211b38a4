//! # Session Registry
//!
//! Sessions live in a small slot arena. A [`SessionHandle`] names a slot and
//! the generation it was issued under; destroying a session bumps the
//! generation, so every copy of the old handle stops validating at once.
//!
//! The wire id sent to the firmware packs both halves:
//! `generation << 16 | index`. Generations start at 1, so no live session
//! ever has wire id 0.

use alloc::vec::Vec;

use crate::{HfiError, Result};

/// Generation-checked session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u16,
    generation: u16,
}

impl SessionHandle {
    /// Id carried in packets
    pub const fn wire_id(self) -> u32 {
        (self.generation as u32) << 16 | self.index as u32
    }

    /// Rebuild a handle from a wire id
    pub const fn from_wire_id(id: u32) -> Self {
        Self {
            index: (id & 0xFFFF) as u16,
            generation: (id >> 16) as u16,
        }
    }

    /// Arena slot
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

/// A live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Handle of this session
    pub handle: SessionHandle,
    /// Session type given at init
    pub session_type: u32,
    /// Caller cookie echoed in events
    pub cookie: u64,
    /// Upper layer paused the session
    pub paused: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u16,
    session: Option<Session>,
}

/// Arena of live sessions
#[derive(Debug)]
pub struct SessionRegistry {
    slots: Vec<Slot>,
    max: usize,
    live: usize,
}

fn next_generation(generation: u16) -> u16 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

impl SessionRegistry {
    /// Create an empty registry holding at most `max` sessions
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            max,
            live: 0,
        }
    }

    /// Register a new session
    pub fn create(&mut self, session_type: u32, cookie: u64) -> Result<SessionHandle> {
        let index = match self.slots.iter().position(|s| s.session.is_none()) {
            Some(i) => i,
            None if self.slots.len() < self.max => {
                self.slots.push(Slot {
                    generation: 1,
                    session: None,
                });
                self.slots.len() - 1
            }
            None => {
                log::warn!("session limit {} reached", self.max);
                return Err(HfiError::Busy);
            }
        };

        let slot = &mut self.slots[index];
        let handle = SessionHandle {
            index: index as u16,
            generation: slot.generation,
        };
        slot.session = Some(Session {
            handle,
            session_type,
            cookie,
            paused: false,
        });
        self.live += 1;
        Ok(handle)
    }

    /// Whether `handle` names a live session
    pub fn validate(&self, handle: SessionHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Live session for `handle`
    pub fn get(&self, handle: SessionHandle) -> Result<&Session> {
        self.slots
            .get(handle.index())
            .and_then(|s| s.session.as_ref())
            .filter(|s| s.handle == handle)
            .ok_or(HfiError::SessionInvalid)
    }

    fn get_mut(&mut self, handle: SessionHandle) -> Result<&mut Session> {
        self.slots
            .get_mut(handle.index())
            .and_then(|s| s.session.as_mut())
            .filter(|s| s.handle == handle)
            .ok_or(HfiError::SessionInvalid)
    }

    /// Unlink a session, returning it if it was still live
    ///
    /// Destroying an already destroyed handle is a no-op.
    pub fn destroy(&mut self, handle: SessionHandle) -> Option<Session> {
        self.get(handle).ok()?;
        let slot = &mut self.slots[handle.index()];
        slot.generation = next_generation(slot.generation);
        self.live -= 1;
        slot.session.take()
    }

    /// Resolve a wire id from a firmware packet
    pub fn lookup_by_id(&self, id: u32) -> Option<&Session> {
        self.get(SessionHandle::from_wire_id(id)).ok()
    }

    /// Set the pause flag
    pub fn set_paused(&mut self, handle: SessionHandle, paused: bool) -> Result<()> {
        self.get_mut(handle)?.paused = paused;
        Ok(())
    }

    /// Whether any live session is running
    pub fn any_unpaused(&self) -> bool {
        self.iter().any(|s| !s.paused)
    }

    /// Drop every session without per-session teardown
    pub fn clear(&mut self) -> usize {
        let count = self.live;
        for slot in self.slots.iter_mut().filter(|s| s.session.is_some()) {
            slot.session = None;
            slot.generation = next_generation(slot.generation);
        }
        self.live = 0;
        count
    }

    /// Live sessions
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter_map(|s| s.session.as_ref())
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let mut reg = SessionRegistry::new(4);
        let a = reg.create(1, 0xA).unwrap();
        let b = reg.create(2, 0xB).unwrap();
        assert_ne!(a.wire_id(), b.wire_id());
        assert_eq!(reg.lookup_by_id(b.wire_id()).unwrap().cookie, 0xB);
        assert_eq!(reg.len(), 2);
        assert_eq!(a.wire_id() >> 16, 1);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut reg = SessionRegistry::new(4);
        let a = reg.create(1, 0).unwrap();
        let stale = a;
        assert!(reg.destroy(a).is_some());
        assert!(!reg.validate(stale));
        assert!(reg.destroy(stale).is_none());

        // Slot is reused under a new generation
        let c = reg.create(1, 0).unwrap();
        assert_eq!(c.index(), stale.index());
        assert!(reg.validate(c));
        assert!(!reg.validate(stale));
        assert!(reg.lookup_by_id(stale.wire_id()).is_none());
    }

    #[test]
    fn test_limit() {
        let mut reg = SessionRegistry::new(2);
        reg.create(0, 0).unwrap();
        reg.create(0, 0).unwrap();
        assert_eq!(reg.create(0, 0), Err(HfiError::Busy));
    }

    #[test]
    fn test_pause_tracking() {
        let mut reg = SessionRegistry::new(4);
        let a = reg.create(0, 0).unwrap();
        let b = reg.create(0, 0).unwrap();
        assert!(reg.any_unpaused());
        reg.set_paused(a, true).unwrap();
        reg.set_paused(b, true).unwrap();
        assert!(!reg.any_unpaused());
        reg.destroy(b);
        assert_eq!(reg.set_paused(b, false), Err(HfiError::SessionInvalid));
    }

    #[test]
    fn test_clear_invalidates_all() {
        let mut reg = SessionRegistry::new(4);
        let a = reg.create(0, 0).unwrap();
        let b = reg.create(0, 0).unwrap();
        assert_eq!(reg.clear(), 2);
        assert!(reg.is_empty());
        assert!(!reg.validate(a));
        assert!(!reg.validate(b));
    }

    #[test]
    fn test_generation_skips_zero() {
        assert_eq!(next_generation(u16::MAX), 1);
        assert_eq!(SessionHandle::from_wire_id(0x0003_0002).index(), 2);
    }
}
