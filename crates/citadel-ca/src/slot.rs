//! Dual-slot holders for CA and JWT key generations.
//!
//! Each kind of signing material rotates through two named slots, `A` and
//! `B`: one holds the active generation, the other the generation being
//! prepared. A slot answers two questions against the clock:
//!
//! - `should_prepare_next`: the material has passed half of its lifetime,
//!   so the next generation should be created and published.
//! - `should_activate_next`: the material has passed five-sixths of its
//!   lifetime, so the prepared generation should take over. The remaining
//!   sixth is the overlap window in which relying parties learn the new
//!   root before anything is signed by it.

use crate::ca::{JwtKey, X509Ca};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// The name of a slot. Key manager key ids derive from it, so a restarted
/// server can find the backend key belonging to a journaled generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    /// Slot "A".
    A,
    /// Slot "B".
    B,
}

impl SlotId {
    /// The other slot.
    pub fn other(self) -> SlotId {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    /// The slot name as stored in the journal.
    pub fn as_str(self) -> &'static str {
        match self {
            SlotId::A => "A",
            SlotId::B => "B",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SlotId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "A" => Ok(SlotId::A),
            "B" => Ok(SlotId::B),
            other => Err(Error::Journal(format!("unrecognized slot id {other:?}"))),
        }
    }
}

/// The key manager key id for an X509 CA slot.
pub(crate) fn x509_ca_km_key_id(id: SlotId) -> String {
    format!("x509-CA-{id}")
}

/// The key manager key id for a JWT key slot.
pub(crate) fn jwt_key_km_key_id(id: SlotId) -> String {
    format!("JWT-Signer-{id}")
}

/// The moment preparation of the next generation becomes due: half-life.
pub(crate) fn preparation_threshold(
    issued_at: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> DateTime<Utc> {
    let lifetime = not_after - issued_at;
    not_after - lifetime / 2
}

/// The moment activation of the next generation becomes due: five-sixths
/// of the lifetime.
pub(crate) fn activation_threshold(
    issued_at: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> DateTime<Utc> {
    let lifetime = not_after - issued_at;
    not_after - lifetime / 6
}

pub(crate) trait Slot {
    fn id(&self) -> SlotId;
}

/// A holder for one generation of X509 CA material.
#[derive(Debug, Clone)]
pub(crate) struct X509CaSlot {
    id: SlotId,
    issued_at: DateTime<Utc>,
    ca: Option<Arc<X509Ca>>,
}

impl X509CaSlot {
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            issued_at: DateTime::UNIX_EPOCH,
            ca: None,
        }
    }

    pub fn with_material(id: SlotId, issued_at: DateTime<Utc>, ca: Arc<X509Ca>) -> Self {
        Self {
            id,
            issued_at,
            ca: Some(ca),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ca.is_none()
    }

    pub fn reset(&mut self) {
        self.ca = None;
    }

    pub fn set(&mut self, issued_at: DateTime<Utc>, ca: Arc<X509Ca>) {
        self.issued_at = issued_at;
        self.ca = Some(ca);
    }

    pub fn ca(&self) -> Option<&Arc<X509Ca>> {
        self.ca.as_ref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn should_prepare_next(&self, now: DateTime<Utc>) -> bool {
        match &self.ca {
            Some(ca) => now > preparation_threshold(self.issued_at, ca.not_after()),
            None => false,
        }
    }

    pub fn should_activate_next(&self, now: DateTime<Utc>) -> bool {
        match &self.ca {
            Some(ca) => now > activation_threshold(self.issued_at, ca.not_after()),
            None => false,
        }
    }
}

impl Slot for X509CaSlot {
    fn id(&self) -> SlotId {
        self.id
    }
}

/// A holder for one generation of JWT key material.
///
/// Unlike the X509 slots, an empty JWT slot reports both thresholds as
/// crossed: "no material" means "needs material now".
#[derive(Debug, Clone)]
pub(crate) struct JwtKeySlot {
    id: SlotId,
    issued_at: DateTime<Utc>,
    jwt_key: Option<Arc<JwtKey>>,
}

impl JwtKeySlot {
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            issued_at: DateTime::UNIX_EPOCH,
            jwt_key: None,
        }
    }

    pub fn with_material(id: SlotId, issued_at: DateTime<Utc>, jwt_key: Arc<JwtKey>) -> Self {
        Self {
            id,
            issued_at,
            jwt_key: Some(jwt_key),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jwt_key.is_none()
    }

    pub fn reset(&mut self) {
        self.jwt_key = None;
    }

    pub fn set(&mut self, issued_at: DateTime<Utc>, jwt_key: Arc<JwtKey>) {
        self.issued_at = issued_at;
        self.jwt_key = Some(jwt_key);
    }

    pub fn jwt_key(&self) -> Option<&Arc<JwtKey>> {
        self.jwt_key.as_ref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn should_prepare_next(&self, now: DateTime<Utc>) -> bool {
        match &self.jwt_key {
            Some(key) => now > preparation_threshold(self.issued_at, key.not_after()),
            None => true,
        }
    }

    pub fn should_activate_next(&self, now: DateTime<Utc>) -> bool {
        match &self.jwt_key {
            Some(key) => now > activation_threshold(self.issued_at, key.not_after()),
            None => true,
        }
    }
}

impl Slot for JwtKeySlot {
    fn id(&self) -> SlotId {
        self.id
    }
}

/// The two slots of one kind, with a marker for which is current.
///
/// The slots live in a fixed array indexed by [`SlotId`]; the activation
/// swap only moves the marker.
#[derive(Debug)]
pub(crate) struct SlotPair<S> {
    slots: [S; 2],
    current: SlotId,
}

impl<S: Slot> SlotPair<S> {
    /// Builds a pair from a current and a next slot with distinct ids.
    pub fn new(current: S, next: S) -> Self {
        debug_assert_ne!(current.id(), next.id());
        let current_id = current.id();
        let mut slots = [current, next];
        slots.sort_by_key(|slot| slot.id().index());
        Self {
            slots,
            current: current_id,
        }
    }

    pub fn current(&self) -> &S {
        &self.slots[self.current.index()]
    }

    pub fn next(&self) -> &S {
        &self.slots[self.current.other().index()]
    }

    pub fn next_mut(&mut self) -> &mut S {
        &mut self.slots[self.current.other().index()]
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut S {
        &mut self.slots[id.index()]
    }

    /// Makes the prepared slot current and the displaced slot next.
    pub fn swap(&mut self) {
        self.current = self.current.other();
    }
}
