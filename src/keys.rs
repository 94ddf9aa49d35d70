use std::sync::Arc;

use mio::net::TcpListener;
use mio::{Interest, Token};

use crate::connect::ConnectRequest;
use crate::endpoint::SelectableEndpoint;

/// The tagged union a selection key's attachment is one of (spec §3, and
/// design note: reflective `instanceof` dispatch becomes a discriminated
/// union rather than runtime type tests).
pub(crate) enum Attachment {
    Endpoint(Arc<dyn SelectableEndpoint>),
    Connect(Arc<ConnectRequest>),
    Acceptor(TcpListener),
    /// Placeholder for a token allocated via `KeyTable::reserve` whose
    /// real attachment is filled in once registration with the real
    /// token has succeeded (needed because `mio` ties a token to a
    /// registration at call time, so the token must exist before the
    /// channel that will own it is ready to be stored).
    Reserved,
}

pub(crate) struct KeyEntry {
    /// `None` until the channel is actually registered with the
    /// multiplexer. Active-accept channels start in this state (spec
    /// §4.4: "register ... with interest 0") since `mio::Interest` has no
    /// zero value; the key's first `ModifyInterest` update performs the
    /// real registration (`SelectableEndpoint::register`) rather than a
    /// `reregister` against a never-added fd.
    pub interest: Option<Interest>,
    pub attachment: Attachment,
}

/// Per-channel registration table, indexed by `Token`. A free list keeps
/// allocation O(1) and token reuse tight, the way a slab would.
#[derive(Default)]
pub(crate) struct KeyTable {
    entries: Vec<Option<KeyEntry>>,
    free: Vec<usize>,
}

impl KeyTable {
    pub fn new() -> Self {
        KeyTable {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: KeyEntry) -> Token {
        if let Some(idx) = self.free.pop() {
            self.entries[idx] = Some(entry);
            Token(idx)
        } else {
            let idx = self.entries.len();
            self.entries.push(Some(entry));
            Token(idx)
        }
    }

    /// Allocates a token up front, before the attachment that will own
    /// it is ready to construct (see `Attachment::Reserved`).
    pub fn reserve(&mut self) -> Token {
        self.insert(KeyEntry {
            interest: None,
            attachment: Attachment::Reserved,
        })
    }

    /// Fills in a token allocated by `reserve`.
    pub fn fill(&mut self, token: Token, entry: KeyEntry) {
        if let Some(slot) = self.entries.get_mut(token.0) {
            *slot = Some(entry);
        }
    }

    pub fn remove(&mut self, token: Token) -> Option<KeyEntry> {
        let idx = token.0;
        let slot = self.entries.get_mut(idx)?;
        let entry = slot.take();
        if entry.is_some() {
            self.free.push(idx);
        }
        entry
    }

    pub fn get(&self, token: Token) -> Option<&KeyEntry> {
        self.entries.get(token.0).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut KeyEntry> {
        self.entries.get_mut(token.0).and_then(|e| e.as_mut())
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, &KeyEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|e| (Token(idx), e)))
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.iter().map(|(t, _)| t).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved() -> KeyEntry {
        KeyEntry {
            interest: None,
            attachment: Attachment::Reserved,
        }
    }

    #[test]
    fn insert_then_remove_frees_the_slot_for_reuse() {
        let mut keys = KeyTable::new();
        let a = keys.insert(reserved());
        let b = keys.insert(reserved());
        assert_eq!(a, Token(0));
        assert_eq!(b, Token(1));

        assert!(keys.remove(a).is_some());
        assert_eq!(keys.len(), 1);

        let c = keys.insert(reserved());
        assert_eq!(c, a, "freed token should be reused before growing");
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn reserve_then_fill_replaces_the_placeholder() {
        let mut keys = KeyTable::new();
        let token = keys.reserve();
        assert!(matches!(keys.get(token).unwrap().attachment, Attachment::Reserved));

        keys.fill(
            token,
            KeyEntry {
                interest: Some(Interest::READABLE),
                attachment: Attachment::Reserved,
            },
        );
        assert_eq!(keys.get(token).unwrap().interest, Some(Interest::READABLE));
    }

    #[test]
    fn remove_unknown_token_is_a_harmless_none() {
        let mut keys = KeyTable::new();
        assert!(keys.remove(Token(42)).is_none());
    }

    #[test]
    fn tokens_and_len_agree_after_mixed_operations() {
        let mut keys = KeyTable::new();
        let a = keys.insert(reserved());
        let _b = keys.insert(reserved());
        keys.remove(a);
        let _c = keys.insert(reserved());
        assert_eq!(keys.len(), keys.tokens().len());
        assert_eq!(keys.len(), 2);
    }
}
