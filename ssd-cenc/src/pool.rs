//! Fragment pools: id-indexed crypto configuration shared by every sample
//! decrypted under that id.

use crate::{
    Error, Result,
    key::KeyId,
    sample::{EncryptionScheme, Pattern},
};
use std::sync::Arc;

/// Identifier handed out by [`crate::Session::add_pool`].
pub type PoolId = u32;

/// Per-fragment crypto parameters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CryptoInfo {
    pub scheme: EncryptionScheme,
    pub pattern: Pattern,
    /// Size of per-sample IVs (8 or 16), 0 when a constant IV is used.
    pub iv_size: u8,
}

/// Configuration applied to every sample decrypted through one pool.
#[derive(Clone, Debug, Default)]
pub struct FragmentInfo {
    /// Key for the samples, `None` falls back to the session's default key id.
    pub key_id: Option<KeyId>,
    /// Size of NAL unit length prefixes, 0 for streams without NAL structure.
    pub nal_length_size: u8,
    /// Annex-B parameter sets prepended to converted samples.
    pub parameter_sets: Vec<u8>,
    /// Convert decrypted samples to Annex-B start code form.
    pub annexb: bool,
    pub crypto: CryptoInfo,
}

impl FragmentInfo {
    pub fn new(key_id: KeyId, crypto: CryptoInfo) -> Self {
        Self {
            key_id: Some(key_id),
            crypto,
            ..Default::default()
        }
    }
}

/// Pool slots with a free list, removed ids are reused.
#[derive(Default)]
pub(crate) struct PoolTable {
    slots: Vec<Option<Arc<FragmentInfo>>>,
    free: Vec<PoolId>,
}

impl PoolTable {
    pub(crate) fn add(&mut self, info: FragmentInfo) -> PoolId {
        let info = Some(Arc::new(info));

        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = info;
            id
        } else {
            self.slots.push(info);
            (self.slots.len() - 1) as PoolId
        }
    }

    /// Replace the pool entry wholesale. Decrypts already holding the
    /// previous entry keep using it.
    pub(crate) fn set(&mut self, id: PoolId, info: FragmentInfo) -> Result<()> {
        match self.slots.get_mut(id as usize) {
            Some(Some(slot)) => {
                *slot = Arc::new(info);
                Ok(())
            }
            _ => Err(Error::UnknownPool(id)),
        }
    }

    pub(crate) fn remove(&mut self, id: PoolId) -> Result<()> {
        match self.slots.get_mut(id as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(id);
                Ok(())
            }
            _ => Err(Error::UnknownPool(id)),
        }
    }

    pub(crate) fn get(&self, id: PoolId) -> Result<Arc<FragmentInfo>> {
        self.slots
            .get(id as usize)
            .and_then(|x| x.clone())
            .ok_or(Error::UnknownPool(id))
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|x| x.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(byte: u8) -> FragmentInfo {
        FragmentInfo::new(KeyId::from([byte; 16]), CryptoInfo::default())
    }

    #[test]
    fn ids_are_reused_after_removal() {
        let mut table = PoolTable::default();
        let a = table.add(info(1));
        let b = table.add(info(2));
        assert_eq!((a, b), (0, 1));

        table.remove(a).unwrap();
        assert!(matches!(table.remove(a), Err(Error::UnknownPool(0))));
        assert!(matches!(table.get(a), Err(Error::UnknownPool(0))));
        assert_eq!(table.add(info(3)), a);
        assert_eq!(table.len(), 2);

        table.clear();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unknown_pool() {
        let mut table = PoolTable::default();
        assert!(matches!(table.get(7), Err(Error::UnknownPool(7))));
        assert!(matches!(table.set(7, info(1)), Err(Error::UnknownPool(7))));

        let id = table.add(info(1));
        table.set(id, info(2)).unwrap();
        assert_eq!(table.get(id).unwrap().key_id, Some(KeyId::from([2; 16])));
    }

    #[test]
    fn replacement_keeps_old_entry_alive() {
        let mut table = PoolTable::default();
        let id = table.add(info(1));
        let in_flight = table.get(id).unwrap();

        table.set(id, info(2)).unwrap();
        assert_eq!(in_flight.key_id, Some(KeyId::from([1; 16])));
        assert_eq!(table.get(id).unwrap().key_id, Some(KeyId::from([2; 16])));
    }
}
