use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::le::Addr;

use super::*;

/// Maximum attribute value length ([Vol 3] Part F, Section 3.2.9).
pub const MAX_VAL_LEN: usize = 512;

/// Attribute value store. Each attribute has a committed value, and each
/// client may additionally hold pending values prepared during a reliable
/// write transaction. Pending values never affect reads; they replace the
/// committed values only when the client's transaction is executed.
#[derive(Clone, Debug, Default)]
pub struct ValueStore {
    vals: BTreeMap<Handle, Vec<u8>>,
    prepared: HashMap<Addr, BTreeMap<Handle, Vec<u8>>>,
}

impl ValueStore {
    /// Sets the committed value of attribute `hdl`.
    #[inline]
    pub fn insert(&mut self, hdl: Handle, v: impl Into<Vec<u8>>) {
        self.vals.insert(hdl, v.into());
    }

    /// Returns the committed value of attribute `hdl`.
    #[inline]
    #[must_use]
    pub fn get(&self, hdl: Handle) -> Option<&[u8]> {
        self.vals.get(&hdl).map(Vec::as_slice)
    }

    /// Returns the value prepared by `client` for attribute `hdl`.
    #[inline]
    #[must_use]
    pub fn pending(&self, client: Addr, hdl: Handle) -> Option<&[u8]> {
        (self.prepared.get(&client))
            .and_then(|p| p.get(&hdl))
            .map(Vec::as_slice)
    }

    /// Returns the committed value starting at offset `off`, truncated to at
    /// most `max` bytes.
    pub fn read(&self, hdl: Handle, off: usize, max: usize) -> Result<Vec<u8>, Status> {
        let v = self.vals.get(&hdl).ok_or(Status::InvalidHandle)?;
        let v = v.get(off..).ok_or(Status::InvalidOffset)?;
        Ok(v[..v.len().min(max)].to_vec())
    }

    /// Writes `v` to the committed value at offset `off`.
    pub fn write(&mut self, hdl: Handle, off: usize, v: &[u8]) -> Result<(), Status> {
        let dst = self.vals.get_mut(&hdl).ok_or(Status::InvalidHandle)?;
        update(dst, off, v)
    }

    /// Stages a write of `v` at offset `off` in the reliable write transaction
    /// of `client`. The first prepared write to an attribute starts from its
    /// committed value.
    pub fn prepare(&mut self, client: Addr, hdl: Handle, off: usize, v: &[u8]) -> Result<(), Status> {
        let cur = self.vals.get(&hdl).ok_or(Status::InvalidHandle)?;
        let dst = (self.prepared.entry(client).or_default())
            .entry(hdl)
            .or_insert_with(|| cur.clone());
        update(dst, off, v)
    }

    /// Commits all values prepared by `client` and returns the number of
    /// attributes that were updated.
    pub fn execute(&mut self, client: Addr) -> usize {
        let Some(p) = self.prepared.remove(&client) else { return 0 };
        let n = p.len();
        for (hdl, v) in p {
            trace!("Committing {hdl} = {v:02X?}");
            self.vals.insert(hdl, v);
        }
        n
    }

    /// Discards all values prepared by `client` and returns the number of
    /// attributes that were discarded.
    #[inline]
    pub fn abort(&mut self, client: Addr) -> usize {
        self.prepared.remove(&client).map_or(0, |p| p.len())
    }
}

/// Replaces the tail of `dst` starting at `off` with `v`.
fn update(dst: &mut Vec<u8>, off: usize, v: &[u8]) -> Result<(), Status> {
    if off > dst.len() {
        return Err(Status::InvalidOffset);
    }
    if off + v.len() > MAX_VAL_LEN {
        return Err(Status::InvalidAttributeValueLength);
    }
    dst.truncate(off);
    dst.extend_from_slice(v);
    Ok(())
}
