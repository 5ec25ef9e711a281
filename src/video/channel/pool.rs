use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Hardware encoder channels on the reference board
pub static ENCODE_POOL: ChannelPool = ChannelPool::new("venc", 16);
/// Hardware decoder channels on the reference board
pub static DECODE_POOL: ChannelPool = ChannelPool::new("vdec", 16);

/// Fixed-size set of channel indices
///
/// Indices are handed out as [`ChannelSlot`]s that give the index back when
/// dropped, so an error path can never leak one.
pub struct ChannelPool {
    name: &'static str,
    capacity: u32,
    used: Mutex<u32>,
}

impl ChannelPool {
    /// `capacity` is capped at 32
    pub const fn new(name: &'static str, capacity: u32) -> Self {
        Self {
            name,
            capacity: if capacity > 32 { 32 } else { capacity },
            used: parking_lot::const_mutex(0),
        }
    }

    /// Claim the lowest free index
    pub fn acquire(&self) -> Result<ChannelSlot<'_>> {
        let mut used = self.used.lock();
        let id = (0..self.capacity).find(|i| *used & (1 << i) == 0).ok_or_else(|| {
            AppError::ResourceBusy(format!(
                "all {} {} channels are in use",
                self.capacity, self.name
            ))
        })?;
        *used |= 1 << id;
        debug!("{} channel {} acquired", self.name, id);
        Ok(ChannelSlot { pool: self, id })
    }

    fn release(&self, id: u32) {
        let mut used = self.used.lock();
        if *used & (1 << id) == 0 {
            warn!("{} channel {} released twice", self.name, id);
        }
        *used &= !(1 << id);
        debug!("{} channel {} released", self.name, id);
    }

    pub fn in_use(&self) -> u32 {
        self.used.lock().count_ones()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A claimed channel index, returned to its pool on drop
pub struct ChannelSlot<'a> {
    pool: &'a ChannelPool,
    id: u32,
}

impl ChannelSlot<'_> {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for ChannelSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.pool.name, self.id)
    }
}

impl Drop for ChannelSlot<'_> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_release() {
        let pool = ChannelPool::new("test", 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert!(matches!(pool.acquire(), Err(AppError::ResourceBusy(_))));

        drop(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.acquire().unwrap();
        assert_eq!(c.id(), 0);
    }

    #[test]
    fn test_slot_released_on_error_path() {
        let pool = ChannelPool::new("test", 1);
        let attempt = || -> Result<()> {
            let _slot = pool.acquire()?;
            Err(AppError::Runtime("codec init failed".to_string()))
        };
        assert!(attempt().is_err());
        assert_eq!(pool.in_use(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_capacity_capped() {
        let pool = ChannelPool::new("wide", 64);
        assert_eq!(pool.capacity(), 32);
    }
}
