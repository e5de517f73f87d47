//! Address-range interceptors for guest memory (MMIO redirection).
//!
//! Descriptors are consulted only for LOAD/STORE instructions whose address
//! is a compile-time constant. The chain is scanned in registration order
//! and the first descriptor that claims the address wins.

use std::fmt;
use std::ops::Range;

/// Device behind an intercepted address range.
///
/// The handler object is the opaque context the lowered code hands back on
/// every access. Values are exchanged zero-extended to 64 bits, in host byte
/// order.
pub trait AccessHandler: Send + Sync {
    fn handles(&self, address: u64) -> bool;
    fn read(&self, address: u64) -> u64;
    fn write(&self, address: u64, value: u64);
}

/// A named entry of the [`AccessChain`].
pub struct AccessDescriptor {
    name: String,
    handler: Box<dyn AccessHandler>,
}

impl AccessDescriptor {
    pub fn new(name: impl Into<String>, handler: impl AccessHandler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Box::new(handler),
        }
    }

    /// Descriptor for a half-open address range backed by two closures.
    pub fn range<R, W>(name: impl Into<String>, range: Range<u64>, read: R, write: W) -> Self
    where
        R: Fn(u64) -> u64 + Send + Sync + 'static,
        W: Fn(u64, u64) + Send + Sync + 'static,
    {
        Self::new(name, RangeHandler { range, read, write })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handles(&self, address: u64) -> bool {
        self.handler.handles(address)
    }

    pub fn read(&self, address: u64) -> u64 {
        self.handler.read(address)
    }

    pub fn write(&self, address: u64, value: u64) {
        self.handler.write(address, value)
    }
}

impl fmt::Debug for AccessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct RangeHandler<R, W> {
    range: Range<u64>,
    read: R,
    write: W,
}

impl<R, W> AccessHandler for RangeHandler<R, W>
where
    R: Fn(u64) -> u64 + Send + Sync,
    W: Fn(u64, u64) + Send + Sync,
{
    fn handles(&self, address: u64) -> bool {
        self.range.contains(&address)
    }

    fn read(&self, address: u64) -> u64 {
        (self.read)(address)
    }

    fn write(&self, address: u64, value: u64) {
        (self.write)(address, value)
    }
}

/// Ordered, append-only list of descriptors.
///
/// Only reachable mutably through
/// [`GuestRuntimeBuilder`](super::GuestRuntimeBuilder), so the chain is
/// frozen before any compilation can observe it.
#[derive(Debug, Default)]
pub struct AccessChain {
    descriptors: Vec<AccessDescriptor>,
}

impl AccessChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: AccessDescriptor) {
        log::debug!(
            "[MMIO] Registered access descriptor '{}' at position {}",
            descriptor.name(),
            self.descriptors.len()
        );
        self.descriptors.push(descriptor);
    }

    /// First descriptor, in registration order, that handles `address`.
    pub fn find(&self, address: u64) -> Option<&AccessDescriptor> {
        self.descriptors.iter().find(|d| d.handles(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_first_match_wins_in_registration_order() {
        let mut chain = AccessChain::new();
        chain.register(AccessDescriptor::range("gpu", 0x7FC8_0000..0x7FCC_0000, |_| 1, |_, _| {}));
        chain.register(AccessDescriptor::range("wide", 0x7F00_0000..0x8000_0000, |_| 2, |_, _| {}));

        let hit = chain.find(0x7FC8_0010).unwrap();
        assert_eq!(hit.name(), "gpu");
        assert_eq!(hit.read(0x7FC8_0010), 1);
        assert_eq!(chain.find(0x7F00_0004).unwrap().name(), "wide");
        assert!(chain.find(0x1000).is_none());
        assert_eq!(chain.iter().map(|d| d.name()).collect::<Vec<_>>(), ["gpu", "wide"]);
    }

    #[test]
    fn test_range_descriptor_routes_writes() {
        let last = Arc::new(AtomicU64::new(0));
        let sink = last.clone();
        let desc = AccessDescriptor::range(
            "reg",
            0x100..0x104,
            |_| 0,
            move |_, value| sink.store(value, Ordering::SeqCst),
        );
        assert!(desc.handles(0x100));
        assert!(!desc.handles(0x104));
        desc.write(0x100, 0xABCD);
        assert_eq!(last.load(Ordering::SeqCst), 0xABCD);
    }
}
