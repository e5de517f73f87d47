//! Collaborators the generated code calls back into at runtime.
//!
//! A [`GuestRuntime`] bundles the function resolver, the frozen access
//! descriptor chain and the optional trace sink. Compiled functions embed a
//! pointer to it and keep the `Arc` alive for as long as their code exists.

pub mod access;
pub mod thunks;
pub mod trace;

pub use access::{AccessChain, AccessDescriptor, AccessHandler};
pub use trace::{TraceBuffer, TraceEvent, TraceKind, TraceSink, TraceValue};

use crate::error::ResolveError;
use crate::hir::FunctionSymbol;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Turns guest call targets into native entry points.
///
/// Called from generated code through the resolve thunks, possibly while
/// the calling function is executing. Implementations may compile on demand.
pub trait FunctionResolver: Send + Sync {
    /// Native entry for a direct-call symbol.
    fn resolve_symbol(&self, symbol: &FunctionSymbol) -> Result<*const u8, ResolveError>;

    /// Native entry for a computed guest address.
    fn resolve_address(&self, address: u64) -> Result<*const u8, ResolveError>;

    /// A resolution failed at runtime. Execution continues past the call.
    fn fault(&self, _fault: &GuestFault) {}
}

/// Runtime record of a call that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFault {
    /// Guest address of the call target.
    pub target: u64,
    pub error: ResolveError,
}

/// Resolver backed by a fixed address table.
///
/// Symbols that already carry a native entry resolve to it directly.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: RwLock<HashMap<u64, usize>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: u64, entry: *const u8) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(address, entry as usize);
        }
    }

    fn lookup(&self, address: u64) -> Option<*const u8> {
        let entries = self.entries.read().ok()?;
        entries.get(&address).map(|&entry| entry as *const u8)
    }
}

impl FunctionResolver for StaticResolver {
    fn resolve_symbol(&self, symbol: &FunctionSymbol) -> Result<*const u8, ResolveError> {
        symbol
            .entry()
            .or_else(|| self.lookup(symbol.address))
            .ok_or_else(|| ResolveError::Unresolved {
                name: symbol.name.clone(),
                address: symbol.address,
            })
    }

    fn resolve_address(&self, address: u64) -> Result<*const u8, ResolveError> {
        self.lookup(address)
            .ok_or(ResolveError::InvalidAddress(address))
    }
}

/// Everything lowered code may call back into.
pub struct GuestRuntime {
    resolver: Box<dyn FunctionResolver>,
    access: AccessChain,
    tracer: Option<Box<dyn TraceSink>>,
    fault: Mutex<Option<GuestFault>>,
    clock_origin: Instant,
}

impl GuestRuntime {
    pub fn builder() -> GuestRuntimeBuilder {
        GuestRuntimeBuilder::default()
    }

    /// Runtime with an empty [`StaticResolver`], no descriptors and no sink.
    pub fn standalone() -> Arc<GuestRuntime> {
        Self::builder().build()
    }

    pub fn resolver(&self) -> &dyn FunctionResolver {
        self.resolver.as_ref()
    }

    pub fn access_chain(&self) -> &AccessChain {
        &self.access
    }

    /// Take the most recent unresolved-call fault, if any.
    pub fn take_fault(&self) -> Option<GuestFault> {
        self.fault.lock().ok().and_then(|mut fault| fault.take())
    }

    pub(crate) fn raise(&self, fault: GuestFault) {
        log::warn!(
            "[RUNTIME] Unresolved guest call to {:#x}: {}",
            fault.target,
            fault.error
        );
        self.resolver.fault(&fault);
        if let Ok(mut slot) = self.fault.lock() {
            *slot = Some(fault);
        }
    }

    pub(crate) fn trace(&self, event: TraceEvent) {
        match &self.tracer {
            Some(sink) => sink.record(event),
            None => log::trace!("[TRACE] {event}"),
        }
    }

    /// Nanoseconds since the runtime was built.
    pub(crate) fn clock(&self) -> u64 {
        self.clock_origin.elapsed().as_nanos() as u64
    }
}

/// Collects the runtime's collaborators. The access chain can only be
/// extended here, before any code is lowered against it.
#[derive(Default)]
pub struct GuestRuntimeBuilder {
    resolver: Option<Box<dyn FunctionResolver>>,
    access: AccessChain,
    tracer: Option<Box<dyn TraceSink>>,
}

impl GuestRuntimeBuilder {
    pub fn resolver(mut self, resolver: impl FunctionResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Append an access descriptor to the chain.
    pub fn access(mut self, descriptor: AccessDescriptor) -> Self {
        self.access.register(descriptor);
        self
    }

    pub fn tracer(mut self, sink: impl TraceSink + 'static) -> Self {
        self.tracer = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Arc<GuestRuntime> {
        Arc::new(GuestRuntime {
            resolver: self
                .resolver
                .unwrap_or_else(|| Box::new(StaticResolver::new())),
            access: self.access,
            tracer: self.tracer,
            fault: Mutex::new(None),
            clock_origin: Instant::now(),
        })
    }
}

impl<T: FunctionResolver + ?Sized> FunctionResolver for Arc<T> {
    fn resolve_symbol(&self, symbol: &FunctionSymbol) -> Result<*const u8, ResolveError> {
        (**self).resolve_symbol(symbol)
    }

    fn resolve_address(&self, address: u64) -> Result<*const u8, ResolveError> {
        (**self).resolve_address(address)
    }

    fn fault(&self, fault: &GuestFault) {
        (**self).fault(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver_prefers_symbol_entry() {
        let resolver = StaticResolver::new();
        let registered = 0x2000usize as *const u8;
        resolver.register(0x8200_0000, registered);

        let sym = FunctionSymbol::user(0x8200_0000, "f");
        assert_eq!(resolver.resolve_symbol(&sym), Ok(registered));

        let own = 0x3000usize as *const u8;
        sym.set_entry(own);
        assert_eq!(resolver.resolve_symbol(&sym), Ok(own));

        assert_eq!(
            resolver.resolve_address(0x1234),
            Err(ResolveError::InvalidAddress(0x1234))
        );
    }

    #[test]
    fn test_fault_is_recorded_once() {
        let runtime = GuestRuntime::standalone();
        runtime.raise(GuestFault {
            target: 0x10,
            error: ResolveError::InvalidAddress(0x10),
        });
        assert_eq!(runtime.take_fault().map(|f| f.target), Some(0x10));
        assert!(runtime.take_fault().is_none());
    }

    #[test]
    fn test_builder_freezes_access_chain() {
        let runtime = GuestRuntime::builder()
            .access(AccessDescriptor::range("a", 0..4, |_| 0, |_, _| {}))
            .access(AccessDescriptor::range("b", 4..8, |_| 0, |_, _| {}))
            .build();
        assert_eq!(runtime.access_chain().len(), 2);
        assert_eq!(runtime.access_chain().find(5).map(|d| d.name()), Some("b"));
    }
}
