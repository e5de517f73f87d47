//! Data tracing for lowered code.
//!
//! When tracing is compiled in, generated code calls a typed tracer after
//! every context and guest-memory access. The tracer forwards a
//! [`TraceEvent`] to the runtime's [`TraceSink`], or to the `log` facade at
//! trace level when no sink is installed.

use crate::hir::{TypeName, Vec128};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// What kind of access was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    ContextLoad,
    ContextStore,
    MemoryLoad,
    MemoryStore,
    Comment,
}

/// Observed value.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceValue {
    Int(u64),
    F32(f32),
    F64(f64),
    V128(Vec128),
    Text(String),
}

/// One traced access.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub ty: TypeName,
    /// Context offset or guest address.
    pub offset: u64,
    pub value: TraceValue,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            TraceValue::Text(text) => write!(f, "{:?} {}", self.kind, text),
            TraceValue::Int(v) => write!(f, "{:?} {} [{:#x}] = {:#x}", self.kind, self.ty, self.offset, v),
            TraceValue::F32(v) => write!(f, "{:?} {} [{:#x}] = {}", self.kind, self.ty, self.offset, v),
            TraceValue::F64(v) => write!(f, "{:?} {} [{:#x}] = {}", self.kind, self.ty, self.offset, v),
            TraceValue::V128(v) => write!(
                f,
                "{:?} {} [{:#x}] = {:08x?}",
                self.kind,
                self.ty,
                self.offset,
                v.lanes()
            ),
        }
    }
}

/// Receiver for traced accesses. Called from generated code, so
/// implementations must not panic.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// Trace sink with ring-buffer semantics.
pub struct TraceBuffer {
    events: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
    enabled: AtomicBool,
    /// Sequence number for ordering
    sequence: AtomicU64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            enabled: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn push(&self, event: TraceEvent) {
        if !self.is_enabled() {
            return;
        }
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        self.sequence.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
        self.sequence.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the buffered events, oldest first.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events pushed since the last clear, including evicted ones.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl TraceSink for TraceBuffer {
    fn record(&self, event: TraceEvent) {
        self.push(event);
    }
}

impl<T: TraceSink + ?Sized> TraceSink for std::sync::Arc<T> {
    fn record(&self, event: TraceEvent) {
        (**self).record(event)
    }
}
