//! Per-thread heap pools
//!
//! Three slab pools with free lists back a thread's dynamic values:
//!
//! - `GcPool` - refcounted gc values (strings, bytes, containers, object
//!   instances, closures)
//! - `IterPool` - iterator structs created by NEWITERATOR
//! - `ProgressPool` - per-call persistent state of suspendable native
//!   functions
//!
//! Allocation returns an index handle; the pool is destroyed wholesale at
//! thread teardown. Gc values carry two separate reference counts: the
//! external count tracks stack slots and globals (reachable roots), the
//! heap count tracks references held inside other gc values. A value is
//! freed when both reach zero.
//!
//! Counts are plain integers, not atomics: a pool is only ever touched by
//! the thread that owns it. Parallel threads own private pools; the main
//! thread shares one pool set with the other non-parallel threads, which
//! all run serialized on the main worker.

use crate::hstring::{HBytes, HString};
use crate::list::{VecEntry, VmList, VmVector};
use crate::map::{VmMap, VmSet};
use crate::value::{ClassId, FuncId, GcRef, IterRef, Value};
use std::cell::Cell;

/// Allocation failure inside a pool or container growth path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OomError;

impl std::fmt::Display for OomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "out of memory")
    }
}

impl std::error::Error for OomError {}

/// Closure payload: target function plus captured bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureInfo {
    pub func_id: FuncId,
    pub bound_self: Option<Value>,
    pub bound_args: Box<[Value]>,
}

#[derive(Debug, PartialEq)]
pub enum GcKind {
    Str(HString),
    Bytes(HBytes),
    List(VmList),
    Map(VmMap),
    Set(VmSet),
    Vector(VmVector),
    Instance {
        class_id: ClassId,
        varattrs: Box<[Value]>,
    },
    Closure(ClosureInfo),
}

#[derive(Debug)]
pub struct GcObj {
    pub externalref: u32,
    pub heapref: u32,
    /// 0 = uncomputed. Interior mutability so hashing can fill the cache
    /// behind a shared borrow.
    pub cached_hash: Cell<u32>,
    pub kind: GcKind,
}

/// Slab of gc values with a free list.
#[derive(Debug, Default)]
pub struct GcPool {
    slots: Vec<Option<GcObj>>,
    free: Vec<u32>,
}

impl GcPool {
    pub fn new() -> Self {
        GcPool::default()
    }

    /// Number of live objects, for diagnostics and leak tests.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn alloc(&mut self, kind: GcKind) -> Result<GcRef, OomError> {
        let obj = GcObj {
            externalref: 0,
            heapref: 0,
            cached_hash: Cell::new(0),
            kind,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(obj);
            return Ok(GcRef(idx));
        }
        self.slots.try_reserve(1).map_err(|_| OomError)?;
        let idx = self.slots.len() as u32;
        self.slots.push(Some(obj));
        Ok(GcRef(idx))
    }

    pub fn get(&self, r: GcRef) -> &GcObj {
        self.slots[r.0 as usize]
            .as_ref()
            .expect("stale gc handle")
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut GcObj {
        self.slots[r.0 as usize]
            .as_mut()
            .expect("stale gc handle")
    }

    pub fn set_cached_hash(&self, r: GcRef, h: u32) {
        self.get(r).cached_hash.set(h);
    }

    /// Take an object out of its slot for mutation that also needs pool
    /// access (container refcount updates). Must be paired with
    /// `put_back`.
    pub fn take(&mut self, r: GcRef) -> GcObj {
        self.slots[r.0 as usize].take().expect("stale gc handle")
    }

    pub fn put_back(&mut self, r: GcRef, obj: GcObj) {
        debug_assert!(self.slots[r.0 as usize].is_none());
        self.slots[r.0 as usize] = Some(obj);
    }

    pub fn retain_external(&mut self, r: GcRef) {
        self.get_mut(r).externalref += 1;
    }

    pub fn retain_heap(&mut self, r: GcRef) {
        self.get_mut(r).heapref += 1;
    }

    pub fn release_external(&mut self, r: GcRef) {
        let obj = self.get_mut(r);
        debug_assert!(obj.externalref > 0);
        obj.externalref -= 1;
        if obj.externalref == 0 && obj.heapref == 0 {
            self.free_cascade(r);
        }
    }

    pub fn release_heap(&mut self, r: GcRef) {
        let obj = self.get_mut(r);
        debug_assert!(obj.heapref > 0);
        obj.heapref -= 1;
        if obj.externalref == 0 && obj.heapref == 0 {
            self.free_cascade(r);
        }
    }

    /// Free an object and drop the heap references it holds, iteratively
    /// so arbitrarily deep object graphs cannot overflow the Rust stack.
    fn free_cascade(&mut self, first: GcRef) {
        let mut worklist = vec![first];
        while let Some(r) = worklist.pop() {
            let obj = match self.slots[r.0 as usize].take() {
                Some(o) => o,
                None => continue,
            };
            self.free.push(r.0);
            let mut inner: Vec<Value> = Vec::new();
            match obj.kind {
                GcKind::Str(_) | GcKind::Bytes(_) | GcKind::Vector(_) => {}
                GcKind::List(l) => l.drain_into(&mut inner),
                GcKind::Map(m) => m.drain_into(&mut inner),
                GcKind::Set(s) => s.drain_into(&mut inner),
                GcKind::Instance { varattrs, .. } => inner.extend(varattrs.into_vec()),
                GcKind::Closure(c) => {
                    if let Some(v) = c.bound_self {
                        inner.push(v);
                    }
                    inner.extend(c.bound_args.into_vec());
                }
            }
            for v in inner {
                if let Value::Gc(child) = v {
                    let child_obj = self.get_mut(child);
                    debug_assert!(child_obj.heapref > 0);
                    child_obj.heapref -= 1;
                    if child_obj.heapref == 0 && child_obj.externalref == 0 {
                        worklist.push(child);
                    }
                }
            }
        }
    }
}

/// What an iterator walks: a gc container pinned with the revision seen at
/// creation, or vector components copied out at creation.
#[derive(Debug)]
pub enum IterTarget {
    Container { gcref: GcRef, revision: u64 },
    Vector(Vec<VecEntry>),
}

#[derive(Debug)]
pub struct IterState {
    pub target: IterTarget,
    /// 0-based position, incremented before each element fetch.
    pub idx: u64,
    /// Fixed at creation.
    pub len: u64,
}

#[derive(Debug, Default)]
pub struct IterPool {
    slots: Vec<Option<IterState>>,
    free: Vec<u32>,
}

impl IterPool {
    pub fn new() -> Self {
        IterPool::default()
    }

    pub fn alloc(&mut self, state: IterState) -> Result<IterRef, OomError> {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(state);
            return Ok(IterRef(idx));
        }
        self.slots.try_reserve(1).map_err(|_| OomError)?;
        let idx = self.slots.len() as u32;
        self.slots.push(Some(state));
        Ok(IterRef(idx))
    }

    pub fn get_mut(&mut self, r: IterRef) -> &mut IterState {
        self.slots[r.0 as usize]
            .as_mut()
            .expect("stale iterator handle")
    }

    pub fn free(&mut self, r: IterRef) -> IterState {
        let state = self.slots[r.0 as usize]
            .take()
            .expect("stale iterator handle");
        self.free.push(r.0);
        state
    }
}

/// Persistent state of one suspendable native call. The abort hook runs if
/// the enclosing thread is torn down while the call is still suspended.
pub trait CFuncProgress: std::any::Any + Send {
    fn abort(&mut self) {}
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

#[derive(Default)]
pub struct ProgressPool {
    slots: Vec<Option<Box<dyn CFuncProgress>>>,
    free: Vec<u32>,
}

impl std::fmt::Debug for ProgressPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressPool")
            .field("slots", &self.slots.len())
            .field("free", &self.free.len())
            .finish()
    }
}

impl ProgressPool {
    pub fn new() -> Self {
        ProgressPool::default()
    }

    pub fn alloc(&mut self, record: Box<dyn CFuncProgress>) -> Result<u32, OomError> {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(record);
            return Ok(idx);
        }
        self.slots.try_reserve(1).map_err(|_| OomError)?;
        let idx = self.slots.len() as u32;
        self.slots.push(Some(record));
        Ok(idx)
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut Box<dyn CFuncProgress>> {
        self.slots.get_mut(idx as usize).and_then(|s| s.as_mut())
    }

    pub fn free(&mut self, idx: u32) {
        if self.slots[idx as usize].take().is_some() {
            self.free.push(idx);
        }
    }

    /// Run abort hooks on all live records; used at thread teardown.
    pub fn abort_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(record) = slot.as_mut() {
                record.abort();
            }
            *slot = None;
        }
        self.free.clear();
        self.free.extend(0..self.slots.len() as u32);
    }
}

/// The pool set of one thread (or of the shared main-worker collaborators).
#[derive(Debug, Default)]
pub struct Heaps {
    pub gc: GcPool,
    pub iters: IterPool,
    pub progress: ProgressPool,
}

impl Heaps {
    pub fn new() -> Self {
        Heaps::default()
    }

    /// Drop the external reference a rooted location held on this value.
    /// Iterators are pool-owned and reclaimed by ITERATE-at-end or at
    /// teardown, so nothing happens for them here.
    pub fn release_value(&mut self, v: &Value) {
        if let Value::Gc(r) = v {
            self.gc.release_external(*r);
        }
    }

    /// Add an external reference for a rooted copy of this value.
    pub fn retain_value(&mut self, v: &Value) {
        if let Value::Gc(r) = v {
            self.gc.retain_external(*r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hstring::HString;

    #[test]
    fn test_alloc_and_free_reuses_slots() {
        let mut pool = GcPool::new();
        let a = pool.alloc(GcKind::Str(HString::from_str("a"))).unwrap();
        pool.retain_external(a);
        pool.release_external(a);
        assert_eq!(pool.live_count(), 0);
        let b = pool.alloc(GcKind::Str(HString::from_str("b"))).unwrap();
        assert_eq!(a.0, b.0, "freed slot should be reused");
    }

    #[test]
    fn test_dual_refcounts_keep_value_alive() {
        let mut pool = GcPool::new();
        let r = pool.alloc(GcKind::Str(HString::from_str("x"))).unwrap();
        pool.retain_external(r);
        pool.retain_heap(r);
        pool.release_external(r);
        assert_eq!(pool.live_count(), 1, "heap ref still holds the value");
        pool.release_heap(r);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_cascade_frees_nested_containers() {
        let mut pool = GcPool::new();
        let inner = pool.alloc(GcKind::Str(HString::from_str("deep"))).unwrap();
        pool.retain_heap(inner);
        let mut list = VmList::new();
        list.add(Value::Gc(inner)).unwrap();
        let outer = pool.alloc(GcKind::List(list)).unwrap();
        pool.retain_external(outer);
        assert_eq!(pool.live_count(), 2);
        pool.release_external(outer);
        assert_eq!(pool.live_count(), 0, "element freed with its container");
    }

    #[test]
    fn test_iter_pool_free_and_reuse() {
        let mut pool = IterPool::new();
        let r = pool
            .alloc(IterState {
                target: IterTarget::Vector(vec![]),
                idx: 0,
                len: 0,
            })
            .unwrap();
        pool.free(r);
        let r2 = pool
            .alloc(IterState {
                target: IterTarget::Vector(vec![]),
                idx: 0,
                len: 0,
            })
            .unwrap();
        assert_eq!(r.0, r2.0);
    }

    #[test]
    fn test_progress_pool_abort_all() {
        struct Probe {
            aborted: std::sync::Arc<std::sync::atomic::AtomicBool>,
        }
        impl CFuncProgress for Probe {
            fn abort(&mut self) {
                self.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut pool = ProgressPool::new();
        pool.alloc(Box::new(Probe {
            aborted: flag.clone(),
        }))
        .unwrap();
        pool.abort_all();
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
