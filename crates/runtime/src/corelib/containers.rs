//! Container method natives
//!
//! Bound-method handlers behind the container dispatch table: the
//! receiver arrives as the closure's bound self. Mutations follow the
//! take/put-back protocol so element reference counts update through the
//! same pool the container lives in.

use crate::heap::GcKind;
use crate::interp::{value_has_attribute, NativeCtx, NativeOutcome};
use crate::program::{
    CLASS_INDEXERROR, CLASS_TYPEERROR, CLASS_VALUEERROR,
};
use crate::value::{value_hash, values_equal, ErrorInfo, GcRef, Value};

fn type_error(msg: &str) -> NativeOutcome {
    NativeOutcome::Error(Box::new(ErrorInfo::new(CLASS_TYPEERROR, msg)))
}

fn receiver_gcref(ctx: &NativeCtx<'_>) -> Option<GcRef> {
    match ctx.bound_self() {
        Some(Value::Gc(r)) => Some(*r),
        _ => None,
    }
}

/// `container.add(v)`: list append or set insert.
pub fn native_add(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let gcref = match receiver_gcref(ctx) {
        Some(r) => r,
        None => return type_error("add expects a container receiver"),
    };
    let v = ctx.arg(0).clone();
    match &ctx.heaps.gc.get(gcref).kind {
        GcKind::List(_) => {
            if let Value::Gc(inner) = &v {
                ctx.heaps.gc.retain_heap(*inner);
            }
            let mut obj = ctx.heaps.gc.take(gcref);
            let result = match &mut obj.kind {
                GcKind::List(l) => l.add(v.clone()),
                _ => unreachable!(),
            };
            ctx.heaps.gc.put_back(gcref, obj);
            match result {
                Ok(()) => NativeOutcome::Return(Value::None),
                Err(_) => {
                    if let Value::Gc(inner) = &v {
                        ctx.heaps.gc.release_heap(*inner);
                    }
                    NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory()))
                }
            }
        }
        GcKind::Set(_) => {
            // Unhashable elements land in the set's linear fallback.
            let hash = value_hash(&ctx.heaps.gc, &v);
            if let Value::Gc(inner) = &v {
                ctx.heaps.gc.retain_heap(*inner);
            }
            let mut obj = ctx.heaps.gc.take(gcref);
            let result = {
                let gc = &ctx.heaps.gc;
                let probe = v.clone();
                match &mut obj.kind {
                    GcKind::Set(s) => {
                        s.add_with(v.clone(), hash, |cand| values_equal(gc, cand, &probe))
                    }
                    _ => unreachable!(),
                }
            };
            ctx.heaps.gc.put_back(gcref, obj);
            match result {
                Ok(true) => NativeOutcome::Return(Value::None),
                Ok(false) => {
                    // Already present; the stored copy was not kept.
                    if let Value::Gc(inner) = &v {
                        ctx.heaps.gc.release_heap(*inner);
                    }
                    NativeOutcome::Return(Value::None)
                }
                Err(_) => {
                    if let Value::Gc(inner) = &v {
                        ctx.heaps.gc.release_heap(*inner);
                    }
                    NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory()))
                }
            }
        }
        _ => type_error("add works on lists and sets"),
    }
}

/// `map.del(key)` / `set.del(v)` / `list.del(index)`.
pub fn native_del(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let gcref = match receiver_gcref(ctx) {
        Some(r) => r,
        None => return type_error("del expects a container receiver"),
    };
    let k = ctx.arg(0).clone();
    enum Kind {
        List,
        Map,
        Set,
    }
    let kind = match &ctx.heaps.gc.get(gcref).kind {
        GcKind::List(_) => Kind::List,
        GcKind::Map(_) => Kind::Map,
        GcKind::Set(_) => Kind::Set,
        _ => return type_error("del works on lists, maps and sets"),
    };
    match kind {
        Kind::List => {
            let idx = match k {
                Value::Int(i) => i,
                _ => return type_error("list del expects an index"),
            };
            let mut obj = ctx.heaps.gc.take(gcref);
            let removed = match &mut obj.kind {
                GcKind::List(l) => l.remove(idx),
                _ => unreachable!(),
            };
            ctx.heaps.gc.put_back(gcref, obj);
            match removed {
                Some(old) => {
                    if let Value::Gc(r) = old {
                        ctx.heaps.gc.release_heap(r);
                    }
                    NativeOutcome::Return(Value::None)
                }
                None => NativeOutcome::Error(Box::new(ErrorInfo::new(
                    CLASS_INDEXERROR,
                    "list index out of range",
                ))),
            }
        }
        Kind::Map => {
            let hash = match value_hash(&ctx.heaps.gc, &k) {
                Some(h) => h,
                None => return type_error("map key must be an immutable value"),
            };
            let mut obj = ctx.heaps.gc.take(gcref);
            let removed = {
                let gc = &ctx.heaps.gc;
                match &mut obj.kind {
                    GcKind::Map(m) => m.remove_with(hash, |cand| values_equal(gc, cand, &k)),
                    _ => unreachable!(),
                }
            };
            ctx.heaps.gc.put_back(gcref, obj);
            match removed {
                Some((old_k, old_v)) => {
                    for old in [old_k, old_v] {
                        if let Value::Gc(r) = old {
                            ctx.heaps.gc.release_heap(r);
                        }
                    }
                    NativeOutcome::Return(Value::None)
                }
                None => NativeOutcome::Error(Box::new(ErrorInfo::new(
                    CLASS_VALUEERROR,
                    "key not present in map",
                ))),
            }
        }
        Kind::Set => {
            let hash = value_hash(&ctx.heaps.gc, &k);
            let mut obj = ctx.heaps.gc.take(gcref);
            let removed = {
                let gc = &ctx.heaps.gc;
                match &mut obj.kind {
                    GcKind::Set(s) => s.remove_with(hash, |cand| values_equal(gc, cand, &k)),
                    _ => unreachable!(),
                }
            };
            ctx.heaps.gc.put_back(gcref, obj);
            match removed {
                Some(old) => {
                    if let Value::Gc(r) = old {
                        ctx.heaps.gc.release_heap(r);
                    }
                    NativeOutcome::Return(Value::None)
                }
                None => NativeOutcome::Error(Box::new(ErrorInfo::new(
                    CLASS_VALUEERROR,
                    "value not present in set",
                ))),
            }
        }
    }
}

/// `container.contains(v)` -> bool
pub fn native_contains(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let gcref = match receiver_gcref(ctx) {
        Some(r) => r,
        None => return type_error("contains expects a container receiver"),
    };
    let v = ctx.arg(0).clone();
    let pool = &ctx.heaps.gc;
    let found = match &pool.get(gcref).kind {
        GcKind::List(l) => l.iter().any(|item| values_equal(pool, item, &v)),
        GcKind::Map(m) => match value_hash(pool, &v) {
            Some(hash) => m.contains_with(hash, |cand| values_equal(pool, cand, &v)),
            None => return type_error("map key must be an immutable value"),
        },
        GcKind::Set(s) => {
            let hash = value_hash(pool, &v);
            s.contains_with(hash, |cand| values_equal(pool, cand, &v))
        }
        _ => return type_error("contains works on lists, maps and sets"),
    };
    NativeOutcome::Return(Value::Bool(found))
}

/// `list.insert(index, v)`
pub fn native_insert(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let gcref = match receiver_gcref(ctx) {
        Some(r) => r,
        None => return type_error("insert expects a list receiver"),
    };
    let idx = match ctx.arg(0) {
        Value::Int(i) => *i,
        _ => return type_error("insert expects an index"),
    };
    let v = ctx.arg(1).clone();
    if !matches!(ctx.heaps.gc.get(gcref).kind, GcKind::List(_)) {
        return type_error("insert works on lists");
    }
    if let Value::Gc(inner) = &v {
        ctx.heaps.gc.retain_heap(*inner);
    }
    let mut obj = ctx.heaps.gc.take(gcref);
    let result = match &mut obj.kind {
        GcKind::List(l) => l.insert(idx, v.clone()),
        _ => unreachable!(),
    };
    ctx.heaps.gc.put_back(gcref, obj);
    match result {
        Ok(true) => NativeOutcome::Return(Value::None),
        Ok(false) => {
            if let Value::Gc(inner) = &v {
                ctx.heaps.gc.release_heap(*inner);
            }
            NativeOutcome::Error(Box::new(ErrorInfo::new(
                CLASS_INDEXERROR,
                "list index out of range",
            )))
        }
        Err(_) => {
            if let Value::Gc(inner) = &v {
                ctx.heaps.gc.release_heap(*inner);
            }
            NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory()))
        }
    }
}

/// `list.remove(index)` -> removed value
pub fn native_remove(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let gcref = match receiver_gcref(ctx) {
        Some(r) => r,
        None => return type_error("remove expects a list receiver"),
    };
    let idx = match ctx.arg(0) {
        Value::Int(i) => *i,
        _ => return type_error("remove expects an index"),
    };
    if !matches!(ctx.heaps.gc.get(gcref).kind, GcKind::List(_)) {
        return type_error("remove works on lists");
    }
    let mut obj = ctx.heaps.gc.take(gcref);
    let removed = match &mut obj.kind {
        GcKind::List(l) => l.remove(idx),
        _ => unreachable!(),
    };
    ctx.heaps.gc.put_back(gcref, obj);
    match removed {
        Some(v) => {
            // The caller's slot takes an external reference in place of
            // the container's dropped heap reference.
            if let Value::Gc(r) = &v {
                ctx.heaps.gc.retain_external(*r);
                ctx.heaps.gc.release_heap(*r);
            }
            NativeOutcome::Return(v)
        }
        None => NativeOutcome::Error(Box::new(ErrorInfo::new(
            CLASS_INDEXERROR,
            "list index out of range",
        ))),
    }
}

/// `has_attr(obj, name_id)` -> bool
pub fn native_has_attr(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let name = match ctx.arg(1) {
        Value::Int(n) => *n,
        _ => return type_error("has_attr expects an attribute name id"),
    };
    let obj = ctx.arg(0).clone();
    let has = value_has_attribute(ctx.program, &ctx.heaps.gc, &obj, name);
    NativeOutcome::Return(Value::Bool(has))
}

/// `value.is_a(type)` -> bool; walks the base-class chain for instances
/// and error values.
pub fn native_is_a(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let target = match ctx.arg(0) {
        Value::ClassRef(id) => *id,
        _ => return type_error("is_a expects a type reference"),
    };
    let receiver = match ctx.bound_self() {
        Some(v) => v.clone(),
        None => return type_error("is_a expects a receiver"),
    };
    let result = match &receiver {
        Value::Gc(r) => match &ctx.heaps.gc.get(*r).kind {
            GcKind::Instance { class_id, .. } => {
                ctx.program.is_class_or_base(*class_id, target)
            }
            _ => false,
        },
        Value::Error(e) => ctx.program.is_class_or_base(e.class_id, target),
        _ => false,
    };
    NativeOutcome::Return(Value::Bool(result))
}
