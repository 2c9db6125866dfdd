//! Value: What the language talks about
//!
//! A value is a small tagged union that lives in stack slots, globals and
//! container cells. Heap-backed values (strings above the inline size,
//! containers, object instances, closures) are reached through a `GcRef`
//! handle into the owning thread's gc pool; everything else is carried
//! inline.
//!
//! Reference counting discipline: a value itself never updates reference
//! counts when cloned or dropped. The code moving a value into or out of a
//! rooted location (stack slot, global) or a heap cell is responsible for
//! the matching `retain`/`release` call on the pool. This mirrors how the
//! interpreter moves values with plain copies plus explicit count updates.

use crate::heap::{GcKind, GcPool};
use crate::scheduler::SuspendType;

/// Program-wide class id.
pub type ClassId = i64;
/// Program-wide function id.
pub type FuncId = i64;
/// Attribute name id (compiler-assigned).
pub type NameId = i64;

/// Handle into a thread's gc-value pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(pub u32);

/// Handle into a thread's iterator pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterRef(pub u32);

/// Inline string capacity in codepoints.
pub const SHORTSTR_MAX: usize = 3;
/// Inline bytes capacity.
pub const SHORTBYTES_MAX: usize = 3;

/// Stack-trace and message payload of an in-language error value.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub class_id: ClassId,
    /// UTF-32 message. Empty for out-of-memory errors, which must never
    /// allocate their message.
    pub message: Vec<char>,
    /// Up to `MAX_ERROR_STACK_FRAMES` entries of (func id, byte offset).
    pub frames: Vec<(FuncId, u32)>,
}

/// Captured stack trace depth on raised errors.
pub const MAX_ERROR_STACK_FRAMES: usize = 10;

impl ErrorInfo {
    pub fn new(class_id: ClassId, message: &str) -> Self {
        ErrorInfo {
            class_id,
            message: message.chars().collect(),
            frames: Vec::new(),
        }
    }

    /// Error info for out-of-memory conditions: no message allocation.
    pub fn out_of_memory() -> Self {
        ErrorInfo {
            class_id: crate::program::CLASS_OUTOFMEMORYERROR,
            message: Vec::new(),
            frames: Vec::new(),
        }
    }

    pub fn message_string(&self) -> String {
        self.message.iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Inline codepoint buffer, length <= SHORTSTR_MAX.
    ShortStr { len: u8, chars: [char; SHORTSTR_MAX] },
    /// Inline byte buffer, length <= SHORTBYTES_MAX.
    ShortBytes { len: u8, bytes: [u8; SHORTBYTES_MAX] },
    /// Borrowed reference into the current function's constant pool.
    /// Only ever observed inside a SETCONST handler; the handler converts
    /// it to a heap string before it lands in any slot.
    ConstStr { pool_idx: u32 },
    /// Same as `ConstStr` for byte constants.
    ConstBytes { pool_idx: u32 },
    Gc(GcRef),
    FuncRef(FuncId),
    ClassRef(ClassId),
    Error(Box<ErrorInfo>),
    Iterator(IterRef),
    /// Sentinel returned by a native function to request suspension.
    SuspendInfo { kind: SuspendType, arg: i64 },
    /// Placeholder for an absent keyword argument slot.
    UnspecifiedKwarg,
}

impl Value {
    /// Inline a string if it fits, otherwise the caller must allocate.
    pub fn try_short_str(s: &str) -> Option<Value> {
        let mut chars = ['\0'; SHORTSTR_MAX];
        let mut len = 0usize;
        for c in s.chars() {
            if len >= SHORTSTR_MAX {
                return None;
            }
            chars[len] = c;
            len += 1;
        }
        Some(Value::ShortStr {
            len: len as u8,
            chars,
        })
    }

    pub fn try_short_bytes(b: &[u8]) -> Option<Value> {
        if b.len() > SHORTBYTES_MAX {
            return None;
        }
        let mut bytes = [0u8; SHORTBYTES_MAX];
        bytes[..b.len()].copy_from_slice(b);
        Some(Value::ShortBytes {
            len: b.len() as u8,
            bytes,
        })
    }

    pub fn type_name(&self, pool: &GcPool) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "num",
            Value::Float(_) => "num",
            Value::ShortStr { .. } | Value::ConstStr { .. } => "str",
            Value::ShortBytes { .. } | Value::ConstBytes { .. } => "bytes",
            Value::Gc(r) => match &pool.get(*r).kind {
                GcKind::Str(_) => "str",
                GcKind::Bytes(_) => "bytes",
                GcKind::List(_) => "list",
                GcKind::Map(_) => "map",
                GcKind::Set(_) => "set",
                GcKind::Vector(_) => "vec",
                GcKind::Instance { .. } => "object",
                GcKind::Closure(_) => "func",
            },
            Value::FuncRef(_) => "func",
            Value::ClassRef(_) => "type",
            Value::Error(_) => "error",
            Value::Iterator(_) => "iterator",
            Value::SuspendInfo { .. } => "suspendinfo",
            Value::UnspecifiedKwarg => "unspecified",
        }
    }

    /// Truth test used by the extended conditional jump: bools are
    /// themselves, none is false, numbers test nonzero, strings, bytes and
    /// containers test nonempty.
    pub fn truthy(&self, pool: &GcPool) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::None => Some(false),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::ShortStr { len, .. } => Some(*len > 0),
            Value::ShortBytes { len, .. } => Some(*len > 0),
            Value::Gc(r) => match &pool.get(*r).kind {
                GcKind::Str(s) => Some(!s.is_empty()),
                GcKind::Bytes(b) => Some(!b.is_empty()),
                GcKind::List(l) => Some(l.count() > 0),
                GcKind::Map(m) => Some(m.count() > 0),
                GcKind::Set(s) => Some(s.count() > 0),
                GcKind::Vector(v) => Some(v.len() > 0),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_callable(&self, pool: &GcPool) -> bool {
        match self {
            Value::FuncRef(_) => true,
            Value::Gc(r) => matches!(pool.get(*r).kind, GcKind::Closure(_)),
            _ => false,
        }
    }
}

/// Read a string value's codepoints, whatever its representation.
/// Returns `None` for non-string values.
pub fn str_chars<'a>(pool: &'a GcPool, v: &'a Value) -> Option<&'a [char]> {
    match v {
        Value::ShortStr { len, chars } => Some(&chars[..*len as usize]),
        Value::Gc(r) => match &pool.get(*r).kind {
            GcKind::Str(s) => Some(s.chars()),
            _ => None,
        },
        _ => None,
    }
}

/// Read a bytes value's content, whatever its representation.
pub fn bytes_content<'a>(pool: &'a GcPool, v: &'a Value) -> Option<&'a [u8]> {
    match v {
        Value::ShortBytes { len, bytes } => Some(&bytes[..*len as usize]),
        Value::Gc(r) => match &pool.get(*r).kind {
            GcKind::Bytes(b) => Some(b.data()),
            _ => None,
        },
        _ => None,
    }
}

/// Semantic equality per the value model: content equality for strings and
/// bytes regardless of representation, mathematical equality across
/// int/float, deep equality for containers, identity for instances.
pub fn values_equal(pool: &GcPool, a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
            y.fract() == 0.0 && (*x as f64) == *y
        }
        (Value::FuncRef(x), Value::FuncRef(y)) => x == y,
        (Value::ClassRef(x), Value::ClassRef(y)) => x == y,
        (Value::Error(x), Value::Error(y)) => x.class_id == y.class_id && x.message == y.message,
        (Value::UnspecifiedKwarg, Value::UnspecifiedKwarg) => true,
        _ => {
            if let (Some(x), Some(y)) = (str_chars(pool, a), str_chars(pool, b)) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (bytes_content(pool, a), bytes_content(pool, b)) {
                return x == y;
            }
            match (a, b) {
                (Value::Gc(x), Value::Gc(y)) => gc_equal(pool, *x, *y),
                _ => false,
            }
        }
    }
}

fn gc_equal(pool: &GcPool, a: GcRef, b: GcRef) -> bool {
    if a == b {
        return true;
    }
    match (&pool.get(a).kind, &pool.get(b).kind) {
        (GcKind::List(x), GcKind::List(y)) => {
            if x.count() != y.count() {
                return false;
            }
            for i in 1..=x.count() {
                if !values_equal(pool, x.get(i).unwrap(), y.get(i).unwrap()) {
                    return false;
                }
            }
            true
        }
        (GcKind::Vector(x), GcKind::Vector(y)) => x == y,
        (GcKind::Map(x), GcKind::Map(y)) => {
            if x.count() != y.count() {
                return false;
            }
            x.pairs().all(|(k, v)| {
                let hash = match value_hash(pool, k) {
                    Some(h) => h,
                    None => return false,
                };
                match y.get_with(hash, |cand| values_equal(pool, cand, k)) {
                    Some(other) => values_equal(pool, v, other),
                    None => false,
                }
            })
        }
        (GcKind::Set(x), GcKind::Set(y)) => {
            if x.count() != y.count() {
                return false;
            }
            x.iter().all(|k| {
                let hash = value_hash(pool, k);
                y.contains_with(hash, |cand| values_equal(pool, cand, k))
            })
        }
        // Instances and closures compare by identity, which the `a == b`
        // fast path above already decided.
        _ => false,
    }
}

/// 32-bit value hash agreeing with `values_equal`: integral floats hash as
/// their integer, strings hash their codepoints whatever the
/// representation. Returns `None` for mutable (unhashable) values.
pub fn value_hash(pool: &GcPool, v: &Value) -> Option<u32> {
    match v {
        Value::None => Some(0x4e4f4e45),
        Value::Bool(b) => Some(if *b { 0x1 } else { 0x2 }),
        Value::Int(i) => Some(hash_i64(*i)),
        Value::Float(f) => {
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                Some(hash_i64(*f as i64))
            } else {
                Some(hash_bytes(&f.to_le_bytes()))
            }
        }
        Value::FuncRef(id) => Some(hash_i64(*id) ^ 0x46554e43),
        Value::ClassRef(id) => Some(hash_i64(*id) ^ 0x434c4153),
        Value::ShortStr { .. } => Some(hash_chars(str_chars(pool, v).unwrap())),
        Value::ShortBytes { .. } => Some(hash_bytes(bytes_content(pool, v).unwrap())),
        Value::Gc(r) => {
            let obj = pool.get(*r);
            if obj.cached_hash.get() != 0 {
                return Some(obj.cached_hash.get());
            }
            let h = match &obj.kind {
                GcKind::Str(s) => hash_chars(s.chars()),
                GcKind::Bytes(b) => hash_bytes(b.data()),
                _ => return None,
            };
            // 0 marks "uncomputed" in the cache slot.
            let h = if h == 0 { 1 } else { h };
            pool.set_cached_hash(*r, h);
            Some(h)
        }
        _ => None,
    }
}

fn hash_i64(v: i64) -> u32 {
    hash_bytes(&v.to_le_bytes())
}

fn hash_chars(chars: &[char]) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for c in chars {
        for b in (*c as u32).to_le_bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(0x01000193);
        }
    }
    h
}

fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for b in bytes {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

/// Whether a value may be used as a map key or set element. Mutable
/// container types and instances are rejected.
pub fn is_hashable_key(pool: &GcPool, v: &Value) -> bool {
    match v {
        Value::None
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::ShortStr { .. }
        | Value::ShortBytes { .. }
        | Value::FuncRef(_)
        | Value::ClassRef(_) => true,
        Value::Gc(r) => matches!(pool.get(*r).kind, GcKind::Str(_) | GcKind::Bytes(_)),
        _ => false,
    }
}

/// Render a value for `print` and error messages.
pub fn value_to_display(pool: &GcPool, v: &Value) -> String {
    match v {
        Value::None => "none".to_string(),
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{:.1}", f)
            } else {
                format!("{}", f)
            }
        }
        Value::FuncRef(id) => format!("<func #{}>", id),
        Value::ClassRef(id) => format!("<type #{}>", id),
        Value::Error(e) => format!("<error #{}: {}>", e.class_id, e.message_string()),
        Value::Iterator(_) => "<iterator>".to_string(),
        Value::SuspendInfo { .. } => "<suspendinfo>".to_string(),
        Value::UnspecifiedKwarg => "<unspecified>".to_string(),
        Value::ConstStr { .. } | Value::ConstBytes { .. } => "<const>".to_string(),
        Value::ShortStr { .. } | Value::ShortBytes { .. } | Value::Gc(_) => {
            if let Some(chars) = str_chars(pool, v) {
                return chars.iter().collect();
            }
            if let Some(bytes) = bytes_content(pool, v) {
                return format!("b{:?}", bytes);
            }
            if let Value::Gc(r) = v {
                return match &pool.get(*r).kind {
                    GcKind::List(l) => {
                        let items: Vec<String> = (1..=l.count())
                            .map(|i| value_to_display(pool, l.get(i).unwrap()))
                            .collect();
                        format!("[{}]", items.join(", "))
                    }
                    GcKind::Vector(vec) => {
                        let items: Vec<String> = vec
                            .entries()
                            .iter()
                            .map(|e| match e {
                                crate::list::VecEntry::Int(i) => i.to_string(),
                                crate::list::VecEntry::Float(f) => format!("{}", f),
                            })
                            .collect();
                        format!("vec({})", items.join(", "))
                    }
                    GcKind::Map(m) => {
                        let items: Vec<String> = m
                            .pairs()
                            .map(|(k, val)| {
                                format!(
                                    "{} -> {}",
                                    value_to_display(pool, k),
                                    value_to_display(pool, val)
                                )
                            })
                            .collect();
                        format!("{{{}}}", items.join(", "))
                    }
                    GcKind::Set(s) => {
                        let items: Vec<String> =
                            s.iter().map(|k| value_to_display(pool, k)).collect();
                        format!("{{{}}}", items.join(", "))
                    }
                    GcKind::Instance { class_id, .. } => format!("<object of type #{}>", class_id),
                    GcKind::Closure(info) => format!("<func #{}>", info.func_id),
                    GcKind::Str(_) | GcKind::Bytes(_) => unreachable!(),
                };
            }
            unreachable!()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heaps;
    use crate::hstring::HString;

    fn pool_with_str(s: &str) -> (Heaps, Value) {
        let mut heaps = Heaps::new();
        let r = heaps
            .gc
            .alloc(GcKind::Str(HString::from_str(s)))
            .expect("alloc");
        (heaps, Value::Gc(r))
    }

    #[test]
    fn test_short_str_inlines_small_strings() {
        assert!(Value::try_short_str("ab").is_some());
        assert!(Value::try_short_str("abc").is_some());
        assert!(Value::try_short_str("abcd").is_none());
    }

    #[test]
    fn test_cross_representation_string_equality() {
        let (heaps, heap_str) = pool_with_str("ab");
        let short = Value::try_short_str("ab").unwrap();
        assert!(values_equal(&heaps.gc, &short, &heap_str));
        assert_eq!(
            value_hash(&heaps.gc, &short),
            value_hash(&heaps.gc, &heap_str)
        );
    }

    #[test]
    fn test_int_float_cross_equality_and_hash() {
        let heaps = Heaps::new();
        assert!(values_equal(&heaps.gc, &Value::Int(5), &Value::Float(5.0)));
        assert!(!values_equal(&heaps.gc, &Value::Int(5), &Value::Float(5.5)));
        assert_eq!(
            value_hash(&heaps.gc, &Value::Int(5)),
            value_hash(&heaps.gc, &Value::Float(5.0))
        );
    }

    #[test]
    fn test_hashable_key_rules() {
        let mut heaps = Heaps::new();
        let list = heaps
            .gc
            .alloc(GcKind::List(crate::list::VmList::new()))
            .unwrap();
        assert!(!is_hashable_key(&heaps.gc, &Value::Gc(list)));
        assert!(is_hashable_key(&heaps.gc, &Value::Int(1)));
        assert!(is_hashable_key(
            &heaps.gc,
            &Value::try_short_str("x").unwrap()
        ));
    }

    #[test]
    fn test_truthiness() {
        let heaps = Heaps::new();
        assert_eq!(Value::None.truthy(&heaps.gc), Some(false));
        assert_eq!(Value::Int(3).truthy(&heaps.gc), Some(true));
        assert_eq!(
            Value::try_short_str("").unwrap().truthy(&heaps.gc),
            Some(false)
        );
        assert_eq!(Value::FuncRef(1).truthy(&heaps.gc), None);
    }

    #[test]
    fn test_display_rendering() {
        let (heaps, s) = pool_with_str("hello");
        assert_eq!(value_to_display(&heaps.gc, &s), "hello");
        assert_eq!(value_to_display(&heaps.gc, &Value::Int(42)), "42");
        assert_eq!(value_to_display(&heaps.gc, &Value::Float(2.0)), "2.0");
        assert_eq!(value_to_display(&heaps.gc, &Value::Bool(true)), "true");
    }
}
