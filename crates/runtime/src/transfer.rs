//! Portable values for cross-heap hand-off
//!
//! Gc values are confined to one thread's pools, so a value crossing
//! between threads (async call arguments, awaited return values) travels
//! as a `PortableValue`: an owned, heap-independent mirror that can also
//! be serialized with bincode for exchange with external systems.
//!
//! Code (closures, function refs into another heap's bindings), iterators
//! and object instances do not cross; converting them is an error the
//! scheduler maps to a TypeError on the awaiting side.

use crate::heap::{GcKind, Heaps, OomError};
use crate::hstring::{HBytes, HString};
use crate::list::{VecEntry, VmList, VmVector};
use crate::map::{VmMap, VmSet};
use crate::value::{value_hash, values_equal, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum TransferError {
    /// Closures and plain function references cannot cross heaps.
    CodeNotPortable,
    /// Iterators pin a container revision in one heap.
    IteratorNotPortable,
    /// Object instances are identity-bound to their heap.
    InstanceNotPortable,
    /// Suspension sentinels never leave the scheduler.
    InternalNotPortable,
    OutOfMemory,
    Encode(Box<bincode::Error>),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::CodeNotPortable => {
                write!(f, "functions cannot cross thread heaps")
            }
            TransferError::IteratorNotPortable => {
                write!(f, "iterators cannot cross thread heaps")
            }
            TransferError::InstanceNotPortable => {
                write!(f, "object instances cannot cross thread heaps")
            }
            TransferError::InternalNotPortable => {
                write!(f, "internal sentinel values cannot cross thread heaps")
            }
            TransferError::OutOfMemory => write!(f, "out of memory"),
            TransferError::Encode(e) => write!(f, "encoding error: {}", e),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Encode(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<OomError> for TransferError {
    fn from(_: OomError) -> Self {
        TransferError::OutOfMemory
    }
}

impl From<bincode::Error> for TransferError {
    fn from(e: bincode::Error) -> Self {
        TransferError::Encode(Box::new(e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PortableVecEntry {
    Int(i64),
    Float(f64),
}

/// Heap-independent value mirror. Maps and sets keep their entries as
/// ordered pairs so the receiving heap rebuilds them in iteration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PortableValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<PortableValue>),
    Map(Vec<(PortableValue, PortableValue)>),
    Set(Vec<PortableValue>),
    Vector(Vec<PortableVecEntry>),
    Error {
        class_id: i64,
        message: String,
    },
}

impl PortableValue {
    /// Capture a value out of its owning heap.
    pub fn from_value(heaps: &Heaps, v: &Value) -> Result<PortableValue, TransferError> {
        Ok(match v {
            Value::None => PortableValue::None,
            Value::Bool(b) => PortableValue::Bool(*b),
            Value::Int(i) => PortableValue::Int(*i),
            Value::Float(f) => PortableValue::Float(*f),
            Value::ShortStr { len, chars } => {
                PortableValue::Str(chars[..*len as usize].iter().collect())
            }
            Value::ShortBytes { len, bytes } => {
                PortableValue::Bytes(bytes[..*len as usize].to_vec())
            }
            Value::Error(e) => PortableValue::Error {
                class_id: e.class_id,
                message: e.message_string(),
            },
            Value::FuncRef(_) => return Err(TransferError::CodeNotPortable),
            Value::ClassRef(id) => {
                // Class ids are program-wide, an int carries them fine,
                // but the receiving side needs the ref type back.
                return Ok(PortableValue::Int(*id));
            }
            Value::Iterator(_) => return Err(TransferError::IteratorNotPortable),
            Value::SuspendInfo { .. }
            | Value::UnspecifiedKwarg
            | Value::ConstStr { .. }
            | Value::ConstBytes { .. } => return Err(TransferError::InternalNotPortable),
            Value::Gc(r) => match &heaps.gc.get(*r).kind {
                GcKind::Str(s) => PortableValue::Str(s.to_utf8()),
                GcKind::Bytes(b) => PortableValue::Bytes(b.data().to_vec()),
                GcKind::List(l) => {
                    let mut items = Vec::with_capacity(l.count() as usize);
                    for item in l.iter() {
                        items.push(PortableValue::from_value(heaps, item)?);
                    }
                    PortableValue::List(items)
                }
                GcKind::Map(m) => {
                    let mut pairs = Vec::with_capacity(m.count() as usize);
                    for (k, val) in m.pairs() {
                        pairs.push((
                            PortableValue::from_value(heaps, k)?,
                            PortableValue::from_value(heaps, val)?,
                        ));
                    }
                    PortableValue::Map(pairs)
                }
                GcKind::Set(s) => {
                    let mut items = Vec::with_capacity(s.count() as usize);
                    for item in s.iter() {
                        items.push(PortableValue::from_value(heaps, item)?);
                    }
                    PortableValue::Set(items)
                }
                GcKind::Vector(vec) => PortableValue::Vector(
                    vec.entries()
                        .iter()
                        .map(|e| match e {
                            VecEntry::Int(i) => PortableVecEntry::Int(*i),
                            VecEntry::Float(f) => PortableVecEntry::Float(*f),
                        })
                        .collect(),
                ),
                GcKind::Instance { .. } => return Err(TransferError::InstanceNotPortable),
                GcKind::Closure(_) => return Err(TransferError::CodeNotPortable),
            },
        })
    }

    /// Materialize into the receiving heap. Gc values come back with one
    /// external reference already held for the destination slot.
    pub fn into_value(&self, heaps: &mut Heaps) -> Result<Value, TransferError> {
        Ok(match self {
            PortableValue::None => Value::None,
            PortableValue::Bool(b) => Value::Bool(*b),
            PortableValue::Int(i) => Value::Int(*i),
            PortableValue::Float(f) => Value::Float(*f),
            PortableValue::Str(s) => {
                if let Some(short) = Value::try_short_str(s) {
                    short
                } else {
                    let r = heaps.gc.alloc(GcKind::Str(HString::from_str(s)))?;
                    heaps.gc.retain_external(r);
                    Value::Gc(r)
                }
            }
            PortableValue::Bytes(b) => {
                if let Some(short) = Value::try_short_bytes(b) {
                    short
                } else {
                    let r = heaps.gc.alloc(GcKind::Bytes(HBytes::from_vec(b.clone())))?;
                    heaps.gc.retain_external(r);
                    Value::Gc(r)
                }
            }
            PortableValue::Error { class_id, message } => Value::Error(Box::new(
                crate::value::ErrorInfo::new(*class_id, message),
            )),
            PortableValue::List(items) => {
                let mut list = VmList::new();
                for item in items {
                    let v = item.into_value(heaps)?;
                    // The list cell owns a heap reference instead of the
                    // external one granted above.
                    if let Value::Gc(r) = &v {
                        heaps.gc.retain_heap(*r);
                        heaps.gc.release_external(*r);
                    }
                    list.add(v)?;
                }
                let r = heaps.gc.alloc(GcKind::List(list))?;
                heaps.gc.retain_external(r);
                Value::Gc(r)
            }
            PortableValue::Map(pairs) => {
                let mut map = VmMap::new();
                for (pk, pv) in pairs {
                    let k = pk.into_value(heaps)?;
                    let v = pv.into_value(heaps)?;
                    for cell in [&k, &v] {
                        if let Value::Gc(r) = cell {
                            heaps.gc.retain_heap(*r);
                            heaps.gc.release_external(*r);
                        }
                    }
                    let hash = value_hash(&heaps.gc, &k).unwrap_or(0);
                    let gc = &heaps.gc;
                    map.set_with(k.clone(), v, hash, |cand| values_equal(gc, cand, &k))?;
                }
                let r = heaps.gc.alloc(GcKind::Map(map))?;
                heaps.gc.retain_external(r);
                Value::Gc(r)
            }
            PortableValue::Set(items) => {
                let mut set = VmSet::new();
                for item in items {
                    let v = item.into_value(heaps)?;
                    if let Value::Gc(r) = &v {
                        heaps.gc.retain_heap(*r);
                        heaps.gc.release_external(*r);
                    }
                    let hash = value_hash(&heaps.gc, &v);
                    let gc = &heaps.gc;
                    set.add_with(v.clone(), hash, |cand| values_equal(gc, cand, &v))?;
                }
                let r = heaps.gc.alloc(GcKind::Set(set))?;
                heaps.gc.retain_external(r);
                Value::Gc(r)
            }
            PortableValue::Vector(entries) => {
                let mut vec = VmVector::new();
                for (i, e) in entries.iter().enumerate() {
                    let entry = match e {
                        PortableVecEntry::Int(v) => VecEntry::Int(*v),
                        PortableVecEntry::Float(v) => VecEntry::Float(*v),
                    };
                    vec.set(i as i64 + 1, entry)?;
                }
                let r = heaps.gc.alloc(GcKind::Vector(vec))?;
                heaps.gc.retain_external(r);
                Value::Gc(r)
            }
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransferError> {
        bincode::serialize(self).map_err(TransferError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransferError> {
        bincode::deserialize(bytes).map_err(TransferError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut src = Heaps::new();
        let mut dst = Heaps::new();
        for v in [Value::Int(42), Value::Bool(true), Value::Float(1.5), Value::None] {
            let p = PortableValue::from_value(&src, &v).unwrap();
            let back = p.into_value(&mut dst).unwrap();
            assert!(values_equal(&dst.gc, &back, &v));
        }
        let _ = &mut src;
    }

    #[test]
    fn test_string_round_trip_across_heaps() {
        let mut src = Heaps::new();
        let r = src
            .gc
            .alloc(GcKind::Str(HString::from_str("crossing over")))
            .unwrap();
        src.gc.retain_external(r);
        let p = PortableValue::from_value(&src, &Value::Gc(r)).unwrap();

        let mut dst = Heaps::new();
        let back = p.into_value(&mut dst).unwrap();
        assert_eq!(
            crate::value::str_chars(&dst.gc, &back).unwrap(),
            "crossing over".chars().collect::<Vec<_>>().as_slice()
        );
        // Destination value holds its own reference, source untouched.
        assert_eq!(src.gc.get(r).externalref, 1);
    }

    #[test]
    fn test_list_deep_copy() {
        let mut src = Heaps::new();
        let s = src
            .gc
            .alloc(GcKind::Str(HString::from_str("nested string")))
            .unwrap();
        src.gc.retain_heap(s);
        let mut list = VmList::new();
        list.add(Value::Int(1)).unwrap();
        list.add(Value::Gc(s)).unwrap();
        let lr = src.gc.alloc(GcKind::List(list)).unwrap();
        src.gc.retain_external(lr);

        let p = PortableValue::from_value(&src, &Value::Gc(lr)).unwrap();
        let mut dst = Heaps::new();
        let back = p.into_value(&mut dst).unwrap();
        match &back {
            Value::Gc(r) => match &dst.gc.get(*r).kind {
                GcKind::List(l) => {
                    assert_eq!(l.count(), 2);
                    assert_eq!(l.get(1), Some(&Value::Int(1)));
                }
                _ => panic!("expected list"),
            },
            _ => panic!("expected gc value"),
        }
        // Releasing the destination root frees the whole copy.
        dst.release_value(&back);
        assert_eq!(dst.gc.live_count(), 0);
    }

    #[test]
    fn test_map_preserves_entries() {
        let src = Heaps::new();
        let p = PortableValue::Map(vec![
            (PortableValue::Int(1), PortableValue::Str("one".into())),
            (PortableValue::Int(2), PortableValue::Str("two".into())),
        ]);
        let mut dst = Heaps::new();
        let back = p.into_value(&mut dst).unwrap();
        match &back {
            Value::Gc(r) => match &dst.gc.get(*r).kind {
                GcKind::Map(m) => assert_eq!(m.count(), 2),
                _ => panic!("expected map"),
            },
            _ => panic!("expected gc value"),
        }
        let _ = src;
    }

    #[test]
    fn test_code_is_not_portable() {
        let heaps = Heaps::new();
        assert!(matches!(
            PortableValue::from_value(&heaps, &Value::FuncRef(3)),
            Err(TransferError::CodeNotPortable)
        ));
    }

    #[test]
    fn test_bincode_round_trip() {
        let p = PortableValue::List(vec![
            PortableValue::Int(1),
            PortableValue::Str("x".into()),
            PortableValue::Vector(vec![PortableVecEntry::Float(0.5)]),
        ]);
        let bytes = p.to_bytes().unwrap();
        assert_eq!(PortableValue::from_bytes(&bytes).unwrap(), p);
    }

    #[test]
    fn test_corrupt_bytes_error() {
        assert!(PortableValue::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
