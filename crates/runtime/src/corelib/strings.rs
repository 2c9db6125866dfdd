//! String method natives
//!
//! Bound-method handlers behind the string dispatch table. All positions
//! are 1-based codepoint indices, matching the indexing operator.

use crate::heap::GcKind;
use crate::interp::{NativeCtx, NativeOutcome};
use crate::program::CLASS_TYPEERROR;
use crate::value::{str_chars, ErrorInfo, Value};

fn type_error(msg: &str) -> NativeOutcome {
    NativeOutcome::Error(Box::new(ErrorInfo::new(CLASS_TYPEERROR, msg)))
}

fn receiver_chars(ctx: &NativeCtx<'_>) -> Option<Vec<char>> {
    ctx.bound_self()
        .and_then(|v| str_chars(&ctx.heaps.gc, v))
        .map(|c| c.to_vec())
}

fn return_str(ctx: &mut NativeCtx<'_>, s: &str) -> NativeOutcome {
    match ctx.make_str(s) {
        Ok(v) => NativeOutcome::Return(v),
        Err(_) => NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory())),
    }
}

/// `str.sub(start, end)`: 1-based inclusive range, clamped to the string.
pub fn native_sub(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let chars = match receiver_chars(ctx) {
        Some(c) => c,
        None => return type_error("sub expects a string receiver"),
    };
    let (start, end) = match (ctx.arg(0), ctx.arg(1)) {
        (Value::Int(s), Value::Int(e)) => (*s, *e),
        _ => return type_error("sub expects numeric bounds"),
    };
    let start = start.max(1) as usize;
    let end = end.min(chars.len() as i64);
    if end < start as i64 {
        return return_str(ctx, "");
    }
    let s: String = chars[start - 1..end as usize].iter().collect();
    return_str(ctx, &s)
}

/// `str.find(needle)` -> 1-based position or none.
pub fn native_find(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let chars = match receiver_chars(ctx) {
        Some(c) => c,
        None => return type_error("find expects a string receiver"),
    };
    let needle: Vec<char> = match str_chars(&ctx.heaps.gc, ctx.arg(0)) {
        Some(c) => c.to_vec(),
        None => return type_error("find expects a string argument"),
    };
    if needle.is_empty() || needle.len() > chars.len() {
        return NativeOutcome::Return(Value::None);
    }
    for start in 0..=(chars.len() - needle.len()) {
        if chars[start..start + needle.len()] == needle[..] {
            return NativeOutcome::Return(Value::Int(start as i64 + 1));
        }
    }
    NativeOutcome::Return(Value::None)
}

/// `str.trim()`
pub fn native_trim(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let chars = match receiver_chars(ctx) {
        Some(c) => c,
        None => return type_error("trim expects a string receiver"),
    };
    let s: String = chars.iter().collect();
    let trimmed = s.trim().to_string();
    return_str(ctx, &trimmed)
}

/// `str.lower()`
pub fn native_lower(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let chars = match receiver_chars(ctx) {
        Some(c) => c,
        None => return type_error("lower expects a string receiver"),
    };
    let s: String = chars.iter().collect::<String>().to_lowercase();
    return_str(ctx, &s)
}

/// `str.upper()`
pub fn native_upper(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let chars = match receiver_chars(ctx) {
        Some(c) => c,
        None => return type_error("upper expects a string receiver"),
    };
    let s: String = chars.iter().collect::<String>().to_uppercase();
    return_str(ctx, &s)
}

/// `str.split(separator)` -> list of strings
pub fn native_split(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let chars = match receiver_chars(ctx) {
        Some(c) => c,
        None => return type_error("split expects a string receiver"),
    };
    let sep: Vec<char> = match str_chars(&ctx.heaps.gc, ctx.arg(0)) {
        Some(c) => c.to_vec(),
        None => return type_error("split expects a string separator"),
    };
    if sep.is_empty() {
        return type_error("split separator cannot be empty");
    }
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        if i + sep.len() <= chars.len() && chars[i..i + sep.len()] == sep[..] {
            parts.push(std::mem::take(&mut current));
            i += sep.len();
        } else {
            current.push(chars[i]);
            i += 1;
        }
    }
    parts.push(current);

    let mut list = crate::list::VmList::new();
    for part in parts {
        let v = match ctx.make_str(&part) {
            Ok(v) => v,
            Err(_) => return NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory())),
        };
        // List cells hold heap references.
        if let Value::Gc(r) = &v {
            ctx.heaps.gc.retain_heap(*r);
            ctx.heaps.gc.release_external(*r);
        }
        if list.add(v).is_err() {
            return NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory()));
        }
    }
    let r = match ctx.heaps.gc.alloc(GcKind::List(list)) {
        Ok(r) => r,
        Err(_) => return NativeOutcome::Error(Box::new(ErrorInfo::out_of_memory())),
    };
    ctx.heaps.gc.retain_external(r);
    NativeOutcome::Return(Value::Gc(r))
}

/// `separator.join(list)` -> string
pub fn native_join(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let sep: String = match receiver_chars(ctx) {
        Some(c) => c.iter().collect(),
        None => return type_error("join expects a string receiver"),
    };
    let parts: Vec<String> = match ctx.arg(0) {
        Value::Gc(r) => match &ctx.heaps.gc.get(*r).kind {
            GcKind::List(l) => {
                let mut out = Vec::with_capacity(l.count() as usize);
                for item in l.iter() {
                    match str_chars(&ctx.heaps.gc, item) {
                        Some(c) => out.push(c.iter().collect()),
                        None => return type_error("join expects a list of strings"),
                    }
                }
                out
            }
            _ => return type_error("join expects a list of strings"),
        },
        _ => return type_error("join expects a list of strings"),
    };
    let joined = parts.join(&sep);
    return_str(ctx, &joined)
}
