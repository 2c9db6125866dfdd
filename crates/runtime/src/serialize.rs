//! Program serialization
//!
//! Versioned dump/restore of a whole program as a little-endian byte
//! stream. The header is fixed: `\x01H64BCODE_V1\x01`. Instruction
//! buffers are written verbatim; SETCONST payloads that live in the
//! function constant pool follow their instruction blob and are
//! re-linked to freshly assigned pool indices on restore. Native
//! functions serialize their lookup name and are rebound against the
//! host's registered handlers; a missing name fails the load.

use crate::bytecode::{decode_at, ConstOperand, Instr};
use crate::program::{
    ClassDef, ConstValue, FuncConst, FuncDef, FuncKind, GlobalDef, NativeRegistry, Program,
};

pub const DUMP_HEADER: &[u8; 13] = b"\x01H64BCODE_V1\x01";

const GLOBALTYPE_NONE: u8 = 1;
const GLOBALTYPE_BOOL: u8 = 2;
const GLOBALTYPE_INT: u8 = 3;
const GLOBALTYPE_FLOAT: u8 = 4;
const GLOBALTYPE_STR: u8 = 11;
const GLOBALTYPE_BYTES: u8 = 12;

#[derive(Debug)]
pub enum LoadError {
    BadHeader,
    Truncated,
    Corrupt(String),
    UnknownNativeFunction(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::BadHeader => write!(f, "program blob has no valid header"),
            LoadError::Truncated => write!(f, "program blob ends unexpectedly"),
            LoadError::Corrupt(msg) => write!(f, "program blob is corrupt: {}", msg),
            LoadError::UnknownNativeFunction(name) => {
                write!(f, "no registered native function named {:?}", name)
            }
        }
    }
}

impl std::error::Error for LoadError {}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer {
            out: DUMP_HEADER.to_vec(),
        }
    }

    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.out.push(v as u8);
    }

    fn i32(&mut self, v: i32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.out.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    fn chars32(&mut self, chars: &[char]) {
        for c in chars {
            self.out.extend_from_slice(&(*c as u32).to_le_bytes());
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.buf.len() {
            return Err(LoadError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, LoadError> {
        Ok(self.u8()? != 0)
    }

    fn i32(&mut self) -> Result<i32, LoadError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, LoadError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    fn f64(&mut self) -> Result<f64, LoadError> {
        Ok(f64::from_bits(self.i64()? as u64))
    }

    fn chars32(&mut self, count: usize) -> Result<Vec<char>, LoadError> {
        let raw = self.take(count * 4)?;
        let mut chars = Vec::with_capacity(count);
        for i in 0..count {
            let u = u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
            chars.push(char::from_u32(u).ok_or_else(|| {
                LoadError::Corrupt("invalid codepoint in string payload".to_string())
            })?);
        }
        Ok(chars)
    }
}

/// Serialize `program` into a standalone blob.
pub fn dump(program: &Program) -> Vec<u8> {
    let mut w = Writer::new();

    w.i64(program.classes.len() as i64);
    for class in &program.classes {
        w.i64(class.base_class);
        w.bool(class.is_error);
        w.bool(class.is_threadable);
        w.bool(class.user_set_parallel);
        w.bool(class.has_equals_attr);
        w.i32(class.funcattr_names.len() as i32);
        for name in &class.funcattr_names {
            w.i64(*name);
        }
        for func in &class.funcattr_funcs {
            w.i32(*func);
        }
        w.i32(class.varattr_names.len() as i32);
        for name in &class.varattr_names {
            w.i64(*name);
        }
        w.bytes(&class.varattr_flags);
        w.bool(class.varinit_func.is_some());
        w.i32(class.varinit_func.unwrap_or(-1));
    }

    w.i64(program.funcs.len() as i64);
    for func in &program.funcs {
        w.i32(func.input_stack_size);
        w.i32(func.inner_stack_size);
        w.bool(func.is_native());
        w.bool(func.is_threadable);
        w.bool(func.user_set_parallel);
        w.i32(func.kwarg_names.len() as i32);
        for name in &func.kwarg_names {
            w.i64(*name);
        }
        w.i32(func.async_progress_size);
        match &func.kind {
            FuncKind::Native { lookup, .. } => {
                let name = lookup.as_bytes();
                w.i32(name.len() as i32);
                w.bytes(name);
            }
            FuncKind::Bytecode { instructions, consts } => {
                w.i32(0);
                w.i32(instructions.len() as i32);
                w.bytes(instructions);
                write_inline_consts(&mut w, instructions, consts);
            }
        }
    }

    w.i64(program.indexes.main_func_index);
    w.i64(program.indexes.globalinitsimple_func_index);
    w.i64(program.indexes.globalinit_func_index);
    w.i64(program.indexes.has_attr_func_idx);
    w.i64(program.indexes.is_a_func_index);
    w.i64(program.attr_names.as_bytes);
    w.i64(program.attr_names.as_str);
    w.i64(program.attr_names.len);
    w.i64(program.attr_names.init);
    w.i64(program.attr_names.on_cloned);
    w.i64(program.attr_names.on_destroy);
    w.i64(program.attr_names.add);
    w.i64(program.attr_names.del);
    w.i64(program.attr_names.contains);
    w.i64(program.attr_names.is_a);
    w.i64(program.indexes.io_file_class_idx);
    w.i64(program.indexes.net_stream_class_idx);
    w.i64(program.indexes.urilib_uri_class_idx);

    w.i64(program.globals.len() as i64);
    for global in &program.globals {
        match &global.init {
            ConstValue::None => w.u8(GLOBALTYPE_NONE),
            ConstValue::Bool(b) => {
                w.u8(GLOBALTYPE_BOOL);
                w.bool(*b);
            }
            ConstValue::Int(i) => {
                w.u8(GLOBALTYPE_INT);
                w.i64(*i);
            }
            ConstValue::Float(f) => {
                w.u8(GLOBALTYPE_FLOAT);
                w.f64(*f);
            }
            ConstValue::Str(chars) => {
                w.u8(GLOBALTYPE_STR);
                w.i64(chars.len() as i64);
                w.chars32(chars);
            }
            ConstValue::Bytes(bytes) => {
                w.u8(GLOBALTYPE_BYTES);
                w.i64(bytes.len() as i64);
                w.bytes(bytes);
            }
        }
        w.bool(global.is_simple_constant);
        w.bool(global.is_const);
    }

    w.out
}

/// After each instruction blob: the constant-pool payload of every
/// SETCONST referencing the pool, in stream order.
fn write_inline_consts(w: &mut Writer, instructions: &[u8], consts: &[FuncConst]) {
    let mut offset = 0;
    while offset < instructions.len() {
        let (instr, size) = match decode_at(instructions, offset) {
            Ok(r) => r,
            Err(_) => break,
        };
        if let Instr::SetConst { value, .. } = &instr {
            match value {
                ConstOperand::PreallocStr(idx) => {
                    if let Some(FuncConst::Str(chars)) = consts.get(*idx as usize) {
                        w.i64(chars.len() as i64);
                        w.chars32(chars);
                    }
                }
                ConstOperand::PreallocBytes(idx) => {
                    if let Some(FuncConst::Bytes(bytes)) = consts.get(*idx as usize) {
                        w.i64(bytes.len() as i64);
                        w.bytes(bytes);
                    }
                }
                _ => {}
            }
        }
        offset += size;
    }
}

/// Deserialize a program blob, rebinding native functions against the
/// registered handlers.
pub fn restore(blob: &[u8], registry: &NativeRegistry) -> Result<Program, LoadError> {
    let mut r = Reader::new(blob);
    if r.take(DUMP_HEADER.len())? != DUMP_HEADER {
        return Err(LoadError::BadHeader);
    }
    let mut program = Program::new();

    let classes_count = r.i64()?;
    if classes_count < 0 {
        return Err(LoadError::Corrupt("negative class count".to_string()));
    }
    for _ in 0..classes_count {
        let base_class = r.i64()?;
        let is_error = r.bool()?;
        let is_threadable = r.bool()?;
        let user_set_parallel = r.bool()?;
        let has_equals_attr = r.bool()?;
        let funcattr_count = r.i32()?;
        if funcattr_count < 0 {
            return Err(LoadError::Corrupt("negative funcattr count".to_string()));
        }
        let mut funcattr_names = Vec::with_capacity(funcattr_count as usize);
        for _ in 0..funcattr_count {
            funcattr_names.push(r.i64()?);
        }
        let mut funcattr_funcs = Vec::with_capacity(funcattr_count as usize);
        for _ in 0..funcattr_count {
            funcattr_funcs.push(r.i32()?);
        }
        let varattr_count = r.i32()?;
        if varattr_count < 0 {
            return Err(LoadError::Corrupt("negative varattr count".to_string()));
        }
        let mut varattr_names = Vec::with_capacity(varattr_count as usize);
        for _ in 0..varattr_count {
            varattr_names.push(r.i64()?);
        }
        let varattr_flags = r.take(varattr_count as usize)?.to_vec();
        let has_varinit = r.bool()?;
        let varinit_idx = r.i32()?;
        program.classes.push(ClassDef {
            base_class,
            is_error,
            is_threadable,
            user_set_parallel,
            has_equals_attr,
            funcattr_names,
            funcattr_funcs,
            varattr_names,
            varattr_flags,
            varinit_func: if has_varinit { Some(varinit_idx) } else { None },
            attr_lookup: Default::default(),
        });
    }

    let func_count = r.i64()?;
    if func_count < 0 {
        return Err(LoadError::Corrupt("negative function count".to_string()));
    }
    for _ in 0..func_count {
        let input_stack_size = r.i32()?;
        let inner_stack_size = r.i32()?;
        let is_cfunc = r.bool()?;
        let is_threadable = r.bool()?;
        let user_set_parallel = r.bool()?;
        let kwarg_count = r.i32()?;
        if kwarg_count < 0 {
            return Err(LoadError::Corrupt("negative kwarg count".to_string()));
        }
        let mut kwarg_names = Vec::with_capacity(kwarg_count as usize);
        for _ in 0..kwarg_count {
            kwarg_names.push(r.i64()?);
        }
        let async_progress_size = r.i32()?;
        let lookup_len = r.i32()?;
        if lookup_len < 0 {
            return Err(LoadError::Corrupt("negative lookup length".to_string()));
        }
        let lookup = String::from_utf8(r.take(lookup_len as usize)?.to_vec())
            .map_err(|_| LoadError::Corrupt("native lookup name is not UTF-8".to_string()))?;
        let kind = if is_cfunc {
            let handler = registry
                .resolve(&lookup)
                .ok_or(LoadError::UnknownNativeFunction(lookup.clone()))?;
            FuncKind::Native { lookup, handler }
        } else {
            let instr_len = r.i32()?;
            if instr_len < 0 {
                return Err(LoadError::Corrupt("negative instruction length".to_string()));
            }
            let mut instructions = r.take(instr_len as usize)?.to_vec();
            let consts = read_inline_consts(&mut r, &mut instructions)?;
            FuncKind::Bytecode {
                instructions,
                consts,
            }
        };
        program.funcs.push(FuncDef {
            input_stack_size,
            inner_stack_size,
            is_threadable,
            user_set_parallel,
            kwarg_names,
            async_progress_size,
            kind,
        });
    }

    program.indexes.main_func_index = r.i64()?;
    program.indexes.globalinitsimple_func_index = r.i64()?;
    program.indexes.globalinit_func_index = r.i64()?;
    program.indexes.has_attr_func_idx = r.i64()?;
    program.indexes.is_a_func_index = r.i64()?;
    program.attr_names.as_bytes = r.i64()?;
    program.attr_names.as_str = r.i64()?;
    program.attr_names.len = r.i64()?;
    program.attr_names.init = r.i64()?;
    program.attr_names.on_cloned = r.i64()?;
    program.attr_names.on_destroy = r.i64()?;
    program.attr_names.add = r.i64()?;
    program.attr_names.del = r.i64()?;
    program.attr_names.contains = r.i64()?;
    program.attr_names.is_a = r.i64()?;
    program.indexes.io_file_class_idx = r.i64()?;
    program.indexes.net_stream_class_idx = r.i64()?;
    program.indexes.urilib_uri_class_idx = r.i64()?;

    let globalvar_count = r.i64()?;
    if globalvar_count < 0 {
        return Err(LoadError::Corrupt("negative global count".to_string()));
    }
    for _ in 0..globalvar_count {
        let type_tag = r.u8()?;
        let init = match type_tag {
            GLOBALTYPE_NONE => ConstValue::None,
            GLOBALTYPE_BOOL => ConstValue::Bool(r.bool()?),
            GLOBALTYPE_INT => ConstValue::Int(r.i64()?),
            GLOBALTYPE_FLOAT => ConstValue::Float(r.f64()?),
            GLOBALTYPE_STR => {
                let len = r.i64()?;
                if len < 0 {
                    return Err(LoadError::Corrupt("negative string length".to_string()));
                }
                ConstValue::Str(r.chars32(len as usize)?)
            }
            GLOBALTYPE_BYTES => {
                let len = r.i64()?;
                if len < 0 {
                    return Err(LoadError::Corrupt("negative bytes length".to_string()));
                }
                ConstValue::Bytes(r.take(len as usize)?.to_vec())
            }
            other => {
                return Err(LoadError::Corrupt(format!(
                    "unknown global value type {}",
                    other
                )))
            }
        };
        program.globals.push(GlobalDef {
            init,
            is_simple_constant: r.bool()?,
            is_const: r.bool()?,
        });
    }

    program.rebuild_class_attribute_lookup();
    rebuild_dispatch_tables(&mut program);
    Ok(program)
}

/// Read the pool payloads following an instruction blob and re-link each
/// SETCONST to its freshly assigned pool index.
fn read_inline_consts(
    r: &mut Reader<'_>,
    instructions: &mut [u8],
) -> Result<Vec<FuncConst>, LoadError> {
    let mut consts = Vec::new();
    let mut offset = 0;
    while offset < instructions.len() {
        let (instr, size) = decode_at(instructions, offset)
            .map_err(|e| LoadError::Corrupt(e.to_string()))?;
        if let Instr::SetConst { value, .. } = &instr {
            let is_prealloc = matches!(
                value,
                ConstOperand::PreallocStr(_) | ConstOperand::PreallocBytes(_)
            );
            if is_prealloc {
                let unit_count = r.i64()?;
                if unit_count < 0 {
                    return Err(LoadError::Corrupt("negative payload length".to_string()));
                }
                let pool_idx = consts.len() as u64;
                match value {
                    ConstOperand::PreallocStr(_) => {
                        consts.push(FuncConst::Str(r.chars32(unit_count as usize)?));
                    }
                    ConstOperand::PreallocBytes(_) => {
                        consts.push(FuncConst::Bytes(r.take(unit_count as usize)?.to_vec()));
                    }
                    _ => unreachable!(),
                }
                // Payload field sits after the type tag, the slot and the
                // value tag.
                instructions[offset + 4..offset + 12]
                    .copy_from_slice(&pool_idx.to_le_bytes());
            }
        }
        offset += size;
    }
    Ok(consts)
}

/// Dispatch tables are derived state: match the restored native lookup
/// names back onto the attribute ids they serve.
fn rebuild_dispatch_tables(program: &mut Program) {
    use crate::corelib::names;
    let attr = program.attr_names;
    for (id, func) in program.funcs.iter().enumerate() {
        if let FuncKind::Native { lookup, .. } = &func.kind {
            let container_name = match lookup.as_str() {
                "containers.add" => Some(attr.add),
                "containers.del" => Some(attr.del),
                "containers.contains" => Some(attr.contains),
                "containers.insert" => Some(names::INSERT),
                "containers.remove" => Some(names::REMOVE),
                _ => None,
            };
            if let Some(name) = container_name {
                program.container_method_funcs.insert(name, id as i64);
                continue;
            }
            let string_name = match lookup.as_str() {
                "strings.sub" => Some(names::SUB),
                "strings.find" => Some(names::FIND),
                "strings.trim" => Some(names::TRIM),
                "strings.lower" => Some(names::LOWER),
                "strings.upper" => Some(names::UPPER),
                "strings.split" => Some(names::SPLIT),
                "strings.join" => Some(names::JOIN),
                _ => None,
            };
            if let Some(name) = string_name {
                program.string_method_funcs.insert(name, id as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Assembler, BinOpKind, Instr};

    fn sample_program() -> Program {
        let mut p = Program::with_corelib();
        let mut asm = Assembler::new();
        asm.set_const_str(0, "a constant that is long enough to spill");
        asm.set_const_str(1, "ab");
        asm.set_const_bytes(2, &[1, 2, 3, 4, 5]);
        asm.instr(Instr::BinOp {
            op: BinOpKind::Add,
            slot_to: 3,
            arg1: 0,
            arg2: 1,
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 3,
        });
        let (buf, consts) = asm.finish();
        let main = p.add_bytecode_func(0, 4, vec![], buf, consts);
        p.indexes.main_func_index = main;
        p.globals.push(GlobalDef {
            init: ConstValue::Int(7),
            is_simple_constant: true,
            is_const: true,
        });
        p.globals.push(GlobalDef {
            init: ConstValue::Str("global text".chars().collect()),
            is_simple_constant: false,
            is_const: false,
        });
        p
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let original = sample_program();
        let blob = dump(&original);
        let registry = NativeRegistry::with_corelib();
        let restored = restore(&blob, &registry).expect("restore");

        assert_eq!(restored.classes.len(), original.classes.len());
        assert_eq!(restored.funcs.len(), original.funcs.len());
        assert_eq!(restored.globals.len(), original.globals.len());
        assert_eq!(
            restored.indexes.main_func_index,
            original.indexes.main_func_index
        );
        assert_eq!(restored.attr_names, original.attr_names);
        for (a, b) in original.funcs.iter().zip(restored.funcs.iter()) {
            assert_eq!(a.input_stack_size, b.input_stack_size);
            assert_eq!(a.inner_stack_size, b.inner_stack_size);
            assert_eq!(a.kwarg_names, b.kwarg_names);
            assert_eq!(a.is_native(), b.is_native());
        }
        for (a, b) in original.globals.iter().zip(restored.globals.iter()) {
            assert_eq!(a.init, b.init);
            assert_eq!(a.is_simple_constant, b.is_simple_constant);
            assert_eq!(a.is_const, b.is_const);
        }
    }

    #[test]
    fn test_round_trip_is_byte_stable() {
        let original = sample_program();
        let blob = dump(&original);
        let registry = NativeRegistry::with_corelib();
        let restored = restore(&blob, &registry).expect("restore");
        let blob2 = dump(&restored);
        assert_eq!(blob, blob2, "dump(restore(dump(p))) must reproduce the blob");
    }

    #[test]
    fn test_prealloc_consts_relinked() {
        let original = sample_program();
        let blob = dump(&original);
        let registry = NativeRegistry::with_corelib();
        let restored = restore(&blob, &registry).expect("restore");
        let main = restored.indexes.main_func_index;
        match &restored.funcs[main as usize].kind {
            FuncKind::Bytecode { consts, .. } => {
                assert_eq!(consts.len(), 2);
                assert!(matches!(&consts[0], FuncConst::Str(c)
                    if c.iter().collect::<String>() == "a constant that is long enough to spill"));
                assert!(matches!(&consts[1], FuncConst::Bytes(b) if b == &vec![1, 2, 3, 4, 5]));
            }
            _ => panic!("main function must be bytecode"),
        }
    }

    #[test]
    fn test_bad_header_rejected() {
        let registry = NativeRegistry::with_corelib();
        assert!(matches!(
            restore(b"not a program", &registry),
            Err(LoadError::BadHeader) | Err(LoadError::Truncated)
        ));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let original = sample_program();
        let blob = dump(&original);
        let registry = NativeRegistry::with_corelib();
        let truncated = &blob[..blob.len() / 2];
        assert!(restore(truncated, &registry).is_err());
    }

    #[test]
    fn test_missing_native_fails_load() {
        let original = sample_program();
        let blob = dump(&original);
        let empty = NativeRegistry::new();
        assert!(matches!(
            restore(&blob, &empty),
            Err(LoadError::UnknownNativeFunction(_))
        ));
    }

    #[test]
    fn test_restored_dispatch_tables_match() {
        let original = sample_program();
        let blob = dump(&original);
        let registry = NativeRegistry::with_corelib();
        let restored = restore(&blob, &registry).expect("restore");
        assert_eq!(
            restored.container_method_funcs,
            original.container_method_funcs
        );
        assert_eq!(restored.string_method_funcs, original.string_method_funcs);
    }
}
