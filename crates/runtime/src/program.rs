//! Program tables
//!
//! The deserialized, read-only program: classes, functions, globals, the
//! well-known indices the interpreter needs (main function, attribute name
//! ids, built-in class ids), and the dispatch tables mapping built-in
//! method names to native functions. Nothing here is mutated after load;
//! threads share the program behind an `Arc`.

use crate::bytecode::{decode_at, Instr, OpCode};
use crate::value::{ClassId, FuncId, NameId};
use serde::Serialize;
use std::collections::HashMap;

// Standard error classes occupy fixed ids in declaration order.
pub const CLASS_RUNTIMEERROR: ClassId = 0;
pub const CLASS_TYPEERROR: ClassId = 1;
pub const CLASS_VALUEERROR: ClassId = 2;
pub const CLASS_INDEXERROR: ClassId = 3;
pub const CLASS_ATTRIBUTEERROR: ClassId = 4;
pub const CLASS_OVERFLOWERROR: ClassId = 5;
pub const CLASS_MATHERROR: ClassId = 6;
pub const CLASS_ARGUMENTERROR: ClassId = 7;
pub const CLASS_OUTOFMEMORYERROR: ClassId = 8;
pub const CLASS_CONTAINERCHANGEDERROR: ClassId = 9;
pub const CLASS_INVALIDNOASYNCRESOURCEERROR: ClassId = 10;
pub const STANDARD_ERROR_CLASS_COUNT: i64 = 11;

pub fn standard_error_class_name(id: ClassId) -> Option<&'static str> {
    Some(match id {
        CLASS_RUNTIMEERROR => "RuntimeError",
        CLASS_TYPEERROR => "TypeError",
        CLASS_VALUEERROR => "ValueError",
        CLASS_INDEXERROR => "IndexError",
        CLASS_ATTRIBUTEERROR => "AttributeError",
        CLASS_OVERFLOWERROR => "OverflowError",
        CLASS_MATHERROR => "MathError",
        CLASS_ARGUMENTERROR => "ArgumentError",
        CLASS_OUTOFMEMORYERROR => "OutOfMemoryError",
        CLASS_CONTAINERCHANGEDERROR => "ContainerChangedError",
        CLASS_INVALIDNOASYNCRESOURCEERROR => "InvalidNoAsyncResourceError",
        _ => return None,
    })
}

/// Method indices in attribute lookup maps sit above this offset so one
/// i32 can say "var attribute 3" or "method attribute 3".
pub const METHOD_OFFSET: i32 = 1 << 30;

#[derive(Debug, Clone, Default)]
pub struct ClassDef {
    /// -1 when the class has no base class.
    pub base_class: ClassId,
    pub is_error: bool,
    pub is_threadable: bool,
    pub user_set_parallel: bool,
    pub has_equals_attr: bool,
    pub funcattr_names: Vec<NameId>,
    pub funcattr_funcs: Vec<i32>,
    pub varattr_names: Vec<NameId>,
    pub varattr_flags: Vec<u8>,
    /// Hidden per-instance variable initializer, run by NEWINSTANCE.
    pub varinit_func: Option<i32>,
    /// name id -> varattr index, or METHOD_OFFSET + funcattr index.
    /// Rebuilt after load, not serialized.
    pub attr_lookup: HashMap<NameId, i32>,
}

impl ClassDef {
    pub fn new_error_class(base_class: ClassId) -> Self {
        ClassDef {
            base_class,
            is_error: true,
            ..ClassDef::default()
        }
    }

    pub fn rebuild_attr_lookup(&mut self) {
        self.attr_lookup.clear();
        for (i, name) in self.varattr_names.iter().enumerate() {
            self.attr_lookup.insert(*name, i as i32);
        }
        for (i, name) in self.funcattr_names.iter().enumerate() {
            self.attr_lookup.insert(*name, METHOD_OFFSET + i as i32);
        }
    }
}

/// Constant-pool entry of one function: payload of a SETCONST whose value
/// does not fit inline in the instruction stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncConst {
    Str(Vec<char>),
    Bytes(Vec<u8>),
}

/// Native function handler. Reads its arguments from the callee frame via
/// the context and finishes with a return value, an error, or a
/// suspension request.
pub type NativeFn = fn(&mut crate::interp::NativeCtx<'_>) -> crate::interp::NativeOutcome;

#[derive(Clone)]
pub enum FuncKind {
    Bytecode {
        instructions: Vec<u8>,
        consts: Vec<FuncConst>,
    },
    Native {
        /// Name matched against the host's registered handlers on load.
        lookup: String,
        handler: NativeFn,
    },
}

impl std::fmt::Debug for FuncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FuncKind::Bytecode { instructions, consts } => f
                .debug_struct("Bytecode")
                .field("instruction_bytes", &instructions.len())
                .field("consts", &consts.len())
                .finish(),
            FuncKind::Native { lookup, .. } => {
                f.debug_struct("Native").field("lookup", lookup).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    /// Argument slots: positional count plus keyword count.
    pub input_stack_size: i32,
    pub inner_stack_size: i32,
    pub is_threadable: bool,
    pub user_set_parallel: bool,
    /// Sorted ascending; the call protocol relies on it.
    pub kwarg_names: Vec<NameId>,
    /// Nonzero marks a native that may suspend.
    pub async_progress_size: i32,
    pub kind: FuncKind,
}

impl FuncDef {
    pub fn positional_count(&self) -> i32 {
        self.input_stack_size - self.kwarg_names.len() as i32
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, FuncKind::Native { .. })
    }
}

/// Serializable initial value of a global variable.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Vec<char>),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub init: ConstValue,
    /// Simple constants may be read from parallel threads.
    pub is_simple_constant: bool,
    pub is_const: bool,
}

/// The attribute name ids every program carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrNameIds {
    pub as_bytes: NameId,
    pub as_str: NameId,
    pub len: NameId,
    pub init: NameId,
    pub on_cloned: NameId,
    pub on_destroy: NameId,
    pub add: NameId,
    pub del: NameId,
    pub contains: NameId,
    pub is_a: NameId,
}

impl Default for AttrNameIds {
    fn default() -> Self {
        AttrNameIds {
            as_bytes: 1,
            as_str: 2,
            len: 3,
            init: 4,
            on_cloned: 5,
            on_destroy: 6,
            add: 7,
            del: 8,
            contains: 9,
            is_a: 10,
        }
    }
}

/// Well-known function and class indices. -1 = absent.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownIndexes {
    pub main_func_index: FuncId,
    pub globalinitsimple_func_index: FuncId,
    pub globalinit_func_index: FuncId,
    pub has_attr_func_idx: FuncId,
    pub is_a_func_index: FuncId,
    pub io_file_class_idx: ClassId,
    pub net_stream_class_idx: ClassId,
    pub urilib_uri_class_idx: ClassId,
}

impl Default for WellKnownIndexes {
    fn default() -> Self {
        WellKnownIndexes {
            main_func_index: -1,
            globalinitsimple_func_index: -1,
            globalinit_func_index: -1,
            has_attr_func_idx: -1,
            is_a_func_index: -1,
            io_file_class_idx: -1,
            net_stream_class_idx: -1,
            urilib_uri_class_idx: -1,
        }
    }
}

#[derive(Debug, Default)]
pub struct Program {
    pub classes: Vec<ClassDef>,
    pub funcs: Vec<FuncDef>,
    pub globals: Vec<GlobalDef>,
    pub indexes: WellKnownIndexes,
    pub attr_names: AttrNameIds,
    /// Built-in method dispatch: name id -> native func, for container
    /// receivers (lists, maps, sets, vectors).
    pub container_method_funcs: HashMap<NameId, FuncId>,
    /// Same for string and bytes receivers.
    pub string_method_funcs: HashMap<NameId, FuncId>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    /// A program seeded with the standard error classes, the built-in
    /// collaborator classes and all corelib native functions.
    pub fn with_corelib() -> Self {
        let mut p = Program::new();
        // Standard error classes: RuntimeError is the root, every other
        // standard error derives from it.
        p.classes.push(ClassDef::new_error_class(-1));
        for _ in 1..STANDARD_ERROR_CLASS_COUNT {
            p.classes.push(ClassDef::new_error_class(CLASS_RUNTIMEERROR));
        }
        // Built-in collaborator classes referenced by the well-known
        // indices; their attribute surface lives in native modules.
        p.indexes.io_file_class_idx = p.classes.len() as ClassId;
        p.classes.push(ClassDef::default());
        p.indexes.net_stream_class_idx = p.classes.len() as ClassId;
        p.classes.push(ClassDef::default());
        p.indexes.urilib_uri_class_idx = p.classes.len() as ClassId;
        p.classes.push(ClassDef::default());
        crate::corelib::install(&mut p);
        p.rebuild_class_attribute_lookup();
        p
    }

    pub fn rebuild_class_attribute_lookup(&mut self) {
        for class in &mut self.classes {
            class.rebuild_attr_lookup();
        }
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassDef> {
        if id < 0 {
            return None;
        }
        self.classes.get(id as usize)
    }

    pub fn func(&self, id: FuncId) -> Option<&FuncDef> {
        if id < 0 {
            return None;
        }
        self.funcs.get(id as usize)
    }

    /// Walk the base-class chain, `true` if `class_id` is `of` or derives
    /// from it.
    pub fn is_class_or_base(&self, class_id: ClassId, of: ClassId) -> bool {
        let mut current = class_id;
        loop {
            if current == of {
                return true;
            }
            match self.class(current) {
                Some(c) if c.base_class >= 0 => current = c.base_class,
                _ => return false,
            }
        }
    }

    /// Attribute lookup including inherited attributes. Returns the
    /// encoded index (var idx, or METHOD_OFFSET + funcattr idx) plus the
    /// class that defines it.
    pub fn lookup_class_attr(&self, class_id: ClassId, name: NameId) -> Option<(ClassId, i32)> {
        let mut current = class_id;
        loop {
            let c = self.class(current)?;
            if let Some(idx) = c.attr_lookup.get(&name) {
                return Some((current, *idx));
            }
            if c.base_class < 0 {
                return None;
            }
            current = c.base_class;
        }
    }

    /// Count of per-instance variable slots including inherited ones.
    /// Instances allocate their varattr array from it.
    pub fn class_varattr_count(&self, class_id: ClassId) -> usize {
        let mut count = 0;
        let mut current = class_id;
        while let Some(c) = self.class(current) {
            count += c.varattr_names.len();
            if c.base_class < 0 {
                break;
            }
            current = c.base_class;
        }
        count
    }

    /// Register one native function as a program function; returns its id.
    pub fn add_native_func(
        &mut self,
        lookup: &str,
        handler: NativeFn,
        posargs: i32,
        kwarg_names: Vec<NameId>,
        is_threadable: bool,
        may_suspend: bool,
    ) -> FuncId {
        let id = self.funcs.len() as FuncId;
        let mut sorted = kwarg_names;
        sorted.sort_unstable();
        self.funcs.push(FuncDef {
            input_stack_size: posargs + sorted.len() as i32,
            inner_stack_size: 0,
            is_threadable,
            user_set_parallel: false,
            kwarg_names: sorted,
            async_progress_size: if may_suspend { 256 } else { 0 },
            kind: FuncKind::Native {
                lookup: lookup.to_string(),
                handler,
            },
        });
        id
    }

    /// Register one bytecode function; returns its id. Used by tests and
    /// tooling that assemble programs directly.
    pub fn add_bytecode_func(
        &mut self,
        input_stack_size: i32,
        inner_stack_size: i32,
        kwarg_names: Vec<NameId>,
        instructions: Vec<u8>,
        consts: Vec<FuncConst>,
    ) -> FuncId {
        let id = self.funcs.len() as FuncId;
        let mut sorted = kwarg_names;
        sorted.sort_unstable();
        self.funcs.push(FuncDef {
            input_stack_size,
            inner_stack_size,
            is_threadable: false,
            user_set_parallel: false,
            kwarg_names: sorted,
            async_progress_size: 0,
            kind: FuncKind::Bytecode {
                instructions,
                consts,
            },
        });
        id
    }

    pub fn stats(&self) -> ProgramStats {
        let mut stats = ProgramStats {
            classes: self.classes.len() as i64,
            funcs: self.funcs.len() as i64,
            native_funcs: self.funcs.iter().filter(|f| f.is_native()).count() as i64,
            globals: self.globals.len() as i64,
            instruction_bytes: 0,
            opcodes: Vec::new(),
        };
        let mut counts = [0i64; crate::bytecode::OPCODE_COUNT];
        for func in &self.funcs {
            if let FuncKind::Bytecode { instructions, .. } = &func.kind {
                stats.instruction_bytes += instructions.len() as i64;
                let mut offset = 0;
                while offset < instructions.len() {
                    match decode_at(instructions, offset) {
                        Ok((_, size)) => {
                            counts[instructions[offset] as usize] += 1;
                            offset += size;
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (i, count) in counts.iter().enumerate() {
            if *count > 0 {
                let op = OpCode::from_byte(i as u8).unwrap();
                stats.opcodes.push(OpcodeCount {
                    opcode: op.name().to_string(),
                    count: *count,
                });
            }
        }
        stats
    }

    /// Disassemble every bytecode function.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (id, func) in self.funcs.iter().enumerate() {
            match &func.kind {
                FuncKind::Native { lookup, .. } => {
                    out.push_str(&format!("func {} = native {:?}\n", id, lookup));
                }
                FuncKind::Bytecode { instructions, .. } => {
                    out.push_str(&format!(
                        "func {} (input {}, inner {}):\n",
                        id, func.input_stack_size, func.inner_stack_size
                    ));
                    let mut offset = 0;
                    while offset < instructions.len() {
                        match decode_at(instructions, offset) {
                            Ok((instr, size)) => {
                                out.push_str(&format!(
                                    "  {:6}  {}\n",
                                    offset,
                                    crate::bytecode::format_instr(&instr)
                                ));
                                offset += size;
                            }
                            Err(_) => {
                                out.push_str(&format!("  {:6}  <corrupt>\n", offset));
                                break;
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Decode the instruction of a bytecode function at a byte offset.
    pub fn decode_instr(&self, func_id: FuncId, offset: u32) -> Result<(Instr, usize), crate::bytecode::DecodeError> {
        let func = self
            .func(func_id)
            .ok_or(crate::bytecode::DecodeError::Corrupt { offset: offset as usize })?;
        match &func.kind {
            FuncKind::Bytecode { instructions, .. } => decode_at(instructions, offset as usize),
            FuncKind::Native { .. } => {
                Err(crate::bytecode::DecodeError::Corrupt { offset: offset as usize })
            }
        }
    }
}

/// Registry of host-provided native handlers, matched by lookup name when
/// a program is restored.
#[derive(Default)]
pub struct NativeRegistry {
    entries: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry::default()
    }

    /// The registry with every corelib handler preregistered.
    pub fn with_corelib() -> Self {
        let mut reg = NativeRegistry::new();
        crate::corelib::register_handlers(&mut reg);
        reg
    }

    pub fn register_c_function(&mut self, name: &str, handler: NativeFn) {
        self.entries.insert(name.to_string(), handler);
    }

    pub fn resolve(&self, name: &str) -> Option<NativeFn> {
        self.entries.get(name).copied()
    }
}

#[derive(Debug, Serialize)]
pub struct OpcodeCount {
    pub opcode: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct ProgramStats {
    pub classes: i64,
    pub funcs: i64,
    pub native_funcs: i64,
    pub globals: i64,
    pub instruction_bytes: i64,
    pub opcodes: Vec<OpcodeCount>,
}

impl ProgramStats {
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("classes:           {}\n", self.classes));
        out.push_str(&format!(
            "functions:         {} ({} native)\n",
            self.funcs, self.native_funcs
        ));
        out.push_str(&format!("globals:           {}\n", self.globals));
        out.push_str(&format!("instruction bytes: {}\n", self.instruction_bytes));
        out.push_str("opcode counts:\n");
        for oc in &self.opcodes {
            out.push_str(&format!("  {:20} {}\n", oc.opcode, oc.count));
        }
        out
    }

    pub fn render_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Assembler, ConstOperand, Instr};

    #[test]
    fn test_corelib_program_has_standard_errors() {
        let p = Program::with_corelib();
        assert!(p.classes.len() >= STANDARD_ERROR_CLASS_COUNT as usize);
        assert!(p.class(CLASS_TYPEERROR).unwrap().is_error);
        assert!(p.is_class_or_base(CLASS_TYPEERROR, CLASS_RUNTIMEERROR));
        assert!(!p.is_class_or_base(CLASS_RUNTIMEERROR, CLASS_TYPEERROR));
    }

    #[test]
    fn test_builtin_class_indexes_exist() {
        let p = Program::with_corelib();
        assert!(p.class(p.indexes.io_file_class_idx).is_some());
        assert!(p.class(p.indexes.net_stream_class_idx).is_some());
        assert!(p.class(p.indexes.urilib_uri_class_idx).is_some());
    }

    #[test]
    fn test_attr_lookup_walks_base_chain() {
        let mut p = Program::new();
        let base = ClassDef {
            base_class: -1,
            varattr_names: vec![100],
            varattr_flags: vec![0],
            funcattr_names: vec![200],
            funcattr_funcs: vec![0],
            ..ClassDef::default()
        };
        p.classes.push(base);
        let derived = ClassDef {
            base_class: 0,
            varattr_names: vec![101],
            varattr_flags: vec![0],
            ..ClassDef::default()
        };
        p.classes.push(derived);
        p.rebuild_class_attribute_lookup();

        assert_eq!(p.lookup_class_attr(1, 101), Some((1, 0)));
        assert_eq!(p.lookup_class_attr(1, 100), Some((0, 0)));
        assert_eq!(p.lookup_class_attr(1, 200), Some((0, METHOD_OFFSET)));
        assert_eq!(p.lookup_class_attr(1, 999), None);
        assert_eq!(p.class_varattr_count(1), 2);
    }

    #[test]
    fn test_stats_counts_opcodes() {
        let mut p = Program::new();
        let mut asm = Assembler::new();
        asm.instr(Instr::SetConst {
            slot: 0,
            value: ConstOperand::Int(1),
        });
        asm.instr(Instr::SetConst {
            slot: 1,
            value: ConstOperand::Int(2),
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 0,
        });
        let (buf, consts) = asm.finish();
        p.add_bytecode_func(0, 2, vec![], buf, consts);
        let stats = p.stats();
        assert_eq!(stats.funcs, 1);
        let setconst = stats
            .opcodes
            .iter()
            .find(|oc| oc.opcode == "setconst")
            .unwrap();
        assert_eq!(setconst.count, 2);
        assert!(stats.render_json().contains("setconst"));
    }

    #[test]
    fn test_kwarg_names_kept_sorted() {
        let mut p = Program::new();
        let id = p.add_bytecode_func(3, 0, vec![30, 10, 20], Vec::new(), Vec::new());
        assert_eq!(p.func(id).unwrap().kwarg_names, vec![10, 20, 30]);
        assert_eq!(p.func(id).unwrap().positional_count(), 0);
    }
}
