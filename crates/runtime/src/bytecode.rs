//! Bytecode definitions
//!
//! Every instruction starts with a 1-byte type tag and has a fixed size
//! computable from that tag alone; operands are little-endian. The
//! interpreter decodes instructions in place from the function's byte
//! buffer, the serializer walks the same buffers to extract SETCONST
//! payloads, and the disassembler renders them.
//!
//! The `Assembler` at the bottom builds instruction buffers for tests and
//! tools; the compiler front-end emits the identical layout.

use crate::value::{ClassId, FuncId, NameId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Invalid = 0,
    SetConst = 1,
    SetGlobal = 2,
    GetGlobal = 3,
    SetByIndexExpr = 4,
    SetByAttributeName = 5,
    SetByAttributeIdx = 6,
    GetFunc = 7,
    GetClass = 8,
    ValueCopy = 9,
    BinOp = 10,
    UnOp = 11,
    Call = 12,
    CallIgnoreIfNone = 13,
    SetTop = 14,
    CallSetTop = 15,
    ReturnValue = 16,
    JumpTarget = 17,
    CondJump = 18,
    CondJumpEx = 19,
    Jump = 20,
    NewIterator = 21,
    Iterate = 22,
    PushRescueFrame = 23,
    AddRescueTypeByRef = 24,
    AddRescueType = 25,
    PopRescueFrame = 26,
    GetAttributeByName = 27,
    GetAttributeByIdx = 28,
    JumpToFinally = 29,
    NewList = 30,
    NewSet = 31,
    NewMap = 32,
    NewVector = 33,
    NewInstanceByRef = 34,
    NewInstance = 35,
    GetConstructor = 36,
    AwaitItem = 37,
    HasAttrJump = 38,
    Raise = 39,
    RaiseByRef = 40,
}

pub const OPCODE_COUNT: usize = 41;

impl OpCode {
    pub fn from_byte(b: u8) -> Option<OpCode> {
        if b as usize >= OPCODE_COUNT {
            return None;
        }
        // Contiguous numbering, checked above.
        Some(unsafe { std::mem::transmute::<u8, OpCode>(b) })
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Invalid => "invalid",
            OpCode::SetConst => "setconst",
            OpCode::SetGlobal => "setglobal",
            OpCode::GetGlobal => "getglobal",
            OpCode::SetByIndexExpr => "setbyindexexpr",
            OpCode::SetByAttributeName => "setbyattributename",
            OpCode::SetByAttributeIdx => "setbyattributeidx",
            OpCode::GetFunc => "getfunc",
            OpCode::GetClass => "getclass",
            OpCode::ValueCopy => "valuecopy",
            OpCode::BinOp => "binop",
            OpCode::UnOp => "unop",
            OpCode::Call => "call",
            OpCode::CallIgnoreIfNone => "callignoreifnone",
            OpCode::SetTop => "settop",
            OpCode::CallSetTop => "callsettop",
            OpCode::ReturnValue => "returnvalue",
            OpCode::JumpTarget => "jumptarget",
            OpCode::CondJump => "condjump",
            OpCode::CondJumpEx => "condjumpex",
            OpCode::Jump => "jump",
            OpCode::NewIterator => "newiterator",
            OpCode::Iterate => "iterate",
            OpCode::PushRescueFrame => "pushrescueframe",
            OpCode::AddRescueTypeByRef => "addrescuetypebyref",
            OpCode::AddRescueType => "addrescuetype",
            OpCode::PopRescueFrame => "poprescueframe",
            OpCode::GetAttributeByName => "getattributebyname",
            OpCode::GetAttributeByIdx => "getattributebyidx",
            OpCode::JumpToFinally => "jumptofinally",
            OpCode::NewList => "newlist",
            OpCode::NewSet => "newset",
            OpCode::NewMap => "newmap",
            OpCode::NewVector => "newvector",
            OpCode::NewInstanceByRef => "newinstancebyref",
            OpCode::NewInstance => "newinstance",
            OpCode::GetConstructor => "getconstructor",
            OpCode::AwaitItem => "awaititem",
            OpCode::HasAttrJump => "hasattrjump",
            OpCode::Raise => "raise",
            OpCode::RaiseByRef => "raisebyref",
        }
    }

    /// Full instruction size in bytes, including the type tag.
    pub fn size(self) -> usize {
        match self {
            OpCode::Invalid => 1,
            OpCode::SetConst => 20,
            OpCode::SetGlobal => 11,
            OpCode::GetGlobal => 11,
            OpCode::SetByIndexExpr => 7,
            OpCode::SetByAttributeName => 13,
            OpCode::SetByAttributeIdx => 7,
            OpCode::GetFunc => 11,
            OpCode::GetClass => 11,
            OpCode::ValueCopy => 5,
            OpCode::BinOp => 8,
            OpCode::UnOp => 6,
            OpCode::Call => 10,
            OpCode::CallIgnoreIfNone => 10,
            OpCode::SetTop => 3,
            OpCode::CallSetTop => 3,
            OpCode::ReturnValue => 3,
            OpCode::JumpTarget => 5,
            OpCode::CondJump => 7,
            OpCode::CondJumpEx => 8,
            OpCode::Jump => 5,
            OpCode::NewIterator => 5,
            OpCode::Iterate => 9,
            OpCode::PushRescueFrame => 12,
            OpCode::AddRescueTypeByRef => 3,
            OpCode::AddRescueType => 9,
            OpCode::PopRescueFrame => 1,
            OpCode::GetAttributeByName => 13,
            OpCode::GetAttributeByIdx => 7,
            OpCode::JumpToFinally => 1,
            OpCode::NewList => 3,
            OpCode::NewSet => 3,
            OpCode::NewMap => 3,
            OpCode::NewVector => 3,
            OpCode::NewInstanceByRef => 5,
            OpCode::NewInstance => 11,
            OpCode::GetConstructor => 5,
            OpCode::AwaitItem => 5,
            OpCode::HasAttrJump => 15,
            OpCode::Raise => 11,
            OpCode::RaiseByRef => 5,
        }
    }
}

/// Binary/unary operator tags. The numbering is part of the instruction
/// encoding; unary operators share the tag space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinOpKind {
    Divide = 1,
    Add = 2,
    Subtract = 3,
    Multiply = 5,
    Modulo = 6,
    BitOr = 7,
    BitAnd = 8,
    BitXor = 9,
    ShiftLeft = 11,
    ShiftRight = 12,
    CmpEqual = 13,
    CmpNotEqual = 14,
    CmpGreaterEqual = 15,
    CmpLessEqual = 16,
    CmpGreater = 17,
    CmpLess = 18,
    BoolAnd = 19,
    BoolOr = 20,
    IndexByExpr = 22,
}

impl BinOpKind {
    pub fn from_byte(b: u8) -> Option<BinOpKind> {
        Some(match b {
            1 => BinOpKind::Divide,
            2 => BinOpKind::Add,
            3 => BinOpKind::Subtract,
            5 => BinOpKind::Multiply,
            6 => BinOpKind::Modulo,
            7 => BinOpKind::BitOr,
            8 => BinOpKind::BitAnd,
            9 => BinOpKind::BitXor,
            11 => BinOpKind::ShiftLeft,
            12 => BinOpKind::ShiftRight,
            13 => BinOpKind::CmpEqual,
            14 => BinOpKind::CmpNotEqual,
            15 => BinOpKind::CmpGreaterEqual,
            16 => BinOpKind::CmpLessEqual,
            17 => BinOpKind::CmpGreater,
            18 => BinOpKind::CmpLess,
            19 => BinOpKind::BoolAnd,
            20 => BinOpKind::BoolOr,
            22 => BinOpKind::IndexByExpr,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BinOpKind::Divide => "/",
            BinOpKind::Add => "+",
            BinOpKind::Subtract => "-",
            BinOpKind::Multiply => "*",
            BinOpKind::Modulo => "%",
            BinOpKind::BitOr => "|",
            BinOpKind::BitAnd => "&",
            BinOpKind::BitXor => "^",
            BinOpKind::ShiftLeft => "<<",
            BinOpKind::ShiftRight => ">>",
            BinOpKind::CmpEqual => "==",
            BinOpKind::CmpNotEqual => "!=",
            BinOpKind::CmpGreaterEqual => ">=",
            BinOpKind::CmpLessEqual => "<=",
            BinOpKind::CmpGreater => ">",
            BinOpKind::CmpLess => "<",
            BinOpKind::BoolAnd => "and",
            BinOpKind::BoolOr => "or",
            BinOpKind::IndexByExpr => "[]",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnOpKind {
    Negate = 4,
    BitNot = 10,
    BoolNot = 21,
}

impl UnOpKind {
    pub fn from_byte(b: u8) -> Option<UnOpKind> {
        Some(match b {
            4 => UnOpKind::Negate,
            10 => UnOpKind::BitNot,
            21 => UnOpKind::BoolNot,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            UnOpKind::Negate => "neg",
            UnOpKind::BitNot => "~",
            UnOpKind::BoolNot => "not",
        }
    }
}

/// CALL flag bits.
pub const CALLFLAG_UNPACKLASTPOSARG: u8 = 0x1;
pub const CALLFLAG_ASYNC: u8 = 0x2;
pub const CALLFLAG_ASYNCPARALLEL: u8 = 0x4;

/// CONDJUMPEX flag bits.
pub const CONDJUMPEX_JUMP_ON_TRUE: u8 = 0x1;
pub const CONDJUMPEX_TRUTH_TEST: u8 = 0x2;

/// PUSHRESCUEFRAME mode bits.
pub const RESCUEMODE_JUMPONRESCUE: u8 = 0x1;
pub const RESCUEMODE_JUMPONFINALLY: u8 = 0x2;

/// In the i16 attr-index operand space, method attributes sit at or
/// above this offset; variable attributes below it.
pub const ATTRIDX_METHOD_OFFSET: i16 = 1 << 14;

/// Constant tags inside a SETCONST payload and in serialized globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConstTag {
    None = 1,
    Bool = 2,
    Int = 3,
    Float = 4,
    ShortStr = 5,
    ShortBytes = 6,
    PreallocStr = 7,
    PreallocBytes = 8,
    FuncRef = 9,
    ClassRef = 10,
}

impl ConstTag {
    pub fn from_byte(b: u8) -> Option<ConstTag> {
        Some(match b {
            1 => ConstTag::None,
            2 => ConstTag::Bool,
            3 => ConstTag::Int,
            4 => ConstTag::Float,
            5 => ConstTag::ShortStr,
            6 => ConstTag::ShortBytes,
            7 => ConstTag::PreallocStr,
            8 => ConstTag::PreallocBytes,
            9 => ConstTag::FuncRef,
            10 => ConstTag::ClassRef,
            _ => return None,
        })
    }
}

/// Decoded SETCONST operand.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstOperand {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    ShortStr(Vec<char>),
    ShortBytes(Vec<u8>),
    /// Index into the function's constant pool (string entry).
    PreallocStr(u32),
    /// Index into the function's constant pool (bytes entry).
    PreallocBytes(u32),
    FuncRef(FuncId),
    ClassRef(ClassId),
}

/// One decoded instruction. Slot operands are relative to the current
/// function floor.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Invalid,
    SetConst { slot: i16, value: ConstOperand },
    SetGlobal { global_to: i64, slot_from: i16 },
    GetGlobal { slot_to: i16, global_from: i64 },
    SetByIndexExpr { slot_obj: i16, slot_index: i16, slot_value: i16 },
    SetByAttributeName { slot_obj: i16, name_idx: NameId, slot_value: i16 },
    SetByAttributeIdx { slot_obj: i16, attr_idx: i16, slot_value: i16 },
    GetFunc { slot_to: i16, func_from: FuncId },
    GetClass { slot_to: i16, class_from: ClassId },
    ValueCopy { slot_to: i16, slot_from: i16 },
    BinOp { op: BinOpKind, slot_to: i16, arg1: i16, arg2: i16 },
    UnOp { op: UnOpKind, slot_to: i16, arg: i16 },
    Call { return_to: i16, slot_called_from: i16, flags: u8, posargs: i16, kwargs: i16 },
    CallIgnoreIfNone { return_to: i16, slot_called_from: i16, flags: u8, posargs: i16, kwargs: i16 },
    SetTop { top_to: i16 },
    CallSetTop { top_to: i16 },
    ReturnValue { return_slot_from: i16 },
    JumpTarget { jump_id: i32 },
    CondJump { jump_bytes_offset: i32, conditional_slot: i16 },
    CondJumpEx { jump_bytes_offset: i32, conditional_slot: i16, flags: u8 },
    Jump { jump_bytes_offset: i32 },
    NewIterator { slot_iterator_to: i16, slot_container_from: i16 },
    Iterate { slot_value_to: i16, slot_iterator_from: i16, jump_on_end: i32 },
    PushRescueFrame { mode: u8, slot_error_to: i16, jump_on_rescue: i32, jump_on_finally: i32 },
    AddRescueTypeByRef { slot_from: i16 },
    AddRescueType { class_id: ClassId },
    PopRescueFrame,
    GetAttributeByName { slot_to: i16, obj_slot_from: i16, name_idx: NameId },
    GetAttributeByIdx { slot_to: i16, obj_slot_from: i16, attr_idx: i16 },
    JumpToFinally,
    NewList { slot_to: i16 },
    NewSet { slot_to: i16 },
    NewMap { slot_to: i16 },
    NewVector { slot_to: i16 },
    NewInstanceByRef { slot_to: i16, class_slot_from: i16 },
    NewInstance { slot_to: i16, class_id: ClassId },
    GetConstructor { slot_to: i16, obj_slot_from: i16 },
    AwaitItem { slot_to: i16, slot_await_from: i16 },
    HasAttrJump { jump_bytes_offset: i32, slot_from: i16, name_idx: NameId },
    Raise { class_id: ClassId, msg_slot_from: i16 },
    RaiseByRef { class_slot_from: i16, msg_slot_from: i16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Instruction runs past the buffer end, or the type byte is unknown.
    Corrupt { offset: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Corrupt { offset } => {
                write!(f, "corrupt instruction at byte offset {}", offset)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

fn read_i16(buf: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(b)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Decode the instruction at `offset`. Returns the instruction and its
/// size in bytes.
pub fn decode_at(buf: &[u8], offset: usize) -> Result<(Instr, usize), DecodeError> {
    let corrupt = || DecodeError::Corrupt { offset };
    let tag = *buf.get(offset).ok_or_else(corrupt)?;
    let op = OpCode::from_byte(tag).ok_or_else(corrupt)?;
    let size = op.size();
    if offset + size > buf.len() {
        return Err(corrupt());
    }
    let b = &buf[offset..offset + size];
    let instr = match op {
        OpCode::Invalid => Instr::Invalid,
        OpCode::SetConst => {
            let slot = read_i16(b, 1);
            let vtag = ConstTag::from_byte(b[3]).ok_or_else(corrupt)?;
            let p = &b[4..20];
            let value = match vtag {
                ConstTag::None => ConstOperand::None,
                ConstTag::Bool => ConstOperand::Bool(read_i64(p, 0) != 0),
                ConstTag::Int => ConstOperand::Int(read_i64(p, 0)),
                ConstTag::Float => ConstOperand::Float(f64::from_bits(read_i64(p, 0) as u64)),
                ConstTag::ShortStr => {
                    let len = (p[0] as usize).min(3);
                    let mut chars = Vec::with_capacity(len);
                    for i in 0..len {
                        let u = read_u32(p, 4 + i * 4);
                        chars.push(char::from_u32(u).ok_or_else(corrupt)?);
                    }
                    ConstOperand::ShortStr(chars)
                }
                ConstTag::ShortBytes => {
                    let len = (p[0] as usize).min(3);
                    ConstOperand::ShortBytes(p[4..4 + len].to_vec())
                }
                ConstTag::PreallocStr => ConstOperand::PreallocStr(read_i64(p, 0) as u32),
                ConstTag::PreallocBytes => ConstOperand::PreallocBytes(read_i64(p, 0) as u32),
                ConstTag::FuncRef => ConstOperand::FuncRef(read_i64(p, 0)),
                ConstTag::ClassRef => ConstOperand::ClassRef(read_i64(p, 0)),
            };
            Instr::SetConst { slot, value }
        }
        OpCode::SetGlobal => Instr::SetGlobal {
            global_to: read_i64(b, 1),
            slot_from: read_i16(b, 9),
        },
        OpCode::GetGlobal => Instr::GetGlobal {
            slot_to: read_i16(b, 1),
            global_from: read_i64(b, 3),
        },
        OpCode::SetByIndexExpr => Instr::SetByIndexExpr {
            slot_obj: read_i16(b, 1),
            slot_index: read_i16(b, 3),
            slot_value: read_i16(b, 5),
        },
        OpCode::SetByAttributeName => Instr::SetByAttributeName {
            slot_obj: read_i16(b, 1),
            name_idx: read_i64(b, 3),
            slot_value: read_i16(b, 11),
        },
        OpCode::SetByAttributeIdx => Instr::SetByAttributeIdx {
            slot_obj: read_i16(b, 1),
            attr_idx: read_i16(b, 3),
            slot_value: read_i16(b, 5),
        },
        OpCode::GetFunc => Instr::GetFunc {
            slot_to: read_i16(b, 1),
            func_from: read_i64(b, 3),
        },
        OpCode::GetClass => Instr::GetClass {
            slot_to: read_i16(b, 1),
            class_from: read_i64(b, 3),
        },
        OpCode::ValueCopy => Instr::ValueCopy {
            slot_to: read_i16(b, 1),
            slot_from: read_i16(b, 3),
        },
        OpCode::BinOp => Instr::BinOp {
            op: BinOpKind::from_byte(b[1]).ok_or_else(corrupt)?,
            slot_to: read_i16(b, 2),
            arg1: read_i16(b, 4),
            arg2: read_i16(b, 6),
        },
        OpCode::UnOp => Instr::UnOp {
            op: UnOpKind::from_byte(b[1]).ok_or_else(corrupt)?,
            slot_to: read_i16(b, 2),
            arg: read_i16(b, 4),
        },
        OpCode::Call => Instr::Call {
            return_to: read_i16(b, 1),
            slot_called_from: read_i16(b, 3),
            flags: b[5],
            posargs: read_i16(b, 6),
            kwargs: read_i16(b, 8),
        },
        OpCode::CallIgnoreIfNone => Instr::CallIgnoreIfNone {
            return_to: read_i16(b, 1),
            slot_called_from: read_i16(b, 3),
            flags: b[5],
            posargs: read_i16(b, 6),
            kwargs: read_i16(b, 8),
        },
        OpCode::SetTop => Instr::SetTop {
            top_to: read_i16(b, 1),
        },
        OpCode::CallSetTop => Instr::CallSetTop {
            top_to: read_i16(b, 1),
        },
        OpCode::ReturnValue => Instr::ReturnValue {
            return_slot_from: read_i16(b, 1),
        },
        OpCode::JumpTarget => Instr::JumpTarget {
            jump_id: read_i32(b, 1),
        },
        OpCode::CondJump => Instr::CondJump {
            jump_bytes_offset: read_i32(b, 1),
            conditional_slot: read_i16(b, 5),
        },
        OpCode::CondJumpEx => Instr::CondJumpEx {
            jump_bytes_offset: read_i32(b, 1),
            conditional_slot: read_i16(b, 5),
            flags: b[7],
        },
        OpCode::Jump => Instr::Jump {
            jump_bytes_offset: read_i32(b, 1),
        },
        OpCode::NewIterator => Instr::NewIterator {
            slot_iterator_to: read_i16(b, 1),
            slot_container_from: read_i16(b, 3),
        },
        OpCode::Iterate => Instr::Iterate {
            slot_value_to: read_i16(b, 1),
            slot_iterator_from: read_i16(b, 3),
            jump_on_end: read_i32(b, 5),
        },
        OpCode::PushRescueFrame => Instr::PushRescueFrame {
            mode: b[1],
            slot_error_to: read_i16(b, 2),
            jump_on_rescue: read_i32(b, 4),
            jump_on_finally: read_i32(b, 8),
        },
        OpCode::AddRescueTypeByRef => Instr::AddRescueTypeByRef {
            slot_from: read_i16(b, 1),
        },
        OpCode::AddRescueType => Instr::AddRescueType {
            class_id: read_i64(b, 1),
        },
        OpCode::PopRescueFrame => Instr::PopRescueFrame,
        OpCode::GetAttributeByName => Instr::GetAttributeByName {
            slot_to: read_i16(b, 1),
            obj_slot_from: read_i16(b, 3),
            name_idx: read_i64(b, 5),
        },
        OpCode::GetAttributeByIdx => Instr::GetAttributeByIdx {
            slot_to: read_i16(b, 1),
            obj_slot_from: read_i16(b, 3),
            attr_idx: read_i16(b, 5),
        },
        OpCode::JumpToFinally => Instr::JumpToFinally,
        OpCode::NewList => Instr::NewList {
            slot_to: read_i16(b, 1),
        },
        OpCode::NewSet => Instr::NewSet {
            slot_to: read_i16(b, 1),
        },
        OpCode::NewMap => Instr::NewMap {
            slot_to: read_i16(b, 1),
        },
        OpCode::NewVector => Instr::NewVector {
            slot_to: read_i16(b, 1),
        },
        OpCode::NewInstanceByRef => Instr::NewInstanceByRef {
            slot_to: read_i16(b, 1),
            class_slot_from: read_i16(b, 3),
        },
        OpCode::NewInstance => Instr::NewInstance {
            slot_to: read_i16(b, 1),
            class_id: read_i64(b, 3),
        },
        OpCode::GetConstructor => Instr::GetConstructor {
            slot_to: read_i16(b, 1),
            obj_slot_from: read_i16(b, 3),
        },
        OpCode::AwaitItem => Instr::AwaitItem {
            slot_to: read_i16(b, 1),
            slot_await_from: read_i16(b, 3),
        },
        OpCode::HasAttrJump => Instr::HasAttrJump {
            jump_bytes_offset: read_i32(b, 1),
            slot_from: read_i16(b, 5),
            name_idx: read_i64(b, 7),
        },
        OpCode::Raise => Instr::Raise {
            class_id: read_i64(b, 1),
            msg_slot_from: read_i16(b, 9),
        },
        OpCode::RaiseByRef => Instr::RaiseByRef {
            class_slot_from: read_i16(b, 1),
            msg_slot_from: read_i16(b, 3),
        },
    };
    Ok((instr, size))
}

fn push_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Append the encoded form of `instr` to `out`.
pub fn encode(instr: &Instr, out: &mut Vec<u8>) {
    match instr {
        Instr::Invalid => out.push(OpCode::Invalid as u8),
        Instr::SetConst { slot, value } => {
            out.push(OpCode::SetConst as u8);
            push_i16(out, *slot);
            let mut payload = [0u8; 16];
            let tag = match value {
                ConstOperand::None => ConstTag::None,
                ConstOperand::Bool(v) => {
                    payload[..8].copy_from_slice(&(*v as i64).to_le_bytes());
                    ConstTag::Bool
                }
                ConstOperand::Int(v) => {
                    payload[..8].copy_from_slice(&v.to_le_bytes());
                    ConstTag::Int
                }
                ConstOperand::Float(v) => {
                    payload[..8].copy_from_slice(&v.to_bits().to_le_bytes());
                    ConstTag::Float
                }
                ConstOperand::ShortStr(chars) => {
                    payload[0] = chars.len() as u8;
                    for (i, c) in chars.iter().take(3).enumerate() {
                        payload[4 + i * 4..8 + i * 4]
                            .copy_from_slice(&(*c as u32).to_le_bytes());
                    }
                    ConstTag::ShortStr
                }
                ConstOperand::ShortBytes(bytes) => {
                    payload[0] = bytes.len() as u8;
                    payload[4..4 + bytes.len().min(3)]
                        .copy_from_slice(&bytes[..bytes.len().min(3)]);
                    ConstTag::ShortBytes
                }
                ConstOperand::PreallocStr(idx) => {
                    payload[..8].copy_from_slice(&(*idx as i64).to_le_bytes());
                    ConstTag::PreallocStr
                }
                ConstOperand::PreallocBytes(idx) => {
                    payload[..8].copy_from_slice(&(*idx as i64).to_le_bytes());
                    ConstTag::PreallocBytes
                }
                ConstOperand::FuncRef(id) => {
                    payload[..8].copy_from_slice(&id.to_le_bytes());
                    ConstTag::FuncRef
                }
                ConstOperand::ClassRef(id) => {
                    payload[..8].copy_from_slice(&id.to_le_bytes());
                    ConstTag::ClassRef
                }
            };
            out.push(tag as u8);
            out.extend_from_slice(&payload);
        }
        Instr::SetGlobal { global_to, slot_from } => {
            out.push(OpCode::SetGlobal as u8);
            push_i64(out, *global_to);
            push_i16(out, *slot_from);
        }
        Instr::GetGlobal { slot_to, global_from } => {
            out.push(OpCode::GetGlobal as u8);
            push_i16(out, *slot_to);
            push_i64(out, *global_from);
        }
        Instr::SetByIndexExpr { slot_obj, slot_index, slot_value } => {
            out.push(OpCode::SetByIndexExpr as u8);
            push_i16(out, *slot_obj);
            push_i16(out, *slot_index);
            push_i16(out, *slot_value);
        }
        Instr::SetByAttributeName { slot_obj, name_idx, slot_value } => {
            out.push(OpCode::SetByAttributeName as u8);
            push_i16(out, *slot_obj);
            push_i64(out, *name_idx);
            push_i16(out, *slot_value);
        }
        Instr::SetByAttributeIdx { slot_obj, attr_idx, slot_value } => {
            out.push(OpCode::SetByAttributeIdx as u8);
            push_i16(out, *slot_obj);
            push_i16(out, *attr_idx);
            push_i16(out, *slot_value);
        }
        Instr::GetFunc { slot_to, func_from } => {
            out.push(OpCode::GetFunc as u8);
            push_i16(out, *slot_to);
            push_i64(out, *func_from);
        }
        Instr::GetClass { slot_to, class_from } => {
            out.push(OpCode::GetClass as u8);
            push_i16(out, *slot_to);
            push_i64(out, *class_from);
        }
        Instr::ValueCopy { slot_to, slot_from } => {
            out.push(OpCode::ValueCopy as u8);
            push_i16(out, *slot_to);
            push_i16(out, *slot_from);
        }
        Instr::BinOp { op, slot_to, arg1, arg2 } => {
            out.push(OpCode::BinOp as u8);
            out.push(*op as u8);
            push_i16(out, *slot_to);
            push_i16(out, *arg1);
            push_i16(out, *arg2);
        }
        Instr::UnOp { op, slot_to, arg } => {
            out.push(OpCode::UnOp as u8);
            out.push(*op as u8);
            push_i16(out, *slot_to);
            push_i16(out, *arg);
        }
        Instr::Call { return_to, slot_called_from, flags, posargs, kwargs } => {
            out.push(OpCode::Call as u8);
            push_i16(out, *return_to);
            push_i16(out, *slot_called_from);
            out.push(*flags);
            push_i16(out, *posargs);
            push_i16(out, *kwargs);
        }
        Instr::CallIgnoreIfNone { return_to, slot_called_from, flags, posargs, kwargs } => {
            out.push(OpCode::CallIgnoreIfNone as u8);
            push_i16(out, *return_to);
            push_i16(out, *slot_called_from);
            out.push(*flags);
            push_i16(out, *posargs);
            push_i16(out, *kwargs);
        }
        Instr::SetTop { top_to } => {
            out.push(OpCode::SetTop as u8);
            push_i16(out, *top_to);
        }
        Instr::CallSetTop { top_to } => {
            out.push(OpCode::CallSetTop as u8);
            push_i16(out, *top_to);
        }
        Instr::ReturnValue { return_slot_from } => {
            out.push(OpCode::ReturnValue as u8);
            push_i16(out, *return_slot_from);
        }
        Instr::JumpTarget { jump_id } => {
            out.push(OpCode::JumpTarget as u8);
            push_i32(out, *jump_id);
        }
        Instr::CondJump { jump_bytes_offset, conditional_slot } => {
            out.push(OpCode::CondJump as u8);
            push_i32(out, *jump_bytes_offset);
            push_i16(out, *conditional_slot);
        }
        Instr::CondJumpEx { jump_bytes_offset, conditional_slot, flags } => {
            out.push(OpCode::CondJumpEx as u8);
            push_i32(out, *jump_bytes_offset);
            push_i16(out, *conditional_slot);
            out.push(*flags);
        }
        Instr::Jump { jump_bytes_offset } => {
            out.push(OpCode::Jump as u8);
            push_i32(out, *jump_bytes_offset);
        }
        Instr::NewIterator { slot_iterator_to, slot_container_from } => {
            out.push(OpCode::NewIterator as u8);
            push_i16(out, *slot_iterator_to);
            push_i16(out, *slot_container_from);
        }
        Instr::Iterate { slot_value_to, slot_iterator_from, jump_on_end } => {
            out.push(OpCode::Iterate as u8);
            push_i16(out, *slot_value_to);
            push_i16(out, *slot_iterator_from);
            push_i32(out, *jump_on_end);
        }
        Instr::PushRescueFrame { mode, slot_error_to, jump_on_rescue, jump_on_finally } => {
            out.push(OpCode::PushRescueFrame as u8);
            out.push(*mode);
            push_i16(out, *slot_error_to);
            push_i32(out, *jump_on_rescue);
            push_i32(out, *jump_on_finally);
        }
        Instr::AddRescueTypeByRef { slot_from } => {
            out.push(OpCode::AddRescueTypeByRef as u8);
            push_i16(out, *slot_from);
        }
        Instr::AddRescueType { class_id } => {
            out.push(OpCode::AddRescueType as u8);
            push_i64(out, *class_id);
        }
        Instr::PopRescueFrame => out.push(OpCode::PopRescueFrame as u8),
        Instr::GetAttributeByName { slot_to, obj_slot_from, name_idx } => {
            out.push(OpCode::GetAttributeByName as u8);
            push_i16(out, *slot_to);
            push_i16(out, *obj_slot_from);
            push_i64(out, *name_idx);
        }
        Instr::GetAttributeByIdx { slot_to, obj_slot_from, attr_idx } => {
            out.push(OpCode::GetAttributeByIdx as u8);
            push_i16(out, *slot_to);
            push_i16(out, *obj_slot_from);
            push_i16(out, *attr_idx);
        }
        Instr::JumpToFinally => out.push(OpCode::JumpToFinally as u8),
        Instr::NewList { slot_to } => {
            out.push(OpCode::NewList as u8);
            push_i16(out, *slot_to);
        }
        Instr::NewSet { slot_to } => {
            out.push(OpCode::NewSet as u8);
            push_i16(out, *slot_to);
        }
        Instr::NewMap { slot_to } => {
            out.push(OpCode::NewMap as u8);
            push_i16(out, *slot_to);
        }
        Instr::NewVector { slot_to } => {
            out.push(OpCode::NewVector as u8);
            push_i16(out, *slot_to);
        }
        Instr::NewInstanceByRef { slot_to, class_slot_from } => {
            out.push(OpCode::NewInstanceByRef as u8);
            push_i16(out, *slot_to);
            push_i16(out, *class_slot_from);
        }
        Instr::NewInstance { slot_to, class_id } => {
            out.push(OpCode::NewInstance as u8);
            push_i16(out, *slot_to);
            push_i64(out, *class_id);
        }
        Instr::GetConstructor { slot_to, obj_slot_from } => {
            out.push(OpCode::GetConstructor as u8);
            push_i16(out, *slot_to);
            push_i16(out, *obj_slot_from);
        }
        Instr::AwaitItem { slot_to, slot_await_from } => {
            out.push(OpCode::AwaitItem as u8);
            push_i16(out, *slot_to);
            push_i16(out, *slot_await_from);
        }
        Instr::HasAttrJump { jump_bytes_offset, slot_from, name_idx } => {
            out.push(OpCode::HasAttrJump as u8);
            push_i32(out, *jump_bytes_offset);
            push_i16(out, *slot_from);
            push_i64(out, *name_idx);
        }
        Instr::Raise { class_id, msg_slot_from } => {
            out.push(OpCode::Raise as u8);
            push_i64(out, *class_id);
            push_i16(out, *msg_slot_from);
        }
        Instr::RaiseByRef { class_slot_from, msg_slot_from } => {
            out.push(OpCode::RaiseByRef as u8);
            push_i16(out, *class_slot_from);
            push_i16(out, *msg_slot_from);
        }
    }
}

/// Render one decoded instruction for the disassembler.
pub fn format_instr(instr: &Instr) -> String {
    match instr {
        Instr::BinOp { op, slot_to, arg1, arg2 } => {
            format!("binop {} s{} <- s{}, s{}", op.name(), slot_to, arg1, arg2)
        }
        Instr::UnOp { op, slot_to, arg } => {
            format!("unop {} s{} <- s{}", op.name(), slot_to, arg)
        }
        other => {
            let dbg = format!("{:?}", other);
            dbg.to_lowercase()
        }
    }
}

/// Builds instruction buffers plus the matching constant pool. Used by
/// tests and tooling; the compiler front-end emits the same layout.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8>,
    consts: Vec<crate::program::FuncConst>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::default()
    }

    pub fn instr(&mut self, instr: Instr) -> &mut Self {
        encode(&instr, &mut self.buf);
        self
    }

    /// Current byte offset, for computing jump targets.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// SETCONST of a string, inlining when it fits.
    pub fn set_const_str(&mut self, slot: i16, s: &str) -> &mut Self {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() <= crate::value::SHORTSTR_MAX {
            return self.instr(Instr::SetConst {
                slot,
                value: ConstOperand::ShortStr(chars),
            });
        }
        let idx = self.consts.len() as u32;
        self.consts.push(crate::program::FuncConst::Str(chars));
        self.instr(Instr::SetConst {
            slot,
            value: ConstOperand::PreallocStr(idx),
        })
    }

    pub fn set_const_bytes(&mut self, slot: i16, b: &[u8]) -> &mut Self {
        if b.len() <= crate::value::SHORTBYTES_MAX {
            return self.instr(Instr::SetConst {
                slot,
                value: ConstOperand::ShortBytes(b.to_vec()),
            });
        }
        let idx = self.consts.len() as u32;
        self.consts.push(crate::program::FuncConst::Bytes(b.to_vec()));
        self.instr(Instr::SetConst {
            slot,
            value: ConstOperand::PreallocBytes(idx),
        })
    }

    /// Rewrite a relative-jump field after its target offset is known.
    /// `field_offset` is the byte position of the i32 inside the
    /// instruction (1 for jumps, 5 for ITERATE, 4/8 for rescue frames).
    pub fn patch_rel32(&mut self, instr_offset: usize, field_offset: usize, target: usize) {
        let rel = target as i64 - instr_offset as i64;
        let pos = instr_offset + field_offset;
        self.buf[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    pub fn finish(self) -> (Vec<u8>, Vec<crate::program::FuncConst>) {
        (self.buf, self.consts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_opcode_round_trips() {
        let samples = vec![
            Instr::Invalid,
            Instr::SetConst { slot: 1, value: ConstOperand::Int(-7) },
            Instr::SetConst { slot: 2, value: ConstOperand::Float(1.5) },
            Instr::SetConst { slot: 3, value: ConstOperand::Bool(true) },
            Instr::SetConst { slot: 4, value: ConstOperand::None },
            Instr::SetConst { slot: 5, value: ConstOperand::ShortStr(vec!['h', 'i']) },
            Instr::SetConst { slot: 6, value: ConstOperand::ShortBytes(vec![1, 2]) },
            Instr::SetConst { slot: 7, value: ConstOperand::PreallocStr(3) },
            Instr::SetConst { slot: 8, value: ConstOperand::PreallocBytes(4) },
            Instr::SetConst { slot: 9, value: ConstOperand::FuncRef(12) },
            Instr::SetConst { slot: 10, value: ConstOperand::ClassRef(5) },
            Instr::SetGlobal { global_to: 3, slot_from: 1 },
            Instr::GetGlobal { slot_to: 1, global_from: 3 },
            Instr::SetByIndexExpr { slot_obj: 0, slot_index: 1, slot_value: 2 },
            Instr::SetByAttributeName { slot_obj: 0, name_idx: 44, slot_value: 2 },
            Instr::SetByAttributeIdx { slot_obj: 0, attr_idx: 1, slot_value: 2 },
            Instr::GetFunc { slot_to: 0, func_from: 9 },
            Instr::GetClass { slot_to: 0, class_from: 9 },
            Instr::ValueCopy { slot_to: 1, slot_from: 0 },
            Instr::BinOp { op: BinOpKind::Add, slot_to: 2, arg1: 0, arg2: 1 },
            Instr::UnOp { op: UnOpKind::Negate, slot_to: 1, arg: 0 },
            Instr::Call { return_to: 0, slot_called_from: 1, flags: 0x3, posargs: 2, kwargs: 1 },
            Instr::CallIgnoreIfNone { return_to: 0, slot_called_from: 1, flags: 0, posargs: 0, kwargs: 0 },
            Instr::SetTop { top_to: 5 },
            Instr::CallSetTop { top_to: 4 },
            Instr::ReturnValue { return_slot_from: 0 },
            Instr::JumpTarget { jump_id: 77 },
            Instr::CondJump { jump_bytes_offset: -12, conditional_slot: 2 },
            Instr::CondJumpEx { jump_bytes_offset: 24, conditional_slot: 2, flags: 1 },
            Instr::Jump { jump_bytes_offset: 9 },
            Instr::NewIterator { slot_iterator_to: 1, slot_container_from: 0 },
            Instr::Iterate { slot_value_to: 2, slot_iterator_from: 1, jump_on_end: 30 },
            Instr::PushRescueFrame { mode: 3, slot_error_to: 1, jump_on_rescue: 10, jump_on_finally: 20 },
            Instr::AddRescueTypeByRef { slot_from: 0 },
            Instr::AddRescueType { class_id: 2 },
            Instr::PopRescueFrame,
            Instr::GetAttributeByName { slot_to: 1, obj_slot_from: 0, name_idx: 8 },
            Instr::GetAttributeByIdx { slot_to: 1, obj_slot_from: 0, attr_idx: 2 },
            Instr::JumpToFinally,
            Instr::NewList { slot_to: 0 },
            Instr::NewSet { slot_to: 0 },
            Instr::NewMap { slot_to: 0 },
            Instr::NewVector { slot_to: 0 },
            Instr::NewInstanceByRef { slot_to: 1, class_slot_from: 0 },
            Instr::NewInstance { slot_to: 0, class_id: 11 },
            Instr::GetConstructor { slot_to: 1, obj_slot_from: 0 },
            Instr::AwaitItem { slot_to: 1, slot_await_from: 0 },
            Instr::HasAttrJump { jump_bytes_offset: 15, slot_from: 0, name_idx: 2 },
            Instr::Raise { class_id: 1, msg_slot_from: 0 },
            Instr::RaiseByRef { class_slot_from: 0, msg_slot_from: 1 },
        ];
        for sample in samples {
            let mut buf = Vec::new();
            encode(&sample, &mut buf);
            let tag = buf[0];
            let op = OpCode::from_byte(tag).unwrap();
            assert_eq!(buf.len(), op.size(), "size mismatch for {:?}", op);
            let (decoded, size) = decode_at(&buf, 0).unwrap();
            assert_eq!(size, buf.len());
            assert_eq!(decoded, sample);
        }
    }

    #[test]
    fn test_decode_rejects_truncated_buffer() {
        let mut buf = Vec::new();
        encode(&Instr::Jump { jump_bytes_offset: 4 }, &mut buf);
        buf.truncate(3);
        assert!(decode_at(&buf, 0).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        assert!(decode_at(&[200u8, 0, 0, 0], 0).is_err());
    }

    #[test]
    fn test_assembler_spills_long_strings_to_pool() {
        let mut asm = Assembler::new();
        asm.set_const_str(0, "ok");
        asm.set_const_str(1, "a longer constant");
        let (buf, consts) = asm.finish();
        assert_eq!(consts.len(), 1);
        let (first, size) = decode_at(&buf, 0).unwrap();
        assert!(matches!(
            first,
            Instr::SetConst { value: ConstOperand::ShortStr(_), .. }
        ));
        let (second, _) = decode_at(&buf, size).unwrap();
        assert_eq!(
            second,
            Instr::SetConst { slot: 1, value: ConstOperand::PreallocStr(0) }
        );
    }

    #[test]
    fn test_binop_tags_are_stable() {
        assert_eq!(BinOpKind::Divide as u8, 1);
        assert_eq!(BinOpKind::IndexByExpr as u8, 22);
        assert_eq!(UnOpKind::Negate as u8, 4);
        assert_eq!(UnOpKind::BoolNot as u8, 21);
        for b in 0..=23u8 {
            let bin = BinOpKind::from_byte(b);
            let un = UnOpKind::from_byte(b);
            assert!(
                !(bin.is_some() && un.is_some()),
                "tag {} decodes as both binary and unary",
                b
            );
        }
    }
}
