//! The interpreter
//!
//! One handler per opcode inside a dispatch loop over the current
//! function's byte buffer. Between handlers the instruction pointer is a
//! byte offset into that buffer; handlers advance it by the decoded size
//! or set it for jumps.
//!
//! A `run` invocation is resumable: it returns `Suspended` when a native
//! requests it or an AWAITITEM is hit, and the scheduler calls `run` again
//! once the condition is satisfied. Native resume re-invokes the same
//! handler with the same frame and async-progress record still attached.

use crate::bytecode::{
    decode_at, BinOpKind, ConstOperand, Instr, UnOpKind, CALLFLAG_ASYNC, CALLFLAG_ASYNCPARALLEL,
    CALLFLAG_UNPACKLASTPOSARG, CONDJUMPEX_JUMP_ON_TRUE, CONDJUMPEX_TRUTH_TEST,
    RESCUEMODE_JUMPONFINALLY, RESCUEMODE_JUMPONRESCUE,
};
use crate::frame::{FuncFrame, RescueFrame};
use crate::heap::{CFuncProgress, GcKind, Heaps, IterState, IterTarget, OomError};
use crate::hstring::{HBytes, HString};
use crate::list::{VecEntry, VmList, VmVector};
use crate::map::{MapSetOutcome, VmMap, VmSet};
use crate::program::{
    ConstValue, FuncConst, FuncDef, FuncKind, Program, CLASS_ARGUMENTERROR,
    CLASS_CONTAINERCHANGEDERROR, CLASS_INDEXERROR, CLASS_INVALIDNOASYNCRESOURCEERROR,
    CLASS_MATHERROR, CLASS_OVERFLOWERROR, CLASS_TYPEERROR, CLASS_VALUEERROR, METHOD_OFFSET,
};
use crate::scheduler::SuspendType;
use crate::stack::Stack;
use crate::transfer::PortableValue;
use crate::value::{
    bytes_content, is_hashable_key, str_chars, value_hash, value_to_display, values_equal, ClassId,
    ErrorInfo, FuncId, GcRef, NameId, Value, MAX_ERROR_STACK_FRAMES,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

/// Result of one `run` invocation.
#[derive(Debug)]
pub enum RunOutcome {
    /// The thread's root call chain completed; the value carries one
    /// external reference the scheduler must release.
    Done(Value),
    Suspended(SuspendType, i64),
    Uncaught(Box<ErrorInfo>),
}

/// Resume info of a native call that returned a suspension.
#[derive(Debug)]
pub struct SuspendedNative {
    pub func_id: FuncId,
    pub frame_floor: i64,
    pub restore_stack_size: i64,
    /// Absolute caller slot, -1 to discard.
    pub return_slot: i64,
    pub bound_self_slot: Option<i64>,
    pub progress: Option<u32>,
}

/// Request to the scheduler to start a new thread, queued during `run`.
#[derive(Debug)]
pub struct SpawnRequest {
    pub thread_id: i64,
    pub func_id: FuncId,
    pub args: Vec<PortableValue>,
    pub parallel: bool,
}

/// One resumable interpreter thread.
#[derive(Debug)]
pub struct Vmthread {
    pub id: i64,
    pub stack: Stack,
    pub func_frames: Vec<FuncFrame>,
    pub rescue_frames: Vec<RescueFrame>,
    pub func_id: FuncId,
    pub offset: u32,
    /// False for threads running on parallel workers.
    pub on_main_worker: bool,
    /// Root functions still to run, in order; the last one's return value
    /// becomes the thread result.
    pub start_queue: VecDeque<(FuncId, Vec<PortableValue>)>,
    pub suspended_native: Option<SuspendedNative>,
    /// Set while suspended on AWAITITEM: absolute slot receiving the
    /// awaited value.
    pub await_slot: Option<i64>,
    /// Value delivered by the scheduler for a satisfied await.
    pub await_delivery: Option<PortableValue>,
    call_settop: Option<i64>,
    /// Per-thread cache of materialized function constants; each entry
    /// holds one external reference until teardown.
    intern: HashMap<(FuncId, u32), GcRef>,
}

impl Vmthread {
    pub fn new(id: i64, on_main_worker: bool) -> Self {
        Vmthread {
            id,
            stack: Stack::new(),
            func_frames: Vec::new(),
            rescue_frames: Vec::new(),
            func_id: -1,
            offset: 0,
            on_main_worker,
            start_queue: VecDeque::new(),
            suspended_native: None,
            await_slot: None,
            await_delivery: None,
            call_settop: None,
            intern: HashMap::new(),
        }
    }

    /// Release everything this thread holds in `heaps`. A still-suspended
    /// native call gets its abort hook first. Only this thread's own
    /// progress record is touched: non-parallel threads share the main
    /// pool set with their collaborators.
    pub fn teardown(&mut self, heaps: &mut Heaps) {
        if let Some(info) = self.suspended_native.take() {
            if let Some(idx) = info.progress {
                if let Some(record) = heaps.progress.get_mut(idx) {
                    record.abort();
                }
                heaps.progress.free(idx);
            }
        }
        self.stack.clear(heaps);
        for (_, r) in self.intern.drain() {
            heaps.gc.release_external(r);
        }
        self.func_frames.clear();
        self.rescue_frames.clear();
    }
}

/// One global variable at runtime. Gc values live in the main heap.
#[derive(Debug)]
pub struct GlobalSlot {
    pub value: Value,
    pub is_simple_constant: bool,
    pub is_const: bool,
}

#[derive(Debug, Default)]
pub struct Globals {
    pub slots: Vec<GlobalSlot>,
}

impl Globals {
    /// Materialize the program's global table into the main heap.
    pub fn from_program(program: &Program, heaps: &mut Heaps) -> Result<Globals, OomError> {
        let mut slots = Vec::new();
        slots.try_reserve(program.globals.len()).map_err(|_| OomError)?;
        for g in &program.globals {
            let value = const_to_value(&g.init, heaps)?;
            slots.push(GlobalSlot {
                value,
                is_simple_constant: g.is_simple_constant,
                is_const: g.is_const,
            });
        }
        Ok(Globals { slots })
    }

    /// Snapshot of the simple-constant slots for parallel readers.
    pub fn simple_snapshot(&self, program: &Program) -> Vec<Option<ConstValue>> {
        program
            .globals
            .iter()
            .map(|g| {
                if g.is_simple_constant {
                    Some(g.init.clone())
                } else {
                    None
                }
            })
            .collect()
    }
}

fn const_to_value(c: &ConstValue, heaps: &mut Heaps) -> Result<Value, OomError> {
    Ok(match c {
        ConstValue::None => Value::None,
        ConstValue::Bool(b) => Value::Bool(*b),
        ConstValue::Int(i) => Value::Int(*i),
        ConstValue::Float(f) => Value::Float(*f),
        ConstValue::Str(chars) => {
            if chars.len() <= crate::value::SHORTSTR_MAX {
                let mut inline = ['\0'; crate::value::SHORTSTR_MAX];
                inline[..chars.len()].copy_from_slice(chars);
                Value::ShortStr {
                    len: chars.len() as u8,
                    chars: inline,
                }
            } else {
                let r = heaps.gc.alloc(GcKind::Str(HString::from_chars(chars.clone())))?;
                heaps.gc.retain_external(r);
                Value::Gc(r)
            }
        }
        ConstValue::Bytes(bytes) => {
            if let Some(short) = Value::try_short_bytes(bytes) {
                short
            } else {
                let r = heaps
                    .gc
                    .alloc(GcKind::Bytes(HBytes::from_vec(bytes.clone())))?;
                heaps.gc.retain_external(r);
                Value::Gc(r)
            }
        }
    })
}

/// View of the globals granted to a run: the main worker mutates the real
/// table, parallel workers see a read-only snapshot of simple constants.
pub enum GlobalsAccess<'a> {
    Main(&'a mut Globals),
    Parallel(&'a [Option<ConstValue>]),
}

/// Everything one `run` invocation needs besides the thread itself.
pub struct RunEnv<'a> {
    pub program: &'a Program,
    pub heaps: &'a mut Heaps,
    pub globals: GlobalsAccess<'a>,
    pub spawns: &'a mut Vec<SpawnRequest>,
    pub next_thread_id: &'a AtomicI64,
    pub trace: bool,
}

/// Outcome of a native function handler.
pub enum NativeOutcome {
    Return(Value),
    Error(Box<ErrorInfo>),
    Suspend(SuspendType, i64),
}

/// Context a native function executes against: its argument slots, the
/// owning thread's heaps, and the call's async-progress record.
pub struct NativeCtx<'a> {
    pub heaps: &'a mut Heaps,
    pub program: &'a Program,
    pub thread_id: i64,
    stack: &'a mut Stack,
    frame_floor: i64,
    arg_count: usize,
    bound_self_slot: Option<i64>,
    progress_idx: Option<u32>,
    new_progress: Option<Box<dyn CFuncProgress>>,
}

impl<'a> NativeCtx<'a> {
    pub fn arg(&self, i: usize) -> &Value {
        debug_assert!(i < self.arg_count);
        self.stack.get(self.frame_floor + i as i64)
    }

    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    pub fn bound_self(&self) -> Option<&Value> {
        self.bound_self_slot.map(|s| self.stack.get(s))
    }

    /// Retained copy of an argument, for natives that store it.
    pub fn arg_retained(&mut self, i: usize) -> Value {
        let v = self.stack.get(self.frame_floor + i as i64).clone();
        self.heaps.retain_value(&v);
        v
    }

    /// Allocate a string result carrying one external reference.
    pub fn make_str(&mut self, s: &str) -> Result<Value, OomError> {
        if let Some(short) = Value::try_short_str(s) {
            return Ok(short);
        }
        let r = self.heaps.gc.alloc(GcKind::Str(HString::from_str(s)))?;
        self.heaps.gc.retain_external(r);
        Ok(Value::Gc(r))
    }

    pub fn make_bytes(&mut self, b: &[u8]) -> Result<Value, OomError> {
        if let Some(short) = Value::try_short_bytes(b) {
            return Ok(short);
        }
        let r = self
            .heaps
            .gc
            .alloc(GcKind::Bytes(HBytes::from_vec(b.to_vec())))?;
        self.heaps.gc.retain_external(r);
        Ok(Value::Gc(r))
    }

    /// The call's progress record, if a previous invocation created one.
    pub fn progress_mut<T: CFuncProgress>(&mut self) -> Option<&mut T> {
        let idx = self.progress_idx?;
        self.heaps
            .progress
            .get_mut(idx)?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    pub fn has_progress(&self) -> bool {
        self.progress_idx.is_some()
    }

    /// Attach a fresh progress record; kept across suspensions until the
    /// call finishes with a non-suspend outcome.
    pub fn start_progress(&mut self, record: Box<dyn CFuncProgress>) {
        self.new_progress = Some(record);
    }
}

enum Flow {
    Continue,
    Outcome(RunOutcome),
}

fn err_box(class_id: ClassId, msg: &str) -> Box<ErrorInfo> {
    Box::new(ErrorInfo::new(class_id, msg))
}

fn oom_box() -> Box<ErrorInfo> {
    Box::new(ErrorInfo::out_of_memory())
}

/// Execute `thread` until it completes, suspends or dies on an uncaught
/// error.
pub fn run(thread: &mut Vmthread, env: &mut RunEnv<'_>) -> RunOutcome {
    // Deliver a satisfied await before dispatching.
    if let Some(portable) = thread.await_delivery.take() {
        let slot = thread.await_slot.take().unwrap_or(-1);
        match portable.into_value(env.heaps) {
            Ok(v) => {
                if slot >= 0 {
                    thread.stack.write(slot, v, env.heaps);
                } else {
                    env.heaps.release_value(&v);
                }
            }
            Err(_) => {
                let e = err_box(CLASS_TYPEERROR, "awaited value cannot cross heaps");
                match raise_error(thread, env, e) {
                    Flow::Continue => {}
                    Flow::Outcome(o) => return o,
                }
            }
        }
    }

    // Re-enter a suspended native call.
    if thread.suspended_native.is_some() {
        match resume_native(thread, env) {
            Flow::Continue => {}
            Flow::Outcome(o) => return o,
        }
    }

    loop {
        // Bootstrap the next queued root call when no frame is active.
        if thread.func_frames.is_empty() {
            match thread.start_queue.pop_front() {
                Some((func_id, args)) => match setup_root_call(thread, env, func_id, args) {
                    Flow::Continue => {}
                    Flow::Outcome(o) => return o,
                },
                None => {
                    // A fully unwound thread with nothing queued has no
                    // result to produce.
                    return RunOutcome::Done(Value::None);
                }
            }
            if thread.func_frames.is_empty() {
                // Root was a native that finished synchronously; its value
                // handling happened inside setup_root_call.
                continue;
            }
        }

        let flow = step(thread, env);
        match flow {
            Flow::Continue => {}
            Flow::Outcome(o) => return o,
        }
    }
}

/// Decode and execute one instruction.
fn step(thread: &mut Vmthread, env: &mut RunEnv<'_>) -> Flow {
    let func = match env.program.func(thread.func_id) {
        Some(f) => f,
        None => fatal("instruction pointer in unknown function"),
    };
    let (instructions, _consts) = match &func.kind {
        FuncKind::Bytecode { instructions, consts } => (instructions, consts),
        FuncKind::Native { .. } => fatal("instruction pointer inside native function"),
    };
    let (instr, size) = match decode_at(instructions, thread.offset as usize) {
        Ok(r) => r,
        Err(_) => fatal("corrupt instruction stream"),
    };
    if env.trace {
        eprintln!(
            "[vmexec t{}] f{} @{} {:6} stack={}",
            thread.id,
            thread.func_id,
            thread.offset,
            crate::bytecode::format_instr(&instr),
            thread.stack.entry_count()
        );
    }
    let next_offset = thread.offset + size as u32;

    match instr {
        Instr::Invalid | Instr::JumpTarget { .. } => {
            fatal("runtime encountered a compile-time-only instruction")
        }
        Instr::SetConst { slot, value } => {
            let abs = thread.stack.abs_slot(slot);
            let v = match materialize_const(thread, env, &value) {
                Ok(v) => v,
                Err(e) => return raise_error(thread, env, e),
            };
            thread.stack.write(abs, v, env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::SetGlobal { global_to, slot_from } => {
            let abs = thread.stack.abs_slot(slot_from);
            match &mut env.globals {
                GlobalsAccess::Main(globals) => {
                    let slot = match globals.slots.get_mut(global_to as usize) {
                        Some(s) => s,
                        None => fatal("global index out of range"),
                    };
                    let v = thread.stack.get(abs).clone();
                    if let Value::Gc(r) = &v {
                        env.heaps.gc.retain_external(*r);
                    }
                    let old = std::mem::replace(&mut slot.value, v);
                    env.heaps.release_value(&old);
                    thread.offset = next_offset;
                    Flow::Continue
                }
                GlobalsAccess::Parallel(_) => raise_error(
                    thread,
                    env,
                    err_box(
                        CLASS_INVALIDNOASYNCRESOURCEERROR,
                        "globals cannot be written off the main thread",
                    ),
                ),
            }
        }
        Instr::GetGlobal { slot_to, global_from } => {
            let abs = thread.stack.abs_slot(slot_to);
            match &env.globals {
                GlobalsAccess::Main(globals) => {
                    let v = match globals.slots.get(global_from as usize) {
                        Some(s) => s.value.clone(),
                        None => fatal("global index out of range"),
                    };
                    env.heaps.retain_value(&v);
                    thread.stack.write(abs, v, env.heaps);
                    thread.offset = next_offset;
                    Flow::Continue
                }
                GlobalsAccess::Parallel(snapshot) => {
                    match snapshot.get(global_from as usize) {
                        Some(Some(c)) => {
                            let v = match const_to_value(c, env.heaps) {
                                Ok(v) => v,
                                Err(_) => return raise_error(thread, env, oom_box()),
                            };
                            thread.stack.write(abs, v, env.heaps);
                            thread.offset = next_offset;
                            Flow::Continue
                        }
                        _ => raise_error(
                            thread,
                            env,
                            err_box(
                                CLASS_INVALIDNOASYNCRESOURCEERROR,
                                "only simple-constant globals are readable off the main thread",
                            ),
                        ),
                    }
                }
            }
        }
        Instr::GetFunc { slot_to, func_from } => {
            let abs = thread.stack.abs_slot(slot_to);
            thread.stack.write(abs, Value::FuncRef(func_from), env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::GetClass { slot_to, class_from } => {
            let abs = thread.stack.abs_slot(slot_to);
            thread
                .stack
                .write(abs, Value::ClassRef(class_from), env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::ValueCopy { slot_to, slot_from } => {
            let from = thread.stack.abs_slot(slot_from);
            let to = thread.stack.abs_slot(slot_to);
            thread.stack.copy_slot(from, to, env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::BinOp { op, slot_to, arg1, arg2 } => {
            exec_binop(thread, env, op, slot_to, arg1, arg2, next_offset)
        }
        Instr::UnOp { op, slot_to, arg } => {
            let abs_arg = thread.stack.abs_slot(arg);
            let abs_to = thread.stack.abs_slot(slot_to);
            let v = thread.stack.get(abs_arg);
            let result = match (op, v) {
                (UnOpKind::Negate, Value::Int(i)) => match i.checked_neg() {
                    Some(n) => Ok(Value::Int(n)),
                    None => Err(err_box(CLASS_OVERFLOWERROR, "integer negation overflows")),
                },
                (UnOpKind::Negate, Value::Float(f)) => Ok(Value::Float(-f)),
                (UnOpKind::BitNot, Value::Int(i)) => Ok(Value::Int(!i)),
                (UnOpKind::BoolNot, Value::Bool(b)) => Ok(Value::Bool(!b)),
                _ => Err(err_box(
                    CLASS_TYPEERROR,
                    "operand type does not support this operator",
                )),
            };
            match result {
                Ok(v) => {
                    thread.stack.write(abs_to, v, env.heaps);
                    thread.offset = next_offset;
                    Flow::Continue
                }
                Err(e) => raise_error(thread, env, e),
            }
        }
        Instr::Call { return_to, slot_called_from, flags, posargs, kwargs } => exec_call(
            thread,
            env,
            return_to,
            slot_called_from,
            flags,
            posargs,
            kwargs,
            false,
            next_offset,
        ),
        Instr::CallIgnoreIfNone { return_to, slot_called_from, flags, posargs, kwargs } => {
            exec_call(
                thread,
                env,
                return_to,
                slot_called_from,
                flags,
                posargs,
                kwargs,
                true,
                next_offset,
            )
        }
        Instr::SetTop { top_to } => {
            let target = thread.stack.current_func_floor + top_to as i64;
            if thread.stack.to_size(target, env.heaps, false).is_err() {
                return raise_error(thread, env, oom_box());
            }
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::CallSetTop { top_to } => {
            thread.call_settop = Some(thread.stack.current_func_floor + top_to as i64);
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::ReturnValue { return_slot_from } => {
            let abs = thread.stack.abs_slot(return_slot_from);
            let value = thread.stack.take(abs);
            return_from_call(thread, env, value)
        }
        Instr::CondJump { jump_bytes_offset, conditional_slot } => {
            let abs = thread.stack.abs_slot(conditional_slot);
            let cond = thread.stack.get(abs).clone();
            let falsy = match cond {
                Value::Bool(b) => !b,
                Value::None => true,
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "condition must be a bool"),
                    )
                }
            };
            if falsy {
                thread.offset = (thread.offset as i64 + jump_bytes_offset as i64) as u32;
            } else {
                thread.offset = next_offset;
            }
            Flow::Continue
        }
        Instr::CondJumpEx { jump_bytes_offset, conditional_slot, flags } => {
            let abs = thread.stack.abs_slot(conditional_slot);
            let v = thread.stack.get(abs).clone();
            let truth = if flags & CONDJUMPEX_TRUTH_TEST != 0 {
                match v.truthy(&env.heaps.gc) {
                    Some(t) => t,
                    None => {
                        return raise_error(
                            thread,
                            env,
                            err_box(CLASS_TYPEERROR, "value has no truth interpretation"),
                        )
                    }
                }
            } else {
                match v {
                    Value::Bool(b) => b,
                    Value::None => false,
                    _ => {
                        return raise_error(
                            thread,
                            env,
                            err_box(CLASS_TYPEERROR, "condition must be a bool"),
                        )
                    }
                }
            };
            let jump_on_true = flags & CONDJUMPEX_JUMP_ON_TRUE != 0;
            if truth == jump_on_true {
                thread.offset = (thread.offset as i64 + jump_bytes_offset as i64) as u32;
            } else {
                thread.offset = next_offset;
            }
            Flow::Continue
        }
        Instr::Jump { jump_bytes_offset } => {
            thread.offset = (thread.offset as i64 + jump_bytes_offset as i64) as u32;
            Flow::Continue
        }
        Instr::NewIterator { slot_iterator_to, slot_container_from } => {
            let abs_from = thread.stack.abs_slot(slot_container_from);
            let abs_to = thread.stack.abs_slot(slot_iterator_to);
            let target = match thread.stack.get(abs_from) {
                Value::Gc(r) => {
                    let obj = env.heaps.gc.get(*r);
                    match &obj.kind {
                        GcKind::List(l) => Some((
                            IterTarget::Container {
                                gcref: *r,
                                revision: l.revision(),
                            },
                            l.count() as u64,
                        )),
                        GcKind::Map(m) => Some((
                            IterTarget::Container {
                                gcref: *r,
                                revision: m.revision(),
                            },
                            m.count() as u64,
                        )),
                        GcKind::Set(s) => Some((
                            IterTarget::Container {
                                gcref: *r,
                                revision: s.revision(),
                            },
                            s.count() as u64,
                        )),
                        GcKind::Vector(v) => Some((
                            IterTarget::Vector(v.entries().to_vec()),
                            v.len() as u64,
                        )),
                        _ => None,
                    }
                }
                _ => None,
            };
            let (target, len) = match target {
                Some(t) => t,
                None => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "value is not iterable"),
                    )
                }
            };
            if let IterTarget::Container { gcref, .. } = &target {
                env.heaps.gc.retain_external(*gcref);
            }
            let iter_ref = match env.heaps.iters.alloc(IterState { target, idx: 0, len }) {
                Ok(r) => r,
                Err(_) => return raise_error(thread, env, oom_box()),
            };
            thread
                .stack
                .write(abs_to, Value::Iterator(iter_ref), env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::Iterate { slot_value_to, slot_iterator_from, jump_on_end } => {
            let abs_iter = thread.stack.abs_slot(slot_iterator_from);
            let abs_to = thread.stack.abs_slot(slot_value_to);
            let iter_value = thread.stack.get(abs_iter).clone();
            let iter_ref = match iter_value {
                Value::Iterator(r) => r,
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "value is not an iterator"),
                    )
                }
            };
            let state = env.heaps.iters.get_mut(iter_ref);
            state.idx += 1;
            if state.idx > state.len {
                // Exhausted: reclaim the iterator and drop its container
                // pin, then take the exit jump.
                let state = env.heaps.iters.free(iter_ref);
                if let IterTarget::Container { gcref, .. } = state.target {
                    env.heaps.gc.release_external(gcref);
                }
                thread.stack.write(abs_iter, Value::None, env.heaps);
                thread.offset = (thread.offset as i64 + jump_on_end as i64) as u32;
                return Flow::Continue;
            }
            let idx = state.idx;
            let element = match &state.target {
                IterTarget::Vector(entries) => Ok(entries[(idx - 1) as usize].to_value()),
                IterTarget::Container { gcref, revision } => {
                    let gcref = *gcref;
                    let revision = *revision;
                    let obj = env.heaps.gc.get(gcref);
                    match &obj.kind {
                        GcKind::List(l) => {
                            if l.revision() != revision {
                                Err(())
                            } else {
                                Ok(l.get(idx as i64).cloned().unwrap_or(Value::None))
                            }
                        }
                        GcKind::Map(m) => {
                            if m.revision() != revision {
                                Err(())
                            } else {
                                Ok(m.key_by_idx(idx as i64 - 1).cloned().unwrap_or(Value::None))
                            }
                        }
                        GcKind::Set(s) => {
                            if s.revision() != revision {
                                Err(())
                            } else {
                                Ok(s.iter()
                                    .nth(idx as usize - 1)
                                    .cloned()
                                    .unwrap_or(Value::None))
                            }
                        }
                        _ => fatal("iterator pins a non-container value"),
                    }
                }
            };
            match element {
                Ok(v) => {
                    env.heaps.retain_value(&v);
                    thread.stack.write(abs_to, v, env.heaps);
                    thread.offset = next_offset;
                    Flow::Continue
                }
                Err(()) => raise_error(
                    thread,
                    env,
                    err_box(
                        CLASS_CONTAINERCHANGEDERROR,
                        "container changed during iteration",
                    ),
                ),
            }
        }
        Instr::PushRescueFrame { mode, slot_error_to, jump_on_rescue, jump_on_finally } => {
            let catch_offset = if mode & RESCUEMODE_JUMPONRESCUE != 0 {
                jump_on_rescue
            } else {
                -1
            };
            let finally_offset = if mode & RESCUEMODE_JUMPONFINALLY != 0 {
                jump_on_finally
            } else {
                -1
            };
            thread.rescue_frames.push(RescueFrame::new(
                catch_offset,
                finally_offset,
                slot_error_to,
                thread.func_frames.len() - 1,
            ));
            thread.offset = next_offset;
            Flow::Continue
        }
        Instr::AddRescueTypeByRef { slot_from } => {
            let abs = thread.stack.abs_slot(slot_from);
            let v = thread.stack.get(abs).clone();
            let class_id = match v {
                Value::ClassRef(id) => id,
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "rescue type must be a type reference"),
                    )
                }
            };
            add_rescue_type(thread, env, class_id, next_offset)
        }
        Instr::AddRescueType { class_id } => add_rescue_type(thread, env, class_id, next_offset),
        Instr::PopRescueFrame => finish_rescue_block(thread, env, next_offset),
        Instr::JumpToFinally => finish_rescue_block(thread, env, next_offset),
        Instr::GetAttributeByName { slot_to, obj_slot_from, name_idx } => {
            exec_get_attribute_by_name(thread, env, slot_to, obj_slot_from, name_idx, next_offset)
        }
        Instr::GetAttributeByIdx { slot_to, obj_slot_from, attr_idx } => {
            exec_get_attribute_by_idx(thread, env, slot_to, obj_slot_from, attr_idx, next_offset)
        }
        Instr::SetByAttributeName { slot_obj, name_idx, slot_value } => {
            exec_set_attribute_by_name(thread, env, slot_obj, name_idx, slot_value, next_offset)
        }
        Instr::SetByAttributeIdx { slot_obj, attr_idx, slot_value } => {
            exec_set_attribute_by_idx(thread, env, slot_obj, attr_idx, slot_value, next_offset)
        }
        Instr::SetByIndexExpr { slot_obj, slot_index, slot_value } => {
            exec_set_by_index(thread, env, slot_obj, slot_index, slot_value, next_offset)
        }
        Instr::NewList { slot_to } => {
            alloc_into_slot(thread, env, slot_to, GcKind::List(VmList::new()), next_offset)
        }
        Instr::NewSet { slot_to } => {
            alloc_into_slot(thread, env, slot_to, GcKind::Set(VmSet::new()), next_offset)
        }
        Instr::NewMap { slot_to } => {
            alloc_into_slot(thread, env, slot_to, GcKind::Map(VmMap::new()), next_offset)
        }
        Instr::NewVector { slot_to } => {
            alloc_into_slot(thread, env, slot_to, GcKind::Vector(VmVector::new()), next_offset)
        }
        Instr::NewInstance { slot_to, class_id } => {
            exec_new_instance(thread, env, slot_to, class_id, next_offset)
        }
        Instr::NewInstanceByRef { slot_to, class_slot_from } => {
            let abs = thread.stack.abs_slot(class_slot_from);
            let v = thread.stack.get(abs).clone();
            let class_id = match v {
                Value::ClassRef(id) => id,
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "value is not a type reference"),
                    )
                }
            };
            exec_new_instance(thread, env, slot_to, class_id, next_offset)
        }
        Instr::GetConstructor { slot_to, obj_slot_from } => {
            let abs_from = thread.stack.abs_slot(obj_slot_from);
            let abs_to = thread.stack.abs_slot(slot_to);
            let class_id = match thread.stack.get(abs_from) {
                Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
                    GcKind::Instance { class_id, .. } => Some(*class_id),
                    _ => None,
                },
                _ => None,
            };
            let class_id = match class_id {
                Some(id) => id,
                None => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "constructors exist on object instances only"),
                    )
                }
            };
            let init_name = env.program.attr_names.init;
            match env.program.lookup_class_attr(class_id, init_name) {
                Some((defining, idx)) if idx >= METHOD_OFFSET => {
                    let func_idx = env.program.classes[defining as usize].funcattr_funcs
                        [(idx - METHOD_OFFSET) as usize];
                    let receiver = thread.stack.get_retained(abs_from, env.heaps);
                    match make_bound_closure(env, func_idx as FuncId, receiver) {
                        Ok(v) => {
                            thread.stack.write(abs_to, v, env.heaps);
                            thread.offset = next_offset;
                            Flow::Continue
                        }
                        Err(e) => raise_error(thread, env, e),
                    }
                }
                _ => {
                    thread.stack.write(abs_to, Value::None, env.heaps);
                    thread.offset = next_offset;
                    Flow::Continue
                }
            }
        }
        Instr::AwaitItem { slot_to, slot_await_from } => {
            let abs_from = thread.stack.abs_slot(slot_await_from);
            let abs_to = thread.stack.abs_slot(slot_to);
            let awaited_value = thread.stack.get(abs_from).clone();
            match awaited_value {
                Value::None => {
                    thread.stack.write(abs_to, Value::None, env.heaps);
                    thread.offset = next_offset;
                    Flow::Continue
                }
                Value::Int(awaited) => {
                    thread.offset = next_offset;
                    thread.await_slot = Some(abs_to);
                    Flow::Outcome(RunOutcome::Suspended(SuspendType::AwaitItem, awaited))
                }
                _ => raise_error(
                    thread,
                    env,
                    err_box(CLASS_TYPEERROR, "await expects a thread id or none"),
                ),
            }
        }
        Instr::HasAttrJump { jump_bytes_offset, slot_from, name_idx } => {
            let abs = thread.stack.abs_slot(slot_from);
            let has =
                value_has_attribute(env.program, &env.heaps.gc, thread.stack.get(abs), name_idx);
            if has {
                thread.offset = next_offset;
            } else {
                thread.offset = (thread.offset as i64 + jump_bytes_offset as i64) as u32;
            }
            Flow::Continue
        }
        Instr::Raise { class_id, msg_slot_from } => {
            exec_raise(thread, env, class_id, msg_slot_from)
        }
        Instr::RaiseByRef { class_slot_from, msg_slot_from } => {
            let abs = thread.stack.abs_slot(class_slot_from);
            let v = thread.stack.get(abs).clone();
            let class_id = match v {
                Value::ClassRef(id) => id,
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "raise expects a type reference"),
                    )
                }
            };
            exec_raise(thread, env, class_id, msg_slot_from)
        }
    }
}

/// Fatal conditions abort: the bytecode is trusted, and continuing on a
/// corrupt stream would corrupt user state.
fn fatal(msg: &str) -> ! {
    eprintln!("horsevm: fatal: {}", msg);
    std::process::abort();
}

fn materialize_const(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    operand: &ConstOperand,
) -> Result<Value, Box<ErrorInfo>> {
    Ok(match operand {
        ConstOperand::None => Value::None,
        ConstOperand::Bool(b) => Value::Bool(*b),
        ConstOperand::Int(i) => Value::Int(*i),
        ConstOperand::Float(f) => Value::Float(*f),
        ConstOperand::FuncRef(id) => Value::FuncRef(*id),
        ConstOperand::ClassRef(id) => Value::ClassRef(*id),
        ConstOperand::ShortStr(chars) => {
            let mut inline = ['\0'; crate::value::SHORTSTR_MAX];
            inline[..chars.len()].copy_from_slice(chars);
            Value::ShortStr {
                len: chars.len() as u8,
                chars: inline,
            }
        }
        ConstOperand::ShortBytes(bytes) => {
            Value::try_short_bytes(bytes).expect("encoded short bytes fit inline")
        }
        ConstOperand::PreallocStr(pool_idx) | ConstOperand::PreallocBytes(pool_idx) => {
            // Prealloc constants never land on the stack as-is: convert to
            // a heap value, cached per (function, pool index) for the
            // thread's lifetime.
            let key = (thread.func_id, *pool_idx);
            if let Some(r) = thread.intern.get(&key) {
                let r = *r;
                env.heaps.gc.retain_external(r);
                return Ok(Value::Gc(r));
            }
            let func = env.program.func(thread.func_id).expect("active function");
            let consts = match &func.kind {
                FuncKind::Bytecode { consts, .. } => consts,
                FuncKind::Native { .. } => fatal("constant pool access in native function"),
            };
            let kind = match consts.get(*pool_idx as usize) {
                Some(FuncConst::Str(chars)) => GcKind::Str(HString::from_chars(chars.clone())),
                Some(FuncConst::Bytes(bytes)) => GcKind::Bytes(HBytes::from_vec(bytes.clone())),
                None => fatal("constant pool index out of range"),
            };
            let r = env.heaps.gc.alloc(kind).map_err(|_| oom_box())?;
            // One reference for the intern cache, one for the destination
            // slot.
            env.heaps.gc.retain_external(r);
            env.heaps.gc.retain_external(r);
            thread.intern.insert(key, r);
            Value::Gc(r)
        }
    })
}

fn alloc_into_slot(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    slot_to: i16,
    kind: GcKind,
    next_offset: u32,
) -> Flow {
    let abs = thread.stack.abs_slot(slot_to);
    let r = match env.heaps.gc.alloc(kind) {
        Ok(r) => r,
        Err(_) => return raise_error(thread, env, oom_box()),
    };
    env.heaps.gc.retain_external(r);
    thread.stack.write(abs, Value::Gc(r), env.heaps);
    thread.offset = next_offset;
    Flow::Continue
}

fn add_rescue_type(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    class_id: ClassId,
    next_offset: u32,
) -> Flow {
    let is_error_class = env
        .program
        .class(class_id)
        .map(|c| c.is_error)
        .unwrap_or(false);
    if !is_error_class {
        return raise_error(
            thread,
            env,
            err_box(CLASS_TYPEERROR, "rescue type is not an error type"),
        );
    }
    match thread.rescue_frames.last_mut() {
        Some(frame) => frame.catch_types.add(class_id),
        None => fatal("rescue type added without an open rescue frame"),
    }
    thread.offset = next_offset;
    Flow::Continue
}

/// POPRESCUEFRAME / JUMPTOFINALLY: run a pending finally, then retire the
/// frame, re-raising any delayed error.
fn finish_rescue_block(thread: &mut Vmthread, env: &mut RunEnv<'_>, next_offset: u32) -> Flow {
    let frame = match thread.rescue_frames.last_mut() {
        Some(f) => f,
        None => fatal("rescue block finished without an open rescue frame"),
    };
    if frame.has_finally() && !frame.triggered_finally {
        frame.triggered_finally = true;
        thread.offset = frame.finally_offset as u32;
        return Flow::Continue;
    }
    let frame = thread.rescue_frames.pop().unwrap();
    match frame.delayed_error {
        Some(err) => raise_error(thread, env, err),
        None => {
            thread.offset = next_offset;
            Flow::Continue
        }
    }
}

fn exec_raise(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    class_id: ClassId,
    msg_slot_from: i16,
) -> Flow {
    let is_error_class = env
        .program
        .class(class_id)
        .map(|c| c.is_error)
        .unwrap_or(false);
    if !is_error_class {
        return raise_error(
            thread,
            env,
            err_box(CLASS_TYPEERROR, "raised type is not an error type"),
        );
    }
    let abs = thread.stack.abs_slot(msg_slot_from);
    let msg_value = thread.stack.get(abs);
    let message: Vec<char> = match str_chars(&env.heaps.gc, msg_value) {
        Some(chars) => chars.to_vec(),
        None => value_to_display(&env.heaps.gc, msg_value).chars().collect(),
    };
    let err = Box::new(ErrorInfo {
        class_id,
        message,
        frames: Vec::new(),
    });
    raise_error(thread, env, err)
}

/// Unwind toward a rescue frame that can handle `err`; see the frame
/// machinery notes for the finally bubble-up rules.
fn raise_error(thread: &mut Vmthread, env: &mut RunEnv<'_>, mut err: Box<ErrorInfo>) -> Flow {
    // Stack trace, captured once at the original raise site.
    if err.frames.is_empty() {
        err.frames.push((thread.func_id, thread.offset));
        for frame in thread.func_frames.iter().rev() {
            if err.frames.len() >= MAX_ERROR_STACK_FRAMES {
                break;
            }
            if frame.return_func_id >= 0 {
                err.frames.push((frame.return_func_id, frame.return_offset));
            }
        }
    }

    loop {
        let frame_idx = match thread.rescue_frames.len().checked_sub(1) {
            Some(i) => i,
            None => {
                // No handler anywhere: unwind everything and hand the
                // error to the caller of run().
                if env.trace {
                    thread.stack.dump_debug(env.heaps);
                }
                unwind_func_frames_to(thread, env, 0);
                let _ = thread.stack.to_size(0, env.heaps, true);
                return Flow::Outcome(RunOutcome::Uncaught(err));
            }
        };
        let (matches_catch, has_pending_finally) = {
            let frame = &thread.rescue_frames[frame_idx];
            let matches = !frame.triggered_catch
                && frame.has_catch()
                && frame
                    .catch_types
                    .iter()
                    .any(|caught| env.program.is_class_or_base(err.class_id, caught));
            (matches, frame.has_finally() && !frame.triggered_finally)
        };

        if matches_catch {
            let owner_idx = thread.rescue_frames[frame_idx].func_frame_idx;
            unwind_func_frames_to(thread, env, owner_idx + 1);
            let frame = &mut thread.rescue_frames[frame_idx];
            frame.triggered_catch = true;
            let error_slot =
                thread.func_frames[owner_idx].stack_floor + frame.error_slot as i64;
            let catch_offset = frame.catch_offset as u32;
            if thread.stack.entry_count() <= error_slot {
                // Error-path growth may consume the emergency margin.
                if thread
                    .stack
                    .to_size(error_slot + 1, env.heaps, true)
                    .is_err()
                {
                    fatal("stack exhausted while delivering an error");
                }
            }
            thread.stack.write(error_slot, Value::Error(err), env.heaps);
            thread.offset = catch_offset;
            return Flow::Continue;
        }

        if has_pending_finally {
            let owner_idx = thread.rescue_frames[frame_idx].func_frame_idx;
            unwind_func_frames_to(thread, env, owner_idx + 1);
            let frame = &mut thread.rescue_frames[frame_idx];
            frame.triggered_finally = true;
            frame.delayed_error = Some(err);
            thread.offset = frame.finally_offset as u32;
            return Flow::Continue;
        }

        // Frame cannot help; discard and keep unwinding.
        thread.rescue_frames.pop();
    }
}

/// Pop function frames until only `keep` remain, restoring caller state
/// from each.
fn unwind_func_frames_to(thread: &mut Vmthread, env: &mut RunEnv<'_>, keep: usize) {
    while thread.func_frames.len() > keep {
        let frame = thread.func_frames.pop().unwrap();
        let _ = thread
            .stack
            .to_size(frame.restore_stack_size, env.heaps, true);
        thread.func_id = frame.return_func_id;
        thread.offset = frame.return_offset;
        thread.stack.current_func_floor = thread
            .func_frames
            .last()
            .map(|f| f.stack_floor)
            .unwrap_or(0);
        // Rescue frames opened inside the dropped function die with it.
        while thread.rescue_frames.len() > frame.rescue_count_on_entry {
            thread.rescue_frames.pop();
        }
    }
}

fn return_from_call(thread: &mut Vmthread, env: &mut RunEnv<'_>, value: Value) -> Flow {
    let frame = match thread.func_frames.pop() {
        Some(f) => f,
        None => fatal("return without an active function frame"),
    };
    while thread.rescue_frames.len() > frame.rescue_count_on_entry {
        thread.rescue_frames.pop();
    }
    if thread
        .stack
        .to_size(frame.restore_stack_size, env.heaps, false)
        .is_err()
    {
        env.heaps.release_value(&value);
        return raise_error(thread, env, oom_box());
    }
    if thread.func_frames.is_empty() {
        // Root call completed.
        if !thread.start_queue.is_empty() {
            // Intermediate root (global initializer): discard its value
            // and let the main loop start the next one.
            env.heaps.release_value(&value);
            thread.stack.current_func_floor = 0;
            return Flow::Continue;
        }
        return Flow::Outcome(RunOutcome::Done(value));
    }
    thread.func_id = frame.return_func_id;
    thread.offset = frame.return_offset;
    thread.stack.current_func_floor = thread
        .func_frames
        .last()
        .map(|f| f.stack_floor)
        .unwrap_or(0);
    if frame.return_slot >= 0 {
        if thread.stack.entry_count() <= frame.return_slot
            && thread
                .stack
                .to_size(frame.return_slot + 1, env.heaps, false)
                .is_err()
        {
            env.heaps.release_value(&value);
            return raise_error(thread, env, oom_box());
        }
        thread.stack.write(frame.return_slot, value, env.heaps);
    } else {
        env.heaps.release_value(&value);
    }
    Flow::Continue
}

/// Callee resolution: plain function reference or closure.
struct Callee {
    func_id: FuncId,
    bound_self: Option<Value>,
    bound_args: Vec<Value>,
}

#[allow(clippy::too_many_arguments)]
fn exec_call(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    return_to: i16,
    slot_called_from: i16,
    flags: u8,
    posargs: i16,
    kwargs: i16,
    ignore_if_none: bool,
    next_offset: u32,
) -> Flow {
    let abs_called = thread.stack.abs_slot(slot_called_from);
    let abs_return = thread.stack.abs_slot(return_to);
    let arg_slots = posargs as i64 + kwargs as i64 * 2;
    let args_start = thread.stack.entry_count() - arg_slots;
    let restore_to = thread.call_settop.take().unwrap_or(args_start);

    // Resolve the callee before consuming arguments.
    let callee_value = thread.stack.get(abs_called).clone();
    let callee = match &callee_value {
        Value::FuncRef(id) => Some(Callee {
            func_id: *id,
            bound_self: None,
            bound_args: Vec::new(),
        }),
        Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
            GcKind::Closure(info) => Some(Callee {
                func_id: info.func_id,
                bound_self: info.bound_self.clone(),
                bound_args: info.bound_args.to_vec(),
            }),
            _ => None,
        },
        Value::None if ignore_if_none => {
            // Silent no-op: drop the argument region, produce none.
            if thread.stack.to_size(restore_to, env.heaps, false).is_err() {
                return raise_error(thread, env, oom_box());
            }
            if abs_return < thread.stack.entry_count() {
                thread.stack.write(abs_return, Value::None, env.heaps);
            }
            thread.offset = next_offset;
            return Flow::Continue;
        }
        _ => None,
    };
    let callee = match callee {
        Some(c) => c,
        None => {
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "called value is not callable"),
            )
        }
    };
    // Frame slots take their own references on the bindings.
    for v in callee.bound_args.iter().chain(callee.bound_self.iter()) {
        if let Value::Gc(b) = v {
            env.heaps.gc.retain_external(*b);
        }
    }
    // Borrows the program, not the env, so mutation below stays legal.
    let func = match env.program.func(callee.func_id) {
        Some(f) => f,
        None => {
            release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
            return raise_error(
                thread,
                env,
                err_box(CLASS_VALUEERROR, "called function does not exist"),
            );
        }
    };

    // Collect arguments off the stack; the vectors own the references.
    let mut pos_vals: Vec<Value> = Vec::with_capacity(posargs as usize + 4);
    for i in 0..posargs as i64 {
        pos_vals.push(thread.stack.take(args_start + i));
    }
    let mut kw_pairs: Vec<(NameId, Value)> = Vec::with_capacity(kwargs as usize);
    for i in 0..kwargs as i64 {
        let name_slot = args_start + posargs as i64 + i * 2;
        let name = match thread.stack.get(name_slot) {
            Value::Int(n) => *n,
            _ => fatal("keyword argument name slot does not hold a name index"),
        };
        let v = thread.stack.take(name_slot + 1);
        kw_pairs.push((name, v));
    }
    debug_assert!(
        kw_pairs.windows(2).all(|w| w[0].0 < w[1].0),
        "keyword arguments must arrive sorted by name index"
    );

    // Splice a trailing list into the positional region.
    if flags & CALLFLAG_UNPACKLASTPOSARG != 0 {
        let spliced = match pos_vals.pop() {
            Some(v) => v,
            None => {
                release_all(env, kw_pairs.into_iter().map(|(_, v)| v));
                release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
                return raise_error(
                    thread,
                    env,
                    err_box(CLASS_ARGUMENTERROR, "no trailing argument list to expand"),
                );
            }
        };
        let list_ref = match &spliced {
            Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
                GcKind::List(_) => Some(*r),
                _ => None,
            },
            _ => None,
        };
        match list_ref {
            Some(r) => {
                let elements: Vec<Value> = match &env.heaps.gc.get(r).kind {
                    GcKind::List(l) => l.iter().cloned().collect(),
                    _ => unreachable!(),
                };
                for v in elements {
                    env.heaps.retain_value(&v);
                    pos_vals.push(v);
                }
                env.heaps.release_value(&spliced);
            }
            None => {
                env.heaps.release_value(&spliced);
                release_all(env, pos_vals);
                release_all(env, kw_pairs.into_iter().map(|(_, v)| v));
                release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
                return raise_error(
                    thread,
                    env,
                    err_box(CLASS_TYPEERROR, "expanded argument must be a list"),
                );
            }
        }
    }

    // Arity checks.
    let expected_pos = func.positional_count() as usize;
    if pos_vals.len() != expected_pos {
        let msg = if pos_vals.len() < expected_pos {
            "too few positional arguments"
        } else {
            "too many positional arguments"
        };
        release_all(env, pos_vals);
        release_all(env, kw_pairs.into_iter().map(|(_, v)| v));
        release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
        return raise_error(thread, env, err_box(CLASS_ARGUMENTERROR, msg));
    }

    // Keyword reorder buffer sized to the callee's full kwarg arity.
    let mut kw_buffer: Vec<Value> = vec![Value::UnspecifiedKwarg; func.kwarg_names.len()];
    let mut unknown_kwarg = false;
    for (name, v) in kw_pairs {
        match func.kwarg_names.binary_search(&name) {
            Ok(idx) => {
                let old = std::mem::replace(&mut kw_buffer[idx], v);
                env.heaps.release_value(&old);
            }
            Err(_) => {
                env.heaps.release_value(&v);
                unknown_kwarg = true;
            }
        }
    }
    if unknown_kwarg {
        release_all(env, pos_vals);
        release_all(env, kw_buffer);
        release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
        return raise_error(
            thread,
            env,
            err_box(CLASS_ARGUMENTERROR, "unknown keyword argument"),
        );
    }

    // Async call: ship the reordered arguments to a fresh thread.
    if flags & (CALLFLAG_ASYNC | CALLFLAG_ASYNCPARALLEL) != 0 {
        let parallel = flags & CALLFLAG_ASYNCPARALLEL != 0;
        if parallel && !func.is_threadable {
            release_all(env, pos_vals);
            release_all(env, kw_buffer);
            release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "function cannot run on a parallel worker"),
            );
        }
        let mut portable_args = Vec::new();
        let mut transfer_failed = false;
        for v in pos_vals.iter().chain(kw_buffer.iter()) {
            match PortableValue::from_value(env.heaps, v) {
                Ok(p) => portable_args.push(p),
                Err(_) => {
                    transfer_failed = true;
                    break;
                }
            }
        }
        release_all(env, pos_vals);
        release_all(env, kw_buffer);
        release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
        if transfer_failed {
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "argument cannot cross to the new thread"),
            );
        }
        let thread_id = env.next_thread_id.fetch_add(1, Ordering::Relaxed);
        env.spawns.push(SpawnRequest {
            thread_id,
            func_id: callee.func_id,
            args: portable_args,
            parallel,
        });
        if thread.stack.to_size(restore_to, env.heaps, false).is_err() {
            return raise_error(thread, env, oom_box());
        }
        if abs_return < thread.stack.entry_count() {
            thread.stack.write(abs_return, Value::Int(thread_id), env.heaps);
        }
        thread.offset = next_offset;
        return Flow::Continue;
    }

    // Frame layout: positional args, kwargs, closure bound values, self.
    if thread.stack.to_size(restore_to, env.heaps, false).is_err() {
        release_all(env, pos_vals);
        release_all(env, kw_buffer);
        release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
        return raise_error(thread, env, oom_box());
    }
    let frame_floor = restore_to;
    let binding_count =
        callee.bound_args.len() as i64 + if callee.bound_self.is_some() { 1 } else { 0 };
    let bound_self_slot = callee
        .bound_self
        .as_ref()
        .map(|_| frame_floor + func.input_stack_size as i64 + callee.bound_args.len() as i64);
    let frame_size = func.input_stack_size as i64 + binding_count + func.inner_stack_size as i64;
    if thread
        .stack
        .to_size(frame_floor + frame_size, env.heaps, false)
        .is_err()
    {
        release_all(env, pos_vals);
        release_all(env, kw_buffer);
        release_all(env, callee.bound_args.into_iter().chain(callee.bound_self));
        return raise_error(thread, env, oom_box());
    }
    let mut write_idx = frame_floor;
    for v in pos_vals {
        thread.stack.write(write_idx, v, env.heaps);
        write_idx += 1;
    }
    for v in kw_buffer {
        thread.stack.write(write_idx, v, env.heaps);
        write_idx += 1;
    }
    for v in callee.bound_args {
        thread.stack.write(write_idx, v, env.heaps);
        write_idx += 1;
    }
    if let Some(self_v) = callee.bound_self {
        thread.stack.write(write_idx, self_v, env.heaps);
    }

    match &func.kind {
        FuncKind::Native { handler, .. } => invoke_native(
            thread,
            env,
            func,
            *handler,
            callee.func_id,
            frame_floor,
            restore_to,
            abs_return,
            bound_self_slot,
            None,
            next_offset,
        ),
        FuncKind::Bytecode { .. } => {
            thread.func_frames.push(FuncFrame {
                stack_floor: frame_floor,
                restore_stack_size: restore_to,
                return_slot: abs_return,
                return_func_id: thread.func_id,
                return_offset: next_offset,
                rescue_count_on_entry: thread.rescue_frames.len(),
            });
            thread.stack.current_func_floor = frame_floor;
            thread.func_id = callee.func_id;
            thread.offset = 0;
            Flow::Continue
        }
    }
}

fn release_all(env: &mut RunEnv<'_>, values: impl IntoIterator<Item = Value>) {
    for v in values {
        env.heaps.release_value(&v);
    }
}

#[allow(clippy::too_many_arguments)]
fn invoke_native(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    func: &FuncDef,
    handler: crate::program::NativeFn,
    func_id: FuncId,
    frame_floor: i64,
    restore_to: i64,
    return_slot: i64,
    bound_self_slot: Option<i64>,
    progress_idx: Option<u32>,
    next_offset: u32,
) -> Flow {
    // The instruction pointer moves past the call before the native runs;
    // suspension resumes re-invoke the handler, not the instruction.
    thread.offset = next_offset;
    let mut ctx = NativeCtx {
        heaps: &mut *env.heaps,
        program: env.program,
        thread_id: thread.id,
        stack: &mut thread.stack,
        frame_floor,
        arg_count: func.input_stack_size as usize,
        bound_self_slot,
        progress_idx,
        new_progress: None,
    };
    let outcome = handler(&mut ctx);
    let new_progress = ctx.new_progress.take();
    match outcome {
        NativeOutcome::Return(value) => {
            if let Some(idx) = progress_idx {
                env.heaps.progress.free(idx);
            }
            finish_native_call(thread, env, restore_to, return_slot, value)
        }
        NativeOutcome::Error(err) => {
            if let Some(idx) = progress_idx {
                env.heaps.progress.free(idx);
            }
            let _ = thread.stack.to_size(restore_to, env.heaps, true);
            thread.stack.current_func_floor = thread
                .func_frames
                .last()
                .map(|f| f.stack_floor)
                .unwrap_or(0);
            raise_error(thread, env, err)
        }
        NativeOutcome::Suspend(kind, arg) => {
            let progress = match new_progress {
                Some(record) => match env.heaps.progress.alloc(record) {
                    Ok(idx) => Some(idx),
                    Err(_) => {
                        let _ = thread.stack.to_size(restore_to, env.heaps, true);
                        return raise_error(thread, env, oom_box());
                    }
                },
                None => progress_idx,
            };
            thread.suspended_native = Some(SuspendedNative {
                func_id,
                frame_floor,
                restore_stack_size: restore_to,
                return_slot,
                bound_self_slot,
                progress,
            });
            Flow::Outcome(RunOutcome::Suspended(kind, arg))
        }
    }
}

fn finish_native_call(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    restore_to: i64,
    return_slot: i64,
    value: Value,
) -> Flow {
    if thread.stack.to_size(restore_to, env.heaps, false).is_err() {
        env.heaps.release_value(&value);
        return raise_error(thread, env, oom_box());
    }
    if thread.func_frames.is_empty() {
        // Native ran as a thread root.
        if !thread.start_queue.is_empty() {
            env.heaps.release_value(&value);
            return Flow::Continue;
        }
        return Flow::Outcome(RunOutcome::Done(value));
    }
    if return_slot >= 0 && return_slot < thread.stack.entry_count() {
        thread.stack.write(return_slot, value, env.heaps);
    } else {
        env.heaps.release_value(&value);
    }
    Flow::Continue
}

fn resume_native(thread: &mut Vmthread, env: &mut RunEnv<'_>) -> Flow {
    let info = thread.suspended_native.take().expect("resume without suspension");
    let func = match env.program.func(info.func_id) {
        Some(f) => f,
        None => fatal("suspended native function disappeared"),
    };
    let handler = match &func.kind {
        FuncKind::Native { handler, .. } => *handler,
        FuncKind::Bytecode { .. } => fatal("suspended frame is not native"),
    };
    invoke_native(
        thread,
        env,
        func,
        handler,
        info.func_id,
        info.frame_floor,
        info.restore_stack_size,
        info.return_slot,
        info.bound_self_slot,
        info.progress,
        thread.offset,
    )
}

/// Seed a root call: arguments materialize into this thread's heap, the
/// root frame returns the thread result.
fn setup_root_call(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    func_id: FuncId,
    args: Vec<PortableValue>,
) -> Flow {
    let func = match env.program.func(func_id) {
        Some(f) => f,
        None => fatal("thread root function does not exist"),
    };
    let expected = func.input_stack_size as usize;
    if args.len() != expected {
        return Flow::Outcome(RunOutcome::Uncaught(err_box(
            CLASS_ARGUMENTERROR,
            "thread root argument count mismatch",
        )));
    }
    let frame_size = func.input_stack_size as i64 + func.inner_stack_size as i64;
    if thread.stack.to_size(frame_size, env.heaps, false).is_err() {
        return Flow::Outcome(RunOutcome::Uncaught(oom_box()));
    }
    for (i, p) in args.iter().enumerate() {
        match p.into_value(env.heaps) {
            Ok(v) => thread.stack.write(i as i64, v, env.heaps),
            Err(_) => {
                return Flow::Outcome(RunOutcome::Uncaught(err_box(
                    CLASS_TYPEERROR,
                    "thread root argument cannot cross heaps",
                )))
            }
        }
    }
    thread.stack.current_func_floor = 0;
    match &func.kind {
        FuncKind::Bytecode { .. } => {
            thread.func_frames.push(FuncFrame {
                stack_floor: 0,
                restore_stack_size: 0,
                return_slot: -1,
                return_func_id: -1,
                return_offset: 0,
                rescue_count_on_entry: 0,
            });
            thread.func_id = func_id;
            thread.offset = 0;
            Flow::Continue
        }
        FuncKind::Native { handler, .. } => {
            let handler = *handler;
            invoke_native(
                thread, env, func, handler, func_id, 0, 0, -1, None, None, 0,
            )
        }
    }
}

fn make_bound_closure(
    env: &mut RunEnv<'_>,
    func_id: FuncId,
    receiver: Value,
) -> Result<Value, Box<ErrorInfo>> {
    // The closure cell keeps a heap reference on the receiver; the
    // receiver arrived with an external reference for this call.
    if let Value::Gc(r) = &receiver {
        env.heaps.gc.retain_heap(*r);
        env.heaps.gc.release_external(*r);
    }
    let r = env
        .heaps
        .gc
        .alloc(GcKind::Closure(crate::heap::ClosureInfo {
            func_id,
            bound_self: Some(receiver),
            bound_args: Box::new([]),
        }))
        .map_err(|_| oom_box())?;
    env.heaps.gc.retain_external(r);
    Ok(Value::Gc(r))
}

fn exec_new_instance(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    slot_to: i16,
    class_id: ClassId,
    next_offset: u32,
) -> Flow {
    let class = match env.program.class(class_id) {
        Some(c) => c,
        None => {
            return raise_error(
                thread,
                env,
                err_box(CLASS_VALUEERROR, "instantiated type does not exist"),
            )
        }
    };
    let varinit = class.varinit_func;
    let varattr_count = env.program.class_varattr_count(class_id);
    let abs_to = thread.stack.abs_slot(slot_to);
    let varattrs = vec![Value::None; varattr_count].into_boxed_slice();
    let r = match env.heaps.gc.alloc(GcKind::Instance { class_id, varattrs }) {
        Ok(r) => r,
        Err(_) => return raise_error(thread, env, oom_box()),
    };
    env.heaps.gc.retain_external(r);
    thread.stack.write(abs_to, Value::Gc(r), env.heaps);
    thread.offset = next_offset;

    // The hidden variable initializer runs as a bound call whose return
    // value is discarded; the instance stays in the target slot.
    if let Some(varinit_idx) = varinit {
        let func = match env.program.func(varinit_idx as FuncId) {
            Some(f) => f,
            None => fatal("variable initializer function does not exist"),
        };
        let frame_floor = thread.stack.entry_count();
        let frame_size = 1 + func.inner_stack_size as i64;
        if thread
            .stack
            .to_size(frame_floor + frame_size, env.heaps, false)
            .is_err()
        {
            return raise_error(thread, env, oom_box());
        }
        env.heaps.gc.retain_external(r);
        thread.stack.write(frame_floor, Value::Gc(r), env.heaps);
        match &func.kind {
            FuncKind::Bytecode { .. } => {
                thread.func_frames.push(FuncFrame {
                    stack_floor: frame_floor,
                    restore_stack_size: frame_floor,
                    return_slot: -1,
                    return_func_id: thread.func_id,
                    return_offset: thread.offset,
                    rescue_count_on_entry: thread.rescue_frames.len(),
                });
                thread.stack.current_func_floor = frame_floor;
                thread.func_id = varinit_idx as FuncId;
                thread.offset = 0;
            }
            FuncKind::Native { .. } => {
                fatal("variable initializer cannot be a native function")
            }
        }
    }
    Flow::Continue
}

/// Whether GETATTRIBUTEBYNAME would find something on this value.
pub(crate) fn value_has_attribute(
    program: &Program,
    pool: &crate::heap::GcPool,
    v: &Value,
    name: NameId,
) -> bool {
    let names = &program.attr_names;
    match v {
        Value::ShortStr { .. } | Value::ShortBytes { .. } => {
            name == names.len
                || name == names.as_str
                || name == names.as_bytes
                || name == names.is_a
                || program.string_method_funcs.contains_key(&name)
        }
        Value::Gc(r) => match &pool.get(*r).kind {
            GcKind::Str(_) | GcKind::Bytes(_) => {
                name == names.len
                    || name == names.as_str
                    || name == names.as_bytes
                    || name == names.is_a
                    || program.string_method_funcs.contains_key(&name)
            }
            GcKind::List(_) | GcKind::Map(_) | GcKind::Set(_) | GcKind::Vector(_) => {
                name == names.len
                    || name == names.is_a
                    || program.container_method_funcs.contains_key(&name)
            }
            GcKind::Instance { class_id, .. } => {
                name == names.is_a || program.lookup_class_attr(*class_id, name).is_some()
            }
            GcKind::Closure(_) => name == names.is_a,
        },
        Value::None => false,
        _ => name == names.is_a,
    }
}

fn exec_get_attribute_by_name(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    slot_to: i16,
    obj_slot_from: i16,
    name_idx: NameId,
    next_offset: u32,
) -> Flow {
    let abs_from = thread.stack.abs_slot(obj_slot_from);
    let abs_to = thread.stack.abs_slot(slot_to);
    let names = env.program.attr_names;

    // Built-in attributes on built-in types first.
    let obj = thread.stack.get(abs_from).clone();
    if name_idx == names.len {
        let len = match &obj {
            Value::ShortStr { len, chars } => {
                Some(crate::hstring::letter_count(&chars[..*len as usize]) as i64)
            }
            Value::ShortBytes { len, .. } => Some(*len as i64),
            Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
                GcKind::Str(s) => Some(s.letter_len() as i64),
                GcKind::Bytes(b) => Some(b.len() as i64),
                GcKind::List(l) => Some(l.count()),
                GcKind::Map(m) => Some(m.count()),
                GcKind::Set(s) => Some(s.count()),
                GcKind::Vector(v) => Some(v.len()),
                _ => None,
            },
            _ => None,
        };
        if let Some(len) = len {
            thread.stack.write(abs_to, Value::Int(len), env.heaps);
            thread.offset = next_offset;
            return Flow::Continue;
        }
    }
    if name_idx == names.as_str {
        if let Some(chars) = str_chars(&env.heaps.gc, &obj) {
            let s: String = chars.iter().collect();
            let v = match make_str_value(env, &s) {
                Ok(v) => v,
                Err(e) => return raise_error(thread, env, e),
            };
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            return Flow::Continue;
        }
        if let Some(bytes) = bytes_content(&env.heaps.gc, &obj) {
            let s = String::from_utf8_lossy(bytes).into_owned();
            let v = match make_str_value(env, &s) {
                Ok(v) => v,
                Err(e) => return raise_error(thread, env, e),
            };
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            return Flow::Continue;
        }
    }
    if name_idx == names.as_bytes {
        if let Some(chars) = str_chars(&env.heaps.gc, &obj) {
            let s: String = chars.iter().collect();
            let v = match make_bytes_value(env, s.as_bytes()) {
                Ok(v) => v,
                Err(e) => return raise_error(thread, env, e),
            };
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            return Flow::Continue;
        }
        if let Some(bytes) = bytes_content(&env.heaps.gc, &obj) {
            let bytes = bytes.to_vec();
            let v = match make_bytes_value(env, &bytes) {
                Ok(v) => v,
                Err(e) => return raise_error(thread, env, e),
            };
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            return Flow::Continue;
        }
    }
    if name_idx == names.is_a && env.program.indexes.is_a_func_index >= 0 {
        let receiver = thread.stack.get_retained(abs_from, env.heaps);
        match make_bound_closure(env, env.program.indexes.is_a_func_index, receiver) {
            Ok(v) => {
                thread.stack.write(abs_to, v, env.heaps);
                thread.offset = next_offset;
                return Flow::Continue;
            }
            Err(e) => return raise_error(thread, env, e),
        }
    }

    // Built-in method tables.
    let method_func = match &obj {
        Value::ShortStr { .. } | Value::ShortBytes { .. } => {
            env.program.string_method_funcs.get(&name_idx).copied()
        }
        Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
            GcKind::Str(_) | GcKind::Bytes(_) => {
                env.program.string_method_funcs.get(&name_idx).copied()
            }
            GcKind::List(_) | GcKind::Map(_) | GcKind::Set(_) | GcKind::Vector(_) => {
                env.program.container_method_funcs.get(&name_idx).copied()
            }
            _ => None,
        },
        _ => None,
    };
    if let Some(func_id) = method_func {
        let receiver = thread.stack.get_retained(abs_from, env.heaps);
        match make_bound_closure(env, func_id, receiver) {
            Ok(v) => {
                thread.stack.write(abs_to, v, env.heaps);
                thread.offset = next_offset;
                return Flow::Continue;
            }
            Err(e) => return raise_error(thread, env, e),
        }
    }

    // Class attributes on object instances.
    if let Value::Gc(r) = &obj {
        if let GcKind::Instance { class_id, .. } = &env.heaps.gc.get(*r).kind {
            let class_id = *class_id;
            if let Some((defining, idx)) = env.program.lookup_class_attr(class_id, name_idx) {
                if idx < METHOD_OFFSET {
                    let base = var_base_offset(env.program, class_id, defining);
                    let v = match &env.heaps.gc.get(*r).kind {
                        GcKind::Instance { varattrs, .. } => {
                            varattrs[base + idx as usize].clone()
                        }
                        _ => unreachable!(),
                    };
                    env.heaps.retain_value(&v);
                    thread.stack.write(abs_to, v, env.heaps);
                    thread.offset = next_offset;
                    return Flow::Continue;
                }
                let func_idx = env.program.classes[defining as usize].funcattr_funcs
                    [(idx - METHOD_OFFSET) as usize];
                let receiver = thread.stack.get_retained(abs_from, env.heaps);
                match make_bound_closure(env, func_idx as FuncId, receiver) {
                    Ok(v) => {
                        thread.stack.write(abs_to, v, env.heaps);
                        thread.offset = next_offset;
                        return Flow::Continue;
                    }
                    Err(e) => return raise_error(thread, env, e),
                }
            }
        }
    }

    raise_error(
        thread,
        env,
        err_box(
            crate::program::CLASS_ATTRIBUTEERROR,
            "value has no attribute with this name",
        ),
    )
}

fn make_str_value(env: &mut RunEnv<'_>, s: &str) -> Result<Value, Box<ErrorInfo>> {
    if let Some(short) = Value::try_short_str(s) {
        return Ok(short);
    }
    let r = env
        .heaps
        .gc
        .alloc(GcKind::Str(HString::from_str(s)))
        .map_err(|_| oom_box())?;
    env.heaps.gc.retain_external(r);
    Ok(Value::Gc(r))
}

fn make_bytes_value(env: &mut RunEnv<'_>, b: &[u8]) -> Result<Value, Box<ErrorInfo>> {
    if let Some(short) = Value::try_short_bytes(b) {
        return Ok(short);
    }
    let r = env
        .heaps
        .gc
        .alloc(GcKind::Bytes(HBytes::from_vec(b.to_vec())))
        .map_err(|_| oom_box())?;
    env.heaps.gc.retain_external(r);
    Ok(Value::Gc(r))
}

/// Offset of `defining`'s variable block inside an instance's varattr
/// array: base-most class first.
fn var_base_offset(program: &Program, _class_id: ClassId, defining: ClassId) -> usize {
    let base = program
        .class(defining)
        .map(|c| c.base_class)
        .unwrap_or(-1);
    if base < 0 {
        0
    } else {
        program.class_varattr_count(base)
    }
}

fn exec_get_attribute_by_idx(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    slot_to: i16,
    obj_slot_from: i16,
    attr_idx: i16,
    next_offset: u32,
) -> Flow {
    let abs_from = thread.stack.abs_slot(obj_slot_from);
    let abs_to = thread.stack.abs_slot(slot_to);
    let obj = thread.stack.get(abs_from).clone();
    let resolved = match &obj {
        Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
            GcKind::Instance { class_id, .. } => Some((*class_id, *r)),
            _ => None,
        },
        _ => None,
    };
    let (class_id, gcref) = match resolved {
        Some(pair) => pair,
        None => {
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "indexed attributes exist on object instances only"),
            )
        }
    };
    if attr_idx < crate::bytecode::ATTRIDX_METHOD_OFFSET {
        let v = match &env.heaps.gc.get(gcref).kind {
            GcKind::Instance { varattrs, .. } => match varattrs.get(attr_idx as usize) {
                Some(v) => v.clone(),
                None => fatal("variable attribute index out of range"),
            },
            _ => unreachable!(),
        };
        env.heaps.retain_value(&v);
        thread.stack.write(abs_to, v, env.heaps);
        thread.offset = next_offset;
        return Flow::Continue;
    }
    let method_idx = (attr_idx - crate::bytecode::ATTRIDX_METHOD_OFFSET) as i32;
    let func_idx = match resolve_funcattr(env.program, class_id, method_idx) {
        Some(f) => f,
        None => fatal("method attribute index out of range"),
    };
    let receiver = thread.stack.get_retained(abs_from, env.heaps);
    match make_bound_closure(env, func_idx, receiver) {
        Ok(v) => {
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Err(e) => raise_error(thread, env, e),
    }
}

fn resolve_funcattr(program: &Program, class_id: ClassId, idx: i32) -> Option<FuncId> {
    let mut current = class_id;
    loop {
        let c = program.class(current)?;
        if let Some(f) = c.funcattr_funcs.get(idx as usize) {
            return Some(*f as FuncId);
        }
        if c.base_class < 0 {
            return None;
        }
        current = c.base_class;
    }
}

fn exec_set_attribute_by_name(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    slot_obj: i16,
    name_idx: NameId,
    slot_value: i16,
    next_offset: u32,
) -> Flow {
    let abs_obj = thread.stack.abs_slot(slot_obj);
    let abs_value = thread.stack.abs_slot(slot_value);
    let obj = thread.stack.get(abs_obj).clone();
    let resolved = match &obj {
        Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
            GcKind::Instance { class_id, .. } => Some((*class_id, *r)),
            _ => None,
        },
        _ => None,
    };
    let (class_id, gcref) = match resolved {
        Some(pair) => pair,
        None => {
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "attributes can be set on object instances only"),
            )
        }
    };
    match env.program.lookup_class_attr(class_id, name_idx) {
        Some((defining, idx)) if idx < METHOD_OFFSET => {
            let base = var_base_offset(env.program, class_id, defining);
            write_varattr(thread, env, gcref, base + idx as usize, abs_value);
            thread.offset = next_offset;
            Flow::Continue
        }
        Some(_) => raise_error(
            thread,
            env,
            err_box(CLASS_TYPEERROR, "method attributes cannot be assigned"),
        ),
        None => raise_error(
            thread,
            env,
            err_box(
                crate::program::CLASS_ATTRIBUTEERROR,
                "value has no attribute with this name",
            ),
        ),
    }
}

fn exec_set_attribute_by_idx(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    slot_obj: i16,
    attr_idx: i16,
    slot_value: i16,
    next_offset: u32,
) -> Flow {
    let abs_obj = thread.stack.abs_slot(slot_obj);
    let abs_value = thread.stack.abs_slot(slot_value);
    let obj = thread.stack.get(abs_obj).clone();
    let resolved = match &obj {
        Value::Gc(r) => match &env.heaps.gc.get(*r).kind {
            GcKind::Instance { .. } => Some(*r),
            _ => None,
        },
        _ => None,
    };
    let gcref = match resolved {
        Some(r) => r,
        None => {
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "attributes can be set on object instances only"),
            )
        }
    };
    if attr_idx >= crate::bytecode::ATTRIDX_METHOD_OFFSET {
        return raise_error(
            thread,
            env,
            err_box(CLASS_TYPEERROR, "method attributes cannot be assigned"),
        );
    }
    write_varattr(thread, env, gcref, attr_idx as usize, abs_value);
    thread.offset = next_offset;
    Flow::Continue
}

/// Store a stack value into an instance variable slot: the instance cell
/// holds a heap reference, the previous occupant's heap reference drops.
fn write_varattr(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    gcref: GcRef,
    var_idx: usize,
    abs_value: i64,
) {
    let v = thread.stack.get(abs_value).clone();
    if let Value::Gc(inner) = &v {
        env.heaps.gc.retain_heap(*inner);
    }
    let mut obj = env.heaps.gc.take(gcref);
    let old = match &mut obj.kind {
        GcKind::Instance { varattrs, .. } => match varattrs.get_mut(var_idx) {
            Some(slot) => std::mem::replace(slot, v),
            None => fatal("variable attribute index out of range"),
        },
        _ => unreachable!(),
    };
    env.heaps.gc.put_back(gcref, obj);
    if let Value::Gc(old_ref) = old {
        env.heaps.gc.release_heap(old_ref);
    }
}

fn exec_set_by_index(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    slot_obj: i16,
    slot_index: i16,
    slot_value: i16,
    next_offset: u32,
) -> Flow {
    let abs_obj = thread.stack.abs_slot(slot_obj);
    let abs_index = thread.stack.abs_slot(slot_index);
    let abs_value = thread.stack.abs_slot(slot_value);

    let obj_value = thread.stack.get(abs_obj).clone();
    let gcref = match obj_value {
        Value::Gc(r) => r,
        _ => {
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "value does not support index assignment"),
            )
        }
    };
    let index_value = thread.stack.get(abs_index).clone();
    let new_value = thread.stack.get(abs_value).clone();

    enum Target {
        List,
        Map,
        Vector,
    }
    let target = match &env.heaps.gc.get(gcref).kind {
        GcKind::List(_) => Target::List,
        GcKind::Map(_) => Target::Map,
        GcKind::Vector(_) => Target::Vector,
        _ => {
            return raise_error(
                thread,
                env,
                err_box(CLASS_TYPEERROR, "value does not support index assignment"),
            )
        }
    };

    match target {
        Target::List => {
            let idx = match index_value {
                Value::Int(i) => i,
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "list index must be a number"),
                    )
                }
            };
            if let Value::Gc(inner) = &new_value {
                env.heaps.gc.retain_heap(*inner);
            }
            let mut obj = env.heaps.gc.take(gcref);
            let mut replaced = None;
            let result = match &mut obj.kind {
                GcKind::List(l) => l.set(idx, new_value.clone(), &mut replaced),
                _ => unreachable!(),
            };
            env.heaps.gc.put_back(gcref, obj);
            match result {
                Ok(Some(_)) => {
                    if let Some(Value::Gc(old_ref)) = replaced {
                        env.heaps.gc.release_heap(old_ref);
                    }
                    thread.offset = next_offset;
                    Flow::Continue
                }
                Ok(None) => {
                    if let Value::Gc(inner) = &new_value {
                        env.heaps.gc.release_heap(*inner);
                    }
                    raise_error(
                        thread,
                        env,
                        err_box(CLASS_INDEXERROR, "list index out of range"),
                    )
                }
                Err(_) => {
                    if let Value::Gc(inner) = &new_value {
                        env.heaps.gc.release_heap(*inner);
                    }
                    raise_error(thread, env, oom_box())
                }
            }
        }
        Target::Map => {
            if !is_hashable_key(&env.heaps.gc, &index_value) {
                return raise_error(
                    thread,
                    env,
                    err_box(CLASS_TYPEERROR, "map key must be an immutable value"),
                );
            }
            let hash = value_hash(&env.heaps.gc, &index_value).unwrap_or(0);
            for v in [&index_value, &new_value] {
                if let Value::Gc(inner) = v {
                    env.heaps.gc.retain_heap(*inner);
                }
            }
            let mut obj = env.heaps.gc.take(gcref);
            let result = {
                let gc = &env.heaps.gc;
                let key = index_value.clone();
                match &mut obj.kind {
                    GcKind::Map(m) => m.set_with(index_value.clone(), new_value, hash, |cand| {
                        values_equal(gc, cand, &key)
                    }),
                    _ => unreachable!(),
                }
            };
            env.heaps.gc.put_back(gcref, obj);
            match result {
                Ok(MapSetOutcome::Inserted) => {
                    thread.offset = next_offset;
                    Flow::Continue
                }
                Ok(MapSetOutcome::Replaced(old)) => {
                    // The key copy we retained was not stored; the old
                    // value's heap reference drops with it.
                    if let Value::Gc(key_ref) = &index_value {
                        env.heaps.gc.release_heap(*key_ref);
                    }
                    if let Value::Gc(old_ref) = old {
                        env.heaps.gc.release_heap(old_ref);
                    }
                    thread.offset = next_offset;
                    Flow::Continue
                }
                Err(_) => raise_error(thread, env, oom_box()),
            }
        }
        Target::Vector => {
            let idx = match index_value {
                Value::Int(i) => i,
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "vector index must be a number"),
                    )
                }
            };
            let entry = match new_value {
                Value::Int(i) => VecEntry::Int(i),
                Value::Float(f) => VecEntry::Float(f),
                _ => {
                    return raise_error(
                        thread,
                        env,
                        err_box(CLASS_TYPEERROR, "vector components must be numbers"),
                    )
                }
            };
            let mut obj = env.heaps.gc.take(gcref);
            let result = match &mut obj.kind {
                GcKind::Vector(v) => v.set(idx, entry),
                _ => unreachable!(),
            };
            env.heaps.gc.put_back(gcref, obj);
            match result {
                Ok(true) => {
                    thread.offset = next_offset;
                    Flow::Continue
                }
                Ok(false) => raise_error(
                    thread,
                    env,
                    err_box(CLASS_INDEXERROR, "vector index out of range"),
                ),
                Err(_) => raise_error(thread, env, oom_box()),
            }
        }
    }
}

fn exec_binop(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    op: BinOpKind,
    slot_to: i16,
    arg1: i16,
    arg2: i16,
    next_offset: u32,
) -> Flow {
    let abs1 = thread.stack.abs_slot(arg1);
    let abs2 = thread.stack.abs_slot(arg2);
    let abs_to = thread.stack.abs_slot(slot_to);

    if op == BinOpKind::IndexByExpr {
        return exec_index_by_expr(thread, env, abs1, abs2, abs_to, next_offset);
    }

    let a = thread.stack.get(abs1).clone();
    let b = thread.stack.get(abs2).clone();

    // Concatenation allocates, so it lives outside the pure evaluator.
    if op == BinOpKind::Add {
        let merged_str = match (str_chars(&env.heaps.gc, &a), str_chars(&env.heaps.gc, &b)) {
            (Some(x), Some(y)) => {
                let mut merged = String::with_capacity(x.len() + y.len());
                merged.extend(x.iter());
                merged.extend(y.iter());
                Some(merged)
            }
            _ => None,
        };
        if let Some(s) = merged_str {
            let v = match make_str_value(env, &s) {
                Ok(v) => v,
                Err(e) => return raise_error(thread, env, e),
            };
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            return Flow::Continue;
        }
        let merged_bytes =
            match (bytes_content(&env.heaps.gc, &a), bytes_content(&env.heaps.gc, &b)) {
                (Some(x), Some(y)) => {
                    let mut merged = Vec::with_capacity(x.len() + y.len());
                    merged.extend_from_slice(x);
                    merged.extend_from_slice(y);
                    Some(merged)
                }
                _ => None,
            };
        if let Some(bytes) = merged_bytes {
            let v = match make_bytes_value(env, &bytes) {
                Ok(v) => v,
                Err(e) => return raise_error(thread, env, e),
            };
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            return Flow::Continue;
        }
    }

    let result = eval_binop(&env.heaps.gc, op, &a, &b);
    match result {
        Ok(v) => {
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Err(e) => raise_error(thread, env, e),
    }
}

fn exec_index_by_expr(
    thread: &mut Vmthread,
    env: &mut RunEnv<'_>,
    abs_container: i64,
    abs_index: i64,
    abs_to: i64,
    next_offset: u32,
) -> Flow {
    let container = thread.stack.get(abs_container).clone();
    let index = thread.stack.get(abs_index).clone();

    // Pure fetch against the gc pool; raising happens afterwards so no
    // borrow is held across the unwind machinery.
    let fetched: Result<Value, Box<ErrorInfo>> = (|| {
        let pool = &env.heaps.gc;
        let int_index = || match &index {
            Value::Int(i) => Ok(*i),
            _ => Err(err_box(CLASS_TYPEERROR, "index must be a number")),
        };
        if let Some(chars) = str_chars(pool, &container) {
            let i = int_index()?;
            if i < 1 || i > chars.len() as i64 {
                return Err(err_box(CLASS_INDEXERROR, "string index out of range"));
            }
            let c = chars[(i - 1) as usize];
            return Ok(
                Value::try_short_str(&c.to_string()).expect("single codepoint fits inline")
            );
        }
        if let Some(bytes) = bytes_content(pool, &container) {
            let i = int_index()?;
            if i < 1 || i > bytes.len() as i64 {
                return Err(err_box(CLASS_INDEXERROR, "bytes index out of range"));
            }
            return Ok(Value::Int(bytes[(i - 1) as usize] as i64));
        }
        let gcref = match &container {
            Value::Gc(r) => *r,
            _ => return Err(err_box(CLASS_TYPEERROR, "value does not support indexing")),
        };
        match &pool.get(gcref).kind {
            GcKind::List(l) => {
                let i = int_index()?;
                l.get(i)
                    .cloned()
                    .ok_or_else(|| err_box(CLASS_INDEXERROR, "list index out of range"))
            }
            GcKind::Vector(vec) => {
                let i = int_index()?;
                vec.get(i)
                    .map(VecEntry::to_value)
                    .ok_or_else(|| err_box(CLASS_INDEXERROR, "vector index out of range"))
            }
            GcKind::Map(m) => {
                if !is_hashable_key(pool, &index) {
                    return Err(err_box(
                        CLASS_TYPEERROR,
                        "map key must be an immutable value",
                    ));
                }
                let hash = value_hash(pool, &index).unwrap_or(0);
                m.get_with(hash, |cand| values_equal(pool, cand, &index))
                    .cloned()
                    .ok_or_else(|| err_box(CLASS_INDEXERROR, "key not present in map"))
            }
            _ => Err(err_box(CLASS_TYPEERROR, "value does not support indexing")),
        }
    })();
    match fetched {
        Ok(v) => {
            env.heaps.retain_value(&v);
            thread.stack.write(abs_to, v, env.heaps);
            thread.offset = next_offset;
            Flow::Continue
        }
        Err(e) => raise_error(thread, env, e),
    }
}

/// Integral float results downgrade to int so `a + 0` stays `a`.
fn downgrade_float(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Value::Int(f as i64)
    } else {
        Value::Float(f)
    }
}

/// Mixed int/float addition and subtraction clamp back to the integer
/// operand when a tiny float addend would otherwise step past it in the
/// wrong direction through rounding.
fn clamped_mixed_add(int_operand: i64, float_addend: f64) -> f64 {
    let fa = int_operand as f64;
    let r = fa + float_addend;
    if (float_addend > 0.0 && r < fa) || (float_addend < 0.0 && r > fa) {
        fa
    } else {
        r
    }
}

pub(crate) fn eval_binop(
    pool: &crate::heap::GcPool,
    op: BinOpKind,
    a: &Value,
    b: &Value,
) -> Result<Value, Box<ErrorInfo>> {
    use BinOpKind::*;
    let type_err = || err_box(CLASS_TYPEERROR, "operand types do not support this operator");
    match op {
        CmpEqual => return Ok(Value::Bool(values_equal(pool, a, b))),
        CmpNotEqual => return Ok(Value::Bool(!values_equal(pool, a, b))),
        BoolAnd | BoolOr => {
            return match (a, b) {
                (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(if op == BoolAnd {
                    *x && *y
                } else {
                    *x || *y
                })),
                _ => Err(type_err()),
            }
        }
        _ => {}
    }

    // Ordering comparisons: numbers and strings.
    if matches!(op, CmpGreater | CmpGreaterEqual | CmpLess | CmpLessEqual) {
        if let (Some(x), Some(y)) = (str_chars(pool, a), str_chars(pool, b)) {
            let ord = x.cmp(y);
            return Ok(Value::Bool(match op {
                CmpGreater => ord.is_gt(),
                CmpGreaterEqual => ord.is_ge(),
                CmpLess => ord.is_lt(),
                CmpLessEqual => ord.is_le(),
                _ => unreachable!(),
            }));
        }
        let (x, y) = match (a, b) {
            (Value::Int(x), Value::Int(y)) => (*x as f64, *y as f64),
            (Value::Int(x), Value::Float(y)) => (*x as f64, *y),
            (Value::Float(x), Value::Int(y)) => (*x, *y as f64),
            (Value::Float(x), Value::Float(y)) => (*x, *y),
            _ => return Err(type_err()),
        };
        return Ok(Value::Bool(match op {
            CmpGreater => x > y,
            CmpGreaterEqual => x >= y,
            CmpLess => x < y,
            CmpLessEqual => x <= y,
            _ => unreachable!(),
        }));
    }

    // Bit operations: integer only.
    if matches!(op, BitOr | BitAnd | BitXor | ShiftLeft | ShiftRight) {
        let (x, y) = match (a, b) {
            (Value::Int(x), Value::Int(y)) => (*x, *y),
            _ => return Err(type_err()),
        };
        return match op {
            BitOr => Ok(Value::Int(x | y)),
            BitAnd => Ok(Value::Int(x & y)),
            BitXor => Ok(Value::Int(x ^ y)),
            ShiftLeft | ShiftRight => {
                if !(0..64).contains(&y) {
                    return Err(err_box(CLASS_VALUEERROR, "shift amount out of range"));
                }
                Ok(Value::Int(if op == ShiftLeft {
                    ((x as u64) << y) as i64
                } else {
                    x >> y
                }))
            }
            _ => unreachable!(),
        };
    }

    // Arithmetic. String concatenation is handled by the exec layer,
    // which can allocate.
    match (op, a, b) {
        (Add, Value::Int(x), Value::Int(y)) => x
            .checked_add(*y)
            .map(Value::Int)
            .ok_or_else(|| err_box(CLASS_OVERFLOWERROR, "integer addition overflows")),
        (Subtract, Value::Int(x), Value::Int(y)) => x
            .checked_sub(*y)
            .map(Value::Int)
            .ok_or_else(|| err_box(CLASS_OVERFLOWERROR, "integer subtraction overflows")),
        (Multiply, Value::Int(x), Value::Int(y)) => x
            .checked_mul(*y)
            .map(Value::Int)
            .ok_or_else(|| err_box(CLASS_OVERFLOWERROR, "integer multiplication overflows")),
        (Divide, Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                return Err(err_box(CLASS_MATHERROR, "division by zero"));
            }
            if x % y == 0 {
                x.checked_div(*y)
                    .map(Value::Int)
                    .ok_or_else(|| err_box(CLASS_OVERFLOWERROR, "integer division overflows"))
            } else {
                Ok(downgrade_float(*x as f64 / *y as f64))
            }
        }
        (Modulo, Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                return Err(err_box(CLASS_MATHERROR, "modulo by zero"));
            }
            x.checked_rem(*y)
                .map(Value::Int)
                .ok_or_else(|| err_box(CLASS_OVERFLOWERROR, "integer modulo overflows"))
        }
        (Add, Value::Int(x), Value::Float(y)) => Ok(downgrade_float(clamped_mixed_add(*x, *y))),
        (Add, Value::Float(x), Value::Int(y)) => Ok(downgrade_float(clamped_mixed_add(*y, *x))),
        (Add, Value::Float(x), Value::Float(y)) => Ok(downgrade_float(x + y)),
        (Subtract, Value::Int(x), Value::Float(y)) => {
            Ok(downgrade_float(clamped_mixed_add(*x, -*y)))
        }
        (Subtract, Value::Float(x), Value::Int(y)) => Ok(downgrade_float(x - *y as f64)),
        (Subtract, Value::Float(x), Value::Float(y)) => Ok(downgrade_float(x - y)),
        (Multiply, Value::Int(x), Value::Float(y)) => Ok(downgrade_float(*x as f64 * y)),
        (Multiply, Value::Float(x), Value::Int(y)) => Ok(downgrade_float(x * *y as f64)),
        (Multiply, Value::Float(x), Value::Float(y)) => Ok(downgrade_float(x * y)),
        (Divide, x, y) => {
            let (fx, fy) = match (x, y) {
                (Value::Int(x), Value::Float(y)) => (*x as f64, *y),
                (Value::Float(x), Value::Int(y)) => (*x, *y as f64),
                (Value::Float(x), Value::Float(y)) => (*x, *y),
                _ => return Err(type_err()),
            };
            if fy == 0.0 {
                return Err(err_box(CLASS_MATHERROR, "division by zero"));
            }
            Ok(downgrade_float(fx / fy))
        }
        (Modulo, x, y) => {
            let (fx, fy) = match (x, y) {
                (Value::Int(x), Value::Float(y)) => (*x as f64, *y),
                (Value::Float(x), Value::Int(y)) => (*x, *y as f64),
                (Value::Float(x), Value::Float(y)) => (*x, *y),
                _ => return Err(type_err()),
            };
            if fy == 0.0 {
                return Err(err_box(CLASS_MATHERROR, "modulo by zero"));
            }
            Ok(downgrade_float(fx % fy))
        }
        _ => Err(type_err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcPool;

    fn pool() -> GcPool {
        GcPool::new()
    }

    #[test]
    fn test_int_arithmetic() {
        let p = pool();
        assert_eq!(
            eval_binop(&p, BinOpKind::Add, &Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            eval_binop(&p, BinOpKind::Multiply, &Value::Int(4), &Value::Int(-2)).unwrap(),
            Value::Int(-8)
        );
    }

    #[test]
    fn test_int_overflow_raises() {
        let p = pool();
        let err = eval_binop(&p, BinOpKind::Add, &Value::Int(i64::MAX), &Value::Int(1))
            .unwrap_err();
        assert_eq!(err.class_id, CLASS_OVERFLOWERROR);
        let err = eval_binop(&p, BinOpKind::Subtract, &Value::Int(i64::MIN), &Value::Int(1))
            .unwrap_err();
        assert_eq!(err.class_id, CLASS_OVERFLOWERROR);
    }

    #[test]
    fn test_division_by_zero_raises_math_error() {
        let p = pool();
        let err = eval_binop(&p, BinOpKind::Divide, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.class_id, CLASS_MATHERROR);
        let err =
            eval_binop(&p, BinOpKind::Divide, &Value::Float(1.0), &Value::Float(0.0)).unwrap_err();
        assert_eq!(err.class_id, CLASS_MATHERROR);
    }

    #[test]
    fn test_int_division_downgrades_when_even() {
        let p = pool();
        assert_eq!(
            eval_binop(&p, BinOpKind::Divide, &Value::Int(10), &Value::Int(2)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            eval_binop(&p, BinOpKind::Divide, &Value::Int(5), &Value::Int(2)).unwrap(),
            Value::Float(2.5)
        );
    }

    #[test]
    fn test_integral_float_result_downgrades() {
        let p = pool();
        assert_eq!(
            eval_binop(&p, BinOpKind::Add, &Value::Float(1.5), &Value::Float(0.5)).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            eval_binop(&p, BinOpKind::Add, &Value::Int(7), &Value::Float(0.0)).unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn test_tiny_float_addend_clamps_to_int_operand() {
        let p = pool();
        // A large int loses precision as f64; the tiny positive addend
        // must not step the result below the integer operand.
        let big = (1i64 << 60) + 1;
        let result =
            eval_binop(&p, BinOpKind::Add, &Value::Int(big), &Value::Float(1e-18)).unwrap();
        match result {
            Value::Int(v) => assert!(v >= (big as f64) as i64),
            Value::Float(f) => assert!(f >= big as f64),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_string_comparison_is_codepoint_wise() {
        let p = pool();
        let a = Value::try_short_str("abc").unwrap();
        let b = Value::try_short_str("abd").unwrap();
        assert_eq!(
            eval_binop(&p, BinOpKind::CmpLess, &a, &b).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_binop(&p, BinOpKind::CmpGreaterEqual, &b, &a).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_ordering_on_mixed_types_raises() {
        let p = pool();
        let err = eval_binop(
            &p,
            BinOpKind::CmpLess,
            &Value::Int(1),
            &Value::try_short_str("a").unwrap(),
        )
        .unwrap_err();
        assert_eq!(err.class_id, CLASS_TYPEERROR);
    }

    #[test]
    fn test_equality_works_across_all_pairs() {
        let p = pool();
        assert_eq!(
            eval_binop(&p, BinOpKind::CmpEqual, &Value::Int(1), &Value::None).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval_binop(&p, BinOpKind::CmpNotEqual, &Value::Int(1), &Value::None).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_shift_amount_bounds() {
        let p = pool();
        assert_eq!(
            eval_binop(&p, BinOpKind::ShiftLeft, &Value::Int(1), &Value::Int(4)).unwrap(),
            Value::Int(16)
        );
        let err =
            eval_binop(&p, BinOpKind::ShiftLeft, &Value::Int(1), &Value::Int(64)).unwrap_err();
        assert_eq!(err.class_id, CLASS_VALUEERROR);
        let err =
            eval_binop(&p, BinOpKind::ShiftRight, &Value::Int(1), &Value::Int(-1)).unwrap_err();
        assert_eq!(err.class_id, CLASS_VALUEERROR);
    }

    #[test]
    fn test_bool_operators_require_bools() {
        let p = pool();
        assert_eq!(
            eval_binop(&p, BinOpKind::BoolAnd, &Value::Bool(true), &Value::Bool(false)).unwrap(),
            Value::Bool(false)
        );
        let err =
            eval_binop(&p, BinOpKind::BoolOr, &Value::Int(1), &Value::Bool(true)).unwrap_err();
        assert_eq!(err.class_id, CLASS_TYPEERROR);
    }
}
