//! End-to-end scenarios against assembled programs: arithmetic overflow,
//! container behavior under the instruction set, rescue/finally
//! semantics, iterator invalidation, suspension, async calls and the
//! call protocol.

use horse_runtime::bytecode::{
    Assembler, BinOpKind, ConstOperand, Instr, CALLFLAG_ASYNC, RESCUEMODE_JUMPONFINALLY,
    RESCUEMODE_JUMPONRESCUE,
};
use horse_runtime::heap::Heaps;
use horse_runtime::interp::{self, GlobalsAccess, Globals, RunEnv, RunOutcome, Vmthread};
use horse_runtime::program::{
    ConstValue, FuncKind, GlobalDef, Program, CLASS_ARGUMENTERROR,
    CLASS_INVALIDNOASYNCRESOURCEERROR, CLASS_TYPEERROR, CLASS_VALUEERROR,
};
use horse_runtime::scheduler::run_program;
use horse_runtime::value::{FuncId, Value};
use serial_test::serial;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

fn program_with_main(
    build: impl FnOnce(&mut Program) -> (Vec<u8>, Vec<horse_runtime::program::FuncConst>, i32),
) -> Arc<Program> {
    let mut p = Program::with_corelib();
    let (buf, consts, inner) = build(&mut p);
    let main = p.add_bytecode_func(0, inner, vec![], buf, consts);
    p.indexes.main_func_index = main;
    Arc::new(p)
}

fn native_func_id(p: &Program, lookup_name: &str) -> FuncId {
    p.funcs
        .iter()
        .position(|f| matches!(&f.kind, FuncKind::Native { lookup, .. } if lookup == lookup_name))
        .expect("native function registered") as FuncId
}

/// Run a program's main function directly through the interpreter, with
/// main-thread globals access.
fn run_directly(p: &Program) -> RunOutcome {
    let mut heaps = Heaps::new();
    let mut globals = Globals::from_program(p, &mut heaps).expect("globals");
    let mut thread = Vmthread::new(1, true);
    thread
        .start_queue
        .push_back((p.indexes.main_func_index, vec![]));
    let next = AtomicI64::new(2);
    let mut spawns = Vec::new();
    let mut env = RunEnv {
        program: p,
        heaps: &mut heaps,
        globals: GlobalsAccess::Main(&mut globals),
        spawns: &mut spawns,
        next_thread_id: &next,
        trace: false,
    };
    interp::run(&mut thread, &mut env)
}

#[test]
#[serial]
fn test_integer_overflow_raises_and_exits_nonzero() {
    let p = program_with_main(|_| {
        let mut asm = Assembler::new();
        asm.instr(Instr::SetConst {
            slot: 0,
            value: ConstOperand::Int(i64::MAX),
        });
        asm.instr(Instr::SetConst {
            slot: 1,
            value: ConstOperand::Int(1),
        });
        asm.instr(Instr::BinOp {
            op: BinOpKind::Add,
            slot_to: 2,
            arg1: 0,
            arg2: 1,
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 2,
        });
        let (buf, consts) = asm.finish();
        (buf, consts, 3)
    });
    let status = run_program(p).unwrap();
    assert_ne!(status.code, 0);
    let (class, _) = status.uncaught.expect("overflow is uncaught");
    assert_eq!(class, "OverflowError");
}

#[test]
#[serial]
fn test_map_fill_and_read_back_through_bytecode() {
    let p = program_with_main(|_| {
        let mut asm = Assembler::new();
        asm.instr(Instr::NewMap { slot_to: 0 });
        for i in 0..32i64 {
            asm.instr(Instr::SetConst {
                slot: 1,
                value: ConstOperand::Int(i),
            });
            asm.instr(Instr::SetConst {
                slot: 2,
                value: ConstOperand::Int(i * 10),
            });
            asm.instr(Instr::SetByIndexExpr {
                slot_obj: 0,
                slot_index: 1,
                slot_value: 2,
            });
        }
        asm.instr(Instr::SetConst {
            slot: 1,
            value: ConstOperand::Int(17),
        });
        asm.instr(Instr::BinOp {
            op: BinOpKind::IndexByExpr,
            slot_to: 3,
            arg1: 0,
            arg2: 1,
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 3,
        });
        let (buf, consts) = asm.finish();
        (buf, consts, 4)
    });
    let status = run_program(p).unwrap();
    assert_eq!(status.code, 170);
}

#[test]
#[serial]
fn test_rescue_catches_matching_error() {
    let p = program_with_main(|_| {
        let mut asm = Assembler::new();
        let push_at = asm.offset();
        asm.instr(Instr::PushRescueFrame {
            mode: RESCUEMODE_JUMPONRESCUE,
            slot_error_to: 1,
            jump_on_rescue: 0,
            jump_on_finally: -1,
        });
        asm.instr(Instr::AddRescueType {
            class_id: CLASS_VALUEERROR,
        });
        asm.set_const_str(0, "bad");
        asm.instr(Instr::Raise {
            class_id: CLASS_VALUEERROR,
            msg_slot_from: 0,
        });
        asm.instr(Instr::PopRescueFrame);
        let jump_end_at = asm.offset();
        asm.instr(Instr::Jump {
            jump_bytes_offset: 0,
        });
        let catch_at = asm.offset();
        asm.instr(Instr::SetConst {
            slot: 2,
            value: ConstOperand::Int(7),
        });
        asm.instr(Instr::PopRescueFrame);
        asm.instr(Instr::ReturnValue {
            return_slot_from: 2,
        });
        let end_at = asm.offset();
        asm.instr(Instr::SetConst {
            slot: 2,
            value: ConstOperand::Int(0),
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 2,
        });
        asm.patch_rel32(push_at, 4, catch_at);
        asm.patch_rel32(jump_end_at, 1, end_at);
        let (buf, consts) = asm.finish();
        (buf, consts, 3)
    });
    let status = run_program(p).unwrap();
    assert_eq!(status.code, 7, "catch block result must be returned");
}

#[test]
#[serial]
fn test_finally_runs_then_unmatched_error_reraises() {
    // do { raise TypeError("a") } rescue ValueError { } finally { 1 }:
    // the rescue does not match, finally runs, the TypeError surfaces.
    let p = program_with_main(|_| {
        let mut asm = Assembler::new();
        let push_at = asm.offset();
        asm.instr(Instr::PushRescueFrame {
            mode: RESCUEMODE_JUMPONRESCUE | RESCUEMODE_JUMPONFINALLY,
            slot_error_to: 1,
            jump_on_rescue: 0,
            jump_on_finally: 0,
        });
        asm.instr(Instr::AddRescueType {
            class_id: CLASS_VALUEERROR,
        });
        asm.set_const_str(0, "a");
        asm.instr(Instr::Raise {
            class_id: CLASS_TYPEERROR,
            msg_slot_from: 0,
        });
        asm.instr(Instr::PopRescueFrame);
        let jump_end_at = asm.offset();
        asm.instr(Instr::Jump {
            jump_bytes_offset: 0,
        });
        let catch_at = asm.offset();
        asm.instr(Instr::SetConst {
            slot: 2,
            value: ConstOperand::Int(99),
        });
        asm.instr(Instr::PopRescueFrame);
        let jump_end2_at = asm.offset();
        asm.instr(Instr::Jump {
            jump_bytes_offset: 0,
        });
        let finally_at = asm.offset();
        asm.instr(Instr::SetConst {
            slot: 3,
            value: ConstOperand::Int(1),
        });
        asm.instr(Instr::PopRescueFrame);
        let end_at = asm.offset();
        asm.instr(Instr::SetConst {
            slot: 2,
            value: ConstOperand::Int(0),
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 2,
        });
        asm.patch_rel32(push_at, 4, catch_at);
        asm.patch_rel32(push_at, 8, finally_at);
        asm.patch_rel32(jump_end_at, 1, end_at);
        asm.patch_rel32(jump_end2_at, 1, end_at);
        let (buf, consts) = asm.finish();
        (buf, consts, 4)
    });
    let status = run_program(p).unwrap();
    assert_eq!(status.code, 1);
    let (class, msg) = status.uncaught.expect("error must resurface after finally");
    assert_eq!(class, "TypeError");
    assert_eq!(msg, "a");
}

fn append_int(asm: &mut Assembler, list_slot: i16, index: i64, value: i64) {
    asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::Int(index),
    });
    asm.instr(Instr::SetConst {
        slot: 2,
        value: ConstOperand::Int(value),
    });
    asm.instr(Instr::SetByIndexExpr {
        slot_obj: list_slot,
        slot_index: 1,
        slot_value: 2,
    });
}

#[test]
#[serial]
fn test_iterator_invalidated_by_mutation_during_iteration() {
    let p = program_with_main(|_| {
        let mut asm = Assembler::new();
        asm.instr(Instr::NewList { slot_to: 0 });
        for i in 1..=3i64 {
            append_int(&mut asm, 0, i, i * 5);
        }
        asm.instr(Instr::NewIterator {
            slot_iterator_to: 3,
            slot_container_from: 0,
        });
        let iter1_at = asm.offset();
        asm.instr(Instr::Iterate {
            slot_value_to: 4,
            slot_iterator_from: 3,
            jump_on_end: 0,
        });
        // Appending during iteration bumps the revision.
        append_int(&mut asm, 0, 4, 20);
        let iter2_at = asm.offset();
        asm.instr(Instr::Iterate {
            slot_value_to: 4,
            slot_iterator_from: 3,
            jump_on_end: 0,
        });
        let end_at = asm.offset();
        asm.instr(Instr::SetConst {
            slot: 0,
            value: ConstOperand::Int(0),
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 0,
        });
        asm.patch_rel32(iter1_at, 5, end_at);
        asm.patch_rel32(iter2_at, 5, end_at);
        let (buf, consts) = asm.finish();
        (buf, consts, 5)
    });
    let status = run_program(p).unwrap();
    let (class, _) = status.uncaught.expect("second iterate must raise");
    assert_eq!(class, "ContainerChangedError");
}

#[test]
#[serial]
fn test_list_iteration_visits_each_element_once() {
    let p = program_with_main(|_| {
        let mut asm = Assembler::new();
        asm.instr(Instr::NewList { slot_to: 0 });
        for i in 1..=5i64 {
            append_int(&mut asm, 0, i, i);
        }
        asm.instr(Instr::SetConst {
            slot: 3,
            value: ConstOperand::Int(0),
        });
        asm.instr(Instr::NewIterator {
            slot_iterator_to: 4,
            slot_container_from: 0,
        });
        let loop_at = asm.offset();
        asm.instr(Instr::Iterate {
            slot_value_to: 5,
            slot_iterator_from: 4,
            jump_on_end: 0,
        });
        asm.instr(Instr::BinOp {
            op: BinOpKind::Add,
            slot_to: 3,
            arg1: 3,
            arg2: 5,
        });
        let jump_back_at = asm.offset();
        asm.instr(Instr::Jump {
            jump_bytes_offset: 0,
        });
        let end_at = asm.offset();
        asm.instr(Instr::ReturnValue {
            return_slot_from: 3,
        });
        asm.patch_rel32(loop_at, 5, end_at);
        asm.patch_rel32(jump_back_at, 1, loop_at);
        let (buf, consts) = asm.finish();
        (buf, consts, 6)
    });
    let status = run_program(p).unwrap();
    assert_eq!(status.code, 15, "1 + 2 + 3 + 4 + 5 visited exactly once");
}

#[test]
#[serial]
fn test_sleep_suspends_and_resumes_after_deadline() {
    let mut p = Program::with_corelib();
    let sleep_id = native_func_id(&p, "time.sleep");
    let ticks_id = native_func_id(&p, "time.ticks");
    let mut asm = Assembler::new();
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: ticks_id,
    });
    asm.instr(Instr::Call {
        return_to: 2,
        slot_called_from: 1,
        flags: 0,
        posargs: 0,
        kwargs: 0,
    });
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: sleep_id,
    });
    asm.instr(Instr::SetConst {
        slot: 3,
        value: ConstOperand::Int(120),
    });
    asm.instr(Instr::Call {
        return_to: 0,
        slot_called_from: 1,
        flags: 0,
        posargs: 1,
        kwargs: 0,
    });
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: ticks_id,
    });
    asm.instr(Instr::Call {
        return_to: 3,
        slot_called_from: 1,
        flags: 0,
        posargs: 0,
        kwargs: 0,
    });
    asm.instr(Instr::BinOp {
        op: BinOpKind::Subtract,
        slot_to: 0,
        arg1: 3,
        arg2: 2,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 4, vec![], buf, consts);
    p.indexes.main_func_index = main;
    let status = run_program(Arc::new(p)).unwrap();
    assert!(
        status.code >= 120,
        "elapsed must cover the sleep, got {} ms",
        status.code
    );
    assert!(status.code < 10_000, "sanity bound, got {} ms", status.code);
}

#[test]
#[serial]
fn test_async_call_returns_thread_id_and_await_delivers_value() {
    let mut p = Program::with_corelib();
    let mut worker_asm = Assembler::new();
    worker_asm.instr(Instr::BinOp {
        op: BinOpKind::Multiply,
        slot_to: 1,
        arg1: 0,
        arg2: 0,
    });
    worker_asm.instr(Instr::ReturnValue {
        return_slot_from: 1,
    });
    let (wbuf, wconsts) = worker_asm.finish();
    let worker = p.add_bytecode_func(1, 1, vec![], wbuf, wconsts);

    let mut asm = Assembler::new();
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: worker,
    });
    asm.instr(Instr::SetConst {
        slot: 3,
        value: ConstOperand::Int(7),
    });
    asm.instr(Instr::Call {
        return_to: 2,
        slot_called_from: 1,
        flags: CALLFLAG_ASYNC,
        posargs: 1,
        kwargs: 0,
    });
    asm.instr(Instr::AwaitItem {
        slot_to: 0,
        slot_await_from: 2,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 4, vec![], buf, consts);
    p.indexes.main_func_index = main;
    let status = run_program(Arc::new(p)).unwrap();
    assert_eq!(status.code, 49, "awaited async result of 7 * 7");
}

#[test]
fn test_kwargs_reordered_into_callee_frame() {
    let mut p = Program::with_corelib();
    let mut callee_asm = Assembler::new();
    // callee(a, k1=?, k2=?) -> k2; slots: a@0, k1@1, k2@2.
    callee_asm.instr(Instr::ReturnValue {
        return_slot_from: 2,
    });
    let (cbuf, cconsts) = callee_asm.finish();
    let callee = p.add_bytecode_func(3, 1, vec![100, 200], cbuf, cconsts);

    let mut asm = Assembler::new();
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: callee,
    });
    asm.instr(Instr::SetConst {
        slot: 3,
        value: ConstOperand::Int(1),
    });
    asm.instr(Instr::SetConst {
        slot: 4,
        value: ConstOperand::Int(200),
    });
    asm.instr(Instr::SetConst {
        slot: 5,
        value: ConstOperand::Int(5),
    });
    asm.instr(Instr::Call {
        return_to: 0,
        slot_called_from: 1,
        flags: 0,
        posargs: 1,
        kwargs: 1,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 6, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Done(Value::Int(5)) => {}
        other => panic!("expected k2 back, got {:?}", other),
    }
}

#[test]
fn test_unknown_kwarg_raises_argument_error() {
    let mut p = Program::with_corelib();
    let mut callee_asm = Assembler::new();
    callee_asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (cbuf, cconsts) = callee_asm.finish();
    let callee = p.add_bytecode_func(1, 1, vec![100], cbuf, cconsts);

    let mut asm = Assembler::new();
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: callee,
    });
    asm.instr(Instr::SetConst {
        slot: 3,
        value: ConstOperand::Int(999),
    });
    asm.instr(Instr::SetConst {
        slot: 4,
        value: ConstOperand::Int(1),
    });
    asm.instr(Instr::Call {
        return_to: 0,
        slot_called_from: 1,
        flags: 0,
        posargs: 0,
        kwargs: 1,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 5, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Uncaught(e) => assert_eq!(e.class_id, CLASS_ARGUMENTERROR),
        other => panic!("expected ArgumentError, got {:?}", other),
    }
}

#[test]
fn test_positional_arity_mismatch_raises() {
    let mut p = Program::with_corelib();
    let mut callee_asm = Assembler::new();
    callee_asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (cbuf, cconsts) = callee_asm.finish();
    let callee = p.add_bytecode_func(2, 1, vec![], cbuf, cconsts);

    let mut asm = Assembler::new();
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: callee,
    });
    asm.instr(Instr::SetConst {
        slot: 3,
        value: ConstOperand::Int(1),
    });
    asm.instr(Instr::Call {
        return_to: 0,
        slot_called_from: 1,
        flags: 0,
        posargs: 1,
        kwargs: 0,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 4, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Uncaught(e) => assert_eq!(e.class_id, CLASS_ARGUMENTERROR),
        other => panic!("expected ArgumentError, got {:?}", other),
    }
}

#[test]
fn test_call_ignore_if_none_is_silent_noop() {
    let mut p = Program::with_corelib();
    let mut asm = Assembler::new();
    asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::None,
    });
    asm.instr(Instr::CallIgnoreIfNone {
        return_to: 0,
        slot_called_from: 1,
        flags: 0,
        posargs: 0,
        kwargs: 0,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 2, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Done(Value::None) => {}
        other => panic!("expected silent none, got {:?}", other),
    }
}

#[test]
fn test_call_ignore_if_none_still_rejects_noncallable() {
    let mut p = Program::with_corelib();
    let mut asm = Assembler::new();
    asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::Int(5),
    });
    asm.instr(Instr::CallIgnoreIfNone {
        return_to: 0,
        slot_called_from: 1,
        flags: 0,
        posargs: 0,
        kwargs: 0,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 2, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Uncaught(e) => assert_eq!(e.class_id, CLASS_TYPEERROR),
        other => panic!("expected TypeError, got {:?}", other),
    }
}

#[test]
fn test_parallel_thread_cannot_write_globals() {
    let mut p = Program::with_corelib();
    p.globals.push(GlobalDef {
        init: ConstValue::Int(1),
        is_simple_constant: false,
        is_const: false,
    });
    let mut asm = Assembler::new();
    asm.instr(Instr::SetConst {
        slot: 0,
        value: ConstOperand::Int(9),
    });
    asm.instr(Instr::SetGlobal {
        global_to: 0,
        slot_from: 0,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 1, vec![], buf, consts);
    p.indexes.main_func_index = main;

    // Run the same function once with main access and once as a
    // parallel thread would see it.
    match run_directly(&p) {
        RunOutcome::Done(Value::Int(9)) => {}
        other => panic!("main-thread write must succeed, got {:?}", other),
    }

    let mut heaps = Heaps::new();
    let snapshot: Vec<Option<ConstValue>> = vec![None];
    let mut thread = Vmthread::new(2, false);
    thread
        .start_queue
        .push_back((p.indexes.main_func_index, vec![]));
    let next = AtomicI64::new(3);
    let mut spawns = Vec::new();
    let mut env = RunEnv {
        program: &p,
        heaps: &mut heaps,
        globals: GlobalsAccess::Parallel(&snapshot),
        spawns: &mut spawns,
        next_thread_id: &next,
        trace: false,
    };
    match interp::run(&mut thread, &mut env) {
        RunOutcome::Uncaught(e) => {
            assert_eq!(e.class_id, CLASS_INVALIDNOASYNCRESOURCEERROR)
        }
        other => panic!("parallel write must raise, got {:?}", other),
    }
}

#[test]
fn test_parallel_thread_reads_simple_constant_globals() {
    let mut p = Program::with_corelib();
    p.globals.push(GlobalDef {
        init: ConstValue::Int(23),
        is_simple_constant: true,
        is_const: true,
    });
    let mut asm = Assembler::new();
    asm.instr(Instr::GetGlobal {
        slot_to: 0,
        global_from: 0,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 1, vec![], buf, consts);
    p.indexes.main_func_index = main;

    let mut heaps = Heaps::new();
    let snapshot: Vec<Option<ConstValue>> = vec![Some(ConstValue::Int(23))];
    let mut thread = Vmthread::new(2, false);
    thread
        .start_queue
        .push_back((p.indexes.main_func_index, vec![]));
    let next = AtomicI64::new(3);
    let mut spawns = Vec::new();
    let mut env = RunEnv {
        program: &p,
        heaps: &mut heaps,
        globals: GlobalsAccess::Parallel(&snapshot),
        spawns: &mut spawns,
        next_thread_id: &next,
        trace: false,
    };
    match interp::run(&mut thread, &mut env) {
        RunOutcome::Done(Value::Int(23)) => {}
        other => panic!("simple constant must be readable, got {:?}", other),
    }
}

#[test]
fn test_instance_with_varinit_and_attribute_access() {
    let mut p = Program::with_corelib();
    const ATTR_NAME: i64 = 50;

    // Hidden variable initializer: self@0, sets the attribute to 13.
    let mut varinit_asm = Assembler::new();
    varinit_asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::Int(13),
    });
    varinit_asm.instr(Instr::SetByAttributeName {
        slot_obj: 0,
        name_idx: ATTR_NAME,
        slot_value: 1,
    });
    varinit_asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::None,
    });
    varinit_asm.instr(Instr::ReturnValue {
        return_slot_from: 1,
    });
    let (vbuf, vconsts) = varinit_asm.finish();
    let varinit = p.add_bytecode_func(0, 2, vec![], vbuf, vconsts);

    let class_id = p.classes.len() as i64;
    p.classes.push(horse_runtime::program::ClassDef {
        base_class: -1,
        varattr_names: vec![ATTR_NAME],
        varattr_flags: vec![0],
        varinit_func: Some(varinit as i32),
        ..Default::default()
    });
    p.rebuild_class_attribute_lookup();

    let mut asm = Assembler::new();
    asm.instr(Instr::NewInstance {
        slot_to: 0,
        class_id,
    });
    asm.instr(Instr::GetAttributeByName {
        slot_to: 1,
        obj_slot_from: 0,
        name_idx: ATTR_NAME,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 1,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 2, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Done(Value::Int(13)) => {}
        other => panic!("varinit value expected, got {:?}", other),
    }
}

#[test]
fn test_constructor_fetch_and_bound_call() {
    let mut p = Program::with_corelib();
    const ATTR_NAME: i64 = 60;
    let init_name = p.attr_names.init;

    // init(self): self arrives bound after the (empty) input region.
    let mut init_asm = Assembler::new();
    init_asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::Int(42),
    });
    init_asm.instr(Instr::SetByAttributeName {
        slot_obj: 0,
        name_idx: ATTR_NAME,
        slot_value: 1,
    });
    init_asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::None,
    });
    init_asm.instr(Instr::ReturnValue {
        return_slot_from: 1,
    });
    let (ibuf, iconsts) = init_asm.finish();
    let init_func = p.add_bytecode_func(0, 2, vec![], ibuf, iconsts);

    let class_id = p.classes.len() as i64;
    p.classes.push(horse_runtime::program::ClassDef {
        base_class: -1,
        varattr_names: vec![ATTR_NAME],
        varattr_flags: vec![0],
        funcattr_names: vec![init_name],
        funcattr_funcs: vec![init_func as i32],
        ..Default::default()
    });
    p.rebuild_class_attribute_lookup();

    let mut asm = Assembler::new();
    asm.instr(Instr::NewInstance {
        slot_to: 0,
        class_id,
    });
    asm.instr(Instr::GetConstructor {
        slot_to: 1,
        obj_slot_from: 0,
    });
    asm.instr(Instr::Call {
        return_to: 2,
        slot_called_from: 1,
        flags: 0,
        posargs: 0,
        kwargs: 0,
    });
    asm.instr(Instr::GetAttributeByName {
        slot_to: 3,
        obj_slot_from: 0,
        name_idx: ATTR_NAME,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 3,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 4, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Done(Value::Int(42)) => {}
        other => panic!("constructor effect expected, got {:?}", other),
    }
}

#[test]
fn test_container_method_through_attribute_dispatch() {
    // list.add(v) via GETATTRIBUTEBYNAME + CALL, then len.
    let mut p = Program::with_corelib();
    let add_name = p.attr_names.add;
    let len_name = p.attr_names.len;
    let mut asm = Assembler::new();
    asm.instr(Instr::NewList { slot_to: 0 });
    asm.instr(Instr::GetAttributeByName {
        slot_to: 1,
        obj_slot_from: 0,
        name_idx: add_name,
    });
    asm.instr(Instr::SetConst {
        slot: 3,
        value: ConstOperand::Int(11),
    });
    asm.instr(Instr::Call {
        return_to: 2,
        slot_called_from: 1,
        flags: 0,
        posargs: 1,
        kwargs: 0,
    });
    asm.instr(Instr::GetAttributeByName {
        slot_to: 1,
        obj_slot_from: 0,
        name_idx: len_name,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 1,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 4, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Done(Value::Int(1)) => {}
        other => panic!("list length after add expected, got {:?}", other),
    }
}

#[test]
fn test_float_result_downgrades_to_int() {
    let mut p = Program::with_corelib();
    let mut asm = Assembler::new();
    asm.instr(Instr::SetConst {
        slot: 0,
        value: ConstOperand::Int(5),
    });
    asm.instr(Instr::SetConst {
        slot: 1,
        value: ConstOperand::Float(0.0),
    });
    asm.instr(Instr::BinOp {
        op: BinOpKind::Add,
        slot_to: 2,
        arg1: 0,
        arg2: 1,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 2,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 3, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Done(Value::Int(5)) => {}
        other => panic!("5 + 0.0 must stay integral, got {:?}", other),
    }
}

#[test]
fn test_unpack_last_posarg_splices_list() {
    let mut p = Program::with_corelib();
    let mut callee_asm = Assembler::new();
    // callee(a, b, c) -> b
    callee_asm.instr(Instr::ReturnValue {
        return_slot_from: 1,
    });
    let (cbuf, cconsts) = callee_asm.finish();
    let callee = p.add_bytecode_func(3, 1, vec![], cbuf, cconsts);

    let mut asm = Assembler::new();
    asm.instr(Instr::GetFunc {
        slot_to: 1,
        func_from: callee,
    });
    // Build the spliced list [8, 9] in slot 2.
    asm.instr(Instr::NewList { slot_to: 2 });
    append_int(&mut asm, 2, 1, 8);
    append_int(&mut asm, 2, 2, 9);
    // Args region on top: 7, then the list.
    asm.instr(Instr::SetConst {
        slot: 4,
        value: ConstOperand::Int(7),
    });
    asm.instr(Instr::ValueCopy {
        slot_to: 5,
        slot_from: 2,
    });
    asm.instr(Instr::Call {
        return_to: 0,
        slot_called_from: 1,
        flags: horse_runtime::bytecode::CALLFLAG_UNPACKLASTPOSARG,
        posargs: 2,
        kwargs: 0,
    });
    asm.instr(Instr::ReturnValue {
        return_slot_from: 0,
    });
    let (buf, consts) = asm.finish();
    let main = p.add_bytecode_func(0, 6, vec![], buf, consts);
    p.indexes.main_func_index = main;
    match run_directly(&p) {
        RunOutcome::Done(Value::Int(8)) => {}
        other => panic!("spliced second positional expected, got {:?}", other),
    }
}
