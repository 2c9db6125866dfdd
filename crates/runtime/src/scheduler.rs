//! Cooperative scheduler
//!
//! One worker mutex serializes every scheduling decision and every
//! mutation of a thread's suspend state. The main worker runs the main
//! thread plus all non-parallel threads against the shared main heap
//! pool; parallel workers run threads whose root function is threadable,
//! each against a private pool. A worker repeatedly picks the first
//! thread whose suspend condition is satisfied, releases the mutex, runs
//! the interpreter, reacquires, and folds the outcome back in.
//!
//! Readiness sources:
//! - FIXEDTIME deadlines against the monotonic clock
//! - socket waits via poll(2); the pollfd set derives directly from the
//!   suspend states, and the suspend-type tally skips idle poll passes
//! - AWAITITEM against the done-result table
//!
//! Lifecycle counters are lock-free atomics so diagnostics can read them
//! without touching the worker mutex.

use crate::heap::Heaps;
use crate::interp::{
    self, GlobalsAccess, Globals, RunEnv, RunOutcome, SpawnRequest, Vmthread,
};
use crate::program::{standard_error_class_name, ConstValue, Program};
use crate::transfer::PortableValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuspendType {
    None = 0,
    Done = 1,
    AsyncCallScheduled = 2,
    SockwaitReadableOrError = 3,
    SockwaitWritableOrError = 4,
    FixedTime = 5,
    AwaitItem = 6,
}

pub const SUSPENDTYPE_COUNT: usize = 7;

// Lifecycle counters for diagnostics; every update is a lock-free atomic.
pub static TOTAL_THREADS_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_THREADS_COMPLETED: AtomicU64 = AtomicU64::new(0);
pub static ACTIVE_THREADS: AtomicUsize = AtomicUsize::new(0);
pub static PEAK_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Milliseconds on a process-wide monotonic clock. FIXEDTIME deadlines
/// and sleep natives use this, never the wall clock.
pub fn monotonic_millis() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as i64
}

fn parse_worker_count(env_value: Option<String>) -> usize {
    let fallback = || {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1)
    };
    match env_value {
        Some(val) => match val.parse::<usize>() {
            Ok(0) => {
                eprintln!("Warning: HORSE_WORKERS=0 is invalid, using default");
                fallback()
            }
            Ok(n) => n,
            Err(_) => {
                eprintln!(
                    "Warning: HORSE_WORKERS='{}' is not a valid number, using default",
                    val
                );
                fallback()
            }
        },
        None => fallback(),
    }
}

fn trace_enabled() -> bool {
    static TRACE: OnceLock<bool> = OnceLock::new();
    *TRACE.get_or_init(|| {
        std::env::var("HORSE_VMEXEC_DEBUG")
            .map(|v| v == "1")
            .unwrap_or(false)
    })
}

/// Terminal state of one thread, kept for awaiters.
#[derive(Debug, Clone)]
enum ThreadResult {
    Value(PortableValue),
    /// The return value could not cross heaps.
    NonPortable,
    Error { class_id: i64, message: String },
}

struct ThreadState {
    id: i64,
    parallel: bool,
    thread: Option<Box<Vmthread>>,
    /// Private pools of a parallel thread; non-parallel threads use the
    /// shared main pool set.
    heaps: Option<Box<Heaps>>,
    suspend: SuspendType,
    suspend_arg: i64,
    sock_ready: bool,
    running: bool,
}

struct ExecState {
    threads: Vec<ThreadState>,
    main_heaps: Option<Box<Heaps>>,
    globals: Option<Box<Globals>>,
    simple_snapshot: Arc<Vec<Option<ConstValue>>>,
    waittypes_currently_active: [i64; SUSPENDTYPE_COUNT],
    done_results: HashMap<i64, ThreadResult>,
    main_thread_id: i64,
    main_exit: Option<ExitStatus>,
    shutdown: bool,
}

impl ExecState {
    fn set_suspend(&mut self, idx: usize, suspend: SuspendType, arg: i64) {
        let ts = &mut self.threads[idx];
        self.waittypes_currently_active[ts.suspend as usize] -= 1;
        ts.suspend = suspend;
        ts.suspend_arg = arg;
        ts.sock_ready = false;
        self.waittypes_currently_active[suspend as usize] += 1;
    }

    fn thread_idx(&self, id: i64) -> Option<usize> {
        self.threads.iter().position(|t| t.id == id)
    }

    /// First thread this worker may run whose condition is satisfied.
    fn pick_ready(&self, parallel_worker: bool, now: i64) -> Option<usize> {
        self.threads.iter().position(|t| {
            if t.running || t.parallel != parallel_worker {
                return false;
            }
            match t.suspend {
                SuspendType::None | SuspendType::AsyncCallScheduled => true,
                SuspendType::Done => false,
                SuspendType::FixedTime => now >= t.suspend_arg,
                SuspendType::SockwaitReadableOrError
                | SuspendType::SockwaitWritableOrError => t.sock_ready,
                SuspendType::AwaitItem => {
                    self.done_results.contains_key(&t.suspend_arg)
                        || self.thread_idx(t.suspend_arg).is_none()
                }
            }
        })
    }

    /// Earliest FIXEDTIME deadline of threads this worker could run.
    fn earliest_deadline(&self, parallel_worker: bool) -> Option<i64> {
        self.threads
            .iter()
            .filter(|t| {
                !t.running && t.parallel == parallel_worker && t.suspend == SuspendType::FixedTime
            })
            .map(|t| t.suspend_arg)
            .min()
    }
}

/// How the process should exit once the main thread is finished.
#[derive(Debug, Clone)]
pub struct ExitStatus {
    pub code: i32,
    /// Uncaught error of the main thread: (class name, message).
    pub uncaught: Option<(String, String)>,
}

pub struct VmExec {
    program: Arc<Program>,
    state: Mutex<ExecState>,
    cond: Condvar,
    next_thread_id: AtomicI64,
}

impl VmExec {
    pub fn new(program: Arc<Program>) -> Result<VmExec, crate::heap::OomError> {
        let mut main_heaps = Box::new(Heaps::new());
        let globals = Box::new(Globals::from_program(&program, &mut main_heaps)?);
        let simple_snapshot = Arc::new(globals.simple_snapshot(&program));
        let mut waittypes = [0i64; SUSPENDTYPE_COUNT];

        let main_thread_id = 1i64;
        let mut start_queue = std::collections::VecDeque::new();
        if program.indexes.globalinitsimple_func_index >= 0 {
            start_queue.push_back((program.indexes.globalinitsimple_func_index, Vec::new()));
        }
        if program.indexes.globalinit_func_index >= 0 {
            start_queue.push_back((program.indexes.globalinit_func_index, Vec::new()));
        }
        start_queue.push_back((program.indexes.main_func_index, Vec::new()));
        let mut main_thread = Box::new(Vmthread::new(main_thread_id, true));
        main_thread.start_queue = start_queue;

        waittypes[SuspendType::AsyncCallScheduled as usize] += 1;
        TOTAL_THREADS_SPAWNED.fetch_add(1, Ordering::Relaxed);
        ACTIVE_THREADS.store(1, Ordering::Relaxed);

        Ok(VmExec {
            program,
            state: Mutex::new(ExecState {
                threads: vec![ThreadState {
                    id: main_thread_id,
                    parallel: false,
                    thread: Some(main_thread),
                    heaps: None,
                    suspend: SuspendType::AsyncCallScheduled,
                    suspend_arg: 0,
                    sock_ready: false,
                    running: false,
                }],
                main_heaps: Some(main_heaps),
                globals: Some(globals),
                simple_snapshot,
                waittypes_currently_active: waittypes,
                done_results: HashMap::new(),
                main_thread_id,
                main_exit: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            next_thread_id: AtomicI64::new(2),
        })
    }

    /// Run the program to completion: the main worker loop executes on
    /// the calling thread, parallel workers (if any function is
    /// threadable) on spawned threads. Returns the exit mapping of the
    /// main thread's result.
    pub fn run_to_completion(&self) -> ExitStatus {
        crate::diagnostics::install_signal_handler();
        let wants_parallel = self
            .program
            .funcs
            .iter()
            .any(|f| f.is_threadable || f.user_set_parallel);
        let worker_count = if wants_parallel {
            parse_worker_count(std::env::var("HORSE_WORKERS").ok())
        } else {
            0
        };
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| self.worker_loop(true));
            }
            self.worker_loop(false);
            // Wake parallel workers so they observe shutdown.
            self.cond.notify_all();
        });
        self.teardown_remaining();
        let guard = self.state.lock().expect("worker mutex poisoned");
        guard.main_exit.clone().unwrap_or(ExitStatus {
            code: 0,
            uncaught: None,
        })
    }

    fn worker_loop(&self, parallel_worker: bool) {
        let mut guard = self.state.lock().expect("worker mutex poisoned");
        loop {
            if guard.shutdown {
                return;
            }
            let now = monotonic_millis();
            if let Some(idx) = guard.pick_ready(parallel_worker, now) {
                guard = self.run_one(guard, idx, parallel_worker);
                continue;
            }
            // Nothing ready. The main worker owns the poll pass when any
            // of its threads wait on sockets; everyone else parks on the
            // condvar until a deadline or a state change.
            let sockwaits = guard.waittypes_currently_active
                [SuspendType::SockwaitReadableOrError as usize]
                + guard.waittypes_currently_active
                    [SuspendType::SockwaitWritableOrError as usize];
            if !parallel_worker && sockwaits > 0 {
                guard = self.poll_sockets(guard);
                continue;
            }
            let timeout = guard
                .earliest_deadline(parallel_worker)
                .map(|deadline| (deadline - now).clamp(1, 100) as u64)
                .unwrap_or(100);
            let (g, _) = self
                .cond
                .wait_timeout(guard, Duration::from_millis(timeout))
                .expect("worker mutex poisoned");
            guard = g;
        }
    }

    /// Release the mutex, poll the fds of socket-suspended threads, mark
    /// readiness, reacquire.
    fn poll_sockets<'a>(
        &'a self,
        guard: std::sync::MutexGuard<'a, ExecState>,
    ) -> std::sync::MutexGuard<'a, ExecState> {
        let mut fds: Vec<(i64, libc::pollfd)> = Vec::new();
        for t in &guard.threads {
            if t.running {
                continue;
            }
            let events = match t.suspend {
                SuspendType::SockwaitReadableOrError => libc::POLLIN | libc::POLLERR,
                SuspendType::SockwaitWritableOrError => libc::POLLOUT | libc::POLLERR,
                _ => continue,
            };
            fds.push((
                t.id,
                libc::pollfd {
                    fd: t.suspend_arg as i32,
                    events,
                    revents: 0,
                },
            ));
        }
        let now = monotonic_millis();
        let timeout = guard
            .earliest_deadline(false)
            .map(|deadline| (deadline - now).clamp(1, 50) as i32)
            .unwrap_or(50);
        drop(guard);

        let mut pollfds: Vec<libc::pollfd> = fds.iter().map(|(_, p)| *p).collect();
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };

        let mut guard = self.state.lock().expect("worker mutex poisoned");
        if rc > 0 {
            for ((tid, _), polled) in fds.iter().zip(pollfds.iter()) {
                if polled.revents != 0 {
                    if let Some(idx) = guard.thread_idx(*tid) {
                        guard.threads[idx].sock_ready = true;
                    }
                }
            }
            // Parallel workers may own some of the woken threads.
            self.cond.notify_all();
        }
        guard
    }

    /// Run one ready thread outside the mutex and fold its outcome back.
    fn run_one<'a>(
        &'a self,
        mut guard: std::sync::MutexGuard<'a, ExecState>,
        idx: usize,
        parallel_worker: bool,
    ) -> std::sync::MutexGuard<'a, ExecState> {
        // Deliver a satisfied await before handing over.
        if guard.threads[idx].suspend == SuspendType::AwaitItem {
            let awaited = guard.threads[idx].suspend_arg;
            let delivery = match guard.done_results.get(&awaited) {
                Some(ThreadResult::Value(p)) => p.clone(),
                Some(ThreadResult::NonPortable) => PortableValue::Error {
                    class_id: crate::program::CLASS_TYPEERROR,
                    message: "awaited value cannot cross heaps".to_string(),
                },
                Some(ThreadResult::Error { class_id, message }) => PortableValue::Error {
                    class_id: *class_id,
                    message: message.clone(),
                },
                None => PortableValue::Error {
                    class_id: crate::program::CLASS_VALUEERROR,
                    message: "awaited thread does not exist".to_string(),
                },
            };
            if let Some(thread) = guard.threads[idx].thread.as_mut() {
                thread.await_delivery = Some(delivery);
            }
        }
        guard.set_suspend(idx, SuspendType::None, 0);
        guard.threads[idx].running = true;
        let thread_id = guard.threads[idx].id;
        let mut thread = guard.threads[idx].thread.take().expect("thread in flight");
        let mut heaps = if parallel_worker {
            guard.threads[idx].heaps.take().expect("parallel heap set")
        } else {
            guard.main_heaps.take().expect("main heap set in flight")
        };
        let mut globals = if parallel_worker {
            None
        } else {
            Some(guard.globals.take().expect("globals in flight"))
        };
        let snapshot = guard.simple_snapshot.clone();
        drop(guard);

        let mut spawns: Vec<SpawnRequest> = Vec::new();
        let outcome = {
            let globals_access = match globals.as_mut() {
                Some(g) => GlobalsAccess::Main(g),
                None => GlobalsAccess::Parallel(&snapshot),
            };
            let mut env = RunEnv {
                program: &self.program,
                heaps: &mut heaps,
                globals: globals_access,
                spawns: &mut spawns,
                next_thread_id: &self.next_thread_id,
                trace: trace_enabled(),
            };
            interp::run(&mut thread, &mut env)
        };

        // Capture the result while the heap set is still in hand.
        let mut result_for_table: Option<ThreadResult> = None;
        let mut exit: Option<ExitStatus> = None;
        let finished = match &outcome {
            RunOutcome::Done(value) => {
                let result = match PortableValue::from_value(&heaps, value) {
                    Ok(p) => ThreadResult::Value(p),
                    Err(_) => ThreadResult::NonPortable,
                };
                if thread_id == 1 {
                    exit = Some(exit_status_for_value(&result));
                }
                heaps.release_value(value);
                result_for_table = Some(result);
                thread.teardown(&mut heaps);
                true
            }
            RunOutcome::Uncaught(err) => {
                let class_name = standard_error_class_name(err.class_id)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("Error#{}", err.class_id));
                let message = err.message_string();
                if thread_id == 1 {
                    exit = Some(ExitStatus {
                        code: 1,
                        uncaught: Some((class_name, message.clone())),
                    });
                } else {
                    eprintln!(
                        "horsevm: uncaught {} in thread {}: {}",
                        class_name, thread_id, message
                    );
                }
                result_for_table = Some(ThreadResult::Error {
                    class_id: err.class_id,
                    message,
                });
                thread.teardown(&mut heaps);
                true
            }
            RunOutcome::Suspended(..) => false,
        };

        let mut guard = self.state.lock().expect("worker mutex poisoned");
        // New threads requested during the run.
        for req in spawns {
            self.spawn_thread(&mut guard, req);
        }
        let idx = guard.thread_idx(thread_id).expect("thread entry in flight");
        guard.threads[idx].running = false;
        if parallel_worker {
            guard.threads[idx].heaps = Some(heaps);
        } else {
            guard.main_heaps = Some(heaps);
        }
        if let Some(g) = globals {
            guard.globals = Some(g);
        }
        if finished {
            guard.threads[idx].thread = Some(thread);
            guard.set_suspend(idx, SuspendType::Done, 0);
            if let Some(result) = result_for_table {
                guard.done_results.insert(thread_id, result);
            }
            TOTAL_THREADS_COMPLETED.fetch_add(1, Ordering::Relaxed);
            ACTIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
            if let Some(status) = exit {
                guard.main_exit = Some(status);
                guard.shutdown = true;
            }
        } else {
            guard.threads[idx].thread = Some(thread);
            if let RunOutcome::Suspended(kind, arg) = outcome {
                guard.set_suspend(idx, kind, arg);
            }
        }
        self.cond.notify_all();
        guard
    }

    fn spawn_thread(&self, guard: &mut std::sync::MutexGuard<'_, ExecState>, req: SpawnRequest) {
        let mut thread = Box::new(Vmthread::new(req.thread_id, !req.parallel));
        thread.start_queue.push_back((req.func_id, req.args));
        guard.threads.push(ThreadState {
            id: req.thread_id,
            parallel: req.parallel,
            thread: Some(thread),
            heaps: if req.parallel {
                Some(Box::new(Heaps::new()))
            } else {
                None
            },
            suspend: SuspendType::AsyncCallScheduled,
            suspend_arg: 0,
            sock_ready: false,
            running: false,
        });
        guard.waittypes_currently_active[SuspendType::AsyncCallScheduled as usize] += 1;
        TOTAL_THREADS_SPAWNED.fetch_add(1, Ordering::Relaxed);
        let active = ACTIVE_THREADS.fetch_add(1, Ordering::Relaxed) + 1;
        PEAK_THREADS.fetch_max(active, Ordering::Relaxed);
    }

    /// Abort and free every thread still alive after shutdown.
    fn teardown_remaining(&self) {
        let mut guard = self.state.lock().expect("worker mutex poisoned");
        let mut main_heaps = guard.main_heaps.take();
        for ts in &mut guard.threads {
            if ts.suspend == SuspendType::Done {
                continue;
            }
            if let Some(mut thread) = ts.thread.take() {
                if ts.parallel {
                    if let Some(mut heaps) = ts.heaps.take() {
                        thread.teardown(&mut heaps);
                        // Private pool: any leftover record is dead too.
                        heaps.progress.abort_all();
                    }
                } else if let Some(heaps) = main_heaps.as_mut() {
                    thread.teardown(heaps);
                }
                ACTIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
            }
        }
        guard.main_heaps = main_heaps;
    }
}

fn exit_status_for_value(result: &ThreadResult) -> ExitStatus {
    let code = match result {
        ThreadResult::Value(PortableValue::Int(i)) => {
            (*i).clamp(i32::MIN as i64, i32::MAX as i64) as i32
        }
        ThreadResult::Value(PortableValue::Bool(true)) => 0,
        ThreadResult::Value(PortableValue::Bool(false)) => -1,
        _ => 0,
    };
    ExitStatus {
        code,
        uncaught: None,
    }
}

/// Load-and-go entry: execute `program`'s main function with the whole
/// scheduler machinery and return the process exit mapping.
pub fn run_program(program: Arc<Program>) -> Result<ExitStatus, crate::heap::OomError> {
    let exec = VmExec::new(program)?;
    Ok(exec.run_to_completion())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Assembler, ConstOperand, Instr};
    use serial_test::serial;

    fn int_program(ret: i64) -> Arc<Program> {
        let mut p = Program::with_corelib();
        let mut asm = Assembler::new();
        asm.instr(Instr::SetConst {
            slot: 0,
            value: ConstOperand::Int(ret),
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 0,
        });
        let (buf, consts) = asm.finish();
        let main = p.add_bytecode_func(0, 1, vec![], buf, consts);
        p.indexes.main_func_index = main;
        Arc::new(p)
    }

    #[test]
    #[serial]
    fn test_run_program_exit_code() {
        let status = run_program(int_program(42)).unwrap();
        assert_eq!(status.code, 42);
        assert!(status.uncaught.is_none());
    }

    #[test]
    #[serial]
    fn test_run_program_bool_exit_mapping() {
        let mut p = Program::with_corelib();
        let mut asm = Assembler::new();
        asm.instr(Instr::SetConst {
            slot: 0,
            value: ConstOperand::Bool(false),
        });
        asm.instr(Instr::ReturnValue {
            return_slot_from: 0,
        });
        let (buf, consts) = asm.finish();
        let main = p.add_bytecode_func(0, 1, vec![], buf, consts);
        p.indexes.main_func_index = main;
        let status = run_program(Arc::new(p)).unwrap();
        assert_eq!(status.code, -1);
    }

    #[test]
    #[serial]
    fn test_uncaught_error_reported() {
        let mut p = Program::with_corelib();
        let mut asm = Assembler::new();
        asm.set_const_str(0, "boom");
        asm.instr(Instr::Raise {
            class_id: crate::program::CLASS_TYPEERROR,
            msg_slot_from: 0,
        });
        let (buf, consts) = asm.finish();
        let main = p.add_bytecode_func(0, 1, vec![], buf, consts);
        p.indexes.main_func_index = main;
        let status = run_program(Arc::new(p)).unwrap();
        assert_eq!(status.code, 1);
        let (class, msg) = status.uncaught.unwrap();
        assert_eq!(class, "TypeError");
        assert_eq!(msg, "boom");
    }

    #[test]
    fn test_parse_worker_count() {
        assert_eq!(parse_worker_count(Some("4".to_string())), 4);
        assert!(parse_worker_count(Some("0".to_string())) >= 1);
        assert!(parse_worker_count(Some("bogus".to_string())) >= 1);
        assert!(parse_worker_count(None) >= 1);
    }

    #[test]
    fn test_monotonic_millis_advances() {
        let a = monotonic_millis();
        std::thread::sleep(Duration::from_millis(5));
        let b = monotonic_millis();
        assert!(b >= a + 4);
    }
}
