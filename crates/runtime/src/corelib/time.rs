//! Time natives
//!
//! `sleep` is the canonical suspendable native: the first invocation
//! stores its deadline in an async-progress record and suspends with
//! FIXEDTIME; the scheduler re-invokes it at or after the deadline and it
//! completes (or re-suspends if woken early).

use crate::heap::CFuncProgress;
use crate::interp::{NativeCtx, NativeOutcome};
use crate::program::CLASS_TYPEERROR;
use crate::scheduler::{monotonic_millis, SuspendType};
use crate::value::{ErrorInfo, Value};

struct SleepProgress {
    deadline: i64,
}

impl CFuncProgress for SleepProgress {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// `time.sleep(millis)`
pub fn native_sleep(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    if let Some(progress) = ctx.progress_mut::<SleepProgress>() {
        let deadline = progress.deadline;
        if monotonic_millis() >= deadline {
            return NativeOutcome::Return(Value::None);
        }
        return NativeOutcome::Suspend(SuspendType::FixedTime, deadline);
    }
    let millis = match ctx.arg(0) {
        Value::Int(i) => *i,
        Value::Float(f) => *f as i64,
        _ => {
            return NativeOutcome::Error(Box::new(ErrorInfo::new(
                CLASS_TYPEERROR,
                "sleep expects a duration in milliseconds",
            )))
        }
    };
    if millis <= 0 {
        return NativeOutcome::Return(Value::None);
    }
    let deadline = monotonic_millis() + millis;
    ctx.start_progress(Box::new(SleepProgress { deadline }));
    NativeOutcome::Suspend(SuspendType::FixedTime, deadline)
}

/// `time.ticks()`: milliseconds on the monotonic clock.
pub fn native_ticks(_ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    NativeOutcome::Return(Value::Int(monotonic_millis()))
}
