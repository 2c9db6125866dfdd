//! Console output

use crate::interp::{NativeCtx, NativeOutcome};
use crate::value::{value_to_display, Value};
use std::io::Write;

/// `print(value)`: render and write one line to stdout.
pub fn native_print(ctx: &mut NativeCtx<'_>) -> NativeOutcome {
    let text = value_to_display(&ctx.heaps.gc, ctx.arg(0));
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", text);
    NativeOutcome::Return(Value::None)
}

#[cfg(test)]
mod tests {
    // Covered through the scenario tests, which run full programs that
    // print; the handler itself has no logic beyond rendering.
}
