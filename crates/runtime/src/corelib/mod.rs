//! Core native functions
//!
//! Everything the runtime offers bytecode beyond the instruction set:
//! printing, time, non-blocking sockets, and the built-in method surface
//! of containers, strings and bytes. `install` registers the functions
//! into a program under construction and wires the attribute dispatch
//! tables; `register_handlers` exposes the same handlers to the loader
//! for cfunc rebinding by lookup name.

pub mod containers;
pub mod io;
pub mod net;
pub mod strings;
pub mod time;

use crate::program::{NativeRegistry, Program};
use crate::value::NameId;

/// Name ids of built-in methods beyond the well-known attribute set.
/// These ids are part of the compiler contract and are never serialized.
pub mod names {
    use crate::value::NameId;

    pub const SUB: NameId = 1001;
    pub const FIND: NameId = 1002;
    pub const TRIM: NameId = 1003;
    pub const LOWER: NameId = 1004;
    pub const UPPER: NameId = 1005;
    pub const SPLIT: NameId = 1006;
    pub const JOIN: NameId = 1007;
    pub const INSERT: NameId = 1008;
    pub const REMOVE: NameId = 1009;
}

struct MethodSpec {
    name: NameId,
    lookup: &'static str,
    handler: crate::program::NativeFn,
    posargs: i32,
}

/// Register every corelib function into `p` and wire the dispatch
/// tables and well-known function indices.
pub fn install(p: &mut Program) {
    // Free functions.
    p.add_native_func("core.print", io::native_print, 1, vec![], false, false);
    p.add_native_func("time.sleep", time::native_sleep, 1, vec![], true, true);
    p.add_native_func("time.ticks", time::native_ticks, 0, vec![], true, false);
    p.add_native_func("net.connect", net::native_connect, 2, vec![], true, true);
    p.add_native_func("net.read", net::native_read, 2, vec![], true, true);
    p.add_native_func("net.write", net::native_write, 2, vec![], true, true);
    p.add_native_func("net.close", net::native_close, 1, vec![], true, false);

    let has_attr = p.add_native_func(
        "core.has_attr",
        containers::native_has_attr,
        2,
        vec![],
        true,
        false,
    );
    p.indexes.has_attr_func_idx = has_attr;
    let is_a = p.add_native_func("core.is_a", containers::native_is_a, 1, vec![], true, false);
    p.indexes.is_a_func_index = is_a;

    // Container methods, dispatched by attribute name on container
    // receivers. Receiver arrives as the bound self.
    let container_methods = [
        MethodSpec {
            name: p.attr_names.add,
            lookup: "containers.add",
            handler: containers::native_add,
            posargs: 1,
        },
        MethodSpec {
            name: p.attr_names.del,
            lookup: "containers.del",
            handler: containers::native_del,
            posargs: 1,
        },
        MethodSpec {
            name: p.attr_names.contains,
            lookup: "containers.contains",
            handler: containers::native_contains,
            posargs: 1,
        },
        MethodSpec {
            name: names::INSERT,
            lookup: "containers.insert",
            handler: containers::native_insert,
            posargs: 2,
        },
        MethodSpec {
            name: names::REMOVE,
            lookup: "containers.remove",
            handler: containers::native_remove,
            posargs: 1,
        },
    ];
    for method in container_methods {
        let id = p.add_native_func(method.lookup, method.handler, method.posargs, vec![], true, false);
        p.container_method_funcs.insert(method.name, id);
    }

    // String and bytes methods.
    let string_methods = [
        MethodSpec {
            name: names::SUB,
            lookup: "strings.sub",
            handler: strings::native_sub,
            posargs: 2,
        },
        MethodSpec {
            name: names::FIND,
            lookup: "strings.find",
            handler: strings::native_find,
            posargs: 1,
        },
        MethodSpec {
            name: names::TRIM,
            lookup: "strings.trim",
            handler: strings::native_trim,
            posargs: 0,
        },
        MethodSpec {
            name: names::LOWER,
            lookup: "strings.lower",
            handler: strings::native_lower,
            posargs: 0,
        },
        MethodSpec {
            name: names::UPPER,
            lookup: "strings.upper",
            handler: strings::native_upper,
            posargs: 0,
        },
        MethodSpec {
            name: names::SPLIT,
            lookup: "strings.split",
            handler: strings::native_split,
            posargs: 1,
        },
        MethodSpec {
            name: names::JOIN,
            lookup: "strings.join",
            handler: strings::native_join,
            posargs: 1,
        },
    ];
    for method in string_methods {
        let id = p.add_native_func(method.lookup, method.handler, method.posargs, vec![], true, false);
        p.string_method_funcs.insert(method.name, id);
    }
}

/// Handlers by lookup name, for rebinding on program restore.
pub fn register_handlers(reg: &mut NativeRegistry) {
    reg.register_c_function("core.print", io::native_print);
    reg.register_c_function("time.sleep", time::native_sleep);
    reg.register_c_function("time.ticks", time::native_ticks);
    reg.register_c_function("net.connect", net::native_connect);
    reg.register_c_function("net.read", net::native_read);
    reg.register_c_function("net.write", net::native_write);
    reg.register_c_function("net.close", net::native_close);
    reg.register_c_function("core.has_attr", containers::native_has_attr);
    reg.register_c_function("core.is_a", containers::native_is_a);
    reg.register_c_function("containers.add", containers::native_add);
    reg.register_c_function("containers.del", containers::native_del);
    reg.register_c_function("containers.contains", containers::native_contains);
    reg.register_c_function("containers.insert", containers::native_insert);
    reg.register_c_function("containers.remove", containers::native_remove);
    reg.register_c_function("strings.sub", strings::native_sub);
    reg.register_c_function("strings.find", strings::native_find);
    reg.register_c_function("strings.trim", strings::native_trim);
    reg.register_c_function("strings.lower", strings::native_lower);
    reg.register_c_function("strings.upper", strings::native_upper);
    reg.register_c_function("strings.split", strings::native_split);
    reg.register_c_function("strings.join", strings::native_join);
}
