//! CLI behavior: help/version spellings, action dispatch, program
//! execution exit codes, and standalone embedded-program mode.

use horse_runtime::bytecode::{Assembler, ConstOperand, Instr};
use horse_runtime::pak;
use horse_runtime::program::Program;
use std::path::PathBuf;
use std::process::Command;

fn horsec() -> Command {
    Command::new(env!("CARGO_BIN_EXE_horsec"))
}

fn int_program_blob(ret: i64) -> Vec<u8> {
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
    horse_runtime::serialize::dump(&p)
}

fn write_artifact(dir: &tempfile::TempDir, name: &str, blob: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, blob).unwrap();
    path
}

#[test]
fn test_help_exits_zero() {
    for flag in ["-h", "--help", "-?", "/?"] {
        let out = horsec().arg(flag).output().unwrap();
        assert!(out.status.success(), "{} must exit 0", flag);
        let text = String::from_utf8_lossy(&out.stdout);
        assert!(text.contains("horsec"), "usage text expected for {}", flag);
    }
}

#[test]
fn test_version_spellings_exit_zero() {
    for flag in ["-v", "-V", "--version", "-version"] {
        let out = horsec().arg(flag).output().unwrap();
        assert!(out.status.success(), "{} must exit 0", flag);
        let text = String::from_utf8_lossy(&out.stdout);
        assert!(
            text.contains("corelib"),
            "multi-line banner expected for {}",
            flag
        );
    }
}

#[test]
fn test_unknown_action_exits_255() {
    let out = horsec().arg("frobnicate").output().unwrap();
    assert_eq!(out.status.code(), Some(255));
}

#[test]
fn test_exec_returns_program_result() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_artifact(&dir, "ret42.hasm", &int_program_blob(42));
    for action in ["exec", "run"] {
        let out = horsec().arg(action).arg(&artifact).output().unwrap();
        assert_eq!(out.status.code(), Some(42), "{} exit code", action);
    }
}

#[test]
fn test_exec_rejects_garbage_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_artifact(&dir, "garbage.hasm", b"not a program");
    let out = horsec().arg("exec").arg(&artifact).output().unwrap();
    assert_eq!(out.status.code(), Some(255));
    let text = String::from_utf8_lossy(&out.stderr);
    assert!(text.contains("cannot load program"));
}

#[test]
fn test_codeinfo_human_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_artifact(&dir, "info.hasm", &int_program_blob(1));
    let out = horsec().arg("codeinfo").arg(&artifact).output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("classes"));
    assert!(text.contains("setconst"));

    let out = horsec()
        .arg("codeinfo")
        .arg(&artifact)
        .arg("--json")
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.trim_start().starts_with('{'));
    assert!(text.contains("\"classes\""));
}

#[test]
fn test_get_asm_prints_disassembly() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = write_artifact(&dir, "asm.hasm", &int_program_blob(1));
    let out = horsec().arg("get_asm").arg(&artifact).output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("returnvalue"));
}

#[test]
fn test_compiler_actions_report_missing_frontend() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_artifact(&dir, "x.h64", b"func main { }");
    for action in ["compile", "get_ast", "get_resolved_ast", "get_tokens"] {
        let out = horsec().arg(action).arg(&source).output().unwrap();
        assert_eq!(out.status.code(), Some(255), "{} exit code", action);
        let text = String::from_utf8_lossy(&out.stderr);
        assert!(text.contains("compiler front-end"), "{} message", action);
    }
}

#[test]
fn test_standalone_binary_runs_embedded_program() {
    let dir = tempfile::tempdir().unwrap();
    let standalone = dir.path().join("standalone");
    let mut exe = std::fs::read(env!("CARGO_BIN_EXE_horsec")).unwrap();
    let base_len = exe.len();
    let archive = pak::build_appended_archive(
        base_len,
        pak::PROGRAM_RESOURCE_NAME,
        &int_program_blob(42),
    );
    exe.extend_from_slice(&archive);
    std::fs::write(&standalone, &exe).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&standalone, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let out = Command::new(&standalone).output().unwrap();
    assert_eq!(
        out.status.code(),
        Some(42),
        "embedded program result becomes the exit status"
    );
}
