mod common;

use common::*;
use vm::{disassemble, render_fault};

#[test]
fn render_fault_points_at_the_source_column() {
    let source = "mov ax, 1\n    div ax, 0\n";
    let (mut vm, _) = boot(source);
    let fault = vm.run_until_completion().expect_err("division should fault");

    let rendered = render_fault(&vm, &fault);
    assert!(rendered.starts_with("runtime error: division by zero"));
    assert!(rendered.contains("at ip 1 (line 2)"));
    assert!(rendered.contains("  2 |     div ax, 0"));
    assert!(rendered.contains("    |     ^"));
    assert!(rendered.contains("instruction: div ax, 0"));
    assert!(!rendered.contains("call trace:"));
}

#[test]
fn render_fault_lists_active_functions() {
    let source = "
        call @outer
        exit
    .function outer
    .label outer
        call @inner
        ret
    .function inner
    .label inner
        crash 0
        ret
    .endfunction
    ";
    let (mut vm, _) = boot(source);
    let fault = vm.run_until_completion().expect_err("crash should fault");
    assert_eq!(fault.call_trace, vec![2, 4]);

    let rendered = render_fault(&vm, &fault);
    assert!(rendered.contains("program crashed: crashed"));
    assert!(rendered.contains("call trace:"));
    assert!(rendered.contains("#0 inner (offset 4)"));
    assert!(rendered.contains("#1 outer (offset 2)"));
}

#[test]
fn render_fault_without_debug_info_still_reports_state() {
    let program = Program::new(vec![Instruction::new(Opcode::Return)]);
    let mut vm = Interpreter::new(Settings::default(), program, ExternalFunctionTable::new())
        .expect("interpreter should start");
    let fault = vm.run_until_completion().expect_err("ret should fault");

    let rendered = render_fault(&vm, &fault);
    assert!(rendered.contains("runtime error: stack underflow"));
    assert!(rendered.contains("at ip 0"));
    assert!(rendered.contains("instruction: ret"));
    assert!(rendered.contains(&format!(
        "sp {} bp {}",
        fault.stack_pointer, fault.base_pointer
    )));
}

#[test]
fn fault_display_is_a_single_line() {
    let (mut vm, _) = boot("jmp 40");
    let fault = vm.run_until_completion().expect_err("jump should fault");
    let text = fault.to_string();
    assert!(text.starts_with("invalid jump target 40 at ip 0"));
    assert!(text.ends_with("in `jmp 40`"));
    assert!(!text.contains('\n'));
}

#[test]
fn disassemble_prints_offsets_and_function_headers() {
    let program = assemble(
        "
        push 2
        call @twice
        exit
    .function twice
    .label twice
        add i32 [bp-12], i32 [bp-12]
        ret
        ",
    )
    .expect("program should assemble");

    let listing = disassemble(&program);
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(
        lines,
        vec![
            "0000  push 2",
            "0001  call 3",
            "0002  exit",
            "twice:",
            "0003  add i32 [bp-12], i32 [bp-12]",
            "0004  ret",
        ]
    );
}
