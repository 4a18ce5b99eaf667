use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use host::{
    END_OF_INPUT, FUNCTIONS, RunOptions, ScriptedInput, call_exposed, console_table, run_program,
};
use vm::{Interpreter, Register, Settings, Value, VmError, assemble_with_externs};

type Captured = Rc<RefCell<Vec<u8>>>;

fn boot(source: &str) -> (Interpreter, Captured) {
    let externs: Vec<(&str, i32)> = FUNCTIONS
        .iter()
        .map(|function| (function.name, function.id))
        .collect();
    let program = assemble_with_externs(source, &externs).expect("program should assemble");
    let captured = Captured::default();
    let vm = Interpreter::new(
        Settings::default(),
        program,
        console_table(Rc::clone(&captured)),
    )
    .expect("interpreter should start");
    (vm, captured)
}

fn text(captured: &Captured) -> String {
    String::from_utf8(captured.borrow().clone()).expect("utf-8 output")
}

fn fast() -> RunOptions {
    RunOptions {
        tick_interval: Duration::ZERO,
    }
}

#[test]
fn echo_reads_scripted_input_until_newline() {
    let (mut vm, captured) = boot(
        "
    .label loop
        callext read_char
        popto16 ax
        cmp ax, 10u16
        je @done
        push ax
        callext print_char
        jmp @loop
    .label done
        nop
        ",
    );
    let mut input = ScriptedInput::new("hi!\nignored");
    let report = run_program(&mut vm, &mut input, &fast()).expect("program should run");
    assert_eq!(text(&captured), "hi!");
    assert_eq!(report.inputs, 4);
}

#[test]
fn exhausted_input_yields_end_marker() {
    let (mut vm, _) = boot(
        "
        callext read_char
        popto16 ax
        ",
    );
    let mut input = ScriptedInput::default();
    run_program(&mut vm, &mut input, &fast()).expect("program should run");
    assert_eq!(vm.register(Register::Ax), Value::Char(END_OF_INPUT));
}

#[test]
fn console_prints_numbers_and_strings() {
    let (mut vm, captured) = boot(
        "
    .data
        string label \"total=\"
    .code
        push @label
        callext print_str
        push -12
        callext print_int
        push '.'
        callext print_char
        ",
    );
    run_program(&mut vm, &mut ScriptedInput::default(), &fast()).expect("program should run");
    assert_eq!(text(&captured), "total=-12.");
}

#[test]
fn heap_externs_allocate_and_free() {
    let (mut vm, captured) = boot(
        "
        push 8
        callext alloc
        popto32 bx
        mov i32 [bx], 77
        push i32 [bx]
        callext print_int
        push bx
        callext free
        push bx
        callext free
        ",
    );
    let fault = run_program(&mut vm, &mut ScriptedInput::default(), &fast())
        .expect_err("second free should fault");
    assert_eq!(text(&captured), "77");
    assert!(matches!(fault.error, VmError::InvalidFree(_)));
}

#[test]
fn sleep_spends_ticks() {
    let (mut vm, captured) = boot(
        "
        push 3
        callext sleep
        push 1
        callext print_int
        ",
    );
    let report =
        run_program(&mut vm, &mut ScriptedInput::default(), &fast()).expect("program should run");
    assert_eq!(text(&captured), "1");
    assert!(report.ticks >= 5);
}

#[test]
fn faults_surface_from_the_run_loop() {
    let (mut vm, _) = boot(
        "
        mov ax, 1
        div ax, 0
        ",
    );
    let fault = run_program(&mut vm, &mut ScriptedInput::default(), &fast())
        .expect_err("division should fault");
    assert_eq!(fault.error, VmError::DivisionByZero);
    assert!(vm.is_done());
}

#[test]
fn exposed_functions_run_after_main() {
    let (mut vm, captured) = boot(
        "
    .expose square sq i32 -> i32
        push 1
        callext print_int
        jmp @end
    .label sq
        mov ax, i32 [bp-12]
        mul ax, ax
        mov i32 [bp-16], ax
        ret
    .label end
        nop
        ",
    );
    let mut input = ScriptedInput::default();
    run_program(&mut vm, &mut input, &fast()).expect("main should run");
    assert_eq!(text(&captured), "1");

    let result = call_exposed(&mut vm, "square", &[Value::I32(7)], &mut input, &fast())
        .expect("call should complete");
    assert_eq!(result, Some(Value::I32(49)));

    let err = call_exposed(&mut vm, "cube", &[], &mut input, &fast()).expect_err("unknown");
    assert_eq!(err, VmError::UnknownExposedFunction("cube".to_string()));
}
