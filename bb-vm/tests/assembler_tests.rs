mod common;

use common::*;
use vm::{AsmParseError, DATA_RESERVED};

fn parse_error(source: &str) -> AsmParseError {
    assemble(source).expect_err("source should be rejected")
}

#[test]
fn operands_cover_every_addressing_mode() {
    let program = assemble(
        "
        mov ax, 42          ; immediate
        mov bx, ax          # register
        mov i32 [100], bx   // absolute
        mov i16 [bp-6], 3i16
        mov u8 [cx+1], 'z'
        ",
    )
    .expect("program should assemble");

    let operands: Vec<_> = program
        .code
        .iter()
        .map(|instruction| instruction.operand1.expect("target"))
        .collect();
    assert_eq!(operands[0], Operand::Register(Register::Ax));
    assert_eq!(
        operands[2],
        Operand::Absolute {
            address: 100,
            ty: ValueType::I32
        }
    );
    assert_eq!(
        operands[3],
        Operand::BasePointer {
            offset: -6,
            ty: ValueType::I16
        }
    );
    assert_eq!(
        operands[4],
        Operand::Indirect {
            register: Register::Cx,
            offset: 1,
            ty: ValueType::U8
        }
    );
    assert_eq!(
        program.code[0].operand2,
        Some(Operand::Immediate(Value::I32(42)))
    );
    assert_eq!(
        program.code[4].operand2,
        Some(Operand::Immediate(Value::Char('z' as u16)))
    );
}

#[test]
fn instruction_display_round_trips_through_the_assembler() {
    let source = "
        push -1i8
        add i32 [sp-8], i32 [sp-4]
        mov u32 [bp+4], 7u32
        cmp ax, 1.5f32
        popto16 char [bx-2]
        push null
    ";
    let program = assemble(source).expect("program should assemble");
    let listing: String = program
        .code
        .iter()
        .map(|instruction| format!("{instruction}\n"))
        .collect();
    let again = assemble(&listing).expect("listing should assemble");
    assert_eq!(again.code, program.code);
}

#[test]
fn labels_and_data_symbols_resolve() {
    let program = assemble(
        "
    .data
        bytes header 1 2 3
        string title \"hi\"
    .code
        jmp @start
    .label start
        push @title
        ",
    )
    .expect("program should assemble");
    assert_eq!(
        program.code[0].operand1,
        Some(Operand::Immediate(Value::I32(1)))
    );
    // the string is realigned to an even address after the three bytes
    let title = DATA_RESERVED as i32 + 4;
    assert_eq!(
        program.code[1].operand1,
        Some(Operand::Immediate(Value::I32(title)))
    );
    assert_eq!(&program.data[..DATA_RESERVED], &[0; DATA_RESERVED]);
    assert_eq!(
        &program.data[title as usize..],
        &[b'h', 0, b'i', 0, 0, 0]
    );
}

#[test]
fn expose_and_function_directives_fill_metadata() {
    let program = assemble(
        "
        exit
    .expose area area_body u8 u8 -> i32
    .function area_body width height
    .label area_body
        ret
        ",
    )
    .expect("program should assemble");

    let area = program.exposed_function("area").expect("area is exposed");
    assert_eq!(area.offset, 1);
    assert_eq!(area.parameters, vec![ValueType::U8, ValueType::U8]);
    assert_eq!(area.returns, Some(ValueType::I32));

    let debug = program.debug.as_ref().expect("debug info");
    let function = debug.function_for(1).expect("function range");
    assert_eq!(function.name, "area_body");
    let args: Vec<_> = function.args.iter().map(|arg| arg.name.as_str()).collect();
    assert_eq!(args, vec!["width", "height"]);
    assert_eq!(debug.line_for_offset(0), Some(2));
    assert_eq!(debug.line_for_offset(1), Some(6));
}

#[test]
fn callext_accepts_names_and_ids() {
    let program = assemble(
        "
    .extern print_int 1
        callext print_int
        callext 7
        ",
    )
    .expect("program should assemble");
    assert_eq!(
        program.code[0].operand1,
        Some(Operand::Immediate(Value::I32(1)))
    );
    assert_eq!(
        program.code[1].operand1,
        Some(Operand::Immediate(Value::I32(7)))
    );
}

#[test]
fn errors_carry_line_numbers() {
    let err = parse_error("nop\nfrobnicate ax\n");
    assert_eq!(err.line, 2);
    assert!(err.message.contains("unknown opcode 'frobnicate'"));

    let err = parse_error("start:\n");
    assert!(err.message.contains(".label NAME"));

    let err = parse_error("nop\nadd ax\n");
    assert_eq!(err.line, 2);
    assert!(err.message.contains("takes 2 operand(s), found 1"));

    let err = parse_error("mov 3, ax\n");
    assert!(err.message.contains("malformed instruction"));

    let err = parse_error(".data\nstring s \"open\n");
    assert!(err.message.contains("unterminated string literal"));

    let err = parse_error(".bogus\n");
    assert!(err.message.contains("unknown directive '.bogus'"));

    let err = parse_error("push 300u8\n");
    assert!(err.message.contains("out of range for u8"));

    let err = parse_error(".label a\n.label a\n");
    assert_eq!(err.line, 2);
    assert!(err.message.contains("duplicate label 'a'"));

    let err = parse_error("jmp @nowhere\n");
    assert_eq!(err.line, 0);
    assert!(err.message.contains("unknown label 'nowhere'"));
    assert_eq!(
        err.to_string(),
        "line 0: assembler error: unknown label 'nowhere'"
    );
}
