use crate::bytecode::Program;

use super::{Interpreter, RuntimeFault};

pub fn render_fault(vm: &Interpreter, fault: &RuntimeFault) -> String {
    let mut out = format!("runtime error: {}", fault.error);
    let ip = fault.ip;
    let debug = vm.debug_info();
    if let Some(debug) = debug
        && let Some(location) = debug.location_for(ip)
    {
        let line = location.line;
        out.push_str(&format!("\nat ip {ip} (line {line})"));
        if let Some(line_text) = debug.source_line(line) {
            let pad = " ".repeat(location.column.saturating_sub(1) as usize);
            out.push_str(&format!("\n{line:>3} | {line_text}\n    | {pad}^"));
        }
    } else {
        out.push_str(&format!("\nat ip {ip}"));
    }
    if let Some(instruction) = &fault.instruction {
        out.push_str(&format!("\ninstruction: {instruction}"));
    }
    out.push_str(&format!(
        "\nsp {} bp {}",
        fault.stack_pointer, fault.base_pointer
    ));
    if !fault.call_trace.is_empty() {
        out.push_str("\ncall trace:");
        for (depth, entry) in fault.call_trace.iter().rev().enumerate() {
            match debug.and_then(|debug| debug.function_for(*entry)) {
                Some(function) => {
                    out.push_str(&format!("\n  #{depth} {} (offset {entry})", function.name))
                }
                None => out.push_str(&format!("\n  #{depth} offset {entry}")),
            }
        }
    }
    out
}

/// One instruction per line, prefixed by its offset, with function names
/// from the debug info as headers.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    for (offset, instruction) in program.code.iter().enumerate() {
        if let Some(debug) = &program.debug
            && let Some(function) = debug
                .functions
                .iter()
                .find(|function| function.start as usize == offset)
        {
            out.push_str(&format!("{}:\n", function.name));
        }
        out.push_str(&format!("{offset:04}  {instruction}\n"));
    }
    out
}
