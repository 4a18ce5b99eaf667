use std::collections::HashMap;

use crate::bytecode::{ExposedFunction, Instruction, Opcode, Operand, Program, Register};
use crate::debug_info::DebugInfoBuilder;
use crate::value::{Value, ValueType};

/// Static data starts with this many zero bytes so no symbol lives at
/// address 0, which programs use as the null pointer.
pub const DATA_RESERVED: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    DuplicateLabel(String),
    UnknownLabel(String),
    DuplicateExport(String),
}

impl std::fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblerError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            AssemblerError::UnknownLabel(name) => write!(f, "unknown label '{name}'"),
            AssemblerError::DuplicateExport(name) => write!(f, "'{name}' is exposed twice"),
        }
    }
}

impl std::error::Error for AssemblerError {}

/// Which operand of an instruction a label patches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSlot {
    First,
    Second,
}

struct Fixup {
    at: usize,
    slot: OperandSlot,
    label: String,
}

struct PendingExport {
    name: String,
    label: String,
    parameters: Vec<ValueType>,
    returns: Option<ValueType>,
}

pub struct BytecodeBuilder {
    code: Vec<Instruction>,
    data: Vec<u8>,
    labels: HashMap<String, u32>,
    fixups: Vec<Fixup>,
    exports: Vec<PendingExport>,
    debug: DebugInfoBuilder,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            data: vec![0; DATA_RESERVED],
            labels: HashMap::new(),
            fixups: Vec::new(),
            exports: Vec::new(),
            debug: DebugInfoBuilder::new(),
        }
    }

    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    fn define(&mut self, name: &str, value: u32) -> Result<(), AssemblerError> {
        if self.labels.contains_key(name) {
            return Err(AssemblerError::DuplicateLabel(name.to_string()));
        }
        self.labels.insert(name.to_string(), value);
        Ok(())
    }

    /// Names the next instruction.
    pub fn label(&mut self, name: &str) -> Result<(), AssemblerError> {
        let pos = self.position();
        self.define(name, pos)
    }

    /// Appends a NUL-terminated UTF-16 string and names its address.
    pub fn data_utf16(&mut self, name: &str, text: &str) -> Result<u32, AssemblerError> {
        if self.data.len() % 2 != 0 {
            self.data.push(0);
        }
        let address = self.data.len() as u32;
        self.define(name, address)?;
        for unit in text.encode_utf16().chain(std::iter::once(0)) {
            self.data.extend_from_slice(&unit.to_le_bytes());
        }
        Ok(address)
    }

    pub fn data_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<u32, AssemblerError> {
        let address = self.data.len() as u32;
        self.define(name, address)?;
        self.data.extend_from_slice(bytes);
        Ok(address)
    }

    pub fn symbol(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    pub fn set_source(&mut self, source: String) {
        self.debug.set_source(source);
    }

    pub fn mark_line(&mut self, line: u32) {
        let offset = self.position();
        self.debug.mark_line(offset, line);
    }

    pub fn mark_location(&mut self, line: u32, column: u32) {
        let offset = self.position();
        self.debug.mark_location(offset, line, column);
    }

    pub fn begin_function(&mut self, name: String, args: Vec<String>) {
        let start = self.position();
        self.debug.begin_function(name, start, args);
    }

    pub fn end_function(&mut self) {
        let end = self.position();
        self.debug.end_function(end);
    }

    /// Makes the code at `label` callable from the host as `name`.
    pub fn expose(
        &mut self,
        name: &str,
        label: &str,
        parameters: Vec<ValueType>,
        returns: Option<ValueType>,
    ) {
        self.exports.push(PendingExport {
            name: name.to_string(),
            label: label.to_string(),
            parameters,
            returns,
        });
    }

    pub fn emit(&mut self, instruction: Instruction) -> u32 {
        let at = self.position();
        self.code.push(instruction);
        at
    }

    /// Emits `instruction` with the operand in `slot` replaced by the
    /// address of `label` once it is known.
    pub fn emit_with_label(
        &mut self,
        mut instruction: Instruction,
        slot: OperandSlot,
        label: &str,
    ) -> u32 {
        let placeholder = Some(Operand::Immediate(Value::I32(0)));
        match slot {
            OperandSlot::First => instruction.operand1 = placeholder,
            OperandSlot::Second => instruction.operand2 = placeholder,
        }
        let at = self.emit(instruction);
        self.fixups.push(Fixup {
            at: at as usize,
            slot,
            label: label.to_string(),
        });
        at
    }

    pub fn nop(&mut self) {
        self.emit(Instruction::new(Opcode::Nop));
    }

    pub fn exit(&mut self) {
        self.emit(Instruction::new(Opcode::Exit));
    }

    pub fn ret(&mut self) {
        self.emit(Instruction::new(Opcode::Return));
    }

    pub fn push(&mut self, operand: Operand) {
        self.emit(Instruction::unary(Opcode::Push, operand));
    }

    pub fn push_value(&mut self, value: impl Into<Value>) {
        self.push(Operand::Immediate(value.into()));
    }

    pub fn pop(&mut self, width: usize) {
        let opcode = match width {
            1 => Opcode::Pop8,
            2 => Opcode::Pop16,
            8 => Opcode::Pop64,
            _ => Opcode::Pop32,
        };
        self.emit(Instruction::new(opcode));
    }

    pub fn mov(&mut self, target: Operand, source: Operand) {
        self.emit(Instruction::binary(Opcode::Move, target, source));
    }

    pub fn op(&mut self, opcode: Opcode, target: Operand, source: Operand) {
        self.emit(Instruction::binary(opcode, target, source));
    }

    pub fn cmp(&mut self, lhs: Operand, rhs: Operand) {
        self.emit(Instruction::binary(Opcode::Compare, lhs, rhs));
    }

    pub fn jump(&mut self, opcode: Opcode, label: &str) {
        self.emit_with_label(Instruction::new(opcode), OperandSlot::First, label);
    }

    pub fn call(&mut self, label: &str) {
        self.jump(Opcode::Call, label);
    }

    pub fn callext(&mut self, id: i32) {
        self.emit(Instruction::unary(
            Opcode::CallExternal,
            Operand::Immediate(Value::I32(id)),
        ));
    }

    pub fn finish(self) -> Result<Program, AssemblerError> {
        let Self {
            mut code,
            data,
            labels,
            fixups,
            exports,
            debug,
        } = self;
        let resolve = |label: &str| {
            labels
                .get(label)
                .copied()
                .ok_or_else(|| AssemblerError::UnknownLabel(label.to_string()))
        };

        for fixup in fixups {
            let target = resolve(&fixup.label)?;
            let operand = Some(Operand::Immediate(Value::I32(target as i32)));
            let instruction = &mut code[fixup.at];
            match fixup.slot {
                OperandSlot::First => instruction.operand1 = operand,
                OperandSlot::Second => instruction.operand2 = operand,
            }
        }

        let mut exposed: Vec<ExposedFunction> = Vec::with_capacity(exports.len());
        for export in exports {
            if exposed.iter().any(|function| function.name == export.name) {
                return Err(AssemblerError::DuplicateExport(export.name));
            }
            exposed.push(ExposedFunction {
                offset: resolve(&export.label)? as usize,
                name: export.name,
                parameters: export.parameters,
                returns: export.returns,
            });
        }

        let code_len = code.len() as u32;
        Ok(Program {
            code,
            data,
            exposed,
            debug: debug.finish(code_len),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for AsmParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmParseError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AsmSection {
    Data,
    Code,
}

enum ParsedOperand {
    Ready(Operand),
    Label(String),
}

fn error(line: usize, message: impl Into<String>) -> AsmParseError {
    AsmParseError {
        line,
        message: message.into(),
    }
}

pub fn assemble(source: &str) -> Result<Program, AsmParseError> {
    assemble_with_externs(source, &[])
}

/// Like `assemble`, with `externs` declared up front as if by `.extern`.
pub fn assemble_with_externs(
    source: &str,
    externs: &[(&str, i32)],
) -> Result<Program, AsmParseError> {
    let mut builder = BytecodeBuilder::new();
    builder.set_source(source.to_string());
    let mut externs: HashMap<String, i32> = externs
        .iter()
        .map(|(name, id)| (name.to_string(), *id))
        .collect();
    let mut section = AsmSection::Code;

    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = strip_comments(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line.ends_with(':') {
            return Err(error(line_no, "label definitions must use '.label NAME'"));
        }

        if let Some(rest) = line.strip_prefix('.') {
            let mut parts = rest.split_whitespace();
            let directive = parts.next().unwrap_or("").to_ascii_lowercase();
            match directive.as_str() {
                "data" => section = AsmSection::Data,
                "code" => section = AsmSection::Code,
                "label" => {
                    let name = next_token(&mut parts, line_no, "label name")?;
                    if section != AsmSection::Code {
                        return Err(error(line_no, "labels are only valid in code section"));
                    }
                    builder
                        .label(name)
                        .map_err(|err| error(line_no, err.to_string()))?;
                }
                "extern" => {
                    let name = next_token(&mut parts, line_no, "extern name")?;
                    let id = next_token(&mut parts, line_no, "extern id")?;
                    let id = parse_integer(id)
                        .and_then(|id| i32::try_from(id).ok())
                        .ok_or_else(|| error(line_no, format!("invalid extern id '{id}'")))?;
                    if let Some(previous) = externs.insert(name.to_string(), id)
                        && previous != id
                    {
                        return Err(error(
                            line_no,
                            format!("extern '{name}' already has id {previous}"),
                        ));
                    }
                }
                "expose" => {
                    let name = next_token(&mut parts, line_no, "exposed name")?;
                    let label = next_token(&mut parts, line_no, "exposed label")?;
                    let mut parameters = Vec::new();
                    let mut returns = None;
                    while let Some(token) = parts.next() {
                        if token == "->" {
                            let ty = next_token(&mut parts, line_no, "return type")?;
                            returns = Some(parse_type(ty, line_no)?);
                            break;
                        }
                        parameters.push(parse_type(token, line_no)?);
                    }
                    builder.expose(name, label, parameters, returns);
                }
                "function" => {
                    let name = next_token(&mut parts, line_no, "function name")?;
                    let args = parts.by_ref().map(str::to_string).collect();
                    builder.begin_function(name.to_string(), args);
                }
                "endfunction" => builder.end_function(),
                other => {
                    return Err(error(line_no, format!("unknown directive '.{other}'")));
                }
            }

            if parts.next().is_some() {
                return Err(error(line_no, "unexpected extra tokens"));
            }
            continue;
        }

        let mut parts = line.split_whitespace();
        let op = next_token(&mut parts, line_no, "opcode")?.to_ascii_lowercase();

        if section == AsmSection::Data {
            let name = next_token(&mut parts, line_no, "data name")?;
            match op.as_str() {
                "string" => {
                    let rest = rest_after_n_tokens(line, 2).unwrap_or("");
                    if rest.is_empty() {
                        return Err(error(line_no, "missing string literal"));
                    }
                    let text = parse_string_literal(rest, line_no)?;
                    builder
                        .data_utf16(name, &text)
                        .map_err(|err| error(line_no, err.to_string()))?;
                }
                "bytes" => {
                    let bytes = parts
                        .map(|token| {
                            parse_integer(token)
                                .and_then(|value| u8::try_from(value).ok())
                                .ok_or_else(|| error(line_no, format!("invalid byte '{token}'")))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    builder
                        .data_bytes(name, &bytes)
                        .map_err(|err| error(line_no, err.to_string()))?;
                }
                other => {
                    return Err(error(
                        line_no,
                        format!("unexpected item '{other}' in data section"),
                    ));
                }
            }
            continue;
        }

        let column = raw_line.len() - raw_line.trim_start().len() + 1;
        builder.mark_location(line_no as u32, column as u32);

        let opcode = Opcode::parse_mnemonic(op.as_str())
            .ok_or_else(|| error(line_no, format!("unknown opcode '{op}'")))?;
        let rest = rest_after_n_tokens(line, 1).unwrap_or("");
        let operands = split_operands(rest)
            .into_iter()
            .map(|token| parse_operand(token, line_no, &externs))
            .collect::<Result<Vec<_>, _>>()?;
        if operands.len() != opcode.operand_count() {
            return Err(error(
                line_no,
                format!(
                    "{op} takes {} operand(s), found {}",
                    opcode.operand_count(),
                    operands.len()
                ),
            ));
        }

        let mut instruction = Instruction::new(opcode);
        let mut label = None;
        for (index, operand) in operands.into_iter().enumerate() {
            let slot = if index == 0 {
                OperandSlot::First
            } else {
                OperandSlot::Second
            };
            let operand = match operand {
                ParsedOperand::Ready(operand) => operand,
                ParsedOperand::Label(name) => {
                    if label.is_some() {
                        return Err(error(line_no, "only one label operand per instruction"));
                    }
                    label = Some((slot, name));
                    Operand::Immediate(Value::I32(0))
                }
            };
            match slot {
                OperandSlot::First => instruction.operand1 = Some(operand),
                OperandSlot::Second => instruction.operand2 = Some(operand),
            }
        }
        instruction
            .validate()
            .map_err(|err| error(line_no, err.to_string()))?;
        match label {
            Some((slot, name)) => builder.emit_with_label(instruction, slot, &name),
            None => builder.emit(instruction),
        };
    }

    builder.finish().map_err(|err| error(0, format!("assembler error: {err}")))
}

/// Cuts `;`, `#` and `//` comments that sit outside quotes.
fn strip_comments(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = line.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            ';' | '#' => return &line[..idx],
            '/' if chars.peek().map(|(_, next)| *next) == Some('/') => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn split_operands(text: &str) -> Vec<&str> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            ',' => {
                out.push(text[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    out.push(text[start..].trim());
    out
}

fn next_token<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    line_no: usize,
    what: &str,
) -> Result<&'a str, AsmParseError> {
    parts
        .next()
        .ok_or_else(|| error(line_no, format!("missing {what}")))
}

fn parse_type(token: &str, line_no: usize) -> Result<ValueType, AsmParseError> {
    ValueType::parse_name(token).ok_or_else(|| error(line_no, format!("unknown type '{token}'")))
}

fn parse_operand(
    token: &str,
    line_no: usize,
    externs: &HashMap<String, i32>,
) -> Result<ParsedOperand, AsmParseError> {
    if token.is_empty() {
        return Err(error(line_no, "empty operand"));
    }
    if let Some(label) = token.strip_prefix('@') {
        return Ok(ParsedOperand::Label(label.to_string()));
    }
    if token.ends_with(']') {
        return parse_memory_operand(token, line_no).map(ParsedOperand::Ready);
    }
    if let Some(register) = Register::parse_name(token) {
        return Ok(ParsedOperand::Ready(Operand::Register(register)));
    }
    if let Some(&id) = externs.get(token) {
        return Ok(ParsedOperand::Ready(Operand::Immediate(Value::I32(id))));
    }
    parse_literal(token, line_no).map(|value| ParsedOperand::Ready(Operand::Immediate(value)))
}

/// `TYPE [BASE]`, `TYPE [BASE+N]` or `TYPE [BASE-N]`, where BASE is an
/// address, `bp`, or a register holding a pointer.
fn parse_memory_operand(token: &str, line_no: usize) -> Result<Operand, AsmParseError> {
    let (ty, inner) = token
        .split_once('[')
        .ok_or_else(|| error(line_no, format!("invalid memory operand '{token}'")))?;
    let ty = ty.trim();
    if ty.is_empty() {
        return Err(error(line_no, format!("memory operand '{token}' needs a type")));
    }
    let ty = parse_type(ty, line_no)?;
    let inner = inner.trim_end_matches(']').trim();
    let split = inner
        .char_indices()
        .skip(1)
        .find(|(_, ch)| *ch == '+' || *ch == '-')
        .map(|(idx, _)| idx);
    let (base, offset) = match split {
        Some(idx) => {
            let offset = parse_integer(&inner[idx..].replace(' ', "").replacen('+', "", 1))
                .and_then(|offset| i32::try_from(offset).ok())
                .ok_or_else(|| error(line_no, format!("invalid offset in '{token}'")))?;
            (inner[..idx].trim(), offset)
        }
        None => (inner, 0),
    };

    if base == "bp" {
        return Ok(Operand::BasePointer { offset, ty });
    }
    if let Some(register) = Register::parse_name(base) {
        return Ok(Operand::Indirect {
            register,
            offset,
            ty,
        });
    }
    let address = parse_integer(base)
        .and_then(|address| address.checked_add(offset as i64))
        .and_then(|address| u32::try_from(address).ok())
        .ok_or_else(|| error(line_no, format!("invalid address in '{token}'")))?;
    Ok(Operand::Absolute { address, ty })
}

fn parse_integer(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn typed_integer(value: i64, ty: ValueType) -> Option<Value> {
    match ty {
        ValueType::U8 => u8::try_from(value).ok().map(Value::U8),
        ValueType::I8 => i8::try_from(value).ok().map(Value::I8),
        ValueType::Char => u16::try_from(value).ok().map(Value::Char),
        ValueType::I16 => i16::try_from(value).ok().map(Value::I16),
        ValueType::U32 => u32::try_from(value).ok().map(Value::U32),
        ValueType::I32 => i32::try_from(value).ok().map(Value::I32),
        ValueType::Null | ValueType::F32 => None,
    }
}

const SUFFIXES: [(&str, ValueType); 7] = [
    ("u16", ValueType::Char),
    ("i16", ValueType::I16),
    ("u32", ValueType::U32),
    ("i32", ValueType::I32),
    ("f32", ValueType::F32),
    ("u8", ValueType::U8),
    ("i8", ValueType::I8),
];

fn parse_literal(token: &str, line_no: usize) -> Result<Value, AsmParseError> {
    if token.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if token.starts_with('\'') {
        return parse_char_literal(token, line_no);
    }
    let invalid = || error(line_no, format!("invalid literal '{token}'"));
    let is_hex = token.trim_start_matches('-').starts_with("0x");
    let (digits, ty) = SUFFIXES
        .iter()
        .filter(|(_, ty)| !(is_hex && *ty == ValueType::F32))
        .find_map(|(suffix, ty)| token.strip_suffix(suffix).map(|digits| (digits, *ty)))
        .unwrap_or((token, ValueType::I32));

    if ty == ValueType::F32 {
        return digits.parse::<f32>().map(Value::F32).map_err(|_| invalid());
    }
    match parse_integer(digits) {
        Some(value) => typed_integer(value, ty).ok_or_else(|| {
            error(
                line_no,
                format!("literal '{token}' is out of range for {ty}"),
            )
        }),
        None if digits.len() == token.len() && !is_hex => {
            // unsuffixed decimals are floats
            digits.parse::<f32>().map(Value::F32).map_err(|_| invalid())
        }
        None => Err(invalid()),
    }
}

fn unescape(ch: char, line_no: usize) -> Result<char, AsmParseError> {
    match ch {
        'n' => Ok('\n'),
        'r' => Ok('\r'),
        't' => Ok('\t'),
        '\\' => Ok('\\'),
        '"' => Ok('"'),
        '\'' => Ok('\''),
        '0' => Ok('\0'),
        other => Err(error(line_no, format!("invalid escape '\\{other}'"))),
    }
}

fn parse_char_literal(token: &str, line_no: usize) -> Result<Value, AsmParseError> {
    let inner = token
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .ok_or_else(|| error(line_no, format!("unterminated char literal {token}")))?;
    let mut chars = inner.chars();
    let ch = match chars.next() {
        Some('\\') => unescape(
            chars
                .next()
                .ok_or_else(|| error(line_no, "incomplete escape"))?,
            line_no,
        )?,
        Some(ch) => ch,
        None => return Err(error(line_no, "empty char literal")),
    };
    if chars.next().is_some() {
        return Err(error(line_no, format!("char literal {token} holds more than one char")));
    }
    let mut units = [0u16; 2];
    match ch.encode_utf16(&mut units) {
        [unit] => Ok(Value::Char(*unit)),
        _ => Err(error(
            line_no,
            format!("char literal {token} does not fit one UTF-16 unit"),
        )),
    }
}

fn parse_string_literal(token: &str, line_no: usize) -> Result<String, AsmParseError> {
    let mut chars = token.char_indices();
    if chars.next().map(|(_, ch)| ch) != Some('"') {
        return Err(error(line_no, "string literal must start with '\"'"));
    }

    let mut out = String::new();
    let mut escaped = false;
    let mut end_idx = None;

    for (idx, ch) in chars {
        if escaped {
            out.push(unescape(ch, line_no)?);
            escaped = false;
            continue;
        }

        match ch {
            '\\' => escaped = true,
            '"' => {
                end_idx = Some(idx);
                break;
            }
            other => out.push(other),
        }
    }

    let Some(end_idx) = end_idx else {
        return Err(error(line_no, "unterminated string literal"));
    };

    if token[end_idx + 1..].trim().is_empty() {
        Ok(out)
    } else {
        Err(error(
            line_no,
            "unexpected trailing characters after string literal",
        ))
    }
}

fn rest_after_n_tokens(line: &str, n: usize) -> Option<&str> {
    let mut count = 0;
    let mut in_token = false;
    let mut end_idx = 0;
    for (idx, ch) in line.char_indices() {
        if ch.is_whitespace() {
            if in_token {
                in_token = false;
                count += 1;
                if count == n {
                    end_idx = idx;
                    break;
                }
            }
        } else if !in_token {
            in_token = true;
        }
    }

    if in_token {
        count += 1;
        end_idx = line.len();
    }

    if count < n {
        None
    } else {
        Some(line[end_idx..].trim_start())
    }
}
