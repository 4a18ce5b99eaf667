use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vm::{Interpreter, RuntimeFault, Value, ValueType, VmError};

use crate::logging::{category_call, category_input, category_program};

/// Where answers to `read_char` come from.
pub trait InputSource {
    /// Next character, or `None` once input is exhausted.
    fn read_char(&mut self) -> Option<char>;
}

/// Feeds characters from a fixed string. Useful for scripted runs and tests.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    pending: VecDeque<char>,
}

impl ScriptedInput {
    pub fn new(text: &str) -> Self {
        Self {
            pending: text.chars().collect(),
        }
    }
}

impl InputSource for ScriptedInput {
    fn read_char(&mut self) -> Option<char> {
        self.pending.pop_front()
    }
}

/// Buffers whole lines from `read_line` and hands them out one character at
/// a time, newline included.
pub struct LineInput<F> {
    read_line: F,
    buffer: VecDeque<char>,
    closed: bool,
}

impl<F> LineInput<F>
where
    F: FnMut() -> Option<String>,
{
    pub fn new(read_line: F) -> Self {
        Self {
            read_line,
            buffer: VecDeque::new(),
            closed: false,
        }
    }
}

impl<F> InputSource for LineInput<F>
where
    F: FnMut() -> Option<String>,
{
    fn read_char(&mut self) -> Option<char> {
        while self.buffer.is_empty() && !self.closed {
            match (self.read_line)() {
                Some(line) => {
                    self.buffer.extend(line.chars());
                    self.buffer.push_back('\n');
                }
                None => self.closed = true,
            }
        }
        self.buffer.pop_front()
    }
}

/// Value handed to `read_char` after input is exhausted.
pub const END_OF_INPUT: u16 = 0xFFFF;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    /// Wall-clock length of one tick while the program sleeps.
    pub tick_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub instructions: u64,
    pub ticks: u64,
    pub inputs: u64,
    pub elapsed: Duration,
}

/// Ticks `vm` until it finishes, answering input requests from `input` and
/// turning delays into real waits.
pub fn run_program(
    vm: &mut Interpreter,
    input: &mut dyn InputSource,
    options: &RunOptions,
) -> Result<RunReport, RuntimeFault> {
    let started = Instant::now();
    let mut ticks = 0u64;
    let mut inputs = 0u64;
    info!("{} started", category_program());

    loop {
        if vm.delay_remaining() > 0 && !options.tick_interval.is_zero() {
            std::thread::sleep(options.tick_interval);
        }
        let more = vm.tick()?;
        ticks += 1;
        if !more {
            break;
        }
        if let Some(request) = vm.pending_input().cloned() {
            let answer = answer_for(request.returns, input.read_char());
            debug!(
                "{} request {} answered with {:?}",
                category_input(),
                request.function_id,
                answer
            );
            inputs += 1;
            if let Err(error) = vm.complete_pending(answer) {
                warn!("{} could not deliver input: {error}", category_input());
            }
        }
    }

    let report = RunReport {
        instructions: vm.instructions_executed(),
        ticks,
        inputs,
        elapsed: started.elapsed(),
    };
    info!(
        instructions = report.instructions,
        ticks = report.ticks,
        "{} finished",
        category_program()
    );
    Ok(report)
}

fn answer_for(returns: Option<ValueType>, ch: Option<char>) -> Option<Value> {
    let ty = returns?;
    let value = match ch {
        Some(ch) => {
            let mut units = [0u16; 2];
            // characters outside the basic plane have no single-unit form
            match ch.encode_utf16(&mut units) {
                [unit] => Value::Char(*unit),
                _ => Value::Char(char::REPLACEMENT_CHARACTER as u16),
            }
        }
        None => Value::Char(END_OF_INPUT),
    };
    Some(value.try_cast(ty).unwrap_or_else(|| value.wrapping_cast(ty)))
}

/// Runs an exposed function to completion after the main program finished.
pub fn call_exposed(
    vm: &mut Interpreter,
    name: &str,
    args: &[Value],
    input: &mut dyn InputSource,
    options: &RunOptions,
) -> Result<Option<Value>, VmError> {
    let call = vm.call(name, args)?;
    info!("{} {name}({} args)", category_call(), args.len());
    run_program(vm, input, options).map_err(|fault| fault.error)?;
    if !call.is_completed() {
        return Err(VmError::Internal(format!(
            "program ended before '{name}' returned"
        )));
    }
    call.return_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_input_appends_newlines_and_stops_at_eof() {
        let mut lines = vec!["ab".to_string()].into_iter();
        let mut input = LineInput::new(move || lines.next());
        assert_eq!(input.read_char(), Some('a'));
        assert_eq!(input.read_char(), Some('b'));
        assert_eq!(input.read_char(), Some('\n'));
        assert_eq!(input.read_char(), None);
        assert_eq!(input.read_char(), None);
    }

    #[test]
    fn answers_follow_the_declared_type() {
        assert_eq!(
            answer_for(Some(ValueType::Char), Some('x')),
            Some(Value::Char('x' as u16))
        );
        assert_eq!(
            answer_for(Some(ValueType::Char), None),
            Some(Value::Char(END_OF_INPUT))
        );
        assert_eq!(
            answer_for(Some(ValueType::I32), Some('A')),
            Some(Value::I32(65))
        );
        assert_eq!(answer_for(None, Some('A')), None);
    }
}
