use std::cell::RefCell;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use host::{
    FUNCTIONS, LineInput, RunOptions, call_exposed, category_fault, console_table, init_logging,
    load_settings, outcome_label, run_program,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::{error, info};
use vm::{ExecutionState, Interpreter, Value, assemble_with_externs, disassemble, render_fault};

#[derive(Debug, Clone, PartialEq, Default)]
struct CliConfig {
    source: Option<PathBuf>,
    config: Option<PathBuf>,
    disasm: bool,
    no_prelude: bool,
    tick_ms: Option<u64>,
    call: Option<(String, Vec<Value>)>,
    help: bool,
}

fn main() -> ExitCode {
    if let Err(err) = init_logging() {
        eprintln!("logging disabled: {err}");
    }
    match run() {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(ExitCode::SUCCESS);
    }
    let source_path = cli
        .source
        .as_ref()
        .ok_or_else(|| io::Error::other("missing source path (see --help)"))?;

    let text = std::fs::read_to_string(source_path)?;
    let externs: Vec<(&str, i32)> = if cli.no_prelude {
        Vec::new()
    } else {
        FUNCTIONS
            .iter()
            .map(|function| (function.name, function.id))
            .collect()
    };
    let program = assemble_with_externs(&text, &externs)?;
    if cli.disasm {
        print!("{}", disassemble(&program));
        return Ok(ExitCode::SUCCESS);
    }

    let settings = load_settings(cli.config.as_deref())?;
    info!(
        heap = settings.heap_size,
        stack = settings.stack_size,
        "loaded {}",
        source_path.display()
    );
    let stdout = Rc::new(RefCell::new(io::stdout()));
    let mut vm = Interpreter::new(settings, program, console_table(stdout))?;

    let mut editor = DefaultEditor::new()?;
    let mut input = LineInput::new(move || match editor.readline("") {
        Ok(line) => Some(line),
        Err(ReadlineError::Eof | ReadlineError::Interrupted) => None,
        Err(err) => {
            error!("input error: {err}");
            None
        }
    });
    let options = RunOptions {
        tick_interval: cli
            .tick_ms
            .map(Duration::from_millis)
            .unwrap_or(RunOptions::default().tick_interval),
    };

    if let Err(fault) = run_program(&mut vm, &mut input, &options) {
        eprintln!("{}", render_fault(&vm, &fault));
        error!("{} run {}", category_fault(), outcome_label(false));
        return Ok(ExitCode::FAILURE);
    }

    if let Some((name, call_args)) = &cli.call {
        match call_exposed(&mut vm, name, call_args, &mut input, &options) {
            Ok(Some(value)) => println!("{value}"),
            Ok(None) => {}
            Err(err) => {
                if let ExecutionState::Faulted(fault) = vm.state() {
                    eprintln!("{}", render_fault(&vm, fault));
                } else {
                    eprintln!("{err}");
                }
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    info!("run {}", outcome_label(true));
    Ok(ExitCode::SUCCESS)
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--disasm" => {
                cfg.disasm = true;
                index += 1;
            }
            "--no-prelude" => {
                cfg.no_prelude = true;
                index += 1;
            }
            "--config" => {
                let path = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                cfg.config = Some(PathBuf::from(path));
                index += 2;
            }
            "--tick-ms" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --tick-ms".to_string())?;
                let value = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --tick-ms value '{raw}'"))?;
                cfg.tick_ms = Some(value);
                index += 2;
            }
            "--call" => {
                let name = args
                    .get(index + 1)
                    .ok_or_else(|| "missing function name for --call".to_string())?;
                index += 2;
                let mut values = Vec::new();
                while let Some(raw) = args.get(index) {
                    let Ok(value) = parse_call_argument(raw) else {
                        break;
                    };
                    values.push(value);
                    index += 1;
                }
                cfg.call = Some((name.clone(), values));
            }
            value if value.starts_with('-') && value.len() > 1 => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.source.is_some() {
                    return Err("multiple source paths provided".to_string());
                }
                cfg.source = Some(PathBuf::from(path));
                index += 1;
            }
        }
    }
    if cfg.disasm && cfg.call.is_some() {
        return Err("--disasm cannot be combined with --call".to_string());
    }
    Ok(cfg)
}

/// Integers become `i32`, anything with a decimal point `f32`; the
/// interpreter casts them to the declared parameter types.
fn parse_call_argument(raw: &str) -> Result<Value, String> {
    if let Ok(value) = raw.parse::<i32>() {
        return Ok(Value::I32(value));
    }
    raw.parse::<f32>()
        .map(Value::F32)
        .map_err(|_| format!("invalid call argument '{raw}'"))
}

fn print_usage() {
    println!(
        "usage: bb-host [options] <program.bbasm>\n\
         \n\
         options:\n\
         \x20 --config PATH       read interpreter settings from a JSON file\n\
         \x20 --tick-ms N         wall-clock length of one sleep tick (default 10)\n\
         \x20 --call NAME ARGS..  call an exposed function after the program finishes\n\
         \x20 --disasm            print the assembled program and exit\n\
         \x20 --no-prelude        do not declare the console externs\n\
         \n\
         environment: BBVM_HEAP_SIZE, BBVM_STACK_SIZE, BBVM_MAX_INSTRUCTIONS,\n\
         BBVM_TICK_BATCH override the settings file; RUST_LOG sets the log filter"
    );
}
