mod config;
mod console;
mod logging;
mod runtime;

pub use vm_abi::{
    ABI_VERSION, AbiFunction, CallKind, FN_ALLOC, FN_FREE, FN_PRINT_CHAR, FN_PRINT_INT,
    FN_PRINT_STR, FN_READ_CHAR, FN_SLEEP, FUNCTIONS, abi_json, function_by_id,
    function_by_name,
};

pub use config::{
    ConfigError, ENV_HEAP_SIZE, ENV_MAX_INSTRUCTIONS, ENV_STACK_SIZE, ENV_TICK_BATCH,
    apply_env_overrides, load_settings, parse_settings,
};
pub use console::{MAX_PRINT_UNITS, SharedWriter, Sleep, console_table, register_console};
pub use logging::{category_fault, init as init_logging, outcome_label};
pub use runtime::{
    END_OF_INPUT, InputSource, LineInput, RunOptions, RunReport, ScriptedInput, call_exposed,
    run_program,
};
