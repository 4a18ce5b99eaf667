use serde::{Deserialize, Serialize};

use crate::memory::FRAME_HEADER_SIZE;
use crate::vm::{VmError, VmResult};

pub const DEFAULT_HEAP_SIZE: usize = 4096;
pub const DEFAULT_STACK_SIZE: usize = 4096;
pub const DEFAULT_INSTRUCTIONS_PER_TICK: usize = 512;
const MIN_STACK_SIZE: usize = 2 * FRAME_HEADER_SIZE;

/// Interpreter sizing and scheduling knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub heap_size: usize,
    pub stack_size: usize,
    /// Total instruction budget for the interpreter's lifetime.
    pub max_instructions: Option<u64>,
    pub instructions_per_tick: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            max_instructions: None,
            instructions_per_tick: DEFAULT_INSTRUCTIONS_PER_TICK,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> VmResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(VmError::InvalidSettings(format!(
                "stack_size must be at least {MIN_STACK_SIZE} bytes, got {}",
                self.stack_size
            )));
        }
        if self.instructions_per_tick == 0 {
            return Err(VmError::InvalidSettings(
                "instructions_per_tick must be at least 1".to_string(),
            ));
        }
        let total = self.heap_size.checked_add(self.stack_size);
        if total.is_none_or(|total| total > i32::MAX as usize) {
            return Err(VmError::InvalidSettings(format!(
                "heap_size + stack_size must fit in i32, got {} + {}",
                self.heap_size, self.stack_size
            )));
        }
        Ok(())
    }
}
