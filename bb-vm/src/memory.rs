use std::ops::Range;

use tracing::debug;

use crate::value::{Value, ValueType};
use crate::vm::{VmError, VmResult};

/// Size of a heap block header: bit 31 marks the block used, the low bits
/// hold the payload size.
pub const BLOCK_HEADER_SIZE: usize = 4;
/// Return address and saved base pointer, pushed by every call.
pub const FRAME_HEADER_SIZE: usize = 8;

const USED_FLAG: u32 = 0x8000_0000;
const SIZE_MASK: u32 = 0x7FFF_FFFF;
const MIN_PAYLOAD: usize = 4;

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapBlock {
    pub header: usize,
    pub size: usize,
    pub used: bool,
}

impl HeapBlock {
    pub fn payload(&self) -> usize {
        self.header + BLOCK_HEADER_SIZE
    }

    fn end(&self) -> usize {
        self.payload() + self.size
    }
}

/// One flat byte array: heap region first, stack region after it.
#[derive(Clone, Debug)]
pub struct Memory {
    bytes: Vec<u8>,
    heap_start: usize,
    heap_end: usize,
    heap_size: usize,
    stack_pointer: usize,
    base_pointer: usize,
}

impl Memory {
    pub fn new(heap_size: usize, stack_size: usize, data: &[u8]) -> VmResult<Self> {
        if data.len() > heap_size {
            return Err(VmError::InvalidSettings(format!(
                "static data of {} bytes does not fit a heap of {heap_size} bytes",
                data.len()
            )));
        }
        let total = heap_size
            .checked_add(stack_size)
            .filter(|total| *total <= i32::MAX as usize)
            .ok_or_else(|| VmError::InvalidSettings("memory size exceeds i32 range".to_string()))?;

        let mut bytes = vec![0u8; total];
        bytes[..data.len()].copy_from_slice(data);

        let heap_end = heap_size & !3;
        let mut heap_start = align4(data.len());
        if heap_start + BLOCK_HEADER_SIZE + MIN_PAYLOAD <= heap_end {
            let size = (heap_end - heap_start - BLOCK_HEADER_SIZE) as u32;
            bytes[heap_start..heap_start + 4].copy_from_slice(&size.to_le_bytes());
        } else {
            heap_start = heap_end.max(heap_start);
        }

        Ok(Self {
            bytes,
            heap_start,
            heap_end: heap_end.max(heap_start),
            heap_size,
            stack_pointer: heap_size,
            base_pointer: heap_size,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn stack_start(&self) -> usize {
        self.heap_size
    }

    pub fn stack_end(&self) -> usize {
        self.bytes.len()
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    pub fn base_pointer(&self) -> usize {
        self.base_pointer
    }

    pub fn stack_used(&self) -> usize {
        self.stack_pointer - self.stack_start()
    }

    /// Moves the stack pointer within `[base_pointer, stack_end]`.
    pub fn set_stack_pointer(&mut self, pointer: usize) -> VmResult<()> {
        if pointer > self.stack_end() {
            return Err(VmError::StackOverflow);
        }
        if pointer < self.base_pointer {
            return Err(VmError::StackUnderflow);
        }
        self.stack_pointer = pointer;
        Ok(())
    }

    fn range(&self, address: usize, len: usize) -> VmResult<Range<usize>> {
        match address.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(address..end),
            _ => Err(VmError::MemoryOutOfBounds {
                address: address as i64,
                len,
            }),
        }
    }

    pub fn slice(&self, address: usize, len: usize) -> VmResult<&[u8]> {
        let range = self.range(address, len)?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, address: usize, len: usize) -> VmResult<&mut [u8]> {
        let range = self.range(address, len)?;
        Ok(&mut self.bytes[range])
    }

    fn read_array<const N: usize>(&self, address: usize) -> VmResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.slice(address, N)?);
        Ok(buf)
    }

    pub fn read_u8(&self, address: usize) -> VmResult<u8> {
        Ok(self.read_array::<1>(address)?[0])
    }

    pub fn read_u16(&self, address: usize) -> VmResult<u16> {
        Ok(u16::from_le_bytes(self.read_array(address)?))
    }

    pub fn read_u32(&self, address: usize) -> VmResult<u32> {
        Ok(u32::from_le_bytes(self.read_array(address)?))
    }

    pub fn read_u64(&self, address: usize) -> VmResult<u64> {
        Ok(u64::from_le_bytes(self.read_array(address)?))
    }

    pub fn write_bytes(&mut self, address: usize, bytes: &[u8]) -> VmResult<()> {
        self.slice_mut(address, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, address: usize, value: u8) -> VmResult<()> {
        self.write_bytes(address, &[value])
    }

    pub fn write_u16(&mut self, address: usize, value: u16) -> VmResult<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, address: usize, value: u32) -> VmResult<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, address: usize, value: u64) -> VmResult<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub fn read_value(&self, address: usize, ty: ValueType) -> VmResult<Value> {
        Value::from_le_bytes(ty, self.slice(address, ty.size())?)
    }

    pub fn write_value(&mut self, address: usize, value: Value) -> VmResult<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    /// Reads UTF-16 code units up to a NUL or `max_units`, whichever comes first.
    pub fn read_utf16_string(&self, address: usize, max_units: usize) -> VmResult<String> {
        let mut units = Vec::new();
        let mut cursor = address;
        while units.len() < max_units {
            let unit = self.read_u16(cursor)?;
            if unit == 0 {
                break;
            }
            units.push(unit);
            cursor += 2;
        }
        Ok(String::from_utf16_lossy(&units))
    }

    /// Writes `text` as UTF-16 followed by a NUL; returns the bytes written.
    pub fn write_utf16_string(&mut self, address: usize, text: &str) -> VmResult<usize> {
        let mut encoded = Vec::new();
        for unit in text.encode_utf16().chain(std::iter::once(0)) {
            encoded.extend_from_slice(&unit.to_le_bytes());
        }
        self.write_bytes(address, &encoded)?;
        Ok(encoded.len())
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> VmResult<()> {
        let end = self
            .stack_pointer
            .checked_add(bytes.len())
            .filter(|end| *end <= self.stack_end())
            .ok_or(VmError::StackOverflow)?;
        self.bytes[self.stack_pointer..end].copy_from_slice(bytes);
        self.stack_pointer = end;
        Ok(())
    }

    pub fn push_value(&mut self, value: Value) -> VmResult<()> {
        if value.is_null() {
            return Err(VmError::TypeMismatch("non-null value"));
        }
        self.push_bytes(&value.to_le_bytes())
    }

    /// Pushes `len` zero bytes, e.g. a return-value slot.
    pub fn reserve(&mut self, len: usize) -> VmResult<usize> {
        let start = self.stack_pointer;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.stack_end())
            .ok_or(VmError::StackOverflow)?;
        self.bytes[start..end].fill(0);
        self.stack_pointer = end;
        Ok(start)
    }

    pub fn pop_bytes(&mut self, len: usize) -> VmResult<Vec<u8>> {
        let start = self
            .stack_pointer
            .checked_sub(len)
            .filter(|start| *start >= self.base_pointer)
            .ok_or(VmError::StackUnderflow)?;
        let bytes = self.bytes[start..self.stack_pointer].to_vec();
        self.stack_pointer = start;
        Ok(bytes)
    }

    pub fn pop_value(&mut self, ty: ValueType) -> VmResult<Value> {
        let bytes = self.pop_bytes(ty.size())?;
        Value::from_le_bytes(ty, &bytes)
    }

    /// Drops every frame and value on the stack.
    pub fn reset_stack(&mut self) {
        self.stack_pointer = self.stack_start();
        self.base_pointer = self.stack_start();
    }

    /// Pushes the frame header and makes the new stack top the base pointer.
    pub fn enter_frame(&mut self, return_address: i32) -> VmResult<()> {
        let header = (return_address as u32 as u64) | ((self.base_pointer as u64) << 32);
        self.push_bytes(&header.to_le_bytes())?;
        self.base_pointer = self.stack_pointer;
        Ok(())
    }

    /// Drops the current frame and returns the saved return address.
    pub fn leave_frame(&mut self) -> VmResult<i32> {
        let frame = self.base_pointer;
        if frame < self.stack_start() + FRAME_HEADER_SIZE {
            return Err(VmError::StackUnderflow);
        }
        let header_at = frame - FRAME_HEADER_SIZE;
        let header = self.read_u64(header_at)?;
        let return_address = header as u32 as i32;
        let saved_base = (header >> 32) as usize;
        if saved_base < self.stack_start() || saved_base > header_at {
            return Err(VmError::Internal(format!(
                "corrupted frame header at {header_at}: saved base pointer {saved_base}"
            )));
        }
        self.base_pointer = saved_base;
        self.stack_pointer = header_at;
        Ok(return_address)
    }

    fn block_at(&self, header: usize) -> VmResult<HeapBlock> {
        let word = self.read_u32(header)?;
        let block = HeapBlock {
            header,
            size: (word & SIZE_MASK) as usize,
            used: word & USED_FLAG != 0,
        };
        if block.size == 0 || block.end() > self.heap_end {
            return Err(VmError::HeapCorrupted(header));
        }
        Ok(block)
    }

    fn write_block(&mut self, header: usize, size: usize, used: bool) -> VmResult<()> {
        let flag = if used { USED_FLAG } else { 0 };
        self.write_u32(header, size as u32 | flag)
    }

    /// Walks the block list from the start of the heap.
    pub fn heap_blocks(&self) -> VmResult<Vec<HeapBlock>> {
        let mut blocks = Vec::new();
        let mut header = self.heap_start;
        while header < self.heap_end {
            let block = self.block_at(header)?;
            header = block.end();
            blocks.push(block);
        }
        Ok(blocks)
    }

    pub fn heap_used(&self) -> VmResult<usize> {
        Ok(self
            .heap_blocks()?
            .iter()
            .filter(|block| block.used)
            .map(|block| block.size)
            .sum())
    }

    /// First-fit allocation; returns the payload offset.
    pub fn allocate(&mut self, requested: usize) -> VmResult<u32> {
        let size = align4(requested.max(MIN_PAYLOAD));
        let mut header = self.heap_start;
        while header < self.heap_end {
            let block = self.block_at(header)?;
            if !block.used && block.size >= size {
                let remainder = block.size - size;
                if remainder >= BLOCK_HEADER_SIZE + MIN_PAYLOAD {
                    self.write_block(header, size, true)?;
                    self.write_block(
                        block.payload() + size,
                        remainder - BLOCK_HEADER_SIZE,
                        false,
                    )?;
                } else {
                    self.write_block(header, block.size, true)?;
                }
                debug!(requested, pointer = block.payload(), "heap allocate");
                return Ok(block.payload() as u32);
            }
            header = block.end();
        }
        Err(VmError::OutOfMemory { requested })
    }

    /// Releases a block and merges it with free neighbours on both sides.
    pub fn free(&mut self, pointer: u32) -> VmResult<()> {
        let pointer = pointer as usize;
        let mut previous: Option<HeapBlock> = None;
        let mut header = self.heap_start;
        while header < self.heap_end {
            let block = self.block_at(header)?;
            if block.payload() == pointer {
                if !block.used {
                    break;
                }
                let mut start = block.header;
                let mut size = block.size;
                if block.end() < self.heap_end {
                    let next = self.block_at(block.end())?;
                    if !next.used {
                        size += BLOCK_HEADER_SIZE + next.size;
                    }
                }
                if let Some(previous) = previous.filter(|previous| !previous.used) {
                    start = previous.header;
                    size += BLOCK_HEADER_SIZE + previous.size;
                }
                self.write_block(start, size, false)?;
                debug!(pointer, "heap free");
                return Ok(());
            }
            if block.payload() > pointer {
                break;
            }
            previous = Some(block);
            header = block.end();
        }
        Err(VmError::InvalidFree(pointer as u32))
    }
}
