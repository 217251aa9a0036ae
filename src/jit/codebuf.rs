//! Code buffer for building JIT code.
//!
//! Machine code for one method is accumulated here before it is copied
//! into an executable page by the [`PageManager`](super::memory::PageManager).

/// Default starting capacity of a method buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// A growable buffer of machine code bytes. Capacity doubles on overflow.
pub struct CodeBuffer {
    code: Vec<u8>,
    capacity: usize,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(16);
        Self {
            code: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current write cursor.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Logical capacity; doubles when full.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ensure(&mut self, additional: usize) {
        let needed = self.code.len() + additional;
        if needed > self.capacity {
            while self.capacity < needed {
                self.capacity *= 2;
            }
            self.code.reserve_exact(self.capacity - self.code.len());
        }
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.ensure(1);
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.code.extend_from_slice(bytes);
    }

    /// Overwrite a previously emitted 32-bit field.
    pub fn patch_i32(&mut self, at: usize, value: i32) {
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrite a previously emitted 8-bit displacement.
    pub fn patch_i8(&mut self, at: usize, value: i8) {
        self.code[at] = value as u8;
    }

    /// Read back a 32-bit field.
    pub fn read_i32(&self, at: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.code[at..at + 4]);
        i32::from_le_bytes(bytes)
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_capacity_doubles() {
        let mut buf = CodeBuffer::with_capacity(16);
        for _ in 0..16 {
            buf.emit_u8(0xCC);
        }
        assert_eq!(buf.capacity(), 16);

        buf.emit_u8(0xCC);
        assert_eq!(buf.capacity(), 32);

        buf.emit_bytes(&[0u8; 100]);
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.len(), 117);
    }

    #[test]
    fn test_patch_i32() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xE9);
        buf.emit_u32(0);
        buf.patch_i32(1, -5);

        assert_eq!(buf.code(), &[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
        assert_eq!(buf.read_i32(1), -5);
    }
}
