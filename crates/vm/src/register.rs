//! A single machine register with a configurable effective bit-width.

use crate::error::VmError;
use serde::{Deserialize, Serialize};

/// One machine word. Storage is always 32 bits wide; the configured
/// effective width only shapes what `read` returns.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Register {
    width: u32,
    value: i32,
}

impl Register {
    /// Create a register with the given effective width in bits.
    ///
    /// # Errors
    /// Returns `Config` unless `1 <= width <= 32`.
    pub fn new(width: u32) -> Result<Self, VmError> {
        if width == 0 || width > 32 {
            return Err(VmError::Config { width });
        }
        Ok(Self { width, value: 0 })
    }

    /// Effective width in bits.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Read the register: the low `width` bits, arithmetically
    /// sign-extended into an `i32`.
    #[inline]
    pub fn read(&self) -> i32 {
        let shift = 32 - self.width;
        (self.value << shift) >> shift
    }

    /// Write the full 32-bit value verbatim. Truncation to the effective
    /// width happens on read, not on write.
    #[inline]
    pub fn write(&mut self, value: i32) {
        self.value = value;
    }

    /// Zero the register.
    pub fn clear(&mut self) {
        self.value = 0;
    }
}
