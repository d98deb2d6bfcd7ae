//! Private port allocation for preview backends
//!
//! Ports come from a fixed window starting at a configured base. A rolling
//! cursor is kept so that a port released a moment ago is not handed out
//! again while the OS may still hold it in TIME_WAIT.

use crate::error::{PreviewError, PreviewResult};
use std::collections::HashSet;

/// Rolling-cursor allocator over `[base, base + window)`
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    window: u16,
    /// Offset of the next candidate within the window
    cursor: u16,
}

impl PortAllocator {
    pub fn new(base: u16, window: u16) -> Self {
        Self {
            base,
            window,
            cursor: 0,
        }
    }

    fn end(&self) -> u32 {
        u32::from(self.base) + u32::from(self.window)
    }

    /// Return the first port at or after the cursor (wrapping) that is not in `in_use`.
    ///
    /// The caller must hold whatever lock guards `in_use` until the returned
    /// port is recorded, otherwise two callers can receive the same port.
    pub fn allocate(&mut self, in_use: &HashSet<u16>) -> PreviewResult<u16> {
        for step in 0..self.window {
            let offset = ((u32::from(self.cursor) + u32::from(step)) % u32::from(self.window)) as u16;
            let port = self.base + offset;
            if !in_use.contains(&port) {
                self.cursor = ((u32::from(offset) + 1) % u32::from(self.window)) as u16;
                return Ok(port);
            }
        }

        Err(PreviewError::PortExhaustion {
            base: self.base,
            end: self.end(),
        })
    }
}
