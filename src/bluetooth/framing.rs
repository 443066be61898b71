// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stream reassembly of newline-delimited frames.
//!
//! RFCOMM reads do not line up with message boundaries: one read may carry
//! half a frame or several frames.

use tracing::{debug, warn};

use super::protocol::FRAME_DELIMITER;

/// Splits a byte stream into complete frame lines.
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
    discarding: bool,
}

impl LineDecoder {
    /// Create a decoder that drops frames longer than `max_frame_len` bytes.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_frame_len,
            discarding: false,
        }
    }

    /// Process a chunk read from the stream.
    ///
    /// Returns every frame completed by this chunk, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if byte == FRAME_DELIMITER {
                if self.discarding {
                    // Tail of an oversized frame
                    self.discarding = false;
                    continue;
                }
                if let Some(frame) = self.take_line() {
                    frames.push(frame);
                }
                continue;
            }

            if self.discarding {
                continue;
            }

            self.buffer.push(byte);

            if self.buffer.len() > self.max_frame_len {
                warn!(
                    "Frame exceeds {} bytes, discarding until next delimiter",
                    self.max_frame_len
                );
                self.reset();
                self.discarding = true;
            }
        }

        frames
    }

    fn take_line(&mut self) -> Option<String> {
        let mut line = std::mem::take(&mut self.buffer);
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }

        match String::from_utf8(line) {
            Ok(text) => {
                debug!("Frame complete: {} bytes", text.len());
                Some(text)
            }
            Err(e) => {
                warn!("Invalid UTF-8 in frame: {}", e);
                None
            }
        }
    }

    /// Reset the decoder state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Check if a partial frame is buffered.
    pub fn is_in_progress(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get current buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}
