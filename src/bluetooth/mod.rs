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

//! Bluetooth communication module.
//!
//! RFCOMM serial sessions with one peer at a time, carrying newline-framed
//! JSON chat messages.

mod bluez;
mod connection;
mod framing;
pub mod memory;
mod protocol;
mod transport;

pub use bluez::BluezTransport;
pub use connection::{ConnectionCore, ConnectionState, ConnectionStatus};
pub use framing::LineDecoder;
pub use memory::MemoryTransport;
pub use protocol::{
    max_frame_len, now_millis, ChatMessage, Device, SenderTag, DEFAULT_MAX_TEXT_LEN,
    FRAME_DELIMITER, SPP_UUID,
};
pub use transport::{ReadCallback, Transport};
