// Copyright 2025 eraflo
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

use std::any::Any;
use strata_core::backend::{BufferId, CommandStream};

/// One recorded operation of a [`HeadlessCommandStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessCommand {
    /// Sets `size` bytes starting at `offset` to `value`.
    FillBuffer {
        /// Destination buffer.
        buffer: BufferId,
        /// First byte.
        offset: u64,
        /// Number of bytes.
        size: u64,
        /// Byte written.
        value: u8,
    },
    /// Copies bytes between two buffers.
    CopyBuffer {
        /// Source buffer.
        source: BufferId,
        /// First source byte.
        source_offset: u64,
        /// Destination buffer.
        destination: BufferId,
        /// First destination byte.
        destination_offset: u64,
        /// Number of bytes.
        size: u64,
    },
    /// Writes inline bytes into a buffer.
    WriteBuffer {
        /// Destination buffer.
        buffer: BufferId,
        /// First byte.
        offset: u64,
        /// Bytes written.
        data: Vec<u8>,
    },
}

/// A command stream recorded for the headless backend.
///
/// Built with chained calls and executed in recording order:
///
/// ```
/// use strata_core::backend::BufferId;
/// use strata_infra::graphics::headless::HeadlessCommandStream;
///
/// let stream = HeadlessCommandStream::new("clear")
///     .fill_buffer(BufferId(1), 0, 64, 0)
///     .copy_buffer(BufferId(1), 0, BufferId(2), 0, 64);
/// assert_eq!(stream.commands().len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeadlessCommandStream {
    label: String,
    commands: Vec<HeadlessCommand>,
}

impl HeadlessCommandStream {
    /// Starts an empty stream.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    /// Records a fill.
    pub fn fill_buffer(mut self, buffer: BufferId, offset: u64, size: u64, value: u8) -> Self {
        self.commands.push(HeadlessCommand::FillBuffer {
            buffer,
            offset,
            size,
            value,
        });
        self
    }

    /// Records a buffer-to-buffer copy.
    pub fn copy_buffer(
        mut self,
        source: BufferId,
        source_offset: u64,
        destination: BufferId,
        destination_offset: u64,
        size: u64,
    ) -> Self {
        self.commands.push(HeadlessCommand::CopyBuffer {
            source,
            source_offset,
            destination,
            destination_offset,
            size,
        });
        self
    }

    /// Records an inline write.
    pub fn write_buffer(mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Self {
        self.commands.push(HeadlessCommand::WriteBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
        self
    }

    /// The recorded commands.
    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    pub(super) fn into_commands(self) -> Vec<HeadlessCommand> {
        self.commands
    }
}

impl CommandStream for HeadlessCommandStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
