//! Output sinks for codestream emission.
//!
//! Reconstruction runs twice over the same emission code: a counting pass
//! that sizes every tile-part (Psot must be written before the data it
//! covers), then a buffer pass producing the bytes. Both passes go through
//! this trait so they cannot drift apart.

/// Byte sink with a running position.
pub trait Sink {
    fn write(&mut self, bytes: &[u8]);
    fn position(&self) -> u64;

    fn write_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    fn write_u16(&mut self, value: u16) {
        self.write(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.write(&value.to_be_bytes());
    }
}

/// Discards bytes, tracking only how many were written.
#[derive(Debug, Default)]
pub struct CountingSink {
    position: u64,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for CountingSink {
    fn write(&mut self, bytes: &[u8]) {
        self.position += bytes.len() as u64;
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Collects bytes into memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    buffer: Vec<u8>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Sink for BufferSink {
    fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }
}
