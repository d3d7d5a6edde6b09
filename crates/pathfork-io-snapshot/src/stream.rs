use crate::device::DeviceId;
use crate::error::{Result, StateError};

/// Bounds of the device section currently being restored.
#[derive(Debug, Clone, Copy)]
struct SectionLimit {
    device: DeviceId,
    start: usize,
    end: usize,
}

/// Growable byte buffer with a single read/write cursor.
///
/// Writes land at the cursor, overwriting previously written bytes and extending the buffer past
/// its end. Reads advance the same cursor and never go past the written extent. The buffer grows
/// geometrically, so a steady save/restore cycle stops allocating once the blob size settles.
#[derive(Debug, Default)]
pub struct SnapshotStream {
    buf: Vec<u8>,
    pos: usize,
    section: Option<SectionLimit>,
}

impl SnapshotStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty stream with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| StateError::AllocationFailure {
                requested: capacity,
            })?;
        Ok(Self {
            buf,
            pos: 0,
            section: None,
        })
    }

    /// Create a stream holding a copy of `bytes`, with the cursor at the start.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut stream = Self::with_capacity(bytes.len())?;
        stream.buf.extend_from_slice(bytes);
        Ok(stream)
    }

    /// Independent deep copy of the written bytes. The copy's cursor starts at zero.
    pub fn try_clone(&self) -> Result<Self> {
        Self::from_bytes(&self.buf)
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Bytes left to read before the end of the blob (or the current device section).
    pub fn remaining(&self) -> usize {
        self.read_end().saturating_sub(self.pos)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Rewind the cursor to the start. Written bytes and capacity are kept.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.section = None;
    }

    /// Drop everything written past the cursor.
    pub fn truncate_at_cursor(&mut self) {
        self.buf.truncate(self.pos);
    }

    /// Release trailing capacity, keeping at least `max(len, floor)` bytes.
    pub fn shrink(&mut self, floor: usize) {
        let target = self.buf.len().max(floor);
        if self.buf.capacity() > target {
            self.buf.shrink_to(target);
        }
    }

    pub fn put_byte(&mut self, v: u8) -> Result<()> {
        self.put_buffer(&[v])
    }

    pub fn put_buffer(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self
            .pos
            .checked_add(bytes.len())
            .ok_or(StateError::AllocationFailure {
                requested: usize::MAX,
            })?;
        if end > self.buf.len() {
            // `try_reserve` (not `_exact`) keeps Vec's amortized doubling.
            self.buf
                .try_reserve(end - self.buf.len())
                .map_err(|_| StateError::AllocationFailure { requested: end })?;
        }

        let overlap = (self.buf.len() - self.pos).min(bytes.len());
        self.buf[self.pos..self.pos + overlap].copy_from_slice(&bytes[..overlap]);
        self.buf.extend_from_slice(&bytes[overlap..]);
        self.pos = end;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put_buffer(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put_buffer(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put_buffer(&v.to_le_bytes())
    }

    pub fn put_bool(&mut self, v: bool) -> Result<()> {
        self.put_byte(u8::from(v))
    }

    /// Write a `u32` length followed by `bytes`.
    pub fn put_len_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        let len: u32 = bytes
            .len()
            .try_into()
            .map_err(|_| StateError::InvalidFieldEncoding("length does not fit in u32"))?;
        self.put_u32(len)?;
        self.put_buffer(bytes)
    }

    pub fn get_byte(&mut self) -> Result<u8> {
        let mut raw = [0u8; 1];
        self.get_into(&mut raw)?;
        Ok(raw[0])
    }

    pub fn get_buffer(&mut self, len: usize) -> Result<&[u8]> {
        let start = self.take(len)?;
        Ok(&self.buf[start..start + len])
    }

    /// Fill `out` from the cursor.
    pub fn get_into(&mut self, out: &mut [u8]) -> Result<()> {
        let start = self.take(out.len())?;
        out.copy_from_slice(&self.buf[start..start + out.len()]);
        Ok(())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.get_into(&mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.get_into(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.get_into(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(StateError::InvalidFieldEncoding("bool")),
        }
    }

    /// Read a `u32` length and that many bytes, refusing lengths above `max_len`.
    pub fn get_len_prefixed(&mut self, max_len: usize) -> Result<&[u8]> {
        let len = self.get_u32()? as usize;
        if len > max_len {
            return Err(StateError::InvalidFieldEncoding("length prefix too large"));
        }
        self.get_buffer(len)
    }

    /// Write a section header for `device` with a placeholder length.
    ///
    /// Returns the payload start, to be passed to [`SnapshotStream::end_section`].
    pub(crate) fn begin_section(&mut self, device: DeviceId) -> Result<usize> {
        self.put_buffer(&device.kind)?;
        self.put_u16(device.instance)?;
        self.put_u32(0)?;
        Ok(self.pos)
    }

    /// Patch the section length written by [`SnapshotStream::begin_section`].
    pub(crate) fn end_section(&mut self, payload_start: usize) -> Result<()> {
        let len = self
            .pos
            .checked_sub(payload_start)
            .ok_or(StateError::InvalidFieldEncoding(
                "device moved the cursor before its section",
            ))?;
        let len: u32 = len
            .try_into()
            .map_err(|_| StateError::InvalidFieldEncoding("device section exceeds 4 GiB"))?;
        let at = payload_start - 4;
        self.buf[at..payload_start].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    /// Read the next section header and confine reads to its payload.
    pub(crate) fn enter_section(&mut self, expected: DeviceId) -> Result<()> {
        debug_assert!(self.section.is_none(), "nested device sections");
        self.section = None;

        let mut kind = [0u8; 4];
        self.get_into(&mut kind)?;
        let instance = self.get_u16()?;
        let found = DeviceId::new(kind, instance);
        if found != expected {
            return Err(StateError::UnknownSection { expected, found });
        }

        let len = self.get_u32()? as usize;
        let remaining = self.remaining();
        if len > remaining {
            return Err(StateError::BufferUnderrun {
                requested: len,
                remaining,
            });
        }

        self.section = Some(SectionLimit {
            device: expected,
            start: self.pos,
            end: self.pos + len,
        });
        Ok(())
    }

    /// Lift the section confinement, checking the payload was consumed exactly.
    pub(crate) fn leave_section(&mut self) -> Result<()> {
        let Some(section) = self.section.take() else {
            return Ok(());
        };
        if self.pos != section.end {
            return Err(StateError::SectionLengthMismatch {
                device: section.device,
                expected: section.end - section.start,
                consumed: self.pos.saturating_sub(section.start),
            });
        }
        Ok(())
    }

    fn read_end(&self) -> usize {
        self.section.map_or(self.buf.len(), |section| section.end)
    }

    fn take(&mut self, len: usize) -> Result<usize> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(match self.section {
                Some(section) => StateError::BufferOverrun {
                    device: section.device,
                    requested: len,
                    remaining,
                },
                None => StateError::BufferUnderrun {
                    requested: len,
                    remaining,
                },
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(start)
    }
}
