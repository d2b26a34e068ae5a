//! Raw byte-buffer codec shared by every frame type.
//!
//! [`FrameBuilder`] appends into a fixed-capacity buffer and never grows past
//! it; [`FrameParser`] owns a private copy of received bytes. Both are
//! bounds-checked: writes that do not fit are refused whole and reads past the
//! end return 0.

mod field;
mod registry;

use log::debug;

pub use field::{BigEndianU16, ByteOrder, LittleEndianU16, Lsb, Msb, U16Field};
pub use registry::{FrameType, TagOrder};

pub const MAX_BUILDER_SIZE: usize = 1024;
pub const MAX_PARSER_SIZE: usize = 2048;

/// The frame type tag at offset 0 is big-endian unless a type says otherwise.
pub const FRAME_ID: BigEndianU16 = BigEndianU16::at(0);

/// Read access common to parsed and built frames.
pub trait Frame {
    fn as_bytes(&self) -> &[u8];

    fn size(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// First two bytes read MSB-first.
    fn id(&self) -> u16 {
        FRAME_ID.read(self)
    }

    /// Copies `min(size, buffer.len())` bytes and returns how many were copied.
    fn copy_to(&self, buffer: &mut [u8]) -> usize {
        let bytes = self.as_bytes();
        let len = bytes.len().min(buffer.len());
        buffer[..len].copy_from_slice(&bytes[..len]);
        len
    }
}

/// Immutable view over a private copy of received bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameParser {
    bytes: Box<[u8]>,
}

impl FrameParser {
    /// Empty or oversized input yields an empty parser.
    pub fn new(bytes: &[u8]) -> Self {
        if bytes.is_empty() || bytes.len() > MAX_PARSER_SIZE {
            debug!("frame parser rejected {} byte input", bytes.len());
            return Self::default();
        }
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn u8_at(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or(0)
    }

    pub fn u16_lsb(&self, offset: usize) -> u16 {
        self.array(offset).map(u16::from_le_bytes).unwrap_or(0)
    }

    pub fn u16_msb(&self, offset: usize) -> u16 {
        self.array(offset).map(u16::from_be_bytes).unwrap_or(0)
    }

    pub fn u32_lsb(&self, offset: usize) -> u32 {
        self.array(offset).map(u32::from_le_bytes).unwrap_or(0)
    }

    pub fn u32_msb(&self, offset: usize) -> u32 {
        self.array(offset).map(u32::from_be_bytes).unwrap_or(0)
    }

    pub fn i32_lsb(&self, offset: usize) -> i32 {
        self.array(offset).map(i32::from_le_bytes).unwrap_or(0)
    }

    pub fn i32_msb(&self, offset: usize) -> i32 {
        self.array(offset).map(i32::from_be_bytes).unwrap_or(0)
    }

    /// `len` bytes starting at `offset`, or `None` if that runs past the end.
    pub fn bytes_at(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.bytes.get(offset..offset.checked_add(len)?)
    }

    fn array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.bytes_at(offset, N)?.try_into().ok()
    }
}

impl Frame for FrameParser {
    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Append-only frame writer over a fixed-capacity buffer.
#[derive(Debug, Clone, Default)]
pub struct FrameBuilder<const CAP: usize = MAX_BUILDER_SIZE> {
    buffer: heapless::Vec<u8, CAP>,
}

impl<const CAP: usize> FrameBuilder<CAP> {
    pub fn new() -> Self {
        Self {
            buffer: heapless::Vec::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }

    pub fn remaining(&self) -> usize {
        CAP - self.buffer.len()
    }

    pub fn add_u8(&mut self, value: u8) -> bool {
        self.add_bytes(&[value])
    }

    pub fn add_u16_msb(&mut self, value: u16) -> bool {
        self.add_bytes(&value.to_be_bytes())
    }

    pub fn add_u16_lsb(&mut self, value: u16) -> bool {
        self.add_bytes(&value.to_le_bytes())
    }

    pub fn add_u32_lsb(&mut self, value: u32) -> bool {
        self.add_bytes(&value.to_le_bytes())
    }

    pub fn add_i32_lsb(&mut self, value: i32) -> bool {
        self.add_bytes(&value.to_le_bytes())
    }

    /// Appends all of `bytes` or nothing.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            debug!(
                "frame builder full: {} + {} > {CAP}",
                self.buffer.len(),
                bytes.len()
            );
            return false;
        }
        self.buffer.extend_from_slice(bytes).is_ok()
    }

    pub fn modify_u8_at(&mut self, index: usize, value: u8) -> bool {
        self.modify_bytes_at(index, &[value])
    }

    pub fn modify_u16_msb_at(&mut self, index: usize, value: u16) -> bool {
        self.modify_bytes_at(index, &value.to_be_bytes())
    }

    pub fn modify_u16_lsb_at(&mut self, index: usize, value: u16) -> bool {
        self.modify_bytes_at(index, &value.to_le_bytes())
    }

    /// Overwrites bytes that were already written; never changes the size.
    pub fn modify_bytes_at(&mut self, index: usize, bytes: &[u8]) -> bool {
        let Some(end) = index.checked_add(bytes.len()) else {
            return false;
        };
        match self.buffer.get_mut(index..end) {
            Some(target) => {
                target.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }
}

impl<const CAP: usize> Frame for FrameBuilder<CAP> {
    fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Owns a finished builder and only exposes it for reading.
#[derive(Debug, Clone, Default)]
pub struct FrameBuilderUser<const CAP: usize = MAX_BUILDER_SIZE> {
    builder: FrameBuilder<CAP>,
}

impl<const CAP: usize> FrameBuilderUser<CAP> {
    pub fn to_parser(&self) -> FrameParser {
        FrameParser::new(self.builder.as_bytes())
    }
}

impl<const CAP: usize> From<FrameBuilder<CAP>> for FrameBuilderUser<CAP> {
    fn from(builder: FrameBuilder<CAP>) -> Self {
        Self { builder }
    }
}

impl<const CAP: usize> Frame for FrameBuilderUser<CAP> {
    fn as_bytes(&self) -> &[u8] {
        self.builder.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_refuses_partial_writes() {
        let mut builder = FrameBuilder::<3>::new();

        assert!(builder.add_u16_msb(0x0102));
        assert!(!builder.add_u16_lsb(0x0304));
        assert_eq!(builder.size(), 2);
        assert!(builder.add_u8(0x05));
        assert!(!builder.add_u8(0x06));
        assert_eq!(builder.as_bytes(), &[0x01, 0x02, 0x05]);
    }

    #[test]
    fn modify_only_touches_written_range() {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_bytes(&[1, 2, 3]);

        assert!(builder.modify_u8_at(2, 9));
        assert!(!builder.modify_u8_at(3, 9));
        assert!(!builder.modify_u16_lsb_at(2, 0xffff));
        assert!(builder.modify_u16_msb_at(0, 0x0a0b));

        assert_eq!(builder.as_bytes(), &[0x0a, 0x0b, 9]);
    }

    #[test]
    fn copy_to_never_overruns_destination() {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_bytes(&[1, 2, 3, 4]);

        let mut small = [0u8; 2];
        assert_eq!(builder.copy_to(&mut small), 2);
        assert_eq!(small, [1, 2]);

        let mut large = [0u8; 8];
        assert_eq!(builder.copy_to(&mut large), 4);
        assert_eq!(&large[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn parser_reads_mixed_endianness() {
        let parser = FrameParser::new(&[0x00, 0x14, 0x78, 0x56, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff]);

        assert_eq!(parser.id(), 0x0014);
        assert_eq!(parser.u16_lsb(0), 0x1400);
        assert_eq!(parser.u32_lsb(2), 0x1234_5678);
        assert_eq!(parser.u32_msb(2), 0x7856_3412);
        assert_eq!(parser.i32_lsb(6), -1);
        assert_eq!(parser.i32_msb(6), -1);
    }

    #[test]
    fn parser_out_of_range_reads_are_zero() {
        let parser = FrameParser::new(&[0xaa, 0xbb, 0xcc]);

        assert_eq!(parser.u8_at(3), 0);
        assert_eq!(parser.u16_msb(2), 0);
        assert_eq!(parser.u32_lsb(0), 0);
        assert_eq!(parser.i32_msb(usize::MAX), 0);
        assert_eq!(parser.bytes_at(1, 3), None);
        assert_eq!(parser.bytes_at(1, 2), Some(&[0xbb, 0xcc][..]));
    }

    #[test]
    fn parser_rejects_empty_and_oversized_input() {
        assert_eq!(FrameParser::new(&[]).size(), 0);
        assert_eq!(FrameParser::new(&[0u8; MAX_PARSER_SIZE + 1]).size(), 0);
        assert_eq!(FrameParser::new(&[0u8; MAX_PARSER_SIZE]).size(), MAX_PARSER_SIZE);
    }

    #[test]
    fn parser_clone_is_independent_copy() {
        let mut source = vec![1u8, 2, 3];
        let parser = FrameParser::new(&source);
        source[0] = 9;
        let cloned = parser.clone();
        drop(parser);

        assert_eq!(cloned.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn builder_user_exposes_bytes() {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_u16_msb(0x0011);
        let user = FrameBuilderUser::from(builder);

        assert_eq!(user.id(), 0x0011);
        assert_eq!(user.to_parser().as_bytes(), &[0x00, 0x11]);
    }
}
