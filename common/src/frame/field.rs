//! Named wire fields with an explicit byte order.
//!
//! The frame format mixes big-endian ("MSB") and little-endian ("LSB") fields
//! with no global rule, so every fixed-position field is declared with the
//! order it is transmitted in instead of being read with ad hoc offsets.

use core::marker::PhantomData;

use super::{Frame, FrameBuilder};

/// Byte order of a multi-byte wire field.
pub trait ByteOrder {
    fn decode_u16(bytes: [u8; 2]) -> u16;
    fn encode_u16(value: u16) -> [u8; 2];
}

/// Most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msb {}

/// Least significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lsb {}

impl ByteOrder for Msb {
    fn decode_u16(bytes: [u8; 2]) -> u16 {
        u16::from_be_bytes(bytes)
    }

    fn encode_u16(value: u16) -> [u8; 2] {
        value.to_be_bytes()
    }
}

impl ByteOrder for Lsb {
    fn decode_u16(bytes: [u8; 2]) -> u16 {
        u16::from_le_bytes(bytes)
    }

    fn encode_u16(value: u16) -> [u8; 2] {
        value.to_le_bytes()
    }
}

/// A 16-bit field at a fixed byte offset.
#[derive(Debug, PartialEq, Eq)]
pub struct U16Field<O> {
    offset: usize,
    _order: PhantomData<O>,
}

impl<O> Clone for U16Field<O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for U16Field<O> {}

pub type BigEndianU16 = U16Field<Msb>;
pub type LittleEndianU16 = U16Field<Lsb>;

impl<O: ByteOrder> U16Field<O> {
    pub const fn at(offset: usize) -> Self {
        Self {
            offset,
            _order: PhantomData,
        }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Reads the field, or 0 when the frame is too short to hold it.
    pub fn read<F: Frame + ?Sized>(&self, frame: &F) -> u16 {
        let bytes = frame.as_bytes();
        let Some(end) = self.offset.checked_add(2) else {
            return 0;
        };
        match bytes.get(self.offset..end) {
            Some(&[first, second]) => O::decode_u16([first, second]),
            _ => 0,
        }
    }

    /// Appends `value` in this field's byte order. The offset is not checked;
    /// callers append fields in layout order.
    pub fn append<const CAP: usize>(&self, builder: &mut FrameBuilder<CAP>, value: u16) -> bool {
        builder.add_bytes(&O::encode_u16(value))
    }

    /// Overwrites an already written field without changing the frame size.
    pub fn modify<const CAP: usize>(&self, builder: &mut FrameBuilder<CAP>, value: u16) -> bool {
        builder.modify_bytes_at(self.offset, &O::encode_u16(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameParser;

    #[test]
    fn same_bytes_read_differently_per_order() {
        let frame = FrameParser::new(&[0x20, 0x00]);

        assert_eq!(LittleEndianU16::at(0).read(&frame), 0x0020);
        assert_eq!(BigEndianU16::at(0).read(&frame), 0x2000);
    }

    #[test]
    fn short_frame_reads_zero() {
        let frame = FrameParser::new(&[0x20]);

        assert_eq!(LittleEndianU16::at(0).read(&frame), 0);
        assert_eq!(BigEndianU16::at(usize::MAX).read(&frame), 0);
    }

    #[test]
    fn modify_keeps_size() {
        let mut builder: FrameBuilder = FrameBuilder::new();
        let count = LittleEndianU16::at(2);
        assert!(BigEndianU16::at(0).append(&mut builder, 0x0031));
        assert!(count.append(&mut builder, 0));

        assert!(count.modify(&mut builder, 0x0102));

        assert_eq!(builder.as_bytes(), &[0x00, 0x31, 0x02, 0x01]);
        assert!(!LittleEndianU16::at(3).modify(&mut builder, 1));
        assert_eq!(builder.size(), 4);
    }
}
