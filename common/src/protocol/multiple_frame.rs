//! Envelope carrying several size-prefixed sub-frames.
//!
//! ```text
//! request:  [0x30 0x00][count lo][count hi]([size][payload..])*
//! response: [0x00 0x31][count lo][count hi]([size][payload..])*
//! ```
//!
//! The request tag is little-endian and the response tag big-endian; the
//! count is little-endian in both.

use log::debug;

use crate::frame::{
    BigEndianU16, Frame, FrameBuilder, FrameBuilderUser, FrameParser, FrameType, LittleEndianU16,
};

pub const HEADER_SIZE: usize = 4;
pub const MAX_SUB_FRAME_SIZE: usize = u8::MAX as usize;

const REQUEST_TAG: LittleEndianU16 = LittleEndianU16::at(0);
const RESPONSE_TAG: BigEndianU16 = BigEndianU16::at(0);
const COUNT: LittleEndianU16 = LittleEndianU16::at(2);

#[derive(Debug, Clone, Default)]
pub struct MultipleFrameRequest {
    frame: FrameParser,
    num_of_sub_frames: usize,
    valid: bool,
}

impl MultipleFrameRequest {
    pub fn new(frame: FrameParser) -> Self {
        match Self::validate(&frame) {
            Some(num_of_sub_frames) => Self {
                frame,
                num_of_sub_frames,
                valid: true,
            },
            None => Self {
                frame,
                num_of_sub_frames: 0,
                valid: false,
            },
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(FrameParser::new(bytes))
    }

    fn validate(frame: &FrameParser) -> Option<usize> {
        if !FrameType::MultipleFrameRequest.matches(frame) {
            debug!("multiple frame request has wrong tag {:#06x}", REQUEST_TAG.read(frame));
            return None;
        }
        if frame.size() < HEADER_SIZE {
            debug!("multiple frame request too short: {} bytes", frame.size());
            return None;
        }

        let count = usize::from(COUNT.read(frame));
        let mut position = HEADER_SIZE;
        for index in 0..count {
            let Some(end) = sub_frame_end(frame, position) else {
                debug!("multiple frame request sub-frame {index} of {count} overruns the frame");
                return None;
            };
            position = end;
        }

        if position != frame.size() {
            debug!(
                "multiple frame request ends at {position} but carries {} bytes",
                frame.size()
            );
            return None;
        }
        Some(count)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn num_of_sub_frames(&self) -> usize {
        self.num_of_sub_frames
    }

    pub fn sub_frame(&self, index: usize) -> Option<&[u8]> {
        if index >= self.num_of_sub_frames {
            return None;
        }
        let mut position = HEADER_SIZE;
        for _ in 0..index {
            position = sub_frame_end(&self.frame, position)?;
        }
        let size = usize::from(self.frame.u8_at(position));
        self.frame.bytes_at(position + 1, size)
    }

    pub fn sub_frames(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.num_of_sub_frames).filter_map(|index| self.sub_frame(index))
    }
}

fn sub_frame_end(frame: &FrameParser, position: usize) -> Option<usize> {
    if position >= frame.size() {
        return None;
    }
    let end = position + 1 + usize::from(frame.u8_at(position));
    (end <= frame.size()).then_some(end)
}

#[derive(Debug, Clone)]
pub struct MultipleFrameResponse {
    builder: FrameBuilder,
    count: u16,
}

impl Default for MultipleFrameResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipleFrameResponse {
    pub fn new() -> Self {
        let mut builder: FrameBuilder = FrameBuilder::new();
        RESPONSE_TAG.append(&mut builder, FrameType::MultipleFrameResponse.id());
        COUNT.append(&mut builder, 0);
        Self { builder, count: 0 }
    }

    /// Appends one sub-frame and patches the count field in place.
    pub fn add_sub_frame<F: Frame + ?Sized>(&mut self, sub_frame: &F) -> bool {
        let bytes = sub_frame.as_bytes();
        let Ok(size) = u8::try_from(bytes.len()) else {
            debug!("sub-frame of {} bytes exceeds {MAX_SUB_FRAME_SIZE}", bytes.len());
            return false;
        };
        if 1 + bytes.len() > self.builder.remaining() {
            debug!("multiple frame response full");
            return false;
        }
        self.builder.add_u8(size);
        self.builder.add_bytes(bytes);
        self.count += 1;
        COUNT.modify(&mut self.builder, self.count)
    }

    pub fn num_of_sub_frames(&self) -> usize {
        usize::from(self.count)
    }

    pub fn into_frame(self) -> FrameBuilderUser {
        self.builder.into()
    }
}

impl Frame for MultipleFrameResponse {
    fn as_bytes(&self) -> &[u8] {
        self.builder.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_back_to_back_sub_frames() {
        let request = MultipleFrameRequest::from_bytes(&[
            0x30, 0x00, 0x02, 0x00, 0x02, 0xaa, 0xbb, 0x01, 0xcc,
        ]);

        assert!(request.is_valid());
        assert_eq!(request.num_of_sub_frames(), 2);
        assert_eq!(request.sub_frame(0), Some(&[0xaa, 0xbb][..]));
        assert_eq!(request.sub_frame(1), Some(&[0xcc][..]));
        assert_eq!(request.sub_frame(2), None);
    }

    #[test]
    fn zero_sub_frames_only_with_bare_header() {
        assert!(MultipleFrameRequest::from_bytes(&[0x30, 0x00, 0x00, 0x00]).is_valid());
        assert!(!MultipleFrameRequest::from_bytes(&[0x30, 0x00, 0x00, 0x00, 0x00]).is_valid());
    }

    #[test]
    fn rejects_trailing_bytes_after_last_sub_frame() {
        let request = MultipleFrameRequest::from_bytes(&[0x30, 0x00, 0x01, 0x00, 0x01, 0xaa, 0xff]);

        assert!(!request.is_valid());
        assert_eq!(request.num_of_sub_frames(), 0);
    }

    #[test]
    fn rejects_count_beyond_data() {
        let request = MultipleFrameRequest::from_bytes(&[0x30, 0x00, 0x02, 0x00, 0x01, 0xaa]);

        assert!(!request.is_valid());
    }

    #[test]
    fn rejects_big_endian_request_tag() {
        assert!(!MultipleFrameRequest::from_bytes(&[0x00, 0x30, 0x00, 0x00]).is_valid());
    }

    #[test]
    fn response_count_tracks_every_append() {
        let mut response = MultipleFrameResponse::new();
        assert_eq!(response.as_bytes(), &[0x00, 0x31, 0x00, 0x00]);

        assert!(response.add_sub_frame(&FrameParser::new(&[0x21, 0x00, 0x00, 0x00])));
        assert!(response.add_sub_frame(&FrameParser::new(&[0x21, 0x00])));

        assert_eq!(
            response.as_bytes(),
            &[0x00, 0x31, 0x02, 0x00, 0x04, 0x21, 0x00, 0x00, 0x00, 0x02, 0x21, 0x00]
        );
        assert_eq!(response.num_of_sub_frames(), 2);
    }

    #[test]
    fn response_refuses_oversized_sub_frame() {
        let mut response = MultipleFrameResponse::new();
        let oversized = FrameParser::new(&[0u8; 256]);

        assert!(!response.add_sub_frame(&oversized));
        assert_eq!(response.size(), HEADER_SIZE);
    }
}
