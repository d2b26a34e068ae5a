//! `{id, size, data}` parameter items behind an APPLIANCE_PARAMS tag.
//!
//! ```text
//! request:  [0x20 0x00][id lo][id hi][size][data..] ... [0x00 0x00]
//! response: [0x21 0x00][id lo][id hi][size][data..] ... [0x00 0x00]
//! ```

use log::debug;

use crate::frame::{Frame, FrameBuilder, FrameBuilderUser, FrameParser, FrameType, LittleEndianU16};

pub const END_OF_FRAME: u16 = 0x0000;
pub const END_MARKER_LEN: usize = 2;
pub const ITEM_HEADER_LEN: usize = 3;
/// Tag, one empty item, end marker.
pub const MIN_REQUEST_SIZE: usize = 2 + ITEM_HEADER_LEN + END_MARKER_LEN;
/// A response has to fit a one-byte sub-frame size.
pub const MAX_RESPONSE_SIZE: usize = u8::MAX as usize;

const TAG: LittleEndianU16 = LittleEndianU16::at(0);
const FIRST_ITEM_OFFSET: usize = 2;

/// One parameter item borrowed from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterData<'a> {
    pub id: u16,
    pub data: &'a [u8],
}

impl ParameterData<'_> {
    pub fn size(&self) -> u8 {
        self.data.len() as u8
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterDataRequest {
    frame: FrameParser,
    num_of_param_data: usize,
}

impl ParameterDataRequest {
    pub fn new(frame: FrameParser) -> Self {
        let num_of_param_data = Self::validate(&frame);
        Self {
            frame,
            num_of_param_data,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(FrameParser::new(bytes))
    }

    /// Number of complete items, or 0 when anything about the frame is off.
    fn validate(frame: &FrameParser) -> usize {
        let size = frame.size();
        if !FrameType::ApplianceParamsRequest.matches(frame) {
            debug!("parameter data request has wrong tag {:#06x}", TAG.read(frame));
            return 0;
        }
        if size < MIN_REQUEST_SIZE {
            debug!("parameter data request too short: {size} bytes");
            return 0;
        }
        if frame.u16_lsb(size - END_MARKER_LEN) != END_OF_FRAME {
            debug!("parameter data request missing end marker");
            return 0;
        }

        let payload_end = size - END_MARKER_LEN;
        let mut position = FIRST_ITEM_OFFSET;
        let mut count = 0;
        while let Some(next) = next_item(frame, position, payload_end) {
            position = next;
            count += 1;
        }

        if position + END_MARKER_LEN != size {
            debug!("parameter data request has {} slack bytes", size - position);
            return 0;
        }
        count
    }

    pub fn is_valid(&self) -> bool {
        self.num_of_param_data > 0
    }

    pub fn num_of_param_data(&self) -> usize {
        self.num_of_param_data
    }

    pub fn param_data_id(&self, index: usize) -> u16 {
        self.item(index).map(|item| item.id).unwrap_or(0)
    }

    pub fn param_data_size(&self, index: usize) -> u8 {
        self.item(index).map(|item| item.size()).unwrap_or(0)
    }

    pub fn param_data(&self, index: usize) -> Option<&[u8]> {
        self.item(index).map(|item| item.data)
    }

    /// Walks the frame from the first item on every call.
    pub fn item(&self, index: usize) -> Option<ParameterData<'_>> {
        if index >= self.num_of_param_data {
            return None;
        }
        let payload_end = self.frame.size() - END_MARKER_LEN;
        let mut position = FIRST_ITEM_OFFSET;
        for _ in 0..index {
            position = next_item(&self.frame, position, payload_end)?;
        }
        let size = usize::from(self.frame.u8_at(position + 2));
        Some(ParameterData {
            id: self.frame.u16_lsb(position),
            data: self.frame.bytes_at(position + ITEM_HEADER_LEN, size)?,
        })
    }

    pub fn items(&self) -> impl Iterator<Item = ParameterData<'_>> + '_ {
        (0..self.num_of_param_data).filter_map(|index| self.item(index))
    }
}

/// End of the item starting at `position`, if it lies fully before `payload_end`.
fn next_item(frame: &FrameParser, position: usize, payload_end: usize) -> Option<usize> {
    if position + ITEM_HEADER_LEN > payload_end {
        return None;
    }
    let size = usize::from(frame.u8_at(position + 2));
    let end = position + ITEM_HEADER_LEN + size;
    (end <= payload_end).then_some(end)
}

#[derive(Debug, Clone)]
pub struct ParameterDataResponse {
    builder: FrameBuilder<MAX_RESPONSE_SIZE>,
    count: usize,
    finalized: bool,
}

impl Default for ParameterDataResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterDataResponse {
    pub fn new() -> Self {
        let mut builder = FrameBuilder::<MAX_RESPONSE_SIZE>::new();
        TAG.append(&mut builder, FrameType::ApplianceParamsResponse.id());
        Self {
            builder,
            count: 0,
            finalized: false,
        }
    }

    /// Appends one item, keeping room for the end marker. Always fails once
    /// the response is finalized.
    pub fn add_parameter_data(&mut self, id: u16, data: &[u8]) -> bool {
        if self.finalized {
            debug!("parameter {id:#06x} dropped: response already finalized");
            return false;
        }
        let Ok(size) = u8::try_from(data.len()) else {
            return false;
        };
        if ITEM_HEADER_LEN + data.len() + END_MARKER_LEN > self.builder.remaining() {
            debug!("parameter {id:#06x} does not fit the response");
            return false;
        }
        self.builder.add_u16_lsb(id);
        self.builder.add_u8(size);
        self.builder.add_bytes(data);
        self.count += 1;
        true
    }

    /// Appends the end marker once; further calls change nothing.
    pub fn finalize(&mut self) -> bool {
        if self.finalized {
            return true;
        }
        self.finalized = self.builder.add_u16_lsb(END_OF_FRAME);
        self.finalized
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn num_of_param_data(&self) -> usize {
        self.count
    }

    pub fn into_frame(self) -> FrameBuilderUser<MAX_RESPONSE_SIZE> {
        self.builder.into()
    }
}

impl Frame for ParameterDataResponse {
    fn as_bytes(&self) -> &[u8] {
        self.builder.as_bytes()
    }
}
