//! Property tests for the frame codec and its envelopes.

use appliance_common::frame::{Frame, FrameBuilder, FrameParser};
use appliance_common::protocol::{MultipleFrameRequest, ParameterDataRequest, ParameterDataResponse};
use proptest::collection::vec;
use proptest::prelude::*;

fn items() -> impl Strategy<Value = Vec<(u16, Vec<u8>)>> {
    vec((any::<u16>(), vec(any::<u8>(), 0..20)), 1..6)
}

fn sub_frames() -> impl Strategy<Value = Vec<Vec<u8>>> {
    vec(vec(any::<u8>(), 0..16), 0..5)
}

fn multiple_frame(sub_frames: &[Vec<u8>]) -> Vec<u8> {
    let mut bytes = vec![0x30, 0x00];
    bytes.extend((sub_frames.len() as u16).to_le_bytes());
    for sub_frame in sub_frames {
        bytes.push(sub_frame.len() as u8);
        bytes.extend(sub_frame);
    }
    bytes
}

proptest! {
    /// Reads at or past the end return 0 for every width.
    #[test]
    fn reads_past_end_are_zero(bytes in vec(any::<u8>(), 1..64), extra in 0usize..8) {
        let parser = FrameParser::new(&bytes);
        let offset = parser.size() + extra;

        prop_assert_eq!(parser.u8_at(offset), 0);
        prop_assert_eq!(parser.u16_lsb(offset), 0);
        prop_assert_eq!(parser.u16_msb(offset), 0);
        prop_assert_eq!(parser.u32_lsb(offset), 0);
        prop_assert_eq!(parser.u32_msb(offset), 0);
        prop_assert_eq!(parser.i32_lsb(offset), 0);
        prop_assert_eq!(parser.i32_msb(offset), 0);
    }

    /// A multi-byte read straddling the end is refused rather than truncated.
    #[test]
    fn straddling_reads_are_zero(bytes in vec(1u8..=255, 1..64)) {
        let parser = FrameParser::new(&bytes);
        let last = parser.size() - 1;

        prop_assert_eq!(parser.u16_lsb(last), 0);
        prop_assert_eq!(parser.u32_msb(last), 0);
    }

    #[test]
    fn modify_never_changes_size(bytes in vec(any::<u8>(), 0..32), index in 0usize..40, value in any::<u8>()) {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_bytes(&bytes);

        let modified = builder.modify_u8_at(index, value);

        prop_assert_eq!(modified, index < bytes.len());
        prop_assert_eq!(builder.size(), bytes.len());
    }

    #[test]
    fn finalize_is_idempotent(items in items()) {
        let mut response = ParameterDataResponse::new();
        for (id, data) in &items {
            prop_assert!(response.add_parameter_data(*id, data));
        }

        prop_assert!(response.finalize());
        let once = response.as_bytes().to_vec();
        prop_assert!(response.finalize());

        prop_assert_eq!(response.as_bytes(), &once[..]);
        prop_assert!(!response.add_parameter_data(0x0101, &[1]));
    }

    /// A finalized response re-tagged as a request parses back to the same items.
    #[test]
    fn response_items_parse_back(items in items()) {
        let mut response = ParameterDataResponse::new();
        for (id, data) in &items {
            response.add_parameter_data(*id, data);
        }
        response.finalize();

        let mut bytes = response.as_bytes().to_vec();
        bytes[..2].copy_from_slice(&[0x20, 0x00]);
        let request = ParameterDataRequest::from_bytes(&bytes);

        prop_assert!(request.is_valid());
        let parsed: Vec<(u16, Vec<u8>)> = request
            .items()
            .map(|item| (item.id, item.data.to_vec()))
            .collect();
        prop_assert_eq!(parsed, items);
    }

    #[test]
    fn well_formed_multiple_frame_is_valid(sub_frames in sub_frames()) {
        let request = MultipleFrameRequest::from_bytes(&multiple_frame(&sub_frames));

        prop_assert!(request.is_valid());
        prop_assert_eq!(request.num_of_sub_frames(), sub_frames.len());
        let parsed: Vec<Vec<u8>> = request.sub_frames().map(<[u8]>::to_vec).collect();
        prop_assert_eq!(parsed, sub_frames);
    }

    /// Any slack after the last sub-frame invalidates the whole request.
    #[test]
    fn slack_bytes_invalidate_multiple_frame(sub_frames in sub_frames(), slack in vec(any::<u8>(), 1..4)) {
        let mut bytes = multiple_frame(&sub_frames);
        bytes.extend(slack);

        let request = MultipleFrameRequest::from_bytes(&bytes);

        prop_assert!(!request.is_valid());
        prop_assert_eq!(request.num_of_sub_frames(), 0);
    }

    #[test]
    fn truncated_multiple_frame_is_invalid(sub_frames in sub_frames(), cut in 1usize..4) {
        let mut bytes = multiple_frame(&sub_frames);
        let keep = bytes.len().saturating_sub(cut).max(4);
        prop_assume!(keep < bytes.len());
        bytes.truncate(keep);

        prop_assert!(!MultipleFrameRequest::from_bytes(&bytes).is_valid());
    }
}
