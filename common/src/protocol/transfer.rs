//! JSON envelope around Base64 frames on the `transferFrame` device method.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::TransferFrameError;
use crate::frame::{Frame, FrameParser, MAX_BUILDER_SIZE, MAX_PARSER_SIZE};

/// Base64 of the largest builder frame.
pub const MAX_ENCODED_FRAME_LEN: usize = MAX_BUILDER_SIZE.div_ceil(3) * 4;

#[derive(Debug, Deserialize)]
struct TransferFrameRequestBody {
    #[serde(rename = "timeoutInMilliSec")]
    timeout_in_milli_sec: u32,
    frame: Option<String>,
}

/// Decoded `{"timeoutInMilliSec": .., "frame": ".."}` request.
#[derive(Debug, Clone)]
pub struct TransferFrameRequest {
    pub timeout_ms: u32,
    pub frame: FrameParser,
}

impl TransferFrameRequest {
    pub fn parse(json: &[u8]) -> Result<Self, TransferFrameError> {
        let body: TransferFrameRequestBody = serde_json::from_slice(json)?;
        let encoded = body.frame.ok_or(TransferFrameError::MissingFrame)?;
        let bytes = STANDARD.decode(encoded.as_bytes())?;
        if bytes.is_empty() || bytes.len() > MAX_PARSER_SIZE {
            return Err(TransferFrameError::FrameSize(bytes.len()));
        }
        Ok(Self {
            timeout_ms: body.timeout_in_milli_sec,
            frame: FrameParser::new(&bytes),
        })
    }
}

/// `{"frame": "<base64>"}`, or `{"frame": null}` when there is nothing to answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFrameResponse {
    pub frame: Option<String>,
}

impl TransferFrameResponse {
    pub fn empty() -> Self {
        Self { frame: None }
    }

    pub fn from_frame<F: Frame + ?Sized>(frame: &F) -> Result<Self, TransferFrameError> {
        if frame.is_empty() {
            return Err(TransferFrameError::EmptyFrame);
        }
        let mut buffer = [0u8; MAX_ENCODED_FRAME_LEN];
        let written = STANDARD
            .encode_slice(frame.as_bytes(), &mut buffer)
            .map_err(|_| TransferFrameError::EncodeBuffer(MAX_ENCODED_FRAME_LEN))?;
        let encoded = core::str::from_utf8(&buffer[..written])
            .map_err(|_| TransferFrameError::EncodeBuffer(MAX_ENCODED_FRAME_LEN))?;
        Ok(Self {
            frame: Some(encoded.to_string()),
        })
    }

    /// Decoded frame bytes, if any.
    pub fn decode(&self) -> Result<Option<FrameParser>, TransferFrameError> {
        match &self.frame {
            Some(encoded) => Ok(Some(FrameParser::new(&STANDARD.decode(encoded)?))),
            None => Ok(None),
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{\"frame\":null}".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;

    #[test]
    fn parses_request_envelope() {
        let request =
            TransferFrameRequest::parse(br#"{"timeoutInMilliSec": 5000, "frame": "ABQAAA=="}"#)
                .unwrap();

        assert_eq!(request.timeout_ms, 5000);
        assert_eq!(request.frame.as_bytes(), &[0x00, 0x14, 0x00, 0x00]);
    }

    #[test]
    fn rejects_broken_envelopes() {
        assert!(matches!(
            TransferFrameRequest::parse(b"{not json"),
            Err(TransferFrameError::Json(_))
        ));
        assert!(matches!(
            TransferFrameRequest::parse(br#"{"frame": "ABQAAA=="}"#),
            Err(TransferFrameError::Json(_))
        ));
        assert!(matches!(
            TransferFrameRequest::parse(br#"{"timeoutInMilliSec": 1}"#),
            Err(TransferFrameError::MissingFrame)
        ));
        assert!(matches!(
            TransferFrameRequest::parse(br#"{"timeoutInMilliSec": 1, "frame": "!!!"}"#),
            Err(TransferFrameError::Base64(_))
        ));
        assert!(matches!(
            TransferFrameRequest::parse(br#"{"timeoutInMilliSec": 1, "frame": ""}"#),
            Err(TransferFrameError::FrameSize(0))
        ));
    }

    #[test]
    fn encodes_builder_bytes() {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_bytes(&[0x00, 0x14, 0x00, 0x00]);

        let response = TransferFrameResponse::from_frame(&builder).unwrap();

        assert_eq!(response.frame.as_deref(), Some("ABQAAA=="));
        assert_eq!(response.to_json(), br#"{"frame":"ABQAAA=="}"#.to_vec());
        assert_eq!(
            response.decode().unwrap().unwrap().as_bytes(),
            &[0x00, 0x14, 0x00, 0x00]
        );
    }

    #[test]
    fn refuses_empty_frame_and_serializes_null() {
        let builder: FrameBuilder = FrameBuilder::new();

        assert!(matches!(
            TransferFrameResponse::from_frame(&builder),
            Err(TransferFrameError::EmptyFrame)
        ));
        assert_eq!(TransferFrameResponse::empty().to_json(), br#"{"frame":null}"#.to_vec());
    }

    #[test]
    fn full_builder_fits_encode_buffer() {
        let mut builder: FrameBuilder = FrameBuilder::new();
        builder.add_bytes(&[0xab; MAX_BUILDER_SIZE]);

        assert!(TransferFrameResponse::from_frame(&builder).is_ok());
    }
}
