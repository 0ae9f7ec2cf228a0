// ABOUTME: Thin adapter over the amq-protocol wire codec
// ABOUTME: Marshals outbound frames and incrementally unmarshals the inbound byte stream

use amq_protocol::frame::{AMQPFrame, gen_frame, parse_frame};

use crate::client::error::{Error, Result};

/// Serialize a frame to its wire representation.
pub(crate) fn marshal(frame: &AMQPFrame) -> Result<Vec<u8>> {
    cookie_factory::gen_simple(gen_frame(frame), Vec::new())
        .map_err(|err| Error::Marshal(format!("{err:?}")))
}

/// Attempt to decode one frame from the front of `bytes`.
///
/// Returns the number of bytes consumed together with the decoded frame,
/// or `None` when the buffer does not yet hold a complete frame; the caller
/// retains the bytes and reads more. Definitively invalid input is an
/// error.
pub(crate) fn unmarshal(bytes: &[u8]) -> Result<Option<(usize, AMQPFrame)>> {
    match parse_frame(bytes) {
        Ok((remaining, frame)) => Ok(Some((bytes.len() - remaining.len(), frame))),
        Err(err) if err.is_incomplete() => Ok(None),
        Err(err) => Err(Error::Unmarshal(format!("{err:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol::protocol::basic;
    use amq_protocol::protocol::AMQPClass;

    #[test]
    fn heartbeat_frame_wire_format() {
        let bytes = marshal(&AMQPFrame::Heartbeat(0)).unwrap();
        // type 8, channel 0, zero-length payload, frame-end octet
        assert_eq!(bytes, vec![8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn method_frame_roundtrip() {
        let frame = AMQPFrame::Method(
            1,
            AMQPClass::Basic(basic::AMQPMethod::Publish(basic::Publish {
                exchange: "amq.topic".into(),
                routing_key: "a.b".into(),
                mandatory: true,
                immediate: false,
            })),
        );
        let bytes = marshal(&frame).unwrap();
        let (consumed, decoded) = unmarshal(&bytes).unwrap().expect("complete frame");
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_input_requests_more_bytes() {
        let bytes = marshal(&AMQPFrame::Heartbeat(0)).unwrap();
        assert!(unmarshal(&bytes[..5]).unwrap().is_none());
        assert!(unmarshal(&[]).unwrap().is_none());
    }

    #[test]
    fn trailing_bytes_are_left_in_the_buffer() {
        let mut bytes = marshal(&AMQPFrame::Heartbeat(0)).unwrap();
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[8, 0]);
        let (consumed, decoded) = unmarshal(&bytes).unwrap().expect("complete frame");
        assert_eq!(consumed, frame_len);
        assert_eq!(decoded, AMQPFrame::Heartbeat(0));
    }

    #[test]
    fn invalid_frame_end_is_an_error() {
        let mut bytes = marshal(&AMQPFrame::Heartbeat(0)).unwrap();
        *bytes.last_mut().unwrap() = 0x00;
        assert!(matches!(unmarshal(&bytes), Err(Error::Unmarshal(_))));
    }
}
