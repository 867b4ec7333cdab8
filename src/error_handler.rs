//! Reply policy for datagrams that fail to decode.
//!
//! The replies produced here bypass the layer stack: they answer a
//! message that never entered it, so deduplication and reliability
//! must not account for them.

use log::debug;

use crate::message::{Code, DecodeError, Message, MessageType};

/// Fixed payload of the `4.02 Bad Option` acknowledgement.
pub(crate) const BAD_OPTIONS_PAYLOAD: &str =
    r#"Unrecognized options of class "critical" that occur in a Confirmable request"#;

/// Picks the direct reply for a decode failure, if the policy calls
/// for one.
pub(crate) fn error_reply(err: &DecodeError) -> Option<Message> {
    let m = &err.message;
    if err.is_format_error() {
        format_error_reply(m)
    } else {
        bad_options_reply(m)
    }
}

/// Malformed datagrams are rejected with a reset; acknowledgements and
/// resets that fail to parse are ignored.
fn format_error_reply(m: &Message) -> Option<Message> {
    match m.message_type {
        MessageType::Confirmable | MessageType::NonConfirmable => {
            if m.code.is_empty() {
                return None;
            }
            if m.code.is_request() {
                return Some(Message::rst(m.message_id));
            }
            if m.code.is_response() {
                if m.message_type == MessageType::Confirmable {
                    return Some(Message::rst(m.message_id));
                }
                debug!("ignore malformed non-confirmable response {}", m);
                return None;
            }
            debug!("ignore reserved code {}.{:02}", m.code.class(), m.code.detail());
            None
        }
        _ => {
            debug!("ignore malformed {}", m);
            None
        }
    }
}

/// A confirmable request carrying an unrecognized critical option is
/// answered with `4.02 Bad Option` and its token echoed; the other
/// message shapes degrade to the format-error policy.
fn bad_options_reply(m: &Message) -> Option<Message> {
    match m.message_type {
        MessageType::Confirmable if m.code.is_request() => {
            let mut reply = Message::ack(m.message_id);
            reply.code = Code::BAD_OPTION;
            reply.token = m.token.clone();
            reply.payload = BAD_OPTIONS_PAYLOAD.as_bytes().to_vec();
            Some(reply)
        }
        MessageType::Confirmable | MessageType::NonConfirmable => format_error_reply(m),
        _ => {
            debug!("ignore bad options on {}", m);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DecodeErrorKind, Message, MessageType};

    fn decode_error(kind: DecodeErrorKind, m: Message) -> DecodeError {
        DecodeError { kind, message: m }
    }

    fn message(t: MessageType, code: Code, message_id: u16) -> Message {
        Message { message_type: t, code, message_id, ..Message::default() }
    }

    #[test]
    fn format_error_on_requests_resets() {
        for t in [MessageType::Confirmable, MessageType::NonConfirmable] {
            let err = decode_error(
                DecodeErrorKind::OptionTruncated,
                message(t, Code::GET, 5),
            );
            let reply = error_reply(&err).unwrap();
            assert_eq!(reply.message_type, MessageType::Reset);
            assert_eq!(reply.message_id, 5);
        }
    }

    #[test]
    fn format_error_on_responses() {
        let err = decode_error(
            DecodeErrorKind::OptionTruncated,
            message(MessageType::Confirmable, Code::CONTENT, 6),
        );
        assert_eq!(error_reply(&err).unwrap().message_type, MessageType::Reset);

        let err = decode_error(
            DecodeErrorKind::OptionTruncated,
            message(MessageType::NonConfirmable, Code::CONTENT, 6),
        );
        assert!(error_reply(&err).is_none());
    }

    #[test]
    fn format_error_on_empty_and_ack_is_ignored() {
        let err = decode_error(
            DecodeErrorKind::ShortPacket,
            message(MessageType::Confirmable, Code::EMPTY, 0),
        );
        assert!(error_reply(&err).is_none());

        let err = decode_error(
            DecodeErrorKind::OptionTruncated,
            message(MessageType::Acknowledgement, Code::CONTENT, 9),
        );
        assert!(error_reply(&err).is_none());
    }

    #[test]
    fn bad_options_on_con_request_gets_402() {
        let mut m = message(MessageType::Confirmable, Code::GET, 7);
        m.token = b"tok".to_vec();
        let err = decode_error(DecodeErrorKind::BadOptions, m);
        let reply = error_reply(&err).unwrap();
        assert_eq!(reply.message_type, MessageType::Acknowledgement);
        assert_eq!(reply.code, Code::BAD_OPTION);
        assert_eq!(reply.message_id, 7);
        assert_eq!(reply.token, b"tok".to_vec());
        assert_eq!(reply.payload, BAD_OPTIONS_PAYLOAD.as_bytes());
    }

    #[test]
    fn bad_options_elsewhere_degrades_to_reset_policy() {
        let err = decode_error(
            DecodeErrorKind::BadOptions,
            message(MessageType::NonConfirmable, Code::GET, 8),
        );
        assert_eq!(error_reply(&err).unwrap().message_type, MessageType::Reset);

        let err = decode_error(
            DecodeErrorKind::BadOptions,
            message(MessageType::Confirmable, Code::CONTENT, 8),
        );
        assert_eq!(error_reply(&err).unwrap().message_type, MessageType::Reset);

        let err = decode_error(
            DecodeErrorKind::BadOptions,
            message(MessageType::Acknowledgement, Code::CONTENT, 8),
        );
        assert!(error_reply(&err).is_none());
    }
}
