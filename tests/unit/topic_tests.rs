//! Unit tests for control-protocol framing and sanitization.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use world_warden::session::topic::{sanitize_command, TopicCodec, MAX_LINE_BYTES};
use world_warden::AppError;

#[test]
fn sanitize_accepts_plain_commands() {
    assert_eq!(sanitize_command("ping").expect("valid"), "ping");
    assert_eq!(
        sanitize_command("set-port 4777").expect("valid"),
        "set-port 4777"
    );
}

#[test]
fn sanitize_rejects_the_delimiter() {
    for command in ["ping\nextra", "ping\r", "a\r\nb"] {
        let err = sanitize_command(command).expect_err("delimiter must fail");
        assert!(matches!(err, AppError::Invalid(_)), "{command:?}");
    }
}

#[test]
fn sanitize_rejects_empty_commands() {
    let err = sanitize_command("").expect_err("empty must fail");
    assert!(matches!(err, AppError::Invalid(_)));
}

#[test]
fn codec_round_trips_one_line() {
    let mut codec = TopicCodec::new();
    let mut buffer = BytesMut::new();

    codec
        .encode("token ping".to_owned(), &mut buffer)
        .expect("encode");
    assert_eq!(&buffer[..], b"token ping\n");

    let decoded = codec.decode(&mut buffer).expect("decode");
    assert_eq!(decoded.as_deref(), Some("token ping"));
}

#[test]
fn codec_buffers_partial_lines() {
    let mut codec = TopicCodec::new();
    let mut buffer = BytesMut::from("no newline yet");

    assert!(codec.decode(&mut buffer).expect("decode").is_none());

    buffer.extend_from_slice(b" done\n");
    assert_eq!(
        codec.decode(&mut buffer).expect("decode").as_deref(),
        Some("no newline yet done")
    );
}

#[test]
fn codec_rejects_oversized_lines() {
    let mut codec = TopicCodec::new();
    let mut buffer = BytesMut::from(vec![b'a'; MAX_LINE_BYTES + 1].as_slice());

    let err = codec.decode(&mut buffer).expect_err("oversized must fail");
    assert!(matches!(err, AppError::Communication(_)));
}
