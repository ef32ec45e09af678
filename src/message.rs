//! 프로토콜 메시지 정의
//!
//! 텍스트 명령은 ASCII, `:` 구분자, 대소문자 구분.
//! 바이너리 페이로드(메타데이터, 청크 데이터)는 마지막 구분자 뒤에 그대로 붙으며
//! 길이는 "헤더 뒤 남은 바이트 수"로만 결정된다.
//!
//! ```text
//! C->S  REQUEST_METADATA:<filename>
//! C->S  REQUEST_CHUNK:<filename>:<chunk_id>
//! S->C  REPLY:<seq>:META:<filename>:<24-byte metadata>
//! S->C  REPLY:<seq>:CHUNK:<filename>:<chunk_id>:<bytes>
//! S->C  REPLY:<seq>:ERROR:<reason>
//! C->S  REPLY:<seq>:ACK
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::{ChunkId, Metadata};
use crate::error::{DecodeError, Error, Result};
use crate::MAX_FILENAME_LEN;

/// 메타데이터 요청 명령
pub const CMD_REQUEST_METADATA: &str = "REQUEST_METADATA";

/// 청크 요청 명령
pub const CMD_REQUEST_CHUNK: &str = "REQUEST_CHUNK";

/// 응답/ACK 공통 명령
pub const CMD_REPLY: &str = "REPLY";

const TAG_META: &[u8] = b"META";
const TAG_CHUNK: &[u8] = b"CHUNK";
const TAG_ERROR: &[u8] = b"ERROR";
const TAG_ACK: &[u8] = b"ACK";

/// 필드 구분자
const DELIMITER: u8 = b':';

/// CRC 트레일러 크기
pub const CHECKSUM_LEN: usize = 4;

/// 서버 -> 클라이언트 응답 본문 (시퀀스 번호 제외)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// 파일 메타데이터
    Meta { filename: String, metadata: Metadata },

    /// 청크 데이터
    Chunk {
        filename: String,
        chunk_id: ChunkId,
        data: Bytes,
    },

    /// 에러 (예: `BAD REQUEST`)
    Error { reason: String },
}

impl ReplyBody {
    /// 시퀀스 번호를 붙여 완성된 응답 메시지로 변환
    pub fn into_reply(self, seq: u64) -> Message {
        Message::Reply { seq, body: self }
    }

    fn tag(&self) -> &'static str {
        match self {
            ReplyBody::Meta { .. } => "META",
            ReplyBody::Chunk { .. } => "CHUNK",
            ReplyBody::Error { .. } => "ERROR",
        }
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestMetadata { filename: String },
    RequestChunk { filename: String, chunk_id: ChunkId },
    Reply { seq: u64, body: ReplyBody },
    Ack { seq: u64 },
}

impl Message {
    /// 응답이나 ACK이면 시퀀스 번호 반환
    pub fn seq(&self) -> Option<u64> {
        match self {
            Message::Reply { seq, .. } | Message::Ack { seq } => Some(*seq),
            _ => None,
        }
    }

    /// 요청 명령으로 시작하는 데이터그램인지 (필드 파싱 여부와 무관)
    pub fn is_request_command(datagram: &[u8]) -> bool {
        datagram.starts_with(CMD_REQUEST_METADATA.as_bytes())
            || datagram.starts_with(CMD_REQUEST_CHUNK.as_bytes())
    }

    /// 헤더 + 페이로드를 버퍼에 기록 (트레일러 제외)
    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Message::RequestMetadata { filename } => {
                buf.put_slice(format!("{}:{}", CMD_REQUEST_METADATA, filename).as_bytes());
            }
            Message::RequestChunk { filename, chunk_id } => {
                buf.put_slice(
                    format!("{}:{}:{}", CMD_REQUEST_CHUNK, filename, chunk_id).as_bytes(),
                );
            }
            Message::Ack { seq } => {
                buf.put_slice(format!("{}:{}:ACK", CMD_REPLY, seq).as_bytes());
            }
            Message::Reply { seq, body } => {
                buf.put_slice(format!("{}:{}:{}:", CMD_REPLY, seq, body.tag()).as_bytes());
                match body {
                    ReplyBody::Meta { filename, metadata } => {
                        buf.put_slice(filename.as_bytes());
                        buf.put_u8(DELIMITER);
                        buf.put_slice(&metadata.to_bytes());
                    }
                    ReplyBody::Chunk {
                        filename,
                        chunk_id,
                        data,
                    } => {
                        buf.put_slice(format!("{}:{}:", filename, chunk_id).as_bytes());
                        buf.put_slice(data);
                    }
                    ReplyBody::Error { reason } => {
                        buf.put_slice(reason.as_bytes());
                    }
                }
            }
        }
    }

    /// 트레일러가 제거된 바이트에서 메시지 파싱
    pub fn parse(buf: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (command, rest) = split_field(buf)
            .ok_or_else(|| malformed("missing command delimiter"))?;

        match command {
            c if c == CMD_REQUEST_METADATA.as_bytes() => {
                let filename = parse_filename(rest)?;
                Ok(Message::RequestMetadata { filename })
            }
            c if c == CMD_REQUEST_CHUNK.as_bytes() => {
                let (name, id) =
                    split_field(rest).ok_or_else(|| malformed("missing chunk id"))?;
                Ok(Message::RequestChunk {
                    filename: parse_filename(name)?,
                    chunk_id: parse_u64(id, "chunk id")?,
                })
            }
            c if c == CMD_REPLY.as_bytes() => parse_reply(rest),
            _ => Err(malformed("unknown command")),
        }
    }
}

/// `REPLY:` 이후 부분 파싱
fn parse_reply(buf: &[u8]) -> std::result::Result<Message, DecodeError> {
    let (seq, rest) = split_field(buf).ok_or_else(|| malformed("missing reply tag"))?;
    let seq = parse_u64(seq, "sequence number")?;

    if rest == TAG_ACK {
        return Ok(Message::Ack { seq });
    }

    let (tag, fields) = split_field(rest).ok_or_else(|| malformed("missing reply fields"))?;
    let body = match tag {
        TAG_META => {
            let (name, payload) =
                split_field(fields).ok_or_else(|| malformed("missing metadata payload"))?;
            ReplyBody::Meta {
                filename: parse_filename(name)?,
                metadata: Metadata::from_bytes(payload)?,
            }
        }
        TAG_CHUNK => {
            let (name, rest) = split_field(fields).ok_or_else(|| malformed("missing chunk id"))?;
            let (id, payload) =
                split_field(rest).ok_or_else(|| malformed("missing chunk payload"))?;
            ReplyBody::Chunk {
                filename: parse_filename(name)?,
                chunk_id: parse_u64(id, "chunk id")?,
                data: Bytes::copy_from_slice(payload),
            }
        }
        TAG_ERROR => {
            let reason = String::from_utf8_lossy(fields);
            ReplyBody::Error {
                reason: reason.trim_end_matches('\0').to_string(),
            }
        }
        _ => return Err(malformed("unknown reply tag")),
    };

    Ok(Message::Reply { seq, body })
}

/// 첫 번째 구분자에서 분리 (구분자 없으면 None)
fn split_field(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = buf.iter().position(|&b| b == DELIMITER)?;
    Some((&buf[..pos], &buf[pos + 1..]))
}

fn parse_u64(field: &[u8], what: &str) -> std::result::Result<u64, DecodeError> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(malformed(&format!("invalid {}", what)));
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(&format!("{} out of range", what)))
}

/// 파일명 필드 (구조적 검사만; 경로 정책은 서버가 따로 검사)
fn parse_filename(field: &[u8]) -> std::result::Result<String, DecodeError> {
    if field.contains(&DELIMITER) {
        return Err(malformed("delimiter in filename"));
    }
    String::from_utf8(field.to_vec()).map_err(|_| malformed("filename is not utf-8"))
}

fn malformed(reason: &str) -> DecodeError {
    DecodeError::MalformedMessage(reason.to_string())
}

/// 파일명 정책 검사
///
/// 비어 있거나, 너무 길거나, 구분자/경로 구분자/NUL을 포함하거나, `.`/`..`이면 거부.
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(Error::BadRequest("missing filename".into()));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(Error::BadRequest(format!(
            "filename longer than {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    if filename == "." || filename == ".." {
        return Err(Error::BadRequest(format!("invalid filename {:?}", filename)));
    }
    if filename.contains(|c| matches!(c, ':' | '/' | '\\' | '\0')) {
        return Err(Error::BadRequest(format!(
            "forbidden character in filename {:?}",
            filename
        )));
    }
    Ok(())
}

/// 와이어 코덱
///
/// 한 방향의 모든 데이터그램에 같은 트레일러 정책을 적용한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    /// CRC-32 트레일러 사용 여부
    checksum: bool,
}

impl WireCodec {
    pub fn new(checksum: bool) -> Self {
        Self { checksum }
    }

    /// 트레일러 사용 여부
    pub fn checksum(&self) -> bool {
        self.checksum
    }

    /// 메시지를 데이터그램으로 인코딩
    pub fn encode(&self, msg: &Message) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        msg.write_to(&mut buf);
        if self.checksum {
            let crc = crc32fast::hash(&buf);
            buf.put_u32(crc);
        }
        buf.freeze()
    }

    /// 데이터그램을 메시지로 디코딩
    ///
    /// 트레일러를 먼저 검증하고 제거한 뒤 파싱한다.
    pub fn decode(&self, datagram: &[u8]) -> std::result::Result<Message, DecodeError> {
        let body = if self.checksum {
            strip_checksum(datagram)?
        } else {
            datagram
        };
        Message::parse(body)
    }
}

/// CRC 트레일러 검증 후 본문 반환
pub fn strip_checksum(datagram: &[u8]) -> std::result::Result<&[u8], DecodeError> {
    if datagram.len() < CHECKSUM_LEN {
        return Err(malformed("datagram shorter than checksum trailer"));
    }
    let (body, trailer) = datagram.split_at(datagram.len() - CHECKSUM_LEN);
    let got = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let expected = crc32fast::hash(body);
    if got != expected {
        return Err(DecodeError::ChecksumMismatch { expected, got });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Message> {
        vec![
            Message::RequestMetadata {
                filename: "1MB.txt".into(),
            },
            Message::RequestChunk {
                filename: "1MB.txt".into(),
                chunk_id: 5,
            },
            ReplyBody::Meta {
                filename: "1MB.txt".into(),
                // 0x3A == ':' 가 페이로드 안에 있어도 문제없어야 함
                metadata: Metadata::new(0x3A3A, 1024),
            }
            .into_reply(0),
            ReplyBody::Chunk {
                filename: "a b.bin".into(),
                chunk_id: 2,
                data: Bytes::from_static(b"::\0binary:payload\xff"),
            }
            .into_reply(17),
            ReplyBody::Error {
                reason: "BAD REQUEST".into(),
            }
            .into_reply(u64::MAX),
            Message::Ack { seq: 42 },
        ]
    }

    #[test]
    fn test_round_trip_plain_and_checksummed() {
        for codec in [WireCodec::new(false), WireCodec::new(true)] {
            for msg in samples() {
                let bytes = codec.encode(&msg);
                assert_eq!(codec.decode(&bytes).unwrap(), msg);
            }
        }
    }

    #[test]
    fn test_exact_wire_text() {
        let codec = WireCodec::new(false);
        let ack = codec.encode(&Message::Ack { seq: 7 });
        assert_eq!(&ack[..], b"REPLY:7:ACK");

        let req = codec.encode(&Message::RequestChunk {
            filename: "hi".into(),
            chunk_id: 10,
        });
        assert_eq!(&req[..], b"REQUEST_CHUNK:hi:10");

        let err = codec.encode(
            &ReplyBody::Error {
                reason: "BAD REQUEST".into(),
            }
            .into_reply(3),
        );
        assert_eq!(&err[..], b"REPLY:3:ERROR:BAD REQUEST");
    }

    #[test]
    fn test_chunk_payload_is_remaining_bytes() {
        let codec = WireCodec::new(false);
        let msg = codec
            .decode(b"REPLY:1:CHUNK:f:0:abc:def")
            .unwrap();
        match msg {
            Message::Reply {
                body: ReplyBody::Chunk { data, .. },
                ..
            } => assert_eq!(&data[..], b"abc:def"),
            other => panic!("unexpected {:?}", other),
        }

        let empty = codec.decode(b"REPLY:1:CHUNK:f:0:").unwrap();
        assert!(matches!(
            empty,
            Message::Reply { body: ReplyBody::Chunk { ref data, .. }, .. } if data.is_empty()
        ));
    }

    #[test]
    fn test_malformed_inputs() {
        let codec = WireCodec::new(false);
        let cases: &[&[u8]] = &[
            b"",
            b"ssss",
            b"REQUEST_METADATA",
            b"REQUEST_CHUNK:hi:",
            b"REQUEST_CHUNK:_serverlist.svl",
            b"REQUEST_CHUNK:f:+5",
            b"REQUEST_CHUNK:f:99999999999999999999999",
            b"REPLY:x:ACK",
            b"REPLY:1",
            b"REPLY:1:ACKK",
            b"REPLY:1:META:f:short",
            b"REPLY:1:CHUNK:f:1",
            b"REPLY:1:NOPE:x",
            b"\xff\xfe:\x00",
        ];
        for case in cases {
            assert!(
                matches!(codec.decode(case), Err(DecodeError::MalformedMessage(_))),
                "expected malformed for {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_checksum_mismatch() {
        let codec = WireCodec::new(true);
        let mut bytes = codec
            .encode(&Message::RequestMetadata {
                filename: "x".into(),
            })
            .to_vec();
        bytes[3] ^= 0x01;
        assert!(matches!(
            codec.decode(&bytes),
            Err(DecodeError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            codec.decode(b"abc"),
            Err(DecodeError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_crc32_reference_vector() {
        // IEEE CRC-32 (0xEDB88320 reflected) 표준 검증 값
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);

        let codec = WireCodec::new(true);
        let bytes = codec.encode(&Message::Ack { seq: 1 });
        assert_eq!(&bytes[bytes.len() - 4..], &crc32fast::hash(b"REPLY:1:ACK").to_be_bytes());
    }

    #[test]
    fn test_is_request_command() {
        assert!(Message::is_request_command(b"REQUEST_CHUNK:hi:"));
        assert!(Message::is_request_command(b"REQUEST_METADATA"));
        assert!(!Message::is_request_command(b"REPLY:1:ACK"));
        assert!(!Message::is_request_command(b"ssss"));
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("1MB.txt").is_ok());
        assert!(validate_filename("server_list.txt").is_ok());
        assert!(validate_filename("..hidden").is_ok());

        for bad in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "a:b", "nul\0"] {
            assert!(
                matches!(validate_filename(bad), Err(Error::BadRequest(_))),
                "{:?} should be rejected",
                bad
            );
        }
        assert!(validate_filename(&"x".repeat(MAX_FILENAME_LEN + 1)).is_err());
    }
}
