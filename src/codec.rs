// ABOUTME: Wire codec for the control-plane grammar and both frame framings (v2 text, v3 binary)
// ABOUTME: Parsing is total: malformed input yields None/Err values, never a panic or partial commit

use crate::datatypes::{
    AudioDirection, AudioFormat, Epoch, StreamConfig, StreamStateCode, ViewerCaps, parse_fps,
};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Upper bound for a single control line, newline included. Anything
/// longer is a protocol violation, not a buffering situation.
pub const MAX_LINE_LEN: usize = 4096;

/// Maximum accepted payload for frames, CSD blobs, and audio packets.
/// Prevents a hostile `size=` field from ballooning the read buffer.
pub const MAX_PAYLOAD_LEN: u32 = 4 * 1024 * 1024;

/// v3 framing: a single marker byte introduces a binary video frame.
/// Control lines always start with printable ASCII, so one peeked byte
/// disambiguates.
pub const BINARY_MARKER: u8 = 0x00;

/// v3 binary header length: epoch(4) | flags(4) | size(4), big-endian.
pub const BINARY_HEADER_LEN: usize = 12;

/// Bit 0 of the v3 flags word marks a keyframe.
pub const FLAG_KEYFRAME: u32 = 0x1;

/// Protocol versions supported on the wire.
pub const MIN_VERSION: u8 = 2;
pub const MAX_VERSION: u8 = 3;

/// Codec errors carry enough context to build an `ERROR|code|msg` reply.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete input: need more data")]
    Incomplete,

    #[error("control line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    #[error("control line is not valid UTF-8")]
    InvalidUtf8,

    #[error("declared payload size {size} exceeds maximum {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge { size: u32 },

    #[error("unparseable control line: {0:?}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Clamp a `HELLO` version field into the supported range. Non-numeric
/// input degrades to the legacy version rather than failing the line.
pub fn clamp_version(raw: Option<&str>) -> u8 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(MIN_VERSION as i64, MAX_VERSION as i64) as u8)
        .unwrap_or(MIN_VERSION)
}

/// One parsed control line. Data-bearing variants (`Csd`, `Frame`,
/// `Audio`) describe the payload that immediately follows the line; the
/// transport layer is responsible for consuming exactly that many bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Hello { client: String, version: u8 },
    Proto { version: u8 },
    AuthChallenge { version: u8, salt: String },
    AuthResponse { hash: String },
    AuthOk,
    AuthFail,
    Session { id: String },
    Caps(ViewerCaps),
    CapsOk,
    SetStream(StreamConfig),
    StreamAccepted { epoch: Epoch, config: StreamConfig },
    Csd { epoch: Epoch, sps_len: u16, pps_len: u16 },
    Frame { epoch: Epoch, is_keyframe: bool, ts_us: i64, size: u32 },
    StreamState { code: StreamStateCode, epoch: Epoch },
    Audio {
        direction: AudioDirection,
        format: AudioFormat,
        size: u32,
        ts_us: i64,
        rate: u32,
        channels: u8,
    },
    Ping { ts_ms: i64 },
    Pong { ts_ms: i64, srv_ms: i64 },
    Resume { session: String },
    ResumeOk,
    ResumeFail,
    Backpressure,
    PressureClear,
    AdjustBitrate { bitrate_bps: u32 },
    ReqKeyframe,
    EncRot { degrees: u16 },
    StartRecording,
    StopRecording,
    Recording { active: bool },
    Camera { front: bool },
    Comm { enabled: bool },
    Error { code: u16, msg: String },
}

/// Key/value view over the `|`-separated segments of a control line.
/// Segments without `=` are skipped for key lookup but stay addressable
/// by position (`STREAM_STATE` carries its code positionally).
struct Fields<'a> {
    segments: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.segments.iter().find_map(|seg| {
            let (k, v) = seg.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    fn num<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key)?.trim().parse::<T>().ok()
    }

    fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Positional segment after the tag (index 0 is the first one).
    fn positional(&self, index: usize) -> Option<&'a str> {
        self.segments.get(index).copied()
    }
}

impl ControlMessage {
    /// Parse one newline-stripped control line. Returns `None` on any
    /// malformed input; callers decide whether that means `ERROR` + close
    /// (required keys on a known tag) or silent skip.
    pub fn parse(line: &str) -> Option<ControlMessage> {
        let line = line.trim_end_matches('\r');
        let mut parts = line.splitn(2, '|');
        let tag = parts.next()?;
        let fields = Fields {
            segments: parts
                .next()
                .map(|rest| rest.split('|').collect())
                .unwrap_or_default(),
        };

        match tag {
            "HELLO" => Some(ControlMessage::Hello {
                client: fields.get("client").unwrap_or("viewer").to_string(),
                version: clamp_version(fields.get("version")),
            }),
            "PROTO" => Some(ControlMessage::Proto {
                version: fields.num("version")?,
            }),
            "AUTH_CHALLENGE" => Some(ControlMessage::AuthChallenge {
                version: fields.num("v")?,
                salt: fields.get("salt")?.to_string(),
            }),
            "AUTH_RESPONSE" => Some(ControlMessage::AuthResponse {
                hash: fields.get("hash")?.to_string(),
            }),
            "AUTH_OK" => Some(ControlMessage::AuthOk),
            "AUTH_FAIL" => Some(ControlMessage::AuthFail),
            "SESSION" => Some(ControlMessage::Session {
                id: fields.get("id")?.to_string(),
            }),
            "CAPS" => Some(ControlMessage::Caps(ViewerCaps {
                max_width: fields.num("maxWidth")?,
                max_height: fields.num("maxHeight")?,
                max_bitrate_bps: fields.num("maxBitrate")?,
            })),
            "CAPS_OK" => Some(ControlMessage::CapsOk),
            "SET_STREAM" => Some(ControlMessage::SetStream(StreamConfig {
                width: fields.num("width")?,
                height: fields.num("height")?,
                fps: parse_fps(fields.get("fps")?)?,
                bitrate_bps: fields.num("bitrate")?,
            })),
            "STREAM_ACCEPTED" => Some(ControlMessage::StreamAccepted {
                epoch: fields.num("epoch")?,
                config: StreamConfig {
                    width: fields.num("width")?,
                    height: fields.num("height")?,
                    fps: parse_fps(fields.get("fps")?)?,
                    bitrate_bps: fields.num("bitrate")?,
                },
            }),
            "CSD" => {
                let msg = ControlMessage::Csd {
                    epoch: fields.num("epoch")?,
                    sps_len: fields.num("sps")?,
                    pps_len: fields.num("pps")?,
                };
                Some(msg)
            }
            "FRAME" => Some(ControlMessage::Frame {
                epoch: fields.num("epoch")?,
                is_keyframe: fields.flag("key")?,
                ts_us: fields.num("tsUs")?,
                size: fields.num("size")?,
            }),
            "STREAM_STATE" => {
                let code = fields
                    .positional(0)?
                    .parse::<u8>()
                    .ok()
                    .and_then(StreamStateCode::from_code)?;
                Some(ControlMessage::StreamState {
                    code,
                    epoch: fields.num("epoch")?,
                })
            }
            "AUDIO_FRAME" => Some(ControlMessage::Audio {
                direction: AudioDirection::parse(fields.get("dir")?)?,
                format: AudioFormat::parse(fields.get("format")?)?,
                size: fields.num("size")?,
                ts_us: fields.num("tsUs")?,
                rate: fields.num("rate").unwrap_or(48_000),
                channels: fields.num("ch").unwrap_or(1),
            }),
            "PING" => Some(ControlMessage::Ping {
                ts_ms: fields.num("tsMs")?,
            }),
            "PONG" => Some(ControlMessage::Pong {
                ts_ms: fields.num("tsMs")?,
                srv_ms: fields.num("srvMs")?,
            }),
            "RESUME" => Some(ControlMessage::Resume {
                session: fields.get("session")?.to_string(),
            }),
            "RESUME_OK" => Some(ControlMessage::ResumeOk),
            "RESUME_FAIL" => Some(ControlMessage::ResumeFail),
            "BACKPRESSURE" => Some(ControlMessage::Backpressure),
            "PRESSURE_CLEAR" => Some(ControlMessage::PressureClear),
            "ADJUST_BITRATE" => Some(ControlMessage::AdjustBitrate {
                bitrate_bps: fields.num("bitrate")?,
            }),
            "REQ_KEYFRAME" => Some(ControlMessage::ReqKeyframe),
            "ENC_ROT" => {
                let degrees: u16 = fields.num("deg")?;
                matches!(degrees, 0 | 90 | 180 | 270)
                    .then_some(ControlMessage::EncRot { degrees })
            }
            "START_RECORDING" => Some(ControlMessage::StartRecording),
            "STOP_RECORDING" => Some(ControlMessage::StopRecording),
            "RECORDING" => Some(ControlMessage::Recording {
                active: fields.flag("active")?,
            }),
            "CAMERA" => Some(ControlMessage::Camera {
                front: fields.flag("front")?,
            }),
            "COMM" => Some(ControlMessage::Comm {
                enabled: fields.flag("enabled")?,
            }),
            "ERROR" => {
                // msg is the final field and may itself contain pipes.
                let msg = line
                    .split_once("msg=")
                    .map(|(_, rest)| rest.to_string())
                    .unwrap_or_default();
                Some(ControlMessage::Error {
                    code: fields.num("code")?,
                    msg,
                })
            }
            _ => None,
        }
    }

    /// Serialize to a wire line, newline not included.
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::Hello { client, version } => {
                format!("HELLO|client={client}|version={version}")
            }
            ControlMessage::Proto { version } => format!("PROTO|version={version}"),
            ControlMessage::AuthChallenge { version, salt } => {
                format!("AUTH_CHALLENGE|v={version}|salt={salt}")
            }
            ControlMessage::AuthResponse { hash } => format!("AUTH_RESPONSE|hash={hash}"),
            ControlMessage::AuthOk => "AUTH_OK".to_string(),
            ControlMessage::AuthFail => "AUTH_FAIL".to_string(),
            ControlMessage::Session { id } => format!("SESSION|id={id}"),
            ControlMessage::Caps(caps) => format!(
                "CAPS|maxWidth={}|maxHeight={}|maxBitrate={}",
                caps.max_width, caps.max_height, caps.max_bitrate_bps
            ),
            ControlMessage::CapsOk => "CAPS_OK".to_string(),
            ControlMessage::SetStream(cfg) => format!(
                "SET_STREAM|width={}|height={}|fps={}|bitrate={}",
                cfg.width, cfg.height, cfg.fps, cfg.bitrate_bps
            ),
            ControlMessage::StreamAccepted { epoch, config } => format!(
                "STREAM_ACCEPTED|epoch={}|width={}|height={}|fps={}|bitrate={}",
                epoch, config.width, config.height, config.fps, config.bitrate_bps
            ),
            ControlMessage::Csd {
                epoch,
                sps_len,
                pps_len,
            } => format!("CSD|epoch={epoch}|sps={sps_len}|pps={pps_len}"),
            ControlMessage::Frame {
                epoch,
                is_keyframe,
                ts_us,
                size,
            } => format!("FRAME|epoch={epoch}|key={is_keyframe}|tsUs={ts_us}|size={size}"),
            ControlMessage::StreamState { code, epoch } => {
                format!("STREAM_STATE|{}|epoch={}", code.code(), epoch)
            }
            ControlMessage::Audio {
                direction,
                format,
                size,
                ts_us,
                rate,
                channels,
            } => format!(
                "AUDIO_FRAME|dir={}|format={}|size={}|tsUs={}|rate={}|ch={}",
                direction.as_str(),
                format.as_str(),
                size,
                ts_us,
                rate,
                channels
            ),
            ControlMessage::Ping { ts_ms } => format!("PING|tsMs={ts_ms}"),
            ControlMessage::Pong { ts_ms, srv_ms } => {
                format!("PONG|tsMs={ts_ms}|srvMs={srv_ms}")
            }
            ControlMessage::Resume { session } => format!("RESUME|session={session}"),
            ControlMessage::ResumeOk => "RESUME_OK".to_string(),
            ControlMessage::ResumeFail => "RESUME_FAIL".to_string(),
            ControlMessage::Backpressure => "BACKPRESSURE".to_string(),
            ControlMessage::PressureClear => "PRESSURE_CLEAR".to_string(),
            ControlMessage::AdjustBitrate { bitrate_bps } => {
                format!("ADJUST_BITRATE|bitrate={bitrate_bps}")
            }
            ControlMessage::ReqKeyframe => "REQ_KEYFRAME".to_string(),
            ControlMessage::EncRot { degrees } => format!("ENC_ROT|deg={degrees}"),
            ControlMessage::StartRecording => "START_RECORDING".to_string(),
            ControlMessage::StopRecording => "STOP_RECORDING".to_string(),
            ControlMessage::Recording { active } => format!("RECORDING|active={active}"),
            ControlMessage::Camera { front } => format!("CAMERA|front={front}"),
            ControlMessage::Comm { enabled } => format!("COMM|enabled={enabled}"),
            ControlMessage::Error { code, msg } => format!("ERROR|code={code}|msg={msg}"),
        }
    }

    /// Payload byte count that follows this line on the wire, if any.
    pub fn trailing_payload(&self) -> u32 {
        match self {
            ControlMessage::Csd {
                sps_len, pps_len, ..
            } => *sps_len as u32 + *pps_len as u32,
            ControlMessage::Frame { size, .. } => *size,
            ControlMessage::Audio { size, .. } => *size,
            _ => 0,
        }
    }
}

/// Fixed 12-byte header of a v3 binary video frame, written after the
/// marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFrameHeader {
    pub epoch: Epoch,
    pub flags: u32,
    pub size: u32,
}

impl BinaryFrameHeader {
    pub fn for_frame(epoch: Epoch, is_keyframe: bool, size: u32) -> Self {
        Self {
            epoch,
            flags: if is_keyframe { FLAG_KEYFRAME } else { 0 },
            size,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    /// Write marker + header into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(BINARY_MARKER);
        buf.put_u32(self.epoch);
        buf.put_u32(self.flags);
        buf.put_u32(self.size);
    }

    /// Decode the 12 header bytes after the marker has been consumed.
    pub fn decode(src: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if src.remaining() < BINARY_HEADER_LEN {
            return Err(CodecError::Incomplete);
        }
        let header = Self {
            epoch: src.get_u32(),
            flags: src.get_u32(),
            size: src.get_u32(),
        };
        if header.size > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge { size: header.size });
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ControlMessage) {
        let line = msg.encode();
        let parsed = ControlMessage::parse(&line);
        assert_eq!(parsed, Some(msg), "round-trip failed for {line:?}");
    }

    #[test]
    fn control_messages_roundtrip() {
        roundtrip(ControlMessage::Hello {
            client: "viewer".into(),
            version: 3,
        });
        roundtrip(ControlMessage::Proto { version: 3 });
        roundtrip(ControlMessage::AuthChallenge {
            version: 2,
            salt: "0102030405060708090a0b0c0d0e0f10".into(),
        });
        roundtrip(ControlMessage::AuthResponse {
            hash: "deadbeef".into(),
        });
        roundtrip(ControlMessage::AuthOk);
        roundtrip(ControlMessage::AuthFail);
        roundtrip(ControlMessage::Session {
            id: "b5ac7e3e-7b64-4dd2-9c61-2f4b11111111".into(),
        });
        roundtrip(ControlMessage::Caps(ViewerCaps::default()));
        roundtrip(ControlMessage::CapsOk);
        roundtrip(ControlMessage::SetStream(StreamConfig::default()));
        roundtrip(ControlMessage::StreamAccepted {
            epoch: 4,
            config: StreamConfig {
                width: 640,
                height: 480,
                fps: 30,
                bitrate_bps: 500_000,
            },
        });
        roundtrip(ControlMessage::Csd {
            epoch: 2,
            sps_len: 24,
            pps_len: 6,
        });
        roundtrip(ControlMessage::Frame {
            epoch: 7,
            is_keyframe: true,
            ts_us: 1_234_567,
            size: 9000,
        });
        roundtrip(ControlMessage::StreamState {
            code: StreamStateCode::Active,
            epoch: 9,
        });
        roundtrip(ControlMessage::Audio {
            direction: AudioDirection::Up,
            format: AudioFormat::Pcm,
            size: 960,
            ts_us: 555,
            rate: 48_000,
            channels: 1,
        });
        roundtrip(ControlMessage::Ping { ts_ms: 17 });
        roundtrip(ControlMessage::Pong {
            ts_ms: 17,
            srv_ms: 19,
        });
        roundtrip(ControlMessage::Resume {
            session: "b5ac7e3e-7b64-4dd2-9c61-2f4b22222222".into(),
        });
        roundtrip(ControlMessage::ResumeOk);
        roundtrip(ControlMessage::ResumeFail);
        roundtrip(ControlMessage::Backpressure);
        roundtrip(ControlMessage::PressureClear);
        roundtrip(ControlMessage::AdjustBitrate {
            bitrate_bps: 750_000,
        });
        roundtrip(ControlMessage::ReqKeyframe);
        roundtrip(ControlMessage::EncRot { degrees: 270 });
        roundtrip(ControlMessage::StartRecording);
        roundtrip(ControlMessage::StopRecording);
        roundtrip(ControlMessage::Recording { active: true });
        roundtrip(ControlMessage::Camera { front: false });
        roundtrip(ControlMessage::Comm { enabled: true });
        roundtrip(ControlMessage::Error {
            code: 400,
            msg: "bad request".into(),
        });
    }

    #[test]
    fn hello_version_is_clamped() {
        let parse_version = |line: &str| match ControlMessage::parse(line) {
            Some(ControlMessage::Hello { version, .. }) => version,
            other => panic!("expected Hello, got {other:?}"),
        };

        assert_eq!(parse_version("HELLO|client=viewer|version=2"), 2);
        assert_eq!(parse_version("HELLO|client=viewer|version=3"), 3);
        assert_eq!(parse_version("HELLO|client=viewer|version=1"), 2);
        assert_eq!(parse_version("HELLO|client=viewer|version=99"), 3);
        assert_eq!(parse_version("HELLO|client=viewer|version=banana"), 2);
        assert_eq!(parse_version("HELLO|client=viewer"), 2);
    }

    #[test]
    fn malformed_numeric_fields_yield_none() {
        assert_eq!(
            ControlMessage::parse("CAPS|maxWidth=abc|maxHeight=1080|maxBitrate=2000000"),
            None
        );
        assert_eq!(
            ControlMessage::parse("SET_STREAM|width=640|height=480|fps=0|bitrate=500000"),
            None
        );
        assert_eq!(
            ControlMessage::parse("SET_STREAM|width=640|height=480|fps=121|bitrate=500000"),
            None
        );
        assert_eq!(ControlMessage::parse("PING|tsMs=soon"), None);
        assert_eq!(ControlMessage::parse("ENC_ROT|deg=45"), None);
        assert_eq!(ControlMessage::parse("RECORDING|active=maybe"), None);
    }

    #[test]
    fn unknown_tags_and_keys() {
        assert_eq!(ControlMessage::parse("WIBBLE|x=1"), None);
        assert_eq!(ControlMessage::parse(""), None);

        // Unknown keys are ignored, segments without `=` are skipped.
        assert_eq!(
            ControlMessage::parse("PING|junk|color=red|tsMs=5"),
            Some(ControlMessage::Ping { ts_ms: 5 })
        );
    }

    #[test]
    fn parser_never_panics_on_arbitrary_input() {
        let nasty: Vec<String> = vec![
            "|||||".into(),
            "=".into(),
            "HELLO|=|=|=".into(),
            "STREAM_STATE".into(),
            "STREAM_STATE|epoch=1".into(),
            "STREAM_STATE|7|epoch=1".into(),
            "FRAME|epoch=|key=|tsUs=|size=".into(),
            "ERROR|code=|msg=".into(),
            "\u{0}\u{1}\u{2}".into(),
            "A".repeat(MAX_LINE_LEN),
            "CSD|epoch=4294967296|sps=1|pps=1".into(),
        ];
        for line in nasty {
            // No assertion on the value; the property is "no panic, no
            // partial state", which a None/Some return both satisfy.
            let _ = ControlMessage::parse(&line);
        }
    }

    #[test]
    fn stream_state_carries_positional_code() {
        assert_eq!(
            ControlMessage::parse("STREAM_STATE|2|epoch=4"),
            Some(ControlMessage::StreamState {
                code: StreamStateCode::Reconfiguring,
                epoch: 4
            })
        );
        // Codes outside 1..=4 are rejected.
        assert_eq!(ControlMessage::parse("STREAM_STATE|0|epoch=4"), None);
        assert_eq!(ControlMessage::parse("STREAM_STATE|5|epoch=4"), None);
    }

    #[test]
    fn error_message_survives_pipes() {
        let msg = ControlMessage::Error {
            code: 500,
            msg: "stage|detail".into(),
        };
        assert_eq!(ControlMessage::parse(&msg.encode()), Some(msg));
    }

    #[test]
    fn trailing_payload_sizes() {
        assert_eq!(
            ControlMessage::Csd {
                epoch: 1,
                sps_len: 20,
                pps_len: 8
            }
            .trailing_payload(),
            28
        );
        assert_eq!(
            ControlMessage::Frame {
                epoch: 1,
                is_keyframe: false,
                ts_us: 0,
                size: 512
            }
            .trailing_payload(),
            512
        );
        assert_eq!(ControlMessage::AuthOk.trailing_payload(), 0);
    }

    #[test]
    fn binary_header_roundtrip() {
        let header = BinaryFrameHeader::for_frame(12, true, 4096);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), 1 + BINARY_HEADER_LEN);
        assert_eq!(buf[0], BINARY_MARKER);

        let mut cursor = Cursor::new(&buf[1..]);
        let decoded = BinaryFrameHeader::decode(&mut cursor).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_keyframe());
    }

    #[test]
    fn binary_header_rejects_oversize() {
        let header = BinaryFrameHeader {
            epoch: 1,
            flags: 0,
            size: MAX_PAYLOAD_LEN + 1,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut cursor = Cursor::new(&buf[1..]);
        assert!(matches!(
            BinaryFrameHeader::decode(&mut cursor),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn binary_header_incomplete() {
        let bytes = [0u8; BINARY_HEADER_LEN - 1];
        let mut cursor = Cursor::new(&bytes[..]);
        assert!(matches!(
            BinaryFrameHeader::decode(&mut cursor),
            Err(CodecError::Incomplete)
        ));
    }
}
