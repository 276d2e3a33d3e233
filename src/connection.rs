// ABOUTME: Buffered TCP transport carrying multiplexed control lines and media payloads
// ABOUTME: Implements incremental parsing so a partial read never commits a partial event

use crate::codec::{
    BINARY_HEADER_LEN, BINARY_MARKER, BinaryFrameHeader, CodecError, ControlMessage,
    MAX_LINE_LEN, MAX_PAYLOAD_LEN,
};
use crate::datatypes::{AudioFrame, CodecSpecificData, EncodedFrame};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// One fully-assembled unit read off the socket. Data-bearing control
/// lines arrive here with their payloads already attached, so callers
/// never see a header/payload split.
#[derive(Debug)]
pub enum WireEvent {
    Control(ControlMessage),
    /// A video frame, from either v2 text framing or a v3 binary frame.
    /// v3 frames carry no producer timestamp; `pts_us` is zero there.
    Video(EncodedFrame),
    CodecData(CodecSpecificData),
    Audio(AudioFrame),
}

/// Frame-based connection over a single TCP stream.
///
/// Both sides of the protocol use this type; which messages are legal at
/// which moment is the session/client state machines' concern, not the
/// transport's. `split` hands the two halves to independent reader and
/// sender tasks.
#[derive(Debug)]
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    /// Wrap an established socket. `TCP_NODELAY` is set here because every
    /// caller of this transport is latency-sensitive.
    pub fn new(socket: TcpStream) -> Connection {
        if let Err(err) = socket.set_nodelay(true) {
            tracing::warn!("failed to set TCP_NODELAY: {err}");
        }
        let (read_half, write_half) = socket.into_split();
        Connection {
            reader: ConnectionReader {
                stream: read_half,
                buffer: BytesMut::with_capacity(16 * 1024),
            },
            writer: ConnectionWriter {
                stream: BufWriter::new(write_half),
            },
        }
    }

    /// Separate the halves so reading and writing run on their own tasks.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }

    pub async fn read_event(&mut self) -> Result<Option<WireEvent>, CodecError> {
        self.reader.read_event().await
    }

    pub async fn write_control(&mut self, message: &ControlMessage) -> io::Result<()> {
        self.writer.write_control(message).await
    }

    pub async fn write_csd(&mut self, csd: &CodecSpecificData) -> io::Result<()> {
        self.writer.write_csd(csd).await
    }

    pub async fn write_frame_v2(&mut self, frame: &EncodedFrame) -> io::Result<()> {
        self.writer.write_frame_v2(frame).await
    }

    pub async fn write_frame_v3(&mut self, frame: &EncodedFrame) -> io::Result<()> {
        self.writer.write_frame_v3(frame).await
    }

    pub async fn write_audio(&mut self, frame: &AudioFrame) -> io::Result<()> {
        self.writer.write_audio(frame).await
    }

    /// Test hook: push raw bytes past the typed API.
    #[cfg(test)]
    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.stream.write_all(bytes).await?;
        self.writer.stream.flush().await
    }
}

/// Read half: incremental event assembly over a growable buffer.
#[derive(Debug)]
pub struct ConnectionReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

impl ConnectionReader {
    /// Read a single event from the underlying stream.
    ///
    /// Waits until enough data is buffered to assemble a complete event;
    /// leftover bytes stay buffered for the next call. Returns `Ok(None)`
    /// on a clean EOF (no partial event in the buffer).
    pub async fn read_event(&mut self) -> Result<Option<WireEvent>, CodecError> {
        loop {
            if let Some(event) = self.parse_event()? {
                return Ok(Some(event));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                // The remote closed the connection. For this to be a clean
                // shutdown there must be no partial event left behind.
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(CodecError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection reset mid-event",
                    )))
                };
            }
        }
    }

    /// Try to assemble one event from buffered data. `Ok(None)` means the
    /// buffer holds a prefix of an event and more bytes are needed; the
    /// buffer is only advanced once the whole event is present.
    fn parse_event(&mut self) -> Result<Option<WireEvent>, CodecError> {
        let Some(&first) = self.buffer.first() else {
            return Ok(None);
        };

        if first == BINARY_MARKER {
            return self.parse_binary_frame();
        }

        // A control line. The payload declared by a data-bearing line is
        // consumed byte-exact; line reading must never run into it.
        let Some(newline) = self
            .buffer
            .iter()
            .take(MAX_LINE_LEN)
            .position(|&b| b == b'\n')
        else {
            if self.buffer.len() >= MAX_LINE_LEN {
                return Err(CodecError::LineTooLong);
            }
            return Ok(None);
        };

        let line = std::str::from_utf8(&self.buffer[..newline])
            .map_err(|_| CodecError::InvalidUtf8)?;
        let Some(message) = ControlMessage::parse(line) else {
            let malformed = line.to_string();
            self.buffer.advance(newline + 1);
            return Err(CodecError::Malformed(malformed));
        };

        let payload_len = message.trailing_payload();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge { size: payload_len });
        }

        let total = newline + 1 + payload_len as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(newline + 1);
        let payload = self.buffer.split_to(payload_len as usize).freeze();

        let event = match message {
            ControlMessage::Csd {
                epoch,
                sps_len,
                pps_len,
            } => {
                let mut payload = payload;
                let sps = payload.split_to(sps_len as usize);
                let pps = payload.split_to(pps_len as usize);
                WireEvent::CodecData(CodecSpecificData { sps, pps, epoch })
            }
            ControlMessage::Frame {
                epoch,
                is_keyframe,
                ts_us,
                ..
            } => WireEvent::Video(EncodedFrame::new(payload, is_keyframe, ts_us, epoch)),
            ControlMessage::Audio {
                direction,
                format,
                ts_us,
                rate,
                channels,
                ..
            } => WireEvent::Audio(AudioFrame {
                payload,
                direction,
                format,
                ts_us,
                sample_rate: rate,
                channels,
            }),
            control => WireEvent::Control(control),
        };
        Ok(Some(event))
    }

    fn parse_binary_frame(&mut self) -> Result<Option<WireEvent>, CodecError> {
        if self.buffer.len() < 1 + BINARY_HEADER_LEN {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buffer[1..1 + BINARY_HEADER_LEN]);
        let header = BinaryFrameHeader::decode(&mut cursor)?;

        let total = 1 + BINARY_HEADER_LEN + header.size as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(1 + BINARY_HEADER_LEN);
        let payload = self.buffer.split_to(header.size as usize).freeze();
        Ok(Some(WireEvent::Video(EncodedFrame::new(
            payload,
            header.is_keyframe(),
            0,
            header.epoch,
        ))))
    }
}

/// Write half: one flush per event keeps syscall counts at
/// one-per-message without batching latency.
#[derive(Debug)]
pub struct ConnectionWriter {
    stream: BufWriter<OwnedWriteHalf>,
}

impl ConnectionWriter {
    /// Write one control line.
    pub async fn write_control(&mut self, message: &ControlMessage) -> io::Result<()> {
        let mut line = message.encode();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await
    }

    /// Write a `CSD` line followed by its SPS and PPS payloads.
    pub async fn write_csd(&mut self, csd: &CodecSpecificData) -> io::Result<()> {
        let header = ControlMessage::Csd {
            epoch: csd.epoch,
            sps_len: csd.sps.len() as u16,
            pps_len: csd.pps.len() as u16,
        };
        let mut line = header.encode();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(&csd.sps).await?;
        self.stream.write_all(&csd.pps).await?;
        self.stream.flush().await
    }

    /// Write a video frame in legacy v2 text framing.
    pub async fn write_frame_v2(&mut self, frame: &EncodedFrame) -> io::Result<()> {
        let header = ControlMessage::Frame {
            epoch: frame.epoch,
            is_keyframe: frame.is_keyframe,
            ts_us: frame.pts_us,
            size: frame.payload.len() as u32,
        };
        let mut line = header.encode();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(&frame.payload).await?;
        self.stream.flush().await
    }

    /// Write a video frame in v3 binary framing.
    pub async fn write_frame_v3(&mut self, frame: &EncodedFrame) -> io::Result<()> {
        let mut header = BytesMut::with_capacity(1 + BINARY_HEADER_LEN);
        BinaryFrameHeader::for_frame(
            frame.epoch,
            frame.is_keyframe,
            frame.payload.len() as u32,
        )
        .encode(&mut header);
        self.stream.write_all(&header).await?;
        self.stream.write_all(&frame.payload).await?;
        self.stream.flush().await
    }

    /// Write an `AUDIO_FRAME` line followed by its payload.
    pub async fn write_audio(&mut self, frame: &AudioFrame) -> io::Result<()> {
        let header = ControlMessage::Audio {
            direction: frame.direction,
            format: frame.format,
            size: frame.payload.len() as u32,
            ts_us: frame.ts_us,
            rate: frame.sample_rate,
            channels: frame.channels,
        };
        let mut line = header.encode();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(&frame.payload).await?;
        self.stream.flush().await
    }
}
