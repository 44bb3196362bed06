//! Streaming RFC 6455 reader.
//!
//! [`WsReadState`] lives next to the session's read half and survives across
//! messages. It parses frame headers, answers control frames by queueing
//! replies, enforces the fragmentation rules and the message size limit, and
//! unmasks payload bytes as they are read. The first error is terminal: every
//! later call returns it again.
//!
//! Replies (pong, close echo, protocol-error close) are only queued here. The
//! session owns the write half and flushes them after each read.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;

use chatgate_core::websocket::{
    close, close_frame, encode_frame, is_valid_received_close_code, mask_bytes, OpCode, WsError,
    FINAL_BIT, LEN7_BITS, MASK_BIT, MAX_CONTROL_PAYLOAD, OPCODE_BITS, RSV_BITS,
};

use crate::reader::Reader;

/// Read-side state of one WebSocket connection.
#[derive(Debug)]
pub struct WsReadState {
    /// Unread payload bytes of the current frame.
    remaining: u64,
    /// Whether the current frame ends its message. Starts true so the first
    /// frame must open a new message.
    final_frame: bool,
    mask_key: [u8; 4],
    mask_pos: usize,
    masked: bool,
    /// Payload bytes announced so far for the current message.
    message_len: u64,
    max_msg_size: u64,
    error: Option<WsError>,
    replies: Vec<Bytes>,
    close_sent: bool,
}

impl WsReadState {
    /// `max_msg_size` of 0 disables the limit.
    pub fn new(max_msg_size: u64) -> Self {
        Self {
            remaining: 0,
            final_frame: true,
            mask_key: [0; 4],
            mask_pos: 0,
            masked: false,
            message_len: 0,
            max_msg_size,
            error: None,
            replies: Vec::new(),
            close_sent: false,
        }
    }

    /// Take the control frames queued since the last call.
    pub fn take_replies(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.replies)
    }

    /// Whether a close frame has been queued. After that, only the close
    /// handshake may continue.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Record that a close frame went out by another path.
    pub fn mark_close_sent(&mut self) {
        self.close_sent = true;
    }

    /// Start reading the next data message.
    pub async fn next_message<'a, R: AsyncRead + Unpin>(
        &'a mut self,
        reader: &'a mut Reader<R>,
    ) -> Result<MessageReader<'a, R>, WsError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        // drain an abandoned message so the next header lines up
        loop {
            if self.remaining > 0 {
                if let Err(e) = reader.discard(self.remaining).await {
                    return Err(self.fail(e.into()));
                }
                self.remaining = 0;
            }
            if self.final_frame {
                break;
            }
            self.advance_frame(reader).await?;
        }
        let opcode = self.advance_frame(reader).await?;
        Ok(MessageReader {
            state: self,
            reader,
            opcode,
        })
    }

    /// Convenience: read one whole data message.
    pub async fn read_message<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut Reader<R>,
    ) -> Result<(OpCode, Bytes), WsError> {
        let mut msg = self.next_message(reader).await?;
        let opcode = msg.opcode();
        let data = msg.read_to_end().await?;
        Ok((opcode, data))
    }

    fn fail(&mut self, e: WsError) -> WsError {
        if let Some(code) = e.close_code() {
            self.queue_close(code, &e.to_string());
        }
        self.error = Some(e.clone());
        e
    }

    fn queue_close(&mut self, code: u16, reason: &str) {
        if !self.close_sent {
            self.replies.push(close_frame(code, reason));
            self.close_sent = true;
        }
    }

    /// Skip to the next data frame header, handling control frames on the
    /// way. Returns the data frame's opcode.
    async fn advance_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut Reader<R>,
    ) -> Result<OpCode, WsError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match self.advance_inner(reader).await {
            Ok(op) => Ok(op),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn advance_inner<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut Reader<R>,
    ) -> Result<OpCode, WsError> {
        if self.remaining > 0 {
            reader.discard(self.remaining).await?;
            self.remaining = 0;
        }

        loop {
            let [b0, b1] = reader.read_array::<2>().await?;
            let fin = b0 & FINAL_BIT != 0;
            if b0 & RSV_BITS != 0 {
                return Err(WsError::Protocol("reserved bits set".into()));
            }
            let opcode = OpCode::try_from(b0 & OPCODE_BITS)?;
            let masked = b1 & MASK_BIT != 0;
            let len7 = b1 & LEN7_BITS;

            if opcode.is_control() {
                if !fin {
                    return Err(WsError::Protocol("fragmented control frame".into()));
                }
                if len7 as usize > MAX_CONTROL_PAYLOAD {
                    return Err(WsError::Protocol("control frame too long".into()));
                }
            } else if opcode == OpCode::Continuation {
                if self.final_frame {
                    return Err(WsError::Protocol("continuation outside a message".into()));
                }
            } else if !self.final_frame {
                return Err(WsError::Protocol("new message inside a fragmented one".into()));
            }

            let len = match len7 {
                126 => reader.read_u16_be().await? as u64,
                127 => {
                    let len = reader.read_u64_be().await?;
                    if len >> 63 != 0 {
                        return Err(WsError::Protocol("frame length overflows 63 bits".into()));
                    }
                    len
                }
                n => n as u64,
            };
            let mask_key = if masked {
                reader.read_array::<4>().await?
            } else {
                [0; 4]
            };

            if opcode.is_control() {
                let mut payload = reader.read_n(len as usize).await?.to_vec();
                if masked {
                    mask_bytes(mask_key, 0, &mut payload);
                }
                self.handle_control(opcode, &payload)?;
                continue;
            }

            if opcode != OpCode::Continuation {
                self.message_len = 0;
            }
            self.message_len = self.message_len.saturating_add(len);
            if self.max_msg_size > 0 && self.message_len > self.max_msg_size {
                return Err(WsError::MessageTooBig {
                    len: self.message_len,
                    max: self.max_msg_size,
                });
            }

            self.final_frame = fin;
            self.remaining = len;
            self.masked = masked;
            self.mask_key = mask_key;
            self.mask_pos = 0;
            return Ok(opcode);
        }
    }

    fn handle_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        match opcode {
            OpCode::Ping => {
                if !self.close_sent {
                    self.replies.push(encode_frame(OpCode::Pong, payload)?);
                }
                Ok(())
            }
            OpCode::Pong => Ok(()),
            OpCode::Close => {
                let (code, reason) = parse_close(payload)?;
                if !self.close_sent {
                    let echo = if payload.is_empty() {
                        encode_frame(OpCode::Close, &[])?
                    } else {
                        close_frame(code, "")
                    };
                    self.replies.push(echo);
                    self.close_sent = true;
                }
                Err(WsError::PeerClosed { code, reason })
            }
            _ => Err(WsError::Protocol("unexpected control opcode".into())),
        }
    }

    /// Read payload bytes of the current message into `out`.
    async fn read_payload<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut Reader<R>,
        out: &mut [u8],
    ) -> Result<usize, WsError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        loop {
            if self.remaining > 0 {
                let want = (self.remaining.min(out.len() as u64)) as usize;
                let n = match reader.read(&mut out[..want]).await {
                    Ok(0) => return Err(self.fail(WsError::UnexpectedEof)),
                    Ok(n) => n,
                    Err(e) => return Err(self.fail(e.into())),
                };
                if self.masked {
                    self.mask_pos = mask_bytes(self.mask_key, self.mask_pos, &mut out[..n]);
                }
                self.remaining -= n as u64;
                return Ok(n);
            }
            if self.final_frame {
                return Ok(0);
            }
            self.advance_frame(reader).await?;
        }
    }
}

fn parse_close(payload: &[u8]) -> Result<(u16, String), WsError> {
    match payload.len() {
        0 => Ok((close::NO_STATUS, String::new())),
        1 => Err(WsError::Protocol("close payload of one byte".into())),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_received_close_code(code) {
                return Err(WsError::Protocol(format!("invalid close code {code}")));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WsError::Protocol("close reason is not UTF-8".into()))?;
            Ok((code, reason.to_string()))
        }
    }
}

/// One inbound data message, read incrementally across its fragments.
pub struct MessageReader<'a, R> {
    state: &'a mut WsReadState,
    reader: &'a mut Reader<R>,
    opcode: OpCode,
}

impl<R: AsyncRead + Unpin> MessageReader<'_, R> {
    /// Opcode of the first frame: Text or Binary.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Returns 0 once the final fragment has been fully read.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, WsError> {
        if out.is_empty() {
            return Ok(0);
        }
        self.state.read_payload(self.reader, out).await
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, WsError> {
        let mut data = BytesMut::with_capacity(self.state.remaining.min(64 * 1024) as usize);
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(data.freeze());
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }
}
