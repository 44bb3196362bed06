use bytes::Bytes;
use tokio::io::AsyncRead;

use chatgate_core::websocket::{encode_frame, OpCode, WsError};

use crate::error::SessionError;
use crate::reader::Reader;
use crate::websocket::WsReadState;

/// One unmasked binary frame.
pub(super) fn frame(envelope: &[u8]) -> Result<Bytes, WsError> {
    encode_frame(OpCode::Binary, envelope)
}

/// One whole message, text or binary. The size limit is enforced by the
/// frame engine as fragments arrive.
pub(super) async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    ws: &mut WsReadState,
) -> Result<Bytes, SessionError> {
    let (_, data) = ws.read_message(reader).await?;
    Ok(data)
}
