//! Reader and writer tasks of a connection.

use crate::close::CloseFrame;
use crate::connection::{ConnectionState, Control, Shared, WriteRequest};
use crate::error::{WebSocketError, WebSocketResult};
use crate::frame::{FrameReader, FrameWriter, Inbound, OpCode, encode_frame};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout};

/// Read frames until the connection closes.
///
/// Every frame must arrive within the read interval; any frame, pongs
/// included, proves the peer is alive.
pub(crate) async fn read_loop<R>(shared: Arc<Shared>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    let read_interval = shared.options.read_interval;

    loop {
        let frame = tokio::select! {
            biased;

            _ = shared.reached(ConnectionState::Closed) => break,
            frame = timeout(read_interval, reader.read_frame()) => frame,
        };

        match frame {
            Err(_) => {
                shared.transport_lost(WebSocketError::Timeout("read"));
                break;
            }
            Ok(Ok(None)) | Ok(Ok(Some(Inbound::Pong(_)))) => {}
            Ok(Ok(Some(Inbound::Ping(payload)))) => shared.queue_pong(payload),
            Ok(Ok(Some(Inbound::Close(frame)))) => {
                shared.close_received(frame);
                break;
            }
            Ok(Ok(Some(Inbound::Data(message)))) => {
                if !shared.deliver(message).await {
                    break;
                }
            }
            Ok(Err(e @ WebSocketError::MessageTooBig { .. })) => {
                tracing::debug!(connection_id = %shared.id, error = %e, "Inbound message over the read limit");
                // The reader skips the payload and keeps going so the
                // peer's close reply can still be read.
                shared.begin_close(e.close_frame(), Some(e), false);
            }
            Ok(Err(e @ (WebSocketError::Protocol(_) | WebSocketError::InvalidCloseFrame(_)))) => {
                shared.fail(e.close_frame(), e);
                break;
            }
            Ok(Err(e)) => {
                shared.transport_lost(e);
                break;
            }
        }
    }

    shared.task_exited();
}

/// Write queued frames, control frames and pings until the connection closes.
pub(crate) async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<WriteRequest>,
    mut control: mpsc::UnboundedReceiver<Control>,
) where
    W: AsyncWrite + Unpin,
{
    let ping_interval = shared.options.ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ping = encode_frame(OpCode::Ping, false, &[]);
    let mut close_sent = false;

    loop {
        let written = tokio::select! {
            biased;

            _ = shared.reached(ConnectionState::Closed) => break,
            Some(control) = control.recv() => match control {
                Control::Close(frame) if !close_sent => {
                    close_sent = true;
                    send_close(&shared, &mut writer, &mut outbound, frame).await
                }
                Control::Pong(payload) if !close_sent => {
                    send(&shared, &mut writer, &encode_frame(OpCode::Pong, false, &payload)).await
                }
                _ => Ok(()),
            },
            Some(request) = outbound.recv() => {
                if close_sent {
                    let _ = request.ack.send(Err(shared.already_closed()));
                    Ok(())
                } else {
                    write_request(&shared, &mut writer, request).await
                }
            }
            _ = ticker.tick(), if !close_sent => send(&shared, &mut writer, &ping).await,
        };

        if let Err(e) = written {
            shared.transport_lost(e);
            break;
        }
    }

    // Writes still queued at tear-down are reported, never silently dropped.
    outbound.close();
    while let Ok(request) = outbound.try_recv() {
        let _ = request.ack.send(Err(shared.already_closed()));
    }
    let _ = timeout(shared.options.write_interval, writer.shutdown()).await;
    shared.task_exited();
}

/// Drain writes accepted before the close, then send the close frame.
async fn send_close<W: AsyncWrite + Unpin>(
    shared: &Shared,
    writer: &mut FrameWriter<W>,
    outbound: &mut mpsc::Receiver<WriteRequest>,
    frame: CloseFrame,
) -> WebSocketResult<()> {
    while let Ok(request) = outbound.try_recv() {
        write_request(shared, writer, request).await?;
    }

    send(shared, writer, &encode_frame(OpCode::Close, false, &frame.encode())).await?;
    tracing::debug!(connection_id = %shared.id, code = frame.code.0, "Close frame sent");
    shared.close_sent();
    Ok(())
}

async fn write_request<W: AsyncWrite + Unpin>(
    shared: &Shared,
    writer: &mut FrameWriter<W>,
    request: WriteRequest,
) -> WebSocketResult<()> {
    match send(shared, writer, &request.frame).await {
        Ok(()) => {
            let _ = request.ack.send(Ok(()));
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            // Record the cause first so the submitter sees it.
            shared.transport_lost(e);
            let _ = request.ack.send(Err(shared.already_closed()));
            Err(WebSocketError::TransportWrite(std::io::Error::other(message)))
        }
    }
}

/// Write one frame under the write deadline.
async fn send<W: AsyncWrite + Unpin>(
    shared: &Shared,
    writer: &mut FrameWriter<W>,
    frame: &[u8],
) -> WebSocketResult<()> {
    match timeout(shared.options.write_interval, writer.write_frame(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WebSocketError::TransportWrite(e)),
        Err(_) => Err(WebSocketError::Timeout("write")),
    }
}
