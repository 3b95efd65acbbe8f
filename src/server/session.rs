//! Per-connection session handling.
//!
//! A session writes the greeting, decides which codec the peer is speaking
//! by peeking at its first two bytes, drives that codec to completion, and
//! reports the outcome to the vote handler exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::crypto::{KeyPair, TokenStore};
use crate::error::{BallotError, ProtocolErrorKind};
use crate::protocol::{
    ack_error, ack_ok, decode_envelope, decode_v1_block, greeting, new_challenge, parse_payload,
    read_frame_body, verify_envelope, write_frame, ProtocolVersion, VoteHandler, V2_MAGIC,
};

/// Shared, read-only context for all sessions of one listener.
pub(crate) struct SessionContext {
    pub keys: Arc<KeyPair>,
    pub tokens: Arc<TokenStore>,
    pub handler: Arc<dyn VoteHandler>,
    pub read_timeout: Duration,
    pub max_frame_size: usize,
}

/// Terminal failure of one session.
struct SessionFailure {
    error: BallotError,
    /// Whether a vote was already handed to the handler before the failure.
    vote_delivered: bool,
    /// Whether the peer gets the uniform v2 error frame.
    respond_v2: bool,
}

impl SessionFailure {
    fn new(error: BallotError) -> Self {
        Self {
            error,
            vote_delivered: false,
            respond_v2: false,
        }
    }

    fn v2(error: BallotError) -> Self {
        Self {
            error,
            vote_delivered: false,
            respond_v2: true,
        }
    }
}

/// Drive one accepted connection to completion.
///
/// Every decoded vote and every terminal error is reported to the handler
/// exactly once; the connection is closed when this returns. Returns
/// whether the session produced a vote without error.
pub(crate) async fn handle_session(stream: TcpStream, remote: SocketAddr, ctx: Arc<SessionContext>) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    let challenge = new_challenge();

    if let Err(e) = writer.write_all(greeting(&challenge).as_bytes()).await {
        ctx.handler.on_error(&BallotError::Io(e), false, remote);
        return false;
    }

    match run_session(&mut reader, &mut writer, &challenge, remote, &ctx).await {
        Ok(version) => {
            debug!(remote = %remote, version = %version, "Session completed");
            true
        }
        Err(failure) => {
            if failure.respond_v2 {
                // Uniform error frame, best effort. Never reveals the cause.
                let _ = timeout(ctx.read_timeout, write_frame(&mut writer, ack_error())).await;
            }
            ctx.handler.on_error(&failure.error, failure.vote_delivered, remote);
            false
        }
    }
}

async fn run_session<R, W>(
    reader: &mut R,
    writer: &mut W,
    challenge: &str,
    remote: SocketAddr,
    ctx: &SessionContext,
) -> Result<ProtocolVersion, SessionFailure>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Protocol detection: v2 frames open with a magic the legacy RSA block
    // format never produces. A peer that closes before sending two bytes
    // spoke neither protocol.
    let mut opening = [0u8; 2];
    match timeout(ctx.read_timeout, reader.read_exact(&mut opening)).await {
        Err(_) => {
            return Err(SessionFailure::new(BallotError::Protocol {
                kind: ProtocolErrorKind::ConnectionTimeout,
            }))
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(SessionFailure::new(BallotError::Protocol {
                kind: ProtocolErrorKind::ProtocolDetection,
            }))
        }
        Ok(Err(e)) => return Err(SessionFailure::new(BallotError::Io(e))),
        Ok(Ok(_)) => {}
    }

    if u16::from_be_bytes(opening) == V2_MAGIC {
        run_v2(reader, writer, challenge, remote, ctx).await
    } else {
        run_v1(reader, opening, remote, ctx).await
    }
}

/// Legacy flow: the two detection bytes are the start of a single
/// modulus-sized ciphertext block. One vote, no reply, close.
async fn run_v1<R>(
    reader: &mut R,
    opening: [u8; 2],
    remote: SocketAddr,
    ctx: &SessionContext,
) -> Result<ProtocolVersion, SessionFailure>
where
    R: AsyncRead + Unpin,
{
    let block_size = ctx.keys.block_size();
    let mut block = vec![0u8; block_size];
    block[..2].copy_from_slice(&opening);

    let mut filled = 2;
    while filled < block_size {
        let read = timeout(ctx.read_timeout, reader.read(&mut block[filled..])).await;
        match read {
            Err(_) => {
                return Err(SessionFailure::new(BallotError::Protocol {
                    kind: ProtocolErrorKind::ConnectionTimeout,
                }))
            }
            Ok(Err(e)) => return Err(SessionFailure::new(BallotError::Io(e))),
            Ok(Ok(0)) => {
                return Err(SessionFailure::new(BallotError::Protocol {
                    kind: ProtocolErrorKind::TruncatedInput {
                        expected: block_size,
                        got: filled,
                    },
                }))
            }
            Ok(Ok(n)) => filled += n,
        }
    }

    let vote = decode_v1_block(&ctx.keys, &block).map_err(SessionFailure::new)?;
    ctx.handler.on_vote_received(vote, ProtocolVersion::V1, Some(remote));
    Ok(ProtocolVersion::V1)
}

/// Token-authenticated flow: framed envelope in, framed acknowledgment out.
async fn run_v2<R, W>(
    reader: &mut R,
    writer: &mut W,
    challenge: &str,
    remote: SocketAddr,
    ctx: &SessionContext,
) -> Result<ProtocolVersion, SessionFailure>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let body = match timeout(ctx.read_timeout, read_frame_body(reader, ctx.max_frame_size)).await {
        Err(_) => {
            return Err(SessionFailure::v2(BallotError::Protocol {
                kind: ProtocolErrorKind::ConnectionTimeout,
            }))
        }
        Ok(result) => result.map_err(SessionFailure::v2)?,
    };

    let envelope = decode_envelope(&body).map_err(SessionFailure::v2)?;
    verify_envelope(&envelope, challenge, &ctx.tokens).map_err(SessionFailure::v2)?;
    let vote = parse_payload(&envelope).map_err(SessionFailure::v2)?;

    ctx.handler.on_vote_received(vote, ProtocolVersion::V2, Some(remote));

    // The vote is already delivered; a failed acknowledgment only affects
    // log severity on our side.
    match timeout(ctx.read_timeout, write_frame(writer, ack_ok())).await {
        Err(_) => Err(SessionFailure {
            error: BallotError::Protocol {
                kind: ProtocolErrorKind::ConnectionTimeout,
            },
            vote_delivered: true,
            respond_v2: false,
        }),
        Ok(Err(e)) => Err(SessionFailure {
            error: e,
            vote_delivered: true,
            respond_v2: false,
        }),
        Ok(Ok(())) => Ok(ProtocolVersion::V2),
    }
}
