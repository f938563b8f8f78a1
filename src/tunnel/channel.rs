//! Upstream role: the far end of the sealed channel.

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::upstream::{accept_channel, STATUS_AUTH_FAILED, STATUS_OK, STATUS_UNREACHABLE};
use super::{relay, RelayOutcome, SessionState, TunnelSession};
use crate::error::{GofwError, Result};
use crate::router::RouteAction;

impl TunnelSession {
    /// Reads the sealed request, checks the credential, dials the target
    /// directly and relays until both sides are done.
    pub(super) async fn serve_channel(&mut self, client: TcpStream) -> Result<RelayOutcome> {
        let (request, pending) = timeout(self.ctx.timeouts.handshake(), accept_channel(client, &self.ctx.key))
            .await
            .map_err(|_| GofwError::protocol("channel handshake timed out"))??;
        self.target = Some(request.target.clone());

        if let Some(expected) = self.ctx.auth.clone() {
            self.transition(SessionState::Authenticating);
            if request.auth != expected {
                let _ = pending.respond(STATUS_AUTH_FAILED).await;
                return Err(GofwError::AuthRejected);
            }
        }

        self.transition(SessionState::Routing);
        self.route = Some(RouteAction::Direct);
        let outbound = match self.ctx.connect(&request.target, RouteAction::Direct).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = pending.respond(STATUS_UNREACHABLE).await;
                return Err(e);
            }
        };
        let channel = pending.respond(STATUS_OK).await?;

        self.transition(SessionState::Relaying);
        let cancel = self.ctx.cancel.clone();
        Ok(relay(channel.into_stream(), outbound, self.ctx.timeouts.idle(), &cancel).await)
    }
}
