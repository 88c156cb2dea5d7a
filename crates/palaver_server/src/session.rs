/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use palaver_protocol::{
    SessionOffer, SignalEnvelope, ACTION_ACCEPTED, ACTION_ADD, ACTION_OFFER, OBJECT_CALL, OBJECT_USER,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conference::{CallError, CallSignaling};
use crate::media_relay::RelayHandle;
use crate::presence::PresenceSync;
use crate::registry::{User, UserRegistry};

/// Shared by every session of the process.
pub struct SessionContext {
    pub registry: Arc<UserRegistry>,
    pub calls: Arc<CallSignaling>,
    pub presence_poll: Duration,
}

/// Drives one connection until `inbound` ends or fails. Outbound envelopes go
/// to `outbound`; the caller serializes them onto the transport.
pub async fn run_session<S, E>(ctx: Arc<SessionContext>, mut inbound: S, outbound: mpsc::Sender<SignalEnvelope>)
where
    S: Stream<Item = Result<String, E>> + Unpin + Send,
    E: Display + Send,
{
    let (identity_tx, identity_rx) = watch::channel::<Option<Arc<User>>>(None);
    let cancel = CancellationToken::new();
    let outbound_task = tokio::spawn(run_outbound(ctx.clone(), identity_rx, outbound.clone(), cancel.clone()));

    let mut duty = InboundDuty {
        ctx: ctx.clone(),
        identity: identity_tx,
        outbound,
        me: None,
        relay: None,
    };
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(text) => {
                if !duty.handle_text(&text).await {
                    break;
                }
            }
            Err(e) => {
                info!("read: {e}");
                break;
            }
        }
    }

    cancel.cancel();
    if let Err(e) = outbound_task.await {
        error!("outbound duty panicked: {e}");
    }

    if let Some(relay) = duty.relay.take() {
        relay.close().await;
    }
    if let Some(me) = duty.me.take() {
        if ctx.registry.release(me.username()) {
            info!(user = %me.username(), "user left");
            ctx.calls.user_left(me.username());
        }
    }
}

struct InboundDuty {
    ctx: Arc<SessionContext>,
    identity: watch::Sender<Option<Arc<User>>>,
    outbound: mpsc::Sender<SignalEnvelope>,
    me: Option<Arc<User>>,
    /// This connection's relay endpoint; other sessions of the same user have their own.
    relay: Option<RelayHandle>,
}

impl InboundDuty {
    /// Returns false once the outbound side is gone.
    async fn handle_text(&mut self, text: &str) -> bool {
        let envelope = match SignalEnvelope::parse(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("bad envelope: {e}");
                return true;
            }
        };
        match envelope.object.as_str() {
            OBJECT_USER => self.handle_user_action(&envelope),
            OBJECT_CALL => {
                if let Err(e) = self.handle_call_action(&envelope).await {
                    let user = self.me.as_ref().map(|u| u.username().to_string()).unwrap_or_default();
                    warn!(%user, action = %envelope.action, "call failed: {e}");
                    return self.outbound.send(SignalEnvelope::failed(&e.to_string())).await.is_ok();
                }
            }
            other => debug!(object = %other, "ignoring envelope"),
        }
        true
    }

    fn handle_user_action(&mut self, envelope: &SignalEnvelope) {
        if envelope.action != ACTION_ADD {
            debug!(action = %envelope.action, "ignoring user action");
            return;
        }
        let name = envelope.data.trim();
        if name.is_empty() {
            warn!("empty username announced");
            return;
        }
        if let Some(me) = &self.me {
            warn!(current = %me.username(), requested = %name, "identity already announced");
            return;
        }
        let user = self.ctx.registry.claim(name);
        info!(user = %name, "user announced");
        self.me = Some(user.clone());
        let _ = self.identity.send(Some(user));
    }

    async fn handle_call_action(&mut self, envelope: &SignalEnvelope) -> Result<(), CallError> {
        let me = self.me.clone().ok_or(CallError::NotLoggedIn)?;
        let negotiated = match envelope.action.as_str() {
            ACTION_OFFER => {
                let offer = SessionOffer::decode(&envelope.data)?;
                let (conference, negotiated) = self.ctx.calls.offer(&me, &offer).await?;
                debug!(conference = %conference.id(), members = ?conference.member_names(), "offer handled");
                negotiated
            }
            ACTION_ACCEPTED => {
                let offer = SessionOffer::decode(&envelope.data)?;
                self.ctx.calls.accept(&me, &offer).await?
            }
            other => return Err(CallError::UnknownAction(other.to_string())),
        };
        if let Some(previous) = self.relay.replace(negotiated.handle) {
            previous.close().await;
        }
        debug!(user = %me.username(), "sending answer");
        // Delivery failure means the socket is gone; the read loop ends on its own.
        let _ = self.outbound.send(SignalEnvelope::answer(&negotiated.answer)).await;
        Ok(())
    }
}

async fn wait_for_mail(me: Option<&User>) {
    match me {
        Some(user) => user.mail().await,
        None => std::future::pending().await,
    }
}

/// Reconciles presence and delivers invitations. Sleeps until the registry
/// changes, an invitation arrives or `presence_poll` elapses.
async fn run_outbound(
    ctx: Arc<SessionContext>,
    mut identity: watch::Receiver<Option<Arc<User>>>,
    out: mpsc::Sender<SignalEnvelope>,
    cancel: CancellationToken,
) {
    let mut presence = PresenceSync::new();
    let mut changes = ctx.registry.subscribe();
    let mut me: Option<Arc<User>> = None;

    loop {
        if me.is_none() {
            if let Some(user) = identity.borrow_and_update().clone() {
                presence.announce(user.clone());
                me = Some(user);
            }
        }

        let mut pending = presence
            .reconcile(me.as_ref().map(|u| u.username()), &ctx.registry)
            .iter()
            .map(|e| e.to_envelope())
            .collect::<Vec<_>>();

        if let Some(user) = &me {
            if !presence.local().is_empty() {
                if let Some(invitation) = user.invitations.take() {
                    info!(user = %user.username(), conference = %invitation.conference, "sending invitation");
                    match SignalEnvelope::invite(&invitation) {
                        Ok(env) => pending.push(env),
                        Err(e) => error!("serialize invitation failed: {e}"),
                    }
                }
            }
        }

        for env in pending {
            if out.send(env).await.is_err() {
                return;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = changes.changed() => {}
            res = identity.changed(), if me.is_none() => {
                if res.is_err() {
                    return;
                }
            }
            _ = wait_for_mail(me.as_deref()) => {}
            _ = tokio::time::sleep(ctx.presence_poll) => {}
        }
    }
}
