// Path: crates/master/src/control.rs
//! The loopback control channel the CLI talks to.
//!
//! Requester authentication is the deployment's concern (an external-auth
//! boolean in front of this handler); the daemon only ever binds this
//! channel to 127.0.0.1.

use crate::dispatcher::{Dispatcher, PublishCommand};
use crate::jobs::JobCache;
use crate::runners::{self, RunnerContext};
use async_trait::async_trait;
use herd_transport::{PeerInfo, RequestHandler, Response};
use herd_types::envelope::{EncKind, Envelope};
use herd_types::error::ErrorCode;
use herd_types::wire::{ControlReply, ControlRequest};
use std::sync::Arc;
use std::time::Duration;

/// Handles control-channel requests.
pub struct ControlHandler {
    dispatcher: Arc<Dispatcher>,
    cache: Arc<JobCache>,
    runner_ctx: RunnerContext,
}

impl ControlHandler {
    /// Wires the handler.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        cache: Arc<JobCache>,
        runner_ctx: RunnerContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            cache,
            runner_ctx,
        })
    }

    async fn dispatch(&self, req: ControlRequest) -> ControlReply {
        match req {
            ControlRequest::Publish {
                target,
                fun,
                arg,
                kwarg,
                ret,
                user,
                timeout_secs,
            } => {
                let cmd = PublishCommand {
                    target,
                    fun,
                    arg,
                    kwarg,
                    ret,
                    user,
                    timeout: timeout_secs.map(Duration::from_secs),
                };
                match self.dispatcher.publish(cmd).await {
                    Ok((jid, resolution)) => ControlReply::Published {
                        jid,
                        minions: if resolution.exact {
                            resolution.minions.into_iter().collect()
                        } else {
                            Vec::new()
                        },
                    },
                    Err(e) => error_reply(&e),
                }
            }
            ControlRequest::JobStatus { jid } => match self.cache.status(&jid) {
                Some(view) => ControlReply::Job(view),
                None => error_reply(&herd_types::error::DispatchError::JobNotFound(
                    jid.to_string(),
                )),
            },
            ControlRequest::Runner { fun, arg } => {
                match runners::run(&self.runner_ctx, &fun, &arg) {
                    Ok(value) => ControlReply::Runner { value },
                    Err(e) => error_reply(&e),
                }
            }
        }
    }
}

fn error_reply<E: ErrorCode + std::fmt::Display>(e: &E) -> ControlReply {
    ControlReply::Error {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl RequestHandler for ControlHandler {
    async fn handle(&self, _peer: &PeerInfo, env: Envelope) -> Response {
        let reply = match env.open_clear::<ControlRequest>() {
            Ok(req) => self.dispatch(req).await,
            Err(e) => ControlReply::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        };
        Envelope::clear(&reply)
            .unwrap_or_else(|_| Envelope {
                enc: EncKind::Clear,
                load: Vec::new(),
                hint: None,
            })
            .into()
    }
}
