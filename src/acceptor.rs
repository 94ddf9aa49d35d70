use std::sync::Mutex;

use log::warn;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;

use crate::error::SelectorError;
use crate::keys::{Attachment, KeyEntry};
use crate::manager::{ConnectContext, Manager};
use crate::update::{Apply, Update};

/// Registers a server channel with accept-interest; re-arms after each
/// batch (spec §4.4). The acceptor itself lives as the key's attachment;
/// readiness for it is handled specially by the producer rather than
/// through `SelectableEndpoint`, since accepting is not endpoint-level
/// behaviour.
pub(crate) struct Accept {
    pub server: Mutex<Option<TcpListener>>,
}

impl<M: Manager> Update<M> for Accept {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let Some(mut server) = self.server.lock().unwrap().take() else {
            return;
        };
        // mio ties a registration to a specific token at call time, so
        // the token has to exist before we have somewhere to put the
        // listener; reserve one first and fill it in once registration
        // succeeds.
        let token = ctx.keys.reserve();
        if let Err(err) = ctx.registry.register(&mut server, token, Interest::READABLE) {
            warn!("selector {}: registering acceptor failed: {err}", ctx.config.id);
            ctx.keys.remove(token);
            return;
        }
        ctx.keys.fill(
            token,
            KeyEntry {
                interest: Some(Interest::READABLE),
                attachment: Attachment::Acceptor(server),
            },
        );
    }

    fn label(&self) -> String {
        "Accept(passive)".to_string()
    }
}

/// Reserves a key (interest "none": mio has no zero-interest
/// registration, so the slot stays unregistered until the endpoint's
/// first `ModifyInterest` update arms it via `SelectableEndpoint::register`)
/// for an already-accepted channel, then schedules endpoint creation on a
/// worker (spec §4.4). The worker fills the reserved key in with the
/// finished endpoint via `FillEndpointKey`, since only the producer thread
/// may touch the key table.
pub(crate) struct ActiveAccept {
    pub channel: Mutex<Option<TcpStream>>,
}

impl<M: Manager + 'static> Update<M> for ActiveAccept {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let Some(channel) = self.channel.lock().unwrap().take() else {
            return;
        };
        let token = ctx.keys.reserve();
        let manager = ctx.manager.clone();
        let handle = ctx.handle.clone();
        let task: crate::endpoint::Task = Box::new(move || {
            match manager.new_endpoint(channel, token, handle.clone()) {
                Ok(endpoint) => {
                    manager.end_point_opened(&endpoint);
                    handle.fill_endpoint_key(token, endpoint.clone());
                    manager.new_connection(&endpoint, ConnectContext::Accepted);
                    manager.connection_opened(&endpoint);
                }
                Err(err) => {
                    manager.on_accept_failed(&SelectorError::AcceptFailed(err));
                    handle.forget_connect(token);
                }
            }
        });
        if let Err(task) = ctx.manager.executor().submit(task) {
            // Executor rejected it (shutting down); there is nothing
            // "closeable" to run inline safely here, so drop the task and
            // release the reserved token (spec §7).
            drop(task);
            ctx.keys.remove(token);
        }
    }

    fn label(&self) -> String {
        "ActiveAccept".to_string()
    }
}
