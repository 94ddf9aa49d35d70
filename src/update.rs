use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;
use mio::{Interest, Registry, Token};

use crate::keys::{Attachment, KeyTable};
use crate::latch::LatchSignal;
use crate::manager::Manager;
use crate::selector::SelectorHandle;
use crate::timestamp::now_iso8601;
use crate::SelectorConfig;

/// Everything an update needs to mutate multiplexer state. Only ever
/// constructed by the producer thread, while the loop is not blocked
/// (spec §3, "Update").
pub(crate) struct Apply<'a, M: Manager> {
    pub registry: &'a Registry,
    pub keys: &'a mut KeyTable,
    pub manager: &'a Arc<M>,
    pub handle: &'a SelectorHandle<M>,
    pub config: &'a SelectorConfig,
    /// Set by `StopSelector` to tell the producer to release the
    /// multiplexer and exit the loop once this update returns.
    pub stop_requested: &'a mut bool,
}

/// A deferred mutation of multiplexer state (spec §3, §4.4). Each nested
/// helper class from the original design becomes one small struct here,
/// each implementing this one-method contract (design note §9).
pub(crate) trait Update<M: Manager>: Send {
    fn apply(&self, ctx: &mut Apply<'_, M>);

    /// Human-readable label used by `dump`'s pending-updates snapshot.
    fn label(&self) -> String;
}

/// Marks the selector running and releases whoever called `start`.
pub(crate) struct Start {
    pub started: Arc<AtomicBool>,
    pub signal: Mutex<Option<LatchSignal>>,
}

impl<M: Manager> Update<M> for Start {
    fn apply(&self, _ctx: &mut Apply<'_, M>) {
        self.started.store(true, Ordering::SeqCst);
        if let Some(signal) = self.signal.lock().unwrap().take() {
            signal.signal();
        }
    }

    fn label(&self) -> String {
        "Start".to_string()
    }
}

/// Snapshot the current key set as human-readable strings (spec §4.4,
/// §4.7).
pub(crate) struct DumpKeys {
    pub signal: Mutex<Option<LatchSignal>>,
    pub out: Arc<Mutex<Option<String>>>,
    /// The pending-updates snapshot, taken by the dumping thread before
    /// this update reached the head of the queue, so the two views
    /// describe the same instant (spec §4.7).
    pub pending_snapshot: Vec<String>,
}

/// Entries past this many keys are summarised instead of listed, so a
/// selector with a huge live set doesn't produce an unbounded dump
/// (Open Question (b)).
const DUMP_KEY_CAP: usize = 1024;

impl<M: Manager> Update<M> for DumpKeys {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let now = now_iso8601();
        let mut text = String::new();
        text.push_str(&format!("== selector {} dump @ {now} ==\n", ctx.config.id));
        text.push_str(&format!(
            "pending updates ({}):\n",
            self.pending_snapshot.len()
        ));
        for label in &self.pending_snapshot {
            text.push_str(&format!("  [{now}] {label}\n"));
        }
        let tokens = ctx.keys.tokens();
        text.push_str(&format!("keys ({}):\n", tokens.len()));
        for (i, token) in tokens.iter().enumerate() {
            if i >= DUMP_KEY_CAP {
                text.push_str(&format!(
                    "  ... {} more keys omitted\n",
                    tokens.len() - DUMP_KEY_CAP
                ));
                break;
            }
            if let Some(entry) = ctx.keys.get(*token) {
                let kind = match &entry.attachment {
                    Attachment::Endpoint(_) => "endpoint",
                    Attachment::Connect(_) => "connect",
                    Attachment::Acceptor(_) => "acceptor",
                    Attachment::Reserved => "reserved",
                };
                text.push_str(&format!(
                    "  [{now}] token={} interest={:?} kind={kind}\n",
                    token.0, entry.interest
                ));
            }
        }
        *self.out.lock().unwrap() = Some(text);
        if let Some(signal) = self.signal.lock().unwrap().take() {
            signal.signal();
        }
    }

    fn label(&self) -> String {
        "DumpKeys".to_string()
    }
}

/// Closes every endpoint reachable via key attachments. Records an
/// already-closed set so a retry is idempotent (spec §4.4).
pub(crate) struct CloseConnections {
    pub zero_remaining: Mutex<Option<LatchSignal>>,
    pub complete: Mutex<Option<LatchSignal>>,
    pub already_closed: Arc<Mutex<HashSet<Token>>>,
}

impl<M: Manager> Update<M> for CloseConnections {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let tokens = ctx.keys.tokens();
        let mut already = self.already_closed.lock().unwrap();
        for token in tokens {
            if !already.insert(token) {
                continue;
            }
            let Some(entry) = ctx.keys.remove(token) else {
                continue;
            };
            match entry.attachment {
                Attachment::Endpoint(ep) => {
                    ep.close(None);
                    ctx.manager.end_point_closed(&ep);
                }
                Attachment::Acceptor(mut listener) => {
                    let _ = ctx.registry.deregister(&mut listener);
                }
                Attachment::Connect(req) => {
                    req.failed.store(true, Ordering::SeqCst);
                }
                Attachment::Reserved => {}
            }
        }
        drop(already);
        if let Some(signal) = self.zero_remaining.lock().unwrap().take() {
            signal.signal();
        }
        if let Some(signal) = self.complete.lock().unwrap().take() {
            signal.signal();
        }
    }

    fn label(&self) -> String {
        "CloseConnections".to_string()
    }
}

/// Closes any remaining endpoints, releases the multiplexer, nulls the
/// handle (spec §4.4, §4.6).
pub(crate) struct StopSelector {
    pub signal: Mutex<Option<LatchSignal>>,
}

impl<M: Manager> Update<M> for StopSelector {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let tokens = ctx.keys.tokens();
        for token in tokens {
            let Some(entry) = ctx.keys.remove(token) else {
                continue;
            };
            match entry.attachment {
                Attachment::Endpoint(ep) => {
                    ep.close(None);
                    ctx.manager.end_point_closed(&ep);
                }
                Attachment::Acceptor(mut listener) => {
                    let _ = ctx.registry.deregister(&mut listener);
                }
                Attachment::Connect(req) => {
                    req.failed.store(true, Ordering::SeqCst);
                }
                Attachment::Reserved => {}
            }
        }
        *ctx.stop_requested = true;
        if let Some(signal) = self.signal.lock().unwrap().take() {
            signal.signal();
        }
    }

    fn label(&self) -> String {
        "StopSelector".to_string()
    }
}

/// An endpoint-supplied update changing its own interest mask (spec
/// §4.4, §4.5: "the endpoint may enqueue an update to change its
/// interest mask"). The endpoint itself performs the actual
/// `Registry::register`/`Registry::reregister` call, since the core
/// holds no reference to its raw channel. A key's first `ModifyInterest`
/// is the one that actually adds the channel to the multiplexer: an
/// active-accept key (and any other key whose `interest` starts `None`)
/// has never been registered, and issuing `reregister` against an fd the
/// OS doesn't know about fails with `ENOENT`.
pub(crate) struct ModifyInterest {
    pub token: Token,
    pub interest: Interest,
}

impl<M: Manager> Update<M> for ModifyInterest {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let Some(entry) = ctx.keys.get_mut(self.token) else {
            return;
        };
        let Attachment::Endpoint(ep) = &entry.attachment else {
            return;
        };
        let result = if entry.interest.is_none() {
            ep.register(ctx.registry, self.token, self.interest)
        } else {
            ep.reregister(ctx.registry, self.token, self.interest)
        };
        match result {
            Ok(()) => entry.interest = Some(self.interest),
            Err(err) => warn!(
                "selector {}: arming token {:?} failed: {err}",
                ctx.config.id, self.token
            ),
        }
    }

    fn label(&self) -> String {
        format!(
            "ModifyInterest(token={}, interest={:?})",
            self.token.0, self.interest
        )
    }
}

/// Tears down one endpoint on request from outside the loop (spec §6,
/// `destroyEndPoint`). Scans the key table for the matching attachment
/// since the caller only has the endpoint, not its token.
pub(crate) struct DestroyEndpoint {
    pub endpoint: Arc<dyn crate::endpoint::SelectableEndpoint>,
    pub cause: Mutex<Option<crate::error::SelectorError>>,
}

impl<M: Manager> Update<M> for DestroyEndpoint {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let token = ctx.keys.iter().find_map(|(token, entry)| match &entry.attachment {
            Attachment::Endpoint(ep) if Arc::ptr_eq(ep, &self.endpoint) => Some(token),
            _ => None,
        });
        let Some(token) = token else { return };
        if ctx.keys.remove(token).is_none() {
            return;
        }
        let cause = self.cause.lock().unwrap().take();
        self.endpoint.close(cause.as_ref());
        ctx.manager.end_point_closed(&self.endpoint);
    }

    fn label(&self) -> String {
        "DestroyEndpoint".to_string()
    }
}

/// Evicts a stale key: a connect whose timeout already closed the channel
/// and reported failure, or a reserved active-accept key whose endpoint
/// never finished constructing (spec §4.4, "Connect" timeout path and
/// "Active Accept" error path).
pub(crate) struct ForgetConnect {
    pub token: Token,
}

impl<M: Manager> Update<M> for ForgetConnect {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        ctx.keys.remove(self.token);
    }

    fn label(&self) -> String {
        format!("ForgetConnect(token={})", self.token.0)
    }
}

/// Fills in a key reserved by `ActiveAccept` once the worker thread has
/// finished constructing the endpoint off the producer thread (spec
/// §4.4, "Active Accept"). Only the producer thread may write the key
/// table, so this hop is required even though the endpoint itself was
/// already built by the time this update applies.
pub(crate) struct FillEndpointKey {
    pub token: Token,
    pub endpoint: Arc<dyn crate::endpoint::SelectableEndpoint>,
}

impl<M: Manager> Update<M> for FillEndpointKey {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        ctx.keys.fill(
            self.token,
            crate::keys::KeyEntry {
                interest: None,
                attachment: Attachment::Endpoint(self.endpoint.clone()),
            },
        );
    }

    fn label(&self) -> String {
        format!("FillEndpointKey(token={})", self.token.0)
    }
}
