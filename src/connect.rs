use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::error::SelectorError;
use crate::keys::{Attachment, KeyEntry};
use crate::manager::{ConnectContext, Manager, TimeoutHandle};
use crate::update::{Apply, Update};

/// A transient entity driving a single non-blocking connect (spec §3,
/// §4.4). Holds the channel, a single-shot failure flag shared with its
/// scheduled timeout, and the timeout handle itself.
pub(crate) struct ConnectRequest {
    pub channel: Mutex<Option<TcpStream>>,
    pub failed: AtomicBool,
    pub timeout: Mutex<Option<Box<dyn TimeoutHandle>>>,
}

/// Registers a connecting channel with connect-interest (mio has no
/// distinct "connect" bit; a connecting stream is polled for
/// writability, same as mio's own `net::TcpStream::connect` contract)
/// and installs a timeout (spec §4.4).
pub(crate) struct Connect {
    pub channel: Mutex<Option<TcpStream>>,
}

impl<M: Manager> Update<M> for Connect {
    fn apply(&self, ctx: &mut Apply<'_, M>) {
        let Some(mut channel) = self.channel.lock().unwrap().take() else {
            return;
        };

        let request = Arc::new(ConnectRequest {
            channel: Mutex::new(None),
            failed: AtomicBool::new(false),
            timeout: Mutex::new(None),
        });

        let entry = KeyEntry {
            interest: Some(Interest::WRITABLE),
            attachment: Attachment::Connect(request.clone()),
        };
        let token = ctx.keys.insert(entry);

        if let Err(err) = ctx.registry.register(&mut channel, token, Interest::WRITABLE) {
            warn!(
                "selector {}: registering connect channel failed: {err}",
                ctx.config.id
            );
            ctx.keys.remove(token);
            ctx.manager
                .connection_failed(&channel, &SelectorError::ConnectFailed(err));
            return;
        }

        *request.channel.lock().unwrap() = Some(channel);

        let timeout_request = request.clone();
        let handle = ctx.handle.clone();
        let timeout_duration = ctx.manager.connect_timeout();
        let manager_for_timeout = ctx.manager.clone();
        let timeout_task: crate::endpoint::Task = Box::new(move || {
            if timeout_request
                .failed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!("connect timed out for token {:?}", token);
                if let Some(channel) = timeout_request.channel.lock().unwrap().take() {
                    manager_for_timeout
                        .connection_failed(&channel, &SelectorError::ConnectTimedOut);
                }
                handle.forget_connect(token);
            }
        });
        let timeout_handle = ctx.manager.scheduler().schedule(timeout_task, timeout_duration);
        *request.timeout.lock().unwrap() = Some(timeout_handle);
    }

    fn label(&self) -> String {
        "Connect".to_string()
    }
}

/// Outcome of attempting to complete a connect in response to readiness
/// (spec §4.2). `Pending` means the non-blocking connect has not actually
/// finished yet and the key stays registered as-is.
pub(crate) enum ConnectOutcome {
    Endpoint(Arc<dyn crate::endpoint::SelectableEndpoint>),
    Pending,
    Closed,
}

/// Completes a connect in response to connect-readiness, called from the
/// producer's key-processing phase with the request already looked up
/// (spec §4.2, "If the key signals connect-readiness ... complete the
/// connect inline").
pub(crate) fn complete_connect<M: Manager>(
    manager: &Arc<M>,
    request: &Arc<ConnectRequest>,
    token: Token,
    selector: crate::selector::SelectorHandle<M>,
) -> ConnectOutcome {
    if request.failed.load(Ordering::SeqCst) {
        // The timeout already won the race.
        return ConnectOutcome::Closed;
    }
    let Some(channel) = request.channel.lock().unwrap().take() else {
        return ConnectOutcome::Closed;
    };
    match manager.do_finish_connect(&channel) {
        Ok(true) => {
            if request
                .failed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return ConnectOutcome::Closed;
            }
            if let Some(handle) = request.timeout.lock().unwrap().take() {
                handle.cancel();
            }
            match manager.new_endpoint(channel, token, selector) {
                Ok(endpoint) => {
                    manager.end_point_opened(&endpoint);
                    manager.new_connection(&endpoint, ConnectContext::Active);
                    manager.connection_opened(&endpoint);
                    ConnectOutcome::Endpoint(endpoint)
                }
                Err(err) => {
                    warn!("building endpoint for completed connect failed: {err}");
                    ConnectOutcome::Closed
                }
            }
        }
        Ok(false) => {
            *request.channel.lock().unwrap() = Some(channel);
            ConnectOutcome::Pending
        }
        Err(err) => {
            if request
                .failed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(handle) = request.timeout.lock().unwrap().take() {
                    handle.cancel();
                }
                manager.connection_failed(&channel, &SelectorError::ConnectFailed(err));
            }
            ConnectOutcome::Closed
        }
    }
}
