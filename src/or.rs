//! Relay-wide context and node registry
//!
//! One [`OrContext`] per relay process: the long-term keys, the current
//! TLS identity material, the fingerprint-to-connection registry, and the
//! machinery for originating outbound links when a circuit extension
//! needs one.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rsa::RsaPrivateKey;
use tokio::net::{TcpListener, TcpStream};

use crate::commands::{CircuitCommand, CircuitQueue, CircuitRequest};
use crate::config::Config;
use crate::connection::OnionConnection;
use crate::error::{DestroyReason, Result, TorError};
use crate::protocol::ntor::NtorKeys;
use crate::tls::{Fingerprint, TlsTransport, TorTls};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-term key material the embedder loads for us.
pub struct RelayKeys {
    /// RSA onion key, targeted by TAP onionskins.
    pub onion: RsaPrivateKey,
    /// Curve25519 ntor keypair.
    pub ntor: NtorKeys,
}

/// SECURITY: the long-term keys wipe themselves when the context drops
/// (`RsaPrivateKey` zeroizes on drop, as does the ntor secret).
pub struct OrContext {
    pub config: Config,
    onion_key: RsaPrivateKey,
    ntor: NtorKeys,
    tls: Mutex<Arc<TorTls>>,
    transport: Arc<dyn TlsTransport>,
    registry: Mutex<HashMap<Fingerprint, CircuitQueue>>,
}

impl Drop for OrContext {
    fn drop(&mut self) {
        log::trace!("relay context dropped, long-term keys zeroized");
    }
}

impl OrContext {
    pub fn new(
        config: Config,
        keys: RelayKeys,
        tls: TorTls,
        transport: Arc<dyn TlsTransport>,
    ) -> Arc<OrContext> {
        Arc::new(OrContext {
            config,
            onion_key: keys.onion,
            ntor: keys.ntor,
            tls: Mutex::new(Arc::new(tls)),
            transport,
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn onion_key(&self) -> &RsaPrivateKey {
        &self.onion_key
    }

    pub(crate) fn ntor_keys(&self) -> &NtorKeys {
        &self.ntor
    }

    /// The identity material presented on new links.
    pub fn current_tls(&self) -> Arc<TorTls> {
        Arc::clone(&self.tls.lock().expect("tls lock poisoned"))
    }

    /// Swap in freshly generated link certificates. Existing connections
    /// keep the material they handshook with.
    pub fn rotate_tls(&self, new: TorTls) {
        *self.tls.lock().expect("tls lock poisoned") = Arc::new(new);
    }

    /// Record an authenticated connection. At most one connection may be
    /// registered per fingerprint.
    pub(crate) fn register_connection(
        &self,
        fingerprint: Fingerprint,
        queue: CircuitQueue,
    ) -> Result<()> {
        let mut registry = self.registry.lock().expect("registry poisoned");
        if registry.contains_key(&fingerprint) {
            return Err(TorError::Registry(
                "we already have this fingerprint registered".into(),
            ));
        }
        log::info!("registering a connection for {fingerprint}");
        registry.insert(fingerprint, queue);
        Ok(())
    }

    /// Deregister, but only if `queue` is the registered connection.
    pub(crate) fn end_connection(&self, fingerprint: &Fingerprint, queue: &CircuitQueue) {
        let mut registry = self.registry.lock().expect("registry poisoned");
        if let Some(current) = registry.get(fingerprint) {
            if current.same_channel(queue) {
                registry.remove(fingerprint);
            }
        }
    }

    /// Route a circuit request to an existing connection for the target
    /// fingerprint, or dial one.
    pub async fn request_circuit(self: &Arc<Self>, request: Box<CircuitRequest>) -> Result<()> {
        let existing = {
            let registry = self.registry.lock().expect("registry poisoned");
            request
                .hint
                .fingerprint()
                .and_then(|fp| registry.get(fp).cloned())
        };

        let request = match existing {
            Some(queue) => match queue.send(CircuitCommand::Request(request)).await {
                Ok(()) => return Ok(()),
                // The connection died between lookup and send; fall back
                // to dialing with the request handed back to us.
                Err(tokio::sync::mpsc::error::SendError(CircuitCommand::Request(req))) => req,
                Err(_) => unreachable!("request comes back as a request"),
            },
            None => request,
        };

        let or = Arc::clone(self);
        tokio::spawn(or.dial_for_request(request));
        Ok(())
    }

    /// Walk the candidate addresses until one yields a full link, checking
    /// for cancellation between attempts.
    ///
    /// Boxed explicitly (rather than `async fn`) because this call chain
    /// loops back into `request_circuit` via `handle_client`; without a
    /// nominal `dyn Future + Send` boundary here, rustc's auto-trait
    /// solver hits a cycle trying to prove the recursive state machine is
    /// `Send` and rejects the `tokio::spawn` call site.
    fn dial_for_request(
        self: Arc<Self>,
        request: Box<CircuitRequest>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
        let addresses = request.hint.addresses().to_vec();
        for addr in addresses {
            if request.state.is_aborted() {
                log::info!("aborting connection attempt");
                return;
            }

            log::info!("connecting to {addr}");
            let socket =
                match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                    Ok(Ok(socket)) => socket,
                    Ok(Err(err)) => {
                        log::info!("connecting to {addr} failed: {err}");
                        continue;
                    }
                    Err(_) => {
                        log::info!("connecting to {addr} timed out");
                        continue;
                    }
                };

            match self.transport.connect(socket).await {
                Ok(link) => {
                    OnionConnection::handle_client(Arc::clone(&self), link, addr, Some(request))
                        .await;
                    return;
                }
                Err(err) => {
                    log::warn!("TLS with {addr} failed: {err}");
                    let _ = request
                        .success_queue
                        .send(CircuitCommand::Destroyed {
                            id: request.local_id,
                            reason: DestroyReason::Internal,
                            for_relay: false,
                        })
                        .await;
                    return;
                }
            }
        }

        // Bad luck, but it does need to be reported.
        let _ = request
            .success_queue
            .send(CircuitCommand::Destroyed {
                id: request.local_id,
                reason: DestroyReason::ConnectFailed,
                for_relay: false,
            })
            .await;
        })
    }

    /// Accept loop for the OR listener. Each connection gets its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    continue;
                }
            };
            let or = Arc::clone(&self);
            tokio::spawn(async move {
                log::debug!("{peer_addr} says hi");
                or.accept_connection(socket, peer_addr).await;
            });
        }
    }

    async fn accept_connection(self: Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) {
        match self.transport.accept(socket).await {
            Ok(link) => OnionConnection::handle_server(self, link, peer_addr).await,
            Err(err) => log::info!("TLS with {peer_addr} failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsLink;
    use async_trait::async_trait;
    use rand::rngs::OsRng;
    use tokio::sync::mpsc;

    struct NoTransport;

    #[async_trait]
    impl TlsTransport for NoTransport {
        async fn accept(&self, _tcp: TcpStream) -> Result<TlsLink> {
            Err(TorError::Internal("unused".into()))
        }
        async fn connect(&self, _tcp: TcpStream) -> Result<TlsLink> {
            Err(TorError::Internal("unused".into()))
        }
    }

    fn test_context() -> Arc<OrContext> {
        let identity = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let tls = TorTls::new(
            vec![1],
            vec![2],
            vec![3],
            identity.clone(),
            &identity.to_public_key(),
        )
        .unwrap();
        OrContext::new(
            Config::default(),
            RelayKeys {
                onion: identity,
                ntor: crate::protocol::ntor::NtorKeys::generate(),
            },
            tls,
            Arc::new(NoTransport),
        )
    }

    #[test]
    fn rotate_tls_replaces_material() {
        let or = test_context();
        let before = or.current_tls();

        let identity = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let fresh = TorTls::new(
            vec![9],
            vec![8],
            vec![7],
            identity.clone(),
            &identity.to_public_key(),
        )
        .unwrap();
        let fresh_fingerprint = fresh.fingerprint;
        or.rotate_tls(fresh);

        let after = or.current_tls();
        assert_eq!(after.fingerprint, fresh_fingerprint);
        assert_ne!(after.fingerprint, before.fingerprint);
        assert_eq!(after.link_cert_der, vec![9]);

        // Connections holding the old material are unaffected by the swap.
        assert_eq!(before.link_cert_der, vec![1]);
    }

    #[tokio::test]
    async fn registry_holds_one_connection_per_fingerprint() {
        let or = test_context();
        let fp = Fingerprint::from_bytes([1u8; 20]);
        let (first, _rx1) = mpsc::channel(1);
        let (second, _rx2) = mpsc::channel(1);

        or.register_connection(fp, first.clone()).unwrap();
        assert!(or.register_connection(fp, second.clone()).is_err());

        // Deregistration by anyone but the owner is a no-op.
        or.end_connection(&fp, &second);
        assert!(or.register_connection(fp, second.clone()).is_err());

        or.end_connection(&fp, &first);
        or.register_connection(fp, second).unwrap();
    }
}
