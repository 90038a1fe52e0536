//! Protocol dispatcher.
//!
//! Single entry point translating inbound commands into engine invocations:
//! one command, one engine call, one correlated reply, in arrival order.
//! Commands that arrive while the engine is still loading are queued behind
//! the readiness gate, never dropped and never run against a half-built
//! engine.
//!
//! Every per-call engine instance lives exactly as long as its handler
//! invocation; release happens at scope exit on success and error paths
//! alike.

use std::collections::VecDeque;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use super::readiness::ReadinessGate;
use super::{
    error_marker, ClientRequestPayload, ClientRequestResult, Command, CommandParseError,
    ComputeIntersectionPayload, ErrorNotice, IntersectionResult, Reply, ServerResponsePayload,
    ServerResponseResult,
};
use crate::codec::{self, CodecError};
use crate::engine::{
    EngineError, EngineResult, PsiClient, PsiEngine, PsiServer, Request, Response, ServerSetup,
    SetupStructure, KEY_LEN,
};
use crate::session::{EntropyError, EntropyProvider, SessionKeyManager};

/// Target false-positive rate for the server setup message.
pub const SETUP_FALSE_POSITIVE_RATE: f64 = 0.001;

/// Failures while executing a parsed command.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A command reached a handler before initialization. The queue in
    /// [`serve`] prevents this in normal operation.
    #[error("engine not ready")]
    NotReady,

    #[error("protocol decode error: {0}")]
    ProtocolDecode(#[from] CodecError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("entropy failure: {0}")]
    Entropy(#[from] EntropyError),
}

impl DispatchError {
    pub fn marker(&self) -> &'static str {
        match self {
            DispatchError::NotReady => error_marker::NOT_READY,
            DispatchError::ProtocolDecode(_) => error_marker::PROTOCOL_DECODE_ERROR,
            DispatchError::Engine(_) => error_marker::ENGINE_ERROR,
            DispatchError::Entropy(_) => error_marker::ENGINE_ERROR,
        }
    }
}

/// The command executor. Owns the single engine handle exclusively; nothing
/// else in the process may touch the engine.
pub struct Dispatcher<E: PsiEngine, P: EntropyProvider> {
    engine: E,
    session: SessionKeyManager<P>,
    structure: SetupStructure,
}

impl<E: PsiEngine, P: EntropyProvider> Dispatcher<E, P> {
    pub fn new(engine: E, session: SessionKeyManager<P>) -> Self {
        Self {
            engine,
            session,
            structure: SetupStructure::Gcs,
        }
    }

    /// Override the setup structure (GCS by default).
    pub fn with_structure(mut self, structure: SetupStructure) -> Self {
        self.structure = structure;
        self
    }

    /// Parse and execute one raw transport message.
    ///
    /// Returns `None` only for the inbound readiness notification, which is
    /// not a request. Everything else - including garbage - yields exactly
    /// one reply.
    pub fn handle_raw(&mut self, raw: &str) -> Option<Reply> {
        match Command::parse(raw) {
            Ok(command) => self.handle_command(command),
            Err(error) => {
                warn!("rejecting malformed message: {}", error);
                Some(parse_error_reply(error, raw))
            }
        }
    }

    /// Execute one parsed command.
    pub fn handle_command(&mut self, command: Command) -> Option<Reply> {
        match command {
            Command::Initialized => {
                // Outbound-only notification; nothing to execute.
                debug!("ignoring inbound INITIALIZED notification");
                None
            }
            Command::CreateRequest { id, payload } => {
                debug!(id = %id, items = payload.grid.len(), "CREATE_REQUEST");
                Some(match self.create_request(payload) {
                    Ok(result) => Reply::CreateRequest {
                        id,
                        payload: result,
                    },
                    Err(error) => error_reply(Some(id), &error),
                })
            }
            Command::CreateResponse { id, payload } => {
                debug!(id = %id, items = payload.grid.len(), "CREATE_RESPONSE");
                Some(match self.create_response(payload) {
                    Ok(result) => Reply::CreateResponse {
                        id,
                        payload: result,
                    },
                    Err(error) => error_reply(Some(id), &error),
                })
            }
            Command::ComputeIntersection { id, payload } => {
                debug!(id = %id, "COMPUTE_INTERSECTION");
                Some(match self.compute_intersection(payload) {
                    Ok(result) => Reply::ComputeIntersection {
                        id,
                        payload: result,
                    },
                    Err(error) => error_reply(Some(id), &error),
                })
            }
        }
    }

    /// Client role: encrypt the grid under a fresh ephemeral key and hand
    /// the key back to the caller. Nothing is retained here afterwards.
    fn create_request(
        &mut self,
        payload: ClientRequestPayload,
    ) -> Result<ClientRequestResult, DispatchError> {
        let context_id = self.session.new_correlation_token()?;
        let seed = self.session.new_key_seed()?;

        let client = self.engine.client_from_key(seed.as_bytes(), true)?;
        let request = client.create_request(&payload.grid)?;
        let mut private_key = client.private_key_bytes();
        drop(client);

        let encoded_key = codec::encode(&private_key);
        private_key.zeroize();

        Ok(ClientRequestResult {
            context_id,
            private_key: encoded_key,
            client_request: codec::encode_message(&request)?,
        })
    }

    /// Server role: process the client's request and build the setup
    /// message over the server's own grid.
    fn create_response(
        &mut self,
        payload: ServerResponsePayload,
    ) -> Result<ServerResponseResult, DispatchError> {
        let request: Request = codec::decode_message(&payload.request)?;
        let seed = self.session.new_key_seed()?;

        let server = self.engine.server_from_key(seed.as_bytes(), true)?;
        let response = server.process_request(&request)?;
        // Sized from the DECODED REQUEST's element count, not the server
        // grid length; the false-positive-rate correction depends on how
        // many membership probes the client will make.
        let setup = server.create_setup_message(
            SETUP_FALSE_POSITIVE_RATE,
            request.num_encrypted_elements(),
            &payload.grid,
            self.structure,
        )?;
        drop(server);

        Ok(ServerResponseResult {
            server_response: codec::encode_message(&response)?,
            server_setup: codec::encode_message(&setup)?,
        })
    }

    /// Client role, second phase: rebuild the instance from the private key
    /// the caller stored after `CreateRequest` and finish the handshake.
    fn compute_intersection(
        &mut self,
        payload: ComputeIntersectionPayload,
    ) -> Result<IntersectionResult, DispatchError> {
        let key_bytes = Zeroizing::new(codec::decode(&payload.key)?);
        let key = Zeroizing::new(<[u8; KEY_LEN]>::try_from(key_bytes.as_slice()).map_err(
            |_| CodecError::Decode(format!("private key must be {} bytes", KEY_LEN)),
        )?);
        let response: Response = codec::decode_message(&payload.response)?;
        let setup: ServerSetup = codec::decode_message(&payload.setup)?;

        let client = self.engine.client_from_key(&key, true)?;
        let mut indices = client.intersection(&setup, &response)?;
        drop(client);

        // The engine does not guarantee order.
        indices.sort_unstable();
        indices.dedup();

        Ok(IntersectionResult {
            intersection: indices,
        })
    }
}

fn error_reply(id: Option<String>, error: &DispatchError) -> Reply {
    warn!("command failed: {}", error);
    Reply::Error {
        id,
        payload: ErrorNotice {
            error: error.marker().to_string(),
            message: error.to_string(),
            original: None,
        },
    }
}

fn parse_error_reply(error: CommandParseError, raw: &str) -> Reply {
    let (marker, id, original) = match &error {
        CommandParseError::Envelope { .. } | CommandParseError::MissingId { .. } => (
            error_marker::ENVELOPE_PARSE_ERROR,
            None,
            Some(raw.to_string()),
        ),
        CommandParseError::UnknownType { id, .. } => (
            error_marker::UNKNOWN_COMMAND,
            id.clone(),
            Some(raw.to_string()),
        ),
        CommandParseError::Payload { id, .. } => (
            error_marker::PROTOCOL_DECODE_ERROR,
            Some(id.clone()),
            None,
        ),
    };
    Reply::Error {
        id,
        payload: ErrorNotice {
            error: marker.to_string(),
            message: error.to_string(),
            original,
        },
    }
}

/// Run the dispatch loop.
///
/// Phase one awaits `init` while queuing any early commands. Once the engine
/// is up, the gate flips, the `INITIALIZED` notification goes out, the queue
/// drains in arrival order, and the loop settles into one-in one-out
/// processing until the inbound channel closes.
pub async fn serve<E, P, F>(
    init: F,
    session: SessionKeyManager<P>,
    structure: SetupStructure,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    gate: ReadinessGate,
) -> Result<(), EngineError>
where
    E: PsiEngine,
    P: EntropyProvider,
    F: Future<Output = EngineResult<E>>,
{
    tokio::pin!(init);
    let mut pending: VecDeque<String> = VecDeque::new();

    let engine = loop {
        tokio::select! {
            result = &mut init => match result {
                Ok(engine) => break engine,
                Err(error) => {
                    warn!("engine initialization failed: {}", error);
                    let diagnostic = Reply::Error {
                        id: None,
                        payload: ErrorNotice {
                            error: error_marker::FATAL.to_string(),
                            message: format!("engine initialization failed: {}", error),
                            original: None,
                        },
                    };
                    let _ = outbound.send(diagnostic.to_json()).await;
                    return Err(error);
                }
            },
            message = inbound.recv() => match message {
                Some(raw) => {
                    debug!("queuing command received before readiness");
                    pending.push_back(raw);
                }
                None => return Ok(()),
            },
        }
    };

    gate.mark_ready();
    info!("engine ready, {} queued command(s)", pending.len());

    let mut dispatcher = Dispatcher::new(engine, session).with_structure(structure);
    if outbound.send(Reply::initialized().to_json()).await.is_err() {
        return Ok(());
    }

    for raw in pending.drain(..) {
        if !process_one(&mut dispatcher, &raw, &outbound).await {
            return Ok(());
        }
    }
    while let Some(raw) = inbound.recv().await {
        if !process_one(&mut dispatcher, &raw, &outbound).await {
            return Ok(());
        }
    }
    info!("inbound channel closed, shutting down");
    Ok(())
}

/// Returns false when the outbound side is gone and serving should stop.
async fn process_one<E: PsiEngine, P: EntropyProvider>(
    dispatcher: &mut Dispatcher<E, P>,
    raw: &str,
    outbound: &mpsc::Sender<String>,
) -> bool {
    match dispatcher.handle_raw(raw) {
        Some(reply) => outbound.send(reply.to_json()).await.is_ok(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EcdhPsiEngine, MockPsiEngine};

    fn mock_dispatcher(engine: &MockPsiEngine) -> Dispatcher<MockPsiEngine, crate::session::SystemEntropy> {
        Dispatcher::new(engine.clone(), SessionKeyManager::system())
    }

    fn create_request_command(id: &str, grid: &[&str]) -> Command {
        Command::CreateRequest {
            id: id.to_string(),
            payload: ClientRequestPayload {
                grid: grid.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn test_create_request_success() {
        let engine = MockPsiEngine::new();
        let mut dispatcher = mock_dispatcher(&engine);

        let reply = dispatcher
            .handle_command(create_request_command("a1", &["mon-10", "tue-14"]))
            .unwrap();

        match reply {
            Reply::CreateRequest { id, payload } => {
                assert_eq!(id, "a1");
                assert_eq!(payload.context_id.len(), 8);
                assert_eq!(codec::decode(&payload.private_key).unwrap().len(), KEY_LEN);
                let request: Request = codec::decode_message(&payload.client_request).unwrap();
                assert_eq!(request.num_encrypted_elements(), 2);
                assert!(request.reveal_intersection);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(engine.created_clients(), 1);
        assert_eq!(engine.released_clients(), 1);
    }

    #[test]
    fn test_create_response_sizes_setup_from_request_not_grid() {
        let engine = MockPsiEngine::new();
        let mut dispatcher = mock_dispatcher(&engine);

        // Client request with 3 elements, server grid with 1 item
        let request = Request {
            reveal_intersection: true,
            encrypted_elements: vec![vec![1], vec![2], vec![3]],
        };
        let command = Command::CreateResponse {
            id: "b1".to_string(),
            payload: ServerResponsePayload {
                request: codec::encode_message(&request).unwrap(),
                grid: vec!["wed-09".to_string()],
            },
        };

        let reply = dispatcher.handle_command(command).unwrap();
        assert!(matches!(reply, Reply::CreateResponse { .. }));

        let calls = engine.setup_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].num_client_elements, 3);
        assert_eq!(calls[0].num_items, 1);
        assert_eq!(calls[0].false_positive_rate, SETUP_FALSE_POSITIVE_RATE);
        assert_eq!(engine.released_servers(), 1);
    }

    #[test]
    fn test_compute_intersection_sorts_and_deduplicates() {
        let engine = MockPsiEngine::new();
        engine.set_intersection(vec![4, 1, 3, 3]);
        let mut dispatcher = mock_dispatcher(&engine);

        let command = Command::ComputeIntersection {
            id: "c1".to_string(),
            payload: ComputeIntersectionPayload {
                key: codec::encode(&[7u8; KEY_LEN]),
                response: codec::encode_message(&Response {
                    encrypted_elements: vec![],
                })
                .unwrap(),
                setup: codec::encode_message(&ServerSetup::Raw(crate::engine::RawSetup {
                    element_hashes: vec![],
                }))
                .unwrap(),
            },
        };

        match dispatcher.handle_command(command).unwrap() {
            Reply::ComputeIntersection { id, payload } => {
                assert_eq!(id, "c1");
                assert_eq!(payload.intersection, vec![1, 3, 4]);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(engine.released_clients(), 1);
    }

    #[test]
    fn test_malformed_request_is_protocol_decode_error() {
        let engine = MockPsiEngine::new();
        let mut dispatcher = mock_dispatcher(&engine);

        let command = Command::CreateResponse {
            id: "b2".to_string(),
            payload: ServerResponsePayload {
                request: "!!!not base64!!!".to_string(),
                grid: vec![],
            },
        };

        match dispatcher.handle_command(command).unwrap() {
            Reply::Error { id, payload } => {
                assert_eq!(id.as_deref(), Some("b2"));
                assert_eq!(payload.error, error_marker::PROTOCOL_DECODE_ERROR);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        // Decode failed before any instance was built
        assert_eq!(engine.created_servers(), 0);
    }

    #[test]
    fn test_wrong_key_length_is_protocol_decode_error() {
        let engine = MockPsiEngine::new();
        let mut dispatcher = mock_dispatcher(&engine);

        let command = Command::ComputeIntersection {
            id: "c2".to_string(),
            payload: ComputeIntersectionPayload {
                key: codec::encode(&[1u8; 16]),
                response: codec::encode(&[]),
                setup: codec::encode(&[]),
            },
        };

        match dispatcher.handle_command(command).unwrap() {
            Reply::Error { payload, .. } => {
                assert_eq!(payload.error, error_marker::PROTOCOL_DECODE_ERROR);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_engine_failure_still_releases_instance() {
        let engine = MockPsiEngine::new();
        engine.fail_create_request();
        let mut dispatcher = mock_dispatcher(&engine);

        match dispatcher
            .handle_command(create_request_command("a2", &["mon-10"]))
            .unwrap()
        {
            Reply::Error { id, payload } => {
                assert_eq!(id.as_deref(), Some("a2"));
                assert_eq!(payload.error, error_marker::ENGINE_ERROR);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(engine.created_clients(), 1);
        assert_eq!(engine.released_clients(), 1);
    }

    #[test]
    fn test_unknown_command_never_reaches_engine() {
        let engine = MockPsiEngine::new();
        let mut dispatcher = mock_dispatcher(&engine);

        let raw = r#"{"id":"u1","type":"LAUNCH_MISSILES","payload":{}}"#;
        match dispatcher.handle_raw(raw).unwrap() {
            Reply::Error { id, payload } => {
                assert_eq!(id.as_deref(), Some("u1"));
                assert_eq!(payload.error, error_marker::UNKNOWN_COMMAND);
                assert_eq!(payload.original.as_deref(), Some(raw));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(engine.created_clients(), 0);
        assert_eq!(engine.created_servers(), 0);
    }

    #[test]
    fn test_garbage_yields_envelope_error_with_original() {
        let engine = MockPsiEngine::new();
        let mut dispatcher = mock_dispatcher(&engine);

        match dispatcher.handle_raw("not json").unwrap() {
            Reply::Error { id, payload } => {
                assert!(id.is_none());
                assert_eq!(payload.error, error_marker::ENVELOPE_PARSE_ERROR);
                assert_eq!(payload.original.as_deref(), Some("not json"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_inbound_initialized_is_ignored() {
        let engine = MockPsiEngine::new();
        let mut dispatcher = mock_dispatcher(&engine);
        assert!(dispatcher.handle_raw(r#"{"type":"INITIALIZED"}"#).is_none());
    }

    #[test]
    fn test_full_handshake_through_handlers() {
        // Real engine, both roles driven through the dispatcher alone.
        let engine = EcdhPsiEngine::new();
        let mut dispatcher = Dispatcher::new(engine, SessionKeyManager::system());

        let reply = dispatcher
            .handle_command(create_request_command("h1", &["mon-10", "tue-14"]))
            .unwrap();
        let (key, client_request) = match reply {
            Reply::CreateRequest { payload, .. } => (payload.private_key, payload.client_request),
            other => panic!("unexpected reply: {:?}", other),
        };

        let reply = dispatcher
            .handle_command(Command::CreateResponse {
                id: "h2".to_string(),
                payload: ServerResponsePayload {
                    request: client_request,
                    grid: vec!["tue-14".to_string(), "wed-09".to_string()],
                },
            })
            .unwrap();
        let (response, setup) = match reply {
            Reply::CreateResponse { payload, .. } => {
                (payload.server_response, payload.server_setup)
            }
            other => panic!("unexpected reply: {:?}", other),
        };

        let reply = dispatcher
            .handle_command(Command::ComputeIntersection {
                id: "h3".to_string(),
                payload: ComputeIntersectionPayload {
                    key,
                    response,
                    setup,
                },
            })
            .unwrap();
        match reply {
            Reply::ComputeIntersection { payload, .. } => {
                assert_eq!(payload.intersection, vec![1]);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
