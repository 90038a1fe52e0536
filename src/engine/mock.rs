//! Mock PSI engine for dispatcher tests.
//!
//! Scriptable results, per-operation fault injection, and creation/release
//! counters so tests can assert that every handler releases exactly the
//! instances it created - including on error paths.

use std::sync::{Arc, Mutex};

use super::{
    element_hash64, EngineError, EngineResult, PsiClient, PsiEngine, PsiServer, RawSetup, Request,
    Response, ServerSetup, SetupStructure, KEY_LEN,
};

/// Arguments of a `create_setup_message` call, recorded for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupCall {
    pub false_positive_rate: f64,
    pub num_client_elements: usize,
    pub num_items: usize,
    pub structure: SetupStructure,
}

#[derive(Default)]
struct MockState {
    fail_client_create: bool,
    fail_server_create: bool,
    fail_create_request: bool,
    fail_process_request: bool,
    fail_setup: bool,
    fail_intersection: bool,
    scripted_intersection: Vec<u64>,
    setup_calls: Vec<SetupCall>,
    created_clients: usize,
    released_clients: usize,
    created_servers: usize,
    released_servers: usize,
}

/// Mock engine. Clones share state.
#[derive(Clone, Default)]
pub struct MockPsiEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockPsiEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_client_create(&self) {
        self.state.lock().unwrap().fail_client_create = true;
    }

    pub fn fail_server_create(&self) {
        self.state.lock().unwrap().fail_server_create = true;
    }

    pub fn fail_create_request(&self) {
        self.state.lock().unwrap().fail_create_request = true;
    }

    pub fn fail_process_request(&self) {
        self.state.lock().unwrap().fail_process_request = true;
    }

    pub fn fail_setup(&self) {
        self.state.lock().unwrap().fail_setup = true;
    }

    pub fn fail_intersection(&self) {
        self.state.lock().unwrap().fail_intersection = true;
    }

    /// Script the indices the next intersection computations return.
    /// Deliberately NOT sorted by the mock; callers own ordering.
    pub fn set_intersection(&self, indices: Vec<u64>) {
        self.state.lock().unwrap().scripted_intersection = indices;
    }

    /// Recorded `create_setup_message` invocations.
    pub fn setup_calls(&self) -> Vec<SetupCall> {
        self.state.lock().unwrap().setup_calls.clone()
    }

    pub fn created_clients(&self) -> usize {
        self.state.lock().unwrap().created_clients
    }

    pub fn released_clients(&self) -> usize {
        self.state.lock().unwrap().released_clients
    }

    pub fn created_servers(&self) -> usize {
        self.state.lock().unwrap().created_servers
    }

    pub fn released_servers(&self) -> usize {
        self.state.lock().unwrap().released_servers
    }
}

impl PsiEngine for MockPsiEngine {
    type Client = MockClient;
    type Server = MockServer;

    fn client_from_key(
        &self,
        key: &[u8; KEY_LEN],
        reveal_intersection: bool,
    ) -> EngineResult<Self::Client> {
        let mut state = self.state.lock().unwrap();
        if state.fail_client_create {
            return Err(EngineError::Internal("injected client create failure".to_string()));
        }
        state.created_clients += 1;

        Ok(MockClient {
            key: *key,
            reveal_intersection,
            state: Arc::clone(&self.state),
        })
    }

    fn server_from_key(
        &self,
        key: &[u8; KEY_LEN],
        _reveal_intersection: bool,
    ) -> EngineResult<Self::Server> {
        let mut state = self.state.lock().unwrap();
        if state.fail_server_create {
            return Err(EngineError::Internal("injected server create failure".to_string()));
        }
        state.created_servers += 1;

        Ok(MockServer {
            _key: *key,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockClient {
    key: [u8; KEY_LEN],
    reveal_intersection: bool,
    state: Arc<Mutex<MockState>>,
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.state.lock().unwrap().released_clients += 1;
    }
}

impl PsiClient for MockClient {
    fn create_request(&self, items: &[String]) -> EngineResult<Request> {
        if self.state.lock().unwrap().fail_create_request {
            return Err(EngineError::Internal("injected encryption failure".to_string()));
        }
        Ok(Request {
            reveal_intersection: self.reveal_intersection,
            encrypted_elements: items.iter().map(|item| item.as_bytes().to_vec()).collect(),
        })
    }

    fn private_key_bytes(&self) -> [u8; KEY_LEN] {
        self.key
    }

    fn intersection(&self, _setup: &ServerSetup, _response: &Response) -> EngineResult<Vec<u64>> {
        let state = self.state.lock().unwrap();
        if state.fail_intersection {
            return Err(EngineError::Internal("injected intersection failure".to_string()));
        }
        Ok(state.scripted_intersection.clone())
    }
}

pub struct MockServer {
    _key: [u8; KEY_LEN],
    state: Arc<Mutex<MockState>>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.state.lock().unwrap().released_servers += 1;
    }
}

impl PsiServer for MockServer {
    fn process_request(&self, request: &Request) -> EngineResult<Response> {
        if self.state.lock().unwrap().fail_process_request {
            return Err(EngineError::Internal("injected processing failure".to_string()));
        }
        Ok(Response {
            encrypted_elements: request.encrypted_elements.clone(),
        })
    }

    fn create_setup_message(
        &self,
        false_positive_rate: f64,
        num_client_elements: usize,
        items: &[String],
        structure: SetupStructure,
    ) -> EngineResult<ServerSetup> {
        let mut state = self.state.lock().unwrap();
        state.setup_calls.push(SetupCall {
            false_positive_rate,
            num_client_elements,
            num_items: items.len(),
            structure,
        });
        if state.fail_setup {
            return Err(EngineError::Internal("injected setup failure".to_string()));
        }

        let mut element_hashes: Vec<u64> = items
            .iter()
            .map(|item| element_hash64(item.as_bytes()))
            .collect();
        element_hashes.sort_unstable();
        element_hashes.dedup();
        Ok(ServerSetup::Raw(RawSetup { element_hashes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_counted_on_drop() {
        let engine = MockPsiEngine::new();
        {
            let _client = engine.client_from_key(&[1u8; 32], true).unwrap();
            let _server = engine.server_from_key(&[2u8; 32], true).unwrap();
            assert_eq!(engine.released_clients(), 0);
            assert_eq!(engine.released_servers(), 0);
        }
        assert_eq!(engine.released_clients(), 1);
        assert_eq!(engine.released_servers(), 1);
    }

    #[test]
    fn test_failed_creation_creates_nothing() {
        let engine = MockPsiEngine::new();
        engine.fail_client_create();

        assert!(engine.client_from_key(&[1u8; 32], true).is_err());
        assert_eq!(engine.created_clients(), 0);
        assert_eq!(engine.released_clients(), 0);
    }

    #[test]
    fn test_setup_call_recorded() {
        let engine = MockPsiEngine::new();
        let server = engine.server_from_key(&[2u8; 32], true).unwrap();

        server
            .create_setup_message(0.001, 7, &["a".to_string()], SetupStructure::Gcs)
            .unwrap();

        let calls = engine.setup_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].num_client_elements, 7);
        assert_eq!(calls[0].num_items, 1);
    }

    #[test]
    fn test_scripted_intersection_returned_as_is() {
        let engine = MockPsiEngine::new();
        engine.set_intersection(vec![4, 1, 3]);
        let client = engine.client_from_key(&[1u8; 32], true).unwrap();

        let setup = ServerSetup::Raw(RawSetup {
            element_hashes: vec![],
        });
        let response = Response {
            encrypted_elements: vec![],
        };
        assert_eq!(client.intersection(&setup, &response).unwrap(), vec![4, 1, 3]);
    }
}
