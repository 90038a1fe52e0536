//! Native PSI engine over the Ristretto group.
//!
//! Commutative blinding: the client maps each item to a curve point and
//! multiplies by its scalar `a`; the server multiplies by `b`. The client
//! strips its own layer with `a^-1`, leaving `b·H(item)`, and tests that
//! against the server setup structure built from `b·H(y)` for the server's
//! items. Neither side ever sees the other's plaintext elements.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use sha2::Sha512;
use zeroize::ZeroizeOnDrop;

use super::{
    element_hash64, EngineError, EngineResult, GolombCodedSet, PsiClient, PsiEngine, PsiServer,
    RawSetup, Request, Response, ServerSetup, SetupStructure, KEY_LEN,
};

/// Ristretto-based PSI engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcdhPsiEngine;

impl EcdhPsiEngine {
    pub fn new() -> Self {
        Self
    }
}

impl PsiEngine for EcdhPsiEngine {
    type Client = EcdhClient;
    type Server = EcdhServer;

    fn client_from_key(
        &self,
        key: &[u8; KEY_LEN],
        reveal_intersection: bool,
    ) -> EngineResult<Self::Client> {
        Ok(EcdhClient {
            key: scalar_from_key(key)?,
            reveal_intersection,
        })
    }

    fn server_from_key(
        &self,
        key: &[u8; KEY_LEN],
        reveal_intersection: bool,
    ) -> EngineResult<Self::Server> {
        Ok(EcdhServer {
            key: scalar_from_key(key)?,
            _reveal_intersection: reveal_intersection,
        })
    }
}

/// Client-role instance. Key scalar is zeroized on release.
#[derive(ZeroizeOnDrop)]
pub struct EcdhClient {
    key: Scalar,
    #[zeroize(skip)]
    reveal_intersection: bool,
}

/// Server-role instance. Key scalar is zeroized on release.
#[derive(ZeroizeOnDrop)]
pub struct EcdhServer {
    key: Scalar,
    #[zeroize(skip)]
    _reveal_intersection: bool,
}

impl PsiClient for EcdhClient {
    fn create_request(&self, items: &[String]) -> EngineResult<Request> {
        let encrypted_elements = items
            .iter()
            .map(|item| {
                let blinded = hash_to_point(item) * self.key;
                blinded.compress().to_bytes().to_vec()
            })
            .collect();

        Ok(Request {
            reveal_intersection: self.reveal_intersection,
            encrypted_elements,
        })
    }

    fn private_key_bytes(&self) -> [u8; KEY_LEN] {
        self.key.to_bytes()
    }

    fn intersection(&self, setup: &ServerSetup, response: &Response) -> EngineResult<Vec<u64>> {
        if !self.reveal_intersection {
            return Err(EngineError::Internal(
                "instance was not created with intersection revealing enabled".to_string(),
            ));
        }

        // Non-zero is checked at construction, so the inverse exists.
        let inverse = self.key.invert();
        let membership = setup.membership();

        let mut indices = Vec::new();
        for (index, element) in response.encrypted_elements.iter().enumerate() {
            let point = decompress_element(element)?;
            let unblinded = point * inverse;
            if membership.contains(element_hash64(unblinded.compress().as_bytes())) {
                indices.push(index as u64);
            }
        }
        Ok(indices)
    }
}

impl PsiServer for EcdhServer {
    fn process_request(&self, request: &Request) -> EngineResult<Response> {
        let encrypted_elements = request
            .encrypted_elements
            .iter()
            .map(|element| {
                let point = decompress_element(element)?;
                Ok((point * self.key).compress().to_bytes().to_vec())
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Response { encrypted_elements })
    }

    fn create_setup_message(
        &self,
        false_positive_rate: f64,
        num_client_elements: usize,
        items: &[String],
        structure: SetupStructure,
    ) -> EngineResult<ServerSetup> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(EngineError::Internal(format!(
                "false positive rate {} outside (0, 1)",
                false_positive_rate
            )));
        }

        // Corrected per-probe rate: the client makes num_client_elements
        // membership probes, so the whole-query rate stays at the target.
        let corrected_rate = false_positive_rate / num_client_elements.max(1) as f64;

        let element_hashes: Vec<u64> = items
            .iter()
            .map(|item| {
                let blinded = hash_to_point(item) * self.key;
                element_hash64(blinded.compress().as_bytes())
            })
            .collect();

        match structure {
            SetupStructure::Gcs => Ok(ServerSetup::Gcs(GolombCodedSet::build(
                &element_hashes,
                corrected_rate,
            ))),
            SetupStructure::Raw => {
                let mut hashes = element_hashes;
                hashes.sort_unstable();
                hashes.dedup();
                Ok(ServerSetup::Raw(RawSetup {
                    element_hashes: hashes,
                }))
            }
        }
    }
}

fn scalar_from_key(key: &[u8; KEY_LEN]) -> EngineResult<Scalar> {
    let scalar = Scalar::from_bytes_mod_order(*key);
    if scalar == Scalar::ZERO {
        return Err(EngineError::InvalidKey(
            "key reduces to the zero scalar".to_string(),
        ));
    }
    Ok(scalar)
}

fn hash_to_point(item: &str) -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Sha512>(item.as_bytes())
}

fn decompress_element(bytes: &[u8]) -> EngineResult<RistrettoPoint> {
    CompressedRistretto::from_slice(bytes)
        .map_err(|_| EngineError::MalformedMessage("encrypted element is not 32 bytes".to_string()))?
        .decompress()
        .ok_or_else(|| {
            EngineError::MalformedMessage("encrypted element is not a valid group element".to_string())
        })
}
