//! Where a client gets its entries from.

use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::Deserialize;
use std::time::Duration;

use beacon_types::{ChainHash, ChainInfo, Metadata, PublicRandResponse};

use crate::verify::{ClientError, ClientResult};

/// Unverified access to one chain.
#[async_trait]
pub trait BeaconSource: Send + Sync {
    /// Chain information along with the hash the server claims for it.
    async fn chain_info(&self) -> ClientResult<(ChainInfo, ChainHash)>;

    /// Entry at `round`, or the latest one for `None`.
    async fn randomness(&self, round: Option<u64>) -> ClientResult<PublicRandResponse>;
}

#[derive(Deserialize)]
struct ChainInfoReply {
    info: ChainInfo,
    hash: ChainHash,
}

/// A node's public JSON-RPC API.
pub struct HttpSource {
    client: HttpClient,
    metadata: Metadata,
}

impl HttpSource {
    /// `metadata` selects the chain, by beacon id or chain hash.
    pub fn new(url: &str, metadata: Metadata, timeout: Duration) -> ClientResult<Self> {
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(url)
            .map_err(|e| ClientError::Rpc(e.to_string()))?;
        Ok(Self { client, metadata })
    }

    fn params(&self) -> ClientResult<ArrayParams> {
        let mut params = ArrayParams::new();
        params
            .insert(&self.metadata)
            .map_err(|e| ClientError::Rpc(e.to_string()))?;
        Ok(params)
    }
}

#[async_trait]
impl BeaconSource for HttpSource {
    async fn chain_info(&self) -> ClientResult<(ChainInfo, ChainHash)> {
        let reply: ChainInfoReply = self
            .client
            .request("public_chainInfo", self.params()?)
            .await
            .map_err(|e| ClientError::Rpc(e.to_string()))?;
        Ok((reply.info, reply.hash))
    }

    async fn randomness(&self, round: Option<u64>) -> ClientResult<PublicRandResponse> {
        let mut params = self.params()?;
        params
            .insert(round)
            .map_err(|e| ClientError::Rpc(e.to_string()))?;
        self.client
            .request("public_randomness", params)
            .await
            .map_err(|e| ClientError::Rpc(e.to_string()))
    }
}
