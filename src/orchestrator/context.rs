use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::aggregator::ConnectorConfig;
use super::events::Event;
use super::progress::ProgressEntry;
use crate::config::EndpointSettings;
use crate::types::{CaChain, ClientEnrollment, JwsEntry, ServerCertificates, SignedHubCert};
use crate::workflows::WorkflowName;

/// Public half of this DFSP's JWS key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwsPublicKey {
    pub public_key: String,
    pub created_at: i64,
}

/// State shared by every region. Only the event loop mutates it.
///
/// Artifact fields are either absent or hold the last value obtained successfully; none of
/// them holds a private key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorContext {
    pub pending_states: BTreeMap<WorkflowName, bool>,
    pub progress_monitor: BTreeMap<WorkflowName, ProgressEntry>,
    #[serde(default)]
    pub onboarding_complete: bool,
    #[serde(default)]
    pub hub_ca: Option<CaChain>,
    #[serde(default)]
    pub dfsp_ca: Option<CaChain>,
    #[serde(default)]
    pub dfsp_client_cert: Option<ClientEnrollment>,
    #[serde(default)]
    pub dfsp_server_cert: Option<ServerCertificates>,
    #[serde(default)]
    pub hub_client_certs: Option<Vec<SignedHubCert>>,
    #[serde(default)]
    pub peer_jws: Option<BTreeMap<String, JwsEntry>>,
    #[serde(default)]
    pub dfsp_jws: Option<JwsPublicKey>,
    #[serde(default)]
    pub endpoints: Option<EndpointSettings>,
    #[serde(default)]
    pub connector_config: ConnectorConfig,
    /// Bumped on every configuration push.
    #[serde(default)]
    pub config_revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Artifact {
    HubCa(CaChain),
    DfspCa(CaChain),
    DfspClientCert(ClientEnrollment),
    DfspServerCert(ServerCertificates),
    HubClientCerts(Vec<SignedHubCert>),
    PeerJws(BTreeMap<String, JwsEntry>),
    DfspJws(JwsPublicKey),
    Endpoints(EndpointSettings),
}

/// Stores artifacts produced by the regions.
pub fn reduce(ctx: &mut OrchestratorContext, event: &Event) {
    let Event::StoreArtifact { artifact } = event else {
        return;
    };
    match artifact.clone() {
        Artifact::HubCa(ca) => ctx.hub_ca = Some(ca),
        Artifact::DfspCa(ca) => ctx.dfsp_ca = Some(ca),
        Artifact::DfspClientCert(enrollment) => ctx.dfsp_client_cert = Some(enrollment),
        Artifact::DfspServerCert(certificates) => ctx.dfsp_server_cert = Some(certificates),
        Artifact::HubClientCerts(signed) => ctx.hub_client_certs = Some(signed),
        Artifact::PeerJws(keys) => ctx.peer_jws = Some(keys),
        Artifact::DfspJws(key) => ctx.dfsp_jws = Some(key),
        Artifact::Endpoints(endpoints) => ctx.endpoints = Some(endpoints),
    }
}
