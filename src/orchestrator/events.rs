use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::aggregator::ConnectorConfig;
use super::context::Artifact;
use crate::config::{CertSubject, CsrParams, EndpointSettings};
use crate::types::{
    CaChain, ClientEnrollment, HubCertRequest, JwsEntry, JwsKeyPair, ServerCertBundle,
    ServerCertificates, SignedHubCert,
};
use crate::workflows::WorkflowName;

/// Everything that can happen to the orchestrator.
///
/// Triggers come from outside (administration API, connector reports), the rest are
/// produced by timers, finished collaborator calls and the regions themselves. Some
/// variants carry private keys: log them with [`Event::kind`] only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    CreateIntCa {
        subject: CertSubject,
    },
    CreateExtCa {
        root_certificate: String,
        #[serde(default)]
        intermediate_chain: Option<String>,
        private_key: String,
    },
    CreateJws,
    CreateDfspServerCert {
        #[serde(default)]
        csr: Option<CsrParams>,
    },
    UploadPeerJws {
        entries: Vec<JwsEntry>,
    },
    UpdateConnectorConfig {
        config: ConnectorConfig,
    },
    RequestConnectorConfig,

    Tick {
        workflow: WorkflowName,
    },
    RetryTask {
        task: String,
    },
    TaskFailed {
        task: String,
    },

    HubCaFetched {
        ca: Option<CaChain>,
    },
    DfspCaLoaded {
        ca: CaChain,
    },
    DfspCaUploaded {
        ca: CaChain,
    },
    DfspCaChanged,
    ClientEnrollmentFetched {
        enrollment: Option<ClientEnrollment>,
    },
    ClientCsrUploaded,
    DfspClientCertReady {
        enrollment: ClientEnrollment,
        private_key: String,
    },
    DfspServerCertIssued {
        bundle: ServerCertBundle,
    },
    DfspServerCertUploaded {
        certificates: ServerCertificates,
    },
    DfspServerCertConfigured,
    HubCsrsFetched {
        requests: Vec<HubCertRequest>,
    },
    HubCsrsSigned {
        signed: Vec<SignedHubCert>,
    },
    PeerJwsFetched {
        entries: Vec<JwsEntry>,
    },
    PeerJwsUploaded {
        entries: Vec<JwsEntry>,
    },
    PeerJwsChanged {
        keys: BTreeMap<String, JwsEntry>,
    },
    DfspJwsCreated {
        key: JwsKeyPair,
    },
    EndpointsUploaded {
        endpoints: EndpointSettings,
    },

    StoreArtifact {
        artifact: Artifact,
    },
    WorkflowCompleted {
        workflow: WorkflowName,
    },
}

impl Event {
    /// Wire name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::CreateIntCa { .. } => "CREATE_INT_CA",
            Event::CreateExtCa { .. } => "CREATE_EXT_CA",
            Event::CreateJws => "CREATE_JWS",
            Event::CreateDfspServerCert { .. } => "CREATE_DFSP_SERVER_CERT",
            Event::UploadPeerJws { .. } => "UPLOAD_PEER_JWS",
            Event::UpdateConnectorConfig { .. } => "UPDATE_CONNECTOR_CONFIG",
            Event::RequestConnectorConfig => "REQUEST_CONNECTOR_CONFIG",
            Event::Tick { .. } => "TICK",
            Event::RetryTask { .. } => "RETRY_TASK",
            Event::TaskFailed { .. } => "TASK_FAILED",
            Event::HubCaFetched { .. } => "HUB_CA_FETCHED",
            Event::DfspCaLoaded { .. } => "DFSP_CA_LOADED",
            Event::DfspCaUploaded { .. } => "DFSP_CA_UPLOADED",
            Event::DfspCaChanged => "DFSP_CA_CHANGED",
            Event::ClientEnrollmentFetched { .. } => "CLIENT_ENROLLMENT_FETCHED",
            Event::ClientCsrUploaded => "CLIENT_CSR_UPLOADED",
            Event::DfspClientCertReady { .. } => "DFSP_CLIENT_CERT_READY",
            Event::DfspServerCertIssued { .. } => "DFSP_SERVER_CERT_ISSUED",
            Event::DfspServerCertUploaded { .. } => "DFSP_SERVER_CERT_UPLOADED",
            Event::DfspServerCertConfigured => "DFSP_SERVER_CERT_CONFIGURED",
            Event::HubCsrsFetched { .. } => "HUB_CSRS_FETCHED",
            Event::HubCsrsSigned { .. } => "HUB_CSRS_SIGNED",
            Event::PeerJwsFetched { .. } => "PEER_JWS_FETCHED",
            Event::PeerJwsUploaded { .. } => "PEER_JWS_UPLOADED",
            Event::PeerJwsChanged { .. } => "PEER_JWS_CHANGED",
            Event::DfspJwsCreated { .. } => "DFSP_JWS_CREATED",
            Event::EndpointsUploaded { .. } => "ENDPOINTS_UPLOADED",
            Event::StoreArtifact { .. } => "STORE_ARTIFACT",
            Event::WorkflowCompleted { .. } => "WORKFLOW_COMPLETED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_wire_shape() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "type": "CREATE_EXT_CA",
            "rootCertificate": "ROOT",
            "privateKey": "KEY"
        }))
        .unwrap();

        assert_eq!(
            event,
            Event::CreateExtCa {
                root_certificate: "ROOT".to_string(),
                intermediate_chain: None,
                private_key: "KEY".to_string(),
            }
        );
        assert_eq!(event.kind(), "CREATE_EXT_CA");
    }

    #[test]
    fn test_kind_matches_serialized_tag() {
        let events = [
            Event::CreateJws,
            Event::Tick {
                workflow: WorkflowName::PeerJwsPull,
            },
            Event::RetryTask {
                task: "hubCa".to_string(),
            },
            Event::DfspServerCertConfigured,
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }
}
