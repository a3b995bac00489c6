use serde::{Deserialize, Serialize};

/// Public half of a CA: root certificate plus optional intermediate chain, all PEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaChain {
    pub root_certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_chain: Option<String>,
}

impl CaChain {
    /// Trust bundle handed to TLS peers: intermediates first, root last.
    #[must_use]
    pub fn bundle(&self) -> String {
        match self.intermediate_chain.as_deref().map(str::trim) {
            Some(chain) if !chain.is_empty() => format!("{chain}\n{}", self.root_certificate),
            _ => self.root_certificate.clone(),
        }
    }
}

/// The hub's record of this DFSP's outbound (client) enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnrollment {
    pub id: u64,
    pub csr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCertificates {
    pub root_certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_chain: Option<String>,
    pub server_certificate: String,
}

impl ServerCertificates {
    #[must_use]
    pub fn ca_bundle(&self) -> String {
        CaChain {
            root_certificate: self.root_certificate.clone(),
            intermediate_chain: self.intermediate_chain.clone(),
        }
        .bundle()
    }
}

/// Server certificate together with the private key it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCertBundle {
    #[serde(flatten)]
    pub certificates: ServerCertificates,
    pub private_key: String,
}

/// A hub-side client certificate request addressed to this DFSP's CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubCertRequest {
    pub id: u64,
    pub csr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedHubCert {
    pub id: u64,
    pub certificate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwsEntry {
    pub dfsp_id: String,
    pub public_key: String,
    pub created_at: i64,
}

impl JwsEntry {
    /// Whether this entry should replace `existing`; ties keep the stored value.
    #[must_use]
    pub fn supersedes(&self, existing: Option<&JwsEntry>) -> bool {
        existing.is_none_or(|current| self.created_at > current.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwsKeyPair {
    pub public_key: String,
    pub private_key: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrBundle {
    pub csr: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointKind {
    Url,
    Ip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDeclaration {
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: EndpointKind,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: u64,
    #[serde(flatten)]
    pub declaration: EndpointDeclaration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(created_at: i64) -> JwsEntry {
        JwsEntry {
            dfsp_id: "f1".to_string(),
            public_key: format!("K{created_at}"),
            created_at,
        }
    }

    #[test]
    fn test_ca_bundle_puts_intermediate_first() {
        let chain = CaChain {
            root_certificate: "ROOT".to_string(),
            intermediate_chain: Some("INT".to_string()),
        };
        assert_eq!(chain.bundle(), "INT\nROOT");
    }

    #[test]
    fn test_ca_bundle_without_intermediate_is_root() {
        let chain = CaChain {
            root_certificate: "R1".to_string(),
            intermediate_chain: Some("  ".to_string()),
        };
        assert_eq!(chain.bundle(), "R1");
    }

    #[test]
    fn test_jws_entry_requires_strictly_newer_timestamp() {
        let stored = entry(100);
        assert!(!entry(99).supersedes(Some(&stored)));
        assert!(!entry(100).supersedes(Some(&stored)));
        assert!(entry(101).supersedes(Some(&stored)));
        assert!(entry(1).supersedes(None));
    }

    #[test]
    fn test_endpoint_record_wire_shape() {
        let record: EndpointRecord = serde_json::from_value(serde_json::json!({
            "id": 7,
            "direction": "INGRESS",
            "type": "URL",
            "value": { "url": "https://dfsp.example" }
        }))
        .unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.declaration.direction, Direction::Ingress);
        assert_eq!(record.declaration.kind, EndpointKind::Url);
    }
}
