use async_trait::async_trait;

/// Country and ASN for a source IP, as far as the provider knows.
pub struct IpInfo {
    pub country: String,
    pub asn: String,
}

impl IpInfo {
    pub fn unknown() -> Self {
        Self {
            country: "N/A".to_string(),
            asn: "N/A".to_string(),
        }
    }
}

/// Seam for the external IP-intelligence service. The core only
/// consumes the answer; lookups feed the custom-rules variables and
/// the fingerprint debug path.
#[async_trait]
pub trait IpInfoProvider: Send + Sync {
    async fn lookup(&self, ip: &str) -> IpInfo;
}

/// Default provider: answers "N/A" without leaving the process.
pub struct NoopIpInfo;

#[async_trait]
impl IpInfoProvider for NoopIpInfo {
    async fn lookup(&self, _ip: &str) -> IpInfo {
        IpInfo::unknown()
    }
}
