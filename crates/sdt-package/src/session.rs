use sdt_core::config::SdtConfig;
use sdt_core::portal::PortalApi;
use sdt_crypto::CryptoBackend;

/// Everything a workflow reads: a config snapshot, the crypto backend and
/// the optional portal client. Built once at the process boundary.
#[derive(Clone, Copy)]
pub struct Session<'a> {
    pub config: &'a SdtConfig,
    pub crypto: &'a dyn CryptoBackend,
    pub portal: Option<&'a dyn PortalApi>,
}

impl<'a> Session<'a> {
    pub fn new(config: &'a SdtConfig, crypto: &'a dyn CryptoBackend) -> Self {
        Self {
            config,
            crypto,
            portal: None,
        }
    }

    pub fn with_portal(mut self, portal: &'a dyn PortalApi) -> Self {
        self.portal = Some(portal);
        self
    }
}
