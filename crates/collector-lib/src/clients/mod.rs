//! Shared I/O clients
//!
//! Every client sits behind a trait so tests can hand modules fakes. Modules
//! never construct clients directly: they ask their [`ClientSet`], which only
//! builds the kinds the module declared in [`Module::capabilities`].
//!
//! [`Module::capabilities`]: crate::module::Module::capabilities

pub mod exec;
pub mod http;
pub mod icmp;
pub mod pcf;
pub mod socket;
pub mod tls;

pub use exec::{CommandExecutor, ExecConfig, ExecError, ExecOutput, Executor};
pub use http::{HttpClient, HttpConfig, HttpRequest, HttpResponse, ReqwestClient};
pub use icmp::{IcmpProber, ProbeConfig, ProbeStats, Prober};
pub use pcf::{Attributes, PcfClient, PcfConfig, PcfObject, PcfValue, TcpPcfClient};
pub use socket::{LineClient, SocketConfig, StreamLineClient, Terminator};
pub use tls::TlsConfig;

use crate::error::{CollectorError, Result};
use crate::module::Capabilities;
use std::fmt;
use std::sync::Arc;

/// Builds clients. The provided methods build the real implementations;
/// test factories override the ones they fake.
pub trait ClientFactory: Send + Sync {
    fn http(&self, config: HttpConfig) -> Result<Arc<dyn HttpClient>> {
        Ok(Arc::new(ReqwestClient::new(config)?))
    }

    fn exec(&self, config: ExecConfig) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(CommandExecutor::new(config)?))
    }

    fn line_socket(&self, config: SocketConfig) -> Result<Arc<dyn LineClient>> {
        Ok(Arc::new(StreamLineClient::new(config)?))
    }

    fn prober(&self, config: ProbeConfig) -> Result<Arc<dyn Prober>> {
        Ok(Arc::new(IcmpProber::new(config)?))
    }

    fn pcf(&self, config: PcfConfig) -> Result<Arc<dyn PcfClient>> {
        Ok(Arc::new(TcpPcfClient::new(config)?))
    }
}

/// Factory for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClients;

impl ClientFactory for DefaultClients {}

/// Client factory scoped to one module instance
#[derive(Clone)]
pub struct ClientSet {
    factory: Arc<dyn ClientFactory>,
    allowed: Capabilities,
    module: String,
}

impl ClientSet {
    pub fn new(factory: Arc<dyn ClientFactory>, allowed: Capabilities, module: impl Into<String>) -> Self {
        Self {
            factory,
            allowed,
            module: module.into(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.allowed
    }

    fn require(&self, capability: Capabilities, kind: &str) -> Result<()> {
        if self.allowed.contains(capability) {
            Ok(())
        } else {
            Err(CollectorError::config(format!(
                "module '{}' did not declare the {kind} capability",
                self.module
            )))
        }
    }

    pub fn http(&self, config: HttpConfig) -> Result<Arc<dyn HttpClient>> {
        self.require(Capabilities::HTTP, "http")?;
        self.factory.http(config)
    }

    pub fn exec(&self, config: ExecConfig) -> Result<Arc<dyn Executor>> {
        self.require(Capabilities::EXEC, "exec")?;
        self.factory.exec(config)
    }

    pub fn line_socket(&self, config: SocketConfig) -> Result<Arc<dyn LineClient>> {
        self.require(Capabilities::SOCKET, "socket")?;
        self.factory.line_socket(config)
    }

    pub fn prober(&self, config: ProbeConfig) -> Result<Arc<dyn Prober>> {
        self.require(Capabilities::ICMP, "icmp")?;
        self.factory.prober(config)
    }

    pub fn pcf(&self, config: PcfConfig) -> Result<Arc<dyn PcfClient>> {
        self.require(Capabilities::PCF, "pcf")?;
        self.factory.pcf(config)
    }
}

impl fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSet")
            .field("module", &self.module)
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}
