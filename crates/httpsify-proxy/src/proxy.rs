//! Forward proxy server.
//!
//! Listens for plain HTTP proxy requests and, when enabled, intercepts
//! CONNECT tunnels. Every request goes through [`RewriteHandler`].

use std::net::SocketAddr;
use std::path::PathBuf;

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use httpsify_core::HttpsRewriter;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::{HandlerConfig, RewriteHandler};
use crate::DEFAULT_PROXY_PORT;

/// How a request whose URL can be upgraded is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeMode {
    /// Fetch the upgraded URL on the client's behalf.
    #[default]
    Forward,
    /// Answer `302 Found` pointing at the upgraded URL.
    Redirect,
}

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Rewrite `http` links inside response bodies.
    pub rewrite_pages: bool,
    /// Rewrite non-`text/*` bodies too.
    pub aggressive: bool,
    /// What to do with upgradable request URLs.
    pub upgrade_mode: UpgradeMode,
    /// Secure approved cookies.
    pub secure_cookies: bool,
    /// Decrypt CONNECT tunnels with the local CA.
    pub intercept_https: bool,
    /// CA storage; the default data directory is used if unset.
    pub ca_manager: Option<CaManager>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            rewrite_pages: true,
            aggressive: false,
            upgrade_mode: UpgradeMode::Forward,
            secure_cookies: true,
            intercept_https: false,
            ca_manager: None,
        }
    }
}

impl ProxyConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Enables or disables body rewriting.
    pub fn with_rewrite_pages(mut self, rewrite_pages: bool) -> Self {
        self.rewrite_pages = rewrite_pages;
        self
    }

    /// Enables or disables rewriting of non-text bodies.
    pub fn with_aggressive(mut self, aggressive: bool) -> Self {
        self.aggressive = aggressive;
        self
    }

    /// Sets the upgrade mode.
    pub fn with_upgrade_mode(mut self, upgrade_mode: UpgradeMode) -> Self {
        self.upgrade_mode = upgrade_mode;
        self
    }

    /// Enables or disables cookie securing.
    pub fn with_secure_cookies(mut self, secure_cookies: bool) -> Self {
        self.secure_cookies = secure_cookies;
        self
    }

    /// Enables or disables HTTPS interception.
    pub fn with_intercept_https(mut self, intercept_https: bool) -> Self {
        self.intercept_https = intercept_https;
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = Some(ca_manager);
        self
    }

    /// Settings handed to each request handler.
    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            rewrite_pages: self.rewrite_pages,
            aggressive: self.aggressive,
            upgrade_mode: self.upgrade_mode,
            secure_cookies: self.secure_cookies,
            intercept_https: self.intercept_https,
        }
    }
}

/// HTTPS upgrading forward proxy.
#[derive(Debug)]
pub struct ProxyServer {
    config: ProxyConfig,
    rewriter: HttpsRewriter,
    ca_manager: Option<CaManager>,
}

impl ProxyServer {
    /// Creates a proxy server.
    ///
    /// With interception on, the CA is generated now if it does not exist.
    pub fn new(config: ProxyConfig, rewriter: HttpsRewriter) -> Result<Self> {
        let ca_manager = if config.intercept_https {
            let manager = match &config.ca_manager {
                Some(manager) => manager.clone(),
                None => CaManager::with_default_dir()?,
            };
            manager.ensure_ca()?;
            Some(manager)
        } else {
            None
        };

        Ok(Self {
            config,
            rewriter,
            ca_manager,
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> Option<PathBuf> {
        self.ca_manager.as_ref().map(CaManager::cert_path)
    }

    /// The shared rewriting engine.
    pub fn rewriter(&self) -> &HttpsRewriter {
        &self.rewriter
    }

    fn authority(&self) -> Result<RcgenAuthority> {
        let authority = match &self.ca_manager {
            Some(manager) => manager.ensure_ca()?,
            None => CaManager::ephemeral_authority()?,
        };
        Ok(authority)
    }

    /// Starts the proxy server.
    ///
    /// This will block until the server is shut down.
    pub async fn run(self) -> Result<()> {
        let authority = self.authority()?;
        let handler = RewriteHandler::new(self.rewriter.clone(), self.config.handler_config());

        tracing::info!("Starting HTTPS upgrading proxy on {}", self.config.addr);
        if let Some(path) = self.ca_cert_path() {
            tracing::info!("CA certificate: {:?}", path);
        }

        let proxy = Proxy::builder()
            .with_addr(self.config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let addr = self.config.addr;

        // Load CA authority before spawning
        let authority = self.authority()?;
        let handler = RewriteHandler::new(self.rewriter.clone(), self.config.handler_config());

        tracing::info!("Starting HTTPS upgrading proxy on {}", addr);

        let handle = tokio::spawn(async move {
            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Failed to build proxy: {}", e);
                    return;
                }
            };

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
