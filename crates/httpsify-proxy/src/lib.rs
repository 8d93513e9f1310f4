//! Httpsify Proxy - HTTP forward proxy that upgrades traffic to HTTPS.
//!
//! Wraps the [`httpsify_core`] engine in a hudsucker proxy server so that
//! clients pointed at it get HTTPS wherever a ruleset covers the site.
//!
//! ## Features
//!
//! - Upgrades request URLs by forwarding or by `302` redirect
//! - Rewrites `http` links in textual response bodies
//! - Marks approved cookies `Secure`
//! - Optionally intercepts CONNECT tunnels with a local root CA
//!
//! ## Architecture
//!
//! ```text
//! Client ─► Proxy ─► RewriteHandler::handle_request ─► upgrade URL?
//!                                                          │
//!                         ┌────────────────────────────────┴──────┐
//!                         │ Forward                               │ Redirect
//!                         ▼                                       ▼
//!                   Upstream fetch                           302 response
//!                         │
//!                         ▼
//!         RewriteHandler::handle_response ─► secure cookies ─► rewrite body
//! ```

mod ca;
mod error;
mod handler;
mod proxy;

pub use ca::{CaManager, CaManagerError};
pub use error::{ProxyError, Result};
pub use handler::{
    is_rewritable, parse_set_cookie, redirect_response, secure_set_cookie, HandlerConfig,
    RewriteHandler, SetCookie,
};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer, UpgradeMode};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 5641;
