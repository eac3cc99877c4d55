//! Core of a console mail client: message entities over local maildirs or a
//! remote IMAP proxy, MIME part trees, and reference-graph threading.
//!
//! Terminal rendering, scripting and the proxy process itself are external
//! collaborators; they reach this crate only through [`Hooks`], a [`Proxy`]
//! implementation and a read-only [`Config`].

pub mod config;
pub mod hooks;
pub mod mail;
pub mod proxy;

pub use config::Config;
pub use hooks::Hooks;
pub use proxy::{Proxy, UnixProxy};

use anyhow::Result;
use std::cell::RefCell;

/// Everything an operation may need from the host, passed explicitly
/// instead of living in process-wide globals.
///
/// The proxy handle sits behind a `RefCell`: the channel supports exactly
/// one in-flight request, and borrowing mutably per call enforces that.
pub struct Context {
    pub config: Config,
    pub hooks: Hooks,
    proxy: RefCell<Box<dyn Proxy>>,
}

impl Context {
    /// Build a context that talks to the proxy socket named in the config.
    pub fn new(config: Config) -> Self {
        let proxy = UnixProxy::new(config.proxy_socket.clone());
        Self::with_proxy(config, Box::new(proxy))
    }

    /// Build a context around an explicit proxy implementation.
    pub fn with_proxy(config: Config, proxy: Box<dyn Proxy>) -> Self {
        Self {
            config,
            hooks: Hooks::new(),
            proxy: RefCell::new(proxy),
        }
    }

    /// Send one command over the proxy channel and block for the reply.
    pub fn proxy_send(&self, line: &str) -> Result<String> {
        self.proxy.borrow_mut().send(line)
    }
}
