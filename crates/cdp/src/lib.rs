//! Chrome DevTools Protocol driver for the slotwatch engine.
//!
//! [`CdpFactory`] launches a local Chrome/Chromium per session with a throwaway
//! profile, attaches to its page target over the DevTools websocket and
//! exposes it as a [`slotwatch::PortalSession`]. A [`SiteProfile`] supplies
//! the portal URLs, selectors and page phrases, so nothing here is tied to
//! one site's markup.
//!
//! JSON XHR/fetch responses are captured from `Network.*` events and forwarded
//! to the engine in arrival order. Proxy authentication goes through the
//! `Fetch` domain with the identity's rotated username.

pub mod capture;
pub mod connection;
pub mod error;
pub mod factory;
pub mod finder;
pub mod launcher;
pub mod page;
pub mod probe;
pub mod profile;
pub mod script;

pub use connection::{CdpConnection, CdpEvent};
pub use error::{CdpError, Result};
pub use factory::CdpFactory;
pub use launcher::{BrowserProcess, LaunchOptions};
pub use page::{CdpSession, ProxyAuth};
pub use profile::SiteProfile;
