//! Outbound integrations
//!
//! - [`client`]: the resilient remote CRM client (auth, retry, call log)
//! - [`crm`]: typed remote CRM endpoints
//! - [`dms`]: the DMS adapter used by the bridge
//! - [`transport`]: the HTTP seam, with [`scripted`] as its in-memory double

pub mod client;
pub mod crm;
pub mod dms;
pub mod retry;
pub mod scripted;
pub mod transport;

pub use client::ApiClient;
pub use crm::{
    ContactLookup, ContactPayload, CrmApi, EventPayload, MessageKind, RemoteContact, RemoteEvent,
};
pub use dms::{DmsAdapter, HttpDmsAdapter};
pub use retry::{with_retry, RetryConfig, RetryDecision, RetryableError};
pub use scripted::ScriptedTransport;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport, TransportError};
