//! Server glue: the inbound interfaces the ACM core is consumed through.
//! `tls` is the TLS-terminating listener driving certificate resolution per
//! connection; `listener` is the plain-HTTP challenge listener; `handler`
//! is the narrow trait standing in for the out-of-scope router.

pub mod handler;
pub mod listener;
pub mod tls;

pub use handler::{Handler, NotFoundHandler};
pub use listener::PlainHttpServer;
pub use tls::TlsServer;
