//! Gateway server: sessions, method dispatch, and the HTTP and stdio
//! front ends

pub mod dispatch;
mod router;
mod server;
pub mod session;
mod stdio;

pub use dispatch::{CallContext, Catalog, Dispatcher};
pub use router::{AppState, create_router};
pub use server::{Gateway, shutdown_signal};
pub use session::{HandshakeState, Outbound, Session, SessionManager};
pub use stdio::serve_stdio;
