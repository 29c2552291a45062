mod client;
mod handler;
mod methods;
mod progress;
mod session;
mod transport;
mod types;
mod unhandled;
mod ws;

pub use client::{ClientMetrics, ClientStatus, ConnectOptions, LanguageClient};
pub use handler::ClientHandler;
pub use progress::{ProgressEvent, ProgressSnapshot, ProgressTracker};
pub use session::adapter::SessionAdapter;
pub use session::client::SessionClient;
pub use session::daemon::{SessionManager, SessionManagerOptions};
pub use session::indexing::{IndexingState, IndexingStatus, IndexingTracker};
pub use transport::{FramedTransport, RpcError, ServerHandler};
pub use types::{
    CallHierarchyIncomingCall, CallHierarchyItem, CallHierarchyOutgoingCall, Diagnostic,
    DocumentSymbol, Location, LocationOrLink, LocationLink, Position, Range, SymbolInformation,
    symbol_kind_name,
};
