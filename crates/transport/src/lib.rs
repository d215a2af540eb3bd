// Flowline Transport - JSON-RPC over a raw byte stream
// Framing, handler registry and the dispatch loop

pub mod error;
pub mod framer;
pub mod handler;
pub mod server;
pub mod types;

pub use error::{code, RpcError};
pub use framer::{framed, FrameDecoder, FramedReader, FramedWriter, MAX_FRAME_BYTES};
pub use handler::{HandlerRegistry, MethodHandler};
pub use server::{
    StopHandle, TransportManager, TransportState, HANDLER_DRAIN_TIMEOUT, WRITER_SHUTDOWN_TIMEOUT,
};
pub use types::{Message, MessageKind, Params};
