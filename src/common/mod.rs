//! Core types shared by every layer

pub mod address;
pub mod buffer;
pub mod copy;
pub mod link;
pub mod metadata;
pub mod stream;
pub mod task;
pub mod timer;

pub use address::{Address, Destination, Network};
pub use buffer::{Buffer, MultiBuffer, BUFFER_SIZE};
pub use copy::{copy, BufferedWriter, MultiBufferReader, MultiBufferWriter, SequentialWriter, StreamReader, StreamWriter};
pub use link::{link_pair, Link, LinkReader, LinkWriter};
pub use metadata::{Metadata, SessionContext};
pub use stream::{Counter, CounterStream, IntoStream, PacketConn, Stream};
pub use timer::{cancel_after_inactivity, ActivityTimer};
